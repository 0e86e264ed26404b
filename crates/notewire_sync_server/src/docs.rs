use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use notewire_core::crdt::op::{decode_ops, encode_ops};
use notewire_core::{Document, DiffOp, Operation, ReplicaId, StateVector, diff};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::db::Store;
use crate::error::ServerError;

/// Replica ids with the high bit set belong to the server side; client
/// operations carrying one are rejected as forged.
const SERVER_REPLICA_BIT: u32 = 0x8000_0000;

#[derive(Debug, Clone, Copy)]
pub struct DocConfig {
    pub save_debounce: Duration,
    pub save_retry_backoff: Duration,
    pub compaction_threshold: u64,
}

/// Result of applying a batch of client operations.
#[derive(Debug)]
pub struct ApplyOutcome {
    /// Encoded operations that were newly applied and should be
    /// forwarded to peers. Empty when the whole batch was redelivery.
    pub forward: Vec<u8>,
    /// Set when application stopped on an invalid operation. The
    /// accepted prefix in `forward` is still valid; nothing after the
    /// rejected operation was touched.
    pub rejected: Option<String>,
}

/// Lifecycle events emitted by document actors.
#[derive(Debug, Clone)]
pub enum DocEvent {
    Saved {
        room_id: String,
        document_id: String,
        saved_at: i64,
    },
}

enum DocCommand {
    ApplyRemote {
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<ApplyOutcome, ServerError>>,
    },
    ApplySnapshot {
        full_text: String,
        reply: oneshot::Sender<Result<Vec<u8>, ServerError>>,
    },
    DiffSince {
        since: StateVector,
        reply: oneshot::Sender<Vec<u8>>,
    },
    Text {
        reply: oneshot::Sender<String>,
    },
    Flush {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Clone)]
struct DocHandle {
    tx: mpsc::UnboundedSender<DocCommand>,
    last_used: Arc<Mutex<Instant>>,
}

impl DocHandle {
    fn touch(&self) {
        *self.last_used.lock().unwrap() = Instant::now();
    }
}

/// Owns one actor per open document.
///
/// Every merge, diff, and save for a document runs on its actor task,
/// so document state needs no locking and saves can never interleave
/// with merges. Dropping a handle from the map closes the command
/// channel; the actor drains what is queued, flushes unsaved
/// operations, and exits.
pub struct DocManager {
    store: Arc<Store>,
    config: DocConfig,
    docs: DashMap<String, DocHandle>,
    events_tx: mpsc::UnboundedSender<DocEvent>,
}

impl DocManager {
    pub fn new(
        store: Arc<Store>,
        config: DocConfig,
        events_tx: mpsc::UnboundedSender<DocEvent>,
    ) -> Self {
        Self {
            store,
            config,
            docs: DashMap::new(),
            events_tx,
        }
    }

    fn handle(&self, room_id: &str, document_id: &str) -> DocHandle {
        let handle = self
            .docs
            .entry(document_id.to_string())
            .or_insert_with(|| self.spawn_actor(room_id, document_id))
            .clone();
        handle.touch();
        handle
    }

    fn spawn_actor(&self, room_id: &str, document_id: &str) -> DocHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = DocActor {
            store: Arc::clone(&self.store),
            config: self.config,
            events_tx: self.events_tx.clone(),
            room_id: room_id.to_string(),
            document_id: document_id.to_string(),
        };
        tokio::spawn(actor.run(rx));
        DocHandle {
            tx,
            last_used: Arc::new(Mutex::new(Instant::now())),
        }
    }

    async fn send<T>(
        &self,
        room_id: &str,
        document_id: &str,
        make: impl FnOnce(oneshot::Sender<T>) -> DocCommand,
    ) -> Result<T, ServerError> {
        let handle = self.handle(room_id, document_id);
        let (reply_tx, reply_rx) = oneshot::channel();
        handle
            .tx
            .send(make(reply_tx))
            .map_err(|_| ServerError::DocumentGone(document_id.to_string()))?;
        reply_rx
            .await
            .map_err(|_| ServerError::DocumentGone(document_id.to_string()))
    }

    /// Apply a batch of encoded client operations to a document.
    pub async fn apply_remote(
        &self,
        room_id: &str,
        document_id: &str,
        payload: Vec<u8>,
    ) -> Result<ApplyOutcome, ServerError> {
        self.send(room_id, document_id, |reply| DocCommand::ApplyRemote {
            payload,
            reply,
        })
        .await?
    }

    /// Merge a whole-text snapshot from a legacy client. Returns the
    /// encoded operations the snapshot produced, for forwarding.
    pub async fn apply_snapshot(
        &self,
        room_id: &str,
        document_id: &str,
        full_text: String,
    ) -> Result<Vec<u8>, ServerError> {
        self.send(room_id, document_id, |reply| DocCommand::ApplySnapshot {
            full_text,
            reply,
        })
        .await?
    }

    /// Encoded operations the holder of `since` is missing.
    pub async fn diff_since(
        &self,
        room_id: &str,
        document_id: &str,
        since: StateVector,
    ) -> Result<Vec<u8>, ServerError> {
        self.send(room_id, document_id, |reply| DocCommand::DiffSince {
            since,
            reply,
        })
        .await
    }

    /// Current visible text of a document.
    pub async fn text(&self, room_id: &str, document_id: &str) -> Result<String, ServerError> {
        self.send(room_id, document_id, |reply| DocCommand::Text { reply })
            .await
    }

    /// Force an immediate save, bypassing the debounce.
    pub async fn flush(&self, room_id: &str, document_id: &str) -> Result<(), ServerError> {
        self.send(room_id, document_id, |reply| DocCommand::Flush { reply })
            .await
    }

    pub fn open_docs(&self) -> usize {
        self.docs.len()
    }

    /// Flush every open document and stop its actor. Called once at
    /// shutdown, after the listener stops accepting connections.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.docs.iter().map(|e| e.key().clone()).collect();
        for document_id in ids {
            let Some((_, handle)) = self.docs.remove(&document_id) else {
                continue;
            };
            let (reply_tx, reply_rx) = oneshot::channel();
            if handle.tx.send(DocCommand::Flush { reply: reply_tx }).is_ok() {
                let _ = reply_rx.await;
            }
        }
        info!("document manager shut down");
    }

    /// Evict actors idle longer than `idle_timeout`. The actor keeps
    /// running until its queue drains, then flushes and exits, so no
    /// queued work or unsaved operations are lost.
    pub fn sweep_idle(&self, idle_timeout: Duration) {
        let now = Instant::now();
        let idle: Vec<String> = self
            .docs
            .iter()
            .filter(|entry| {
                now.duration_since(*entry.value().last_used.lock().unwrap()) >= idle_timeout
            })
            .map(|entry| entry.key().clone())
            .collect();

        for document_id in idle {
            if self.docs.remove(&document_id).is_some() {
                info!(document_id, "evicting idle document");
            }
        }
    }
}

/// Why a save is currently scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SaveState {
    Idle,
    Debouncing,
    /// First attempt failed; one retry is pending.
    Retrying,
}

struct DocActor {
    store: Arc<Store>,
    config: DocConfig,
    events_tx: mpsc::UnboundedSender<DocEvent>,
    room_id: String,
    document_id: String,
}

impl DocActor {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<DocCommand>) {
        let (mut doc, mut next_clock) = match self.load() {
            Ok(loaded) => loaded,
            Err(e) => {
                error!(document_id = %self.document_id, "failed to load document: {e}");
                // Drain and drop; replies error out via closed oneshot.
                rx.close();
                return;
            }
        };

        let mut unsaved: Vec<Operation> = Vec::new();
        let mut save_state = SaveState::Idle;
        let mut deadline = Instant::now();

        loop {
            let timer = tokio::time::sleep_until(deadline);
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => {
                        let edited = self.handle_command(cmd, &mut doc, &mut unsaved, &mut next_clock, &mut save_state, &mut deadline);
                        if edited && save_state == SaveState::Idle {
                            save_state = SaveState::Debouncing;
                            deadline = Instant::now() + self.config.save_debounce;
                        }
                    }
                    None => break,
                },
                _ = timer, if save_state != SaveState::Idle => {
                    self.save(&doc, &mut unsaved, &mut next_clock, &mut save_state, &mut deadline);
                }
            }
        }

        // Channel closed: flush whatever is left before exiting.
        if !unsaved.is_empty() {
            let mut state = SaveState::Retrying;
            self.save(&doc, &mut unsaved, &mut next_clock, &mut state, &mut deadline);
        }
        debug!(document_id = %self.document_id, "document actor stopped");
    }

    fn load(&self) -> Result<(Document, u64), ServerError> {
        let loaded = self.store.load_document(&self.document_id)?;
        let replica = ReplicaId(SERVER_REPLICA_BIT);
        let next_clock = loaded.next_clock;

        let doc = if loaded.snapshot.is_some() || !loaded.tail.is_empty() {
            Document::from_state(
                &self.document_id,
                replica,
                loaded.snapshot.as_deref(),
                loaded.tail,
            )?
        } else if let Some(text) = loaded.legacy_text {
            info!(document_id = %self.document_id, "seeding document from legacy text");
            Document::seed_from_text(&self.document_id, replica, &text)
        } else {
            Document::new(&self.document_id, replica)
        };

        Ok((doc, next_clock))
    }

    /// Returns true when the document changed and a save should be
    /// scheduled.
    fn handle_command(
        &self,
        cmd: DocCommand,
        doc: &mut Document,
        unsaved: &mut Vec<Operation>,
        next_clock: &mut u64,
        save_state: &mut SaveState,
        deadline: &mut Instant,
    ) -> bool {
        match cmd {
            DocCommand::ApplyRemote { payload, reply } => {
                let result = self.apply_remote(doc, unsaved, &payload);
                let edited = matches!(&result, Ok(outcome) if !outcome.forward.is_empty());
                let _ = reply.send(result);
                edited
            }
            DocCommand::ApplySnapshot { full_text, reply } => {
                let ops = self.apply_snapshot(doc, &full_text);
                let edited = !ops.is_empty();
                unsaved.extend(ops.iter().cloned());
                let _ = reply.send(Ok(encode_ops(&ops)));
                edited
            }
            DocCommand::DiffSince { since, reply } => {
                let _ = reply.send(encode_ops(&doc.diff_since(&since)));
                false
            }
            DocCommand::Text { reply } => {
                let _ = reply.send(doc.text());
                false
            }
            DocCommand::Flush { reply } => {
                if !unsaved.is_empty() {
                    // Treat as the retry attempt so failure is final.
                    *save_state = SaveState::Retrying;
                    self.save(doc, unsaved, next_clock, save_state, deadline);
                }
                let _ = reply.send(());
                false
            }
        }
    }

    fn apply_remote(
        &self,
        doc: &mut Document,
        unsaved: &mut Vec<Operation>,
        payload: &[u8],
    ) -> Result<ApplyOutcome, ServerError> {
        let ops = decode_ops(payload).map_err(ServerError::Merge)?;

        let mut accepted = Vec::new();
        let mut rejected = None;
        for op in &ops {
            if op.replica().0 & SERVER_REPLICA_BIT != 0 {
                rejected = Some(format!("reserved replica id {}", op.replica()));
                break;
            }
            match doc.apply(op) {
                Ok(applied) if applied.accepted => accepted.push(op.clone()),
                Ok(_) => {} // redelivery, already merged
                Err(e) => {
                    warn!(document_id = %self.document_id, op = %op.id(), "rejecting operation: {e}");
                    rejected = Some(e.to_string());
                    break;
                }
            }
        }

        unsaved.extend(accepted.iter().cloned());
        let forward = if accepted.is_empty() {
            Vec::new()
        } else {
            encode_ops(&accepted)
        };
        Ok(ApplyOutcome { forward, rejected })
    }

    fn apply_snapshot(&self, doc: &mut Document, full_text: &str) -> Vec<Operation> {
        let mut ops = Vec::new();
        for edit in diff(&doc.text(), full_text) {
            match edit {
                DiffOp::Delete { pos, len } => ops.extend(doc.local_delete(pos, len)),
                DiffOp::Insert { pos, text } => ops.push(doc.local_insert(pos, &text)),
            }
        }
        ops
    }

    fn save(
        &self,
        doc: &Document,
        unsaved: &mut Vec<Operation>,
        next_clock: &mut u64,
        save_state: &mut SaveState,
        deadline: &mut Instant,
    ) {
        if unsaved.is_empty() {
            *save_state = SaveState::Idle;
            return;
        }

        let data = encode_ops(unsaved);
        match self.append_resync(doc, &data, next_clock) {
            Ok(clock) => {
                unsaved.clear();
                *save_state = SaveState::Idle;
                let saved_at = chrono::Utc::now().timestamp();
                debug!(document_id = %self.document_id, clock, "document saved");
                let _ = self.events_tx.send(DocEvent::Saved {
                    room_id: self.room_id.clone(),
                    document_id: self.document_id.clone(),
                    saved_at,
                });
                self.maybe_compact(doc, next_clock);
            }
            Err(e) if *save_state != SaveState::Retrying => {
                warn!(document_id = %self.document_id, "save failed, will retry once: {e}");
                *save_state = SaveState::Retrying;
                *deadline = Instant::now() + self.config.save_retry_backoff;
            }
            Err(e) => {
                // Keep the operations; the next edit schedules another
                // attempt.
                error!(document_id = %self.document_id, "save failed permanently after retry: {e}");
                *save_state = SaveState::Idle;
            }
        }
    }

    /// Append the batch at the believed clock. A primary-key conflict
    /// means another writer claimed the slot, typically an evicted
    /// actor's late flush; resync the clock from the log and try the
    /// fresh slot once before reporting failure.
    fn append_resync(
        &self,
        doc: &Document,
        data: &[u8],
        next_clock: &mut u64,
    ) -> Result<u64, rusqlite::Error> {
        let clock = *next_clock;
        let text = doc.text();
        match self.store.append_entry(&self.document_id, clock, data, &text) {
            Ok(()) => {
                *next_clock = clock + 1;
                Ok(clock)
            }
            Err(first) => {
                let fresh = self.store.next_clock(&self.document_id)?;
                if fresh <= clock {
                    return Err(first);
                }
                warn!(
                    document_id = %self.document_id,
                    clock,
                    fresh,
                    "persistence clock was claimed by another writer, resyncing"
                );
                self.store.append_entry(&self.document_id, fresh, data, &text)?;
                *next_clock = fresh + 1;
                Ok(fresh)
            }
        }
    }

    fn maybe_compact(&self, doc: &Document, next_clock: &mut u64) {
        let log_len = match self.store.log_len(&self.document_id) {
            Ok(len) => len,
            Err(e) => {
                warn!(document_id = %self.document_id, "compaction check failed: {e}");
                return;
            }
        };
        if log_len <= self.config.compaction_threshold {
            return;
        }

        let clock = *next_clock;
        match self
            .store
            .compact(&self.document_id, &doc.encode_state(), clock, &doc.text())
        {
            Ok(()) => {
                *next_clock = clock + 1;
                info!(document_id = %self.document_id, entries = log_len, "compacted document log");
            }
            Err(e) => warn!(document_id = %self.document_id, "compaction failed: {e}"),
        }
    }
}
