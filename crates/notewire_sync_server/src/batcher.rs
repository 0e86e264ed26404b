use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::trace;

use crate::registry::Registry;

/// Delivery priority for outbound frames.
///
/// High frames are document content and go out immediately. Normal and
/// Low frames (presence, cursors) coalesce in a short window so cursor
/// storms do not swamp the sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    High,
    Normal,
    Low,
}

struct Pending {
    room_id: String,
    frame: Vec<u8>,
    priority: Priority,
    exclude_user: Option<String>,
}

/// Outbound frame batcher in front of the registry.
pub struct Batcher {
    registry: Arc<Registry>,
    queue: Mutex<Vec<Pending>>,
    max_wait: Duration,
    max_size: usize,
    flush_scheduled: AtomicBool,
}

impl Batcher {
    pub fn new(registry: Arc<Registry>, max_wait: Duration, max_size: usize) -> Arc<Self> {
        Arc::new(Self {
            registry,
            queue: Mutex::new(Vec::new()),
            max_wait,
            max_size,
            flush_scheduled: AtomicBool::new(false),
        })
    }

    /// Queue a frame for a room, or deliver it at once when High.
    pub fn enqueue(
        self: &Arc<Self>,
        room_id: &str,
        frame: Vec<u8>,
        priority: Priority,
        exclude_user: Option<&str>,
    ) {
        if priority == Priority::High {
            self.registry.broadcast(room_id, &frame, exclude_user);
            return;
        }

        let should_flush = {
            let mut queue = self.queue.lock().unwrap();
            queue.push(Pending {
                room_id: room_id.to_string(),
                frame,
                priority,
                exclude_user: exclude_user.map(str::to_string),
            });
            queue.len() >= self.max_size
        };

        if should_flush {
            self.flush();
        } else if !self.flush_scheduled.swap(true, Ordering::SeqCst) {
            let batcher = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(batcher.max_wait).await;
                batcher.flush();
            });
        }
    }

    /// Drain the whole queue, highest priority first. The sort is
    /// stable so frames of equal priority keep their enqueue order.
    pub fn flush(&self) {
        self.flush_scheduled.store(false, Ordering::SeqCst);
        let pending = {
            let mut queue = self.queue.lock().unwrap();
            std::mem::take(&mut *queue)
        };
        self.deliver(pending);
    }

    /// Drain only one room's queued frames, leaving the rest batched.
    pub fn flush_room(&self, room_id: &str) {
        let pending = {
            let mut queue = self.queue.lock().unwrap();
            let mut taken = Vec::new();
            queue.retain_mut(|p| {
                if p.room_id == room_id {
                    taken.push(Pending {
                        room_id: std::mem::take(&mut p.room_id),
                        frame: std::mem::take(&mut p.frame),
                        priority: p.priority,
                        exclude_user: p.exclude_user.take(),
                    });
                    false
                } else {
                    true
                }
            });
            taken
        };
        self.deliver(pending);
    }

    fn deliver(&self, mut pending: Vec<Pending>) {
        if pending.is_empty() {
            return;
        }
        pending.sort_by_key(|p| p.priority);
        trace!(count = pending.len(), "flushing batched frames");

        // Consecutive frames sharing a room and an exclusion go out
        // as one registry batch, so a burst of cursor updates costs a
        // single member walk instead of one per frame.
        let mut start = 0;
        while start < pending.len() {
            let mut end = start + 1;
            while end < pending.len()
                && pending[end].room_id == pending[start].room_id
                && pending[end].exclude_user == pending[start].exclude_user
            {
                end += 1;
            }
            let frames: Vec<&[u8]> = pending[start..end]
                .iter()
                .map(|p| p.frame.as_slice())
                .collect();
            self.registry.broadcast_batch(
                &pending[start].room_id,
                &frames,
                pending[start].exclude_user.as_deref(),
            );
            start = end;
        }
    }
}
