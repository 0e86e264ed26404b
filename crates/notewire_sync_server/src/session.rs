//! Frame dispatch: everything that happens between a decoded envelope
//! arriving and outbound frames leaving through the batcher.

use notewire_sync::{Frame, Metadata, encode};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::AppState;
use crate::batcher::Priority;
use crate::db::UserIdentity;
use crate::error::ServerError;

/// What the websocket loop should do after one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Continue,
    /// The frame was invalid; the sender earns a protocol strike.
    Strike,
}

/// One authenticated websocket connection's view of the server.
pub struct Session {
    pub conn_id: Uuid,
    pub user: UserIdentity,
    sender: mpsc::UnboundedSender<Vec<u8>>,
}

impl Session {
    pub fn new(
        conn_id: Uuid,
        user: UserIdentity,
        sender: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Self {
        Self {
            conn_id,
            user,
            sender,
        }
    }

    /// Send a frame straight to this connection, outside the batcher.
    fn reply(&self, frame: &Frame) {
        let _ = self.sender.send(encode(frame));
    }

    pub fn send_error(&self, room_id: &str, message: impl Into<String>) {
        self.reply(&Frame::new(
            room_id,
            Metadata::Error {
                message: message.into(),
            },
        ));
    }

    /// Handle one decoded inbound frame.
    pub async fn handle_frame(
        &self,
        state: &AppState,
        frame: Frame,
    ) -> Result<FrameOutcome, ServerError> {
        let Frame {
            room_id: frame_room,
            metadata,
            payload,
        } = frame;
        match metadata {
            Metadata::Join { room_id } => self.handle_join(state, &room_id),
            Metadata::Leave { room_id } => {
                self.handle_leave(state, &room_id);
                Ok(FrameOutcome::Continue)
            }
            Metadata::SyncRequest {
                document_id,
                state_vector,
            } => {
                self.require_room(state, &frame_room)?;
                let ops = state
                    .docs
                    .diff_since(&frame_room, &document_id, state_vector)
                    .await?;
                self.reply(&Frame::with_payload(
                    &frame_room,
                    Metadata::SyncResponse {
                        document_id: document_id.clone(),
                    },
                    ops,
                ));
                state.registry.subscribe_document(self.conn_id, &document_id);

                // Replay current presence so a late joiner sees who is
                // already in the document.
                for (user_id, presence) in state.registry.presence_for(&document_id) {
                    if user_id != self.user.user_id {
                        self.reply(&Frame::new(
                            &frame_room,
                            Metadata::PresenceUpdate {
                                document_id: document_id.clone(),
                                user_id,
                                state: presence,
                            },
                        ));
                    }
                }
                Ok(FrameOutcome::Continue)
            }
            Metadata::Update { document_id } => {
                self.require_room(state, &frame_room)?;
                let outcome = state
                    .docs
                    .apply_remote(&frame_room, &document_id, payload)
                    .await?;

                if !outcome.forward.is_empty() {
                    let forward = encode(&Frame::with_payload(
                        &frame_room,
                        Metadata::Update {
                            document_id: document_id.clone(),
                        },
                        outcome.forward,
                    ));
                    state.batcher.enqueue(
                        &frame_room,
                        forward,
                        Priority::High,
                        Some(&self.user.user_id),
                    );
                }
                if let Some(reason) = outcome.rejected {
                    warn!(user_id = %self.user.user_id, document_id, "rejected update: {reason}");
                    self.send_error(&frame_room, format!("rejected update: {reason}"));
                    return Ok(FrameOutcome::Strike);
                }
                Ok(FrameOutcome::Continue)
            }
            Metadata::SyncSnapshot {
                document_id,
                full_text,
            } => {
                self.require_room(state, &frame_room)?;
                let forward = state
                    .docs
                    .apply_snapshot(&frame_room, &document_id, full_text)
                    .await?;
                if !forward.is_empty() {
                    let update = encode(&Frame::with_payload(
                        &frame_room,
                        Metadata::Update { document_id },
                        forward,
                    ));
                    state.batcher.enqueue(
                        &frame_room,
                        update,
                        Priority::High,
                        Some(&self.user.user_id),
                    );
                }
                Ok(FrameOutcome::Continue)
            }
            Metadata::PresenceUpdate {
                document_id,
                state: presence,
                ..
            } => {
                self.require_room(state, &frame_room)?;
                // The sender's identity comes from auth, never from the
                // frame, so presence cannot be spoofed.
                state
                    .registry
                    .set_presence(&self.user.user_id, &document_id, presence.clone());
                let out = encode(&Frame::new(
                    &frame_room,
                    Metadata::PresenceUpdate {
                        document_id,
                        user_id: self.user.user_id.clone(),
                        state: presence,
                    },
                ));
                state.batcher.enqueue(
                    &frame_room,
                    out,
                    Priority::Normal,
                    Some(&self.user.user_id),
                );
                Ok(FrameOutcome::Continue)
            }
            Metadata::CursorUpdate {
                document_id,
                position,
                selection,
                ..
            } => {
                self.require_room(state, &frame_room)?;
                let out = encode(&Frame::new(
                    &frame_room,
                    Metadata::CursorUpdate {
                        document_id,
                        user_id: self.user.user_id.clone(),
                        position,
                        selection,
                    },
                ));
                state.batcher.enqueue(
                    &frame_room,
                    out,
                    Priority::Low,
                    Some(&self.user.user_id),
                );
                Ok(FrameOutcome::Continue)
            }
            Metadata::CursorRemove { document_id, .. } => {
                self.require_room(state, &frame_room)?;
                let out = encode(&Frame::new(
                    &frame_room,
                    Metadata::CursorRemove {
                        document_id,
                        user_id: self.user.user_id.clone(),
                    },
                ));
                state.batcher.enqueue(
                    &frame_room,
                    out,
                    Priority::Low,
                    Some(&self.user.user_id),
                );
                Ok(FrameOutcome::Continue)
            }
            // Server-originated kinds are invalid from a client.
            other @ (Metadata::SyncResponse { .. }
            | Metadata::SavedAck { .. }
            | Metadata::Error { .. }) => {
                debug!(user_id = %self.user.user_id, kind = ?other.kind(), "client sent server-only frame");
                self.send_error(&frame_room, "server-only message kind");
                Ok(FrameOutcome::Strike)
            }
        }
    }

    fn handle_join(&self, state: &AppState, room_id: &str) -> Result<FrameOutcome, ServerError> {
        match state.access.can_edit(&self.user.user_id, room_id) {
            Ok(true) => {}
            Ok(false) => {
                self.send_error(room_id, "access denied");
                return Err(ServerError::AccessDenied {
                    user_id: self.user.user_id.clone(),
                    target: room_id.to_string(),
                });
            }
            Err(e) => return Err(e),
        }

        state
            .registry
            .register(self.conn_id, &self.user.user_id, room_id, self.sender.clone());
        debug!(user_id = %self.user.user_id, room_id, "joined room");
        Ok(FrameOutcome::Continue)
    }

    fn handle_leave(&self, state: &AppState, room_id: &str) {
        if state.registry.room_of(self.conn_id).as_deref() == Some(room_id) {
            self.disconnect(state);
        }
    }

    /// Tear down everything this connection contributed: registry
    /// entry, presence, and a cursor removal broadcast for each
    /// document the user had presence on.
    pub fn disconnect(&self, state: &AppState) {
        let Some((user_id, room_id)) = state.registry.unregister(self.conn_id) else {
            return;
        };

        // Presence belongs to the user, not the connection; only clear
        // it when no other connection for this user remains in a room.
        if !state.registry.user_has_connections(&user_id) {
            for document_id in state.registry.clear_presence(&user_id) {
                let out = encode(&Frame::new(
                    &room_id,
                    Metadata::CursorRemove {
                        document_id,
                        user_id: user_id.clone(),
                    },
                ));
                state
                    .batcher
                    .enqueue(&room_id, out, Priority::Normal, Some(&user_id));
            }
        }
        // Departure announcements should not wait out a batch window.
        state.batcher.flush_room(&room_id);
        debug!(user_id, room_id, "session closed");
    }

    fn require_room(&self, state: &AppState, room_id: &str) -> Result<(), ServerError> {
        match state.registry.room_of(self.conn_id) {
            Some(joined) if joined == room_id => Ok(()),
            _ => {
                self.send_error(room_id, "not joined to room");
                Err(ServerError::AccessDenied {
                    user_id: self.user.user_id.clone(),
                    target: room_id.to_string(),
                })
            }
        }
    }
}
