//! The room: the serialization boundary around one shared document.
//!
//! A room is a single-writer actor task with an inbound mailbox
//! (`tokio::sync::mpsc`). All mutations to its [`OtEngine`] and participant
//! map happen inside this task, so nothing here needs its own locking — the
//! mailbox *is* the lock.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;

use dashmap::DashMap;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::engine::{HistorySince, OtEngine};
use crate::error::ErrorReason;
use crate::ot::Operation;
use crate::persistence::Persistence;
use crate::protocol::{Cursor, OperationWire, ParticipantSummary, Selection, ServerMessage};
use crate::ServerConfig;
use std::sync::Arc;

/// A handle the room uses to push frames to one connected session, and to
/// force-close it (e.g. on preemption or backpressure timeout).
#[derive(Clone)]
pub struct SessionHandle {
    pub session_id: u64,
    pub room_id: String,
    pub outbound: mpsc::Sender<ServerMessage>,
    pub closer: Arc<tokio::sync::Notify>,
    /// Set to the moment the outbound queue first overflowed; cleared once a
    /// send succeeds again. The session's own task watches this to enforce
    /// the backpressure grace period (see `session::run`).
    pub backpressure_since: Arc<std::sync::Mutex<Option<Instant>>>,
}

impl SessionHandle {
    /// Best-effort send: drops the frame rather than blocking the room
    /// writer on one slow subscriber. Under overflow, cursor broadcasts are
    /// shed silently (they're the most replaceable kind of update); any
    /// other frame instead arms the backpressure clock and attempts to
    /// notify the client with a `BACKPRESSURE` frame.
    fn send(&self, msg: ServerMessage) {
        let is_cursor = matches!(msg, ServerMessage::CursorUpdateBroadcast { .. });
        match self.outbound.try_send(msg) {
            Ok(()) => {
                let mut since = self.backpressure_since.lock().unwrap();
                *since = None;
            }
            Err(_) if is_cursor => {
                warn!(session_id = self.session_id, "dropping cursor broadcast, outbound queue full");
            }
            Err(_) => {
                warn!(session_id = self.session_id, "dropping frame under backpressure");
                let mut since = self.backpressure_since.lock().unwrap();
                if since.is_none() {
                    *since = Some(Instant::now());
                }
                drop(since);
                let _ = self
                    .outbound
                    .try_send(ServerMessage::Backpressure { room_id: self.room_id.clone() });
            }
        }
    }

    fn close(&self, reason: ErrorReason) {
        self.send(ServerMessage::error(reason, reason.to_string()));
        self.closer.notify_one();
    }
}

struct Participant {
    user_id: Option<String>,
    handle: SessionHandle,
    cursor: Option<Cursor>,
    selection: Option<Selection>,
    joined_at: Instant,
    last_activity: Instant,
}

/// Commands accepted by a room's mailbox.
pub enum RoomCommand {
    Join {
        client_id: String,
        user_id: Option<String>,
        handle: SessionHandle,
    },
    Leave {
        client_id: String,
    },
    SubmitOp {
        client_id: String,
        operation: Operation,
    },
    UpdateCursor {
        client_id: String,
        cursor: Option<Cursor>,
        selection: Option<Selection>,
    },
    RequestSync {
        client_id: String,
        from_version: Option<u64>,
    },
    SessionClosed {
        client_id: String,
        session_id: u64,
    },
    Shutdown,
}

/// Registry of live room mailboxes, shared so a room can remove its own
/// entry on eviction without the room and the manager borrowing each
/// other's internals.
pub type RoomRegistry = Arc<DashMap<String, mpsc::Sender<RoomCommand>>>;

pub struct Room {
    room_id: String,
    engine: OtEngine,
    participants: HashMap<String, Participant>,
    persistence: Arc<dyn Persistence>,
    config: Arc<ServerConfig>,
    ops_since_snapshot: u32,
    last_snapshot: Instant,
    durable: bool,
}

impl Room {
    fn new(
        room_id: String,
        engine: OtEngine,
        persistence: Arc<dyn Persistence>,
        config: Arc<ServerConfig>,
    ) -> Self {
        let durable = config.durable_ops_before_ack;
        Self {
            room_id,
            engine,
            participants: HashMap::new(),
            persistence,
            config,
            ops_since_snapshot: 0,
            last_snapshot: Instant::now(),
            durable,
        }
    }

    /// Spawn the room's actor task and return a sender for its mailbox.
    pub fn spawn(
        room_id: String,
        engine: OtEngine,
        persistence: Arc<dyn Persistence>,
        config: Arc<ServerConfig>,
        registry: RoomRegistry,
    ) -> mpsc::Sender<RoomCommand> {
        let (tx, rx) = mpsc::channel(256);
        let room = Room::new(room_id, engine, persistence, config);
        tokio::spawn(room.run(rx, registry));
        tx
    }

    async fn run(mut self, mut mailbox: mpsc::Receiver<RoomCommand>, registry: RoomRegistry) {
        info!(room_id = %self.room_id, "room active");
        loop {
            let idle = self.participants.is_empty();
            let idle_deadline = Instant::now() + self.config.room_idle_eviction;

            // `biased` gives the mailbox priority: a Join racing the idle
            // timer is never lost to eviction.
            tokio::select! {
                biased;

                cmd = mailbox.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if self.handle_guarded(cmd).await.is_err() {
                                error!(room_id = %self.room_id, "room writer panicked, disconnecting all sessions");
                                self.notify_internal_error();
                                registry.remove(&self.room_id);
                                return;
                            }
                        }
                        None => break,
                    }
                }

                _ = tokio::time::sleep_until(idle_deadline), if idle => {
                    info!(room_id = %self.room_id, "idle timeout, evicting");
                    break;
                }
            }
        }

        self.flush_snapshot().await;
        registry.remove(&self.room_id);
        info!(room_id = %self.room_id, "room evicted");
    }

    /// Run one command, catching a panic inside `handle` so the failure is
    /// scoped to this room only: other rooms' actor tasks are unaffected, and
    /// this room's sessions get a disconnect with a reason instead of a
    /// silently closed mailbox.
    async fn handle_guarded(&mut self, cmd: RoomCommand) -> Result<(), ()> {
        AssertUnwindSafe(self.handle(cmd))
            .catch_unwind()
            .await
            .map_err(|_| ())
    }

    /// Tell every subscriber the room is tearing down due to an unrecoverable
    /// failure, then drop them: the room itself is not recoverable past this
    /// point, matching the "unrecoverable failure in a room writer terminates
    /// that room only" error-propagation policy.
    fn notify_internal_error(&mut self) {
        for p in self.participants.values() {
            p.handle.close(ErrorReason::Internal);
        }
        self.participants.clear();
    }

    async fn handle(&mut self, cmd: RoomCommand) {
        match cmd {
            RoomCommand::Join {
                client_id,
                user_id,
                handle,
            } => self.on_join(client_id, user_id, handle).await,
            RoomCommand::Leave { client_id } => self.on_leave(&client_id),
            RoomCommand::SubmitOp {
                client_id,
                operation,
            } => self.on_submit_op(&client_id, operation).await,
            RoomCommand::UpdateCursor {
                client_id,
                cursor,
                selection,
            } => self.on_update_cursor(&client_id, cursor, selection),
            RoomCommand::RequestSync {
                client_id,
                from_version,
            } => self.on_request_sync(&client_id, from_version),
            RoomCommand::SessionClosed {
                client_id,
                session_id,
            } => self.on_session_closed(&client_id, session_id),
            RoomCommand::Shutdown => self.on_shutdown().await,
        }
    }

    async fn on_join(&mut self, client_id: String, user_id: Option<String>, handle: SessionHandle) {
        if let Some(prior) = self.participants.remove(&client_id) {
            prior.handle.close(ErrorReason::Preempted);
        }

        let (content, version) = self.engine.snapshot();
        let participants: Vec<ParticipantSummary> = self
            .participants
            .iter()
            .map(|(client_id, p)| ParticipantSummary {
                client_id: client_id.clone(),
                user_id: p.user_id.clone(),
            })
            .collect();

        handle.send(ServerMessage::JoinRoomAck {
            room_id: self.room_id.clone(),
            content,
            version,
            participants,
        });

        for other in self.participants.values() {
            other.handle.send(ServerMessage::ParticipantJoined {
                room_id: self.room_id.clone(),
                client_id: client_id.clone(),
                user_id: user_id.clone(),
            });
        }

        let now = Instant::now();
        self.participants.insert(
            client_id,
            Participant {
                user_id,
                handle,
                cursor: None,
                selection: None,
                joined_at: now,
                last_activity: now,
            },
        );
    }

    async fn on_submit_op(&mut self, client_id: &str, operation: Operation) {
        let operation_id = operation.id.clone();
        match self.engine.integrate(operation) {
            Ok((accepted, _content)) => {
                if let Some(p) = self.participants.get_mut(client_id) {
                    p.last_activity = Instant::now();
                }
                // Cursors are line/column pairs and advisory: they are
                // not transformed against accepted ops, the same way
                // CURSOR_UPDATE never touches OT state. Clients reconcile
                // their own cursor against new ops as they apply them.

                // When the room is configured durable, appendOp must complete
                // before the submitter's ACK goes out; otherwise it's fired
                // off in the background and the ACK/broadcast go out first.
                if self.durable {
                    self.append_op_durably(&accepted).await;
                }

                let version = self.engine.version();
                if let Some(submitter) = self.participants.get(client_id) {
                    submitter.handle.send(ServerMessage::Ack {
                        room_id: self.room_id.clone(),
                        operation_id: operation_id.clone(),
                        version,
                    });
                }
                for (other_client, p) in self.participants.iter() {
                    if other_client == client_id {
                        continue;
                    }
                    p.handle.send(ServerMessage::OtOpBroadcast {
                        room_id: self.room_id.clone(),
                        operation: OperationWire::from(&accepted),
                        version,
                        sender_client_id: client_id.to_string(),
                    });
                }

                if !self.durable {
                    self.append_op_in_background(accepted.clone());
                }
                self.maybe_snapshot().await;
            }
            Err(e) => {
                if let Some(submitter) = self.participants.get(client_id) {
                    let reason = ErrorReason::from(e);
                    submitter.handle.send(ServerMessage::op_error(
                        reason,
                        reason.to_string(),
                        operation_id,
                    ));
                }
            }
        }
    }

    /// Await `appendOp` inline so it completes before the caller's ACK goes
    /// out. A persistence failure is logged and metered, not propagated: the
    /// op stays accepted in memory and a later snapshot retries durability.
    async fn append_op_durably(&mut self, accepted: &Operation) {
        self.ops_since_snapshot += 1;
        if let Err(e) = self.persistence.append_op(&self.room_id, accepted).await {
            error!(room_id = %self.room_id, error = %e, "failed to durably persist op");
        }
    }

    /// Fire-and-forget `appendOp`, for rooms not configured `durable=true`.
    fn append_op_in_background(&mut self, accepted: Operation) {
        self.ops_since_snapshot += 1;
        let persistence = self.persistence.clone();
        let room_id = self.room_id.clone();
        tokio::spawn(async move {
            if let Err(e) = persistence.append_op(&room_id, &accepted).await {
                error!(room_id = %room_id, error = %e, "failed to persist op");
            }
        });
    }

    async fn maybe_snapshot(&mut self) {
        let should_snapshot = self.ops_since_snapshot >= self.config.snapshot_every_ops
            || self.last_snapshot.elapsed() >= self.config.snapshot_every_seconds;
        if should_snapshot {
            self.flush_snapshot().await;
        }
    }

    async fn flush_snapshot(&mut self) {
        let (content, version) = self.engine.snapshot();
        if let Err(e) = self.persistence.snapshot(&self.room_id, &content, version).await {
            error!(room_id = %self.room_id, error = %e, "failed to snapshot room");
            return;
        }
        self.ops_since_snapshot = 0;
        self.last_snapshot = Instant::now();
    }

    fn on_update_cursor(
        &mut self,
        client_id: &str,
        cursor: Option<Cursor>,
        selection: Option<Selection>,
    ) {
        let Some(p) = self.participants.get_mut(client_id) else {
            return;
        };
        p.cursor = cursor;
        p.selection = selection;
        p.last_activity = Instant::now();

        for (other_client, other) in self.participants.iter() {
            if other_client == client_id {
                continue;
            }
            other.handle.send(ServerMessage::CursorUpdateBroadcast {
                room_id: self.room_id.clone(),
                client_id: client_id.to_string(),
                cursor,
                selection,
            });
        }
    }

    fn on_request_sync(&mut self, client_id: &str, from_version: Option<u64>) {
        let Some(p) = self.participants.get(client_id) else {
            return;
        };
        match from_version {
            Some(from) => match self.engine.history_since(from) {
                HistorySince::Ops(ops) => {
                    // Each historical op's stored `version` is the room
                    // version at the moment it was accepted; the
                    // post-acceptance room version is one more than that.
                    for op in &ops {
                        p.handle.send(ServerMessage::OtOpBroadcast {
                            room_id: self.room_id.clone(),
                            operation: OperationWire::from(op),
                            version: op.version + 1,
                            sender_client_id: op.client_id.clone(),
                        });
                    }
                }
                HistorySince::Resync => self.send_full_snapshot(client_id),
            },
            None => self.send_full_snapshot(client_id),
        }
    }

    fn send_full_snapshot(&self, client_id: &str) {
        let Some(p) = self.participants.get(client_id) else {
            return;
        };
        let (content, version) = self.engine.snapshot();
        let participants = self
            .participants
            .iter()
            .map(|(id, p)| ParticipantSummary {
                client_id: id.clone(),
                user_id: p.user_id.clone(),
            })
            .collect();
        p.handle.send(ServerMessage::JoinRoomAck {
            room_id: self.room_id.clone(),
            content,
            version,
            participants,
        });
    }

    fn on_leave(&mut self, client_id: &str) {
        if self.participants.remove(client_id).is_some() {
            self.broadcast_left(client_id);
        }
    }

    fn on_session_closed(&mut self, client_id: &str, session_id: u64) {
        if let Some(p) = self.participants.get(client_id) {
            if p.handle.session_id != session_id {
                // A newer session already preempted this one; not our disconnect.
                return;
            }
        } else {
            return;
        }
        self.participants.remove(client_id);
        self.broadcast_left(client_id);
    }

    fn broadcast_left(&self, client_id: &str) {
        for p in self.participants.values() {
            p.handle.send(ServerMessage::ParticipantLeft {
                room_id: self.room_id.clone(),
                client_id: client_id.to_string(),
            });
        }
    }

    async fn on_shutdown(&mut self) {
        self.flush_snapshot().await;
        for p in self.participants.values() {
            p.handle.close(ErrorReason::Shutdown);
        }
        self.participants.clear();
    }
}
