//! Per-room actor: a task that owns a [`Room`] and applies commands one at a time.
//!
//! Every command carries a oneshot reply. The actor acknowledges the originating socket before
//! fanning out the operation's deliveries, so a client always sees its own ack ahead of any
//! notification emitted after it. Persistence jobs go to a companion task that drains them in
//! order, so the actor never awaits storage.
//!
//! A room nobody is present in unloads itself once its writes are flushed; the registry loads it
//! again from storage on the next join.

use std::{collections::HashMap, sync::Arc, time::SystemTime};

use tokio::{
    sync::{mpsc, oneshot},
    time::{Instant, sleep_until},
};
use tracing::{debug, info, warn};

use crate::{
    dao::models::RoomEntity,
    dto::{
        room::{ChatMessageDto, CursorPosition, JoinRoomResponse, RequestExecutionResponse},
        ws::ServerMessage,
    },
    error::ServiceError,
    services::websocket_service::encode_message,
    state::{
        ClientConnection, StoreSlot,
        execution::ExecutionSnapshot,
        presence::{ActiveParticipant, ConnectionId},
        registry::RoomDirectory,
        room::{Authorization, Effects, Outcome, PersistJob, Room},
    },
};

/// Depth of the per-room command queue.
const COMMAND_QUEUE_DEPTH: usize = 256;

/// Operation requested by a connection.
#[derive(Debug)]
pub enum RoomOp {
    /// Join the room. `refreshed` carries a fresh copy of the stored room to check membership
    /// against; `None` keeps the cached member list.
    Join {
        /// Stored room used to refresh membership before joining.
        refreshed: Option<RoomEntity>,
    },
    /// Leave the room; also used on disconnect.
    Leave,
    /// Overwrite the code buffer.
    EditCode {
        /// New code.
        code: String,
        /// New language tag.
        language: String,
    },
    /// Overwrite the program input.
    EditInput {
        /// New input.
        input: String,
    },
    /// Overwrite the program output.
    EditOutput {
        /// New output.
        output: String,
        /// Whether the output pane is shown.
        show_output: bool,
    },
    /// Post a chat message.
    SendMessage {
        /// Message text.
        body: String,
    },
    /// Relay the caller's cursor to the others.
    MoveCursor(CursorPosition),
    /// Open an execution request.
    RequestExecution(ExecutionSnapshot),
    /// Vote on the pending request.
    SubmitVote {
        /// `true` approves, `false` vetoes.
        approved: bool,
    },
    /// Drop the caller's request.
    CancelExecution,
    /// Close the caller's approved request after running it. Failures are only reported when the
    /// frame carried an id.
    MarkExecuted,
    /// Ask which program the caller may run now. Never acknowledged by the actor.
    AuthorizeExecution(ExecutionSnapshot),
    /// End the room.
    EndRoom,
}

impl RoomOp {
    fn is_silent(&self, request_id: Option<u64>) -> bool {
        match self {
            RoomOp::AuthorizeExecution(_) => true,
            RoomOp::MarkExecuted => request_id.is_none(),
            _ => false,
        }
    }
}

/// Successful result of a [`RoomOp`].
#[derive(Debug)]
pub enum OpReply {
    /// Room description for a newly joined connection.
    Joined(Box<JoinRoomResponse>),
    /// Whether the connection was present before leaving.
    Left(bool),
    /// The message as appended to the chat.
    MessageSent(ChatMessageDto),
    /// Answer to an execution request.
    ExecutionRequested(RequestExecutionResponse),
    /// Program the caller may send to the sandbox.
    Authorized(Authorization),
    /// Operation applied.
    Done,
}

impl OpReply {
    fn ack_data(&self) -> Option<serde_json::Value> {
        let value = match self {
            OpReply::Joined(reply) => serde_json::to_value(reply),
            OpReply::MessageSent(reply) => serde_json::to_value(reply),
            OpReply::ExecutionRequested(reply) => serde_json::to_value(reply),
            OpReply::Left(_) | OpReply::Authorized(_) | OpReply::Done => return None,
        };
        value
            .inspect_err(|err| warn!(error = %err, "failed to serialize acknowledgement data"))
            .ok()
    }
}

/// Message sent to a room actor.
pub struct RoomCommand {
    /// Connection issuing the operation.
    pub from: ClientConnection,
    /// Correlation id of the client frame.
    pub request_id: Option<u64>,
    /// Operation to apply.
    pub op: RoomOp,
    /// Channel receiving the result.
    pub reply: oneshot::Sender<Result<OpReply, ServiceError>>,
}

/// Cloneable address of a running room actor.
#[derive(Clone)]
pub struct RoomHandle {
    room_id: Arc<str>,
    tx: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    /// Identifier of the room.
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Whether the actor stopped, because the room ended or was unloaded.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Apply `op` on behalf of `from` and wait for the result.
    ///
    /// The originating socket receives exactly one acknowledgement: from the actor, or from here
    /// when the actor already stopped. Silent operations are never acknowledged.
    pub async fn request(
        &self,
        from: &ClientConnection,
        request_id: Option<u64>,
        op: RoomOp,
    ) -> Result<OpReply, ServiceError> {
        let silent = op.is_silent(request_id);
        self.try_request(from, request_id, op)
            .await
            .unwrap_or_else(|| {
                let err = ServiceError::RoomNotFound(self.room_id.to_string());
                if !silent {
                    acknowledge(from, request_id, Err(&err));
                }
                Err(err)
            })
    }

    /// Like [`RoomHandle::request`], but returns `None` without acknowledging anything when the
    /// actor stopped before applying `op`.
    pub async fn try_request(
        &self,
        from: &ClientConnection,
        request_id: Option<u64>,
        op: RoomOp,
    ) -> Option<Result<OpReply, ServiceError>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let command = RoomCommand {
            from: from.clone(),
            request_id,
            op,
            reply: reply_tx,
        };

        self.tx.send(command).await.ok()?;
        reply_rx.await.ok()
    }
}

fn acknowledge(
    to: &ClientConnection,
    request_id: Option<u64>,
    result: Result<Option<serde_json::Value>, &ServiceError>,
) {
    if let Some(ack) = ServerMessage::reply(request_id, result) {
        to.send(&ack);
    }
}

/// Work item of the persistence task.
enum PersistMessage {
    /// Write to apply.
    Job(PersistJob),
    /// Signalled once every earlier job ran.
    Flush(oneshot::Sender<()>),
}

/// Start the actor and its persistence task for `room`.
pub fn spawn(room: Room, store: StoreSlot, directory: RoomDirectory) -> RoomHandle {
    let room_id: Arc<str> = Arc::from(room.id());
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
    let (persist_tx, persist_rx) = mpsc::unbounded_channel();

    tokio::spawn(persist(
        room_id.clone(),
        store.clone(),
        directory.clone(),
        persist_rx,
    ));

    let actor = RoomActor {
        room,
        sockets: HashMap::new(),
        persist_tx,
        rx,
        store,
        directory,
    };
    tokio::spawn(actor.run());

    RoomHandle { room_id, tx }
}

struct RoomActor {
    room: Room,
    sockets: HashMap<ConnectionId, ClientConnection>,
    persist_tx: mpsc::UnboundedSender<PersistMessage>,
    rx: mpsc::Receiver<RoomCommand>,
    store: StoreSlot,
    directory: RoomDirectory,
}

impl RoomActor {
    async fn run(mut self) {
        debug!(room = %self.room.id(), "room actor started");

        loop {
            let deadline = self.room.execution_deadline();
            tokio::select! {
                command = self.rx.recv() => {
                    let Some(command) = command else { break };
                    self.handle(command);
                    if self.room.is_ended() {
                        // Tombstone before closing so joins queued behind the end cannot reload it.
                        self.directory.mark_ended(self.room.id());
                        break;
                    }
                    if self.is_idle() && self.unload().await {
                        break;
                    }
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    let effects = self.room.expire_execution(Instant::now());
                    if !effects.deliveries.is_empty() {
                        info!(room = %self.room.id(), "execution request expired");
                    }
                    self.dispatch(effects);
                }
            }
        }

        // Commands still queued are dropped unanswered: joins reopen the room, the others are
        // answered with RoomNotFound by their handle.
        self.rx.close();
        debug!(room = %self.room.id(), "room actor stopped");
    }

    fn is_idle(&self) -> bool {
        self.room.presence().is_empty() && self.room.execution().is_none()
    }

    /// Stop serving once pending writes reached storage and no command is waiting.
    ///
    /// In degraded mode the room stays loaded, as storage could not restore it.
    async fn unload(&mut self) -> bool {
        if self.store.get().await.is_none() {
            return false;
        }

        let (flushed_tx, flushed_rx) = oneshot::channel();
        if self.persist_tx.send(PersistMessage::Flush(flushed_tx)).is_ok() {
            let _ = flushed_rx.await;
        }
        if !self.rx.is_empty() {
            return false;
        }

        self.rx.close();
        self.directory.evict(self.room.id());
        true
    }

    fn handle(&mut self, command: RoomCommand) {
        let RoomCommand {
            from,
            request_id,
            op,
            reply,
        } = command;

        let silent = op.is_silent(request_id);
        let (result, effects) = self.apply(&from, op);

        if !silent {
            acknowledge(&from, request_id, result.as_ref().map(OpReply::ack_data));
        }

        if let Err(err) = &result {
            debug!(room = %self.room.id(), connection = %from.id, error = %err, "room operation refused");
        }

        self.dispatch(effects);
        let _ = reply.send(result);
    }

    fn apply(
        &mut self,
        from: &ClientConnection,
        op: RoomOp,
    ) -> (Result<OpReply, ServiceError>, Effects) {
        let connection_id = &from.id;
        match op {
            RoomOp::Join { refreshed } => {
                if let Some(entity) = refreshed {
                    self.room.refresh_members(&entity);
                }
                let participant = ActiveParticipant {
                    member_id: from.identity.member_id.clone(),
                    connection_id: from.id,
                    display_name: from.identity.display_name.clone(),
                    joined_at: SystemTime::now(),
                };
                let result = self.room.join(participant);
                if result.is_ok() {
                    self.sockets.insert(from.id, from.clone());
                    info!(
                        room = %self.room.id(),
                        connection = %from.id,
                        member = %from.identity.member_id,
                        "participant joined"
                    );
                }
                split(result, |reply| OpReply::Joined(Box::new(reply)))
            }
            RoomOp::Leave => {
                let outcome = self.room.leave(connection_id);
                if outcome.reply {
                    info!(
                        room = %self.room.id(),
                        connection = %from.id,
                        member = %from.identity.member_id,
                        "participant left"
                    );
                }
                split(Ok(outcome), OpReply::Left)
            }
            RoomOp::EditCode { code, language } => split(
                self.room.edit_code(connection_id, code, language),
                done,
            ),
            RoomOp::EditInput { input } => split(self.room.edit_input(connection_id, input), done),
            RoomOp::EditOutput {
                output,
                show_output,
            } => split(
                self.room.edit_output(connection_id, output, show_output),
                done,
            ),
            RoomOp::SendMessage { body } => split(
                self.room.send_message(connection_id, body),
                OpReply::MessageSent,
            ),
            RoomOp::MoveCursor(position) => {
                split(self.room.move_cursor(connection_id, position), done)
            }
            RoomOp::RequestExecution(snapshot) => split(
                self.room
                    .request_execution(connection_id, snapshot, Instant::now()),
                OpReply::ExecutionRequested,
            ),
            RoomOp::SubmitVote { approved } => {
                split(self.room.submit_vote(connection_id, approved), done)
            }
            RoomOp::CancelExecution => split(self.room.cancel_execution(connection_id), done),
            RoomOp::MarkExecuted => split(self.room.mark_executed(connection_id), done),
            RoomOp::AuthorizeExecution(requested) => (
                self.room
                    .authorize_execution(connection_id, requested)
                    .map(OpReply::Authorized),
                Effects::default(),
            ),
            RoomOp::EndRoom => {
                let result = self.room.end(connection_id);
                if result.is_ok() {
                    info!(room = %self.room.id(), member = %from.identity.member_id, "room ended by owner");
                }
                split(result, done)
            }
        }
    }

    /// Deliver notifications to their recipients and queue persistence jobs.
    fn dispatch(&mut self, effects: Effects) {
        let Effects {
            deliveries,
            persist,
        } = effects;

        for delivery in deliveries {
            let Some(frame) = encode_message(&delivery.message) else {
                continue;
            };
            for recipient in &delivery.recipients {
                let Some(socket) = self.sockets.get(recipient) else {
                    continue;
                };
                if socket.tx.send(frame.clone()).is_err() {
                    debug!(room = %self.room.id(), connection = %recipient, "socket closed before delivery");
                }
            }
        }

        for job in persist {
            if self.persist_tx.send(PersistMessage::Job(job)).is_err() {
                warn!(room = %self.room.id(), "persistence task stopped; dropping write");
            }
        }

        let presence = self.room.presence();
        self.sockets.retain(|id, _| presence.get(id).is_some());
    }
}

fn done(_: ()) -> OpReply {
    OpReply::Done
}

fn split<T>(
    result: Result<Outcome<T>, ServiceError>,
    wrap: impl FnOnce(T) -> OpReply,
) -> (Result<OpReply, ServiceError>, Effects) {
    match result {
        Ok(Outcome { reply, effects }) => (Ok(wrap(reply)), effects),
        Err(err) => (Err(err), Effects::default()),
    }
}

/// Drain persistence jobs of one room in order, logging failures.
///
/// The tombstone of an ended room is lifted once its deletion is stored.
async fn persist(
    room_id: Arc<str>,
    store: StoreSlot,
    directory: RoomDirectory,
    mut rx: mpsc::UnboundedReceiver<PersistMessage>,
) {
    while let Some(message) = rx.recv().await {
        let job = match message {
            PersistMessage::Job(job) => job,
            PersistMessage::Flush(done) => {
                let _ = done.send(());
                continue;
            }
        };
        let Some(store) = store.get().await else {
            warn!(room = %room_id, "storage unavailable (degraded mode); dropping room write");
            continue;
        };

        let (operation, result) = match job {
            PersistJob::AppendMessage(message) => (
                "append chat message",
                store.append_message(room_id.to_string(), message).await,
            ),
            PersistJob::SaveSnapshot(snapshot) => (
                "save room snapshot",
                store.save_snapshot(room_id.to_string(), snapshot).await,
            ),
            PersistJob::DeleteRoom => {
                let result = store.delete_room(room_id.to_string()).await.map(|_| ());
                if result.is_ok() {
                    directory.forget_ended(&room_id);
                }
                ("delete room", result)
            }
        };

        if let Err(err) = result {
            warn!(room = %room_id, operation, error = %err, "failed to persist room update");
        }
    }
}
