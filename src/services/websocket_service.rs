use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;
use validator::Validate;

use crate::{
    dto::ws::{ClientEvent, ClientFrame, ConnectedEvent, ExecutionPayload, RoomPayload, ServerMessage},
    error::ServiceError,
    services::identity::Identity,
    state::{
        ClientConnection, SharedState,
        actor::{OpReply, RoomHandle, RoomOp},
        execution::ExecutionSnapshot,
        room::Authorization,
    },
};

/// The writer task of a socket is gone.
#[derive(Debug, Error)]
#[error("connection closed")]
pub struct ConnectionClosed;

/// Handle the full lifecycle of a room client WebSocket connection.
pub async fn handle_socket(state: SharedState, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    // Dedicated writer task keeps outbound messages flowing even while we await inbound frames.
    let writer_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let timeout = state.config().identification_timeout;
    let initial_message = match tokio::time::timeout(timeout, receiver.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(Some(Ok(Message::Close(_)))) => {
            finalize(writer_task, outbound_tx).await;
            return;
        }
        Ok(Some(Ok(_))) => {
            let _ = outbound_tx.send(Message::Close(None));
            finalize(writer_task, outbound_tx).await;
            return;
        }
        Ok(Some(Err(err))) => {
            warn!(error = %err, "websocket receive error");
            finalize(writer_task, outbound_tx).await;
            return;
        }
        Ok(None) | Err(_) => {
            warn!("websocket authentication timed out");
            finalize(writer_task, outbound_tx).await;
            return;
        }
    };

    let identity = match authenticate(&state, &initial_message).await {
        Ok(identity) => identity,
        Err(err) => {
            warn!(error = %err, "websocket authentication failed");
            let _ = send_message_to_websocket(&outbound_tx, &ServerMessage::Error((&err).into()));
            let _ = outbound_tx.send(Message::Close(None));
            finalize(writer_task, outbound_tx).await;
            return;
        }
    };

    let connection = ClientConnection {
        id: Uuid::new_v4(),
        identity,
        tx: outbound_tx.clone(),
    };
    info!(
        connection = %connection.id,
        member = %connection.identity.member_id,
        "client connected"
    );

    let connected = ServerMessage::Connected(ConnectedEvent {
        member_id: connection.identity.member_id.clone(),
        display_name: connection.identity.display_name.clone(),
        connection_id: connection.id.to_string(),
    });
    let mut session = ConnectionSession::new(connection);

    if session.connection.send(&connected) {
        while let Some(message) = receiver.next().await {
            match message {
                Ok(Message::Text(text)) => handle_frame(&state, &mut session, &text).await,
                Ok(Message::Ping(payload)) => {
                    let _ = outbound_tx.send(Message::Pong(payload));
                }
                Ok(Message::Close(frame)) => {
                    info!(connection = %session.connection.id, "client closed");
                    let _ = outbound_tx.send(Message::Close(frame));
                    break;
                }
                Ok(Message::Binary(_)) => {
                    debug!(connection = %session.connection.id, "ignoring binary frame");
                }
                Ok(Message::Pong(_)) => {}
                Err(err) => {
                    warn!(connection = %session.connection.id, error = %err, "websocket error");
                    break;
                }
            }
        }
    } else {
        info!(connection = %session.connection.id, "connection closed during handshake");
    }

    disconnect(&state, &mut session).await;
    finalize(writer_task, outbound_tx).await;
}

async fn authenticate(state: &SharedState, text: &str) -> Result<Identity, ServiceError> {
    let frame: ClientFrame = serde_json::from_str(text)
        .map_err(|err| ServiceError::InvalidInput(format!("malformed frame: {err}")))?;
    let ClientEvent::Authenticate(payload) = frame.event else {
        return Err(ServiceError::Unauthenticated(
            "first frame must be `authenticate`".into(),
        ));
    };
    payload.validate()?;
    Ok(state.identity().verify(payload.token).await?)
}

/// Per-connection state kept by the reader task.
pub struct ConnectionSession {
    connection: ClientConnection,
    current_room: Option<RoomHandle>,
}

impl ConnectionSession {
    /// Session of a freshly authenticated connection, not yet in any room.
    pub fn new(connection: ClientConnection) -> Self {
        Self {
            connection,
            current_room: None,
        }
    }

    /// Authenticated connection driving this session.
    pub fn connection(&self) -> &ClientConnection {
        &self.connection
    }

    /// Room the connection is active in, if any.
    pub fn current_room(&self) -> Option<&str> {
        self.current_room
            .as_ref()
            .filter(|handle| !handle.is_closed())
            .map(RoomHandle::room_id)
    }

    fn reply(&self, id: Option<u64>, result: Result<Option<serde_json::Value>, &ServiceError>) {
        if let Some(message) = ServerMessage::reply(id, result) {
            self.connection.send(&message);
        }
    }

    /// Handle for `room`: the joined room, or a live room the caller is not part of, in which
    /// case the actor answers `not-active`.
    fn room_handle(&self, state: &SharedState, room: &str) -> Result<RoomHandle, ServiceError> {
        match &self.current_room {
            Some(handle) if handle.room_id() == room => Ok(handle.clone()),
            _ => state.registry().get(room),
        }
    }

    async fn forward(
        &mut self,
        state: &SharedState,
        id: Option<u64>,
        room: &str,
        op: RoomOp,
    ) -> Result<(), ServiceError> {
        let handle = self.room_handle(state, room)?;
        if let Err(ServiceError::RoomNotFound(_)) = handle.request(&self.connection, id, op).await {
            self.forget_room(room);
        }
        Ok(())
    }

    fn forget_room(&mut self, room: &str) {
        if self
            .current_room
            .as_ref()
            .is_some_and(|handle| handle.room_id() == room)
        {
            self.current_room = None;
        }
    }

    async fn leave_current(&mut self) {
        let Some(handle) = self.current_room.take() else {
            return;
        };
        if !handle.is_closed() {
            let _ = handle.request(&self.connection, None, RoomOp::Leave).await;
        }
    }
}

/// Parse, validate and apply one text frame. Every outcome is reported to the originating
/// connection only; room notifications are fanned out by the room actor.
pub async fn handle_frame(state: &SharedState, session: &mut ConnectionSession, text: &str) {
    let ClientFrame { id, event } = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(err) => {
            let err = ServiceError::InvalidInput(format!("malformed frame: {err}"));
            debug!(connection = %session.connection.id, error = %err, "frame rejected");
            session.reply(frame_id(text), Err(&err));
            return;
        }
    };

    let event_name = event.name();
    debug!(connection = %session.connection.id, event = event_name, "received frame");

    if let Err(err) = event.validate() {
        debug!(connection = %session.connection.id, event = event_name, error = %err, "frame rejected");
        session.reply(id, Err(&err));
        return;
    }

    // Errors surfacing here never reached a room actor, which answers everything else.
    if let Err(err) = dispatch(state, session, id, event).await {
        debug!(connection = %session.connection.id, event = event_name, error = %err, "frame failed");
        session.reply(id, Err(&err));
    }
}

/// Best-effort extraction of the correlation id of a frame that failed to parse.
fn frame_id(text: &str) -> Option<u64> {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|value| value.get("id").and_then(serde_json::Value::as_u64))
}

async fn dispatch(
    state: &SharedState,
    session: &mut ConnectionSession,
    id: Option<u64>,
    event: ClientEvent,
) -> Result<(), ServiceError> {
    match event {
        ClientEvent::Authenticate(_) => Err(ServiceError::InvalidInput(
            "connection is already authenticated".into(),
        )),
        ClientEvent::JoinRoom(RoomPayload { room }) => join_room(state, session, id, room).await,
        ClientEvent::LeaveRoom(RoomPayload { room }) => {
            leave_room(session, id, &room).await;
            Ok(())
        }
        ClientEvent::SendMessage(payload) => {
            let op = RoomOp::SendMessage { body: payload.body };
            session.forward(state, id, &payload.room, op).await
        }
        ClientEvent::EditCode(payload) => {
            let op = RoomOp::EditCode {
                code: payload.code,
                language: payload.language,
            };
            session.forward(state, id, &payload.room, op).await
        }
        ClientEvent::EditInput(payload) => {
            let op = RoomOp::EditInput {
                input: payload.input,
            };
            session.forward(state, id, &payload.room, op).await
        }
        ClientEvent::EditOutput(payload) => {
            let op = RoomOp::EditOutput {
                output: payload.output,
                show_output: payload.show_output,
            };
            session.forward(state, id, &payload.room, op).await
        }
        ClientEvent::CursorMove(payload) => {
            let op = RoomOp::MoveCursor(payload.position);
            session.forward(state, id, &payload.room, op).await
        }
        ClientEvent::RequestExecution(payload) => {
            let (room, program) = split_program(payload);
            session
                .forward(state, id, &room, RoomOp::RequestExecution(program))
                .await
        }
        ClientEvent::SubmitVote(payload) => {
            let op = RoomOp::SubmitVote {
                approved: payload.approved,
            };
            session.forward(state, id, &payload.room, op).await
        }
        ClientEvent::CancelExecution(RoomPayload { room }) => {
            session
                .forward(state, id, &room, RoomOp::CancelExecution)
                .await
        }
        ClientEvent::MarkExecuted(RoomPayload { room }) => {
            session.forward(state, id, &room, RoomOp::MarkExecuted).await
        }
        ClientEvent::RunExecution(payload) => run_execution(state, session, id, payload).await,
        ClientEvent::EndRoom(RoomPayload { room }) => end_room(state, session, id, room).await,
        ClientEvent::Unknown => Err(ServiceError::InvalidInput("unknown event type".into())),
    }
}

fn split_program(payload: ExecutionPayload) -> (String, ExecutionSnapshot) {
    let ExecutionPayload {
        room,
        code,
        language,
        input,
    } = payload;
    (
        room,
        ExecutionSnapshot {
            code,
            language,
            input,
        },
    )
}

async fn join_room(
    state: &SharedState,
    session: &mut ConnectionSession,
    id: Option<u64>,
    room: String,
) -> Result<(), ServiceError> {
    if session
        .current_room
        .as_ref()
        .is_some_and(|handle| handle.room_id() != room)
    {
        session.leave_current().await;
    }

    if let Some(handle) = state.registry().join(&room, &session.connection, id).await? {
        session.current_room = Some(handle);
    }
    Ok(())
}

async fn leave_room(session: &mut ConnectionSession, id: Option<u64>, room: &str) {
    let handle = match session.current_room.take() {
        Some(handle) if handle.room_id() == room => handle,
        other => {
            session.current_room = other;
            session.reply(id, Ok(None));
            return;
        }
    };

    if handle.is_closed() {
        session.reply(id, Ok(None));
    } else {
        let _ = handle.request(&session.connection, id, RoomOp::Leave).await;
    }
}

async fn end_room(
    state: &SharedState,
    session: &mut ConnectionSession,
    id: Option<u64>,
    room: String,
) -> Result<(), ServiceError> {
    let handle = session.room_handle(state, &room)?;
    match handle.request(&session.connection, id, RoomOp::EndRoom).await {
        Ok(_) | Err(ServiceError::RoomNotFound(_)) => session.forget_room(&room),
        Err(_) => {}
    }
    Ok(())
}

/// Run the authorized program in the sandbox and report the result to the requester only.
///
/// The sandbox is called from the connection task, so the room keeps serving other participants
/// meanwhile. A failed run leaves an approved request in place for a retry.
async fn run_execution(
    state: &SharedState,
    session: &mut ConnectionSession,
    id: Option<u64>,
    payload: ExecutionPayload,
) -> Result<(), ServiceError> {
    let (room, requested) = split_program(payload);
    let handle = session.room_handle(state, &room)?;

    let OpReply::Authorized(Authorization {
        program,
        from_request,
    }) = handle
        .request(&session.connection, id, RoomOp::AuthorizeExecution(requested))
        .await?
    else {
        return Err(ServiceError::ExecutionNotApproved);
    };

    info!(
        room = %room,
        connection = %session.connection.id,
        language = %program.language,
        from_request,
        "running program in sandbox"
    );

    let report = state.sandbox().execute(program).await.map_err(|err| {
        warn!(room = %room, connection = %session.connection.id, error = %err, "sandbox run failed");
        ServiceError::from(err)
    })?;

    match id {
        Some(_) => {
            let data = serde_json::to_value(&report)
                .inspect_err(|err| warn!(error = %err, "failed to serialize execution report"))
                .ok();
            session.reply(id, Ok(data));
        }
        None => {
            session.connection.send(&ServerMessage::ExecutionResult(report));
        }
    }

    if from_request {
        let _ = handle
            .request(&session.connection, None, RoomOp::MarkExecuted)
            .await;
    }
    Ok(())
}

/// Implicit leave of a connection whose transport went away.
pub async fn disconnect(state: &SharedState, session: &mut ConnectionSession) {
    session.leave_current().await;
    info!(
        connection = %session.connection.id,
        member = %session.connection.identity.member_id,
        "client disconnected"
    );
}

/// Serialize a payload into a text frame.
///
/// Serialization failures are a bug in the payload type; they are logged and yield `None`.
pub fn encode_message<T>(value: &T) -> Option<Message>
where
    T: ?Sized + serde::Serialize + std::fmt::Debug,
{
    match serde_json::to_string(value) {
        Ok(payload) => Some(Message::Text(payload.into())),
        Err(err) => {
            warn!(error = %err, "failed to serialize message `{value:?}` (permanent error, not retrying)");
            None
        }
    }
}

/// Serialize a payload and push it onto the provided WebSocket sender.
///
/// Returns `Ok(())` if the message was queued or if serialization failed (nothing to retry).
/// Returns `Err(ConnectionClosed)` if the writer channel is closed.
pub fn send_message_to_websocket<T>(
    tx: &mpsc::UnboundedSender<Message>,
    value: &T,
) -> Result<(), ConnectionClosed>
where
    T: ?Sized + serde::Serialize + std::fmt::Debug,
{
    let Some(message) = encode_message(value) else {
        return Ok(());
    };
    tx.send(message).map_err(|_| ConnectionClosed)
}

/// Ensure the writer task winds down before we return from the socket handler.
async fn finalize(writer_task: JoinHandle<()>, outbound_tx: mpsc::UnboundedSender<Message>) {
    drop(outbound_tx);
    let _ = writer_task.await;
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::SystemTime};

    use futures::future::BoxFuture;
    use serde_json::{Value, json};

    use super::*;
    use crate::{
        config::AppConfig,
        dao::{
            models::{MemberEntity, RoomEntity, SnapshotEntity},
            room_store::{RoomStore, memory::MemoryRoomStore},
        },
        dto::sandbox::{ExecutionReport, LanguageInfo, RunStatus},
        services::{
            identity::StaticIdentityVerifier,
            sandbox::{SandboxClient, SandboxError},
        },
        state::AppState,
    };

    /// Sandbox echoing the submitted code on stdout.
    struct EchoSandbox;

    impl SandboxClient for EchoSandbox {
        fn execute(
            &self,
            program: ExecutionSnapshot,
        ) -> BoxFuture<'static, Result<ExecutionReport, SandboxError>> {
            Box::pin(async move {
                Ok(ExecutionReport {
                    stdout: program.code,
                    status: RunStatus::Accepted,
                    status_description: "Accepted".into(),
                    error: None,
                    memory: None,
                    cpu_time: None,
                })
            })
        }

        fn languages(&self) -> Vec<LanguageInfo> {
            Vec::new()
        }

        fn is_enabled(&self) -> bool {
            true
        }
    }

    fn stored_room(id: &str, owner: &str, members: &[&str]) -> RoomEntity {
        RoomEntity {
            id: id.into(),
            name: format!("room {id}"),
            owner_id: owner.into(),
            members: members
                .iter()
                .map(|member| MemberEntity {
                    member_id: (*member).into(),
                    joined_at: SystemTime::now(),
                })
                .collect(),
            snapshot: SnapshotEntity::default(),
            messages: Vec::new(),
        }
    }

    async fn app(store: &MemoryRoomStore) -> SharedState {
        let state = AppState::new(
            AppConfig::default(),
            Arc::new(StaticIdentityVerifier::default()),
            Arc::new(EchoSandbox),
        );
        state.set_room_store(Arc::new(store.clone())).await;
        state
    }

    fn client(member: &str) -> (ConnectionSession, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = ClientConnection {
            id: Uuid::new_v4(),
            identity: Identity {
                member_id: member.into(),
                display_name: member.to_uppercase(),
            },
            tx,
        };
        (ConnectionSession::new(connection), rx)
    }

    async fn send(state: &SharedState, session: &mut ConnectionSession, frame: Value) {
        handle_frame(state, session, &frame.to_string()).await;
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let Message::Text(text) = message {
                frames.push(serde_json::from_str(&text).unwrap());
            }
        }
        frames
    }

    fn types(frames: &[Value]) -> Vec<&str> {
        frames
            .iter()
            .map(|frame| frame["type"].as_str().unwrap())
            .collect()
    }

    fn of_type(rx: &mut mpsc::UnboundedReceiver<Message>, kind: &str) -> Vec<Value> {
        drain(rx)
            .into_iter()
            .filter(|frame| frame["type"] == kind)
            .collect()
    }

    fn program(kind: &str, id: u64) -> Value {
        json!({
            "type": kind, "id": id, "room": "r1",
            "code": "console.log(40 + 2)", "language": "javascript", "input": ""
        })
    }

    fn vote(approved: bool) -> Value {
        json!({"type": "submit-vote", "room": "r1", "approved": approved})
    }

    #[tokio::test]
    async fn edits_reach_everyone_but_the_author() {
        let store = MemoryRoomStore::new();
        store.insert_room(stored_room("r1", "a", &["a", "b"]));
        let state = app(&store).await;
        let (mut a, mut a_rx) = client("a");
        let (mut b, mut b_rx) = client("b");

        send(&state, &mut a, json!({"type": "join-room", "id": 1, "room": "r1"})).await;
        send(&state, &mut b, json!({"type": "join-room", "id": 1, "room": "r1"})).await;
        drain(&mut a_rx);
        drain(&mut b_rx);

        send(
            &state,
            &mut a,
            json!({"type": "edit-code", "id": 2, "room": "r1", "code": "let x = 1;", "language": "rust"}),
        )
        .await;

        let a_frames = drain(&mut a_rx);
        assert_eq!(types(&a_frames), ["ack"]);
        assert_eq!(a_frames[0]["ok"], true);

        let b_frames = drain(&mut b_rx);
        assert_eq!(types(&b_frames), ["code-update"]);
        assert_eq!(b_frames[0]["code"], "let x = 1;");
    }

    #[tokio::test]
    async fn join_reply_precedes_later_broadcasts() {
        let store = MemoryRoomStore::new();
        store.insert_room(stored_room("r1", "a", &["a", "b"]));
        let state = app(&store).await;
        let (mut a, mut a_rx) = client("a");
        let (mut b, _b_rx) = client("b");

        send(&state, &mut a, json!({"type": "join-room", "id": 1, "room": "r1"})).await;
        send(&state, &mut b, json!({"type": "join-room", "room": "r1"})).await;

        let frames = drain(&mut a_rx);
        assert_eq!(types(&frames), ["ack", "participant-joined", "receive-message"]);
        assert_eq!(frames[0]["data"]["roomId"], "r1");
        assert_eq!(frames[1]["memberId"], "b");
        assert_eq!(frames[2]["body"], "B joined the room");
    }

    #[tokio::test]
    async fn joining_another_room_leaves_the_first() {
        let store = MemoryRoomStore::new();
        store.insert_room(stored_room("r1", "a", &["a", "b"]));
        store.insert_room(stored_room("r2", "a", &["a"]));
        let state = app(&store).await;
        let (mut a, _a_rx) = client("a");
        let (mut b, mut b_rx) = client("b");

        send(&state, &mut a, json!({"type": "join-room", "room": "r1"})).await;
        send(&state, &mut b, json!({"type": "join-room", "room": "r1"})).await;
        drain(&mut b_rx);

        send(&state, &mut a, json!({"type": "join-room", "room": "r2"})).await;
        assert_eq!(a.current_room(), Some("r2"));

        let frames = drain(&mut b_rx);
        assert_eq!(types(&frames), ["participant-left", "receive-message"]);
        assert_eq!(frames[0]["memberId"], "a");
    }

    #[tokio::test]
    async fn members_added_in_storage_can_join() {
        let store = MemoryRoomStore::new();
        store.insert_room(stored_room("r1", "a", &["a"]));
        let state = app(&store).await;
        let (mut a, _a_rx) = client("a");
        let (mut c, mut c_rx) = client("c");

        send(&state, &mut a, json!({"type": "join-room", "room": "r1"})).await;
        store.insert_room(stored_room("r1", "a", &["a", "c"]));

        send(&state, &mut c, json!({"type": "join-room", "id": 5, "room": "r1"})).await;
        let frames = drain(&mut c_rx);
        assert_eq!(types(&frames), ["ack"]);
        assert_eq!(frames[0]["ok"], true);
        assert_eq!(c.current_room(), Some("r1"));
    }

    #[tokio::test]
    async fn members_removed_in_storage_cannot_join() {
        let store = MemoryRoomStore::new();
        store.insert_room(stored_room("r1", "a", &["a", "b"]));
        let state = app(&store).await;
        let (mut a, mut a_rx) = client("a");
        let (mut b, mut b_rx) = client("b");

        send(&state, &mut a, json!({"type": "join-room", "room": "r1"})).await;
        store.insert_room(stored_room("r1", "a", &["a"]));

        send(&state, &mut b, json!({"type": "join-room", "id": 1, "room": "r1"})).await;
        let frames = drain(&mut b_rx);
        assert_eq!(types(&frames), ["ack"]);
        assert_eq!(frames[0]["error"]["code"], "not-a-member");
        assert_eq!(b.current_room(), None);
        assert!(of_type(&mut a_rx, "participant-joined").is_empty());
    }

    #[tokio::test]
    async fn rooms_deleted_in_storage_cannot_be_joined() {
        let store = MemoryRoomStore::new();
        store.insert_room(stored_room("r1", "a", &["a", "b"]));
        let state = app(&store).await;
        let (mut a, _a_rx) = client("a");
        let (mut b, mut b_rx) = client("b");

        send(&state, &mut a, json!({"type": "join-room", "room": "r1"})).await;
        store.delete_room("r1".into()).await.unwrap();

        send(&state, &mut b, json!({"type": "join-room", "id": 1, "room": "r1"})).await;
        let frames = drain(&mut b_rx);
        assert_eq!(types(&frames), ["ack"]);
        assert_eq!(frames[0]["error"]["code"], "room-not-found");
    }

    #[tokio::test]
    async fn empty_rooms_reload_from_storage() {
        let store = MemoryRoomStore::new();
        store.insert_room(stored_room("r1", "a", &["a", "b"]));
        let state = app(&store).await;
        let (mut a, _a_rx) = client("a");

        send(&state, &mut a, json!({"type": "join-room", "room": "r1"})).await;
        send(&state, &mut a, json!({"type": "send-message", "room": "r1", "body": "kept"})).await;
        send(
            &state,
            &mut a,
            json!({"type": "edit-code", "room": "r1", "code": "x = 1", "language": "python"}),
        )
        .await;
        send(&state, &mut a, json!({"type": "leave-room", "room": "r1"})).await;

        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while !state.registry().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let (mut b, mut b_rx) = client("b");
        send(&state, &mut b, json!({"type": "join-room", "id": 1, "room": "r1"})).await;
        let joined = &drain(&mut b_rx)[0]["data"];
        assert_eq!(joined["code"], "x = 1");
        let history = joined["messages"].as_array().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0]["body"], "kept");
    }

    #[tokio::test]
    async fn cursor_moves_are_relayed_to_the_others() {
        let store = MemoryRoomStore::new();
        store.insert_room(stored_room("r1", "a", &["a", "b"]));
        let state = app(&store).await;
        let (mut a, mut a_rx) = client("a");
        let (mut b, mut b_rx) = client("b");
        let cursor = json!({
            "type": "cursor-move", "room": "r1", "position": {"lineNumber": 2, "column": 7}
        });

        send(&state, &mut a, cursor.clone()).await;
        assert_eq!(drain(&mut a_rx)[0]["error"]["code"], "not-active");

        send(&state, &mut a, json!({"type": "join-room", "room": "r1"})).await;
        send(&state, &mut b, json!({"type": "join-room", "room": "r1"})).await;
        drain(&mut a_rx);
        drain(&mut b_rx);

        send(&state, &mut a, cursor).await;
        assert!(drain(&mut a_rx).is_empty());
        let frames = drain(&mut b_rx);
        assert_eq!(types(&frames), ["cursor-update"]);
        assert_eq!(frames[0]["memberId"], "a");
        assert_eq!(frames[0]["displayName"], "A");
        assert_eq!(frames[0]["position"], json!({"lineNumber": 2, "column": 7}));
    }

    #[tokio::test]
    async fn strangers_are_refused() {
        let store = MemoryRoomStore::new();
        store.insert_room(stored_room("r1", "a", &["a"]));
        let state = app(&store).await;
        let (mut z, mut z_rx) = client("z");

        send(&state, &mut z, json!({"type": "join-room", "id": 1, "room": "r1"})).await;
        send(&state, &mut z, json!({"type": "join-room", "room": "ghost"})).await;

        let frames = drain(&mut z_rx);
        assert_eq!(types(&frames), ["ack", "error"]);
        assert_eq!(frames[0]["error"]["code"], "not-a-member");
        assert_eq!(frames[1]["code"], "room-not-found");
        assert_eq!(z.current_room(), None);
    }

    #[tokio::test]
    async fn operations_require_joining_first() {
        let store = MemoryRoomStore::new();
        store.insert_room(stored_room("r1", "a", &["a", "b"]));
        let state = app(&store).await;
        let (mut a, _a_rx) = client("a");
        let (mut b, mut b_rx) = client("b");

        send(&state, &mut b, json!({"type": "send-message", "id": 1, "room": "r1", "body": "hi"})).await;
        send(&state, &mut a, json!({"type": "join-room", "room": "r1"})).await;
        send(&state, &mut b, json!({"type": "send-message", "id": 2, "room": "r1", "body": "hi"})).await;

        let frames = drain(&mut b_rx);
        assert_eq!(frames[0]["error"]["code"], "not-active");
        assert_eq!(frames[1]["error"]["code"], "not-active");
    }

    #[tokio::test]
    async fn malformed_and_invalid_frames_stay_with_the_sender() {
        let store = MemoryRoomStore::new();
        let state = app(&store).await;
        let (mut a, mut a_rx) = client("a");

        handle_frame(&state, &mut a, "{not json").await;
        handle_frame(&state, &mut a, r#"{"type": "join-room", "id": 9}"#).await;
        send(&state, &mut a, json!({"type": "send-message", "id": 3, "room": "r1", "body": ""})).await;
        send(&state, &mut a, json!({"type": "authenticate", "id": 4, "token": "again"})).await;

        let frames = drain(&mut a_rx);
        assert_eq!(types(&frames), ["error", "ack", "ack", "ack"]);
        assert_eq!(frames[0]["code"], "invalid-input");
        assert_eq!(frames[1]["id"], 9);
        for frame in &frames[1..] {
            assert_eq!(frame["error"]["code"], "invalid-input");
        }
    }

    #[tokio::test]
    async fn lone_participant_runs_directly() {
        let store = MemoryRoomStore::new();
        store.insert_room(stored_room("r1", "a", &["a", "b"]));
        let state = app(&store).await;
        let (mut a, mut a_rx) = client("a");

        send(&state, &mut a, json!({"type": "join-room", "room": "r1"})).await;
        let program = json!({"room": "r1", "code": "print(1)", "language": "python"});

        let mut request = program.clone();
        request["type"] = "request-execution".into();
        request["id"] = 1.into();
        send(&state, &mut a, request).await;

        let mut run = program;
        run["type"] = "run-execution".into();
        send(&state, &mut a, run).await;

        let frames = drain(&mut a_rx);
        assert_eq!(types(&frames), ["ack", "execution-result"]);
        assert_eq!(frames[0]["data"]["executeDirectly"], true);
        assert_eq!(frames[1]["stdout"], "print(1)");
    }

    #[tokio::test]
    async fn approved_program_runs_once_then_closes_the_request() {
        let store = MemoryRoomStore::new();
        store.insert_room(stored_room("r1", "a", &["a", "b"]));
        let state = app(&store).await;
        let (mut a, mut a_rx) = client("a");
        let (mut b, mut b_rx) = client("b");

        send(&state, &mut a, json!({"type": "join-room", "room": "r1"})).await;
        send(&state, &mut b, json!({"type": "join-room", "room": "r1"})).await;
        send(
            &state,
            &mut a,
            json!({"type": "request-execution", "id": 1, "room": "r1", "code": "approved", "language": "python"}),
        )
        .await;

        send(
            &state,
            &mut a,
            json!({"type": "run-execution", "id": 2, "room": "r1", "code": "approved", "language": "python"}),
        )
        .await;
        send(&state, &mut b, json!({"type": "submit-vote", "id": 1, "room": "r1", "approved": true})).await;
        drain(&mut a_rx);
        drain(&mut b_rx);

        send(
            &state,
            &mut a,
            json!({"type": "run-execution", "id": 3, "room": "r1", "code": "tampered", "language": "python"}),
        )
        .await;
        let frames = drain(&mut a_rx);
        assert_eq!(types(&frames), ["ack"]);
        assert_eq!(frames[0]["data"]["stdout"], "approved");

        send(
            &state,
            &mut a,
            json!({"type": "run-execution", "id": 4, "room": "r1", "code": "approved", "language": "python"}),
        )
        .await;
        let frames = drain(&mut a_rx);
        assert_eq!(frames[0]["error"]["code"], "execution-not-approved");
    }

    #[tokio::test]
    async fn unapproved_runs_are_refused() {
        let store = MemoryRoomStore::new();
        store.insert_room(stored_room("r1", "a", &["a", "b"]));
        let state = app(&store).await;
        let (mut a, mut a_rx) = client("a");
        let (mut b, _b_rx) = client("b");

        send(&state, &mut a, json!({"type": "join-room", "room": "r1"})).await;
        send(&state, &mut b, json!({"type": "join-room", "room": "r1"})).await;
        send(
            &state,
            &mut a,
            json!({"type": "run-execution", "id": 1, "room": "r1", "code": "x", "language": "python"}),
        )
        .await;

        let frames = drain(&mut a_rx);
        assert_eq!(types(&frames), ["ack"]);
        assert_eq!(frames[0]["error"]["code"], "execution-not-approved");
    }

    #[tokio::test]
    async fn owner_ends_the_room_for_everyone() {
        let store = MemoryRoomStore::new();
        store.insert_room(stored_room("r1", "a", &["a", "b"]));
        let state = app(&store).await;
        let (mut a, mut a_rx) = client("a");
        let (mut b, mut b_rx) = client("b");

        send(&state, &mut a, json!({"type": "join-room", "room": "r1"})).await;
        send(&state, &mut b, json!({"type": "join-room", "room": "r1"})).await;
        drain(&mut a_rx);
        drain(&mut b_rx);

        send(&state, &mut b, json!({"type": "end-room", "id": 1, "room": "r1"})).await;
        assert_eq!(drain(&mut b_rx)[0]["error"]["code"], "not-owner");

        send(&state, &mut a, json!({"type": "end-room", "id": 2, "room": "r1"})).await;
        assert_eq!(types(&drain(&mut a_rx)), ["ack", "room-ended"]);
        assert_eq!(types(&drain(&mut b_rx)), ["room-ended"]);
        assert_eq!(a.current_room(), None);

        send(&state, &mut b, json!({"type": "send-message", "id": 3, "room": "r1", "body": "hello?"})).await;
        assert_eq!(drain(&mut b_rx)[0]["error"]["code"], "room-not-found");

        send(&state, &mut a, json!({"type": "join-room", "id": 4, "room": "r1"})).await;
        assert_eq!(drain(&mut a_rx)[0]["error"]["code"], "room-not-found");
    }

    #[tokio::test]
    async fn disconnect_leaves_the_room() {
        let store = MemoryRoomStore::new();
        store.insert_room(stored_room("r1", "a", &["a", "b"]));
        let state = app(&store).await;
        let (mut a, _a_rx) = client("a");
        let (mut b, mut b_rx) = client("b");

        send(&state, &mut a, json!({"type": "join-room", "room": "r1"})).await;
        send(&state, &mut b, json!({"type": "join-room", "room": "r1"})).await;
        drain(&mut b_rx);

        disconnect(&state, &mut a).await;

        let frames = drain(&mut b_rx);
        assert_eq!(types(&frames), ["participant-left", "receive-message"]);
        let remaining = frames[0]["activeParticipants"].as_array().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0]["memberId"], "b");
    }

    #[tokio::test]
    async fn progress_then_veto() {
        let store = MemoryRoomStore::new();
        store.insert_room(stored_room("r1", "a", &["a", "b", "c"]));
        let state = app(&store).await;
        let (mut a, mut a_rx) = client("a");
        let (mut b, mut b_rx) = client("b");
        let (mut c, mut c_rx) = client("c");
        for session in [&mut a, &mut b, &mut c] {
            send(&state, session, json!({"type": "join-room", "room": "r1"})).await;
        }
        drain(&mut a_rx);
        drain(&mut b_rx);

        send(&state, &mut a, program("request-execution", 1)).await;
        assert_eq!(drain(&mut a_rx)[0]["data"]["pendingTotalVoters"], 2);
        assert_eq!(of_type(&mut b_rx, "execution-requested").len(), 1);
        assert_eq!(of_type(&mut c_rx, "execution-requested").len(), 1);

        send(&state, &mut b, vote(true)).await;
        let progress = of_type(&mut a_rx, "execution-approval-progress");
        assert_eq!(progress[0]["approvedCount"], 1);
        assert_eq!(progress[0]["totalVoters"], 2);

        send(&state, &mut c, vote(false)).await;
        let rejected = of_type(&mut a_rx, "execution-rejected");
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0]["rejectedById"], "c");
        assert_eq!(rejected[0]["rejectedByName"], "C");

        drain(&mut b_rx);
        send(&state, &mut b, json!({"type": "submit-vote", "id": 9, "room": "r1", "approved": true})).await;
        assert_eq!(drain(&mut b_rx)[0]["error"]["code"], "no-pending-request");
    }

    #[tokio::test]
    async fn concurrent_approvals_approve_exactly_once() {
        let store = MemoryRoomStore::new();
        store.insert_room(stored_room("r1", "a", &["a", "b", "c"]));
        let state = app(&store).await;
        let (mut a, mut a_rx) = client("a");
        let (mut b, _b_rx) = client("b");
        let (mut c, _c_rx) = client("c");
        for session in [&mut a, &mut b, &mut c] {
            send(&state, session, json!({"type": "join-room", "room": "r1"})).await;
        }

        send(&state, &mut a, program("request-execution", 1)).await;
        drain(&mut a_rx);

        tokio::join!(send(&state, &mut b, vote(true)), send(&state, &mut c, vote(true)));

        let approved = of_type(&mut a_rx, "execution-approved");
        assert_eq!(approved.len(), 1);
        assert_eq!(approved[0]["code"], "console.log(40 + 2)");
    }

    #[tokio::test]
    async fn second_vote_is_refused() {
        let store = MemoryRoomStore::new();
        store.insert_room(stored_room("r1", "a", &["a", "b", "c"]));
        let state = app(&store).await;
        let (mut a, mut a_rx) = client("a");
        let (mut b, mut b_rx) = client("b");
        let (mut c, _c_rx) = client("c");
        for session in [&mut a, &mut b, &mut c] {
            send(&state, session, json!({"type": "join-room", "room": "r1"})).await;
        }

        send(&state, &mut a, program("request-execution", 1)).await;
        send(&state, &mut b, vote(true)).await;
        drain(&mut b_rx);
        send(&state, &mut b, json!({"type": "submit-vote", "id": 2, "room": "r1", "approved": false})).await;
        assert_eq!(drain(&mut b_rx)[0]["error"]["code"], "already-voted");

        drain(&mut a_rx);
        send(&state, &mut a, json!({"type": "submit-vote", "id": 3, "room": "r1", "approved": true})).await;
        assert_eq!(of_type(&mut a_rx, "ack")[0]["error"]["code"], "not-a-voter");
    }

    #[tokio::test]
    async fn disconnect_mid_vote_drops_the_voter() {
        let store = MemoryRoomStore::new();
        store.insert_room(stored_room("r1", "a", &["a", "b", "c"]));
        let state = app(&store).await;
        let (mut a, mut a_rx) = client("a");
        let (mut b, _b_rx) = client("b");
        let (mut c, _c_rx) = client("c");
        for session in [&mut a, &mut b, &mut c] {
            send(&state, session, json!({"type": "join-room", "room": "r1"})).await;
        }

        send(&state, &mut a, program("request-execution", 1)).await;
        drain(&mut a_rx);

        disconnect(&state, &mut c).await;
        let left = of_type(&mut a_rx, "participant-left");
        assert_eq!(left.len(), 1);
        let listed: Vec<&str> = left[0]["activeParticipants"]
            .as_array()
            .unwrap()
            .iter()
            .map(|participant| participant["memberId"].as_str().unwrap())
            .collect();
        assert_eq!(listed, ["a", "b"]);

        send(&state, &mut b, vote(true)).await;
        assert_eq!(of_type(&mut a_rx, "execution-approved").len(), 1);
    }

    #[tokio::test]
    async fn requester_leaving_cancels_the_request() {
        let store = MemoryRoomStore::new();
        store.insert_room(stored_room("r1", "a", &["a", "b"]));
        let state = app(&store).await;
        let (mut a, _a_rx) = client("a");
        let (mut b, mut b_rx) = client("b");
        send(&state, &mut a, json!({"type": "join-room", "room": "r1"})).await;
        send(&state, &mut b, json!({"type": "join-room", "room": "r1"})).await;

        send(&state, &mut a, program("request-execution", 1)).await;
        drain(&mut b_rx);
        send(&state, &mut a, json!({"type": "leave-room", "room": "r1"})).await;

        let cancelled = of_type(&mut b_rx, "execution-cancelled");
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0]["reason"], "requester-left");
    }

    #[tokio::test]
    async fn chat_keeps_the_newest_messages() {
        let store = MemoryRoomStore::new();
        store.insert_room(stored_room("r1", "a", &["a", "b", "c"]));
        let state = app(&store).await;
        let (mut a, mut a_rx) = client("a");
        send(&state, &mut a, json!({"type": "join-room", "room": "r1"})).await;

        for n in 1..=501 {
            send(
                &state,
                &mut a,
                json!({"type": "send-message", "room": "r1", "body": format!("message {n}")}),
            )
            .await;
        }
        let received = of_type(&mut a_rx, "receive-message");
        assert_eq!(received.len(), 501);
        assert_eq!(received[0]["authorId"], "a");

        // Presence notices are broadcast but never take a slot in the history.
        for _ in 0..20 {
            let (mut b, _b_rx) = client("b");
            send(&state, &mut b, json!({"type": "join-room", "room": "r1"})).await;
            send(&state, &mut b, json!({"type": "leave-room", "room": "r1"})).await;
        }

        let (mut c, mut c_rx) = client("c");
        send(&state, &mut c, json!({"type": "join-room", "id": 1, "room": "r1"})).await;
        let joined = &drain(&mut c_rx)[0]["data"];
        let history = joined["messages"].as_array().unwrap();
        assert_eq!(history.len(), 500);
        assert_eq!(history[0]["body"], "message 2");
        assert_eq!(history[499]["body"], "message 501");
        assert!(history.iter().all(|message| message["kind"] == "message"));
    }

    #[tokio::test]
    async fn late_joiner_sees_the_latest_buffers() {
        let store = MemoryRoomStore::new();
        store.insert_room(stored_room("r1", "a", &["a", "b"]));
        let state = app(&store).await;
        let (mut a, _a_rx) = client("a");
        send(&state, &mut a, json!({"type": "join-room", "room": "r1"})).await;

        let code = "def f(x):\n\treturn x  # ünïcode ✓\n";
        for draft in ["draft 1", "draft 2", code] {
            send(
                &state,
                &mut a,
                json!({"type": "edit-code", "room": "r1", "code": draft, "language": "python"}),
            )
            .await;
        }
        send(&state, &mut a, json!({"type": "edit-input", "room": "r1", "input": "3\n"})).await;
        send(
            &state,
            &mut a,
            json!({"type": "edit-output", "room": "r1", "output": "3", "showOutput": true}),
        )
        .await;

        let (mut b, mut b_rx) = client("b");
        send(&state, &mut b, json!({"type": "join-room", "id": 1, "room": "r1"})).await;
        let joined = &drain(&mut b_rx)[0]["data"];
        assert_eq!(joined["code"], code);
        assert_eq!(joined["language"], "python");
        assert_eq!(joined["input"], "3\n");
        assert_eq!(joined["output"], "3");
        assert_eq!(joined["showOutput"], true);
    }
}
