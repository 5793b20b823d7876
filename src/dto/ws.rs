use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::{Validate, ValidationErrors};

use crate::{
    dto::{
        room::{
            ApprovalProgressEvent, ChatMessageDto, CodeUpdateEvent, CursorPosition,
            CursorUpdateEvent, ExecutionApprovedEvent, ExecutionCancelledEvent,
            ExecutionRejectedEvent, ExecutionRequestedEvent, InputUpdateEvent, OutputUpdateEvent,
            PresenceEvent, RoomEndedEvent,
        },
        sandbox::ExecutionReport,
        validation::{validate_not_blank, validate_room_id},
    },
    error::ServiceError,
};

/// Frame received from a client: an optional correlation id plus the event itself.
#[derive(Debug, Deserialize)]
pub struct ClientFrame {
    /// Echoed in the acknowledgement when present.
    #[serde(default)]
    pub id: Option<u64>,
    /// Event and its payload.
    #[serde(flatten)]
    pub event: ClientEvent,
}

#[derive(Debug, Deserialize, ToSchema)]
/// Events accepted from room clients.
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Bearer token; must be the first frame.
    Authenticate(AuthenticatePayload),
    /// Enter a room, leaving the current one.
    JoinRoom(RoomPayload),
    /// Leave a room.
    LeaveRoom(RoomPayload),
    /// Post a chat message.
    SendMessage(SendMessagePayload),
    /// Replace the shared code buffer.
    EditCode(EditCodePayload),
    /// Replace the program input pane.
    EditInput(EditInputPayload),
    /// Replace the program output pane.
    EditOutput(EditOutputPayload),
    /// Share the caller's cursor position.
    CursorMove(CursorMovePayload),
    /// Ask the others to approve a run.
    RequestExecution(ExecutionPayload),
    /// Approve or veto the pending request.
    SubmitVote(VotePayload),
    /// Withdraw the caller's request.
    CancelExecution(RoomPayload),
    /// Close the caller's approved request.
    MarkExecuted(RoomPayload),
    /// Run the authorized program in the sandbox.
    RunExecution(ExecutionPayload),
    /// End the room for everyone (owner only).
    EndRoom(RoomPayload),
    /// Any unrecognized `type`.
    #[serde(other)]
    Unknown,
}

impl ClientEvent {
    /// Wire name of the event, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Authenticate(_) => "authenticate",
            Self::JoinRoom(_) => "join-room",
            Self::LeaveRoom(_) => "leave-room",
            Self::SendMessage(_) => "send-message",
            Self::EditCode(_) => "edit-code",
            Self::EditInput(_) => "edit-input",
            Self::EditOutput(_) => "edit-output",
            Self::CursorMove(_) => "cursor-move",
            Self::RequestExecution(_) => "request-execution",
            Self::SubmitVote(_) => "submit-vote",
            Self::CancelExecution(_) => "cancel-execution",
            Self::MarkExecuted(_) => "mark-executed",
            Self::RunExecution(_) => "run-execution",
            Self::EndRoom(_) => "end-room",
            Self::Unknown => "unknown",
        }
    }

    /// Check the payload constraints of the event.
    pub fn validate(&self) -> Result<(), ServiceError> {
        let result: Result<(), ValidationErrors> = match self {
            Self::Authenticate(payload) => payload.validate(),
            Self::JoinRoom(payload)
            | Self::LeaveRoom(payload)
            | Self::CancelExecution(payload)
            | Self::MarkExecuted(payload)
            | Self::EndRoom(payload) => payload.validate(),
            Self::SendMessage(payload) => payload.validate(),
            Self::EditCode(payload) => payload.validate(),
            Self::EditInput(payload) => payload.validate(),
            Self::EditOutput(payload) => payload.validate(),
            Self::CursorMove(payload) => payload.validate(),
            Self::RequestExecution(payload) | Self::RunExecution(payload) => payload.validate(),
            Self::SubmitVote(payload) => payload.validate(),
            Self::Unknown => {
                return Err(ServiceError::InvalidInput("unknown event type".into()));
            }
        };
        result.map_err(Into::into)
    }
}

#[derive(Debug, Deserialize, ToSchema, Validate)]
/// First frame of every connection.
pub struct AuthenticatePayload {
    /// Token checked by the identity service.
    #[validate(length(min = 1))]
    pub token: String,
}

#[derive(Debug, Deserialize, ToSchema, Validate)]
/// Payload naming only the target room.
pub struct RoomPayload {
    /// Target room.
    #[validate(custom(function = "validate_room_id"))]
    pub room: String,
}

#[derive(Debug, Deserialize, ToSchema, Validate)]
/// Chat message sent by a participant.
pub struct SendMessagePayload {
    /// Target room.
    #[validate(custom(function = "validate_room_id"))]
    pub room: String,
    /// Message text.
    #[validate(
        length(min = 1, max = 2000),
        custom(function = "validate_not_blank")
    )]
    pub body: String,
}

#[derive(Debug, Deserialize, ToSchema, Validate)]
/// New contents of the shared code buffer.
pub struct EditCodePayload {
    /// Target room.
    #[validate(custom(function = "validate_room_id"))]
    pub room: String,
    /// Whole buffer.
    #[validate(length(max = 200000))]
    pub code: String,
    /// Language tag of the buffer.
    #[validate(length(min = 1, max = 32))]
    pub language: String,
}

#[derive(Debug, Deserialize, ToSchema, Validate)]
/// New contents of the program input pane.
pub struct EditInputPayload {
    /// Target room.
    #[validate(custom(function = "validate_room_id"))]
    pub room: String,
    /// Whole input pane.
    #[validate(length(max = 200000))]
    pub input: String,
}

#[derive(Debug, Deserialize, ToSchema, Validate)]
#[serde(rename_all = "camelCase")]
/// New contents and visibility of the program output pane.
pub struct EditOutputPayload {
    /// Target room.
    #[validate(custom(function = "validate_room_id"))]
    pub room: String,
    /// Whole output pane.
    #[validate(length(max = 200000))]
    pub output: String,
    /// Whether the pane is shown.
    pub show_output: bool,
}

#[derive(Debug, Deserialize, ToSchema, Validate)]
/// Cursor position of a participant, relayed to the others and never stored.
pub struct CursorMovePayload {
    /// Target room.
    #[validate(custom(function = "validate_room_id"))]
    pub room: String,
    /// Position in the shared buffer.
    #[validate(nested)]
    pub position: CursorPosition,
}

#[derive(Debug, Deserialize, ToSchema, Validate)]
/// Program a participant wants to run.
pub struct ExecutionPayload {
    /// Target room.
    #[validate(custom(function = "validate_room_id"))]
    pub room: String,
    /// Program source.
    #[validate(length(max = 200000))]
    pub code: String,
    /// Sandbox language tag.
    #[validate(length(min = 1, max = 32))]
    pub language: String,
    /// Standard input, empty when omitted.
    #[serde(default)]
    #[validate(length(max = 200000))]
    pub input: String,
}

#[derive(Debug, Deserialize, ToSchema, Validate)]
/// Decision on the pending execution request.
pub struct VotePayload {
    /// Target room.
    #[validate(custom(function = "validate_room_id"))]
    pub room: String,
    /// `true` approves, `false` vetoes.
    pub approved: bool,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
/// Identity attached to the connection after authentication.
#[serde(rename_all = "camelCase")]
pub struct ConnectedEvent {
    /// Authenticated member.
    pub member_id: String,
    /// Name shown to the others.
    pub display_name: String,
    /// Identifier of this socket.
    pub connection_id: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
/// Machine readable error.
pub struct ErrorBody {
    /// Stable kebab-case identifier.
    pub code: String,
    /// Human readable description.
    pub message: String,
}

impl From<&ServiceError> for ErrorBody {
    fn from(err: &ServiceError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
/// Answer to a client frame that carried an `id`.
pub struct AckFrame {
    /// Correlation id of the answered frame.
    pub id: u64,
    /// Whether the operation was applied.
    pub ok: bool,
    /// Operation result, when it has one.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub data: Option<serde_json::Value>,
    /// Why the operation was refused.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
/// Messages pushed to room clients.
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Authentication succeeded.
    Connected(ConnectedEvent),
    /// Answer to a frame carrying an `id`.
    Ack(AckFrame),
    /// Failure of a frame sent without an `id`.
    Error(ErrorBody),
    /// Someone entered the room.
    ParticipantJoined(PresenceEvent),
    /// Someone left the room.
    ParticipantLeft(PresenceEvent),
    /// Code buffer replaced.
    CodeUpdate(CodeUpdateEvent),
    /// Input pane replaced.
    InputUpdate(InputUpdateEvent),
    /// Output pane replaced.
    OutputUpdate(OutputUpdateEvent),
    /// Another participant moved their cursor.
    CursorUpdate(CursorUpdateEvent),
    /// Chat message or presence notice.
    ReceiveMessage(ChatMessageDto),
    /// A run awaits the caller's vote.
    ExecutionRequested(ExecutionRequestedEvent),
    /// Every voter approved.
    ExecutionApproved(ExecutionApprovedEvent),
    /// A voter vetoed.
    ExecutionRejected(ExecutionRejectedEvent),
    /// Approval tally changed.
    ExecutionApprovalProgress(ApprovalProgressEvent),
    /// Request withdrawn, abandoned or expired.
    ExecutionCancelled(ExecutionCancelledEvent),
    /// The owner ended the room.
    RoomEnded(RoomEndedEvent),
    /// Sandbox report for a `run-execution` frame sent without an id.
    ExecutionResult(ExecutionReport),
}

impl ServerMessage {
    /// Answer to a frame: an ack when the client supplied an `id`, otherwise an `error` event on
    /// failure and nothing on success.
    pub fn reply(
        id: Option<u64>,
        result: Result<Option<serde_json::Value>, &ServiceError>,
    ) -> Option<Self> {
        match (id, result) {
            (Some(id), Ok(data)) => Some(Self::Ack(AckFrame {
                id,
                ok: true,
                data,
                error: None,
            })),
            (Some(id), Err(err)) => Some(Self::Ack(AckFrame {
                id,
                ok: false,
                data: None,
                error: Some(err.into()),
            })),
            (None, Ok(_)) => None,
            (None, Err(err)) => Some(Self::Error(err.into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn parse(value: serde_json::Value) -> ClientFrame {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn frames_carry_optional_correlation_id() {
        let frame = parse(json!({"type": "join-room", "id": 7, "room": "r1"}));
        assert_eq!(frame.id, Some(7));
        assert!(matches!(frame.event, ClientEvent::JoinRoom(RoomPayload { ref room }) if room == "r1"));

        let frame = parse(json!({"type": "leave-room", "room": "r1"}));
        assert_eq!(frame.id, None);
    }

    #[test]
    fn camel_case_payload_fields() {
        let frame = parse(json!({
            "type": "edit-output", "room": "r1", "output": "42", "showOutput": true
        }));
        match frame.event {
            ClientEvent::EditOutput(payload) => assert!(payload.show_output),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn unknown_event_types_are_tolerated() {
        let frame = parse(json!({"type": "dance", "id": 1, "style": "tango"}));
        assert!(matches!(frame.event, ClientEvent::Unknown));
        assert_eq!(
            frame.event.validate().unwrap_err().code(),
            "invalid-input"
        );
    }

    #[test]
    fn cursor_positions_start_at_one() {
        let ok = parse(json!({
            "type": "cursor-move", "room": "r1", "position": {"lineNumber": 3, "column": 1}
        }));
        assert_eq!(ok.event.name(), "cursor-move");
        assert!(ok.event.validate().is_ok());

        let zero = parse(json!({
            "type": "cursor-move", "room": "r1", "position": {"lineNumber": 0, "column": 1}
        }));
        assert!(zero.event.validate().is_err());
    }

    #[test]
    fn message_bodies_are_bounded() {
        let ok = parse(json!({"type": "send-message", "room": "r1", "body": "x".repeat(2000)}));
        assert!(ok.event.validate().is_ok());

        let long = parse(json!({"type": "send-message", "room": "r1", "body": "x".repeat(2001)}));
        assert!(long.event.validate().is_err());

        let blank = parse(json!({"type": "send-message", "room": "r1", "body": "   "}));
        assert!(blank.event.validate().is_err());
    }

    #[test]
    fn server_messages_are_tagged_in_kebab_case() {
        let message = ServerMessage::ExecutionApprovalProgress(ApprovalProgressEvent {
            room_id: "r1".into(),
            request_id: "q".into(),
            approved_count: 1,
            total_voters: 2,
        });
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "execution-approval-progress");
        assert_eq!(value["approvedCount"], 1);
        assert_eq!(value["totalVoters"], 2);
    }

    #[test]
    fn replies_without_id_only_report_errors() {
        assert!(ServerMessage::reply(None, Ok(None)).is_none());

        let err = ServiceError::NotAVoter;
        let value = serde_json::to_value(ServerMessage::reply(None, Err(&err))).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["code"], "not-a-voter");

        let value = serde_json::to_value(ServerMessage::reply(Some(3), Err(&err))).unwrap();
        assert_eq!(value["type"], "ack");
        assert_eq!(value["id"], 3);
        assert_eq!(value["ok"], false);
        assert_eq!(value["error"]["code"], "not-a-voter");
    }
}
