use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

use crate::{
    dto::format_system_time,
    state::{
        chat::{ChatKind, ChatMessage},
        execution::ExecutionRequest,
        presence::ActiveParticipant,
    },
};

/// Connection currently present in a room.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantSummary {
    /// Member behind the connection.
    pub member_id: String,
    /// Socket identifier; a member may hold several.
    pub connection_id: String,
    /// Name shown to the others.
    pub display_name: String,
    /// RFC 3339 timestamp.
    pub joined_at: String,
}

impl From<&ActiveParticipant> for ParticipantSummary {
    fn from(value: &ActiveParticipant) -> Self {
        Self {
            member_id: value.member_id.clone(),
            connection_id: value.connection_id.to_string(),
            display_name: value.display_name.clone(),
            joined_at: format_system_time(value.joined_at),
        }
    }
}

/// Kind of a chat entry on the wire.
#[derive(Debug, Clone, Copy, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ChatKindDto {
    /// Typed by a participant.
    Message,
    /// Join/leave notice, never part of the history.
    System,
}

/// Chat entry as broadcast and replayed to clients.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessageDto {
    /// Message identifier.
    pub id: String,
    /// Member who sent it, or who joined or left.
    pub author_id: String,
    /// Display name of the author.
    pub author_name: String,
    /// Message text.
    pub body: String,
    /// Message kind.
    pub kind: ChatKindDto,
    /// RFC 3339 timestamp.
    pub timestamp: String,
}

impl From<&ChatMessage> for ChatMessageDto {
    fn from(value: &ChatMessage) -> Self {
        Self {
            id: value.id.to_string(),
            author_id: value.author_id.clone(),
            author_name: value.author_name.clone(),
            body: value.body.clone(),
            kind: match value.kind {
                ChatKind::Message => ChatKindDto::Message,
                ChatKind::System => ChatKindDto::System,
            },
            timestamp: format_system_time(value.sent_at),
        }
    }
}

/// Everything a newly joined connection needs to render the room.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomResponse {
    /// Room identifier.
    pub room_id: String,
    /// Room title.
    pub room_name: String,
    /// Member allowed to end the room.
    pub owner_id: String,
    /// Connections present, the caller included.
    pub active_participants: Vec<ParticipantSummary>,
    /// Shared code buffer.
    pub code: String,
    /// Language of the code buffer.
    pub language: String,
    /// Program input pane.
    pub input: String,
    /// Program output pane.
    pub output: String,
    /// Whether the output pane is shown.
    pub show_output: bool,
    /// Full chat history, oldest first.
    pub messages: Vec<ChatMessageDto>,
    /// Execution request in progress when the caller joined, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_execution: Option<ExecutionRequestedEvent>,
}

/// Reply to `request-execution`.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RequestExecutionResponse {
    /// `true` when nobody else is present and the caller may run right away.
    pub execute_directly: bool,
    /// Identifier of the opened request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Number of approvals needed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_total_voters: Option<usize>,
}

/// Broadcast when a connection joins or leaves.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEvent {
    /// Room identifier.
    pub room_id: String,
    /// Member who joined or left.
    pub member_id: String,
    /// Display name of that member.
    pub display_name: String,
    /// Connections present after the change.
    pub active_participants: Vec<ParticipantSummary>,
}

/// Sent to every other participant after a code edit.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CodeUpdateEvent {
    /// Room identifier.
    pub room_id: String,
    /// Whole buffer.
    pub code: String,
    /// Language of the buffer.
    pub language: String,
    /// Member who edited it.
    pub updated_by: String,
}

/// Sent to every other participant after a program input edit.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InputUpdateEvent {
    /// Room identifier.
    pub room_id: String,
    /// Whole input pane.
    pub input: String,
    /// Member who edited it.
    pub updated_by: String,
}

/// Sent to every participant after a program output change.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OutputUpdateEvent {
    /// Room identifier.
    pub room_id: String,
    /// Whole output pane.
    pub output: String,
    /// Whether the pane is shown.
    pub show_output: bool,
    /// Member who changed it.
    pub updated_by: String,
}

/// Line and column in the shared buffer, both starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CursorPosition {
    /// Line number.
    #[validate(range(min = 1))]
    pub line_number: u32,
    /// Column.
    #[validate(range(min = 1))]
    pub column: u32,
}

/// Sent to every other participant when someone moves their cursor.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CursorUpdateEvent {
    /// Room identifier.
    pub room_id: String,
    /// Member who moved.
    pub member_id: String,
    /// Display name of that member.
    pub display_name: String,
    /// New position.
    pub position: CursorPosition,
}

/// Sent to required voters when a request is opened.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequestedEvent {
    /// Room identifier.
    pub room_id: String,
    /// Request identifier.
    pub request_id: String,
    /// Member asking to run.
    pub requester_id: String,
    /// Display name of the requester.
    pub requester_name: String,
    /// Program source.
    pub code: String,
    /// Sandbox language tag.
    pub language: String,
    /// Standard input.
    pub input: String,
    /// Approvals so far.
    pub approved_count: usize,
    /// Approvals needed.
    pub total_voters: usize,
    /// RFC 3339 timestamp.
    pub created_at: String,
}

impl ExecutionRequestedEvent {
    /// Describe `request` as opened in `room_id`.
    pub fn new(room_id: &str, request: &ExecutionRequest) -> Self {
        Self {
            room_id: room_id.to_string(),
            request_id: request.id.to_string(),
            requester_id: request.requester_id.clone(),
            requester_name: request.requester_name.clone(),
            code: request.snapshot.code.clone(),
            language: request.snapshot.language.clone(),
            input: request.snapshot.input.clone(),
            approved_count: request.approved_count(),
            total_voters: request.total_voters(),
            created_at: format_system_time(request.created_at),
        }
    }
}

/// Broadcast when every required voter approved.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionApprovedEvent {
    /// Room identifier.
    pub room_id: String,
    /// Request identifier.
    pub request_id: String,
    /// Member allowed to run it.
    pub requester_id: String,
    /// Program as captured when the request was opened.
    pub code: String,
    /// Sandbox language tag.
    pub language: String,
    /// Standard input.
    pub input: String,
}

impl ExecutionApprovedEvent {
    /// Describe the approval of `request`.
    pub fn new(room_id: &str, request: &ExecutionRequest) -> Self {
        Self {
            room_id: room_id.to_string(),
            request_id: request.id.to_string(),
            requester_id: request.requester_id.clone(),
            code: request.snapshot.code.clone(),
            language: request.snapshot.language.clone(),
            input: request.snapshot.input.clone(),
        }
    }
}

/// Broadcast when a voter vetoes the request.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRejectedEvent {
    /// Room identifier.
    pub room_id: String,
    /// Request identifier.
    pub request_id: String,
    /// Member who vetoed.
    pub rejected_by_id: String,
    /// Display name of that member.
    pub rejected_by_name: String,
}

/// Broadcast after each approval that does not complete the vote.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalProgressEvent {
    /// Room identifier.
    pub room_id: String,
    /// Request identifier.
    pub request_id: String,
    /// Approvals so far.
    pub approved_count: usize,
    /// Approvals needed.
    pub total_voters: usize,
}

/// Why a request disappeared without a vote outcome.
#[derive(Debug, Clone, Copy, Serialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum CancelReason {
    /// The requester cancelled it.
    Requested,
    /// The requester's last connection left the room.
    RequesterLeft,
    /// It outlived the configured lifetime.
    Expired,
}

/// Broadcast when a request is dropped.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionCancelledEvent {
    /// Room identifier.
    pub room_id: String,
    /// Request identifier.
    pub request_id: String,
    /// Why it was dropped.
    pub reason: CancelReason,
}

/// Broadcast to every participant when the owner ends the room.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RoomEndedEvent {
    /// Room identifier.
    pub room_id: String,
    /// Owner who ended it.
    pub ended_by_id: String,
    /// Display name of the owner.
    pub ended_by_name: String,
}
