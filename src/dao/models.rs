use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Room document as persisted by the room-CRUD service and read back by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomEntity {
    /// Stable identifier for the room.
    pub id: String,
    /// Human readable room name.
    pub name: String,
    /// Member identifier of the room creator.
    pub owner_id: String,
    /// Members allowed to join the live session, in membership order.
    pub members: Vec<MemberEntity>,
    /// Latest persisted code, input and output.
    #[serde(default)]
    pub snapshot: SnapshotEntity,
    /// Persisted chat history, oldest first.
    #[serde(default)]
    pub messages: Vec<ChatMessageEntity>,
}

/// Membership record of a room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemberEntity {
    /// Identifier issued by the identity service.
    pub member_id: String,
    /// Time the member was added to the room.
    pub joined_at: SystemTime,
}

/// Last-write-wins snapshot of the shared panes of a room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotEntity {
    /// Contents of the shared code buffer.
    pub code: String,
    /// Language tag of the code buffer (e.g. "python").
    pub language: String,
    /// Program input (stdin) pane.
    pub input: String,
    /// Program output pane.
    pub output: String,
    /// Whether the output pane is shown to the room.
    pub show_output: bool,
    /// Member that produced the last code edit.
    pub updated_by: Option<String>,
    /// Time of the last edit.
    pub updated_at: Option<SystemTime>,
}

impl Default for SnapshotEntity {
    fn default() -> Self {
        Self {
            code: "// Start coding here...\n".into(),
            language: "javascript".into(),
            input: String::new(),
            output: String::new(),
            show_output: false,
            updated_by: None,
            updated_at: None,
        }
    }
}

/// Kind of a chat log entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChatKindEntity {
    /// Authored by a participant.
    Message,
    /// Synthesized by the coordinator.
    System,
}

/// A persisted chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessageEntity {
    /// Unique message identifier.
    pub id: String,
    /// Member identifier of the author.
    pub author_id: String,
    /// Display name of the author at the time of writing.
    pub author_name: String,
    /// Message body.
    pub body: String,
    /// Message kind.
    pub kind: ChatKindEntity,
    /// Time the message was accepted by the coordinator.
    pub sent_at: SystemTime,
}
