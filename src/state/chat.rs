use std::{collections::VecDeque, time::SystemTime};

use uuid::Uuid;

use crate::dao::models::{ChatKindEntity, ChatMessageEntity};

/// Maximum body length of a chat message, in characters.
pub const MAX_MESSAGE_CHARS: usize = 2000;

/// Whether a message was typed by a participant or synthesized by the room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatKind {
    /// Typed by a participant.
    Message,
    /// Join/leave notice.
    System,
}

/// Immutable chat entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    /// Unique identifier.
    pub id: Uuid,
    /// Member id of the author; the joining/leaving member for system messages.
    pub author_id: String,
    /// Display name of the author.
    pub author_name: String,
    /// Message text.
    pub body: String,
    /// Message kind.
    pub kind: ChatKind,
    /// When the message was appended.
    pub sent_at: SystemTime,
}

impl ChatMessage {
    /// Build a participant message stamped now.
    pub fn message(author_id: &str, author_name: &str, body: String) -> Self {
        Self::new(author_id, author_name, body, ChatKind::Message)
    }

    /// Build a system notice stamped now.
    pub fn system(author_id: &str, author_name: &str, body: String) -> Self {
        Self::new(author_id, author_name, body, ChatKind::System)
    }

    fn new(author_id: &str, author_name: &str, body: String, kind: ChatKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            author_id: author_id.to_string(),
            author_name: author_name.to_string(),
            body,
            kind,
            sent_at: SystemTime::now(),
        }
    }
}

impl From<ChatMessageEntity> for ChatMessage {
    fn from(value: ChatMessageEntity) -> Self {
        Self {
            id: Uuid::parse_str(&value.id).unwrap_or_else(|_| Uuid::new_v4()),
            author_id: value.author_id,
            author_name: value.author_name,
            body: value.body,
            kind: match value.kind {
                ChatKindEntity::Message => ChatKind::Message,
                ChatKindEntity::System => ChatKind::System,
            },
            sent_at: value.sent_at,
        }
    }
}

impl From<&ChatMessage> for ChatMessageEntity {
    fn from(value: &ChatMessage) -> Self {
        Self {
            id: value.id.to_string(),
            author_id: value.author_id.clone(),
            author_name: value.author_name.clone(),
            body: value.body.clone(),
            kind: match value.kind {
                ChatKind::Message => ChatKindEntity::Message,
                ChatKind::System => ChatKindEntity::System,
            },
            sent_at: value.sent_at,
        }
    }
}

/// Capacity-bounded, append-only message history of a room.
#[derive(Debug, Clone)]
pub struct ChatLog {
    messages: VecDeque<ChatMessage>,
    capacity: usize,
}

impl ChatLog {
    /// Create an empty log holding at most `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            messages: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Rebuild a log from persisted history, keeping the newest entries.
    pub fn restore(capacity: usize, history: impl IntoIterator<Item = ChatMessage>) -> Self {
        let mut log = Self::new(capacity);
        for message in history {
            log.append(message);
        }
        log
    }

    /// Append a message, evicting the oldest ones past capacity.
    pub fn append(&mut self, message: ChatMessage) {
        while self.messages.len() >= self.capacity {
            self.messages.pop_front();
        }
        self.messages.push_back(message);
    }

    /// Messages oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter()
    }

    /// Number of stored messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_evicts_exactly_the_oldest() {
        let mut log = ChatLog::new(500);
        for n in 0..501 {
            log.append(ChatMessage::message("a", "A", format!("msg {n}")));
        }

        assert_eq!(log.len(), 500);
        let bodies: Vec<_> = log.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies.first(), Some(&"msg 1"));
        assert_eq!(bodies.last(), Some(&"msg 500"));
    }

    #[test]
    fn restore_keeps_the_newest_history() {
        let history = (0..5).map(|n| ChatMessage::system("a", "A", n.to_string()));
        let log = ChatLog::restore(3, history);
        let bodies: Vec<_> = log.iter().map(|m| m.body.clone()).collect();
        assert_eq!(bodies, ["2", "3", "4"]);
    }

    #[test]
    fn entity_conversion_keeps_identity() {
        let message = ChatMessage::message("a", "A", "hi".into());
        let entity = ChatMessageEntity::from(&message);
        assert_eq!(entity.kind, ChatKindEntity::Message);
        assert_eq!(ChatMessage::from(entity), message);
    }
}
