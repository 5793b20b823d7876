use std::time::SystemTime;

use indexmap::IndexMap;
use uuid::Uuid;

/// Identifier assigned to every accepted websocket connection.
pub type ConnectionId = Uuid;

/// One connection of a member that joined a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveParticipant {
    /// Member id resolved by the identity service.
    pub member_id: String,
    /// Connection the member joined from.
    pub connection_id: ConnectionId,
    /// Display name resolved by the identity service.
    pub display_name: String,
    /// When this connection joined.
    pub joined_at: SystemTime,
}

/// Connections currently present in a room, in join order.
///
/// A member connected twice holds two entries; both are tracked independently.
#[derive(Debug, Clone, Default)]
pub struct Presence {
    entries: IndexMap<ConnectionId, ActiveParticipant>,
}

impl Presence {
    /// Register a participant; a connection that re-joins keeps its original position.
    pub fn insert(&mut self, participant: ActiveParticipant) -> bool {
        let connection_id = participant.connection_id;
        match self.entries.get_mut(&connection_id) {
            Some(existing) => {
                existing.display_name = participant.display_name;
                false
            }
            None => {
                self.entries.insert(connection_id, participant);
                true
            }
        }
    }

    /// Remove a connection, returning its entry when it was present.
    pub fn remove(&mut self, connection_id: &ConnectionId) -> Option<ActiveParticipant> {
        self.entries.shift_remove(connection_id)
    }

    /// Entry of a connection.
    pub fn get(&self, connection_id: &ConnectionId) -> Option<&ActiveParticipant> {
        self.entries.get(connection_id)
    }

    /// Whether `member_id` still has at least one connection in the room.
    pub fn has_member(&self, member_id: &str) -> bool {
        self.entries.values().any(|p| p.member_id == member_id)
    }

    /// Every connection in join order.
    pub fn connections(&self) -> Vec<ConnectionId> {
        self.entries.keys().copied().collect()
    }

    /// Every connection except `excluded`.
    pub fn connections_except(&self, excluded: &ConnectionId) -> Vec<ConnectionId> {
        self.entries
            .keys()
            .filter(|id| *id != excluded)
            .copied()
            .collect()
    }

    /// Connections belonging to any member of `members`.
    pub fn connections_of<'a, I>(&self, members: I) -> Vec<ConnectionId>
    where
        I: IntoIterator<Item = &'a String> + Clone,
    {
        self.entries
            .values()
            .filter(|p| members.clone().into_iter().any(|m| *m == p.member_id))
            .map(|p| p.connection_id)
            .collect()
    }

    /// Distinct members other than `member_id`, member id -> display name.
    pub fn other_members(&self, member_id: &str) -> IndexMap<String, String> {
        let mut members = IndexMap::new();
        for participant in self.entries.values() {
            if participant.member_id != member_id {
                members
                    .entry(participant.member_id.clone())
                    .or_insert_with(|| participant.display_name.clone());
            }
        }
        members
    }

    /// Active entries in join order.
    pub fn participants(&self) -> impl Iterator<Item = &ActiveParticipant> {
        self.entries.values()
    }

    /// Remove every entry, returning them in join order.
    pub fn drain(&mut self) -> Vec<ActiveParticipant> {
        self.entries.drain(..).map(|(_, p)| p).collect()
    }

    /// Number of connections present.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nobody is present.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
