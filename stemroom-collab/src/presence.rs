//! Awareness channel: who is connected to a room.
//!
//! Presence is ephemeral. It never enters the track document and is never
//! persisted; an entry exists exactly as long as its connection is admitted.
//!
//! ```text
//! join ──► Awareness (server, per room) ──► Join/Leave/Update ──► PresenceView (client)
//!                 │
//!                 └── Snapshot ──► newly admitted connection
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use stemroom_core::Identity;

use crate::protocol::ProtocolError;

/// One connected participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub connection_id: Uuid,
    pub user_id: String,
    pub name: String,
    pub avatar: Option<String>,
    /// Opaque client state (playhead, selected stem, ...).
    pub state: Option<String>,
}

impl PresenceEntry {
    pub fn from_identity(connection_id: Uuid, identity: &Identity) -> Self {
        Self {
            connection_id,
            user_id: identity.subject_id.clone(),
            name: identity.username.clone(),
            avatar: identity.avatar.clone(),
            state: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AwarenessMessage {
    /// Full presence list, sent to a connection right after admission.
    /// `local` is the receiving connection's own id.
    Snapshot {
        local: Uuid,
        entries: Vec<PresenceEntry>,
    },
    Join(PresenceEntry),
    Update(PresenceEntry),
    Leave {
        connection_id: Uuid,
    },
}

impl AwarenessMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }
}

/// Server-side presence registry for one room.
#[derive(Debug, Default)]
pub struct Awareness {
    entries: HashMap<Uuid, PresenceEntry>,
}

impl Awareness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&mut self, connection_id: Uuid, identity: &Identity) -> AwarenessMessage {
        let entry = PresenceEntry::from_identity(connection_id, identity);
        self.entries.insert(connection_id, entry.clone());
        AwarenessMessage::Join(entry)
    }

    /// Replace the opaque state of a connection's own entry. Identity
    /// fields always come from the admitted session, never from the client.
    pub fn update(&mut self, connection_id: Uuid, state: Option<String>) -> Option<AwarenessMessage> {
        let entry = self.entries.get_mut(&connection_id)?;
        entry.state = state;
        Some(AwarenessMessage::Update(entry.clone()))
    }

    pub fn leave(&mut self, connection_id: Uuid) -> Option<AwarenessMessage> {
        self.entries
            .remove(&connection_id)
            .map(|_| AwarenessMessage::Leave { connection_id })
    }

    pub fn snapshot_for(&self, local: Uuid) -> AwarenessMessage {
        let mut entries: Vec<PresenceEntry> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name).then(a.connection_id.cmp(&b.connection_id)));
        AwarenessMessage::Snapshot { local, entries }
    }

    pub fn get(&self, connection_id: &Uuid) -> Option<&PresenceEntry> {
        self.entries.get(connection_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Client-side mirror of a room's presence.
#[derive(Debug, Default, Clone)]
pub struct PresenceView {
    local: Option<Uuid>,
    entries: HashMap<Uuid, PresenceEntry>,
}

impl PresenceView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an incoming message. Returns whether the view changed.
    pub fn handle(&mut self, message: &AwarenessMessage) -> bool {
        match message {
            AwarenessMessage::Snapshot { local, entries } => {
                self.local = Some(*local);
                self.entries = entries
                    .iter()
                    .map(|e| (e.connection_id, e.clone()))
                    .collect();
                true
            }
            AwarenessMessage::Join(entry) | AwarenessMessage::Update(entry) => {
                let previous = self.entries.insert(entry.connection_id, entry.clone());
                previous.as_ref() != Some(entry)
            }
            AwarenessMessage::Leave { connection_id } => {
                self.entries.remove(connection_id).is_some()
            }
        }
    }

    /// This client's own connection id, once the snapshot arrived.
    pub fn local(&self) -> Option<Uuid> {
        self.local
    }

    /// Everyone, including this client.
    pub fn entries(&self) -> Vec<PresenceEntry> {
        let mut entries: Vec<PresenceEntry> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name).then(a.connection_id.cmp(&b.connection_id)));
        entries
    }

    /// Everyone except this client.
    pub fn others(&self) -> Vec<PresenceEntry> {
        self.entries()
            .into_iter()
            .filter(|e| Some(e.connection_id) != self.local)
            .collect()
    }

    pub fn contains_user(&self, user_id: &str) -> bool {
        self.entries.values().any(|e| e.user_id == user_id)
    }

    pub fn clear(&mut self) {
        self.local = None;
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Identity {
        Identity::new("1", "alice").with_avatar("https://avatars/1.png")
    }

    fn bob() -> Identity {
        Identity::new("2", "bob")
    }

    #[test]
    fn test_join_and_leave() {
        let mut awareness = Awareness::new();
        let a = Uuid::new_v4();

        match awareness.join(a, &alice()) {
            AwarenessMessage::Join(entry) => {
                assert_eq!(entry.name, "alice");
                assert_eq!(entry.avatar.as_deref(), Some("https://avatars/1.png"));
            }
            other => panic!("expected Join, got {other:?}"),
        }
        assert_eq!(awareness.len(), 1);

        assert_eq!(
            awareness.leave(a),
            Some(AwarenessMessage::Leave { connection_id: a })
        );
        assert!(awareness.leave(a).is_none());
        assert!(awareness.is_empty());
    }

    #[test]
    fn test_update_only_touches_state() {
        let mut awareness = Awareness::new();
        let a = Uuid::new_v4();
        awareness.join(a, &alice());

        let msg = awareness.update(a, Some("playhead=12.5".into())).unwrap();
        let AwarenessMessage::Update(entry) = msg else {
            panic!("expected Update");
        };
        assert_eq!(entry.name, "alice");
        assert_eq!(entry.state.as_deref(), Some("playhead=12.5"));

        assert!(awareness.update(Uuid::new_v4(), None).is_none());
    }

    #[test]
    fn test_same_user_two_connections() {
        let mut awareness = Awareness::new();
        let (a1, a2) = (Uuid::new_v4(), Uuid::new_v4());
        awareness.join(a1, &alice());
        awareness.join(a2, &alice());
        assert_eq!(awareness.len(), 2);

        awareness.leave(a1);
        assert_eq!(awareness.get(&a2).unwrap().user_id, "1");
    }

    #[test]
    fn test_view_follows_server() {
        let mut awareness = Awareness::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        awareness.join(a, &alice());

        let mut view = PresenceView::new();
        assert!(view.handle(&awareness.snapshot_for(a)));
        assert_eq!(view.local(), Some(a));
        assert!(view.others().is_empty());

        let join = awareness.join(b, &bob());
        assert!(view.handle(&join));
        assert!(view.contains_user("2"));
        assert_eq!(view.others().len(), 1);
        assert_eq!(view.entries().len(), 2);

        let leave = awareness.leave(b).unwrap();
        assert!(view.handle(&leave));
        assert!(!view.contains_user("2"));
        assert!(!view.handle(&leave));
    }

    #[test]
    fn test_repeated_update_is_not_a_change() {
        let mut view = PresenceView::new();
        let entry = PresenceEntry::from_identity(Uuid::new_v4(), &bob());
        assert!(view.handle(&AwarenessMessage::Join(entry.clone())));
        assert!(!view.handle(&AwarenessMessage::Update(entry)));
    }

    #[test]
    fn test_awareness_wire_roundtrip() {
        let msg = AwarenessMessage::Snapshot {
            local: Uuid::new_v4(),
            entries: vec![PresenceEntry::from_identity(Uuid::new_v4(), &alice())],
        };
        let decoded = AwarenessMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert!(AwarenessMessage::decode(&[0xFF; 3]).is_err());
    }
}
