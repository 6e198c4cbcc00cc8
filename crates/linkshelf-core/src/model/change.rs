//! Inbound change notifications and outbound in-flight mutations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::item::{Item, ItemId, OwnerId};

/// Kinds of committed change the push feed can announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Delete,
}

impl ChangeKind {
    /// Every kind the engine subscribes to.
    pub const ALL: [Self; 2] = [Self::Insert, Self::Delete];
}

/// A committed change, as delivered by the push feed.
///
/// Delivery is at-least-once and unordered relative to direct responses.
/// The engine also synthesizes these for its own direct results so both
/// paths go through the same reconciliation rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeEvent {
    Insert { owner_id: OwnerId, item: Item },
    Delete { owner_id: OwnerId, id: ItemId },
}

impl ChangeEvent {
    /// Insert event for a committed item, owned by the item's owner.
    #[must_use]
    pub fn insert(item: Item) -> Self {
        Self::Insert {
            owner_id: item.owner_id.clone(),
            item,
        }
    }

    #[must_use]
    pub const fn delete(owner_id: OwnerId, id: ItemId) -> Self {
        Self::Delete { owner_id, id }
    }

    #[must_use]
    pub const fn kind(&self) -> ChangeKind {
        match self {
            Self::Insert { .. } => ChangeKind::Insert,
            Self::Delete { .. } => ChangeKind::Delete,
        }
    }

    #[must_use]
    pub const fn owner_id(&self) -> &OwnerId {
        match self {
            Self::Insert { owner_id, .. } | Self::Delete { owner_id, .. } => owner_id,
        }
    }

    /// The id the change is about.
    #[must_use]
    pub const fn id(&self) -> &ItemId {
        match self {
            Self::Insert { item, .. } => &item.id,
            Self::Delete { id, .. } => id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Create,
    Delete,
}

/// A mutation waiting on its remote round-trip.
///
/// Lives only between issue and response; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMutation {
    /// Coordinator-local handle, unique per engine.
    pub token: u64,
    pub kind: MutationKind,
    /// `None` for a create until the store assigns the id.
    pub target: Option<ItemId>,
    pub issued_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_item() -> Item {
        Item {
            id: ItemId::new("a1"),
            owner_id: OwnerId::new("u1"),
            title: "Docs".into(),
            location: "https://example.com/docs".into(),
            created_at: Utc.timestamp_opt(1_700_000_000, 0).single().expect("valid ts"),
        }
    }

    #[test]
    fn insert_takes_owner_from_item() {
        let event = ChangeEvent::insert(sample_item());
        assert_eq!(event.owner_id(), &OwnerId::new("u1"));
        assert_eq!(event.id(), &ItemId::new("a1"));
        assert_eq!(event.kind(), ChangeKind::Insert);
    }

    #[test]
    fn delete_accessors() {
        let event = ChangeEvent::delete(OwnerId::new("u2"), ItemId::new("b2"));
        assert_eq!(event.kind(), ChangeKind::Delete);
        assert_eq!(event.owner_id().as_str(), "u2");
        assert_eq!(event.id().as_str(), "b2");
    }

    #[test]
    fn events_serialize_with_kind_tag() {
        let event = ChangeEvent::delete(OwnerId::new("u1"), ItemId::new("a1"));
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["kind"], "delete");
        assert_eq!(json["owner_id"], "u1");
        assert_eq!(json["id"], "a1");
    }
}
