//! Owned items and the validated draft used to create them.
//!
//! # Identity
//!
//! [`ItemId`] values are assigned by the remote store at creation time and
//! are never generated on the client. They are never reused, which is what
//! lets the reconciler treat a removed id as permanently gone.
//!
//! # Ordering
//!
//! Collections are ordered newest first by `(created_at, id)`. The id
//! tiebreaker makes the order total, so two replicas holding the same set
//! always render the same sequence.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Opaque, store-assigned item identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    /// Wrap a raw identifier as returned by the store.
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

/// The authenticated identity a collection belongs to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OwnerId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

/// A saved link, as committed by the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub owner_id: OwnerId,
    pub title: String,
    pub location: String,
    /// Assigned by the store; the sort key.
    pub created_at: DateTime<Utc>,
}

impl Item {
    /// Compare two items in display order (newest first, id descending on ties).
    #[must_use]
    pub fn display_cmp(&self, other: &Self) -> Ordering {
        other
            .created_at
            .cmp(&self.created_at)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// A create request that has passed local validation.
///
/// Holding a `NewItem` proves the title is non-empty and the location is an
/// absolute URL; both are already trimmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewItem {
    title: String,
    location: String,
}

impl NewItem {
    /// Validate raw form input.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] when the trimmed title or location is
    /// empty, or the location is not an absolute URL.
    pub fn parse(title: &str, location: &str) -> Result<Self, ValidationError> {
        let title = title.trim();
        let location = location.trim();

        if title.is_empty() {
            return Err(ValidationError::EmptyTitle);
        }
        if location.is_empty() {
            return Err(ValidationError::EmptyLocation);
        }

        url::Url::parse(location).map_err(|err| ValidationError::MalformedLocation {
            location: location.to_string(),
            reason: err.to_string(),
        })?;

        Ok(Self {
            title: title.to_string(),
            location: location.to_string(),
        })
    }

    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    #[must_use]
    pub fn location(&self) -> &str {
        &self.location
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn item(id: &str, secs: i64) -> Item {
        Item {
            id: ItemId::new(id),
            owner_id: OwnerId::new("u1"),
            title: "t".into(),
            location: "https://example.com".into(),
            created_at: Utc.timestamp_opt(secs, 0).single().expect("valid ts"),
        }
    }

    #[test]
    fn parse_trims_title_and_location() {
        let draft = NewItem::parse("  Docs ", " https://example.com/docs\n").expect("valid");
        assert_eq!(draft.title(), "Docs");
        assert_eq!(draft.location(), "https://example.com/docs");
    }

    #[test]
    fn parse_rejects_blank_title() {
        assert_eq!(
            NewItem::parse("   ", "https://example.com"),
            Err(ValidationError::EmptyTitle)
        );
    }

    #[test]
    fn parse_rejects_blank_location() {
        assert_eq!(NewItem::parse("Docs", " \t"), Err(ValidationError::EmptyLocation));
    }

    #[test]
    fn parse_rejects_relative_location() {
        let err = NewItem::parse("Docs", "/docs/intro").expect_err("relative");
        assert!(matches!(err, ValidationError::MalformedLocation { .. }));
    }

    #[test]
    fn parse_rejects_garbage_location() {
        let err = NewItem::parse("Docs", "not a url").expect_err("garbage");
        assert!(matches!(err, ValidationError::MalformedLocation { .. }));
    }

    #[test]
    fn parse_accepts_non_http_absolute_url() {
        assert!(NewItem::parse("Mail", "mailto:someone@example.com").is_ok());
    }

    #[test]
    fn display_order_is_newest_first() {
        let older = item("a1", 10);
        let newer = item("a2", 20);
        assert_eq!(newer.display_cmp(&older), Ordering::Less);
        assert_eq!(older.display_cmp(&newer), Ordering::Greater);
    }

    #[test]
    fn display_order_breaks_ties_by_id() {
        let a = item("a1", 10);
        let b = item("b1", 10);
        assert_eq!(b.display_cmp(&a), Ordering::Less);
        assert_eq!(a.display_cmp(&a), Ordering::Equal);
    }

    #[test]
    fn ids_serialize_transparently() {
        let json = serde_json::to_string(&ItemId::new("a1")).expect("serialize");
        assert_eq!(json, "\"a1\"");
    }
}
