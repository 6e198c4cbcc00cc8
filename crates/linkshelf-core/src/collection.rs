//! The client's current view of the owned item set.
//!
//! A [`LocalCollection`] is an ordered sequence of items, newest first, with
//! at most one entry per id. Every operation is total: inserting a present id
//! and removing an absent one are no-ops, not errors. Both write paths (direct
//! responses and the push feed) rely on this to stay idempotent.

use std::collections::HashSet;

use crate::model::{Item, ItemId};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalCollection {
    items: Vec<Item>,
}

impl LocalCollection {
    #[must_use]
    pub const fn new() -> Self {
        Self { items: Vec::new() }
    }

    /// Insert unless an entry with the same id exists.
    ///
    /// A newly created item is the newest one and lands at the head. An item
    /// older than the head (a feed event that overtook a newer one) is placed
    /// at its sorted position instead, so the sequence stays ordered.
    ///
    /// Returns `true` if the collection changed.
    pub fn insert(&mut self, item: Item) -> bool {
        if self.contains(&item.id) {
            return false;
        }

        let at = self
            .items
            .iter()
            .position(|existing| item.display_cmp(existing).is_lt())
            .unwrap_or(self.items.len());
        self.items.insert(at, item);
        true
    }

    /// Remove the entry with `id` if present. Returns `true` if it was.
    pub fn remove(&mut self, id: &ItemId) -> bool {
        let before = self.items.len();
        self.items.retain(|item| &item.id != id);
        self.items.len() != before
    }

    /// Replace the whole collection with an authoritative listing.
    ///
    /// Duplicate ids in `items` keep their first occurrence.
    pub fn replace_all(&mut self, items: Vec<Item>) {
        let mut seen = HashSet::with_capacity(items.len());
        let mut items: Vec<Item> = items
            .into_iter()
            .filter(|item| seen.insert(item.id.clone()))
            .collect();
        items.sort_by(Item::display_cmp);
        self.items = items;
    }

    #[must_use]
    pub fn contains(&self, id: &ItemId) -> bool {
        self.items.iter().any(|item| &item.id == id)
    }

    #[must_use]
    pub fn get(&self, id: &ItemId) -> Option<&Item> {
        self.items.iter().find(|item| &item.id == id)
    }

    #[must_use]
    pub fn items(&self) -> &[Item] {
        &self.items
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether the sequence is in display order with unique ids.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        let sorted = self
            .items
            .windows(2)
            .all(|pair| pair[0].display_cmp(&pair[1]).is_lt());
        let mut seen = HashSet::with_capacity(self.items.len());
        sorted && self.items.iter().all(|item| seen.insert(&item.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OwnerId;
    use chrono::{TimeZone, Utc};

    fn item(id: &str, secs: i64) -> Item {
        Item {
            id: ItemId::new(id),
            owner_id: OwnerId::new("u1"),
            title: format!("title {id}"),
            location: format!("https://example.com/{id}"),
            created_at: Utc.timestamp_opt(secs, 0).single().expect("valid ts"),
        }
    }

    fn ids(collection: &LocalCollection) -> Vec<&str> {
        collection.items().iter().map(|i| i.id.as_str()).collect()
    }

    #[test]
    fn newest_insert_goes_to_head() {
        let mut c = LocalCollection::new();
        assert!(c.insert(item("a1", 10)));
        assert!(c.insert(item("a2", 20)));
        assert_eq!(ids(&c), ["a2", "a1"]);
    }

    #[test]
    fn duplicate_insert_is_noop() {
        let mut c = LocalCollection::new();
        c.insert(item("a1", 10));
        let before = c.clone();
        assert!(!c.insert(item("a1", 10)));
        assert_eq!(c, before);
    }

    #[test]
    fn duplicate_id_with_different_payload_is_still_noop() {
        let mut c = LocalCollection::new();
        c.insert(item("a1", 10));
        let mut changed = item("a1", 99);
        changed.title = "other".into();
        assert!(!c.insert(changed));
        assert_eq!(c.get(&ItemId::new("a1")).map(|i| i.title.as_str()), Some("title a1"));
    }

    #[test]
    fn late_older_insert_keeps_order() {
        let mut c = LocalCollection::new();
        c.insert(item("a3", 30));
        c.insert(item("a1", 10));
        c.insert(item("a2", 20));
        assert_eq!(ids(&c), ["a3", "a2", "a1"]);
        assert!(c.is_well_formed());
    }

    #[test]
    fn remove_absent_is_noop() {
        let mut c = LocalCollection::new();
        c.insert(item("a1", 10));
        assert!(!c.remove(&ItemId::new("zz")));
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn remove_present() {
        let mut c = LocalCollection::new();
        c.insert(item("a1", 10));
        c.insert(item("a2", 20));
        assert!(c.remove(&ItemId::new("a2")));
        assert_eq!(ids(&c), ["a1"]);
        assert!(!c.remove(&ItemId::new("a2")));
    }

    #[test]
    fn replace_all_sorts_and_dedups() {
        let mut c = LocalCollection::new();
        c.insert(item("old", 1));
        c.replace_all(vec![item("a1", 10), item("a3", 30), item("a2", 20), item("a1", 10)]);
        assert_eq!(ids(&c), ["a3", "a2", "a1"]);
        assert!(c.is_well_formed());
    }

    #[test]
    fn replace_all_with_empty_clears() {
        let mut c = LocalCollection::new();
        c.insert(item("a1", 10));
        c.replace_all(Vec::new());
        assert!(c.is_empty());
    }
}
