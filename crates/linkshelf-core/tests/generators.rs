#![allow(dead_code)]

use chrono::{TimeZone, Utc};
use linkshelf_core::{ChangeEvent, Item, ItemId, OwnerId};
use proptest::prelude::*;

pub const OWNER: &str = "u1";
pub const FOREIGN: &str = "u2";
pub const ID_POOL: u8 = 16;

/// Ids are never reused, so everything about an item is a function of its id.
/// Every fifth id belongs to another owner; timestamps collide on purpose.
pub fn item_for(index: u8) -> Item {
    let owner = if index % 5 == 0 { FOREIGN } else { OWNER };
    Item {
        id: ItemId::new(format!("i{index:02}")),
        owner_id: OwnerId::new(owner),
        title: format!("title {index}"),
        location: format!("https://example.com/{index}"),
        created_at: Utc
            .timestamp_opt(1_700_000_000 + i64::from(index % 4), 0)
            .unwrap(),
    }
}

pub fn insert(index: u8) -> ChangeEvent {
    ChangeEvent::insert(item_for(index))
}

pub fn delete(index: u8) -> ChangeEvent {
    let item = item_for(index);
    ChangeEvent::delete(item.owner_id, item.id)
}

pub fn arb_change() -> impl Strategy<Value = ChangeEvent> + Clone {
    (0..ID_POOL, any::<bool>()).prop_map(|(index, is_delete)| {
        if is_delete {
            delete(index)
        } else {
            insert(index)
        }
    })
}

pub fn arb_history() -> impl Strategy<Value = Vec<ChangeEvent>> + Clone {
    prop::collection::vec(arb_change(), 0..60)
}

/// A realistic set of changes: each id created at most once and deleted at
/// most once, delivered in an arbitrary order.
pub fn arb_shuffled_lifecycle() -> impl Strategy<Value = (Vec<u8>, Vec<u8>, Vec<ChangeEvent>)> {
    (
        prop::collection::btree_set(0..ID_POOL, 0..12),
        prop::collection::btree_set(0..ID_POOL, 0..8),
    )
        .prop_flat_map(|(created, deleted)| {
            let changes: Vec<ChangeEvent> = created
                .iter()
                .map(|&index| insert(index))
                .chain(deleted.iter().map(|&index| delete(index)))
                .collect();
            (
                Just(created.into_iter().collect::<Vec<_>>()),
                Just(deleted.into_iter().collect::<Vec<_>>()),
                Just(changes).prop_shuffle(),
            )
        })
}
