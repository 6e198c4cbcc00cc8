#![no_main]

use chrono::{TimeZone, Utc};
use libfuzzer_sys::fuzz_target;
use linkshelf_core::{ChangeEvent, Item, ItemId, OwnerId, Reconciler};

const OWNER: &str = "u1";

fn item(byte: u8) -> Item {
    let index = byte & 0x1f;
    let owner = if index % 7 == 0 { "u2" } else { OWNER };
    Item {
        id: ItemId::new(format!("i{index:02}")),
        owner_id: OwnerId::new(owner),
        title: format!("t{index}"),
        location: format!("https://example.com/{index}"),
        created_at: Utc
            .timestamp_opt(1_700_000_000 + i64::from(index % 5), 0)
            .single()
            .unwrap_or_default(),
    }
}

fn check(reconciler: &Reconciler) {
    let items = reconciler.items();
    for pair in items.windows(2) {
        assert!(pair[0].display_cmp(&pair[1]).is_lt(), "unsorted or duplicate");
    }
    assert!(items.iter().all(|i| i.owner_id.as_str() == OWNER));
}

// Each byte is one step: the top bits pick the operation, the low bits the id.
fuzz_target!(|data: &[u8]| {
    let capacity = usize::from(data.first().copied().unwrap_or(0) % 8);
    let mut reconciler = Reconciler::new(OwnerId::new(OWNER), capacity);
    let mut in_resync = false;

    for &byte in data.iter().skip(1) {
        let target = item(byte);
        match byte >> 5 {
            0..=2 => {
                reconciler.apply(&ChangeEvent::insert(target));
            }
            3..=4 => {
                reconciler.apply(&ChangeEvent::delete(target.owner_id, target.id));
            }
            5 => {
                reconciler.begin_resync();
                in_resync = true;
            }
            6 if in_resync => {
                let listing: Vec<Item> = (0..4).map(|k| item(byte.wrapping_add(k * 3))).collect();
                reconciler.finish_resync(listing, &[target.id]);
                in_resync = false;
            }
            _ => {
                reconciler.abort_resync();
                in_resync = false;
            }
        }
        check(&reconciler);
    }
});
