#![no_main]

use libfuzzer_sys::fuzz_target;
use linkshelf_core::{ChangeEvent, OwnerId, Reconciler};

fuzz_target!(|data: &[u8]| {
    let Ok(event) = serde_json::from_slice::<ChangeEvent>(data) else {
        return;
    };

    let mut reconciler = Reconciler::new(OwnerId::new("u1"), 4);
    reconciler.apply(&event);
    let once = reconciler.items().to_vec();
    reconciler.apply(&event);
    assert_eq!(once, reconciler.items());
    assert!(once.iter().all(|item| item.owner_id.as_str() == "u1"));
});
