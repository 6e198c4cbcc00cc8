use std::collections::BTreeSet;

use linkshelf_core::reconcile::DEFAULT_TOMBSTONE_CAPACITY;
use linkshelf_core::{ChangeEvent, ItemId, OwnerId, Reconciler};
use proptest::prelude::*;

#[path = "generators.rs"]
mod generators;
use generators::*;

fn reconciler() -> Reconciler {
    Reconciler::new(OwnerId::new(OWNER), DEFAULT_TOMBSTONE_CAPACITY)
}

fn visible(reconciler: &Reconciler) -> BTreeSet<ItemId> {
    reconciler.items().iter().map(|item| item.id.clone()).collect()
}

proptest! {
    #![proptest_config(proptest::test_runner::Config::with_cases(2000))]

    #[test]
    fn applying_each_change_twice_matches_applying_once(history in arb_history()) {
        let mut once = reconciler();
        let mut twice = reconciler();
        for change in &history {
            once.apply(change);
            twice.apply(change);
            twice.apply(change);
        }
        prop_assert_eq!(once.items(), twice.items());
    }

    #[test]
    fn delivery_order_does_not_change_outcome((created, deleted, changes) in arb_shuffled_lifecycle()) {
        let mut rec = reconciler();
        for change in &changes {
            rec.apply(change);
        }

        let expected: BTreeSet<ItemId> = created
            .iter()
            .filter(|index| !deleted.contains(index))
            .map(|&index| item_for(index))
            .filter(|item| item.owner_id.as_str() == OWNER)
            .map(|item| item.id)
            .collect();
        prop_assert_eq!(visible(&rec), expected);
    }

    #[test]
    fn collection_stays_sorted_and_unique(history in arb_history()) {
        let mut rec = reconciler();
        for change in &history {
            rec.apply(change);
            prop_assert!(rec.collection().is_well_formed());
        }
    }

    #[test]
    fn foreign_items_never_become_visible(history in arb_history()) {
        let mut rec = reconciler();
        for change in &history {
            rec.apply(change);
        }
        prop_assert!(rec.items().iter().all(|item| item.owner_id.as_str() == OWNER));
    }

    #[test]
    fn resync_replays_changes_that_raced_the_listing(
        before in arb_history(),
        during in arb_history(),
    ) {
        // The listing reflects only `before`; `during` landed while it was in flight.
        let mut reference = reconciler();
        for change in &before {
            reference.apply(change);
        }
        let listing = reference.items().to_vec();

        let mut rec = reconciler();
        rec.begin_resync();
        for change in &during {
            rec.apply(change);
        }
        rec.finish_resync(listing.clone(), &[]);

        let mut expected = reconciler();
        for item in &listing {
            expected.apply(&ChangeEvent::insert(item.clone()));
        }
        for change in &during {
            expected.apply(change);
        }
        prop_assert_eq!(rec.items(), expected.items());
        prop_assert!(!rec.resync_in_flight());
    }

    #[test]
    fn refused_deletes_during_resync_leave_no_trace(
        before in arb_history(),
        during in prop::collection::vec((arb_change(), prop::option::of(0..ID_POOL)), 0..60),
    ) {
        let mut reference = reconciler();
        for change in &before {
            reference.apply(change);
        }
        let listing = reference.items().to_vec();

        // Each feed change may be followed by a local delete the store refuses.
        let mut rec = reconciler();
        rec.begin_resync();
        for (change, refused) in &during {
            rec.apply(change);
            if let Some(index) = refused {
                let local = ChangeEvent::delete(OwnerId::new(OWNER), item_for(*index).id);
                rec.apply_unconfirmed(&local);
                rec.refuse(&local);
            }
        }
        rec.finish_resync(listing.clone(), &[]);

        let mut expected = reconciler();
        for item in &listing {
            expected.apply(&ChangeEvent::insert(item.clone()));
        }
        for (change, _) in &during {
            expected.apply(change);
        }
        prop_assert_eq!(rec.items(), expected.items());
        for item in &listing {
            prop_assert!(rec.items().contains(item) || during.iter().any(|(c, _)| c.id() == &item.id));
        }
    }
}
