//! Invariant checks over simulation output.
//!
//! # Invariants checked
//!
//! 1. **Convergence** (`check_convergence`): once the run has settled, every
//!    client shows exactly the authoritative items of its owner, in order.
//! 2. **Structure** (`check_structure`): after every round, each client's
//!    collection has unique ids, is sorted newest first, and holds only
//!    items of its owner.
//! 3. **Commutativity** (`check_commutativity`): the feed events a client
//!    received, replayed in shuffled orders on a fresh reconciler, always
//!    produce the same collection.
//! 4. **Idempotence** (`check_idempotence`): delivering each of those
//!    events twice produces the same collection as delivering it once.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use linkshelf_core::{ChangeEvent, Item, ItemId, OwnerId, Reconciler};

use crate::client::ClientSnapshot;
use crate::network::ClientId;
use crate::rng::DeterministicRng;

/// Shuffled replays tried per client by [`ConvergenceOracle::check_all`].
pub const PERMUTATIONS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OracleResult {
    pub passed: bool,
    pub violations: Vec<InvariantViolation>,
}

impl OracleResult {
    #[must_use]
    pub const fn pass() -> Self {
        Self {
            passed: true,
            violations: Vec::new(),
        }
    }

    #[must_use]
    pub fn from_violations(violations: Vec<InvariantViolation>) -> Self {
        Self {
            passed: violations.is_empty(),
            violations,
        }
    }

    /// Accumulate another result's failures into this one.
    #[must_use]
    pub fn merge(mut self, other: Self) -> Self {
        if !other.passed {
            self.passed = false;
            self.violations.extend(other.violations);
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "invariant", rename_all = "snake_case")]
pub enum InvariantViolation {
    /// A settled client differs from the store.
    Convergence {
        client: ClientId,
        owner: OwnerId,
        /// Authoritative ids the client is missing.
        missing: Vec<ItemId>,
        /// Ids the client shows that the store does not have.
        extra: Vec<ItemId>,
        /// Same set, different order.
        misordered: bool,
    },
    /// The same id appears twice in one collection.
    DuplicateId {
        round: u64,
        client: ClientId,
        id: ItemId,
    },
    /// Two adjacent items are not newest first.
    Unsorted {
        round: u64,
        client: ClientId,
        earlier: ItemId,
        later: ItemId,
    },
    /// An item of another owner is visible.
    ForeignItem {
        round: u64,
        client: ClientId,
        id: ItemId,
        owner: OwnerId,
    },
    /// A shuffled replay of the feed log diverged.
    Commutativity {
        client: ClientId,
        permutation_index: usize,
        missing: Vec<ItemId>,
        extra: Vec<ItemId>,
    },
    /// Re-applying a delivered event changed the outcome.
    Idempotence {
        client: ClientId,
        event_index: usize,
        before: Vec<ItemId>,
        after_dup: Vec<ItemId>,
    },
}

pub struct ConvergenceOracle;

impl ConvergenceOracle {
    /// Compare each client with the authoritative items of its owner.
    #[must_use]
    pub fn check_convergence(
        clients: &[ClientSnapshot],
        authoritative: &BTreeMap<OwnerId, Vec<Item>>,
    ) -> OracleResult {
        let mut violations = Vec::new();
        for client in clients {
            let expected: Vec<ItemId> = authoritative
                .get(&client.owner)
                .map(|items| ids(items))
                .unwrap_or_default();
            let actual = ids(&client.items);
            if expected == actual {
                continue;
            }

            let (missing, extra) = set_diff(&expected, &actual);
            violations.push(InvariantViolation::Convergence {
                client: client.client,
                owner: client.owner.clone(),
                misordered: missing.is_empty() && extra.is_empty(),
                missing,
                extra,
            });
        }
        OracleResult::from_violations(violations)
    }

    /// Structural invariants of one client's visible collection.
    #[must_use]
    pub fn check_structure(
        round: u64,
        client: ClientId,
        owner: &OwnerId,
        items: &[Item],
    ) -> Vec<InvariantViolation> {
        let mut violations = Vec::new();
        let mut seen = BTreeSet::new();

        for item in items {
            if !seen.insert(&item.id) {
                violations.push(InvariantViolation::DuplicateId {
                    round,
                    client,
                    id: item.id.clone(),
                });
            }
            if &item.owner_id != owner {
                violations.push(InvariantViolation::ForeignItem {
                    round,
                    client,
                    id: item.id.clone(),
                    owner: item.owner_id.clone(),
                });
            }
        }
        for pair in items.windows(2) {
            if pair[0].display_cmp(&pair[1]).is_gt() {
                violations.push(InvariantViolation::Unsorted {
                    round,
                    client,
                    earlier: pair[0].id.clone(),
                    later: pair[1].id.clone(),
                });
            }
        }
        violations
    }

    /// Replay `events` in `permutations` shuffled orders and compare each
    /// outcome with the in-order replay.
    #[must_use]
    pub fn check_commutativity(
        client: ClientId,
        owner: &OwnerId,
        events: &[ChangeEvent],
        tombstone_capacity: usize,
        permutations: usize,
        rng: &mut DeterministicRng,
    ) -> OracleResult {
        if events.len() < 2 {
            return OracleResult::pass();
        }

        let canonical = replay(owner, events.iter(), tombstone_capacity);
        let mut violations = Vec::new();
        for permutation_index in 0..permutations {
            let mut shuffled = events.to_vec();
            rng.shuffle(&mut shuffled);
            let result = replay(owner, shuffled.iter(), tombstone_capacity);
            if result != canonical {
                let (missing, extra) = set_diff(&canonical, &result);
                violations.push(InvariantViolation::Commutativity {
                    client,
                    permutation_index,
                    missing,
                    extra,
                });
            }
        }
        OracleResult::from_violations(violations)
    }

    /// Deliver every event twice in a row and compare with single delivery.
    #[must_use]
    pub fn check_idempotence(
        client: ClientId,
        owner: &OwnerId,
        events: &[ChangeEvent],
        tombstone_capacity: usize,
    ) -> OracleResult {
        let mut once = Reconciler::new(owner.clone(), tombstone_capacity);
        let mut twice = Reconciler::new(owner.clone(), tombstone_capacity);

        for (event_index, event) in events.iter().enumerate() {
            once.apply(event);
            twice.apply(event);
            twice.apply(event);
            if once.items() != twice.items() {
                return OracleResult::from_violations(vec![InvariantViolation::Idempotence {
                    client,
                    event_index,
                    before: ids(once.items()),
                    after_dup: ids(twice.items()),
                }]);
            }
        }
        OracleResult::pass()
    }

    /// Every check over a finished run.
    #[must_use]
    pub fn check_all(
        result: &crate::SimulationResult,
        tombstone_capacity: usize,
        rng: &mut DeterministicRng,
    ) -> OracleResult {
        let mut outcome = OracleResult::from_violations(result.structural_violations.clone())
            .merge(Self::check_convergence(&result.clients, &result.authoritative));

        for client in &result.clients {
            let events = result
                .feed_logs
                .get(&client.client)
                .map(Vec::as_slice)
                .unwrap_or_default();
            outcome = outcome
                .merge(Self::check_commutativity(
                    client.client,
                    &client.owner,
                    events,
                    tombstone_capacity,
                    PERMUTATIONS,
                    rng,
                ))
                .merge(Self::check_idempotence(
                    client.client,
                    &client.owner,
                    events,
                    tombstone_capacity,
                ));
        }
        outcome
    }
}

fn replay<'a>(
    owner: &OwnerId,
    events: impl Iterator<Item = &'a ChangeEvent>,
    tombstone_capacity: usize,
) -> Vec<ItemId> {
    let mut reconciler = Reconciler::new(owner.clone(), tombstone_capacity);
    for event in events {
        reconciler.apply(event);
    }
    ids(reconciler.items())
}

fn ids(items: &[Item]) -> Vec<ItemId> {
    items.iter().map(|item| item.id.clone()).collect()
}

fn set_diff(expected: &[ItemId], actual: &[ItemId]) -> (Vec<ItemId>, Vec<ItemId>) {
    let expected: BTreeSet<&ItemId> = expected.iter().collect();
    let actual: BTreeSet<&ItemId> = actual.iter().collect();
    (
        expected.difference(&actual).map(|id| (*id).clone()).collect(),
        actual.difference(&expected).map(|id| (*id).clone()).collect(),
    )
}
