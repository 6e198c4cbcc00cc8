//! Lossy, delaying link between the simulated store and its clients.
//!
//! Feed events take the faulty path: they may be dropped, duplicated, held
//! back for a few rounds, or delivered out of order. Call replies take the
//! reliable path (delay and reordering only); a reply lost forever would
//! leave a mutation pending for the rest of the run.

use serde::{Deserialize, Serialize};

use linkshelf_core::ChangeEvent;

use crate::rng::DeterministicRng;

/// Stable identifier for a simulated client (one session, one tab).
pub type ClientId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultConfig {
    /// Maximum delivery delay in rounds.
    pub max_delay_rounds: u8,
    /// Percentage of feed events dropped.
    pub drop_rate_percent: u8,
    /// Percentage of feed events duplicated.
    pub duplicate_rate_percent: u8,
    /// Percentage chance of reversing a round's ready batch.
    pub reorder_rate_percent: u8,
    /// Percentage of create and delete calls that fail without committing.
    pub remote_failure_percent: u8,
    /// Percentage of listing calls that fail.
    pub list_failure_percent: u8,
    /// Percentage chance per round that the store closes one subscription.
    pub feed_drop_percent: u8,
    /// Percentage chance per round of pushing another owner's event to a client.
    pub leak_percent: u8,
}

impl FaultConfig {
    /// No faults at all; delivery is still delayed by up to `max_delay_rounds`.
    #[must_use]
    pub const fn calm(max_delay_rounds: u8) -> Self {
        Self {
            max_delay_rounds,
            drop_rate_percent: 0,
            duplicate_rate_percent: 0,
            reorder_rate_percent: 0,
            remote_failure_percent: 0,
            list_failure_percent: 0,
            feed_drop_percent: 0,
            leak_percent: 0,
        }
    }

    /// Whether feed events can be lost for good without a resync.
    #[must_use]
    pub const fn is_lossy(&self) -> bool {
        self.drop_rate_percent > 0 || self.feed_drop_percent > 0
    }
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            max_delay_rounds: 2,
            drop_rate_percent: 0,
            duplicate_rate_percent: 5,
            reorder_rate_percent: 10,
            remote_failure_percent: 10,
            list_failure_percent: 5,
            feed_drop_percent: 3,
            leak_percent: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// A change pushed on one subscription.
    Feed { subscription: u64, event: ChangeEvent },
    /// The reply to a queued store call is ready.
    Reply { call: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkMessage {
    pub to: ClientId,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingMessage {
    deliver_at_round: u64,
    message: NetworkMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendOutcome {
    pub dropped: bool,
    pub duplicated: bool,
    pub delay_rounds: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliverOutcome {
    pub delivered: Vec<NetworkMessage>,
    pub reordered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedNetwork {
    pending: Vec<PendingMessage>,
    fault: FaultConfig,
    lossless: bool,
}

impl SimulatedNetwork {
    #[must_use]
    pub const fn new(fault: FaultConfig) -> Self {
        Self {
            pending: Vec::new(),
            fault,
            lossless: false,
        }
    }

    #[must_use]
    pub const fn fault_config(&self) -> FaultConfig {
        self.fault
    }

    /// Stop dropping and duplicating from now on. Already queued messages
    /// still arrive.
    pub const fn settle(&mut self) {
        self.lossless = true;
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Send a feed event through the faulty path.
    pub fn send(
        &mut self,
        message: NetworkMessage,
        round: u64,
        rng: &mut DeterministicRng,
    ) -> SendOutcome {
        if !self.lossless && rng.hit_rate_percent(self.fault.drop_rate_percent) {
            return SendOutcome {
                dropped: true,
                duplicated: false,
                delay_rounds: 0,
            };
        }

        let delay_rounds = self.draw_delay(rng);
        let duplicated =
            !self.lossless && rng.hit_rate_percent(self.fault.duplicate_rate_percent);
        if duplicated {
            let echo_delay = self.draw_delay(rng);
            self.enqueue(message.clone(), round, echo_delay);
        }
        self.enqueue(message, round, delay_rounds);

        SendOutcome {
            dropped: false,
            duplicated,
            delay_rounds,
        }
    }

    /// Send a reply: delayed like everything else but never lost or doubled.
    pub fn send_reliable(
        &mut self,
        message: NetworkMessage,
        round: u64,
        rng: &mut DeterministicRng,
    ) -> u8 {
        let delay_rounds = self.draw_delay(rng);
        self.enqueue(message, round, delay_rounds);
        delay_rounds
    }

    /// Deliver every message whose round has arrived.
    pub fn deliver_ready(&mut self, round: u64, rng: &mut DeterministicRng) -> DeliverOutcome {
        let (mut ready, future): (Vec<_>, Vec<_>) = self
            .pending
            .drain(..)
            .partition(|pending| pending.deliver_at_round <= round);
        self.pending = future;

        let reordered = ready.len() > 1
            && !self.lossless
            && rng.hit_rate_percent(self.fault.reorder_rate_percent);
        if reordered {
            rng.shuffle(&mut ready);
        }

        DeliverOutcome {
            delivered: ready.into_iter().map(|pending| pending.message).collect(),
            reordered,
        }
    }

    fn draw_delay(&self, rng: &mut DeterministicRng) -> u8 {
        let bound = u64::from(self.fault.max_delay_rounds).saturating_add(1);
        u8::try_from(rng.next_bounded(bound)).unwrap_or(self.fault.max_delay_rounds)
    }

    fn enqueue(&mut self, message: NetworkMessage, round: u64, delay_rounds: u8) {
        self.pending.push(PendingMessage {
            deliver_at_round: round.saturating_add(u64::from(delay_rounds)),
            message,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(to: ClientId, call: u64) -> NetworkMessage {
        NetworkMessage {
            to,
            payload: Payload::Reply { call },
        }
    }

    #[test]
    fn calm_network_delivers_everything_within_delay() {
        let mut network = SimulatedNetwork::new(FaultConfig::calm(2));
        let mut rng = DeterministicRng::new(1);
        for call in 0..10 {
            let outcome = network.send(reply(0, call), 0, &mut rng);
            assert!(!outcome.dropped);
            assert!(!outcome.duplicated);
            assert!(outcome.delay_rounds <= 2);
        }

        let delivered: usize = (0..=2)
            .map(|round| network.deliver_ready(round, &mut rng).delivered.len())
            .sum();
        assert_eq!(delivered, 10);
        assert_eq!(network.pending_len(), 0);
    }

    #[test]
    fn full_drop_rate_loses_feed_but_not_replies() {
        let fault = FaultConfig {
            drop_rate_percent: 100,
            ..FaultConfig::calm(0)
        };
        let mut network = SimulatedNetwork::new(fault);
        let mut rng = DeterministicRng::new(1);

        assert!(network.send(reply(0, 1), 0, &mut rng).dropped);
        network.send_reliable(reply(0, 2), 0, &mut rng);

        let outcome = network.deliver_ready(0, &mut rng);
        assert_eq!(outcome.delivered, vec![reply(0, 2)]);
    }

    #[test]
    fn full_duplicate_rate_delivers_twice() {
        let fault = FaultConfig {
            duplicate_rate_percent: 100,
            ..FaultConfig::calm(0)
        };
        let mut network = SimulatedNetwork::new(fault);
        let mut rng = DeterministicRng::new(5);

        assert!(network.send(reply(3, 9), 4, &mut rng).duplicated);
        assert_eq!(network.deliver_ready(4, &mut rng).delivered.len(), 2);
    }

    #[test]
    fn settled_network_stops_losing_messages() {
        let fault = FaultConfig {
            drop_rate_percent: 100,
            duplicate_rate_percent: 100,
            ..FaultConfig::calm(0)
        };
        let mut network = SimulatedNetwork::new(fault);
        let mut rng = DeterministicRng::new(5);
        network.settle();

        let outcome = network.send(reply(0, 1), 0, &mut rng);
        assert!(!outcome.dropped);
        assert!(!outcome.duplicated);
        assert_eq!(network.deliver_ready(0, &mut rng).delivered.len(), 1);
    }

    #[test]
    fn messages_wait_for_their_round() {
        let mut network = SimulatedNetwork::new(FaultConfig::calm(3));
        let mut rng = DeterministicRng::new(9);
        let delay = network.send_reliable(reply(0, 1), 10, &mut rng);

        for round in 10..10 + u64::from(delay) {
            assert!(network.deliver_ready(round, &mut rng).delivered.is_empty());
        }
        assert_eq!(
            network
                .deliver_ready(10 + u64::from(delay), &mut rng)
                .delivered
                .len(),
            1
        );
    }
}
