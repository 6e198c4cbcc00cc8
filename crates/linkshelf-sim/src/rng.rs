use serde::{Deserialize, Serialize};

/// Seeded generator for everything random in a simulation run.
///
/// splitmix64: the same seed yields the same run on every platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeterministicRng {
    state: u64,
}

impl DeterministicRng {
    #[must_use]
    pub const fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Independent stream for a sub-component, stable under the parent seed.
    #[must_use]
    pub const fn fork(&self, salt: u64) -> Self {
        Self::new(self.state ^ salt.wrapping_mul(0xA24B_AED4_963E_E407))
    }

    pub const fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    /// Value in `[0, upper_exclusive)`; zero when the range is empty.
    pub const fn next_bounded(&mut self, upper_exclusive: u64) -> u64 {
        if upper_exclusive == 0 {
            return 0;
        }
        self.next_u64() % upper_exclusive
    }

    /// Index in `[0, len)`, or `None` for an empty range.
    pub fn next_index(&mut self, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        let bound = u64::try_from(len).unwrap_or(u64::MAX);
        usize::try_from(self.next_bounded(bound)).ok()
    }

    /// Bernoulli trial with an integer percentage.
    pub fn hit_rate_percent(&mut self, percent: u8) -> bool {
        match percent {
            0 => false,
            100.. => true,
            _ => self.next_bounded(100) < u64::from(percent),
        }
    }

    pub fn choose<'a, T>(&mut self, items: &'a [T]) -> Option<&'a T> {
        self.next_index(items.len()).and_then(|index| items.get(index))
    }

    /// Fisher-Yates shuffle in place.
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            if let Some(j) = self.next_index(i + 1) {
                items.swap(i, j);
            }
        }
    }
}
