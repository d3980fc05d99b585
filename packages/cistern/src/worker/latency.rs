//! Simulated processing latency.

use rand::Rng;
use serde::Deserialize;
use std::time::Duration;


/// Inclusive range of simulated work time, in milliseconds
///
/// Latency only shifts how workers interleave. Nothing in the channel or the shutdown protocol
/// depends on it for correctness, including the all-zero case.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Latency {
    /// Shortest interval
    pub min_ms: u64,
    /// Longest interval
    pub max_ms: u64,
}

impl Latency {
    /// No simulated work at all
    pub const ZERO: Latency = Latency { min_ms: 0, max_ms: 0 };

    /// Construct from a millisecond range
    pub const fn millis(min_ms: u64, max_ms: u64) -> Self {
        Latency { min_ms, max_ms }
    }

    /// Whether `min_ms <= max_ms`
    pub fn is_valid(&self) -> bool {
        self.min_ms <= self.max_ms
    }

    /// Draw an interval uniformly from the range
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if self.max_ms <= self.min_ms {
            return Duration::from_millis(self.min_ms);
        }
        Duration::from_millis(rng.gen_range(self.min_ms..=self.max_ms))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_pcg::Pcg32;

    #[test]
    fn samples_stay_in_range() {
        let mut rng = Pcg32::seed_from_u64(7);
        let latency = Latency::millis(100, 600);
        for _ in 0..1_000 {
            let dur = latency.sample(&mut rng);
            assert!(dur >= Duration::from_millis(100));
            assert!(dur <= Duration::from_millis(600));
        }
    }

    #[test]
    fn degenerate_ranges() {
        let mut rng = Pcg32::seed_from_u64(7);
        assert_eq!(Latency::ZERO.sample(&mut rng), Duration::ZERO);
        assert_eq!(Latency::millis(5, 5).sample(&mut rng), Duration::from_millis(5));
        assert!(!Latency::millis(6, 5).is_valid());
    }
}
