//! Misbehaviour scoring for peers
//!
//! A score has a persistent part that only grows and a transient part that
//! decays exponentially, so short bursts of noisy-but-legal traffic fade
//! away while real abuse accumulates.

use chrono::Utc;
use std::fmt;

/// Seconds for the transient part to halve
pub const HALFLIFE: i64 = 60;

/// Seconds after which the transient part is treated as zero
pub const LIFETIME: i64 = 1800;

/// Score added for offences that should ban quickly
pub const SERIOUS_SCORE: u32 = 50;

const PRECOMPUTED_LEN: usize = 64;

fn lambda() -> f64 {
    std::f64::consts::LN_2 / HALFLIFE as f64
}

fn decay_factor(secs: i64) -> f64 {
    if (secs as usize) < PRECOMPUTED_LEN {
        // Small deltas dominate; the table avoids repeated exp calls
        static TABLE: std::sync::OnceLock<[f64; PRECOMPUTED_LEN]> = std::sync::OnceLock::new();
        let table = TABLE.get_or_init(|| {
            let mut t = [0f64; PRECOMPUTED_LEN];
            for (i, v) in t.iter_mut().enumerate() {
                *v = (-lambda() * i as f64).exp();
            }
            t
        });
        return table[secs as usize];
    }
    (-lambda() * secs as f64).exp()
}

/// Decaying ban score
#[derive(Debug, Clone, Default)]
pub struct DynamicBanScore {
    last_unix: i64,
    transient: f64,
    persistent: u32,
}

impl DynamicBanScore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current score
    pub fn int(&self) -> u32 {
        self.int_at(Utc::now().timestamp())
    }

    /// Add to both parts and return the resulting score
    pub fn increase(&mut self, persistent: u32, transient: u32) -> u32 {
        self.increase_at(persistent, transient, Utc::now().timestamp())
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn int_at(&self, now: i64) -> u32 {
        let dt = now - self.last_unix;
        if self.transient < 1.0 || dt < 0 || dt > LIFETIME {
            return self.persistent;
        }
        self.persistent
            .saturating_add((self.transient * decay_factor(dt)) as u32)
    }

    pub fn increase_at(&mut self, persistent: u32, transient: u32, now: i64) -> u32 {
        self.persistent = self.persistent.saturating_add(persistent);
        let dt = now - self.last_unix;

        if transient > 0 {
            if dt > LIFETIME {
                self.transient = 0.0;
            } else if self.transient > 1.0 && dt > 0 {
                self.transient *= decay_factor(dt);
            }
            self.transient += transient as f64;
            self.last_unix = now;
        }

        self.persistent.saturating_add(self.transient as u32)
    }
}

impl fmt::Display for DynamicBanScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "persistent {} + transient {:.2} at {} = {} as of now",
            self.persistent,
            self.transient,
            self.last_unix,
            self.int()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;

    #[test]
    fn test_persistent_never_decays() {
        let mut score = DynamicBanScore::new();
        assert_eq!(score.increase_at(10, 0, NOW), 10);
        assert_eq!(score.int_at(NOW + LIFETIME * 10), 10);
    }

    #[test]
    fn test_transient_halves() {
        let mut score = DynamicBanScore::new();
        assert_eq!(score.increase_at(0, 100, NOW), 100);
        assert_eq!(score.int_at(NOW), 100);

        let half = score.int_at(NOW + HALFLIFE);
        assert!((49..=50).contains(&half), "got {}", half);

        assert_eq!(score.int_at(NOW + LIFETIME + 1), 0);
        // Clock going backwards only reports the persistent part
        assert_eq!(score.int_at(NOW - 5), 0);
    }

    #[test]
    fn test_increase_decays_previous_transient() {
        let mut score = DynamicBanScore::new();
        score.increase_at(5, 100, NOW);
        let total = score.increase_at(0, 10, NOW + HALFLIFE);
        assert!((59..=65).contains(&total), "got {}", total);

        score.increase_at(0, 10, NOW + HALFLIFE + LIFETIME + 1);
        assert_eq!(score.int_at(NOW + HALFLIFE + LIFETIME + 1), 15);
    }

    #[test]
    fn test_reset() {
        let mut score = DynamicBanScore::new();
        score.increase_at(30, 30, NOW);
        score.reset();
        assert_eq!(score.int_at(NOW), 0);
    }
}
