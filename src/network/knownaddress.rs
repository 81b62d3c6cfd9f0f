//! Address book entries and their quality heuristics

use crate::network::message::NetAddress;

/// How far in the future a timestamp may be before the address looks fake
const FUTURE_TOLERANCE_SECS: i64 = 10 * 60;

/// Addresses not seen for this many days are considered stale
pub const NUM_MISSING_DAYS: i64 = 30;

/// Attempts allowed for an address that has never succeeded
pub const NUM_RETRIES: u32 = 3;

/// Failures allowed within `MIN_BAD_DAYS` of the last success
pub const MAX_FAILURES: u32 = 5;

/// Days after the last success before failures start to count
pub const MIN_BAD_DAYS: i64 = 7;

const DAY_SECS: i64 = 24 * 60 * 60;

/// One address in the address book, plus what we know about it.
///
/// An entry is either *new* (`tried == false`, referenced from `refs` new
/// buckets) or *tried* (`tried == true`, `refs == 0`, sitting in exactly one
/// tried bucket).
#[derive(Debug, Clone)]
pub struct KnownAddress {
    pub na: NetAddress,
    pub src: NetAddress,
    pub attempts: u32,
    /// Unix seconds, 0 when never attempted
    pub last_attempt: i64,
    /// Unix seconds, 0 when never connected
    pub last_success: i64,
    pub tried: bool,
    pub refs: usize,
}

impl KnownAddress {
    pub fn new(na: NetAddress, src: NetAddress) -> Self {
        Self {
            na,
            src,
            attempts: 0,
            last_attempt: 0,
            last_success: 0,
            tried: false,
            refs: 0,
        }
    }

    pub fn net_address(&self) -> &NetAddress {
        &self.na
    }

    /// Relative likelihood this address should be picked for a dial.
    /// Recently tried and repeatedly failing addresses are penalised.
    pub fn chance(&self, now: i64) -> f64 {
        let since_attempt = now - self.last_attempt;
        let mut c = 1.0;

        if self.last_attempt != 0 && since_attempt < 10 * 60 {
            c *= 0.01;
        }

        c * 0.66f64.powi(self.attempts.min(8) as i32)
    }

    /// Whether the address is not worth keeping.
    ///
    /// An address is bad when its timestamp is too far in the future, when
    /// it has not been seen for a month, when it never worked after a few
    /// tries, or when it has not worked for a week after many failures.
    /// Anything attempted within the last minute is kept.
    pub fn is_bad(&self, now: i64) -> bool {
        if self.last_attempt != 0 && now - self.last_attempt < 60 {
            return false;
        }

        if self.na.timestamp > now + FUTURE_TOLERANCE_SECS {
            return true;
        }

        if self.na.timestamp == 0 || now - self.na.timestamp > NUM_MISSING_DAYS * DAY_SECS {
            return true;
        }

        if self.last_success == 0 && self.attempts >= NUM_RETRIES {
            return true;
        }

        if now - self.last_success > MIN_BAD_DAYS * DAY_SECS && self.attempts >= MAX_FAILURES {
            return true;
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::ServiceFlags;

    const NOW: i64 = 1_700_000_000;

    fn entry(timestamp: i64) -> KnownAddress {
        let na = NetAddress::with_timestamp(
            "8.8.8.8".parse().unwrap(),
            8130,
            ServiceFlags::NODE_NETWORK,
            timestamp,
        );
        KnownAddress::new(na.clone(), na)
    }

    #[test]
    fn test_chance() {
        let mut ka = entry(NOW);
        assert!((ka.chance(NOW) - 1.0).abs() < f64::EPSILON);

        ka.last_attempt = NOW - 30;
        assert!((ka.chance(NOW) - 0.01).abs() < 1e-12);

        ka.last_attempt = NOW - 3600;
        ka.attempts = 2;
        assert!((ka.chance(NOW) - 0.66 * 0.66).abs() < 1e-12);

        // Attempts beyond eight do not reduce chance further
        ka.attempts = 8;
        let capped = ka.chance(NOW);
        ka.attempts = 20;
        assert!((ka.chance(NOW) - capped).abs() < f64::EPSILON);
    }

    #[test]
    fn test_is_bad() {
        assert!(!entry(NOW).is_bad(NOW));

        // Future timestamps
        assert!(entry(NOW + 11 * 60).is_bad(NOW));
        assert!(!entry(NOW + 5 * 60).is_bad(NOW));

        // Stale or missing timestamps
        assert!(entry(NOW - 31 * DAY_SECS).is_bad(NOW));
        assert!(entry(0).is_bad(NOW));

        // Never succeeded after three tries
        let mut ka = entry(NOW);
        ka.attempts = 3;
        ka.last_attempt = NOW - 3600;
        assert!(ka.is_bad(NOW));

        // Recently attempted is never bad
        ka.last_attempt = NOW - 10;
        assert!(!ka.is_bad(NOW));

        // Succeeded long ago and failing since
        let mut ka = entry(NOW);
        ka.last_success = NOW - 8 * DAY_SECS;
        ka.last_attempt = NOW - 3600;
        ka.attempts = 5;
        assert!(ka.is_bad(NOW));
        ka.attempts = 4;
        assert!(!ka.is_bad(NOW));
    }
}
