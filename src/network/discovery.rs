//! DNS seeding
//!
//! Each seed host is resolved on the blocking pool. Resolved IPs become
//! addresses on the network's default port with a last-seen time between
//! three and seven days ago, so they rank below addresses learned from
//! live peers.

use crate::network::addrman::LookupFn;
use crate::network::message::{NetAddress, ServiceFlags};
use chrono::Utc;
use rand::Rng;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

// =============================================================================
// Constants
// =============================================================================

const SECONDS_IN_3_DAYS: i64 = 24 * 60 * 60 * 3;
const SECONDS_IN_4_DAYS: i64 = 24 * 60 * 60 * 4;

/// Receives the addresses found by one seed
pub type OnSeed = Arc<dyn Fn(Vec<NetAddress>) + Send + Sync>;

/// Turn resolved seed IPs into addresses with randomised ages
pub fn seed_addresses<R: Rng>(ips: &[IpAddr], port: u16, now: i64, rng: &mut R) -> Vec<NetAddress> {
    ips.iter()
        .map(|ip| {
            let age = SECONDS_IN_3_DAYS + rng.gen_range(0..SECONDS_IN_4_DAYS);
            NetAddress::with_timestamp(*ip, port, ServiceFlags::empty(), now - age)
        })
        .collect()
}

/// Resolve every seed concurrently and hand the results to `on_seed`
pub fn seed_from_dns(
    seeds: Vec<String>,
    default_port: u16,
    lookup: LookupFn,
    on_seed: OnSeed,
) -> Vec<JoinHandle<()>> {
    seeds
        .into_iter()
        .map(|host| {
            let lookup = Arc::clone(&lookup);
            let on_seed = Arc::clone(&on_seed);
            tokio::spawn(async move {
                let resolved = {
                    let host = host.clone();
                    tokio::task::spawn_blocking(move || lookup(&host)).await
                };
                let ips = match resolved {
                    Ok(Ok(ips)) => ips,
                    Ok(Err(e)) => {
                        log::warn!("DNS discovery failed on seed {}: {}", host, e);
                        return;
                    }
                    Err(e) => {
                        log::warn!("DNS discovery task for {} failed: {}", host, e);
                        return;
                    }
                };

                log::info!("{} addresses found from DNS seed {}", ips.len(), host);
                if ips.is_empty() {
                    return;
                }
                let addresses = seed_addresses(
                    &ips,
                    default_port,
                    Utc::now().timestamp(),
                    &mut rand::thread_rng(),
                );
                on_seed(addresses);
            })
        })
        .collect()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_seed_ages_are_three_to_seven_days() {
        let now = 1_700_000_000;
        let ips: Vec<IpAddr> = vec!["8.8.8.8".parse().unwrap(), "1.1.1.1".parse().unwrap()];
        let addresses = seed_addresses(&ips, 8130, now, &mut rand::thread_rng());

        assert_eq!(addresses.len(), 2);
        for na in &addresses {
            assert_eq!(na.port, 8130);
            let age = now - na.timestamp;
            assert!((SECONDS_IN_3_DAYS..SECONDS_IN_3_DAYS + SECONDS_IN_4_DAYS).contains(&age));
        }
    }

    #[tokio::test]
    async fn test_seed_from_dns_reports_each_seed() {
        let lookup: LookupFn = Arc::new(|host: &str| match host {
            "good.seed" => Ok(vec![
                "8.8.8.8".parse::<IpAddr>().unwrap(),
                "9.9.9.9".parse::<IpAddr>().unwrap(),
            ]),
            "empty.seed" => Ok(Vec::new()),
            _ => Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no such host")),
        });
        let found = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&found);
        let on_seed: OnSeed = Arc::new(move |addrs: Vec<NetAddress>| sink.lock().extend(addrs));

        let tasks = seed_from_dns(
            vec!["good.seed".into(), "empty.seed".into(), "bad.seed".into()],
            18130,
            lookup,
            on_seed,
        );
        for task in tasks {
            task.await.unwrap();
        }

        let found = found.lock();
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|na| na.port == 18130));
    }
}
