//! Share-ratio bans.
//!
//! The ban manager counts valid and invalid shares per remote address. Once
//! an address has submitted more than `check_threshold` shares, its invalid
//! ratio is evaluated: at or above `invalid_percent` the address is banned
//! for `time_secs`, otherwise its counters start over. Counters key off the
//! address, so reconnecting does not clear them.
//!
//! Ban records expire lazily on lookup and are swept by [`BanManager::run_purge`],
//! which also forgets counters of addresses that went quiet.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::BanningConfig;
use crate::tracing::prelude::*;

/// Valid/invalid share counts for one address.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ShareStats {
    pub valid: u32,
    pub invalid: u32,
}

impl ShareStats {
    pub fn total(&self) -> u32 {
        self.valid.saturating_add(self.invalid)
    }
}

/// Outcome of recording a share.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanVerdict {
    /// Below the check threshold, keep counting
    Continue,
    /// Evaluated and found acceptable; counters were reset
    Reset,
    /// Evaluated and banned; the connection must be dropped
    Banned,
}

/// Decide whether `valid`/`invalid` share counts warrant a ban.
pub fn should_ban(valid: u32, invalid: u32, config: &BanningConfig) -> bool {
    let total = valid.saturating_add(invalid);
    if total <= config.check_threshold || total == 0 {
        return false;
    }
    let ratio_bad = f64::from(invalid) / f64::from(total);
    ratio_bad >= config.invalid_percent / 100.0
}

#[derive(Debug)]
struct AddressStats {
    stats: ShareStats,
    last_seen: Instant,
}

#[derive(Debug, Default)]
pub struct BanManager {
    bans: Mutex<HashMap<IpAddr, Instant>>,
    stats: Mutex<HashMap<IpAddr, AddressStats>>,
}

impl BanManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ban `addr` for `duration`. A repeated ban replaces the expiry.
    pub fn ban(&self, addr: IpAddr, duration: Duration) {
        let expiry = Instant::now() + duration;
        self.bans.lock().insert(addr, expiry);
        info!(addr = %addr, secs = duration.as_secs(), "Banned address.");
    }

    pub fn is_banned(&self, addr: &IpAddr) -> bool {
        let mut bans = self.bans.lock();
        match bans.get(addr) {
            Some(expiry) if *expiry > Instant::now() => true,
            Some(_) => {
                bans.remove(addr);
                debug!(addr = %addr, "Ban expired.");
                false
            }
            None => false,
        }
    }

    /// Count a share from `addr` and evaluate it against `config`.
    pub fn record_share(&self, addr: IpAddr, valid: bool, config: &BanningConfig) -> BanVerdict {
        if !config.enabled {
            return BanVerdict::Continue;
        }

        let stats = {
            let now = Instant::now();
            let mut all = self.stats.lock();
            let entry = all.entry(addr).or_insert_with(|| AddressStats {
                stats: ShareStats::default(),
                last_seen: now,
            });
            entry.last_seen = now;
            let stats = &mut entry.stats;
            if valid {
                stats.valid = stats.valid.saturating_add(1);
            } else {
                stats.invalid = stats.invalid.saturating_add(1);
            }

            let snapshot = *stats;
            if snapshot.total() > config.check_threshold {
                all.remove(&addr);
            }
            snapshot
        };

        if stats.total() <= config.check_threshold {
            return BanVerdict::Continue;
        }

        if should_ban(stats.valid, stats.invalid, config) {
            warn!(
                addr = %addr,
                valid = stats.valid,
                invalid = stats.invalid,
                "Invalid share ratio exceeded."
            );
            self.ban(addr, config.ban_time());
            BanVerdict::Banned
        } else {
            BanVerdict::Reset
        }
    }

    /// Current counters for `addr`.
    pub fn stats(&self, addr: &IpAddr) -> ShareStats {
        self.stats
            .lock()
            .get(addr)
            .map(|entry| entry.stats)
            .unwrap_or_default()
    }

    /// Drop expired ban records and the counters of addresses without a
    /// share for `stats_ttl`. Returns how many ban records were removed.
    pub fn purge_expired(&self, stats_ttl: Duration) -> usize {
        let now = Instant::now();

        let mut stats = self.stats.lock();
        stats.retain(|_, entry| now.duration_since(entry.last_seen) < stats_ttl);
        drop(stats);

        let mut bans = self.bans.lock();
        let before = bans.len();
        bans.retain(|_, expiry| *expiry > now);
        before - bans.len()
    }

    /// Number of addresses with share counters.
    pub fn tracked_count(&self) -> usize {
        self.stats.lock().len()
    }

    pub fn ban_count(&self) -> usize {
        self.bans.lock().len()
    }

    /// Purge expired bans and idle counters every `interval` until `shutdown`.
    pub async fn run_purge(
        self: Arc<Self>,
        interval: Duration,
        stats_ttl: Duration,
        shutdown: CancellationToken,
    ) {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let purged = self.purge_expired(stats_ttl);
                    if purged > 0 {
                        debug!(purged, "Purged expired bans.");
                    }
                }
            }
        }
    }
}
