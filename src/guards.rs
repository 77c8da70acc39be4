//! In-memory concurrency guards.
//!
//! Four independent, time-bounded mechanisms protect against duplicate
//! concurrent work: an interaction dedupe window, a per-channel
//! charge-creation lock, a per-customer ticket-creation lock, and a
//! per-payment delivery lock. All state lives in this process and is
//! disposable on restart; the ledger stays the final authority on whether an
//! order was delivered.

use crate::config::AppConfig;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct GuardConfig {
    pub dedupe_window: Duration,
    pub channel_lock_ttl: Duration,
    pub ticket_lock_ttl: Duration,
    pub delivery_lock_ttl: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            dedupe_window: Duration::from_millis(12_000),
            channel_lock_ttl: Duration::from_millis(15_000),
            ticket_lock_ttl: Duration::from_millis(30_000),
            delivery_lock_ttl: Duration::from_millis(120_000),
        }
    }
}

impl From<&AppConfig> for GuardConfig {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            dedupe_window: cfg.interaction_dedupe_window(),
            channel_lock_ttl: cfg.channel_lock_ttl(),
            ticket_lock_ttl: cfg.ticket_lock_ttl(),
            delivery_lock_ttl: cfg.delivery_lock_ttl(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    token: u64,
    expires_at: Instant,
}

/// RAII lease over one keyed lock slot. Dropping releases the slot, but only
/// if this lease still owns it; a slot that expired and was re-acquired by
/// someone else is left alone.
#[derive(Debug)]
pub struct LeaseGuard {
    map: Arc<DashMap<String, Slot>>,
    key: String,
    token: u64,
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.map
            .remove_if(&self.key, |_, slot| slot.token == self.token);
    }
}

/// Time-bounded duplicate-suppression and locking for the orchestrator.
pub struct GuardService {
    config: GuardConfig,
    next_token: AtomicU64,
    seen_events: DashMap<String, Instant>,
    channel_locks: Arc<DashMap<String, Slot>>,
    ticket_locks: Arc<DashMap<String, Slot>>,
    delivery_locks: Arc<DashMap<String, Slot>>,
}

impl GuardService {
    pub fn new(config: GuardConfig) -> Self {
        Self {
            config,
            next_token: AtomicU64::new(1),
            seen_events: DashMap::new(),
            channel_locks: Arc::new(DashMap::new()),
            ticket_locks: Arc::new(DashMap::new()),
            delivery_locks: Arc::new(DashMap::new()),
        }
    }

    fn token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    /// Records an inbound interaction id and reports whether it was already
    /// seen within the trailing dedupe window. Expired entries are swept
    /// lazily on each call; there is no background reaper.
    pub fn is_duplicate_event(&self, event_id: &str) -> bool {
        let now = Instant::now();
        let window = self.config.dedupe_window;
        self.seen_events
            .retain(|_, first_seen| now.duration_since(*first_seen) <= window);

        if self.seen_events.contains_key(event_id) {
            debug!(event_id, "dropping duplicate interaction");
            return true;
        }
        self.seen_events.insert(event_id.to_string(), now);
        false
    }

    fn acquire(
        map: &Arc<DashMap<String, Slot>>,
        key: &str,
        token: u64,
        ttl: Duration,
    ) -> Result<LeaseGuard, Duration> {
        let now = Instant::now();
        // DashMap::entry holds the shard lock, so check-then-set is atomic.
        match map.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let slot = *occupied.get();
                if slot.expires_at > now {
                    return Err(slot.expires_at - now);
                }
                occupied.insert(Slot {
                    token,
                    expires_at: now + ttl,
                });
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(Slot {
                    token,
                    expires_at: now + ttl,
                });
            }
        }
        Ok(LeaseGuard {
            map: Arc::clone(map),
            key: key.to_string(),
            token,
        })
    }

    /// Serializes charge creation within one channel. A second attempt while
    /// the lock is held gets the remaining wait back instead of queueing.
    pub fn lock_channel(&self, channel_id: &str) -> Result<LeaseGuard, Duration> {
        Self::acquire(
            &self.channel_locks,
            channel_id,
            self.token(),
            self.config.channel_lock_ttl,
        )
    }

    /// Admits one in-flight ticket creation per customer.
    pub fn lock_ticket_creation(&self, customer_id: &str) -> Option<LeaseGuard> {
        Self::acquire(
            &self.ticket_locks,
            customer_id,
            self.token(),
            self.config.ticket_lock_ttl,
        )
        .ok()
    }

    /// Admits one in-flight delivery per payment id. Second layer on top of
    /// the ledger's terminal-state check, because check-then-act on the
    /// ledger is not atomic across two concurrent webhook deliveries.
    pub fn begin_delivery(&self, payment_id: &str) -> Option<LeaseGuard> {
        Self::acquire(
            &self.delivery_locks,
            payment_id,
            self.token(),
            self.config.delivery_lock_ttl,
        )
        .ok()
    }

    /// Drops any channel lock left behind by a deleted channel.
    pub fn forget_channel(&self, channel_id: &str) {
        self.channel_locks.remove(channel_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn short_config() -> GuardConfig {
        GuardConfig {
            dedupe_window: Duration::from_millis(50),
            channel_lock_ttl: Duration::from_millis(50),
            ticket_lock_ttl: Duration::from_millis(50),
            delivery_lock_ttl: Duration::from_millis(50),
        }
    }

    #[test]
    fn duplicate_event_is_dropped_within_window() {
        let guards = GuardService::new(GuardConfig::default());
        assert!(!guards.is_duplicate_event("evt-1"));
        assert!(guards.is_duplicate_event("evt-1"));
        assert!(!guards.is_duplicate_event("evt-2"));
    }

    #[test]
    fn dedupe_window_expires() {
        let guards = GuardService::new(short_config());
        assert!(!guards.is_duplicate_event("evt-1"));
        thread::sleep(Duration::from_millis(80));
        assert!(!guards.is_duplicate_event("evt-1"));
    }

    #[test]
    fn channel_lock_is_single_holder() {
        let guards = GuardService::new(GuardConfig::default());
        let held = guards.lock_channel("chan-1").expect("first acquire");
        let wait = guards.lock_channel("chan-1").expect_err("second rejected");
        assert!(wait > Duration::ZERO);
        drop(held);
        assert!(guards.lock_channel("chan-1").is_ok());
    }

    #[test]
    fn channel_lock_expires_via_ttl() {
        let guards = GuardService::new(short_config());
        let stuck = guards.lock_channel("chan-1").expect("first acquire");
        // simulate a crashed handler that never releases
        std::mem::forget(stuck);
        thread::sleep(Duration::from_millis(80));
        assert!(guards.lock_channel("chan-1").is_ok());
    }

    #[test]
    fn stale_lease_does_not_release_new_holder() {
        let guards = GuardService::new(short_config());
        let stale = guards.lock_channel("chan-1").expect("first acquire");
        thread::sleep(Duration::from_millis(80));
        let fresh = guards.lock_channel("chan-1").expect("reacquire after ttl");
        drop(stale);
        // fresh holder must still be in place
        assert!(guards.lock_channel("chan-1").is_err());
        drop(fresh);
        assert!(guards.lock_channel("chan-1").is_ok());
    }

    #[test]
    fn delivery_lock_admits_exactly_one_concurrent_holder() {
        let guards = Arc::new(GuardService::new(GuardConfig::default()));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let guards = Arc::clone(&guards);
            handles.push(thread::spawn(move || guards.begin_delivery("pay-77")));
        }
        let leases: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().expect("thread finished"))
            .collect();
        let admitted = leases.iter().filter(|l| l.is_some()).count();
        assert_eq!(admitted, 1, "exactly one concurrent delivery admitted");
    }

    #[test]
    fn ticket_lock_released_on_drop() {
        let guards = GuardService::new(GuardConfig::default());
        {
            let _lease = guards.lock_ticket_creation("user-1").expect("acquired");
            assert!(guards.lock_ticket_creation("user-1").is_none());
        }
        assert!(guards.lock_ticket_creation("user-1").is_some());
    }
}
