use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::sources::SymbolLister;

/// A loaded set of tradable symbols and when it was fetched.
#[derive(Debug, Clone)]
pub struct SymbolSnapshot {
    pub symbols: HashSet<String>,
    pub refreshed_at: DateTime<Utc>,
}

impl SymbolSnapshot {
    /// Check if the snapshot is still valid
    pub fn is_valid(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.refreshed_at) < ttl
    }
}

#[derive(Debug, Default)]
struct State {
    snapshot: Option<SymbolSnapshot>,
    last_failed_attempt: Option<DateTime<Utc>>,
}

/// TTL cache of the symbols the exchange currently trades.
///
/// A failed refresh keeps the previous snapshot and is retried after
/// `retry_after`. Until a first listing succeeds every symbol counts as
/// available, so an unreachable listing endpoint never blocks synchronization.
pub struct SymbolAvailabilityCache {
    state: RwLock<State>,
    ttl: Duration,
    retry_after: Duration,
}

impl SymbolAvailabilityCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            state: RwLock::new(State::default()),
            ttl,
            retry_after: Duration::seconds(60).min(ttl),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn snapshot(&self) -> Option<SymbolSnapshot> {
        self.state.read().snapshot.clone()
    }

    pub fn replace(&self, symbols: HashSet<String>, now: DateTime<Utc>) {
        let mut state = self.state.write();
        state.snapshot = Some(SymbolSnapshot {
            symbols,
            refreshed_at: now,
        });
        state.last_failed_attempt = None;
    }

    /// Whether a refresh should be attempted at `now`.
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        let state = self.state.read();
        let stale = match &state.snapshot {
            Some(snapshot) => !snapshot.is_valid(self.ttl, now),
            None => true,
        };
        let backing_off = state
            .last_failed_attempt
            .map_or(false, |at| now.signed_duration_since(at) < self.retry_after);
        stale && !backing_off
    }

    /// Refresh from `lister` if the snapshot is stale.
    pub async fn ensure_fresh(&self, lister: &dyn SymbolLister, now: DateTime<Utc>) {
        if !self.needs_refresh(now) {
            return;
        }

        match lister.list_available_symbols().await {
            Ok(symbols) => {
                info!("Refreshed symbol availability cache: {} symbols", symbols.len());
                self.replace(symbols, now);
            }
            Err(e) => {
                warn!("Failed to refresh symbol availability, keeping previous snapshot: {}", e);
                self.state.write().last_failed_attempt = Some(now);
            }
        }
    }

    /// Membership test against the current snapshot, failing open when none is loaded.
    pub fn contains(&self, symbol: &str) -> bool {
        match &self.state.read().snapshot {
            Some(snapshot) => snapshot.symbols.contains(symbol),
            None => {
                debug!("No symbol snapshot loaded yet, treating {} as available", symbol);
                true
            }
        }
    }

    pub async fn is_available(&self, lister: &dyn SymbolLister, symbol: &str, now: DateTime<Utc>) -> bool {
        self.ensure_fresh(lister, now).await;
        self.contains(symbol)
    }
}

impl Default for SymbolAvailabilityCache {
    fn default() -> Self {
        // Default TTL: 1 hour
        Self::new(Duration::hours(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceError;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct CountingLister {
        calls: AtomicUsize,
        fail: AtomicBool,
    }

    impl CountingLister {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl SymbolLister for CountingLister {
        async fn list_available_symbols(&self) -> Result<HashSet<String>, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(SourceError::Malformed("listing down".into()));
            }
            Ok(["BTCUSDT".to_string(), "ETHUSDT".to_string()].into_iter().collect())
        }
    }

    fn at(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    #[tokio::test]
    async fn refreshes_only_after_ttl() {
        let cache = SymbolAvailabilityCache::new(Duration::hours(1));
        let lister = CountingLister::new();

        assert!(cache.is_available(&lister, "BTCUSDT", at(0)).await);
        assert!(!cache.is_available(&lister, "DOGEBTC", at(30)).await);
        assert_eq!(lister.calls.load(Ordering::SeqCst), 1);

        cache.is_available(&lister, "BTCUSDT", at(61)).await;
        assert_eq!(lister.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_snapshot() {
        let cache = SymbolAvailabilityCache::new(Duration::hours(1));
        let lister = CountingLister::new();
        cache.ensure_fresh(&lister, at(0)).await;

        lister.fail.store(true, Ordering::SeqCst);
        assert!(cache.is_available(&lister, "ETHUSDT", at(90)).await);
        assert!(!cache.is_available(&lister, "XRPUSDT", at(90)).await);
        assert_eq!(cache.snapshot().unwrap().refreshed_at, at(0));

        // Backing off: no new attempt within the retry window
        assert_eq!(lister.calls.load(Ordering::SeqCst), 2);
        cache.ensure_fresh(&lister, at(90)).await;
        assert_eq!(lister.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fails_open_without_any_snapshot() {
        let cache = SymbolAvailabilityCache::default();
        let lister = CountingLister::new();
        lister.fail.store(true, Ordering::SeqCst);
        assert!(cache.is_available(&lister, "ANYTHING", at(0)).await);
    }
}
