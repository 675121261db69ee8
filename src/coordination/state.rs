//! Per-channel request state
//!
//! Every chat channel gets one entry, created lazily on its first request. The
//! entry records whether a request is outstanding and when the last one
//! completed, plus the last explicit random-search query.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Opaque identifier of a chat channel
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelKey(String);

impl ChannelKey {
    /// Wrap a transport-specific channel identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The wrapped identifier
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Request phase of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No request has completed yet
    Never,
    /// No request outstanding
    Idle {
        /// When the last request completed
        completed_at: Instant,
    },
    /// A request is outstanding
    InFlight {
        /// Completion time of the request before this one, if any
        previous: Option<Instant>,
    },
}

impl Phase {
    const fn last_completion(self) -> Option<Instant> {
        match self {
            Self::Never => None,
            Self::Idle { completed_at } => Some(completed_at),
            Self::InFlight { previous } => previous,
        }
    }
}

/// State of a single channel
#[derive(Debug, Clone)]
pub struct ChannelState {
    /// Current request phase
    pub phase: Phase,
    /// Last explicit query of a successful random search
    pub last_query: Option<String>,
}

impl Default for ChannelState {
    fn default() -> Self {
        Self {
            phase: Phase::Never,
            last_query: None,
        }
    }
}

/// Proof that a channel was moved into the in-flight phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// Time since the previous completion; `None` if there never was one
    pub since_last_completion: Option<Duration>,
}

/// Concurrent store of per-channel state
///
/// Entries are sharded, and all read-modify-write operations on one key hold
/// that key's entry lock, so two concurrent requests for the same channel can
/// never both be admitted.
#[derive(Debug, Default)]
pub struct ChannelStateStore {
    channels: DashMap<ChannelKey, ChannelState>,
}

impl ChannelStateStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `key` in flight unless it already is.
    ///
    /// Returns `None` if a request for the channel is outstanding. Otherwise
    /// the returned admission carries the elapsed time since the previous
    /// completion, measured before the in-flight marker was set.
    pub fn try_begin_request(&self, key: &ChannelKey, now: Instant) -> Option<Admission> {
        let mut state = self.channels.entry(key.clone()).or_default();
        let previous = match state.phase {
            Phase::InFlight { .. } => return None,
            phase => phase.last_completion(),
        };
        state.phase = Phase::InFlight { previous };
        Some(Admission {
            since_last_completion: previous.map(|at| now.saturating_duration_since(at)),
        })
    }

    /// Elapsed time since the last completed request; `None` means never.
    #[must_use]
    pub fn time_since_last_completion(&self, key: &ChannelKey, now: Instant) -> Option<Duration> {
        self.channels
            .get(key)
            .and_then(|state| state.phase.last_completion())
            .map(|at| now.saturating_duration_since(at))
    }

    /// Record the completion of the outstanding request at `now`.
    pub fn end_request(&self, key: &ChannelKey, now: Instant) {
        self.channels.entry(key.clone()).or_default().phase = Phase::Idle { completed_at: now };
    }

    /// Whether a request for `key` is outstanding
    #[must_use]
    pub fn is_in_flight(&self, key: &ChannelKey) -> bool {
        self.channels
            .get(key)
            .is_some_and(|state| matches!(state.phase, Phase::InFlight { .. }))
    }

    /// Remember the query of a successful random search
    pub fn set_last_query(&self, key: &ChannelKey, query: impl Into<String>) {
        self.channels.entry(key.clone()).or_default().last_query = Some(query.into());
    }

    /// The remembered query, if any
    #[must_use]
    pub fn last_query(&self, key: &ChannelKey) -> Option<String> {
        self.channels
            .get(key)
            .and_then(|state| state.last_query.clone())
    }

    /// Forget the remembered query
    pub fn clear_last_query(&self, key: &ChannelKey) {
        if let Some(mut state) = self.channels.get_mut(key) {
            state.last_query = None;
        }
    }

    /// Snapshot of a channel's state
    #[must_use]
    pub fn snapshot(&self, key: &ChannelKey) -> Option<ChannelState> {
        self.channels.get(key).map(|state| state.value().clone())
    }

    /// Drop idle channels whose last completion is older than `older_than`.
    ///
    /// In-flight channels are always kept. Returns the number of removed entries.
    pub fn evict_idle(&self, older_than: Duration, now: Instant) -> usize {
        let before = self.channels.len();
        self.channels.retain(|_, state| match state.phase {
            Phase::InFlight { .. } => true,
            Phase::Never => false,
            Phase::Idle { completed_at } => {
                now.saturating_duration_since(completed_at) <= older_than
            }
        });
        let removed = before.saturating_sub(self.channels.len());
        if removed > 0 {
            debug!(removed, "Evicted idle channel state");
        }
        removed
    }

    /// Number of tracked channels
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether no channel is tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Remove a channel's entry, unless a request for it is outstanding
    pub fn remove(&self, key: &ChannelKey) -> bool {
        match self.channels.entry(key.clone()) {
            Entry::Occupied(entry) if !matches!(entry.get().phase, Phase::InFlight { .. }) => {
                entry.remove();
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str) -> ChannelKey {
        ChannelKey::new(id)
    }

    #[test]
    fn test_first_request_is_admitted() {
        let store = ChannelStateStore::new();
        let admission = store.try_begin_request(&key("a"), Instant::now());
        assert_eq!(
            admission,
            Some(Admission {
                since_last_completion: None
            })
        );
        assert!(store.is_in_flight(&key("a")));
    }

    #[test]
    fn test_second_request_rejected_while_in_flight() {
        let store = ChannelStateStore::new();
        let now = Instant::now();
        assert!(store.try_begin_request(&key("a"), now).is_some());
        assert!(store.try_begin_request(&key("a"), now).is_none());

        // Other channels are independent
        assert!(store.try_begin_request(&key("b"), now).is_some());
    }

    #[test]
    fn test_end_request_clears_in_flight() {
        let store = ChannelStateStore::new();
        let start = Instant::now();
        store.try_begin_request(&key("a"), start);
        store.end_request(&key("a"), start);
        assert!(!store.is_in_flight(&key("a")));

        let later = start + Duration::from_secs(7);
        let admission = store.try_begin_request(&key("a"), later);
        assert_eq!(
            admission.and_then(|a| a.since_last_completion),
            Some(Duration::from_secs(7))
        );
    }

    #[test]
    fn test_elapsed_survives_in_flight_phase() {
        let store = ChannelStateStore::new();
        let start = Instant::now();
        assert_eq!(store.time_since_last_completion(&key("a"), start), None);

        store.try_begin_request(&key("a"), start);
        store.end_request(&key("a"), start);
        store.try_begin_request(&key("a"), start + Duration::from_secs(1));

        assert_eq!(
            store.time_since_last_completion(&key("a"), start + Duration::from_secs(3)),
            Some(Duration::from_secs(3))
        );
    }

    #[test]
    fn test_last_query_roundtrip() {
        let store = ChannelStateStore::new();
        assert_eq!(store.last_query(&key("a")), None);

        store.set_last_query(&key("a"), "pony");
        assert_eq!(store.last_query(&key("a")).as_deref(), Some("pony"));

        store.clear_last_query(&key("a"));
        assert_eq!(store.last_query(&key("a")), None);
    }

    #[test]
    fn test_evict_idle_keeps_in_flight_and_recent() {
        let store = ChannelStateStore::new();
        let start = Instant::now();

        store.try_begin_request(&key("old"), start);
        store.end_request(&key("old"), start);
        store.try_begin_request(&key("busy"), start);
        store.try_begin_request(&key("recent"), start);
        store.end_request(&key("recent"), start + Duration::from_secs(50));

        let removed = store.evict_idle(Duration::from_secs(30), start + Duration::from_secs(60));
        assert_eq!(removed, 1);
        assert!(store.snapshot(&key("old")).is_none());
        assert!(store.is_in_flight(&key("busy")));
        assert!(store.snapshot(&key("recent")).is_some());
    }

    #[test]
    fn test_remove_refuses_in_flight() {
        let store = ChannelStateStore::new();
        store.try_begin_request(&key("a"), Instant::now());
        assert!(!store.remove(&key("a")));
        store.end_request(&key("a"), Instant::now());
        assert!(store.remove(&key("a")));
        assert!(store.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_admissions_admit_exactly_one() {
        const CONTENDERS: usize = 32;

        for _ in 0..20 {
            let store = std::sync::Arc::new(ChannelStateStore::new());
            let start = std::sync::Arc::new(tokio::sync::Barrier::new(CONTENDERS));

            let handles: Vec<_> = (0..CONTENDERS)
                .map(|_| {
                    let store = store.clone();
                    let start = start.clone();
                    tokio::spawn(async move {
                        start.wait().await;
                        store.try_begin_request(&key("shared"), Instant::now())
                    })
                })
                .collect();

            let mut admitted = 0;
            for handle in handles {
                if handle.await.expect("contender task").is_some() {
                    admitted += 1;
                }
            }
            assert_eq!(admitted, 1);
            assert!(store.is_in_flight(&key("shared")));
        }
    }
}
