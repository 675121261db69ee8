//! Reuse of the last random-search query for query-less follow-ups.

use super::state::{ChannelKey, ChannelStateStore};
use super::CoreConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// What a query-less random request should search for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Continuation {
    /// Search again with the remembered query
    Reuse(String),
    /// Nothing reusable; the user has to name a query
    RequireQuery,
}

/// Decides whether a remembered query is still valid
pub struct ContinuationResolver {
    store: Arc<ChannelStateStore>,
    another_timeout: Duration,
}

impl ContinuationResolver {
    /// Create a resolver over a shared state store
    #[must_use]
    pub fn new(store: Arc<ChannelStateStore>, config: &CoreConfig) -> Self {
        Self {
            store,
            another_timeout: config.another_timeout,
        }
    }

    /// Resolve the query for a follow-up request on `key`.
    ///
    /// Must run before the follow-up is admitted: admission marks the channel
    /// in flight, after which the elapsed time no longer describes the
    /// request being continued.
    #[must_use]
    pub fn resolve(&self, key: &ChannelKey) -> Continuation {
        let elapsed = self.store.time_since_last_completion(key, Instant::now());
        let fresh = elapsed.is_some_and(|elapsed| elapsed <= self.another_timeout);

        match self.store.last_query(key) {
            Some(query) if fresh => Continuation::Reuse(query),
            Some(_) => {
                debug!(channel = %key, ?elapsed, "Remembered query expired");
                Continuation::RequireQuery
            }
            None => Continuation::RequireQuery,
        }
    }
}
