//! Per-channel request coordination
//!
//! Decides whether an image request may proceed, when a "please wait" notice
//! is due, and whether a query-less follow-up can reuse a remembered query.
//! Transport-agnostic: channels are identified by an opaque [`ChannelKey`].

/// Reuse of the last random-search query
pub mod continuation;
/// Admission, hold-on notice and release of a single request
pub mod coordinator;
/// Per-channel state store
pub mod state;

pub use continuation::{Continuation, ContinuationResolver};
pub use coordinator::{Notifier, RequestCoordinator, RequestError};
pub use state::{Admission, ChannelKey, ChannelState, ChannelStateStore, Phase};

use std::time::Duration;

/// Values the request core consumes, resolved from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreConfig {
    /// Delay before a "please wait" notice is sent
    pub hold_on_time: Duration,
    /// Skip the notice if the previous request completed more recently than this
    pub omit_hold_on_timeout: Duration,
    /// Window in which the last query may be reused
    pub another_timeout: Duration,
    /// Board filter for random searches
    pub filter_id: u64,
    /// Quality floor of random searches
    pub min_score: i64,
}
