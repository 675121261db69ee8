//! Request coordinator
//!
//! Runs one image request for a channel: admission, an optional delayed
//! "please wait" notice, the fetch itself and the release of the channel.
//!
//! The release is tied to a guard, so the in-flight marker is cleared on every
//! exit path, including a dropped caller future. A panicking producer is
//! caught and reported as an internal failure.

use super::state::{Admission, ChannelKey, ChannelStateStore};
use super::CoreConfig;
use crate::booru::{DomainErrorKind, FetchError, Image};
use async_trait::async_trait;
use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, Instrument};

/// Delivery of the "please wait" notice
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Tell the channel that its image is on the way. Fire-and-forget.
    async fn hold_on(&self, key: &ChannelKey);
}

/// Outcome of a coordinated request other than an image
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RequestError {
    /// A request for the same channel is still outstanding
    #[error("too-fast")]
    Rejected,
    /// The image source reported an expected failure
    #[error("{0}")]
    Domain(DomainErrorKind),
    /// The image source failed unexpectedly; details are only logged
    #[error("internal-error")]
    Internal,
}

impl RequestError {
    /// Stable message key used by the chat layer to pick user-facing text.
    #[must_use]
    pub const fn message_key(&self) -> &'static str {
        match self {
            Self::Rejected => "too-fast",
            Self::Domain(kind) => kind.message_key(),
            Self::Internal => "internal-error",
        }
    }
}

/// One-shot "please wait" timer
struct NoticeTimer {
    token: CancellationToken,
}

impl NoticeTimer {
    fn arm(delay: Duration, key: ChannelKey, notifier: Arc<dyn Notifier>) -> Self {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        tokio::spawn(
            async move {
                tokio::select! {
                    biased;
                    () = cancelled.cancelled() => {}
                    () = tokio::time::sleep(delay) => {
                        debug!("Sending hold-on notice");
                        notifier.hold_on(&key).await;
                    }
                }
            }
            .in_current_span(),
        );
        Self { token }
    }

    /// Idempotent; a timer that already fired is unaffected.
    fn cancel(&self) {
        self.token.cancel();
    }
}

/// Releases the channel when the request scope ends
struct InFlightGuard<'a> {
    store: &'a ChannelStateStore,
    key: &'a ChannelKey,
    notice: Option<NoticeTimer>,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Some(notice) = self.notice.take() {
            notice.cancel();
        }
        self.store.end_request(self.key, Instant::now());
    }
}

/// Orchestrates image requests across channels
pub struct RequestCoordinator {
    store: Arc<ChannelStateStore>,
    notifier: Arc<dyn Notifier>,
    hold_on_time: Duration,
    omit_hold_on_timeout: Duration,
}

impl RequestCoordinator {
    /// Create a coordinator over a shared state store
    #[must_use]
    pub fn new(
        store: Arc<ChannelStateStore>,
        notifier: Arc<dyn Notifier>,
        config: &CoreConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            hold_on_time: config.hold_on_time,
            omit_hold_on_timeout: config.omit_hold_on_timeout,
        }
    }

    /// The state store this coordinator admits requests against
    #[must_use]
    pub const fn store(&self) -> &Arc<ChannelStateStore> {
        &self.store
    }

    /// Run `producer` for `key` unless the channel is already busy.
    ///
    /// # Errors
    ///
    /// - [`RequestError::Rejected`] if a request for `key` is outstanding; the
    ///   channel state is left untouched.
    /// - [`RequestError::Domain`] for expected failures of the producer.
    /// - [`RequestError::Internal`] for anything else the producer reports.
    #[instrument(skip(self, key, producer), fields(channel = %key))]
    pub async fn fetch<F, Fut>(&self, key: &ChannelKey, producer: F) -> Result<Image, RequestError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Image, FetchError>>,
    {
        let Some(admission) = self.store.try_begin_request(key, Instant::now()) else {
            debug!("Request rejected, channel busy");
            return Err(RequestError::Rejected);
        };

        let guard = InFlightGuard {
            store: &self.store,
            key,
            notice: self.arm_notice(key, admission),
        };
        let outcome = AssertUnwindSafe(async move { producer().await })
            .catch_unwind()
            .await;
        drop(guard);

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .copied()
                    .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
                    .unwrap_or("non-string panic payload");
                error!(reason, "Image producer panicked");
                return Err(RequestError::Internal);
            }
        };

        match outcome {
            Ok(image) => {
                info!(image_id = image.id, "Image delivered");
                Ok(image)
            }
            Err(FetchError::Domain { kind, cause }) => {
                if let Some(cause) = cause {
                    let cause = format!("{cause:#}");
                    debug!(%kind, error = %cause, "Fetch failed");
                } else {
                    debug!(%kind, "Fetch failed");
                }
                Err(RequestError::Domain(kind))
            }
            Err(FetchError::Internal(e)) => {
                error!(error = ?e, "Unexpected failure while fetching image");
                Err(RequestError::Internal)
            }
        }
    }

    fn arm_notice(&self, key: &ChannelKey, admission: Admission) -> Option<NoticeTimer> {
        let quiet_long_enough = admission
            .since_last_completion
            .is_none_or(|elapsed| elapsed > self.omit_hold_on_timeout);
        quiet_long_enough
            .then(|| NoticeTimer::arm(self.hold_on_time, key.clone(), self.notifier.clone()))
    }
}
