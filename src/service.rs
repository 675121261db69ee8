//! Image service
//!
//! The entry point the chat layer calls. Combines the rating filter, the
//! continuation resolver and the request coordinator over an [`ImageSource`],
//! and keeps the remembered query in sync with the requests it runs.

use crate::booru::{
    build_search_query, DomainErrorKind, FetchError, Image, ImageSource, QueryError, RatingLimits,
};
use crate::coordination::{
    ChannelKey, ChannelStateStore, Continuation, ContinuationResolver, CoreConfig, Notifier,
    RequestCoordinator, RequestError,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Every outcome of a service call other than an image
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ServiceError {
    /// A query-less request had nothing to continue
    #[error("require-query")]
    RequireQuery,
    /// The query would escape the rating restriction
    #[error("invalid-query: {0}")]
    InvalidQuery(#[from] QueryError),
    /// The coordinated request did not produce an image
    #[error(transparent)]
    Request(#[from] RequestError),
}

impl ServiceError {
    /// Stable message key used by the chat layer to pick user-facing text.
    #[must_use]
    pub const fn message_key(&self) -> &'static str {
        match self {
            Self::RequireQuery => "require-query",
            Self::InvalidQuery(_) => "invalid-query",
            Self::Request(e) => e.message_key(),
        }
    }

    /// The domain failure behind this outcome, if any
    #[must_use]
    pub const fn domain_kind(&self) -> Option<DomainErrorKind> {
        match self {
            Self::Request(RequestError::Domain(kind)) => Some(*kind),
            _ => None,
        }
    }
}

/// Image requests for many channels against one image source
pub struct ImageService {
    source: Arc<dyn ImageSource>,
    store: Arc<ChannelStateStore>,
    coordinator: RequestCoordinator,
    resolver: ContinuationResolver,
    filter_id: u64,
    min_score: i64,
}

impl ImageService {
    /// Wire the request core around `source`
    #[must_use]
    pub fn new(
        source: Arc<dyn ImageSource>,
        notifier: Arc<dyn Notifier>,
        config: &CoreConfig,
    ) -> Self {
        let store = Arc::new(ChannelStateStore::new());
        Self {
            source,
            coordinator: RequestCoordinator::new(store.clone(), notifier, config),
            resolver: ContinuationResolver::new(store.clone(), config),
            store,
            filter_id: config.filter_id,
            min_score: config.min_score,
        }
    }

    /// Shared per-channel state
    #[must_use]
    pub const fn store(&self) -> &Arc<ChannelStateStore> {
        &self.store
    }

    /// Fetch a random image.
    ///
    /// With `query` set, searches for it and remembers it on success. Without
    /// a query, repeats the channel's remembered query if it is still fresh.
    ///
    /// # Errors
    ///
    /// [`ServiceError::RequireQuery`] if no query is given and none can be
    /// reused, [`ServiceError::InvalidQuery`] if the query could escape the
    /// rating restriction, otherwise the coordinator's outcome.
    pub async fn random(
        &self,
        key: &ChannelKey,
        query: Option<&str>,
        limits: RatingLimits,
    ) -> Result<Image, ServiceError> {
        let explicit = query.map(str::trim).filter(|q| !q.is_empty());
        // Resolved before admission, against the previous completion
        let raw = match explicit {
            Some(q) => q.to_string(),
            None => match self.resolver.resolve(key) {
                Continuation::Reuse(q) => q,
                Continuation::RequireQuery => return Err(ServiceError::RequireQuery),
            },
        };

        let search = build_search_query(&raw, &limits, self.min_score)?;
        debug!(channel = %key, %search, "Random search");

        let source = self.source.clone();
        let store = &self.store;
        let filter_id = self.filter_id;
        let remember = explicit.is_some();
        let image = self
            .coordinator
            .fetch(key, || async move {
                let image = source.fetch_random(filter_id, &search).await?;
                // Stored while the channel is still in flight
                if remember {
                    store.set_last_query(key, raw);
                }
                Ok::<_, FetchError>(image)
            })
            .await?;
        Ok(image)
    }

    /// Fetch a specific image. Forgets the channel's remembered query.
    ///
    /// # Errors
    ///
    /// The coordinator's outcome.
    pub async fn by_id(&self, key: &ChannelKey, id: u64) -> Result<Image, ServiceError> {
        let source = self.source.clone();
        let image = self
            .coordinator
            .fetch(key, || {
                // Only once admitted
                self.store.clear_last_query(key);
                async move { source.fetch_by_id(id).await }
            })
            .await?;
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::booru::{MockImageSource, R34Level};
    use async_trait::async_trait;
    use mockall::predicate::eq;
    use std::path::PathBuf;
    use std::time::Duration;

    struct SilentNotifier;

    #[async_trait]
    impl Notifier for SilentNotifier {
        async fn hold_on(&self, _key: &ChannelKey) {}
    }

    fn config() -> CoreConfig {
        CoreConfig {
            hold_on_time: Duration::from_secs(2),
            omit_hold_on_timeout: Duration::from_secs(10),
            another_timeout: Duration::from_secs(60),
            filter_id: 56027,
            min_score: 100,
        }
    }

    fn image(id: u64) -> Image {
        Image {
            id,
            local_path: PathBuf::from(format!("/cache/{id}.png")),
        }
    }

    fn service(source: MockImageSource) -> ImageService {
        ImageService::new(Arc::new(source), Arc::new(SilentNotifier), &config())
    }

    #[tokio::test(start_paused = true)]
    async fn test_random_builds_filtered_query() {
        let mut source = MockImageSource::new();
        source
            .expect_fetch_random()
            .with(eq(56027_u64), eq("(pony),score.gte:100,safe"))
            .times(1)
            .returning(|_, _| Ok(image(1)));
        let service = service(source);
        let key = ChannelKey::new("chat");

        let result = service
            .random(&key, Some("  pony "), RatingLimits::default())
            .await;
        assert_eq!(result, Ok(image(1)));
        assert_eq!(service.store().last_query(&key).as_deref(), Some("pony"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_another_reuses_last_query() {
        let mut source = MockImageSource::new();
        source
            .expect_fetch_random()
            .with(
                eq(56027_u64),
                eq("(pony),score.gte:100,-explicit,-grimdark,-semi-grimdark,-grotesque"),
            )
            .times(2)
            .returning(|_, _| Ok(image(2)));
        let service = service(source);
        let key = ChannelKey::new("chat");
        let limits = RatingLimits {
            r34: R34Level::Questionable,
            ..RatingLimits::default()
        };

        service
            .random(&key, Some("pony"), limits)
            .await
            .expect("explicit query succeeds");
        tokio::time::advance(Duration::from_secs(30)).await;

        let again = service.random(&key, None, limits).await;
        assert_eq!(again, Ok(image(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_another_expires() {
        let mut source = MockImageSource::new();
        source
            .expect_fetch_random()
            .times(1)
            .returning(|_, _| Ok(image(3)));
        let service = service(source);
        let key = ChannelKey::new("chat");

        service
            .random(&key, Some("pony"), RatingLimits::default())
            .await
            .expect("explicit query succeeds");
        tokio::time::advance(Duration::from_secs(61)).await;

        let again = service.random(&key, Some(" "), RatingLimits::default()).await;
        assert_eq!(again, Err(ServiceError::RequireQuery));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_search_keeps_previous_query() {
        let mut source = MockImageSource::new();
        source
            .expect_fetch_random()
            .with(eq(56027_u64), eq("(pony),score.gte:100,safe"))
            .returning(|_, _| Ok(image(4)));
        source
            .expect_fetch_random()
            .with(eq(56027_u64), eq("(nothing here),score.gte:100,safe"))
            .returning(|_, _| Err(FetchError::domain(DomainErrorKind::NoResult)));
        let service = service(source);
        let key = ChannelKey::new("chat");

        service
            .random(&key, Some("pony"), RatingLimits::default())
            .await
            .expect("first search succeeds");
        let failed = service
            .random(&key, Some("nothing here"), RatingLimits::default())
            .await;

        assert_eq!(failed.map_err(|e| e.message_key()), Err("no-result"));
        assert_eq!(service.store().last_query(&key).as_deref(), Some("pony"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_by_id_clears_last_query() {
        let mut source = MockImageSource::new();
        source
            .expect_fetch_random()
            .returning(|_, _| Ok(image(5)));
        source
            .expect_fetch_by_id()
            .with(eq(42_u64))
            .returning(|_| Err(FetchError::domain(DomainErrorKind::IsRemoved)));
        let service = service(source);
        let key = ChannelKey::new("chat");

        service
            .random(&key, Some("pony"), RatingLimits::default())
            .await
            .expect("search succeeds");
        let removed = service.by_id(&key, 42).await;
        assert_eq!(
            removed.err().and_then(|e| e.domain_kind()),
            Some(DomainErrorKind::IsRemoved)
        );

        let again = service.random(&key, None, RatingLimits::default()).await;
        assert_eq!(again, Err(ServiceError::RequireQuery));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_by_id_keeps_last_query() {
        let source = MockImageSource::new();
        let service = service(source);
        let key = ChannelKey::new("chat");
        service.store().set_last_query(&key, "pony");
        service.store().try_begin_request(&key, tokio::time::Instant::now());

        let rejected = service.by_id(&key, 1).await;
        assert_eq!(rejected, Err(ServiceError::Request(RequestError::Rejected)));
        assert_eq!(service.store().last_query(&key).as_deref(), Some("pony"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_escaping_its_group_is_refused() {
        let service = service(MockImageSource::new());
        let key = ChannelKey::new("chat");

        let result = service
            .random(&key, Some("pony) || (explicit"), RatingLimits::default())
            .await;
        assert_eq!(
            result,
            Err(ServiceError::InvalidQuery(QueryError::UnbalancedParentheses))
        );
        assert_eq!(result.map_err(|e| e.message_key()), Err("invalid-query"));
        assert!(!service.store().is_in_flight(&key));
        assert_eq!(service.store().last_query(&key), None);
    }

    /// Holds every search until a permit is added.
    struct GatedSearch {
        gate: tokio::sync::Semaphore,
    }

    #[async_trait]
    impl ImageSource for GatedSearch {
        async fn fetch_by_id(&self, id: u64) -> Result<Image, FetchError> {
            Ok(image(id))
        }

        async fn fetch_random(&self, _filter_id: u64, _query: &str) -> Result<Image, FetchError> {
            self.gate
                .acquire()
                .await
                .map_err(|e| FetchError::Internal(e.into()))?
                .forget();
            Ok(image(0))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_query_is_stored_before_channel_is_released() {
        let source = Arc::new(GatedSearch {
            gate: tokio::sync::Semaphore::new(0),
        });
        let service = Arc::new(ImageService::new(
            source.clone(),
            Arc::new(SilentNotifier),
            &config(),
        ));
        let key = ChannelKey::new("chat");

        let search = {
            let service = service.clone();
            let key = key.clone();
            tokio::spawn(async move {
                service
                    .random(&key, Some("pony"), RatingLimits::default())
                    .await
            })
        };
        while !service.store().is_in_flight(&key) {
            tokio::task::yield_now().await;
        }

        // Retries until the search releases the channel, then wins it
        let lookup = {
            let service = service.clone();
            let key = key.clone();
            tokio::spawn(async move {
                loop {
                    match service.by_id(&key, 9).await {
                        Err(ServiceError::Request(RequestError::Rejected)) => {
                            tokio::task::yield_now().await;
                        }
                        other => break other,
                    }
                }
            })
        };

        source.gate.add_permits(1);
        assert_eq!(search.await.expect("search task"), Ok(image(0)));
        assert_eq!(lookup.await.expect("lookup task"), Ok(image(9)));

        // The by-id request came last, so nothing is left to continue
        assert_eq!(service.store().last_query(&key), None);
        assert_eq!(
            service.random(&key, None, RatingLimits::default()).await,
            Err(ServiceError::RequireQuery)
        );
    }
}
