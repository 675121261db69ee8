//! Image board access
//!
//! Defines the contract the request core relies on to obtain images, the
//! domain failures an image board can report, and the rating filter used to
//! restrict random searches.

/// HTTP client for Derpibooru-compatible boards
pub mod client;
/// Wire models of the board API
pub mod models;
/// Content rating limits and search filter construction
pub mod rating;

pub use client::DerpibooruClient;
pub use rating::{
    build_search_query, check_grouping, rating_terms, DarkLevel, QueryError, R34Level, RatingLimits,
};

use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// An image fetched from the board and stored locally
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    /// Image identifier on the board
    pub id: u64,
    /// Path of the downloaded file
    pub local_path: PathBuf,
}

/// Expected failures reported by an image source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DomainErrorKind {
    /// Image metadata could not be loaded
    MetadataError,
    /// Image file could not be downloaded
    ImageError,
    /// Image was removed, hidden or merged into a duplicate
    IsRemoved,
    /// Image is a video
    IsVideo,
    /// Search returned no images
    NoResult,
}

impl DomainErrorKind {
    /// Stable message key used by the chat layer to pick user-facing text.
    #[must_use]
    pub const fn message_key(self) -> &'static str {
        match self {
            Self::MetadataError => "metadata-error",
            Self::ImageError => "image-error",
            Self::IsRemoved => "is-removed",
            Self::IsVideo => "is-video",
            Self::NoResult => "no-result",
        }
    }
}

impl fmt::Display for DomainErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message_key())
    }
}

/// Failure of a single fetch operation
#[derive(Debug, Error)]
pub enum FetchError {
    /// Recognized failure, surfaced to the user by its message key
    #[error("{kind}")]
    Domain {
        /// What went wrong
        kind: DomainErrorKind,
        /// Underlying cause, kept for diagnostics only
        #[source]
        cause: Option<anyhow::Error>,
    },
    /// Anything the source could not classify
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl FetchError {
    /// Domain failure without an attached cause
    #[must_use]
    pub const fn domain(kind: DomainErrorKind) -> Self {
        Self::Domain { kind, cause: None }
    }

    /// Domain failure carrying the error that triggered it
    pub fn domain_with(kind: DomainErrorKind, cause: impl Into<anyhow::Error>) -> Self {
        Self::Domain {
            kind,
            cause: Some(cause.into()),
        }
    }
}

/// Source of images the request core draws from
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageSource: Send + Sync {
    /// Fetch a specific image by its board identifier.
    ///
    /// Domain failures: `metadata-error`, `image-error`, `is-removed`, `is-video`.
    async fn fetch_by_id(&self, id: u64) -> Result<Image, FetchError>;

    /// Fetch a random image matching `query` under the given board filter.
    ///
    /// In addition to the `fetch_by_id` failures, reports `no-result` when
    /// nothing matches.
    async fn fetch_random(&self, filter_id: u64, query: &str) -> Result<Image, FetchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_keys_are_stable() {
        assert_eq!(DomainErrorKind::MetadataError.message_key(), "metadata-error");
        assert_eq!(DomainErrorKind::ImageError.message_key(), "image-error");
        assert_eq!(DomainErrorKind::IsRemoved.message_key(), "is-removed");
        assert_eq!(DomainErrorKind::IsVideo.message_key(), "is-video");
        assert_eq!(DomainErrorKind::NoResult.message_key(), "no-result");
    }

    #[test]
    fn test_domain_error_display_uses_key() {
        let err = FetchError::domain_with(DomainErrorKind::IsVideo, anyhow::anyhow!("webm"));
        assert_eq!(err.to_string(), "is-video");
    }
}
