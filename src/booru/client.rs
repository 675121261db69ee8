//! Derpibooru API client
//!
//! Loads image metadata, picks random images from searches and downloads the
//! picked file into the local cache directory.

use super::models::{ImageMeta, ImageResponse, SearchResponse};
use super::{DomainErrorKind, FetchError, Image, ImageSource};
use crate::config::{Settings, BOARD_REQUEST_TIMEOUT_SECS, IMAGE_CACHE_MAX_SIZE};
use async_trait::async_trait;
use futures_util::StreamExt;
use moka::future::Cache;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Errors raised while talking to the board or writing the cache
#[derive(Debug, Error)]
pub enum ClientError {
    /// Request could not be sent or the response could not be read
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    /// Cache directory or file could not be written
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// HTTP client for Derpibooru-compatible boards
pub struct DerpibooruClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    cache_dir: PathBuf,
    /// image id -> downloaded file
    downloads: Cache<u64, PathBuf>,
}

impl DerpibooruClient {
    /// Create a client from application settings
    ///
    /// # Errors
    ///
    /// Returns a `ClientError` if the HTTP client cannot be built.
    pub fn new(settings: &Settings) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(BOARD_REQUEST_TIMEOUT_SECS))
            .build()?;

        let downloads = Cache::builder()
            .max_capacity(IMAGE_CACHE_MAX_SIZE)
            .time_to_live(Duration::from_secs(settings.cache_ttl_secs))
            .build();

        Ok(Self {
            http,
            base_url: settings.board_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone().filter(|key| !key.is_empty()),
            cache_dir: settings.cache_path(),
            downloads,
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/api/v1/json/{path}", self.base_url)
    }

    fn with_key(&self, mut params: Vec<(&'static str, String)>) -> Vec<(&'static str, String)> {
        if let Some(key) = &self.api_key {
            params.push(("key", key.clone()));
        }
        params
    }

    async fn image_meta(&self, id: u64) -> Result<ImageMeta, ClientError> {
        let response = self
            .http
            .get(self.api_url(&format!("images/{id}")))
            .query(&self.with_key(Vec::new()))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<ImageResponse>().await?.image)
    }

    async fn search_random(
        &self,
        filter_id: u64,
        query: &str,
    ) -> Result<Option<ImageMeta>, ClientError> {
        let params = self.with_key(vec![
            ("q", query.to_string()),
            ("filter_id", filter_id.to_string()),
            ("sf", "random".to_string()),
            ("per_page", "1".to_string()),
        ]);
        let response = self
            .http
            .get(self.api_url("search/images"))
            .query(&params)
            .send()
            .await?
            .error_for_status()?;
        let search: SearchResponse = response.json().await?;
        debug!(total = search.total, "Search finished");
        Ok(search.images.into_iter().next())
    }

    async fn deliver(&self, meta: &ImageMeta) -> Result<Image, FetchError> {
        let url = deliverable_url(meta)?;

        let target = self.cache_dir.join(format!("{}.{}", meta.id, meta.extension()));
        if let Some(path) = self.downloads.get(&meta.id).await {
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                debug!(image_id = meta.id, "Serving image from cache");
                return Ok(Image {
                    id: meta.id,
                    local_path: path,
                });
            }
        }

        tokio::fs::create_dir_all(&self.cache_dir)
            .await
            .map_err(|e| FetchError::Internal(e.into()))?;

        match self.download(&url, &target).await {
            Ok(()) => {
                self.downloads.insert(meta.id, target.clone()).await;
                Ok(Image {
                    id: meta.id,
                    local_path: target,
                })
            }
            Err(ClientError::Io(e)) => Err(FetchError::Internal(e.into())),
            Err(e) => Err(FetchError::domain_with(DomainErrorKind::ImageError, e)),
        }
    }

    /// Stream `url` into a temporary file next to `target`, then move it in place.
    async fn download(&self, url: &str, target: &Path) -> Result<(), ClientError> {
        let partial = target.with_file_name(format!(".{}.part", Uuid::new_v4()));
        let result = self.stream_to(url, &partial).await;
        let result = match result {
            Ok(()) => tokio::fs::rename(&partial, target).await.map_err(ClientError::from),
            Err(e) => Err(e),
        };
        if result.is_err() {
            match tokio::fs::remove_file(&partial).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                    warn!(path = %partial.display(), error = %e, "Failed to remove partial download");
                }
                _ => {}
            }
        }
        result
    }

    async fn stream_to(&self, url: &str, path: &Path) -> Result<(), ClientError> {
        let response = self.http.get(url).send().await?.error_for_status()?;
        let mut file = tokio::fs::File::create(path).await?;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        Ok(())
    }
}

/// Download URL of `meta`, or the domain failure that prevents sending it.
fn deliverable_url(meta: &ImageMeta) -> Result<String, FetchError> {
    if meta.is_removed() {
        return Err(FetchError::domain(DomainErrorKind::IsRemoved));
    }
    if meta.is_video() {
        return Err(FetchError::domain(DomainErrorKind::IsVideo));
    }
    meta.download_url()
        .map(absolute_url)
        .ok_or_else(|| FetchError::domain(DomainErrorKind::ImageError))
}

/// The CDN sometimes hands out protocol-relative links.
fn absolute_url(url: &str) -> String {
    if url.starts_with("//") {
        format!("https:{url}")
    } else {
        url.to_string()
    }
}

#[async_trait]
impl ImageSource for DerpibooruClient {
    #[instrument(skip(self))]
    async fn fetch_by_id(&self, id: u64) -> Result<Image, FetchError> {
        let meta = self
            .image_meta(id)
            .await
            .map_err(|e| FetchError::domain_with(DomainErrorKind::MetadataError, e))?;
        self.deliver(&meta).await
    }

    #[instrument(skip(self))]
    async fn fetch_random(&self, filter_id: u64, query: &str) -> Result<Image, FetchError> {
        let meta = self
            .search_random(filter_id, query)
            .await
            .map_err(|e| FetchError::domain_with(DomainErrorKind::MetadataError, e))?
            .ok_or_else(|| FetchError::domain(DomainErrorKind::NoResult))?;
        self.deliver(&meta).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::booru::models::Representations;
    use crate::config::test_settings;

    fn meta() -> ImageMeta {
        ImageMeta {
            id: 7,
            format: Some("png".to_string()),
            mime_type: Some("image/png".to_string()),
            hidden_from_users: false,
            deletion_reason: None,
            duplicate_of: None,
            representations: Representations {
                full: Some("//derpicdn.net/img/view/7.png".to_string()),
                large: None,
            },
        }
    }

    fn kind_of(err: FetchError) -> Option<DomainErrorKind> {
        match err {
            FetchError::Domain { kind, .. } => Some(kind),
            FetchError::Internal(_) => None,
        }
    }

    #[test]
    fn test_deliverable_url_makes_links_absolute() -> Result<(), FetchError> {
        assert_eq!(deliverable_url(&meta())?, "https://derpicdn.net/img/view/7.png");
        Ok(())
    }

    #[test]
    fn test_removed_image_is_rejected() {
        let mut removed = meta();
        removed.deletion_reason = Some("Rule #0".to_string());
        let err = deliverable_url(&removed).err().and_then(kind_of);
        assert_eq!(err, Some(DomainErrorKind::IsRemoved));
    }

    #[test]
    fn test_video_is_rejected() {
        let mut video = meta();
        video.format = Some("webm".to_string());
        let err = deliverable_url(&video).err().and_then(kind_of);
        assert_eq!(err, Some(DomainErrorKind::IsVideo));
    }

    #[test]
    fn test_missing_representation_is_image_error() {
        let mut bare = meta();
        bare.representations = Representations::default();
        let err = deliverable_url(&bare).err().and_then(kind_of);
        assert_eq!(err, Some(DomainErrorKind::ImageError));
    }

    #[test]
    fn test_api_url_and_key() -> Result<(), ClientError> {
        let mut settings = test_settings();
        settings.board_url = "https://booru.example/".to_string();
        settings.api_key = Some("secret".to_string());
        let client = DerpibooruClient::new(&settings)?;

        assert_eq!(
            client.api_url("images/1"),
            "https://booru.example/api/v1/json/images/1"
        );
        assert_eq!(
            client.with_key(Vec::new()),
            vec![("key", "secret".to_string())]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_unreachable_board_is_metadata_error() -> Result<(), ClientError> {
        let mut settings = test_settings();
        settings.board_url = "http://127.0.0.1:9".to_string();
        let client = DerpibooruClient::new(&settings)?;

        let err = client.fetch_by_id(1).await.err().and_then(kind_of);
        assert_eq!(err, Some(DomainErrorKind::MetadataError));
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_download_leaves_no_partial_file() -> Result<(), Box<dyn std::error::Error>> {
        let cache = tempfile::tempdir()?;
        let mut settings = test_settings();
        settings.cache_dir = cache.path().display().to_string();
        let client = DerpibooruClient::new(&settings)?;

        let mut unreachable = meta();
        unreachable.representations.full = Some("http://127.0.0.1:9/7.png".to_string());
        let err = client.deliver(&unreachable).await.err().and_then(kind_of);

        assert_eq!(err, Some(DomainErrorKind::ImageError));
        assert_eq!(std::fs::read_dir(cache.path())?.count(), 0);
        Ok(())
    }
}
