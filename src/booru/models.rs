//! Wire models of the Derpibooru JSON API (`/api/v1/json`).

use serde::Deserialize;

/// Response of `GET /images/{id}`
#[derive(Debug, Deserialize)]
pub struct ImageResponse {
    /// The requested image
    pub image: ImageMeta,
}

/// Response of `GET /search/images`
#[derive(Debug, Deserialize)]
pub struct SearchResponse {
    /// Page of matching images
    #[serde(default)]
    pub images: Vec<ImageMeta>,
    /// Total number of matches
    #[serde(default)]
    pub total: u64,
}

/// Image metadata, reduced to the fields the client needs
#[derive(Debug, Clone, Deserialize)]
pub struct ImageMeta {
    /// Board identifier
    pub id: u64,
    /// File extension (`png`, `jpg`, `gif`, `webm`, ...)
    #[serde(default)]
    pub format: Option<String>,
    /// MIME type of the original file
    #[serde(default)]
    pub mime_type: Option<String>,
    /// Hidden by staff
    #[serde(default)]
    pub hidden_from_users: bool,
    /// Set when the image was deleted
    #[serde(default)]
    pub deletion_reason: Option<String>,
    /// Set when the image was merged into another one
    #[serde(default)]
    pub duplicate_of: Option<u64>,
    /// Links to the rendered sizes
    #[serde(default)]
    pub representations: Representations,
}

/// Rendered sizes of an image
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Representations {
    /// Original file
    pub full: Option<String>,
    /// Large preview, at most 1280x1024
    pub large: Option<String>,
}

impl ImageMeta {
    /// Whether the image is no longer publicly available
    #[must_use]
    pub fn is_removed(&self) -> bool {
        self.hidden_from_users || self.deletion_reason.is_some() || self.duplicate_of.is_some()
    }

    /// Whether the image is a video rather than a still picture
    #[must_use]
    pub fn is_video(&self) -> bool {
        let video_format = self
            .format
            .as_deref()
            .is_some_and(|f| matches!(f.to_ascii_lowercase().as_str(), "webm" | "mp4"));
        let video_mime = self
            .mime_type
            .as_deref()
            .is_some_and(|m| m.starts_with("video/"));
        video_format || video_mime
    }

    /// URL of the file to download: the large rendition, else the original
    #[must_use]
    pub fn download_url(&self) -> Option<&str> {
        self.representations
            .large
            .as_deref()
            .or(self.representations.full.as_deref())
    }

    /// File extension used for the local copy.
    ///
    /// Taken from the file actually downloaded, falling back to the original's
    /// format. Only ASCII letters and digits survive.
    #[must_use]
    pub fn extension(&self) -> String {
        let from_url = self
            .download_url()
            .and_then(|url| url.split(['?', '#']).next())
            .and_then(|path| path.rsplit('/').next())
            .and_then(|name| name.rsplit_once('.'))
            .and_then(|(_, ext)| sanitize_extension(ext));
        from_url
            .or_else(|| self.format.as_deref().and_then(sanitize_extension))
            .unwrap_or_else(|| "png".to_string())
    }
}

fn sanitize_extension(raw: &str) -> Option<String> {
    let ext: String = raw
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .take(8)
        .collect();
    (!ext.is_empty()).then_some(ext)
}
