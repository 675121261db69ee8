//! User-facing texts, keyed by the stable message keys of the request core.

/// Sent when an image takes longer than the hold-on delay
pub const HOLD_ON: &str = "⏳ Hold on, fetching your image...";

/// Sent when `/derpi` gets something that is not an image id
pub const INVALID_ID: &str = "Please give a numeric image id, e.g. /derpi 1";

/// Text for a message key returned by the image service
#[must_use]
pub fn for_key(key: &str) -> &'static str {
    match key {
        "too-fast" => "🐢 Too fast! Wait until your previous image arrives.",
        "require-query" => "Please specify a search string, e.g. /random pony",
        "invalid-query" => "Check the search string: parentheses and quotes must be balanced.",
        "metadata-error" => "Could not load image information from the board.",
        "image-error" => "Could not download the image.",
        "is-removed" => "This image was removed from the board.",
        "is-video" => "This is a video, only images are supported.",
        "no-result" => "Nothing found for this search.",
        _ => "⚠️ Internal error, please try again later.",
    }
}

/// HTML caption of a delivered image, linking its board page
#[must_use]
pub fn caption(board_url: &str, image_id: u64) -> String {
    let url = format!("{}/images/{image_id}", board_url.trim_end_matches('/'));
    format!(
        "<a href=\"{}\">&gt;&gt;{image_id}</a>",
        html_escape::encode_double_quoted_attribute(&url)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_key_falls_back_to_internal_error() {
        assert_eq!(for_key("internal-error"), for_key("something-else"));
        assert_ne!(for_key("too-fast"), for_key("internal-error"));
        assert_ne!(for_key("invalid-query"), for_key("internal-error"));
    }

    #[test]
    fn test_caption_links_image_page() {
        assert_eq!(
            caption("https://derpibooru.org/", 42),
            "<a href=\"https://derpibooru.org/images/42\">&gt;&gt;42</a>"
        );
    }

    #[test]
    fn test_caption_escapes_board_url() {
        let caption = caption("https://board.example/?a=\"b\"", 1);
        assert!(caption.contains("&quot;b&quot;"));
    }
}
