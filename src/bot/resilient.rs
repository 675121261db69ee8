//! Resilient messaging utilities with automatic retry for Telegram API operations.
//!
//! Wraps sends that must survive transient network failures, using
//! exponential backoff with jitter.
//!
//! # Usage
//!
//! ```ignore
//! use derpi_courier::bot::resilient::send_message_resilient;
//!
//! let msg = send_message_resilient(&bot, chat_id, "Hold on...").await?;
//! ```

use anyhow::Result;
use std::path::Path;
use teloxide::prelude::*;
use teloxide::types::{ChatId, InputFile, Message, ParseMode};

/// Send a text message with automatic retry on network failures.
///
/// # Errors
///
/// Returns an error after all retries are exhausted.
pub async fn send_message_resilient(
    bot: &Bot,
    chat_id: ChatId,
    text: impl Into<String>,
) -> Result<Message> {
    let text = text.into();
    crate::utils::retry_telegram_operation(|| async {
        bot.send_message(chat_id, text.clone())
            .await
            .map_err(|e| anyhow::anyhow!("Telegram send error: {e}"))
    })
    .await
}

/// Send a local image file with an HTML caption, retrying on network failures.
///
/// # Errors
///
/// Returns an error after all retries are exhausted.
pub async fn send_photo_resilient(
    bot: &Bot,
    chat_id: ChatId,
    path: &Path,
    caption: &str,
) -> Result<Message> {
    crate::utils::retry_telegram_operation(|| async {
        bot.send_photo(chat_id, InputFile::file(path.to_path_buf()))
            .caption(caption)
            .parse_mode(ParseMode::Html)
            .await
            .map_err(|e| anyhow::anyhow!("Telegram photo error: {e}"))
    })
    .await
}
