//! Telegram transport
//!
//! Maps chats to channel keys, parses commands, and turns service outcomes
//! into messages.

/// Command parsing and dispatch
pub mod handlers;
/// Hold-on notice delivery
pub mod notifier;
/// Sends with retry on transient Telegram failures
pub mod resilient;
/// User-facing texts
pub mod texts;

pub use notifier::TelegramNotifier;

use crate::coordination::ChannelKey;
use teloxide::types::ChatId;

/// Channel key of a Telegram chat
#[must_use]
pub fn channel_key(chat_id: ChatId) -> ChannelKey {
    ChannelKey::new(chat_id.0.to_string())
}

/// Telegram chat behind a channel key created by [`channel_key`]
#[must_use]
pub fn chat_id_of(key: &ChannelKey) -> Option<ChatId> {
    key.as_str().parse().ok().map(ChatId)
}
