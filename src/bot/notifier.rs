//! "Please wait" delivery over Telegram.

use super::{chat_id_of, resilient::send_message_resilient, texts};
use crate::coordination::{ChannelKey, Notifier};
use async_trait::async_trait;
use teloxide::Bot;
use tracing::warn;

/// Sends hold-on notices to the chat behind a channel key
#[derive(Clone)]
pub struct TelegramNotifier {
    bot: Bot,
}

impl TelegramNotifier {
    /// Create a notifier sending through `bot`
    #[must_use]
    pub const fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn hold_on(&self, key: &ChannelKey) {
        let Some(chat_id) = chat_id_of(key) else {
            warn!(channel = %key, "Channel key is not a Telegram chat");
            return;
        };
        if let Err(e) = send_message_resilient(&self.bot, chat_id, texts::HOLD_ON).await {
            warn!(channel = %key, error = %e, "Failed to send hold-on notice");
        }
    }
}
