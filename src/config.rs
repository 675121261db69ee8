//! Configuration and settings management
//!
//! Loads settings from config files and environment variables and converts
//! them into the plain values the request core consumes.

use crate::booru::rating::{DarkLevel, R34Level, RatingError, RatingLimits};
use crate::coordination::CoreConfig;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Application settings loaded from environment variables
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Telegram Bot API token
    pub telegram_token: String,

    /// Comma-separated list of chat IDs allowed to use the bot; empty allows all
    #[serde(rename = "allowed_chats")]
    pub allowed_chats_str: Option<String>,

    /// Base URL of the image board
    #[serde(default = "default_board_url")]
    pub board_url: String,
    /// Image board API key
    pub api_key: Option<String>,
    /// Board filter applied to random searches
    #[serde(default = "default_filter_id")]
    pub filter_id: u64,
    /// Minimum score of randomly picked images
    #[serde(default = "default_min_score")]
    pub min_score: i64,

    /// Delay before a "please wait" notice is sent
    #[serde(default = "default_hold_on_time_ms")]
    pub hold_on_time_ms: u64,
    /// No notice if the channel's previous request completed more recently than this
    #[serde(default = "default_omit_hold_on_timeout_ms")]
    pub omit_hold_on_timeout_ms: u64,
    /// How long a random query stays available for `/another`
    #[serde(default = "default_another_timeout_ms")]
    pub another_timeout_ms: u64,

    /// Highest r34 level a chat may request (0..=3)
    #[serde(default = "default_max_r34_level")]
    pub max_r34_level: u8,
    /// Highest dark level a chat may request (0..=2)
    #[serde(default = "default_max_dark_level")]
    pub max_dark_level: u8,
    /// Whether grotesque images may be requested at all
    #[serde(default = "default_allow_grotesque")]
    pub allow_grotesque: bool,
    /// r34 level used when a request names none
    #[serde(default)]
    pub default_r34_level: u8,
    /// Dark level used when a request names none
    #[serde(default)]
    pub default_dark_level: u8,

    /// Directory downloaded images are stored in
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,
    /// How long a downloaded image is reused before it is fetched again
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

fn default_board_url() -> String {
    "https://derpibooru.org".to_string()
}

const fn default_filter_id() -> u64 {
    56027
}

const fn default_min_score() -> i64 {
    100
}

const fn default_hold_on_time_ms() -> u64 {
    3_000
}

const fn default_omit_hold_on_timeout_ms() -> u64 {
    10_000
}

const fn default_another_timeout_ms() -> u64 {
    600_000
}

const fn default_max_r34_level() -> u8 {
    3
}

const fn default_max_dark_level() -> u8 {
    2
}

const fn default_allow_grotesque() -> bool {
    true
}

fn default_cache_dir() -> String {
    "./cache".to_string()
}

const fn default_cache_ttl_secs() -> u64 {
    3_600
}

impl Settings {
    /// Create new settings by loading from environment and files
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use derpi_courier::config::Settings;
    ///
    /// let settings = Settings::new().expect("Failed to load configuration");
    /// ```
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading fails.
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
            // Not checked into git
            .add_source(File::with_name("config/local").required(false))
            // `APP_FILTER_ID=1 ./target/app` sets `filter_id`
            .add_source(Environment::with_prefix("APP").separator("__"))
            // UPPER_SNAKE_CASE without prefix; empty variables count as unset
            .add_source(Environment::default().ignore_empty(true))
            .build()?;

        s.try_deserialize()
    }

    /// Returns the set of chat IDs allowed to use the bot
    #[must_use]
    pub fn allowed_chats(&self) -> HashSet<i64> {
        self.allowed_chats_str
            .as_ref()
            .map(|s| {
                s.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
                    .filter(|token| !token.is_empty())
                    .filter_map(|id| id.parse::<i64>().ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether `chat_id` may use the bot
    #[must_use]
    pub fn is_chat_allowed(&self, chat_id: i64) -> bool {
        let allowed = self.allowed_chats();
        allowed.is_empty() || allowed.contains(&chat_id)
    }

    /// Timing and search values consumed by the request core
    #[must_use]
    pub const fn core_config(&self) -> CoreConfig {
        CoreConfig {
            hold_on_time: Duration::from_millis(self.hold_on_time_ms),
            omit_hold_on_timeout: Duration::from_millis(self.omit_hold_on_timeout_ms),
            another_timeout: Duration::from_millis(self.another_timeout_ms),
            filter_id: self.filter_id,
            min_score: self.min_score,
        }
    }

    /// Most permissive rating limits any request may reach
    ///
    /// # Errors
    ///
    /// Returns a `RatingError` if a configured level is out of range.
    pub fn max_limits(&self) -> Result<RatingLimits, RatingError> {
        Ok(RatingLimits {
            r34: R34Level::try_from(self.max_r34_level)?,
            dark: DarkLevel::try_from(self.max_dark_level)?,
            grotesque: self.allow_grotesque,
        })
    }

    /// Rating limits applied when a request names none, clamped to the maximum
    ///
    /// # Errors
    ///
    /// Returns a `RatingError` if a configured level is out of range.
    pub fn default_limits(&self) -> Result<RatingLimits, RatingError> {
        let defaults = RatingLimits {
            r34: R34Level::try_from(self.default_r34_level)?,
            dark: DarkLevel::try_from(self.default_dark_level)?,
            grotesque: false,
        };
        Ok(defaults.clamp_to(self.max_limits()?))
    }

    /// Directory downloaded images are stored in
    #[must_use]
    pub fn cache_path(&self) -> PathBuf {
        PathBuf::from(&self.cache_dir)
    }
}

/// Initial backoff between Telegram API retries
pub const TELEGRAM_API_INITIAL_BACKOFF_MS: u64 = 500;
/// Upper bound of the Telegram API retry backoff
pub const TELEGRAM_API_MAX_BACKOFF_MS: u64 = 4_000;
/// Retries of a failed Telegram API call
pub const TELEGRAM_API_MAX_RETRIES: usize = 3;

/// Timeout of a single image board request
pub const BOARD_REQUEST_TIMEOUT_SECS: u64 = 30;
/// Maximum number of cached image paths kept in memory
pub const IMAGE_CACHE_MAX_SIZE: u64 = 1_000;

/// Channels quiet for longer than this lose their state (24 hours)
pub const CHANNEL_STATE_IDLE_SECS: u64 = 86_400;
/// Interval between sweeps of idle channel state
pub const CHANNEL_STATE_SWEEP_SECS: u64 = 3_600;

#[cfg(test)]
pub(crate) fn test_settings() -> Settings {
    Settings {
        telegram_token: "dummy".to_string(),
        allowed_chats_str: None,
        board_url: default_board_url(),
        api_key: None,
        filter_id: default_filter_id(),
        min_score: default_min_score(),
        hold_on_time_ms: default_hold_on_time_ms(),
        omit_hold_on_timeout_ms: default_omit_hold_on_timeout_ms(),
        another_timeout_ms: default_another_timeout_ms(),
        max_r34_level: default_max_r34_level(),
        max_dark_level: default_max_dark_level(),
        allow_grotesque: default_allow_grotesque(),
        default_r34_level: 0,
        default_dark_level: 0,
        cache_dir: default_cache_dir(),
        cache_ttl_secs: default_cache_ttl_secs(),
    }
}
