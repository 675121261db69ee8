use derpi_courier::booru::DerpibooruClient;
use derpi_courier::bot::handlers::{handle_command, Command};
use derpi_courier::bot::TelegramNotifier;
use derpi_courier::config::{Settings, CHANNEL_STATE_IDLE_SECS, CHANNEL_STATE_SWEEP_SECS};
use derpi_courier::coordination::ChannelStateStore;
use derpi_courier::service::ImageService;
use dotenvy::dotenv;
use regex::Regex;
use std::convert::Infallible;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;
use teloxide::dispatching::UpdateHandler;
use teloxide::prelude::*;
use tracing::{error, info};
use tracing_subscriber::{prelude::*, EnvFilter};

/// Regex patterns for redacting secrets from log output
struct RedactionPatterns {
    token_url: Regex,
    token: Regex,
    api_key: Regex,
}

impl RedactionPatterns {
    /// # Errors
    ///
    /// Returns an error if any regex pattern is invalid
    fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            token_url: Regex::new(r"(https?://[^/]+/bot)([0-9]+:[A-Za-z0-9_-]+)(/['\s]*)")?,
            token: Regex::new(r"([0-9]{8,10}:[A-Za-z0-9_-]{35})")?,
            api_key: Regex::new(r"([?&]key=)[^\s&]+")?,
        })
    }

    fn redact(&self, input: &str) -> String {
        let output = self
            .token_url
            .replace_all(input, "$1[TELEGRAM_TOKEN]$3")
            .to_string();
        let output = self
            .token
            .replace_all(&output, "[TELEGRAM_TOKEN]")
            .to_string();
        self.api_key
            .replace_all(&output, "${1}[MASKED]")
            .to_string()
    }
}

struct RedactingWriter<W: Write> {
    inner: W,
    patterns: Arc<RedactionPatterns>,
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let s = String::from_utf8_lossy(buf);
        let redacted = self.patterns.redact(&s);
        self.inner.write_all(redacted.as_bytes())?;
        // Report the original length even if redaction changed it.
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct RedactingMakeWriter<F> {
    make_inner: F,
    patterns: Arc<RedactionPatterns>,
}

impl<'a, F, W> tracing_subscriber::fmt::MakeWriter<'a> for RedactingMakeWriter<F>
where
    F: Fn() -> W + 'static,
    W: Write,
{
    type Writer = RedactingWriter<W>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter {
            inner: (self.make_inner)(),
            patterns: self.patterns.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    let patterns = Arc::new(RedactionPatterns::new().map_err(|e| {
        eprintln!("Failed to compile regex patterns: {e}");
        e
    })?);
    init_logging(patterns);

    info!("Starting derpi courier...");

    let settings = init_settings();
    // Fail at startup rather than on the first request
    settings.max_limits()?;
    settings.default_limits()?;

    let bot = Bot::new(settings.telegram_token.clone());
    let client = DerpibooruClient::new(&settings)?;
    info!(board = %settings.board_url, "Image board client initialized.");

    let service = Arc::new(ImageService::new(
        Arc::new(client),
        Arc::new(TelegramNotifier::new(bot.clone())),
        &settings.core_config(),
    ));
    spawn_state_sweeper(service.store().clone());

    info!("Bot is running...");

    Dispatcher::builder(bot, setup_handler())
        .dependencies(dptree::deps![service, settings])
        .distribution_function(distribute_concurrently)
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}

fn init_logging(patterns: Arc<RedactionPatterns>) {
    let make_writer = RedactingMakeWriter {
        make_inner: io::stderr,
        patterns,
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(make_writer))
        .init();
}

fn init_settings() -> Arc<Settings> {
    match Settings::new() {
        Ok(s) => {
            info!("Configuration loaded successfully.");
            Arc::new(s)
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    }
}

/// Periodically drop state of channels that have been quiet for a long time.
fn spawn_state_sweeper(store: Arc<ChannelStateStore>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(CHANNEL_STATE_SWEEP_SECS));
        loop {
            interval.tick().await;
            store.evict_idle(
                Duration::from_secs(CHANNEL_STATE_IDLE_SECS),
                tokio::time::Instant::now(),
            );
        }
    });
}

/// Handle every update in its own task.
///
/// The default keys updates by chat and runs each chat's updates one after
/// another, which would queue a second request behind the first instead of
/// letting the coordinator reject it as too fast.
const fn distribute_concurrently(_update: &Update) -> Option<Infallible> {
    None
}

fn setup_handler() -> UpdateHandler<teloxide::RequestError> {
    Update::filter_message()
        .filter(|msg: Message, settings: Arc<Settings>| settings.is_chat_allowed(msg.chat.id.0))
        .filter_command::<Command>()
        .endpoint(on_command)
}

async fn on_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    service: Arc<ImageService>,
    settings: Arc<Settings>,
) -> Result<(), teloxide::RequestError> {
    if let Err(e) = handle_command(bot, msg, cmd, service, settings).await {
        error!("Command error: {}", e);
    }
    respond(())
}
