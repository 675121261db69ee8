use super::resilient::{send_message_resilient, send_photo_resilient};
use super::{channel_key, texts};
use crate::booru::rating::{DarkLevel, R34Level, RatingError, RatingLimits};
use crate::booru::Image;
use crate::config::Settings;
use crate::service::{ImageService, ServiceError};
use anyhow::Result;
use std::sync::Arc;
use teloxide::{prelude::*, utils::command::BotCommands};
use thiserror::Error;
use tracing::{info, warn};

/// Supported commands for the bot
#[derive(BotCommands, Clone, Debug, PartialEq, Eq)]
#[command(rename_rule = "lowercase", description = "Supported commands:")]
pub enum Command {
    /// Show the command list
    #[command(description = "show this help.")]
    Help,
    /// Fetch an image by id
    #[command(description = "fetch an image by its id: /derpi <id>")]
    Derpi(String),
    /// Fetch a random image
    #[command(
        description = "random image: /random [-r 0-3] [-d 0-2] [-g] <query>; without a query, repeats the last one"
    )]
    Random(String),
    /// Repeat the last random search
    #[command(description = "another random image for the last query.")]
    Another,
}

/// Invalid `/random` arguments
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArgsError {
    /// An option that takes a level was last on the line
    #[error("option {0} needs a level")]
    MissingLevel(String),
    /// A level that is not a number
    #[error("{0} is not a level")]
    NotANumber(String),
    /// A level outside of its axis
    #[error(transparent)]
    Rating(#[from] RatingError),
}

/// Parsed `/random` arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RandomArgs {
    /// Requested limits, already clamped to the configured maximum
    pub limits: RatingLimits,
    /// Search text; `None` asks to repeat the last query
    pub query: Option<String>,
}

fn parse_level(option: &str, value: Option<&str>) -> Result<u8, ArgsError> {
    let value = value.ok_or_else(|| ArgsError::MissingLevel(option.to_string()))?;
    value
        .parse()
        .map_err(|_| ArgsError::NotANumber(value.to_string()))
}

/// Split `/random` arguments into rating options and the search text.
///
/// Options come first; the first token that is not an option (or `--`)
/// starts the query.
///
/// # Errors
///
/// Returns an `ArgsError` for a missing, malformed or out-of-range level.
pub fn parse_random_args(
    args: &str,
    defaults: RatingLimits,
    max: RatingLimits,
) -> Result<RandomArgs, ArgsError> {
    let mut limits = defaults;
    let mut tokens = args.split_whitespace().peekable();

    while let Some(&token) = tokens.peek() {
        match token {
            "-r" | "--r34" => {
                tokens.next();
                limits.r34 = R34Level::try_from(parse_level(token, tokens.next())?)?;
            }
            "-d" | "--dark" => {
                tokens.next();
                limits.dark = DarkLevel::try_from(parse_level(token, tokens.next())?)?;
            }
            "-g" | "--grotesque" => {
                tokens.next();
                limits.grotesque = true;
            }
            "--" => {
                tokens.next();
                break;
            }
            _ => break,
        }
    }

    let query = tokens.collect::<Vec<_>>().join(" ");
    Ok(RandomArgs {
        limits: limits.clamp_to(max),
        query: (!query.is_empty()).then_some(query),
    })
}

/// Dispatch a parsed command
///
/// # Errors
///
/// Returns an error if the reply cannot be delivered.
pub async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    service: Arc<ImageService>,
    settings: Arc<Settings>,
) -> Result<()> {
    let chat_id = msg.chat.id;
    let key = channel_key(chat_id);

    match cmd {
        Command::Help => {
            send_message_resilient(&bot, chat_id, Command::descriptions().to_string()).await?;
        }
        Command::Derpi(arg) => {
            let Ok(id) = arg.trim().parse::<u64>() else {
                send_message_resilient(&bot, chat_id, texts::INVALID_ID).await?;
                return Ok(());
            };
            info!(channel = %key, image_id = id, "Image requested by id");
            let outcome = service.by_id(&key, id).await;
            reply(&bot, chat_id, &settings, outcome).await?;
        }
        Command::Random(args) => {
            let parsed = parse_random_args(&args, settings.default_limits()?, settings.max_limits()?);
            let parsed = match parsed {
                Ok(parsed) => parsed,
                Err(e) => {
                    send_message_resilient(&bot, chat_id, format!("⚠️ {e}")).await?;
                    return Ok(());
                }
            };
            info!(channel = %key, query = ?parsed.query, "Random image requested");
            let outcome = service
                .random(&key, parsed.query.as_deref(), parsed.limits)
                .await;
            reply(&bot, chat_id, &settings, outcome).await?;
        }
        Command::Another => {
            let outcome = service.random(&key, None, settings.default_limits()?).await;
            reply(&bot, chat_id, &settings, outcome).await?;
        }
    }
    Ok(())
}

async fn reply(
    bot: &Bot,
    chat_id: ChatId,
    settings: &Settings,
    outcome: Result<Image, ServiceError>,
) -> Result<()> {
    match outcome {
        Ok(image) => {
            let caption = texts::caption(&settings.board_url, image.id);
            send_photo_resilient(bot, chat_id, &image.local_path, &caption).await?;
        }
        Err(e) => {
            if matches!(e, ServiceError::Request(_)) {
                warn!(chat_id = chat_id.0, outcome = e.message_key(), "Request not served");
            }
            send_message_resilient(bot, chat_id, texts::for_key(e.message_key())).await?;
        }
    }
    Ok(())
}
