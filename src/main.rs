use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use relaybot::chatbot::{CompletionClient, ConversationStore, MemoryScope, MessageHandler, TelegramClient};
use relaybot::config::Config;

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase", description = "Available commands:")]
enum Command {
    #[command(description = "check that the bot is alive")]
    Start,
    #[command(description = "forget the conversation so far")]
    Reset,
}

struct BotState {
    config: Config,
    handler: MessageHandler,
    telegram: TelegramClient,
}

#[tokio::main]
async fn main() -> ExitCode {
    // An optional argument names a JSON config file; otherwise use the environment
    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(&path),
        None => Config::from_env(),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("relaybot: {e}");
            return ExitCode::FAILURE;
        }
    };

    let _guard = init_logging(&config.log_dir);

    let client = match CompletionClient::from_config(&config) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("relaybot: failed to build HTTP client: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!("🚀 Starting relaybot...");
    info!("Model: {}, endpoint: {}", config.model, config.api_url);
    info!(
        "Memory: {:?} ({}, last {} messages)",
        config.memory_file,
        match config.memory_scope {
            MemoryScope::Shared => "shared",
            MemoryScope::PerChat => "per chat",
        },
        config.history_limit
    );

    let bot = Bot::new(&config.telegram_bot_token);
    let store = ConversationStore::new(config.memory_file.clone(), config.memory_scope, config.history_limit);
    let handler = MessageHandler::new(store, client, config.system_prompt_file.clone());
    let state = Arc::new(BotState {
        config,
        handler,
        telegram: TelegramClient::new(bot.clone()),
    });

    let schema = Update::filter_message()
        .branch(dptree::entry().filter_command::<Command>().endpoint(handle_command))
        .branch(
            dptree::filter(|msg: Message| msg.text().is_some_and(|t| !t.starts_with('/')))
                .endpoint(handle_text),
        );

    Dispatcher::builder(bot, schema)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    ExitCode::SUCCESS
}

fn init_logging(log_dir: &Path) -> Option<WorkerGuard> {
    let filter = || EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());

    let log_file = std::fs::create_dir_all(log_dir).and_then(|_| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_dir.join("relaybot.log"))
    });
    let (file_layer, guard) = match log_file {
        Ok(file) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(file);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(filter());
            (Some(layer), Some(guard))
        }
        Err(e) => {
            eprintln!("relaybot: logging to stdout only, cannot open {}: {e}", log_dir.display());
            (None, None)
        }
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(filter()),
        )
        .with(file_layer)
        .init();

    guard
}

async fn handle_command(msg: Message, cmd: Command, state: Arc<BotState>) -> ResponseResult<()> {
    let chat_id = msg.chat.id.0;

    let text = match cmd {
        Command::Start => {
            info!("👋 /start in chat {chat_id}");
            state.config.start_message.clone()
        }
        Command::Reset => {
            info!("🧹 /reset in chat {chat_id}");
            match state.handler.reset(chat_id).await {
                Ok(()) => "Conversation cleared.".to_string(),
                Err(e) => {
                    warn!("Failed to reset chat {chat_id}: {e}");
                    e.user_message().to_string()
                }
            }
        }
    };

    if let Err(e) = state.telegram.send_text(chat_id, &text, None).await {
        warn!("Reply not delivered to chat {chat_id}: {e}");
    }
    Ok(())
}

async fn handle_text(msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let chat_id = msg.chat.id.0;

    let username = msg
        .from
        .as_ref()
        .map(|u| u.username.clone().unwrap_or_else(|| u.first_name.clone()))
        .unwrap_or_else(|| "unknown".to_string());
    let preview: String = text.chars().take(100).collect();
    info!("📨 Message in chat {chat_id} from {username}: \"{preview}\"");

    state.telegram.send_typing(chat_id).await;

    let reply = match state.handler.handle(chat_id, text).await {
        Ok(reply) => reply,
        Err(e) => {
            warn!("Failed to handle message in chat {chat_id}: {e}");
            e.user_message().to_string()
        }
    };

    // Thread replies in groups so it's clear who is being answered
    let reply_to = (!msg.chat.is_private()).then_some(msg.id.0);
    if let Err(e) = state.telegram.send_text(chat_id, &reply, reply_to).await {
        warn!("Reply not delivered to chat {chat_id}: {e}");
    }
    Ok(())
}
