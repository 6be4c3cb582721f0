mod chatbot;
mod config;
mod server;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use teloxide::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::prelude::*;

use chatbot::{BotIdentity, ChatbotConfig, ChatbotEngine, GeminiClient, PoolConfig, TelegramClient, TriggerConfig};
use config::Config;
use server::AppState;

#[tokio::main]
async fn main() {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = match Config::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ {e}");
            std::process::exit(1);
        }
    };

    // Setup logging
    let log_dir = config.data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let log_file = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("groupmind.log"))
    {
        Ok(file) => file,
        Err(e) => {
            eprintln!("❌ Failed to open log file in {}: {e}", log_dir.display());
            std::process::exit(1);
        }
    };
    let (non_blocking, _guard) = tracing_appender::non_blocking(log_file);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .init();

    info!("🚀 Starting groupmind...");
    match &config_path {
        Some(path) => info!("Loaded config from {}", path.display()),
        None => info!("Loaded config from {} / environment", config::DEFAULT_CONFIG_PATH),
    }
    info!("Models: {:?} (rotate: {})", config.models, config.rotate_models);
    info!("Admin IDs: {:?}", config.admin_ids);

    let bot = Bot::new(&config.telegram_bot_token);

    let me = match bot.get_me().await {
        Ok(me) => me,
        Err(e) => {
            error!("Failed to get bot info: {e}");
            std::process::exit(1);
        }
    };
    info!("Bot user ID: {}, username: @{}", me.id, me.username());
    let identity = BotIdentity {
        user_id: me.id.0 as i64,
        username: me.username().to_string(),
    };

    let gemini = match GeminiClient::new(config.gemini_api_key.clone(), config.request_timeout) {
        Ok(client) => client,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    let chatbot_config = ChatbotConfig {
        bot: identity,
        admin_ids: config.admin_ids.clone(),
        max_input_chars: config.max_input_chars,
        context_window: config.context_window,
        timezone: config.timezone,
        trigger: TriggerConfig {
            group_only: config.group_only,
            cooldown: config.cooldown,
            command_prefixes: config.command_prefixes.clone(),
            keywords: config.keywords.clone(),
        },
        pool: PoolConfig {
            models: config.models.clone(),
            rotate: config.rotate_models,
            backoff: config.retry_backoff,
            system_prompt: config.system_prompt.clone(),
        },
    };
    let telegram = Arc::new(TelegramClient::new(bot.clone()));
    let engine = Arc::new(ChatbotEngine::new(chatbot_config, telegram, Arc::new(gemini)));

    if let Err(e) = register_webhook(&bot, &config).await {
        error!("{e}");
        std::process::exit(1);
    }

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("🛑 Shutting down...");
                shutdown.cancel();
            }
        });
    }

    let state = AppState {
        engine,
        secret: config.webhook_secret.clone(),
        started_at: Instant::now(),
    };
    let app = server::router(&config.webhook_path, state);

    if let Err(e) = server::serve(&config.bind_addr(), app, shutdown).await {
        error!("{e}");
        std::process::exit(1);
    }
}

/// Replace any previous webhook with ours.
async fn register_webhook(bot: &Bot, config: &Config) -> Result<(), String> {
    bot.delete_webhook()
        .await
        .map_err(|e| format!("Failed to delete old webhook: {e}"))?;

    let url_text = config.webhook_url();
    let url = reqwest::Url::parse(&url_text).map_err(|e| format!("Invalid webhook URL '{url_text}': {e}"))?;

    let mut request = bot.set_webhook(url);
    if let Some(secret) = &config.webhook_secret {
        request = request.secret_token(secret.clone());
    }
    request
        .await
        .map_err(|e| format!("Failed to set webhook: {e}"))?;

    info!("🔗 Webhook set to {}", url_text);
    Ok(())
}
