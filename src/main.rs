//! localchat
//!
//! Terminal chat against a local GGUF model.
//!
//! Usage: `localchat [bot-id]`. Commands: `/models`, `/load <id>` (also switches
//! the current bot to that model), `/unload`, `/bots`, `/quit`.

use localchat::bot::{Bot, BotManager, ChatRequest, DEFAULT_BOT_ID};
use localchat::inference::model::LlamaLoader;
use localchat::inference::{InferenceSession, StreamToken};
use localchat::storage::conversations::JsonChatStore;
use localchat::storage::models::JsonModelRegistry;
use localchat::storage::settings::{load_settings, save_settings, AppSettings};
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

const DEFAULT_MODEL: &str = "llama-2-7b-chat.q4_k_m";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("localchat=info")))
        .with_writer(std::io::stderr)
        .init();

    let mut settings = load_settings();
    let registry = Arc::new(JsonModelRegistry::open(&settings.models_directory)?);
    let loader = Arc::new(LlamaLoader::init()?);
    let session = Arc::new(
        InferenceSession::new(loader, registry.clone(), settings.load_config())
            .with_prompt_policy(settings.prompt.clone()),
    );
    let store = Arc::new(JsonChatStore::new(&settings.chats_directory));

    let default_model = settings
        .last_model
        .clone()
        .or_else(|| registry.first_downloaded())
        .unwrap_or_else(|| DEFAULT_MODEL.to_string());
    let mut default_bot = Bot::default_assistant(default_model);
    default_bot.parameters = settings.sampling;
    let mut manager = BotManager::from_dir(&settings.bots_directory, session.clone(), store, default_bot)?;

    let bot_id = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_BOT_ID.to_string());
    let Some(bot) = manager.get_bot(&bot_id) else {
        eprintln!("Unknown bot '{}'", bot_id);
        return Ok(());
    };
    let conversation_id = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
    tracing::info!("Starting conversation {} with {}", conversation_id, bot.name);

    if settings.auto_load_model {
        load_model(&session, &mut settings, &bot.base_model_identifier()).await;
    }

    println!("Chatting with {} (type /quit to exit)", bot.name);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    prompt_marker()?;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line.split_once(' ').unwrap_or((line, "")) {
            ("", _) => {}
            ("/quit", _) => break,
            ("/models", _) => {
                let loaded = session.loaded_model().await;
                for model in registry.list() {
                    let marker = if loaded.as_deref() == Some(model.id.as_str()) {
                        "*"
                    } else if model.is_downloaded {
                        "+"
                    } else {
                        " "
                    };
                    println!("{} {} ({})", marker, model.id, model.size);
                }
            }
            ("/load", id) => {
                if load_model(&session, &mut settings, id).await {
                    if let Err(e) = manager.set_base_model(&bot_id, id) {
                        eprintln!("[error] {}", e);
                    }
                }
            }
            ("/unload", _) => {
                session.unload().await;
                println!("Model unloaded");
            }
            ("/bots", _) => {
                for bot in manager.list_bots() {
                    println!("{} - {} [{}]", bot.id, bot.name, bot.base_model);
                }
            }
            _ => match manager.chat(&bot_id, &conversation_id, ChatRequest::new(line)).await {
                Ok(mut reply) => {
                    while let Some(unit) = reply.next().await {
                        match unit {
                            StreamToken::Token(text) => {
                                print!("{}", text);
                                std::io::stdout().flush()?;
                            }
                            StreamToken::Error(message) => eprint!("\n[error] {}", message),
                        }
                    }
                    println!();
                }
                Err(e) => eprintln!("[error] {}", e),
            },
        }
        prompt_marker()?;
    }

    session.unload().await;
    Ok(())
}

fn prompt_marker() -> std::io::Result<()> {
    print!("> ");
    std::io::stdout().flush()
}

/// Load a model and remember it as the last selection
async fn load_model(session: &InferenceSession, settings: &mut AppSettings, id: &str) -> bool {
    if id.trim().is_empty() {
        println!("Usage: /load <model-id>");
        return false;
    }
    if !session.is_model_available(id) {
        println!("Model {} is not downloaded", id.trim());
        return false;
    }
    if !session.load(id).await {
        println!("Failed to load {}", id.trim());
        return false;
    }
    println!("Loaded {}", id.trim());
    settings.last_model = session.loaded_model().await;
    if let Err(e) = save_settings(settings) {
        tracing::warn!("Failed to save settings: {}", e);
    }
    true
}
