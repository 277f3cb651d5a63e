use clip_courier::bot::handlers::{self, BotContext, Command};
use clip_courier::bot::state::State;
use clip_courier::bot::SearchCache;
use clip_courier::config::{self, Settings};
use clip_courier::core::orchestrator::{Orchestrator, OrchestratorConfig};
use clip_courier::core::snapshot::JsonFileStore;
use clip_courier::core::stats::StatsAggregator;
use clip_courier::extractor::ytdlp::YtDlpExtractor;
use dotenvy::dotenv;
use regex::Regex;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use teloxide::dispatching::dialogue::InMemStorage;
use teloxide::dispatching::UpdateHandler;
use teloxide::prelude::*;
use tracing::{error, info};
use tracing_subscriber::{prelude::*, EnvFilter};

/// Regex patterns for redacting the bot token from log output
struct RedactionPatterns {
    token_in_url: Regex,
    bare_token: Regex,
}

impl RedactionPatterns {
    fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            token_in_url: Regex::new(r"(https?://[^/]+/bot)([0-9]+:[A-Za-z0-9_-]+)(/?)")?,
            bare_token: Regex::new(r"[0-9]{8,10}:[A-Za-z0-9_-]{35}")?,
        })
    }

    fn redact(&self, input: &str) -> String {
        let output = self
            .token_in_url
            .replace_all(input, "$1[TELEGRAM_TOKEN]$3")
            .to_string();
        self.bare_token
            .replace_all(&output, "[TELEGRAM_TOKEN]")
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
        self.inner.write_all(self.patterns.redact(&s).as_bytes())?;
        // Report the original length even though the redacted text may differ
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
        eprintln!("Failed to compile redaction patterns: {e}");
        e
    })?);
    init_logging(patterns);

    info!("Starting Clip Courier bot...");

    let settings = init_settings();

    std::fs::create_dir_all(&settings.download_dir)?;

    let extractor = match YtDlpExtractor::discover() {
        Ok(extractor) => Arc::new(extractor),
        Err(e) => {
            error!("Extractor unavailable: {e}");
            std::process::exit(1);
        }
    };

    let store = JsonFileStore::new(settings.stats_file.clone());
    let stats = Arc::new(StatsAggregator::load(Box::new(store)).await);

    let mut orchestrator_config = OrchestratorConfig::new(
        PathBuf::from(&settings.download_dir),
        settings.cookies_file.clone().map(PathBuf::from),
    );
    orchestrator_config.worker_slots = settings.worker_slots;
    let orchestrator = Arc::new(Orchestrator::new(orchestrator_config, extractor, stats));

    let bot = Bot::new(settings.telegram_token.clone());

    let ctx = Arc::new(BotContext {
        orchestrator,
        settings,
        search_cache: SearchCache::new(
            config::SEARCH_CACHE_TTL_SECS,
            config::SEARCH_CACHE_CAPACITY,
        ),
    });

    let dialogue_storage = InMemStorage::<State>::new();
    let handler = setup_handler();

    info!("Bot is running...");

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![ctx, dialogue_storage])
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

fn setup_handler() -> UpdateHandler<teloxide::RequestError> {
    dptree::entry()
        .branch(Update::filter_callback_query().endpoint(handle_callback_update))
        .branch(
            Update::filter_message()
                .enter_dialogue::<Message, InMemStorage<State>, State>()
                .branch(
                    dptree::entry()
                        .filter_command::<Command>()
                        .endpoint(handle_command_update),
                )
                .branch(
                    Update::filter_message()
                        .filter(|msg: Message| msg.text().is_some())
                        .endpoint(handle_text_update),
                ),
        )
}

async fn handle_command_update(
    bot: Bot,
    msg: Message,
    cmd: Command,
    ctx: Arc<BotContext>,
    dialogue: handlers::BotDialogue,
) -> Result<(), teloxide::RequestError> {
    if let Err(e) = handlers::handle_command(bot, msg, cmd, ctx, dialogue).await {
        error!("Command handler error: {e:#}");
    }
    respond(())
}

async fn handle_text_update(
    bot: Bot,
    msg: Message,
    ctx: Arc<BotContext>,
    dialogue: handlers::BotDialogue,
) -> Result<(), teloxide::RequestError> {
    if let Err(e) = handlers::handle_text(bot, msg, ctx, dialogue).await {
        error!("Text handler error: {e:#}");
    }
    respond(())
}

async fn handle_callback_update(
    bot: Bot,
    q: CallbackQuery,
    ctx: Arc<BotContext>,
    storage: Arc<InMemStorage<State>>,
) -> Result<(), teloxide::RequestError> {
    if let Err(e) = handlers::handle_callback(bot, q, ctx, storage).await {
        error!("Callback handler error: {e:#}");
    }
    respond(())
}
