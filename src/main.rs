use chatpix_bot::bot::handlers::{self, Command};
use chatpix_bot::bot::{ChatTransport, DispatcherSettings, RequestDispatcher, TelegramTransport};
use chatpix_bot::config::{DatabaseSettings, Settings};
use chatpix_bot::llm::OpenAiProvider;
use chatpix_bot::storage::{AccountStore, PgStore};
use dotenvy::dotenv;
use regex::Regex;
use std::io::{self, Write};
use std::sync::Arc;
use teloxide::dispatching::UpdateHandler;
use teloxide::prelude::*;
use teloxide::types::Me;
use tracing::{debug, error, info};
use tracing_subscriber::{prelude::*, EnvFilter};

/// Regex patterns for redacting secrets from log output
struct RedactionPatterns {
    token1: Regex,
    token2: Regex,
    token3: Regex,
    openai_key: Regex,
    url_credentials: Regex,
}

impl RedactionPatterns {
    /// Initialize all regex patterns
    ///
    /// # Errors
    ///
    /// Returns an error if any regex pattern is invalid
    fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            token1: Regex::new(r"(https?://[^/]+/bot)([0-9]+:[A-Za-z0-9_-]+)(/['\s]*)")?,
            token2: Regex::new(r"([0-9]{8,10}:[A-Za-z0-9_-]{35})")?,
            token3: Regex::new(r"(bot[0-9]{8,10}:)[A-Za-z0-9_-]+")?,
            openai_key: Regex::new(r"\bsk-[A-Za-z0-9_-]{8,}")?,
            url_credentials: Regex::new(r"([a-z][a-z0-9+.-]*://[^:/@\s]+:)[^@/\s]+@")?,
        })
    }

    fn redact(&self, input: &str) -> String {
        let mut output = input.to_string();
        output = self
            .token1
            .replace_all(&output, "$1[TELEGRAM_TOKEN]$3")
            .to_string();
        output = self
            .token2
            .replace_all(&output, "[TELEGRAM_TOKEN]")
            .to_string();
        output = self
            .token3
            .replace_all(&output, "$1[TELEGRAM_TOKEN]")
            .to_string();
        output = self
            .openai_key
            .replace_all(&output, "sk-[MASKED]")
            .to_string();
        output = self
            .url_credentials
            .replace_all(&output, "$1[MASKED]@")
            .to_string();
        output
    }
}

struct RedactingWriter<W: Write> {
    inner: W,
    patterns: Arc<RedactionPatterns>,
}

impl<W: Write> RedactingWriter<W> {
    const fn new(inner: W, patterns: Arc<RedactionPatterns>) -> Self {
        Self { inner, patterns }
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let s = String::from_utf8_lossy(buf);
        let redacted = self.patterns.redact(&s);
        self.inner.write_all(redacted.as_bytes())?;
        // Report the original length; the redacted text may differ in size.
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

impl<F> RedactingMakeWriter<F> {
    const fn new(make_inner: F, patterns: Arc<RedactionPatterns>) -> Self {
        Self {
            make_inner,
            patterns,
        }
    }
}

impl<'a, F, W> tracing_subscriber::fmt::MakeWriter<'a> for RedactingMakeWriter<F>
where
    F: Fn() -> W + 'static,
    W: Write,
{
    type Writer = RedactingWriter<W>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new((self.make_inner)(), self.patterns.clone())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // Before logging, so nothing is ever written unredacted
    let patterns = Arc::new(RedactionPatterns::new().map_err(|e| {
        eprintln!("Failed to compile regex patterns: {e}");
        e
    })?);
    init_logging(patterns);

    info!("Starting chatpix bot...");

    let settings = init_settings();
    let store = init_storage().await;

    let provider = match OpenAiProvider::new(&settings) {
        Ok(p) => Arc::new(p),
        Err(e) => {
            error!("Failed to initialize OpenAI provider: {}", e);
            std::process::exit(1);
        }
    };
    info!(
        chat_model = %settings.gpt_model,
        image_model = %settings.dall_e_model,
        proxy = settings.proxy_url().is_some(),
        "OpenAI provider initialized."
    );

    let bot = Bot::new(settings.telegram_bot_token.clone());
    match bot.get_me().await {
        Ok(me) => info!("Authorized as @{}", me.username()),
        Err(e) => {
            error!("Failed to authorize with Telegram: {}", e);
            std::process::exit(1);
        }
    }

    let transport: Arc<dyn ChatTransport> = Arc::new(TelegramTransport::new(bot.clone()));
    let dispatcher = Arc::new(RequestDispatcher::new(
        store,
        transport,
        provider.clone(),
        provider,
        DispatcherSettings::from(settings.as_ref()),
    ));

    let handler = setup_handler();

    info!("Bot is running...");

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![dispatcher])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}

fn init_logging(patterns: Arc<RedactionPatterns>) {
    let make_writer = RedactingMakeWriter::new(io::stderr, patterns);
    // HTTP clients log every request at info; keep them quiet by default
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,hyper_util=warn,reqwest=warn"));

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

async fn init_storage() -> Arc<dyn AccountStore> {
    let db_settings = match DatabaseSettings::new() {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to load database configuration: {}", e);
            std::process::exit(1);
        }
    };
    let store = match PgStore::new(&db_settings) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to initialize PostgreSQL pool: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = store.ensure_schema().await {
        error!("Failed to prepare account schema: {}", e);
        std::process::exit(1);
    }
    if store.check_connection().await.is_err() {
        // Already logged in check_connection; the pool reconnects on demand
        error!("PostgreSQL connection check returned error.");
    }
    Arc::new(store)
}

fn setup_handler() -> UpdateHandler<teloxide::RequestError> {
    Update::filter_message()
        .branch(
            dptree::entry()
                .filter_command::<Command>()
                .endpoint(handle_command),
        )
        .branch(
            dptree::filter(|msg: Message| msg.text().is_some_and(|t| !t.starts_with('/')))
                .endpoint(handle_text),
        )
}

async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    dispatcher: Arc<RequestDispatcher>,
    me: Me,
) -> Result<(), teloxide::RequestError> {
    let res = match cmd {
        Command::Start => handlers::start(bot, msg).await,
        Command::Image(prompt) => handlers::image(msg, prompt, dispatcher, me)
            .await
            .map(|outcome| debug!(?outcome, "Image request finished")),
    };
    if let Err(e) = res {
        error!("Command error: {}", e);
    }
    respond(())
}

async fn handle_text(
    msg: Message,
    dispatcher: Arc<RequestDispatcher>,
    me: Me,
) -> Result<(), teloxide::RequestError> {
    match handlers::text(msg, dispatcher, me).await {
        Ok(outcome) => debug!(?outcome, "Text request finished"),
        Err(e) => error!("Text handler error: {}", e),
    }
    respond(())
}
