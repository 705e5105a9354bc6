use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::time::ChronoLocal;
use twilio::{CallControl, TwilioClient};
use voxline::api::{self, AppState};
use voxline::config::{Config, LogFormat};
use voxline::factory::ConfiguredFactory;
use voxline::functions::{CurrentWeather, EndCall, FunctionRegistry, LogFeatures, TransferCall};
use voxline::prompt_loader::Prompts;
use voxline_persistence::{DatabaseManager, DbRuntimeSettings};

#[derive(Parser)]
#[command(version, about = "Twilio voice assistant")]
struct Cli {
    /// Address to listen on; overrides BIND_ADDRESS.
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Directory holding system_message.md and initial_message.md; overrides PROMPTS_DIR.
    #[arg(long)]
    prompts_dir: Option<PathBuf>,
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(config.log_level).into())
        .from_env_lossy();
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(ChronoLocal::rfc_3339());
    match config.log_format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // --- 1. Load Configuration ---
    let args = Cli::parse();
    let mut config = Config::from_env().context("Failed to load application configuration")?;
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if let Some(prompts_dir) = args.prompts_dir {
        config.prompts_dir = prompts_dir;
    }

    // --- 2. Initialize Logging ---
    init_logging(&config);
    tracing::info!(
        "Configuration loaded. LLM: {:?}, TTS: {:?}",
        config.llm_provider,
        config.tts_provider
    );

    // --- 3. Load Prompts ---
    let prompts = Prompts::resolve(&config).context("Failed to load prompts")?;

    // --- 4. Storage and Telephony ---
    let db = DatabaseManager::open(&config.database_path, DbRuntimeSettings::default())
        .with_context(|| format!("Failed to open database at {}", config.database_path))?;
    let calls: Arc<dyn CallControl> = Arc::new(TwilioClient::new(
        &config.twilio_account_sid,
        config.twilio_auth_token.clone(),
    ));

    // --- 5. Tools ---
    let tools = FunctionRegistry::new()
        .register(TransferCall::new(calls.clone(), config.transfer_number.clone()))
        .register(EndCall)
        .register(CurrentWeather::new(reqwest::Client::new()))
        .register(LogFeatures);

    // --- 6. Serve ---
    let config = Arc::new(config);
    let state = AppState::new(
        config.clone(),
        db,
        calls,
        Arc::new(ConfiguredFactory::new(config.clone())),
        Arc::new(tools),
        prompts,
    );
    let store = state.store.clone();
    let db = state.db.clone();
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_address))?;
    tracing::info!("Listening on {}", config.bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutting down.");
        })
        .await
        .context("Server error")?;

    store.close_all(&db, "shutdown").await;
    Ok(())
}
