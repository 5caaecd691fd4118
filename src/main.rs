//! MoneyClaw Runtime
//!
//! Entry point for the credit-governed agent. Handles CLI args,
//! bootstrapping, and orchestrating the heartbeat daemon + agent loop.

use std::fs;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use moneyclaw::agent::{run_agent_loop, AgentLoopOptions};
use moneyclaw::config::{get_automaton_dir, load_config, resolve_path};
use moneyclaw::conway::ConwayHttpClient;
use moneyclaw::heartbeat::{
    create_heartbeat_daemon, discovery_endpoints, HeartbeatContext, HeartbeatDaemonOptions,
    DEFAULT_KEEP_LAST_DEAD,
};
use moneyclaw::inference::{ReqwestHttp, Router};
use moneyclaw::replication::is_valid_wallet_address;
use moneyclaw::state::Database;
use moneyclaw::survival::governor::CURRENT_TIER_KEY;
use moneyclaw::types::{AgentIdentity, RuntimeConfig};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Process exit codes.
const EXIT_CONFIG_ERROR: i32 = 1;
const EXIT_STORE_ERROR: i32 = 2;
const EXIT_WALLET_ERROR: i32 = 3;

/// MoneyClaw -- credit-governed agent runtime
#[derive(Parser, Debug)]
#[command(
    name = "moneyclaw",
    version = VERSION,
    about = "MoneyClaw -- credit-governed agent runtime",
    long_about = "Autonomous agent runtime. To exist, it must pay for its compute."
)]
struct Cli {
    /// Start the runtime
    #[arg(long)]
    run: bool,

    /// Run the interactive setup wizard (external tooling)
    #[arg(long)]
    setup: bool,

    /// Edit the configuration interactively (external tooling)
    #[arg(long)]
    configure: bool,

    /// Pick the preferred inference model interactively (external tooling)
    #[arg(long)]
    pick_model: bool,

    /// Show identity and config-directory information
    #[arg(long)]
    init: bool,

    /// Provision an API key (external tooling)
    #[arg(long)]
    provision: bool,

    /// Show current runtime status
    #[arg(long)]
    status: bool,
}

// ---- Status Command --------------------------------------------------------

/// Display current status: tier, credits, active model, last error.
fn show_status() {
    let config = match load_config() {
        Some(c) => c,
        None => {
            eprintln!("MoneyClaw is not configured. Run the setup tooling first.");
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };

    let db_path = resolve_path(&config.db_path);
    let db = match Database::open(&db_path) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("Failed to open store at {db_path}: {e:#}");
            std::process::exit(EXIT_STORE_ERROR);
        }
    };

    let tier = db
        .get_kv(CURRENT_TIER_KEY)
        .ok()
        .flatten()
        .unwrap_or_else(|| "unknown".to_string());
    let credits = db
        .get_kv("credits_cents")
        .ok()
        .flatten()
        .unwrap_or_else(|| "unknown".to_string());
    let last_error = db
        .last_turn_error()
        .ok()
        .flatten()
        .unwrap_or_else(|| "(none)".to_string());
    let session = db.open_session_id().ok().flatten();

    println!(
        r#"
=== MONEYCLAW STATUS ===
Wallet:      {}
Creator:     {}
Tier:        {}
Credits:     {} cents
Model:       {}
Session:     {}
Last error:  {}
Version:     {}
========================
"#,
        config.wallet_address,
        config.creator_address,
        tier,
        credits,
        config.inference_model,
        session
            .map(|id| format!("open (#{id})"))
            .unwrap_or_else(|| "closed".to_string()),
        last_error,
        VERSION,
    );
}

// ---- Main Run --------------------------------------------------------------

fn init_logging(log_path: &str) -> Result<()> {
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("failed to open log file: {log_path}"))?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
        .init();
    Ok(())
}

fn write_pid_file() {
    let pid_path = get_automaton_dir().join("moneyclaw.pid");
    let _ = fs::write(&pid_path, std::process::id().to_string());
}

/// Load identity from the store, inserting it on first run.
fn load_identity(db: &Database, config: &RuntimeConfig) -> Result<AgentIdentity> {
    if let Some(identity) = db.get_identity()? {
        return Ok(identity);
    }

    let identity = AgentIdentity {
        wallet_address: config.wallet_address.clone(),
        creator_address: config.creator_address.clone(),
        genesis_prompt: config.genesis_prompt.clone(),
        created_at: chrono::Utc::now().to_rfc3339(),
    };
    db.insert_identity(&identity)
        .context("failed to persist identity")?;
    Ok(identity)
}

/// The main run path: load config, open the store, wire up capabilities,
/// start the heartbeat daemon, and drive the agent loop until shutdown.
async fn run() -> Result<()> {
    let config = match load_config() {
        Some(c) => c,
        None => {
            eprintln!("No configuration found at ~/.automaton/automaton.json");
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };

    if !is_valid_wallet_address(&config.wallet_address) {
        eprintln!(
            "Wallet unavailable: '{}' is not a valid address",
            config.wallet_address
        );
        std::process::exit(EXIT_WALLET_ERROR);
    }

    init_logging(&resolve_path(&config.log_path))?;
    write_pid_file();

    let db = match Database::open(&resolve_path(&config.db_path)) {
        Ok(db) => Arc::new(Mutex::new(db)),
        Err(e) => {
            eprintln!("Failed to open store: {e:#}");
            std::process::exit(EXIT_STORE_ERROR);
        }
    };

    let identity = {
        let guard = db.lock().unwrap();
        load_identity(&guard, &config)?
    };
    info!(wallet = %identity.wallet_address, "identity loaded");

    // Capabilities are wired up once and passed down explicitly.
    let http = Arc::new(ReqwestHttp::new());
    let conway = Arc::new(ConwayHttpClient::new(
        config.conway_api_url.clone(),
        config.conway_api_key.clone(),
        http.clone(),
    ));
    let router = Arc::new(Router::new(db.clone(), http.clone(), &config));

    let mut daemon = create_heartbeat_daemon(HeartbeatDaemonOptions::default());
    daemon.start(Arc::new(HeartbeatContext {
        db: db.clone(),
        http: http.clone(),
        conway: conway.clone(),
        endpoints: discovery_endpoints(&config),
        keep_last_dead: DEFAULT_KEEP_LAST_DEAD,
    }));

    let loop_options = AgentLoopOptions {
        identity,
        config,
        db: db.clone(),
        conway: conway.clone(),
        router,
    };

    let shutdown = async {
        let ctrl_c = signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("failed to register SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => info!("received SIGINT, shutting down"),
                _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.expect("failed to register Ctrl+C handler");
            info!("received shutdown signal");
        }
    };

    tokio::select! {
        _ = shutdown => {}
        result = run_agent_loop(loop_options) => {
            if let Err(e) = result {
                error!(error = %format!("{e:#}"), "agent loop failed");
            }
        }
    }

    daemon.stop();

    // Flush any interrupted turn, close the session, close the store.
    {
        let guard = db.lock().unwrap();
        if let Ok(Some(session_id)) = guard.open_session_id() {
            let _ = guard.fail_pending_turns(session_id, "shutdown");
            let _ = guard.close_session(session_id);
        }
    }
    match Arc::try_unwrap(db) {
        Ok(mutex) => {
            let database = mutex.into_inner().unwrap();
            database.close().context("failed to close store")?;
        }
        Err(_) => info!("store still referenced by background task; closing on drop"),
    }

    info!("shutdown complete");
    Ok(())
}

// ---- Entry Point -----------------------------------------------------------

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.init {
        let config = match load_config() {
            Some(c) => c,
            None => {
                eprintln!("No configuration found. Run the setup tooling first.");
                std::process::exit(EXIT_CONFIG_ERROR);
            }
        };
        println!(
            "{}",
            serde_json::json!({
                "address": config.wallet_address,
                "configDir": get_automaton_dir().to_string_lossy(),
                "dbPath": resolve_path(&config.db_path),
            })
        );
        return;
    }

    if cli.setup || cli.configure || cli.pick_model || cli.provision {
        eprintln!("Interactive setup lives in the external setup tooling.");
        eprintln!("Edit ~/.automaton/automaton.json directly, then run: moneyclaw --run");
        std::process::exit(EXIT_CONFIG_ERROR);
    }

    if cli.status {
        show_status();
        return;
    }

    if cli.run {
        if let Err(e) = run().await {
            eprintln!("Fatal: {e:#}");
            std::process::exit(EXIT_CONFIG_ERROR);
        }
        return;
    }

    println!("Run \"moneyclaw --help\" for usage information.");
    println!("Run \"moneyclaw --run\" to start the runtime.");
}
