mod key_commands;

use std::{path::PathBuf, sync::Arc};

use {
    clap::{Parser, Subcommand},
    naclgate_config::{discover_and_load, find_config_file},
    naclgate_gateway::{EchoSink, ServerManager, ServerStatus},
    tokio::sync::watch,
    tracing::{info, warn},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "naclgate", about = "naclgate: NaCl-box authenticated WebSocket gateway")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server and run until Ctrl-C.
    Serve {
        /// Config file (defaults to discovery in `.` then ~/.config/naclgate).
        #[arg(long, env = "NACLGATE_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Write a default config with a new private key.
    Init {
        #[arg(long)]
        path: Option<PathBuf>,
        /// Overwrite an existing file.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Print the server public key.
    PublicKey {
        #[arg(long, env = "NACLGATE_CONFIG")]
        config: Option<PathBuf>,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_names(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_names(true)
                    .with_ansi(true),
            )
            .init();
    }
}

async fn serve(config: Option<PathBuf>) -> anyhow::Result<()> {
    let sink = Arc::new(EchoSink);
    let manager = match config.or_else(find_config_file) {
        Some(path) => {
            info!(path = %path.display(), "using config file");
            ServerManager::from_path(path, sink)?
        },
        None => {
            warn!("no config file found, using defaults");
            ServerManager::new(discover_and_load()?, sink)?
        },
    };
    let manager = Arc::new(manager);

    let (status_tx, mut status_rx) = watch::channel(manager.status());
    let status_tx = Arc::new(status_tx);
    manager.add_listener(move |status| {
        let status_tx = Arc::clone(&status_tx);
        async move {
            info!(%status, "server status changed");
            status_tx.send_replace(status);
        }
    });
    manager.start()?;
    info!(public_key = %manager.public_key_hex(), "naclgate starting");

    let joined = Arc::clone(&manager);
    let mut worker = tokio::task::spawn_blocking(move || joined.join());
    tokio::select! {
        result = &mut worker => {
            result??;
            warn!("server exited before shutdown was requested");
            return Ok(());
        }
        result = tokio::signal::ctrl_c() => result?,
    }

    info!("shutdown requested");
    // The listener may still be binding; a stop is only accepted once it is Running.
    let running = tokio::select! {
        result = &mut worker => {
            result??;
            info!("naclgate stopped");
            return Ok(());
        }
        running = status_rx.wait_for(|status| *status == ServerStatus::Running) => running.is_ok(),
    };
    if running && let Err(e) = manager.stop() {
        warn!(error = %e, "stop request ignored");
    }
    worker.await??;
    info!("naclgate stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "naclgate");

    match cli.command {
        Commands::Serve { config } => serve(config).await,
        Commands::Init { path, force } => key_commands::init(path, force),
        Commands::PublicKey { config } => key_commands::public_key(config.as_deref()),
    }
}
