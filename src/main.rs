use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use siphon::config::{load_app_config, resolve_config_path};
use siphon::control::{ControlError, ControlPlane};

const EXIT_OK: i32 = 0;
const EXIT_INIT_FAILURE: i32 = 1;
const EXIT_BIND_FAILURE: i32 = 2;

#[derive(Parser)]
#[command(name = "siphon")]
#[command(about = "Multi-source log ingestion pipeline", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    Run,
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Init {
        #[arg(long)]
        stdout: bool,
    },
}

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "siphon=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config_path = resolve_config_path(cli.config.as_deref());

    let code = match cli.command {
        Some(Commands::Run) | None => run(config_path).await,
        Some(Commands::Config { action }) => match action {
            ConfigAction::Init { stdout } => config_init(stdout),
        },
    };

    std::process::exit(code);
}

async fn run(config_path: Option<PathBuf>) -> i32 {
    let app = match load_app_config(config_path.as_deref()) {
        Ok(app) => app,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            return EXIT_INIT_FAILURE;
        }
    };

    let listen_addr: std::net::SocketAddr = match app.control.listen.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(listen = %app.control.listen, error = %e, "Invalid control listen address");
            return EXIT_INIT_FAILURE;
        }
    };

    let control = match ControlPlane::new(app) {
        Ok(control) => Arc::new(control),
        Err(e) => {
            error!(error = %e, "Failed to initialize");
            return EXIT_INIT_FAILURE;
        }
    };

    if let Err(e) = control.start().await {
        error!(error = %e, "Failed to start pipeline");
        return match e {
            ControlError::Bind(_) => EXIT_BIND_FAILURE,
            _ => EXIT_INIT_FAILURE,
        };
    }

    let server_control = Arc::clone(&control);
    let server_handle = tokio::spawn(async move {
        siphon::control::server::start_server(listen_addr, server_control).await
    });

    info!("Running, press Ctrl+C to stop");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Err(e)) => error!(error = %e, "Control server error"),
                Err(e) => error!(error = %e, "Control server task join error"),
                Ok(Ok(())) => {}
            }
            control.stop().await;
            return EXIT_INIT_FAILURE;
        }
    }

    control.stop().await;
    info!("Shutdown complete");
    EXIT_OK
}

fn config_init(stdout: bool) -> i32 {
    let template = siphon::config::default_config_template();

    if stdout {
        print!("{}", template);
        return EXIT_OK;
    }

    let Some(home) = dirs::home_dir() else {
        error!("Cannot determine home directory");
        return EXIT_INIT_FAILURE;
    };

    let dir = home.join(".config/siphon");
    let path = dir.join("siphon.yml");
    if path.exists() {
        error!(path = %path.display(), "Config file already exists, not overwriting");
        return EXIT_INIT_FAILURE;
    }

    if let Err(e) = std::fs::create_dir_all(&dir).and_then(|_| std::fs::write(&path, template)) {
        error!(error = %e, "Failed to write config file");
        return EXIT_INIT_FAILURE;
    }

    info!(path = %path.display(), "Wrote default config");
    EXIT_OK
}
