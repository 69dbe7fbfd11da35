mod cli;

use std::io;
use std::path::{Path, PathBuf};

use clap::{CommandFactory, Parser};
use cli::{Cli, Commands, GatewayCommand};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing_subscriber::{fmt, EnvFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use mitto_config::Config;
use mitto_manager::Manager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = mitto_config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { bind } => run_serve(config, bind).await,
        Commands::ShowConfig => show_config(&config),
        Commands::ListSessions { workspace, json } => {
            list_sessions(config, workspace.as_deref(), json).await
        }
        Commands::Gateway { command: GatewayCommand::Token { regenerate } } => {
            gateway_token(&config, regenerate)
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            clap_complete::generate(shell, &mut cmd, name, &mut io::stdout());
            Ok(())
        }
    }
}

async fn run_serve(config: Config, bind_override: Option<String>) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.data_root)?;
    let bind_address = bind_override.unwrap_or_else(|| config.bind_address.clone());
    let token = load_or_create_token(&token_path(&config), false)?;

    let manager = Manager::new(config);
    let recovered = manager.startup_recover().await?;
    tracing::info!(recovered, "recovered active sessions");

    let app = mitto_gateway::router(manager, token);
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    tracing::info!(%bind_address, "mitto listening");
    axum::serve(listener, app).await?;
    Ok(())
}

fn show_config(config: &Config) -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(config)?);
    Ok(())
}

async fn list_sessions(config: Config, workspace: Option<&str>, json: bool) -> anyhow::Result<()> {
    let manager = Manager::new(config);
    let sessions = manager.list_sessions(workspace).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(());
    }

    for meta in sessions {
        println!(
            "{}\t{}\t{:?}\t{}",
            meta.session_id, meta.workspace, meta.status, meta.agent
        );
    }
    Ok(())
}

fn token_path(config: &Config) -> PathBuf {
    config.data_root.join("gateway.token")
}

/// Reads the token at `path`, generating and persisting a new one if it is
/// missing or `regenerate` is set. Written with owner-only permissions on
/// unix so a shared multi-user host doesn't leak it to other accounts.
fn load_or_create_token(path: &Path, regenerate: bool) -> anyhow::Result<String> {
    if !regenerate {
        if let Ok(existing) = std::fs::read_to_string(path) {
            let trimmed = existing.trim().to_string();
            if !trimmed.is_empty() {
                return Ok(trimmed);
            }
        }
    }

    let token: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(40)
        .map(char::from)
        .collect();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, &token)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(token)
}

fn gateway_token(config: &Config, regenerate: bool) -> anyhow::Result<()> {
    let token = load_or_create_token(&token_path(config), regenerate)?;
    println!("{token}");
    Ok(())
}

/// Stderr logging by default; set `MITTO_LOG_FILE` to redirect to a file
/// instead (useful once the daemon is backgrounded under a process
/// supervisor that doesn't capture stdio).
fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if let Ok(log_path) = std::env::var("MITTO_LOG_FILE") {
        if let Ok(file) = std::fs::OpenOptions::new().create(true).append(true).open(&log_path) {
            let _ = tracing_subscriber::registry()
                .with(fmt::layer().with_target(true).with_ansi(false).with_writer(std::sync::Mutex::new(file)))
                .with(filter)
                .try_init();
            return;
        }
    }

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
