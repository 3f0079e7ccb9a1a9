//! `moor` — the relay server binary.

mod config;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use moor_sandbox::container::{ContainerProvider, ContainerProviderConfig};
use moor_sandbox::microvm::{MicroVmProvider, MicroVmProviderConfig};
use moor_sandbox::mock::MockProvider;
use moor_sandbox::SandboxManager;
use moor_server::{AppState, ServerConfig, Store};
use moor_shared::crypto::EnvelopeCipher;

use config::{Config, ServeFlags};

#[derive(Parser)]
#[command(name = "moor", version, about = "Relay server for sandboxed AI coding-agent sessions")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the relay server (default).
    Serve(ServeFlags),
    /// Remove stopped sandboxes and purge deleted session rows.
    Cleanup(ServeFlags),
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or_else(|| {
        Command::Serve(ServeFlags {
            host: None,
            port: None,
            provider: None,
            state_dir: None,
            image: None,
            encryption_key: std::env::var("RELAY_ENCRYPTION_KEY").ok(),
        })
    });

    let result = match command {
        Command::Serve(flags) => serve(&flags),
        Command::Cleanup(flags) => cleanup(&flags),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("moor: {error:#}");
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn serve(flags: &ServeFlags) -> Result<()> {
    let config = Config::load(flags)?;
    std::fs::create_dir_all(config.log_dir())
        .with_context(|| format!("cannot create {}", config.log_dir().display()))?;

    let file_appender = tracing_appender::rolling::daily(config.log_dir(), "moor.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .init();

    let state = build_state(&config)?;
    state.spawn_retention_loop(Duration::from_secs(config.retention_days * 24 * 60 * 60));

    let router = moor_server::router(state);
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("cannot bind {}:{}", config.host, config.port))?;
    tracing::info!(
        host = %config.host,
        port = config.port,
        provider = %config.provider,
        state_dir = %config.state_dir.display(),
        "relay listening"
    );

    axum::serve(listener, router)
        .await
        .context("server terminated")?;
    Ok(())
}

#[tokio::main]
async fn cleanup(flags: &ServeFlags) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::load(flags)?;
    let state = build_state(&config)?;

    let reports = state.manager.cleanup_all().await;
    for (provider_type, report) in reports {
        tracing::info!(
            provider = %provider_type,
            removed = report.removed,
            "sandbox cleanup"
        );
    }

    let purged = state.store.purge_deleted_sessions()?;
    tracing::info!(purged, "purged deleted session rows");
    Ok(())
}

fn build_state(config: &Config) -> Result<AppState> {
    let cipher = EnvelopeCipher::from_hex(&config.encryption_key)
        .context("RELAY_ENCRYPTION_KEY is not a valid 32-byte hex key")?;
    let store = Store::open(&config.database_path(), cipher)?;

    let mut manager = SandboxManager::new(config.provider);
    manager.register(Arc::new(MockProvider::new()));
    manager.register(Arc::new(ContainerProvider::new(ContainerProviderConfig::new(
        config.image.clone(),
        config.state_dir.clone(),
    ))));
    if let Some(monitor_command) = &config.microvm_command {
        manager.register(Arc::new(MicroVmProvider::new(MicroVmProviderConfig {
            monitor_command: monitor_command.clone(),
            image: config.image.clone(),
            state_dir: config.state_dir.clone(),
        })));
    }

    Ok(AppState::new(
        store,
        Arc::new(manager),
        ServerConfig::default(),
    ))
}
