//! presencebot CLI entry point.

use anyhow::Context as _;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use presencebot::api::{ApiState, start_http_server};
use presencebot::config::Config;
use presencebot::messaging::TelegramTransport;
use presencebot::supervisor::{BotSupervisor, SupervisorState, run_all};

#[derive(Parser)]
#[command(name = "presencebot")]
#[command(about = "Keeps Telegram bots looking busy in every chat that recently heard from someone")]
struct Cli {
    /// Path to config file (optional)
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // A missing .env is fine.
    let dotenv = dotenvy::dotenv();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if cli.debug { "debug" } else { "info" };
        EnvFilter::new(format!("{level},hyper=warn,reqwest=warn"))
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("starting presencebot");
    if let Ok(path) = dotenv {
        tracing::debug!(path = %path.display(), "loaded .env");
    }

    let config = if let Some(config_path) = cli.config {
        Config::load_from_path(&config_path)
            .with_context(|| format!("failed to load config from {}", config_path.display()))?
    } else {
        Config::load().with_context(|| "failed to load configuration")?
    };

    tracing::info!(
        instance_dir = %config.instance_dir.display(),
        bots = config.enabled_bots().count(),
        cadence_secs = config.presence.cadence.as_secs(),
        idle_timeout_secs = config.presence.idle_timeout.as_secs(),
        "configuration loaded"
    );

    let supervisors: Vec<BotSupervisor> = config
        .enabled_bots()
        .map(|bot| {
            let transport = Arc::new(TelegramTransport::new(
                bot.token.clone(),
                config.drop_pending_updates,
            ));
            tracing::info!(bot_id = %bot.id, action = %bot.action, "bot configured");
            BotSupervisor::from_config(bot, &config, transport)
        })
        .collect();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let api_handle = if config.api.enabled {
        let bind: SocketAddr = format!("{}:{}", config.api.bind, config.api.port)
            .parse()
            .with_context(|| {
                format!(
                    "invalid API bind address {}:{}",
                    config.api.bind, config.api.port
                )
            })?;
        let state = Arc::new(ApiState::new(
            supervisors.iter().map(BotSupervisor::handle).collect(),
        ));
        Some(
            start_http_server(bind, state, shutdown_rx.clone())
                .await
                .context("failed to start HTTP server")?,
        )
    } else {
        None
    };

    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown signal received");
        shutdown_tx.send_replace(true);
    });

    let outcomes = run_all(supervisors, shutdown_rx.clone(), config.startup_stagger).await;

    for (bot_id, state) in &outcomes {
        match state {
            SupervisorState::Failed => tracing::error!(%bot_id, "bot ended in failure"),
            _ => tracing::info!(%bot_id, %state, "bot ended"),
        }
    }

    if let Some(handle) = api_handle {
        // Every identity may have failed without a signal; stop the API too.
        if !*shutdown_rx.borrow() {
            tracing::warn!("no bots left running, stopping");
            handle.abort();
        }
        let _ = handle.await;
    }

    tracing::info!("presencebot stopped");
    Ok(())
}

/// Resolves on ctrl-c, or SIGTERM on unix.
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::warn!(%error, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                tracing::warn!(%error, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
