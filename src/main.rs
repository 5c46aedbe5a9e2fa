//! Kartoteka Worker - bulk CSV import service
//!
//! This worker connects to NATS and serves the import pipeline: file upload,
//! validation preview, batch execution into Postgres, progress polling and
//! error reports.

mod cli;
mod config;
mod db;
mod handlers;
mod services;
mod types;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::services::import::{
    run_dispatcher, ImportService, Notifier, SinkSet, DISPATCH_QUEUE_DEPTH,
};
use crate::services::job_store::JobStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Logs directory - use LOG_DIR env var or default to ./logs
    let logs_dir = std::env::var("LOG_DIR").unwrap_or_else(|_| "logs".to_string());
    std::fs::create_dir_all(&logs_dir).ok();

    // File appender for persistent logs (daily rotation)
    let file_appender = RollingFileAppender::new(Rotation::DAILY, &logs_dir, "worker.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    // Initialize logging - both stdout and file
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,kartoteka_worker=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer()) // stdout
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        ) // file
        .init();

    let cli = cli::Cli::parse();
    match cli.command {
        Some(cli::Command::CheckConfig) => check_config(),
        Some(cli::Command::Serve) | None => serve().await,
    }
}

fn check_config() -> Result<()> {
    let config = config::Config::from_env()?;
    println!("nats_url:          {}", config.nats_url);
    println!("subject_prefix:    {}", config.subject_prefix);
    println!("job_store_path:    {}", config.job_store_path);
    println!("log_dir:           {}", config.log_dir);
    println!("max_upload_bytes:  {}", config.max_upload_bytes);
    println!("default_batch:     {}", config.default_batch_size);
    println!("job_history_limit: {}", config.job_history_limit);
    println!("Configuration OK");
    Ok(())
}

async fn serve() -> Result<()> {
    info!("Starting Kartoteka Worker...");

    // Load configuration
    let config = config::Config::from_env()?;
    info!("Configuration loaded");

    // Connect to database
    let pool = db::create_pool(&config.database_url).await?;
    info!("Connected to PostgreSQL");

    // Connect to NATS (supports optional NATS_USER/NATS_PASSWORD auth).
    let nats_client = match (&config.nats_user, &config.nats_password) {
        (Some(user), Some(password)) if !user.is_empty() => {
            async_nats::ConnectOptions::new()
                .user_and_password(user.clone(), password.clone())
                .connect(&config.nats_url)
                .await?
        }
        _ => async_nats::connect(&config.nats_url).await?,
    };
    info!("Connected to NATS at {}", config.nats_url);

    // Assemble the import service
    let store = Arc::new(JobStore::new(
        Some(PathBuf::from(&config.job_store_path)),
        config.job_history_limit,
    ));
    let sinks = Arc::new(SinkSet::postgres(pool));
    let shutdown = tokio_util::sync::CancellationToken::new();
    let notifier = Notifier {
        client: nats_client.clone(),
        subject: format!("{}.import.completed", config.subject_prefix),
    };
    let (service, dispatch_rx) = ImportService::new(
        store,
        sinks,
        config.import_limits(),
        Some(notifier),
        shutdown.clone(),
        DISPATCH_QUEUE_DEPTH,
    );
    tokio::spawn(run_dispatcher(Arc::clone(&service), dispatch_rx));
    info!("Import service ready");

    // Stop on Ctrl+C or SIGTERM
    let shutdown_int = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            shutdown_int.cancel();
        }
    });
    #[cfg(unix)]
    {
        let shutdown_term = shutdown.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            if let Ok(mut term) = signal(SignalKind::terminate()) {
                term.recv().await;
                info!("SIGTERM received");
                shutdown_term.cancel();
            }
        });
    }

    // Start message handlers
    let handler_result = handlers::start_handlers(nats_client, service, &config).await;

    if shutdown.is_cancelled() {
        // Give running imports a moment to stop at their batch boundary and
        // persist; anything still unfinished is quarantined on restart.
        info!("Waiting for running imports to stop...");
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    }

    if let Err(e) = handler_result {
        error!("Handler error: {}", e);
        return Err(e);
    }

    info!("Kartoteka Worker stopped");
    Ok(())
}
