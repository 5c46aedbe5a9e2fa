//! NATS message handlers

pub mod import;
pub mod jobs;
pub mod ping;

use std::sync::Arc;

use anyhow::Result;
use async_nats::Client;
use tokio::select;
use tracing::{error, info};

use crate::config::Config;
use crate::services::import::ImportService;

/// Start all message handlers
pub async fn start_handlers(
    client: Client,
    service: Arc<ImportService>,
    config: &Config,
) -> Result<()> {
    info!("Starting message handlers...");

    let subject = |operation: &str| format!("{}.{}", config.subject_prefix, operation);

    // Subscribe to all subjects
    let ping_sub = client.subscribe(subject("ping")).await?;
    let upload_sub = client.subscribe(subject("import.upload")).await?;
    let validate_sub = client.subscribe(subject("import.validate")).await?;
    let start_sub = client.subscribe(subject("import.start")).await?;
    let status_sub = client.subscribe(subject("import.status")).await?;
    let cancel_sub = client.subscribe(subject("import.cancel")).await?;
    let report_sub = client.subscribe(subject("import.report")).await?;
    let history_sub = client.subscribe(subject("import.history")).await?;
    let schema_sub = client.subscribe(subject("import.schema")).await?;

    info!("Subscribed to NATS subjects");

    // Clone for each handler
    let client_ping = client.clone();
    let client_upload = client.clone();
    let client_validate = client.clone();
    let client_start = client.clone();
    let client_status = client.clone();
    let client_cancel = client.clone();
    let client_report = client.clone();
    let client_history = client.clone();
    let client_schema = client.clone();

    let service_upload = Arc::clone(&service);
    let service_validate = Arc::clone(&service);
    let service_start = Arc::clone(&service);
    let service_status = Arc::clone(&service);
    let service_cancel = Arc::clone(&service);
    let service_report = Arc::clone(&service);
    let service_history = Arc::clone(&service);
    let service_schema = Arc::clone(&service);

    // Spawn handlers
    let ping_handle = tokio::spawn(async move { ping::handle_ping(client_ping, ping_sub).await });

    let upload_handle = tokio::spawn(async move {
        import::handle_upload(client_upload, upload_sub, service_upload).await
    });

    let validate_handle = tokio::spawn(async move {
        import::handle_validate(client_validate, validate_sub, service_validate).await
    });

    let start_handle = tokio::spawn(async move {
        import::handle_start(client_start, start_sub, service_start).await
    });

    let status_handle = tokio::spawn(async move {
        jobs::handle_status(client_status, status_sub, service_status).await
    });

    let cancel_handle = tokio::spawn(async move {
        jobs::handle_cancel(client_cancel, cancel_sub, service_cancel).await
    });

    let report_handle = tokio::spawn(async move {
        jobs::handle_report(client_report, report_sub, service_report).await
    });

    let history_handle = tokio::spawn(async move {
        jobs::handle_history(client_history, history_sub, service_history).await
    });

    let schema_handle = tokio::spawn(async move {
        jobs::handle_schema(client_schema, schema_sub, service_schema).await
    });

    info!("All handlers started, waiting for messages...");

    // Wait for shutdown or for any handler to finish (which means an error
    // occurred)
    select! {
        _ = service.shutdown.cancelled() => {
            info!("Shutdown requested, stopping handlers");
        }
        result = ping_handle => {
            error!("Ping handler finished: {:?}", result);
        }
        result = upload_handle => {
            error!("Import upload handler finished: {:?}", result);
        }
        result = validate_handle => {
            error!("Import validate handler finished: {:?}", result);
        }
        result = start_handle => {
            error!("Import start handler finished: {:?}", result);
        }
        result = status_handle => {
            error!("Import status handler finished: {:?}", result);
        }
        result = cancel_handle => {
            error!("Import cancel handler finished: {:?}", result);
        }
        result = report_handle => {
            error!("Import report handler finished: {:?}", result);
        }
        result = history_handle => {
            error!("Import history handler finished: {:?}", result);
        }
        result = schema_handle => {
            error!("Import schema handler finished: {:?}", result);
        }
    }

    Ok(())
}
