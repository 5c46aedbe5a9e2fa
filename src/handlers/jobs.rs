//! Job query handlers
//!
//! The read side of the import flow: polling status, cancellation, the error
//! report, job history and the target schema description.

use std::sync::Arc;

use anyhow::Result;
use async_nats::{Client, Subscriber};
use futures::StreamExt;
use tracing::error;
use uuid::Uuid;

use crate::services::import::{HistoryRequest, ImportService, JobRef, SchemaRequest};
use crate::types::{ErrorResponse, Request, SuccessResponse};

/// Handle import.status requests
pub async fn handle_status(
    client: Client,
    mut subscriber: Subscriber,
    service: Arc<ImportService>,
) -> Result<()> {
    while let Some(msg) = subscriber.next().await {
        let reply = match msg.reply {
            Some(ref r) => r.clone(),
            None => continue,
        };

        let request: Request<JobRef> = match serde_json::from_slice(&msg.payload) {
            Ok(req) => req,
            Err(e) => {
                error!("Failed to parse import status request: {}", e);
                let error = ErrorResponse::new(
                    extract_request_id(&msg.payload),
                    "INVALID_REQUEST",
                    e.to_string(),
                );
                let _ = client.publish(reply, serde_json::to_vec(&error)?.into()).await;
                continue;
            }
        };

        match service.status(request.payload.job_id) {
            Ok(response) => {
                let success = SuccessResponse::new(request.id, response);
                let _ = client.publish(reply, serde_json::to_vec(&success)?.into()).await;
            }
            Err(e) => {
                let error = ErrorResponse::new(request.id, e.code(), e.to_string());
                let _ = client.publish(reply, serde_json::to_vec(&error)?.into()).await;
            }
        }
    }

    Ok(())
}

/// Handle import.cancel requests
pub async fn handle_cancel(
    client: Client,
    mut subscriber: Subscriber,
    service: Arc<ImportService>,
) -> Result<()> {
    while let Some(msg) = subscriber.next().await {
        let reply = match msg.reply {
            Some(ref r) => r.clone(),
            None => continue,
        };

        let request: Request<JobRef> = match serde_json::from_slice(&msg.payload) {
            Ok(req) => req,
            Err(e) => {
                error!("Failed to parse import cancel request: {}", e);
                let error = ErrorResponse::new(
                    extract_request_id(&msg.payload),
                    "INVALID_REQUEST",
                    e.to_string(),
                );
                let _ = client.publish(reply, serde_json::to_vec(&error)?.into()).await;
                continue;
            }
        };

        match service.cancel(request.payload.job_id) {
            Ok(response) => {
                let success = SuccessResponse::new(request.id, response);
                let _ = client.publish(reply, serde_json::to_vec(&success)?.into()).await;
            }
            Err(e) => {
                error!("Import cancel rejected: {}", e);
                let error = ErrorResponse::new(request.id, e.code(), e.to_string());
                let _ = client.publish(reply, serde_json::to_vec(&error)?.into()).await;
            }
        }
    }

    Ok(())
}

/// Handle import.report requests
pub async fn handle_report(
    client: Client,
    mut subscriber: Subscriber,
    service: Arc<ImportService>,
) -> Result<()> {
    while let Some(msg) = subscriber.next().await {
        let reply = match msg.reply {
            Some(ref r) => r.clone(),
            None => continue,
        };

        let request: Request<JobRef> = match serde_json::from_slice(&msg.payload) {
            Ok(req) => req,
            Err(e) => {
                error!("Failed to parse import report request: {}", e);
                let error = ErrorResponse::new(
                    extract_request_id(&msg.payload),
                    "INVALID_REQUEST",
                    e.to_string(),
                );
                let _ = client.publish(reply, serde_json::to_vec(&error)?.into()).await;
                continue;
            }
        };

        match service.report(request.payload.job_id) {
            Ok(response) => {
                let success = SuccessResponse::new(request.id, response);
                let _ = client.publish(reply, serde_json::to_vec(&success)?.into()).await;
            }
            Err(e) => {
                let error = ErrorResponse::new(request.id, e.code(), e.to_string());
                let _ = client.publish(reply, serde_json::to_vec(&error)?.into()).await;
            }
        }
    }

    Ok(())
}

/// Handle import.history requests
pub async fn handle_history(
    client: Client,
    mut subscriber: Subscriber,
    service: Arc<ImportService>,
) -> Result<()> {
    while let Some(msg) = subscriber.next().await {
        let reply = match msg.reply {
            Some(ref r) => r.clone(),
            None => continue,
        };

        let request: Request<HistoryRequest> = match serde_json::from_slice(&msg.payload) {
            Ok(req) => req,
            Err(e) => {
                error!("Failed to parse import history request: {}", e);
                let error = ErrorResponse::new(
                    extract_request_id(&msg.payload),
                    "INVALID_REQUEST",
                    e.to_string(),
                );
                let _ = client.publish(reply, serde_json::to_vec(&error)?.into()).await;
                continue;
            }
        };

        let page = service.history(request.payload);
        let success = SuccessResponse::new(request.id, page);
        let _ = client.publish(reply, serde_json::to_vec(&success)?.into()).await;
    }

    Ok(())
}

/// Handle import.schema requests
pub async fn handle_schema(
    client: Client,
    mut subscriber: Subscriber,
    service: Arc<ImportService>,
) -> Result<()> {
    while let Some(msg) = subscriber.next().await {
        let reply = match msg.reply {
            Some(ref r) => r.clone(),
            None => continue,
        };

        let request: Request<SchemaRequest> = match serde_json::from_slice(&msg.payload) {
            Ok(req) => req,
            Err(e) => {
                error!("Failed to parse import schema request: {}", e);
                let error = ErrorResponse::new(
                    extract_request_id(&msg.payload),
                    "INVALID_REQUEST",
                    e.to_string(),
                );
                let _ = client.publish(reply, serde_json::to_vec(&error)?.into()).await;
                continue;
            }
        };

        match service.schema(request.payload) {
            Ok(response) => {
                let success = SuccessResponse::new(request.id, response);
                let _ = client.publish(reply, serde_json::to_vec(&success)?.into()).await;
            }
            Err(e) => {
                let error = ErrorResponse::new(request.id, e.code(), e.to_string());
                let _ = client.publish(reply, serde_json::to_vec(&error)?.into()).await;
            }
        }
    }

    Ok(())
}

/// Best-effort request id recovery for malformed payloads, so the caller can
/// still correlate the error envelope.
fn extract_request_id(payload: &[u8]) -> Uuid {
    if let Ok(v) = serde_json::from_slice::<serde_json::Value>(payload) {
        if let Some(id_str) = v.get("id").and_then(|id| id.as_str()) {
            if let Ok(uuid) = Uuid::parse_str(id_str) {
                return uuid;
            }
        }
    }
    Uuid::nil()
}
