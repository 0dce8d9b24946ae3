//! HTTP provisioning endpoint.
//!
//! `POST /devices/provision` takes `{serialNumber, csr}` and answers:
//!
//! | Outcome            | Status | Body                                           |
//! |--------------------|--------|------------------------------------------------|
//! | issued             | 201    | `{certificate, caCertificate}`                 |
//! | unknown serial     | 404    | `{message: "Device <serial> is not registered"}` |
//! | anything else      | 500    | `{message: "Failed to sign certificate"}`      |
//!
//! The precise cause of a 500 goes to the log and the audit trail only.
//! Signing is CPU-bound and runs on the blocking pool.

use crate::error::PkiError;
use crate::provisioning::{session::ProvisioningService, ErrorResponse};
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Message returned for every failure other than an unknown device
pub const SIGNING_FAILED_MESSAGE: &str = "Failed to sign certificate";

/// Routes of the provisioning endpoint
pub fn router(service: Arc<ProvisioningService>) -> Router {
    Router::new()
        .route(crate::provisioning::client::PROVISION_PATH, post(provision))
        .route("/health", get(health))
        .with_state(service)
}

/// Serve until `shutdown` completes.
pub async fn serve<F>(
    addr: &str,
    service: Arc<ProvisioningService>,
    shutdown: F,
) -> Result<(), PkiError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    log::info!("Provisioning endpoint listening on {}", listener.local_addr()?);
    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown)
        .await?;
    log::info!("Provisioning endpoint stopped");
    Ok(())
}

/// Public status and body for a provisioning failure.
pub fn error_status(err: &PkiError) -> (StatusCode, ErrorResponse) {
    match err {
        PkiError::UnknownDevice(serial) => (
            StatusCode::NOT_FOUND,
            ErrorResponse {
                message: format!("Device {} is not registered", serial),
            },
        ),
        _ => (
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorResponse {
                message: SIGNING_FAILED_MESSAGE.to_string(),
            },
        ),
    }
}

async fn provision(State(service): State<Arc<ProvisioningService>>, body: Bytes) -> Response {
    let outcome = tokio::task::spawn_blocking(move || service.provision_json(&body)).await;

    match outcome {
        Ok(Ok(response)) => (StatusCode::CREATED, Json(response)).into_response(),
        Ok(Err(err)) => {
            let (status, body) = error_status(&err);
            (status, Json(body)).into_response()
        }
        Err(join_error) => {
            log::error!("Provisioning task failed: {}", join_error);
            let (status, body) = error_status(&PkiError::InternalError(join_error.to_string()));
            (status, Json(body)).into_response()
        }
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
