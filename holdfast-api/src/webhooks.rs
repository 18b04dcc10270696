use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    routing::post,
    Json, Router,
};
use futures_util::FutureExt;
use holdfast_core::ProviderKind;
use holdfast_order::ReconcileOutcome;
use serde_json::{json, Value};
use std::panic::AssertUnwindSafe;

use crate::{error::AppError, state::AppState};

pub fn routes() -> Router<AppState> {
    Router::new().route("/v1/webhooks/{provider}", post(handle_provider_webhook))
}

/// POST /v1/webhooks/{provider}
/// Transfer status callbacks. The raw body is verified against the
/// provider's signature header before anything is parsed into the order.
pub async fn handle_provider_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let kind: ProviderKind = provider
        .parse()
        .map_err(|_| AppError::NotFoundError(format!("Unknown provider {}", provider)))?;

    let signature = headers
        .get(kind.signature_header())
        .and_then(|v| v.to_str().ok())
        .ok_or(AppError::InvalidSignature)?;

    let coordinator = state.engine.coordinator().clone();
    let reconciled = AssertUnwindSafe(coordinator.reconcile(kind, &body, signature))
        .catch_unwind()
        .await
        .map_err(|_| AppError::InternalServerError(format!("{} webhook handler panicked", kind)))??;

    let status = match reconciled {
        ReconcileOutcome::Applied { order_id, kind: transfer } => {
            tracing::info!("{} webhook applied {} transfer to order {}", kind, transfer, order_id);
            "applied"
        }
        ReconcileOutcome::AlreadyApplied { .. } => "already_applied",
        ReconcileOutcome::Acknowledged { .. } => "acknowledged",
        ReconcileOutcome::Flagged { order_id, kind: transfer } => {
            tracing::warn!("{} webhook for {} transfer on closed order {} needs review", kind, transfer, order_id);
            "flagged"
        }
        ReconcileOutcome::Ignored => "ignored",
    };

    Ok(Json(json!({ "status": status })))
}
