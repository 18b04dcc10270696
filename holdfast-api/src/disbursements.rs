use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use holdfast_core::ProviderKind;
use holdfast_order::TransferHandle;
use holdfast_shared::models::events::TransferKind;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::{error::AppError, state::AppState};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/orders/{reference}/disbursements/partial/approve", post(approve_partial))
        .route("/v1/orders/{reference}/disbursements/partial/initiate", post(initiate_partial))
        .route("/v1/orders/{reference}/disbursements/full/approve", post(approve_full))
        .route("/v1/orders/{reference}/disbursements/full/initiate", post(initiate_full))
        .route("/v1/orders/{reference}/refunds/initiate", post(initiate_refund))
}

#[derive(Debug, Serialize)]
pub struct TransferResponse {
    pub kind: TransferKind,
    pub reference: String,
    pub provider: ProviderKind,
    pub amount: Decimal,
}

impl From<TransferHandle> for TransferResponse {
    fn from(h: TransferHandle) -> Self {
        Self {
            kind: h.kind,
            reference: h.reference,
            provider: h.provider,
            amount: h.amount,
        }
    }
}

async fn approve_partial(State(state): State<AppState>, Path(reference): Path<String>) -> Result<StatusCode, AppError> {
    state.engine.approve_partial_disbursement(&reference).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn initiate_partial(
    State(state): State<AppState>,
    Path(reference): Path<String>,
) -> Result<(StatusCode, Json<TransferResponse>), AppError> {
    let handle = state.engine.initiate_partial_disbursement(&reference).await?;
    Ok((StatusCode::ACCEPTED, Json(handle.into())))
}

async fn approve_full(State(state): State<AppState>, Path(reference): Path<String>) -> Result<StatusCode, AppError> {
    state.engine.approve_seller_disbursement(&reference).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn initiate_full(
    State(state): State<AppState>,
    Path(reference): Path<String>,
) -> Result<(StatusCode, Json<TransferResponse>), AppError> {
    let handle = state.engine.initiate_seller_payout(&reference).await?;
    Ok((StatusCode::ACCEPTED, Json(handle.into())))
}

async fn initiate_refund(
    State(state): State<AppState>,
    Path(reference): Path<String>,
) -> Result<(StatusCode, Json<TransferResponse>), AppError> {
    let handle = state.engine.initiate_refund(&reference).await?;
    Ok((StatusCode::ACCEPTED, Json(handle.into())))
}
