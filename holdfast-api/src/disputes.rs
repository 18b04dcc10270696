use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use holdfast_order::models::{Dispute, ReturnDelivery};
use holdfast_order::{DisputeConclusion, DisputeDraft};
use uuid::Uuid;

use crate::orders::CountResponse;
use crate::{error::AppError, state::AppState};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/orders/{reference}/disputes", get(list_disputes).post(raise_dispute))
        .route("/v1/orders/{reference}/disputes/resolve", post(resolve_all_disputes))
        .route("/v1/orders/{reference}/disputes/conclusion", post(conclude_dispute))
        .route("/v1/orders/{reference}/disputes/{dispute_id}/resolve", post(resolve_dispute))
        .route("/v1/orders/{reference}/return/sent-out", post(confirm_return_sent_out))
        .route("/v1/orders/{reference}/return/buyer-confirm", post(buyer_confirm_return))
        .route("/v1/orders/{reference}/return/seller-confirm", post(seller_confirm_return))
        .route("/v1/orders/{reference}/return/accept", post(accept_return_condition))
}

async fn list_disputes(State(state): State<AppState>, Path(reference): Path<String>) -> Result<Json<Vec<Dispute>>, AppError> {
    Ok(Json(state.engine.disputes(&reference).await?))
}

async fn raise_dispute(
    State(state): State<AppState>,
    Path(reference): Path<String>,
    Json(draft): Json<DisputeDraft>,
) -> Result<(StatusCode, Json<Dispute>), AppError> {
    let dispute = state.engine.raise_dispute(&reference, draft).await?;
    Ok((StatusCode::CREATED, Json(dispute)))
}

async fn resolve_dispute(
    State(state): State<AppState>,
    Path((reference, dispute_id)): Path<(String, Uuid)>,
) -> Result<StatusCode, AppError> {
    state.engine.resolve_dispute(&reference, dispute_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn resolve_all_disputes(
    State(state): State<AppState>,
    Path(reference): Path<String>,
) -> Result<Json<CountResponse>, AppError> {
    let updated = state.engine.resolve_all_disputes(&reference).await?;
    Ok(Json(CountResponse { updated }))
}

async fn conclude_dispute(
    State(state): State<AppState>,
    Path(reference): Path<String>,
    Json(outcome): Json<DisputeConclusion>,
) -> Result<StatusCode, AppError> {
    state.engine.conclude_dispute(&reference, outcome).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn confirm_return_sent_out(
    State(state): State<AppState>,
    Path(reference): Path<String>,
    Json(delivery): Json<ReturnDelivery>,
) -> Result<StatusCode, AppError> {
    state.engine.confirm_return_sent_out(&reference, delivery).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn buyer_confirm_return(State(state): State<AppState>, Path(reference): Path<String>) -> Result<StatusCode, AppError> {
    state.engine.buyer_confirm_return(&reference).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn seller_confirm_return(State(state): State<AppState>, Path(reference): Path<String>) -> Result<StatusCode, AppError> {
    state.engine.seller_confirm_return(&reference).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn accept_return_condition(State(state): State<AppState>, Path(reference): Path<String>) -> Result<StatusCode, AppError> {
    state.engine.accept_return_condition(&reference).await?;
    Ok(StatusCode::NO_CONTENT)
}
