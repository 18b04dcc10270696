use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use holdfast_core::payment::Bank;
use holdfast_core::{FeeQuote, PayoutAccount};
use holdfast_order::lifecycle::{NewOrder, PaymentReceipt, PaymentSession};
use holdfast_order::models::{Condition, ConditionDraft, TransactionRecord};
use holdfast_order::{OrderAggregate, TimelineEntry};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{error::AppError, state::AppState};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/quote", get(quote))
        .route("/v1/banks", get(list_banks))
        .route("/v1/orders", post(create_order))
        .route("/v1/merchants/{merchant_id}/orders", get(list_orders))
        .route("/v1/orders/{reference}", get(get_order))
        .route("/v1/orders/{reference}/conditions", get(list_conditions).post(set_conditions))
        .route("/v1/orders/{reference}/conditions/met", post(mark_all_conditions_met))
        .route("/v1/orders/{reference}/conditions/verify", post(verify_conditions_met))
        .route("/v1/orders/{reference}/conditions/{condition_id}/met", post(mark_condition_met))
        .route("/v1/orders/{reference}/payments", post(initiate_payment))
        .route("/v1/orders/{reference}/payments/verify", post(verify_payment))
        .route("/v1/orders/{reference}/delivery/sent-out", post(confirm_sent_out))
        .route("/v1/orders/{reference}/delivery/seller-confirm", post(seller_confirm_delivery))
        .route("/v1/orders/{reference}/delivery/buyer-confirm", post(buyer_confirm_delivery))
        .route("/v1/orders/{reference}/refund-account", post(register_refund_account))
        .route("/v1/orders/{reference}/rating", post(rate_order))
        .route("/v1/orders/{reference}/history", get(history))
        .route("/v1/orders/{reference}/timeline", get(timeline))
}

#[derive(Debug, Deserialize)]
pub struct QuoteParams {
    pub price: Decimal,
}

#[derive(Debug, Serialize)]
pub struct QuoteResponse {
    #[serde(flatten)]
    pub quote: FeeQuote,
    pub total_fees: Decimal,
    pub amount_to_pay: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct VerifyPaymentRequest {
    pub provider_ref: String,
}

#[derive(Debug, Deserialize)]
pub struct RefundAccountRequest {
    pub account_number: String,
    pub bank_code: String,
}

#[derive(Debug, Deserialize)]
pub struct RatingRequest {
    pub score: u8,
    pub feedback: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CountResponse {
    pub updated: usize,
}

async fn quote(State(state): State<AppState>, Query(params): Query<QuoteParams>) -> Result<Json<QuoteResponse>, AppError> {
    let quote = state.engine.quote(params.price)?;
    Ok(Json(QuoteResponse {
        total_fees: quote.total_fees(),
        amount_to_pay: params.price + quote.total_fees(),
        quote,
    }))
}

async fn list_banks(State(state): State<AppState>) -> Result<Json<Vec<Bank>>, AppError> {
    Ok(Json(state.engine.list_banks().await?))
}

async fn create_order(
    State(state): State<AppState>,
    Json(req): Json<NewOrder>,
) -> Result<(StatusCode, Json<OrderAggregate>), AppError> {
    let agg = state.engine.initialize_order(req).await?;
    Ok((StatusCode::CREATED, Json(agg)))
}

async fn list_orders(
    State(state): State<AppState>,
    Path(merchant_id): Path<String>,
) -> Result<Json<Vec<OrderAggregate>>, AppError> {
    Ok(Json(state.engine.list_orders(&merchant_id).await?))
}

async fn get_order(State(state): State<AppState>, Path(reference): Path<String>) -> Result<Json<OrderAggregate>, AppError> {
    Ok(Json(state.engine.get_order(&reference).await?))
}

async fn list_conditions(
    State(state): State<AppState>,
    Path(reference): Path<String>,
) -> Result<Json<Vec<Condition>>, AppError> {
    Ok(Json(state.engine.conditions(&reference).await?))
}

async fn set_conditions(
    State(state): State<AppState>,
    Path(reference): Path<String>,
    Json(drafts): Json<Vec<ConditionDraft>>,
) -> Result<(StatusCode, Json<Vec<Condition>>), AppError> {
    let conditions = state.engine.set_conditions(&reference, drafts).await?;
    Ok((StatusCode::CREATED, Json(conditions)))
}

async fn mark_condition_met(
    State(state): State<AppState>,
    Path((reference, condition_id)): Path<(String, Uuid)>,
) -> Result<StatusCode, AppError> {
    state.engine.mark_condition_met(&reference, condition_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn mark_all_conditions_met(
    State(state): State<AppState>,
    Path(reference): Path<String>,
) -> Result<Json<CountResponse>, AppError> {
    let updated = state.engine.mark_all_conditions_met(&reference).await?;
    Ok(Json(CountResponse { updated }))
}

async fn verify_conditions_met(State(state): State<AppState>, Path(reference): Path<String>) -> Result<StatusCode, AppError> {
    state.engine.verify_conditions_met(&reference).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn initiate_payment(
    State(state): State<AppState>,
    Path(reference): Path<String>,
) -> Result<Json<PaymentSession>, AppError> {
    Ok(Json(state.engine.initiate_payment(&reference).await?))
}

async fn verify_payment(
    State(state): State<AppState>,
    Path(reference): Path<String>,
    Json(req): Json<VerifyPaymentRequest>,
) -> Result<Json<PaymentReceipt>, AppError> {
    Ok(Json(state.engine.verify_payment(&reference, &req.provider_ref).await?))
}

async fn confirm_sent_out(State(state): State<AppState>, Path(reference): Path<String>) -> Result<StatusCode, AppError> {
    state.engine.confirm_sent_out(&reference).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn seller_confirm_delivery(State(state): State<AppState>, Path(reference): Path<String>) -> Result<StatusCode, AppError> {
    state.engine.seller_confirm_delivery(&reference).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn buyer_confirm_delivery(State(state): State<AppState>, Path(reference): Path<String>) -> Result<StatusCode, AppError> {
    state.engine.buyer_confirm_delivery(&reference).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn register_refund_account(
    State(state): State<AppState>,
    Path(reference): Path<String>,
    Json(req): Json<RefundAccountRequest>,
) -> Result<Json<PayoutAccount>, AppError> {
    let account = state
        .engine
        .register_refund_account(&reference, &req.account_number, &req.bank_code)
        .await?;
    Ok(Json(account))
}

async fn rate_order(
    State(state): State<AppState>,
    Path(reference): Path<String>,
    Json(req): Json<RatingRequest>,
) -> Result<StatusCode, AppError> {
    state.engine.rate_order(&reference, req.score, req.feedback).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn history(
    State(state): State<AppState>,
    Path(reference): Path<String>,
) -> Result<Json<Vec<TransactionRecord>>, AppError> {
    Ok(Json(state.engine.history(&reference).await?))
}

async fn timeline(State(state): State<AppState>, Path(reference): Path<String>) -> Result<Json<Vec<TimelineEntry>>, AppError> {
    Ok(Json(state.engine.timeline(&reference).await?))
}
