use crate::handlers::common::{created_response, CurrentUser, IDEMPOTENCY_KEY_HEADER};
use crate::{
    entities::PaymentMethod,
    errors::ApiError,
    services::commerce::{CheckoutInput, ReturnOutcome},
    AppState,
};
use axum::{
    extract::{Json, Query, State},
    http::HeaderMap,
    response::{IntoResponse, Redirect},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

/// Checkout routes, mounted under `/orders`
pub fn checkout_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/checkout", post(checkout))
        .route("/checkout/return", get(checkout_return))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    pub payment_method: PaymentMethod,
    pub shipping_address_id: Uuid,
}

#[derive(Debug, Default, Deserialize)]
pub struct CheckoutQuery {
    pub success_url: Option<String>,
    pub cancel_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReturnQuery {
    pub session_id: Option<String>,
    pub order_id: Option<Uuid>,
    pub outcome: ReturnOutcome,
}

/// Place an order from the caller's cart
async fn checkout(
    State(state): State<Arc<AppState>>,
    CurrentUser(owner_id): CurrentUser,
    Query(query): Query<CheckoutQuery>,
    headers: HeaderMap,
    Json(payload): Json<CheckoutRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let idempotency_key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let input = CheckoutInput {
        payment_method: payload.payment_method,
        shipping_address_id: payload.shipping_address_id,
        success_url: query.success_url,
        cancel_url: query.cancel_url,
        idempotency_key,
    };
    let result = state.services.checkout.checkout(owner_id, input).await?;

    let message = match (result.order.payment_method, &result.checkout_url) {
        (PaymentMethod::CreditCard, Some(_)) => "Order created, awaiting payment",
        (PaymentMethod::CreditCard, None) => "Order created",
        (PaymentMethod::Cash, _) => "Order placed",
    };
    Ok(created_response(message, result))
}

/// Browser landing after the hosted payment page
async fn checkout_return(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ReturnQuery>,
) -> Result<Redirect, ApiError> {
    let target = state
        .services
        .checkout
        .complete_return(query.session_id.as_deref(), query.order_id, query.outcome)
        .await?;
    Ok(Redirect::to(&target))
}
