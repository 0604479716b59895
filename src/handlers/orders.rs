use crate::handlers::common::{success_response, CurrentUser, Paginated};
use crate::{
    entities::OrderStatus,
    errors::ApiError,
    services::orders::ListOrdersQuery,
    AppState,
};
use axum::{
    extract::{Json, Path, Query, State},
    response::IntoResponse,
    routing::{get, patch, post},
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

/// Creates the router for order endpoints
pub fn orders_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_orders))
        .route("/:id", get(get_order))
        .route("/:id/payment-session", post(retry_payment))
        .route("/:id/deliver", post(deliver_order))
        .route("/:id/status", patch(override_status))
}

/// List the caller's orders
async fn list_orders(
    State(state): State<Arc<AppState>>,
    CurrentUser(owner_id): CurrentUser,
    Query(query): Query<ListOrdersQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let page = state.services.orders.list(owner_id, query).await?;
    Ok(success_response(
        "Orders retrieved",
        Paginated::new(page.orders, page.page, page.per_page, page.total),
    ))
}

/// Get one of the caller's orders
async fn get_order(
    State(state): State<Arc<AppState>>,
    CurrentUser(owner_id): CurrentUser,
    Path(order_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let order = state.services.orders.get(owner_id, order_id).await?;
    Ok(success_response("Order retrieved", order))
}

/// Open a new payment session for a pending card order
async fn retry_payment(
    State(state): State<Arc<AppState>>,
    CurrentUser(owner_id): CurrentUser,
    Path(order_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let result = state
        .services
        .checkout
        .retry_payment(owner_id, order_id)
        .await?;
    Ok(success_response("Payment session ready", result))
}

/// Fulfilment marks the order delivered
async fn deliver_order(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let order = state.services.orders.mark_delivered(order_id).await?;
    Ok(success_response("Order delivered", order))
}

#[derive(Debug, Deserialize)]
pub struct StatusOverrideRequest {
    pub status: OrderStatus,
}

/// Administrative status override
async fn override_status(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
    Json(payload): Json<StatusOverrideRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let order = state
        .services
        .orders
        .transition_status(order_id, payload.status)
        .await?;
    Ok(success_response("Order status updated", order))
}
