use crate::handlers::common::{success_response, validate_input, CurrentUser};
use crate::{errors::ApiError, services::commerce::AddToCartInput, AppState};
use axum::{
    extract::{Json, Path, State},
    response::IntoResponse,
    routing::{get, patch, post},
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

/// Creates the router for the caller's cart
pub fn carts_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(get_cart).post(add_to_cart).delete(clear_cart))
        .route("/coupon", post(apply_coupon).delete(remove_coupon))
        .route("/:item_id", patch(update_cart_item).delete(remove_cart_item))
}

/// Get the cart with its lines and totals
async fn get_cart(
    State(state): State<Arc<AppState>>,
    CurrentUser(owner_id): CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    let cart = state.services.cart.get_cart(owner_id).await?;
    Ok(success_response("Cart retrieved", cart))
}

/// Add a product to the cart
async fn add_to_cart(
    State(state): State<Arc<AppState>>,
    CurrentUser(owner_id): CurrentUser,
    Json(payload): Json<AddToCartInput>,
) -> Result<impl IntoResponse, ApiError> {
    validate_input(&payload)?;
    let cart = state.services.cart.add_item(owner_id, payload).await?;
    Ok(success_response("Item added to cart", cart))
}

/// Set the quantity of a cart line
async fn update_cart_item(
    State(state): State<Arc<AppState>>,
    CurrentUser(owner_id): CurrentUser,
    Path(item_id): Path<Uuid>,
    Json(payload): Json<UpdateQuantityRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_input(&payload)?;
    let cart = state
        .services
        .cart
        .update_item(owner_id, item_id, payload.quantity)
        .await?;
    Ok(success_response("Cart item updated", cart))
}

/// Remove a cart line
async fn remove_cart_item(
    State(state): State<Arc<AppState>>,
    CurrentUser(owner_id): CurrentUser,
    Path(item_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let cart = state.services.cart.remove_item(owner_id, item_id).await?;
    Ok(success_response("Cart item removed", cart))
}

/// Empty the cart
async fn clear_cart(
    State(state): State<Arc<AppState>>,
    CurrentUser(owner_id): CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    let cart = state.services.cart.clear(owner_id).await?;
    Ok(success_response("Cart cleared", cart))
}

/// Attach a coupon code
async fn apply_coupon(
    State(state): State<Arc<AppState>>,
    CurrentUser(owner_id): CurrentUser,
    Json(payload): Json<ApplyCouponRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_input(&payload)?;
    let cart = state
        .services
        .cart
        .apply_coupon(owner_id, &payload.code)
        .await?;
    Ok(success_response("Coupon applied", cart))
}

/// Detach the coupon, if any
async fn remove_coupon(
    State(state): State<Arc<AppState>>,
    CurrentUser(owner_id): CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    let cart = state.services.cart.remove_coupon(owner_id).await?;
    Ok(success_response("Coupon removed", cart))
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateQuantityRequest {
    #[validate(range(min = 1, message = "Quantity must be at least 1"))]
    pub quantity: i32,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ApplyCouponRequest {
    #[validate(length(min = 1, max = 64, message = "Coupon code is required"))]
    pub code: String,
}
