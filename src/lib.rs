//! Storefront cart pricing and checkout engine.
//!
//! Carts are priced from their persisted lines and coupon on every change;
//! checkout turns a cart into an order and settles card payments through a
//! hosted payment provider.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod migrator;
pub mod services;
pub mod tracing;

use axum::{http::HeaderValue, middleware, routing::get, Router};
use sea_orm::DatabaseConnection;
use std::{sync::Arc, time::Duration};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::handlers::{
    commerce::{carts_routes, checkout_routes},
    health::health_check,
    orders::orders_routes,
    payment_webhooks::payment_webhook_routes,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: config::AppConfig,
    pub event_sender: events::EventSender,
    pub services: handlers::AppServices,
}

/// Routes served under `/api/v1`
pub fn api_v1_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health_check))
        .nest("/cart", carts_routes())
        .nest("/orders", orders_routes().merge(checkout_routes()))
        .nest("/payments", payment_webhook_routes())
}

/// The full application with its middleware stack.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config);
    Router::new()
        .route("/health", get(health_check))
        .nest("/api/v1", api_v1_routes())
        .layer(middleware::from_fn(crate::tracing::request_context))
        .layer(TraceLayer::new_for_http().make_span_with(crate::tracing::RequestSpanMaker))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(CompressionLayer::new())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(cors)
        .with_state(state)
}

fn cors_layer(cfg: &config::AppConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = cfg
        .cors_allowed_origins
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(value) => Some(value),
            Err(_) => {
                ::tracing::warn!(origin = o, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    if !origins.is_empty() {
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    } else if cfg.is_development() {
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
    }
}
