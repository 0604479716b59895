//! Hosted card payment providers.
//!
//! Card orders are settled out of band: checkout opens a hosted session with
//! a [`PaymentGateway`], the shopper pays on the provider's page, and the
//! provider reports the outcome through a signed webhook or the return
//! redirect. Gateways only translate; every state change happens in the
//! checkout service.

pub mod sandbox;
pub mod signature;
pub mod stripe;

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use rust_decimal::{prelude::ToPrimitive, Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use std::sync::Arc;

use crate::config::AppConfig;
use crate::errors::ServiceError;

pub use sandbox::SandboxGateway;
pub use stripe::StripeGateway;

/// Placeholder a provider substitutes with the session reference in the
/// success URL.
pub const SESSION_ID_PLACEHOLDER: &str = "{CHECKOUT_SESSION_ID}";

/// What checkout asks a provider to collect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    pub order_id: Uuid,
    pub order_number: String,
    pub owner_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub success_url: String,
    pub cancel_url: String,
    pub expires_at: DateTime<Utc>,
    /// Sent to the provider so a retried HTTP call cannot open two sessions.
    pub idempotency_key: String,
}

/// A session the provider opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostedSession {
    pub reference: String,
    pub checkout_url: String,
    pub expires_at: DateTime<Utc>,
}

/// Provider-side state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Open,
    Paid,
    Failed,
    Cancelled,
    Expired,
}

impl SessionState {
    pub fn is_settled(self) -> bool {
        !matches!(self, SessionState::Open)
    }
}

/// A verified provider notification about one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentNotification {
    pub event_id: Option<String>,
    pub reference: String,
    pub state: SessionState,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("provider rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("unexpected provider response: {0}")]
    Decode(String),
    #[error("unknown session {0}")]
    UnknownSession(String),
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            GatewayError::Decode(err.to_string())
        } else {
            GatewayError::Transport(err.to_string())
        }
    }
}

impl From<GatewayError> for ServiceError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::UnknownSession(reference) => {
                ServiceError::NotFound(format!("Payment session {} not found", reference))
            }
            other => ServiceError::ExternalServiceError(other.to_string()),
        }
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Short provider name stored on session rows.
    fn name(&self) -> &'static str;

    async fn create_session(&self, request: &SessionRequest)
        -> Result<HostedSession, GatewayError>;

    /// Current provider-side state, used by the return redirect and by
    /// reconciliation of sessions whose webhook never arrived.
    async fn session_state(&self, reference: &str) -> Result<SessionState, GatewayError>;

    /// Closes an open session so it can no longer be paid. Returns the state
    /// the session ended in, which is `Paid` if the shopper paid first.
    async fn expire_session(&self, reference: &str) -> Result<SessionState, GatewayError>;

    /// Verifies and decodes a webhook. `Ok(None)` means the event is
    /// authentic but irrelevant and should be acknowledged.
    fn parse_notification(
        &self,
        headers: &HeaderMap,
        payload: &[u8],
    ) -> Result<Option<PaymentNotification>, ServiceError>;
}

/// Builds the provider named by `payment_provider`.
pub fn gateway_from_config(config: &AppConfig) -> Result<Arc<dyn PaymentGateway>, ServiceError> {
    if config.uses_stripe() {
        let stripe = StripeGateway::new(stripe::StripeConfig::from_app_config(config)?)?;
        return Ok(Arc::new(stripe));
    }
    Ok(Arc::new(
        SandboxGateway::new(config.public_base_url.clone()).with_webhook_secret(
            config.payment_webhook_secret.clone(),
            config.payment_webhook_tolerance_secs,
        ),
    ))
}

/// Amount in the currency's minor unit. Every supported currency has two
/// decimal places.
pub fn to_minor_units(amount: Decimal) -> Result<i64, GatewayError> {
    (amount * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .filter(|v| *v >= 0)
        .ok_or_else(|| GatewayError::Decode(format!("amount {} out of range", amount)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn minor_units_round_to_cents() {
        assert_eq!(to_minor_units(dec!(86.00)).unwrap(), 8600);
        assert_eq!(to_minor_units(dec!(0.1)).unwrap(), 10);
        assert_eq!(to_minor_units(dec!(12.345)).unwrap(), 1235);
        assert!(to_minor_units(dec!(-1)).is_err());
    }

    #[test]
    fn only_open_is_unsettled() {
        assert!(!SessionState::Open.is_settled());
        assert!(SessionState::Paid.is_settled());
        assert!(SessionState::Expired.is_settled());
    }
}
