use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

fn current_request_id() -> Option<String> {
    crate::tracing::current_request_id().map(|rid| rid.as_str().to_string())
}

/// Error body, sharing the success envelope's shape with `data` always null.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
    pub status_code: u16,
    pub data: Option<Value>,
    /// Machine-readable error kind, e.g. `coupon_expired`
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// One product that cannot be supplied in the requested quantity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockShortfall {
    pub product_id: Uuid,
    pub requested: i32,
    pub available: i32,
}

fn describe_shortfalls(items: &[StockShortfall]) -> String {
    items
        .iter()
        .map(|s| s.product_id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(
        #[from]
        #[serde(skip)]
        sea_orm::error::DbErr,
    ),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Product {product_id} is out of stock: requested {requested}, available {available}")]
    OutOfStock {
        product_id: Uuid,
        requested: i32,
        available: i32,
    },

    #[error("Insufficient stock for products: {}", describe_shortfalls(.0))]
    InsufficientStock(Vec<StockShortfall>),

    #[error("Coupon {0} does not exist")]
    CouponNotFound(String),

    #[error("Coupon {0} is not active")]
    CouponInactive(String),

    #[error("Coupon {0} has expired")]
    CouponExpired(String),

    #[error("Coupon {0} has reached its usage limit")]
    CouponUsageExceeded(String),

    #[error("Coupon {code} requires a minimum order of {minimum}; add {shortfall} more to use it")]
    CouponBelowMinOrder {
        code: String,
        minimum: Decimal,
        shortfall: Decimal,
    },

    #[error("Invalid shipping address: {0}")]
    InvalidShippingAddress(String),

    #[error("Payment session could not be created for order {order_id}: {reason}")]
    PaymentSessionFailed { order_id: Uuid, reason: String },

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(Uuid),

    #[error("Order {0} is already finalized")]
    OrderAlreadyFinalized(Uuid),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidStatusTransition { from: String, to: String },

    #[error("External service error: {0}")]
    ExternalServiceError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Other error: {0}")]
    Other(
        #[from]
        #[serde(skip)]
        anyhow::Error,
    ),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl ServiceError {
    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::DatabaseError(_) | Self::InternalError(_) | Self::Other(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::NotFound(_) | Self::CouponNotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_)
            | Self::InvalidOperation(_)
            | Self::InvalidSignature(_)
            | Self::InvalidShippingAddress(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::OutOfStock { .. }
            | Self::InsufficientStock(_)
            | Self::CouponInactive(_)
            | Self::CouponExpired(_)
            | Self::CouponUsageExceeded(_)
            | Self::CouponBelowMinOrder { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::ConcurrentModification(_)
            | Self::OrderAlreadyFinalized(_)
            | Self::InvalidStatusTransition { .. } => StatusCode::CONFLICT,
            Self::PaymentSessionFailed { .. } | Self::ExternalServiceError(_) => {
                StatusCode::BAD_GATEWAY
            }
        }
    }

    /// Stable machine-readable identifier of the error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DatabaseError(_) => "database_error",
            Self::NotFound(_) => "not_found",
            Self::ValidationError(_) => "validation_error",
            Self::InvalidOperation(_) => "invalid_operation",
            Self::Unauthorized(_) => "unauthorized",
            Self::InvalidSignature(_) => "invalid_signature",
            Self::OutOfStock { .. } => "out_of_stock",
            Self::InsufficientStock(_) => "insufficient_stock",
            Self::CouponNotFound(_) => "coupon_not_found",
            Self::CouponInactive(_) => "coupon_inactive",
            Self::CouponExpired(_) => "coupon_expired",
            Self::CouponUsageExceeded(_) => "coupon_usage_exceeded",
            Self::CouponBelowMinOrder { .. } => "coupon_below_min_order",
            Self::InvalidShippingAddress(_) => "invalid_shipping_address",
            Self::PaymentSessionFailed { .. } => "payment_session_failed",
            Self::ConcurrentModification(_) => "concurrent_modification",
            Self::OrderAlreadyFinalized(_) => "order_already_finalized",
            Self::InvalidStatusTransition { .. } => "invalid_status_transition",
            Self::ExternalServiceError(_) => "external_service_error",
            Self::InternalError(_) | Self::Other(_) => "internal_error",
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::InternalError(_) | Self::Other(_) => "Internal server error".to_string(),
            Self::ExternalServiceError(_) => "Upstream service unavailable".to_string(),
            _ => self.to_string(),
        }
    }

    /// Structured context a client can act on, e.g. which products ran short.
    pub fn details(&self) -> Option<Value> {
        match self {
            Self::OutOfStock {
                product_id,
                requested,
                available,
            } => Some(json!({
                "productId": product_id,
                "requested": requested,
                "available": available,
            })),
            Self::InsufficientStock(items) => Some(json!({ "products": items })),
            Self::CouponBelowMinOrder {
                code,
                minimum,
                shortfall,
            } => Some(json!({
                "code": code,
                "minimum": minimum,
                "shortfall": shortfall,
            })),
            Self::PaymentSessionFailed { order_id, .. } => Some(json!({ "orderId": order_id })),
            _ => None,
        }
    }

    fn to_error_response(&self, status: StatusCode) -> ErrorResponse {
        ErrorResponse {
            success: false,
            message: self.response_message(),
            status_code: status.as_u16(),
            data: None,
            code: self.code().to_string(),
            details: self.details(),
            request_id: current_request_id(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, code = self.code(), "request failed");
        }
        let body = self.to_error_response(status);
        (status, Json(body)).into_response()
    }
}

/// Error type returned by HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Service error: {0}")]
    ServiceError(#[from] ServiceError),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::ServiceError(service_error) => service_error.into_response(),
            ApiError::ValidationError(msg) => {
                ServiceError::ValidationError(msg).into_response()
            }
            ApiError::Unauthorized(msg) => ServiceError::Unauthorized(msg).into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn service_error_response_includes_request_id() {
        let response =
            crate::tracing::scope_request_id(crate::tracing::RequestId::new("req-123"), async {
                ServiceError::NotFound("missing".into()).into_response()
            })
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let payload: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(payload.request_id.as_deref(), Some("req-123"));
        assert!(!payload.success);
        assert_eq!(payload.status_code, 404);
        assert!(payload.data.is_none());
    }

    #[tokio::test]
    async fn below_min_order_response_reports_shortfall() {
        let err = ServiceError::CouponBelowMinOrder {
            code: "SAVE10".into(),
            minimum: dec!(100),
            shortfall: dec!(15.50),
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let payload: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(payload["code"], "coupon_below_min_order");
        assert_eq!(payload["statusCode"], 422);
        assert!(payload["message"].as_str().unwrap().contains("15.50"));
        assert_eq!(payload["details"]["code"], "SAVE10");
    }

    #[test]
    fn service_error_status_code_mapping() {
        assert_eq!(
            ServiceError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ServiceError::CouponNotFound("X".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ServiceError::CouponExpired("X".into()).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ServiceError::InsufficientStock(vec![]).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ServiceError::InvalidShippingAddress("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServiceError::ConcurrentModification(Uuid::nil()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ServiceError::PaymentSessionFailed {
                order_id: Uuid::nil(),
                reason: "timeout".into()
            }
            .status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ServiceError::InternalError("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn service_error_response_message_hides_internal_details() {
        assert_eq!(
            ServiceError::InternalError("secret".into()).response_message(),
            "Internal server error"
        );
        assert_eq!(
            ServiceError::DatabaseError(sea_orm::DbErr::Custom("pg down".into()))
                .response_message(),
            "Database error"
        );
        assert_eq!(
            ServiceError::CouponInactive("SPRING".into()).response_message(),
            "Coupon SPRING is not active"
        );
    }

    #[test]
    fn insufficient_stock_lists_every_product() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let err = ServiceError::InsufficientStock(vec![
            StockShortfall {
                product_id: a,
                requested: 3,
                available: 1,
            },
            StockShortfall {
                product_id: b,
                requested: 2,
                available: 0,
            },
        ]);
        let msg = err.to_string();
        assert!(msg.contains(&a.to_string()));
        assert!(msg.contains(&b.to_string()));
        assert_eq!(err.details().unwrap()["products"].as_array().unwrap().len(), 2);
    }
}
