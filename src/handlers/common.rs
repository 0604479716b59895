use crate::errors::ApiError;
use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Header carrying the caller's id, set by the upstream auth layer.
pub const USER_ID_HEADER: &str = "x-user-id";
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Response envelope shared by every endpoint.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    pub success: bool,
    pub message: String,
    pub status_code: u16,
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn new(status: StatusCode, message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            status_code: status.as_u16(),
            data: Some(data),
        }
    }
}

/// Standard success response
pub fn success_response<T: Serialize>(message: &str, data: T) -> Response {
    (StatusCode::OK, Json(ApiResponse::new(StatusCode::OK, message, data))).into_response()
}

/// Standard created response
pub fn created_response<T: Serialize>(message: &str, data: T) -> Response {
    (
        StatusCode::CREATED,
        Json(ApiResponse::new(StatusCode::CREATED, message, data)),
    )
        .into_response()
}

/// Validate request input
pub fn validate_input<T: Validate>(input: &T) -> Result<(), ApiError> {
    input
        .validate()
        .map_err(|e| ApiError::ValidationError(format!("Validation failed: {}", e)))
}

/// Standard pagination response metadata
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PaginationMeta {
    pub page: u64,
    pub per_page: u64,
    pub total: u64,
    pub total_pages: u64,
}

impl PaginationMeta {
    pub fn new(page: u64, per_page: u64, total: u64) -> Self {
        let total_pages = if total == 0 || per_page == 0 {
            0
        } else {
            total.div_ceil(per_page)
        };
        Self {
            page,
            per_page,
            total,
            total_pages,
        }
    }
}

/// `data` of a paginated response
#[derive(Debug, Serialize)]
pub struct Paginated<T> {
    pub items: Vec<T>,
    pub meta: PaginationMeta,
}

impl<T> Paginated<T> {
    pub fn new(items: Vec<T>, page: u64, per_page: u64, total: u64) -> Self {
        Self {
            items,
            meta: PaginationMeta::new(page, per_page, total),
        }
    }
}

/// The authenticated caller, taken from [`USER_ID_HEADER`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentUser(pub Uuid);

#[async_trait]
impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::Unauthorized("Missing caller identity".to_string()))?;
        Uuid::parse_str(raw.trim())
            .map(CurrentUser)
            .map_err(|_| ApiError::Unauthorized("Malformed caller identity".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    #[test]
    fn pagination_meta_rounds_pages_up() {
        assert_eq!(PaginationMeta::new(1, 20, 0).total_pages, 0);
        assert_eq!(PaginationMeta::new(1, 20, 20).total_pages, 1);
        assert_eq!(PaginationMeta::new(2, 20, 41).total_pages, 3);
    }

    #[test]
    fn envelope_uses_camel_case() {
        let body = serde_json::to_value(ApiResponse::new(StatusCode::OK, "ok", 5)).unwrap();
        assert_eq!(body["statusCode"], 200);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"], 5);
    }

    #[tokio::test]
    async fn current_user_requires_a_uuid_header() {
        let id = Uuid::new_v4();
        let (mut parts, _) = Request::builder()
            .header(USER_ID_HEADER, id.to_string())
            .body(())
            .unwrap()
            .into_parts();
        assert_eq!(
            CurrentUser::from_request_parts(&mut parts, &()).await.unwrap(),
            CurrentUser(id)
        );

        let (mut parts, _) = Request::builder()
            .header(USER_ID_HEADER, "not-a-uuid")
            .body(())
            .unwrap()
            .into_parts();
        assert!(CurrentUser::from_request_parts(&mut parts, &()).await.is_err());

        let (mut parts, _) = Request::builder().body(()).unwrap().into_parts();
        assert!(CurrentUser::from_request_parts(&mut parts, &()).await.is_err());
    }
}
