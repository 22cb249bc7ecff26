//! JSON response envelope and error mapping.
//!
//! Every HTTP response body is `{"code", "message", "data"?}`. `code` is 0
//! on success and the HTTP status otherwise.

use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::ServiceError;

pub const DEFAULT_PAGE_SIZE: i64 = 20;
pub const MAX_PAGE_SIZE: i64 = 100;

#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

pub type ApiResult<T> = Result<Json<Envelope<T>>, ServiceError>;

pub fn ok<T: Serialize>(data: T) -> ApiResult<T> {
    Ok(Json(Envelope {
        code: 0,
        message: "success".to_string(),
        data: Some(data),
    }))
}

/// Success without a body, e.g. after a delete.
pub fn done(message: &str) -> ApiResult<()> {
    Ok(Json(Envelope {
        code: 0,
        message: message.to_string(),
        data: None,
    }))
}

pub const fn status_of(err: &ServiceError) -> StatusCode {
    match err {
        ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
        ServiceError::Entitlement(_) | ServiceError::Expired(_) => StatusCode::FORBIDDEN,
        ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
        ServiceError::Conflict(_) => StatusCode::CONFLICT,
        ServiceError::Crypto { .. } | ServiceError::Storage(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = status_of(&self);
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }
        let body = Envelope::<()> {
            code: status.as_u16(),
            message: self.public_message(),
            data: None,
        };
        (status, Json(body)).into_response()
    }
}

/// Turn a body that failed to parse into a validation error.
pub fn bad_json(rejection: JsonRejection) -> ServiceError {
    ServiceError::Validation(rejection.body_text())
}

pub fn bad_query(rejection: QueryRejection) -> ServiceError {
    ServiceError::Validation(rejection.body_text())
}

/// `?page=&page_size=` query parameters. Pages start at 1.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct PageQuery {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

impl PageQuery {
    pub fn page(self) -> i64 {
        self.page.unwrap_or(1).max(1)
    }

    pub fn page_size(self) -> i64 {
        self.page_size
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE)
    }

    pub fn offset(self) -> i64 {
        (self.page() - 1).saturating_mul(self.page_size())
    }
}

#[derive(Debug, Serialize)]
pub struct Page<T> {
    pub list: Vec<T>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
}

impl<T> Page<T> {
    pub fn new(list: Vec<T>, total: i64, query: PageQuery) -> Self {
        Self {
            list,
            total,
            page: query.page(),
            page_size: query.page_size(),
        }
    }
}
