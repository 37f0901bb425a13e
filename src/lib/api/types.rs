use std::sync::Arc;

use axum::{
    Json,
    extract::FromRequestParts,
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::error;

use crate::lib::{model::types::ContainerInstance, service::types::{ContainerService, ServiceError}};

pub const USER_ID_HEADER: &str = "x-user-id";

pub struct ApiServer {
    pub service: Arc<ContainerService>,
    pub listen: String,
}

/// Caller identity, set by the authenticating proxy in front of us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserId(pub u64);

impl<S: Send + Sync> FromRequestParts<S> for UserId {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse().ok())
            .map(UserId)
            .ok_or(ApiError::Unauthorized)
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateQuery {
    pub template_id: u64,
}

#[derive(Debug, Serialize)]
pub struct ContainerView {
    pub container: ContainerInstance,
    #[serde(rename = "accessUrl")]
    pub access_url: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("missing or invalid user id")]
    Unauthorized,

    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Service(e) => match e {
                ServiceError::NotFound(_) | ServiceError::NoChannel(_) => StatusCode::NOT_FOUND,
                ServiceError::AlreadyPending(_) | ServiceError::ReaderAttached(_) => {
                    StatusCode::CONFLICT
                }
                ServiceError::Broker(_) => StatusCode::BAD_GATEWAY,
                ServiceError::AcquireTimeout => StatusCode::GATEWAY_TIMEOUT,
                ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        };
        if status.is_server_error() {
            error!("request failed: {}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
