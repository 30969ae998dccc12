//! Various models for API responses
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use ofcir_model::{ResourceState, ResourceType};

/// Body returned by a successful acquire
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct AcquiredCir {
    pub name: String,
    pub pool: String,
    pub provider: String,
    #[serde(rename = "providerInfo")]
    pub provider_info: String,
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
}

/// Body returned by the status endpoint
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct CirStatus {
    pub name: String,
    pub pool: String,
    pub provider: String,
    #[serde(rename = "providerInfo")]
    pub provider_info: String,
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    pub ip: String,
    pub extra: String,
    pub status: ResourceState,
}

/// Domain rejection body: 400/500 `{msg}`
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct ErrorMsg {
    pub msg: String,
}

/// An internal fault escaping a handler, rendered as 500 `{msg}`.
///
/// Store and serialization failures bubble into this through `?`. Nothing
/// past the arbiter's conditional update is rolled back here; the
/// reconcilers own any partially-transitioned resource.
#[derive(Debug)]
pub struct ServerError(anyhow::Error);

pub type ServerResult<T> = Result<T, ServerError>;

impl IntoResponse for ServerError {
    fn into_response(self) -> axum::response::Response {
        let body = ErrorMsg {
            msg: self.0.to_string(),
        };
        (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
    }
}

impl<E: Into<anyhow::Error>> From<E> for ServerError {
    fn from(err: E) -> Self {
        ServerError(err.into())
    }
}
