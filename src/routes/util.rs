//! Request parsing and response building shared by the API routes

use bson::oid::ObjectId;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::error;

use crate::store::UserId;
use crate::types::{BarracksError, Result};

pub type FullBody = Full<Bytes>;

/// Header naming the member performing a request
pub const ACTOR_HEADER: &str = "x-user-id";

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<FullBody> {
    let json = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(Full::new(Bytes::from(json)))
        .unwrap()
}

pub fn error_response(status: StatusCode, error: &str, code: Option<&str>) -> Response<FullBody> {
    json_response(
        status,
        &ErrorResponse {
            error: error.to_string(),
            code: code.map(|c| c.to_string()),
        },
    )
}

fn error_code(err: &BarracksError) -> &'static str {
    match err {
        BarracksError::Validation(_) | BarracksError::Json(_) => "VALIDATION_ERROR",
        BarracksError::NotFound(_) => "NOT_FOUND",
        BarracksError::Conflict(_) => "CONFLICT",
        _ => "INTERNAL_ERROR",
    }
}

/// Map a service error onto its HTTP response
///
/// Server-side failures are logged and reported without their details.
pub fn from_error(err: &BarracksError) -> Response<FullBody> {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        error!("Request failed: {}", err);
        return error_response(status, "Internal server error", Some(error_code(err)));
    }
    error_response(status, &err.to_string(), Some(error_code(err)))
}

/// Turn a handler result into a response
pub fn respond(result: Result<Response<FullBody>>) -> Response<FullBody> {
    result.unwrap_or_else(|e| from_error(&e))
}

pub fn ok<T: Serialize>(body: &T) -> Result<Response<FullBody>> {
    Ok(json_response(StatusCode::OK, body))
}

pub fn created<T: Serialize>(body: &T) -> Result<Response<FullBody>> {
    Ok(json_response(StatusCode::CREATED, body))
}

/// Read and deserialize a JSON request body
pub async fn read_json<T: DeserializeOwned>(req: Request<Incoming>) -> Result<T> {
    let body = req
        .into_body()
        .collect()
        .await
        .map_err(|e| BarracksError::Validation(format!("Invalid body: {}", e)))?
        .to_bytes();
    serde_json::from_slice(&body)
        .map_err(|e| BarracksError::Validation(format!("Invalid JSON: {}", e)))
}

/// Deserialize the query string (missing query means all defaults)
pub fn read_query<T: DeserializeOwned + Default>(req: &Request<Incoming>) -> Result<T> {
    match req.uri().query() {
        Some(query) => serde_urlencoded::from_str(query)
            .map_err(|e| BarracksError::Validation(format!("Invalid query: {}", e))),
        None => Ok(T::default()),
    }
}

pub fn parse_id(raw: &str, what: &str) -> Result<ObjectId> {
    ObjectId::parse_str(raw.trim())
        .map_err(|_| BarracksError::Validation(format!("Invalid {} id '{}'", what, raw)))
}

/// The member performing the request, from the `X-User-Id` header
pub fn actor<B>(req: &Request<B>) -> Result<UserId> {
    let raw = req
        .headers()
        .get(ACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| BarracksError::Validation("Missing X-User-Id header".into()))?;
    parse_id(raw, "user")
}
