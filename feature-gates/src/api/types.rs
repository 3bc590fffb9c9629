use std::collections::HashMap;

use axum::http::{header::CONTENT_TYPE, HeaderMap};
use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::instrument;

use crate::api::errors::FlagError;

/// Response of `GET /flags/:key/check`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct CheckResponse {
    pub enabled: bool,
}

/// Response of `GET /flags/my-flags`: every flag key mapped to its state for the caller.
pub type MyFlagsResponse = HashMap<String, bool>;

/// Response of `GET /canary/version`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionResponse {
    pub version: String,
    pub canary_routed: bool,
}

/// Decodes a JSON request body into `T`.
///
/// Only `application/json` bodies are accepted (a charset parameter is fine);
/// anything else is rejected before the payload is looked at.
#[instrument(skip_all)]
pub fn parse_json_body<T: DeserializeOwned>(
    headers: &HeaderMap,
    body: Bytes,
) -> Result<T, FlagError> {
    let content_type = headers
        .get(CONTENT_TYPE)
        .map_or("", |v| v.to_str().unwrap_or(""));
    let mime = content_type.split(';').next().unwrap_or("").trim();
    if !mime.eq_ignore_ascii_case("application/json") {
        return Err(FlagError::RequestDecodingError(format!(
            "unsupported content type: {}",
            content_type
        )));
    }

    tracing::debug!(len = body.len(), "decoding request body");
    let payload = std::str::from_utf8(&body).map_err(|e| {
        tracing::error!("failed to decode body: {}", e);
        FlagError::RequestDecodingError(String::from("invalid body encoding"))
    })?;

    Ok(serde_json::from_str::<T>(payload)?)
}
