//! Raw-request extraction and inbox verification
//!
//! [ActivityData] captures everything signature verification needs from a
//! request: method, path, headers and the unmodified body bytes.
//! [verify_activity] then performs the full inbound pipeline: body digest,
//! signature reconstruction against the resolved key, and the optional
//! linked-data signature embedded in the document.

use crate::{
    error::Error,
    http::AppState,
    protocol::activity::Activity,
    signatures::{embedded_signature, parse_signature_header, verify_object_signature,
        verify_parsed_request},
};
use axum::{
    async_trait,
    extract::{FromRequest, Request},
    response::{IntoResponse, Response},
};
use http::{Method, StatusCode};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;
use url::Url;

/// Inbox bodies above this size are rejected outright
const BODY_LIMIT: usize = 1024 * 1024;

/// Contains all data that is necessary to verify and receive an activity
/// from an HTTP request
#[derive(Debug)]
pub struct ActivityData {
    /// Request headers, keyed by lowercased name
    pub headers: BTreeMap<String, String>,
    /// Request method
    pub method: Method,
    /// Path plus query, as covered by `(request-target)`
    pub path_and_query: String,
    /// The unmodified request body
    pub body: Vec<u8>,
}

#[async_trait]
impl<S> FromRequest<S> for ActivityData
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(req: Request, _state: &S) -> Result<Self, Self::Rejection> {
        let (parts, body) = req.into_parts();
        let bytes = axum::body::to_bytes(body, BODY_LIMIT)
            .await
            .map_err(|err| (StatusCode::BAD_REQUEST, err.to_string()).into_response())?;

        let mut headers = BTreeMap::new();
        for (name, value) in &parts.headers {
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str().to_lowercase(), value.to_string());
            }
        }

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| parts.uri.path().to_string());

        Ok(ActivityData {
            headers,
            method: parts.method,
            path_and_query,
            body: bytes.to_vec(),
        })
    }
}

/// Run the inbound verification pipeline and parse the activity.
///
/// Returns the activity and the signing actor's URI. The caller decides how
/// to treat a signer which differs from the activity's `actor` field.
pub async fn verify_activity(
    state: &AppState,
    data: &ActivityData,
) -> Result<(Activity, Url), Error> {
    let raw: Value = serde_json::from_slice(&data.body)?;
    let activity: Activity = serde_json::from_value(raw.clone())?;

    let header = parse_signature_header(
        data.headers
            .get("signature")
            .ok_or(Error::SignatureHeaderInvalid)?,
    )?;
    let public_key_pem = state.keys.resolve(&header.key_id).await.map_err(|error| {
        debug!("cannot resolve signing key {}: {}", header.key_id, error);
        Error::SignatureInvalid
    })?;

    verify_parsed_request(
        &header,
        &data.headers,
        &data.method,
        &data.path_and_query,
        &public_key_pem,
        Some(&data.body),
        state.config.trust_forwarded_host,
    )?;

    // an embedded linked-data signature, when present, must verify against
    // its creator's key as well
    if raw.get("signature").is_some() {
        let ld = embedded_signature(&raw).ok_or(Error::SignatureHeaderInvalid)?;
        let creator_pem = state.keys.resolve(&ld.creator).await.map_err(|error| {
            debug!("cannot resolve object signature key {}: {}", ld.creator, error);
            Error::SignatureInvalid
        })?;
        verify_object_signature(&raw, &creator_pem)?;
    }

    let signer = header.actor_uri()?;
    Ok((activity, signer))
}
