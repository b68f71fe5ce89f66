//! Blob upload, download and deletion

use crate::{
    error::Error,
    http::AppState,
};
use axum::{
    body::Bytes,
    extract::{Path, State},
    response::{IntoResponse, Response},
    Json,
};
use http::{header, HeaderMap, StatusCode};
use serde_json::json;
use uuid::Uuid;

/// `POST /users/{username}/media`: store a blob, answering 201 with its
/// canonical URL
pub async fn upload(
    Path(username): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Error> {
    state
        .stores
        .actors
        .get_by_username(&username)
        .await?
        .ok_or(Error::NotFound)?;
    if body.is_empty() {
        return Err(Error::other(anyhow::anyhow!("empty upload body")));
    }

    let media_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let id = Uuid::new_v4().to_string();
    state
        .stores
        .blobs
        .store(&username, &id, &media_type, body.to_vec())
        .await?;

    let url = state.stores.blobs.url(&username, &id)?;
    let mut response = (
        StatusCode::CREATED,
        Json(json!({ "id": id, "url": url.as_str(), "mediaType": media_type })),
    )
        .into_response();
    if let Ok(location) = http::HeaderValue::from_str(url.as_str()) {
        response.headers_mut().insert(header::LOCATION, location);
    }
    Ok(response)
}

/// `GET /users/{username}/media/{id}`: download a blob
pub async fn download(
    Path((username, id)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Result<Response, Error> {
    let blob = state
        .stores
        .blobs
        .get(&username, &id)
        .await?
        .ok_or(Error::NotFound)?;
    Ok(([(header::CONTENT_TYPE, blob.media_type)], blob.data).into_response())
}

/// `DELETE /users/{username}/media/{id}`
pub async fn remove(
    Path((username, id)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Result<Response, Error> {
    if state.stores.blobs.delete(&username, &id).await? {
        Ok(StatusCode::NO_CONTENT.into_response())
    } else {
        Err(Error::NotFound)
    }
}
