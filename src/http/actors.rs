//! Actor documents, their collections, objects and activities

use crate::{
    delivery::serialize_with_context,
    error::Error,
    http::{activity_json, bearer_token, collection_page, collection_wrapper, AppState,
        PageQuery},
    protocol::context::WithContext,
    storage::ActorRecord,
};
use axum::{
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
};
use http::{HeaderMap, StatusCode};
use serde_json::Value;
use url::Url;

async fn load_actor(state: &AppState, username: &str) -> Result<ActorRecord, Error> {
    state
        .stores
        .actors
        .get_by_username(username)
        .await?
        .ok_or(Error::NotFound)
}

/// `GET /users/{username}`: the actor document. The private key is included
/// only for the holder of the admin bearer token.
pub async fn get_actor(
    Path(username): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, Error> {
    let actor = load_actor(&state, &username).await?;
    let include_private_key = state.config.admin_token_matches(bearer_token(&headers));
    let document = actor.to_document(include_private_key);
    Ok(activity_json(&WithContext::new_with_security(document)))
}

fn urls_page(uris: Vec<Url>, limit: u64, offset: u64) -> Vec<Value> {
    uris.into_iter()
        .skip(offset as usize)
        .take(limit as usize)
        .map(|uri| Value::String(uri.into()))
        .collect()
}

/// `GET /users/{username}/followers?page&limit`
pub async fn followers(
    Path(username): Path<String>,
    Query(query): Query<PageQuery>,
    State(state): State<AppState>,
) -> Result<Response, Error> {
    let actor = load_actor(&state, &username).await?;
    let uri = actor.followers.clone().ok_or(Error::NotFound)?;
    let all = state.stores.follows.followers(&username).await?;
    paged_uris(uri, all, query, &state)
}

/// `GET /users/{username}/following?page&limit`
pub async fn following(
    Path(username): Path<String>,
    Query(query): Query<PageQuery>,
    State(state): State<AppState>,
) -> Result<Response, Error> {
    let actor = load_actor(&state, &username).await?;
    let uri = actor.following.clone().ok_or(Error::NotFound)?;
    let all = state.stores.follows.following(&username).await?;
    paged_uris(uri, all, query, &state)
}

fn paged_uris(
    uri: Url,
    all: Vec<Url>,
    query: PageQuery,
    state: &AppState,
) -> Result<Response, Error> {
    let total = all.len() as u64;
    let limit = query.limit_or(state.config.page_size);
    match query.page {
        None | Some(0) => Ok(collection_wrapper(uri, total)),
        Some(page) => {
            let offset = (page - 1) * limit;
            let items = urls_page(all, limit, offset);
            Ok(collection_page(uri, page, items, offset + limit < total))
        }
    }
}

/// `GET /users/{username}/liked?page&limit`
pub async fn liked(
    Path(username): Path<String>,
    Query(query): Query<PageQuery>,
    State(state): State<AppState>,
) -> Result<Response, Error> {
    let actor = load_actor(&state, &username).await?;
    let uri = actor.liked.clone().ok_or(Error::NotFound)?;
    let total = state.stores.activities.actor_liked_count(&actor.uri).await?;
    let limit = query.limit_or(state.config.page_size);
    match query.page {
        None | Some(0) => Ok(collection_wrapper(uri, total)),
        Some(page) => {
            let offset = (page - 1) * limit;
            let uris = state
                .stores
                .activities
                .actor_liked(&actor.uri, limit, offset)
                .await?;
            let items = uris.into_iter().map(|u| Value::String(u.into())).collect();
            Ok(collection_page(uri, page, items, offset + limit < total))
        }
    }
}

/// `GET /users/{username}/shared?page&limit`
pub async fn shared(
    Path(username): Path<String>,
    Query(query): Query<PageQuery>,
    State(state): State<AppState>,
) -> Result<Response, Error> {
    let actor = load_actor(&state, &username).await?;
    let uri = actor.shared.clone().ok_or(Error::NotFound)?;
    let total = state
        .stores
        .activities
        .actor_shared_count(&actor.uri)
        .await?;
    let limit = query.limit_or(state.config.page_size);
    match query.page {
        None | Some(0) => Ok(collection_wrapper(uri, total)),
        Some(page) => {
            let offset = (page - 1) * limit;
            let uris = state
                .stores
                .activities
                .actor_shared(&actor.uri, limit, offset)
                .await?;
            let items = uris.into_iter().map(|u| Value::String(u.into())).collect();
            Ok(collection_page(uri, page, items, offset + limit < total))
        }
    }
}

fn object_uri(state: &AppState, username: &str, id: &str) -> Result<Url, Error> {
    Ok(state
        .config
        .base_url()
        .join(&format!("users/{}/objects/{}", username, id))?)
}

/// `GET /users/{username}/objects/{id}`: object dereferencing. Deleted
/// objects answer 410 with their tombstone.
pub async fn get_object(
    Path((username, id)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Result<Response, Error> {
    let uri = object_uri(&state, &username, &id)?;
    let object = state
        .stores
        .activities
        .object(&uri)
        .await?
        .ok_or(Error::NotFound)?;
    let gone = object.kind == crate::protocol::object::ObjectKind::Tombstone;
    let response = activity_json(&WithContext::new_default(object));
    if gone {
        Ok((StatusCode::GONE, response).into_response())
    } else {
        Ok(response)
    }
}

/// `GET /users/{username}/objects/{id}/replies`
pub async fn object_replies(
    Path((username, id)): Path<(String, String)>,
    Query(query): Query<PageQuery>,
    State(state): State<AppState>,
) -> Result<Response, Error> {
    let uri = object_uri(&state, &username, &id)?;
    let total = state.stores.activities.replies_count(&uri).await?;
    let collection = Url::parse(&format!("{}/replies", uri))?;
    let limit = query.limit_or(state.config.page_size);
    match query.page {
        None | Some(0) => Ok(collection_wrapper(collection, total)),
        Some(page) => {
            let offset = (page - 1) * limit;
            let uris = state.stores.activities.replies(&uri, limit, offset).await?;
            let items = uris.into_iter().map(|u| Value::String(u.into())).collect();
            Ok(collection_page(collection, page, items, offset + limit < total))
        }
    }
}

/// `GET /users/{username}/objects/{id}/likes`
pub async fn object_likes(
    Path((username, id)): Path<(String, String)>,
    Query(query): Query<PageQuery>,
    State(state): State<AppState>,
) -> Result<Response, Error> {
    let uri = object_uri(&state, &username, &id)?;
    let total = state.stores.activities.likes_count(&uri).await?;
    let collection = Url::parse(&format!("{}/likes", uri))?;
    let limit = query.limit_or(state.config.page_size);
    match query.page {
        None | Some(0) => Ok(collection_wrapper(collection, total)),
        Some(page) => {
            let offset = (page - 1) * limit;
            let uris = state.stores.activities.likes(&uri, limit, offset).await?;
            let items = uris.into_iter().map(|u| Value::String(u.into())).collect();
            Ok(collection_page(collection, page, items, offset + limit < total))
        }
    }
}

/// `GET /users/{username}/objects/{id}/shares`
pub async fn object_shares(
    Path((username, id)): Path<(String, String)>,
    Query(query): Query<PageQuery>,
    State(state): State<AppState>,
) -> Result<Response, Error> {
    let uri = object_uri(&state, &username, &id)?;
    let total = state.stores.activities.shares_count(&uri).await?;
    let collection = Url::parse(&format!("{}/shares", uri))?;
    let limit = query.limit_or(state.config.page_size);
    match query.page {
        None | Some(0) => Ok(collection_wrapper(collection, total)),
        Some(page) => {
            let offset = (page - 1) * limit;
            let uris = state.stores.activities.shares(&uri, limit, offset).await?;
            let items = uris.into_iter().map(|u| Value::String(u.into())).collect();
            Ok(collection_page(collection, page, items, offset + limit < total))
        }
    }
}

/// `GET /activities/{id}`: activity dereferencing
pub async fn get_activity(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Response, Error> {
    let uri = state.config.base_url().join(&format!("activities/{}", id))?;
    let activity = state
        .stores
        .activities
        .activity(&uri)
        .await?
        .ok_or(Error::NotFound)?;
    let body: Value = serde_json::from_str(&serialize_with_context(&activity)?)?;
    Ok(activity_json(&body))
}
