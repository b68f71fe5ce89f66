//! Custom collection catalog, pages and definitions
//!
//! Visibility gates every read: Private needs the admin bearer token,
//! Unlisted is reachable by direct URL but absent from the catalog.

use crate::{
    custom_collections::{collection_uri, CollectionDefinition, CollectionReader,
        CollectionVisibility},
    error::Error,
    http::{activity_json, bearer_token, collection_page, collection_wrapper, AppState,
        PageQuery},
    storage::ActorRecord,
};
use axum::{
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
    Json,
};
use http::HeaderMap;
use serde_json::{json, Value};

async fn load(
    state: &AppState,
    username: &str,
    slug: &str,
) -> Result<(ActorRecord, CollectionDefinition), Error> {
    let actor = state
        .stores
        .actors
        .get_by_username(username)
        .await?
        .ok_or(Error::NotFound)?;
    let definition = state
        .stores
        .collections
        .definition(username, slug)
        .await?
        .ok_or(Error::NotFound)?;
    Ok((actor, definition))
}

fn check_visibility(
    definition: &CollectionDefinition,
    state: &AppState,
    headers: &HeaderMap,
) -> Result<(), Error> {
    if definition.visibility == CollectionVisibility::Private
        && !state.config.admin_token_matches(bearer_token(headers))
    {
        return Err(Error::CollectionPrivate);
    }
    Ok(())
}

/// `GET /users/{username}/collections`: the catalog. Only Public
/// definitions appear; the admin token reveals the rest.
pub async fn catalog(
    Path(username): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, Error> {
    state
        .stores
        .actors
        .get_by_username(&username)
        .await?
        .ok_or(Error::NotFound)?;
    let admin = state.config.admin_token_matches(bearer_token(&headers));
    let definitions = state.stores.collections.definitions(&username).await?;
    let visible: Vec<Value> = definitions
        .iter()
        .filter(|d| admin || d.visibility == CollectionVisibility::Public)
        .map(|d| {
            let uri = collection_uri(&state.config, &username, &d.slug)
                .map(|u| Value::String(u.into()))
                .unwrap_or(Value::Null);
            json!({
                "id": uri,
                "name": d.name,
                "kind": d.kind,
                "visibility": d.visibility,
            })
        })
        .collect();

    Ok(activity_json(&json!({
        "type": "OrderedCollection",
        "totalItems": visible.len(),
        "orderedItems": visible,
    })))
}

/// `GET /users/{username}/collections/{slug}?page&limit`: the paged
/// collection itself
pub async fn read(
    Path((username, slug)): Path<(String, String)>,
    Query(query): Query<PageQuery>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, Error> {
    let (actor, definition) = load(&state, &username, &slug).await?;
    check_visibility(&definition, &state, &headers)?;

    let reader = CollectionReader::new(&state.stores);
    let members = reader.items(&username, &definition, &actor.uri).await?;
    let total = members.len() as u64;
    let uri = collection_uri(&state.config, &username, &slug)?;
    let limit = query.limit_or(state.config.page_size);

    match query.page {
        None | Some(0) => Ok(collection_wrapper(uri, total)),
        Some(page) => {
            let offset = (page - 1) * limit;
            let items: Vec<Value> = members
                .into_iter()
                .skip(offset as usize)
                .take(limit as usize)
                .map(|u| Value::String(u.into()))
                .collect();
            Ok(collection_page(uri, page, items, offset + limit < total))
        }
    }
}

/// `GET /users/{username}/collections/{slug}/definition`
pub async fn definition(
    Path((username, slug)): Path<(String, String)>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, Error> {
    let (_, definition) = load(&state, &username, &slug).await?;
    check_visibility(&definition, &state, &headers)?;
    Ok(Json(definition).into_response())
}

/// `GET /users/{username}/collections/{slug}/items`: the full member list
pub async fn items(
    Path((username, slug)): Path<(String, String)>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, Error> {
    let (actor, definition) = load(&state, &username, &slug).await?;
    check_visibility(&definition, &state, &headers)?;
    let reader = CollectionReader::new(&state.stores);
    let members = reader.items(&username, &definition, &actor.uri).await?;
    Ok(Json(members).into_response())
}
