//! Inbox and outbox endpoints
//!
//! POSTs run the full verification pipeline before anything mutates state.
//! A signer which does not match the activity's `actor` is dropped silently
//! with a 2xx response, so the endpoint leaks nothing about local state.

use crate::{
    admin::admin_authorized,
    error::Error,
    http::{
        activity_json, collection_page, collection_wrapper,
        extract::{verify_activity, ActivityData},
        AppState, PageQuery,
    },
    protocol::activity::Activity,
};
use axum::{
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
};
use http::StatusCode;
use tracing::debug;

/// `POST /users/{username}/inbox`
pub async fn post_inbox(
    Path(username): Path<String>,
    State(state): State<AppState>,
    data: ActivityData,
) -> Result<Response, Error> {
    let (activity, signer) = verify_activity(&state, &data).await?;
    let bearer = data
        .headers
        .get("authorization")
        .and_then(|value| value.strip_prefix("Bearer "));

    if username == state.config.system_actor_name {
        let authorized = admin_authorized(&state.config, Some(&signer), bearer)
            && (signer == activity.actor || state.config.admin_token_matches(bearer));
        state.admin.handle(&activity, authorized).await?;
        return Ok(StatusCode::ACCEPTED.into_response());
    }

    if signer != activity.actor {
        debug!(
            "dropping activity by {} signed by {}",
            activity.actor, signer
        );
        return Ok(StatusCode::ACCEPTED.into_response());
    }

    state.inbox.receive(&username, activity).await?;
    Ok(StatusCode::ACCEPTED.into_response())
}

/// `POST /inbox`: the shared inbox
pub async fn post_shared_inbox(
    State(state): State<AppState>,
    data: ActivityData,
) -> Result<Response, Error> {
    let (activity, signer) = verify_activity(&state, &data).await?;
    if signer != activity.actor {
        debug!(
            "dropping shared inbox activity by {} signed by {}",
            activity.actor, signer
        );
        return Ok(StatusCode::ACCEPTED.into_response());
    }

    // per-recipient outcomes are logged by the router; the response is 202
    // as soon as the activity itself was valid
    state.shared_inbox.route(activity).await?;
    Ok(StatusCode::ACCEPTED.into_response())
}

/// `GET /users/{username}/inbox?page&limit`
pub async fn read_inbox(
    Path(username): Path<String>,
    Query(query): Query<PageQuery>,
    State(state): State<AppState>,
) -> Result<Response, Error> {
    let actor = state
        .stores
        .actors
        .get_by_username(&username)
        .await?
        .ok_or(Error::NotFound)?;
    let total = state.stores.activities.inbox_count(&username).await?;
    let limit = query.limit_or(state.config.page_size);

    match query.page {
        None | Some(0) => Ok(collection_wrapper(actor.inbox.clone(), total)),
        Some(page) => {
            let offset = (page - 1) * limit;
            let activities = state
                .stores
                .activities
                .inbox(&username, limit, offset)
                .await?;
            let items = activities
                .iter()
                .map(serde_json::to_value)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(collection_page(
                actor.inbox.clone(),
                page,
                items,
                offset + limit < total,
            ))
        }
    }
}

/// `GET /users/{username}/outbox?page&limit`
pub async fn read_outbox(
    Path(username): Path<String>,
    Query(query): Query<PageQuery>,
    State(state): State<AppState>,
) -> Result<Response, Error> {
    let actor = state
        .stores
        .actors
        .get_by_username(&username)
        .await?
        .ok_or(Error::NotFound)?;
    let outbox_uri = actor.outbox.clone().ok_or(Error::NotFound)?;
    let total = state.stores.activities.outbox_count(&username).await?;
    let limit = query.limit_or(state.config.page_size);

    match query.page {
        None | Some(0) => Ok(collection_wrapper(outbox_uri, total)),
        Some(page) => {
            let offset = (page - 1) * limit;
            let activities = state
                .stores
                .activities
                .outbox(&username, limit, offset)
                .await?;
            let items = activities
                .iter()
                .map(serde_json::to_value)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(collection_page(outbox_uri, page, items, offset + limit < total))
        }
    }
}

/// `POST /users/{username}/outbox`: submission by the authenticated owner.
///
/// Authentication is an HTTP signature by the owner's key, or the admin
/// bearer token.
pub async fn post_outbox(
    Path(username): Path<String>,
    State(state): State<AppState>,
    data: ActivityData,
) -> Result<Response, Error> {
    let bearer = data
        .headers
        .get("authorization")
        .and_then(|value| value.strip_prefix("Bearer "));

    let activity = if state.config.admin_token_matches(bearer) {
        serde_json::from_slice::<Activity>(&data.body)?
    } else {
        let owner = state
            .stores
            .actors
            .get_by_username(&username)
            .await?
            .ok_or(Error::NotFound)?;
        let (activity, signer) = verify_activity(&state, &data).await?;
        if signer != owner.uri {
            return Err(Error::SignatureInvalid);
        }
        activity
    };

    let submitted = state.outbox.submit(&username, activity).await?;
    let mut response =
        (StatusCode::CREATED, activity_json(&submitted)).into_response();
    if let Some(id) = &submitted.id {
        if let Ok(location) = http::HeaderValue::from_str(id.as_str()) {
            response.headers_mut().insert(http::header::LOCATION, location);
        }
    }
    Ok(response)
}
