//! HTTP endpoint surface (axum)
//!
//! [build_router] wires every endpoint of the federation contract onto an
//! [AppState]. Handlers stay thin: verification and dispatch live in the
//! component modules, pagination and response shaping here.

use crate::{
    admin::AdminHandler,
    config::FederationConfig,
    error::Error,
    inbox::InboxHandler,
    keys::KeyResolver,
    outbox::OutboxHandler,
    protocol::{
        collections::{OrderedCollection, OrderedCollectionPage},
        context::WithContext,
    },
    shared_inbox::SharedInboxRouter,
    storage::Stores,
    FEDERATION_CONTENT_TYPE,
};
use axum::{
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use http::{header, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use url::Url;

/// Actor documents, collections, objects and activities
pub mod actors;
/// Inbox POST verification and the raw-request extractor
pub mod extract;
/// Per-actor and shared inbox, outbox
pub mod inboxes;
/// Blob upload, download and deletion
pub mod media;
/// Custom collection catalog, pages and definitions
pub mod user_collections;
/// WebFinger, host-meta and NodeInfo discovery
pub mod well_known;

/// Everything the HTTP handlers need, cloned per request by axum
#[derive(Clone)]
pub struct AppState {
    /// Instance configuration
    pub config: FederationConfig,
    /// Repositories
    pub stores: Stores,
    /// Receives verified activities for one actor
    pub inbox: InboxHandler,
    /// Accepts locally submitted activities
    pub outbox: OutboxHandler,
    /// Fans shared-inbox activities out to local recipients
    pub shared_inbox: SharedInboxRouter,
    /// Applies admin verbs on the system actor's inbox
    pub admin: AdminHandler,
    /// Resolves signing keys
    pub keys: Arc<KeyResolver>,
}

impl AppState {
    /// Wire all components over one configuration and repository bundle
    pub fn new(config: FederationConfig, stores: Stores) -> Self {
        let inbox = InboxHandler::new(config.clone(), stores.clone());
        let outbox = OutboxHandler::new(config.clone(), stores.clone());
        let shared_inbox = SharedInboxRouter::new(config.clone(), stores.clone(), inbox.clone());
        let admin = AdminHandler::new(config.clone(), stores.clone());
        let keys = Arc::new(KeyResolver::new(config.clone(), stores.actors.clone()));
        AppState {
            config,
            stores,
            inbox,
            outbox,
            shared_inbox,
            admin,
            keys,
        }
    }
}

/// The full route table of the federation contract
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/.well-known/webfinger", get(well_known::webfinger))
        .route("/.well-known/host-meta", get(well_known::host_meta))
        .route(
            "/.well-known/host-meta.json",
            get(well_known::host_meta_json),
        )
        .route("/.well-known/nodeinfo", get(well_known::nodeinfo_discovery))
        .route("/nodeinfo/2.0", get(well_known::nodeinfo_2_0))
        .route("/nodeinfo/2.1", get(well_known::nodeinfo_2_1))
        .route("/inbox", post(inboxes::post_shared_inbox))
        .route("/users/:username", get(actors::get_actor))
        .route(
            "/users/:username/inbox",
            get(inboxes::read_inbox).post(inboxes::post_inbox),
        )
        .route(
            "/users/:username/outbox",
            get(inboxes::read_outbox).post(inboxes::post_outbox),
        )
        .route("/users/:username/followers", get(actors::followers))
        .route("/users/:username/following", get(actors::following))
        .route("/users/:username/liked", get(actors::liked))
        .route("/users/:username/shared", get(actors::shared))
        .route("/users/:username/objects/:id", get(actors::get_object))
        .route(
            "/users/:username/objects/:id/replies",
            get(actors::object_replies),
        )
        .route(
            "/users/:username/objects/:id/likes",
            get(actors::object_likes),
        )
        .route(
            "/users/:username/objects/:id/shares",
            get(actors::object_shares),
        )
        .route("/activities/:id", get(actors::get_activity))
        .route(
            "/users/:username/collections",
            get(user_collections::catalog),
        )
        .route(
            "/users/:username/collections/:slug",
            get(user_collections::read),
        )
        .route(
            "/users/:username/collections/:slug/definition",
            get(user_collections::definition),
        )
        .route(
            "/users/:username/collections/:slug/items",
            get(user_collections::items),
        )
        .route("/users/:username/media", post(media::upload))
        .route(
            "/users/:username/media/:id",
            get(media::download).delete(media::remove),
        )
        .with_state(state)
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::NotFound | Error::WebfingerResolveFailed => StatusCode::NOT_FOUND,
            Error::Json(_)
            | Error::UrlVerification(_)
            | Error::InvalidSlug(_)
            | Error::CollectionDefinitionInvalid(_)
            | Error::QueryCollectionReadOnly => StatusCode::BAD_REQUEST,
            Error::BodyDigestInvalid
            | Error::SignatureInvalid
            | Error::SignatureHeaderInvalid
            | Error::UnsupportedAlgorithm(_)
            | Error::MissingSignedHeader(_)
            | Error::MissingPublicKey(_)
            | Error::KeyInvalid
            | Error::ActorMismatch => StatusCode::UNAUTHORIZED,
            Error::CollectionPrivate => StatusCode::FORBIDDEN,
            Error::RemoteStatus { .. } => StatusCode::BAD_GATEWAY,
            Error::Cancelled | Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// `?page&limit` of paginated collection reads
#[derive(Clone, Copy, Debug, Default, Deserialize)]
pub struct PageQuery {
    /// 1-based page number; absent or 0 returns the collection wrapper
    pub page: Option<u64>,
    /// Items per page, defaulting to the configured page size
    pub limit: Option<u64>,
}

impl PageQuery {
    pub(crate) fn limit_or(&self, default: u64) -> u64 {
        match self.limit {
            Some(limit) if limit > 0 => limit,
            _ => default,
        }
    }
}

/// Serialize an ActivityPub document and answer it under the federation
/// content type. Serialization failures surface through the usual error
/// mapping rather than panicking mid-response.
pub(crate) fn activity_json<T: Serialize>(document: &T) -> Response {
    match serde_json::to_vec(document) {
        Ok(body) => {
            ([(header::CONTENT_TYPE, FEDERATION_CONTENT_TYPE)], body).into_response()
        }
        Err(error) => Error::Json(error).into_response(),
    }
}

/// Page 0: the OrderedCollection wrapper with a `first` link
pub(crate) fn collection_wrapper(uri: Url, total: u64) -> Response {
    activity_json(&WithContext::new_default(OrderedCollection::new(uri, total)))
}

/// Page N: an OrderedCollectionPage with `partOf`, `next` and `prev`
pub(crate) fn collection_page(
    uri: Url,
    page: u64,
    items: Vec<Value>,
    has_more: bool,
) -> Response {
    activity_json(&WithContext::new_default(OrderedCollectionPage::new(
        uri, page, items, has_more,
    )))
}

/// Bearer token of an `Authorization` header, if any
pub(crate) fn bearer_token(headers: &http::HeaderMap) -> Option<&str> {
    headers
        .get(http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}
