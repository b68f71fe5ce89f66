//! WebFinger, host-meta and NodeInfo discovery

use crate::{
    error::Error,
    http::AppState,
    webfinger::{build_webfinger_response, extract_webfinger_name, WEBFINGER_CONTENT_TYPE},
};
use axum::{
    extract::{Query, State},
    response::{IntoResponse, Response},
    Json,
};
use http::header;
use serde::Deserialize;
use serde_json::json;

/// `?resource=acct:user@host`
#[derive(Deserialize)]
pub struct WebfingerQuery {
    resource: String,
}

/// `GET /.well-known/webfinger`
pub async fn webfinger(
    Query(query): Query<WebfingerQuery>,
    State(state): State<AppState>,
) -> Result<Response, Error> {
    let name = extract_webfinger_name(&query.resource, &state.config)?;
    let actor = state
        .stores
        .actors
        .get_by_username(name)
        .await?
        .ok_or(Error::NotFound)?;

    let response = build_webfinger_response(query.resource.clone(), actor.uri.clone());
    Ok((
        [(header::CONTENT_TYPE, WEBFINGER_CONTENT_TYPE)],
        Json(response),
    )
        .into_response())
}

/// `GET /.well-known/host-meta`: XRD pointing at the webfinger template
pub async fn host_meta(State(state): State<AppState>) -> Response {
    let template = format!(
        "{}.well-known/webfinger?resource={{uri}}",
        state.config.base_url()
    );
    let xrd = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <XRD xmlns=\"http://docs.oasis-open.org/ns/xri/xrd-1.0\">\n\
           <Link rel=\"lrdd\" template=\"{template}\"/>\n\
         </XRD>\n"
    );
    ([(header::CONTENT_TYPE, "application/xrd+xml")], xrd).into_response()
}

/// `GET /.well-known/host-meta.json`
pub async fn host_meta_json(State(state): State<AppState>) -> Response {
    let template = format!(
        "{}.well-known/webfinger?resource={{uri}}",
        state.config.base_url()
    );
    Json(json!({
        "links": [{ "rel": "lrdd", "template": template }]
    }))
    .into_response()
}

/// `GET /.well-known/nodeinfo`: discovery document
pub async fn nodeinfo_discovery(State(state): State<AppState>) -> Response {
    let base = state.config.base_url();
    Json(json!({
        "links": [
            {
                "rel": "http://nodeinfo.diaspora.software/ns/schema/2.0",
                "href": format!("{base}nodeinfo/2.0"),
            },
            {
                "rel": "http://nodeinfo.diaspora.software/ns/schema/2.1",
                "href": format!("{base}nodeinfo/2.1"),
            }
        ]
    }))
    .into_response()
}

/// `GET /nodeinfo/2.0`
pub async fn nodeinfo_2_0(State(state): State<AppState>) -> Result<Response, Error> {
    nodeinfo(state, "2.0").await
}

/// `GET /nodeinfo/2.1`
pub async fn nodeinfo_2_1(State(state): State<AppState>) -> Result<Response, Error> {
    nodeinfo(state, "2.1").await
}

async fn nodeinfo(state: AppState, version: &str) -> Result<Response, Error> {
    let users = state.stores.actors.count_local().await?;
    Ok(Json(json!({
        "version": version,
        "software": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
        "protocols": ["activitypub"],
        "services": { "inbound": [], "outbound": [] },
        "openRegistrations": false,
        "usage": { "users": { "total": users } },
        "metadata": {},
    }))
    .into_response())
}
