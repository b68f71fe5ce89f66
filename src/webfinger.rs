//! Resolves identifiers of the form `name@example.com`

use crate::{config::FederationConfig, error::Error, FEDERATION_CONTENT_TYPE};
use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use url::Url;

/// Errors relative to webfinger handling
#[derive(thiserror::Error, Debug)]
pub enum WebFingerError {
    /// The webfinger identifier is invalid
    #[error("The webfinger identifier is invalid")]
    WrongFormat,
    /// The webfinger identifier doesn't match the expected instance domain name
    #[error("The webfinger identifier doesn't match the expected instance domain name")]
    WrongDomain,
    /// The webfinger object did not contain any link to an activitypub item
    #[error("The webfinger object did not contain any link to an activitypub item")]
    NoValidLink,
}

impl From<WebFingerError> for Error {
    fn from(_: WebFingerError) -> Self {
        Error::WebfingerResolveFailed
    }
}

/// The content-type for webfinger responses.
pub const WEBFINGER_CONTENT_TYPE: &str = "application/jrd+json";

/// The `/.well-known/webfinger` URL which resolves `identifier`, on the
/// identifier's own domain.
pub fn webfinger_query_url(identifier: &str, debug: bool) -> Result<Url, Error> {
    let (_, domain) = identifier
        .splitn(2, '@')
        .collect_tuple()
        .ok_or(WebFingerError::WrongFormat)?;
    let protocol = if debug { "http" } else { "https" };
    Ok(Url::parse(&format!(
        "{protocol}://{domain}/.well-known/webfinger?resource=acct:{identifier}"
    ))?)
}

/// The actor URI of a webfinger response: the `rel="self"` link with an
/// ActivityPub media type.
pub fn extract_actor_uri(webfinger: &Webfinger) -> Result<Url, Error> {
    let self_links = webfinger
        .links
        .iter()
        .filter(|link| link.rel.as_deref() == Some("self"));

    let exact = self_links
        .clone()
        .find(|link| link.kind.as_deref() == Some(FEDERATION_CONTENT_TYPE));
    let fallback = self_links
        .clone()
        .find(|link| matches!(&link.kind, Some(kind) if kind.starts_with("application/")));

    exact
        .or(fallback)
        .and_then(|link| link.href.clone())
        .ok_or_else(|| WebFingerError::NoValidLink.into())
}

/// Extracts username from a webfinger resource parameter.
///
/// Use this in the HTTP handler at `.well-known/webfinger` to handle incoming
/// webfinger requests. For a parameter of the form
/// `acct:gargron@mastodon.social` it returns `gargron`.
///
/// Returns an error if the query doesn't match the local domain.
pub fn extract_webfinger_name<'i>(
    query: &'i str,
    config: &FederationConfig,
) -> Result<&'i str, Error> {
    static WEBFINGER_REGEX: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^acct:([\p{L}0-9_\.\-]+)@(.*)$").expect("compile regex"));
    // Regex to extract usernames from webfinger query. Supports different alphabets using `\p{L}`.
    let captures = WEBFINGER_REGEX
        .captures(query)
        .ok_or(WebFingerError::WrongFormat)?;

    let account_name = captures.get(1).ok_or(WebFingerError::WrongFormat)?;

    if captures.get(2).map(|m| m.as_str()) != Some(config.domain()) {
        return Err(WebFingerError::WrongDomain.into());
    }
    Ok(account_name.as_str())
}

/// Builds a webfinger response for a local actor.
///
/// The given URL must serve the actor document with `activity+json`.
pub fn build_webfinger_response(subject: String, url: Url) -> Webfinger {
    Webfinger {
        subject,
        links: vec![
            WebfingerLink {
                rel: Some("http://webfinger.net/rel/profile-page".to_string()),
                kind: Some("text/html".to_string()),
                href: Some(url.clone()),
                ..Default::default()
            },
            WebfingerLink {
                rel: Some("self".to_string()),
                kind: Some(FEDERATION_CONTENT_TYPE.to_string()),
                href: Some(url),
                ..Default::default()
            },
        ],
        aliases: vec![],
        properties: Default::default(),
    }
}

/// A webfinger response with information about a `Person` or other type of actor.
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct Webfinger {
    /// The actor which is described here, for example `acct:LemmyDev@mastodon.social`
    pub subject: String,
    /// Links where further data about `subject` can be retrieved
    pub links: Vec<WebfingerLink>,
    /// Other Urls which identify the same actor as the `subject`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<Url>,
    /// Additional data about the subject
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub properties: HashMap<Url, String>,
}

/// A single link included as part of a [Webfinger] response.
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct WebfingerLink {
    /// Relationship of the link, such as `self` or `http://webfinger.net/rel/profile-page`
    pub rel: Option<String>,
    /// Media type of the target resource
    #[serde(rename = "type")]
    pub kind: Option<String>,
    /// Url pointing to the target resource
    pub href: Option<Url>,
    /// Used for remote follow external interaction url
    pub template: Option<String>,
    /// Additional data about the link
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub properties: HashMap<Url, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> FederationConfig {
        FederationConfig::builder()
            .base_url(Url::parse("https://example.com").unwrap())
            .build()
            .unwrap()
    }

    #[test]
    fn webfinger_extract_name() {
        let config = test_config();
        assert_eq!(
            Ok("test123"),
            extract_webfinger_name("acct:test123@example.com", &config)
        );
        assert_eq!(
            Ok("Владимир"),
            extract_webfinger_name("acct:Владимир@example.com", &config)
        );
        assert_eq!(
            Ok("da-sh"),
            extract_webfinger_name("acct:da-sh@example.com", &config)
        );
        assert!(extract_webfinger_name("acct:alice@other.com", &config).is_err());
        assert!(extract_webfinger_name("alice@example.com", &config).is_err());
    }

    #[test]
    fn query_url_construction() {
        let url = webfinger_query_url("alice@example.com", false).unwrap();
        assert_eq!(
            url.as_str(),
            "https://example.com/.well-known/webfinger?resource=acct:alice@example.com"
        );
        assert!(webfinger_query_url("no-at-sign", false).is_err());
    }

    #[test]
    fn response_roundtrip() {
        let actor = Url::parse("https://example.com/users/alice").unwrap();
        let response =
            build_webfinger_response("acct:alice@example.com".to_string(), actor.clone());
        assert_eq!(extract_actor_uri(&response).unwrap(), actor);
    }

    #[test]
    fn extract_prefers_activity_json_link() {
        let actor = Url::parse("https://example.com/users/alice").unwrap();
        let other = Url::parse("https://example.com/html/alice").unwrap();
        let webfinger = Webfinger {
            subject: "acct:alice@example.com".to_string(),
            links: vec![
                WebfingerLink {
                    rel: Some("self".to_string()),
                    kind: Some("application/ld+json".to_string()),
                    href: Some(other),
                    ..Default::default()
                },
                WebfingerLink {
                    rel: Some("self".to_string()),
                    kind: Some(FEDERATION_CONTENT_TYPE.to_string()),
                    href: Some(actor.clone()),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        assert_eq!(extract_actor_uri(&webfinger).unwrap(), actor);
    }

    #[test]
    fn no_valid_link_is_an_error() {
        let webfinger = Webfinger {
            subject: "acct:alice@example.com".to_string(),
            ..Default::default()
        };
        assert_eq!(
            extract_actor_uri(&webfinger).unwrap_err(),
            Error::WebfingerResolveFailed
        );
    }
}
