//! Instance-wide configuration
//!
//! One [FederationConfig] is built at startup and handed to every component;
//! there is no ambient state. Construct it through the builder:
//!
//! ```
//! # use rookery::config::FederationConfig;
//! # use url::Url;
//! let config = FederationConfig::builder()
//!     .base_url(Url::parse("https://example.com")?)
//!     .build()?;
//! assert_eq!(config.domain(), "example.com");
//! # Ok::<(), anyhow::Error>(())
//! ```

use crate::error::Error;
use async_trait::async_trait;
use derive_builder::Builder;
use dyn_clone::{clone_trait_object, DynClone};
use reqwest_middleware::ClientWithMiddleware;
use std::time::Duration;
use subtle::ConstantTimeEq;
use url::{Host, Url};

/// Instance-wide federation settings, captured by each component at
/// construction
#[derive(Builder, Clone)]
#[builder(build_fn(private, name = "partial_build"))]
pub struct FederationConfig {
    /// Base URL under which this instance serves its actors, for example
    /// `https://example.com`. All local URIs are derived from it.
    pub(crate) base_url: Url,
    /// The domain (host plus non-default port) where this instance is running.
    /// Derived from `base_url` when not set explicitly.
    #[builder(default)]
    pub(crate) domain: String,
    /// Shared HTTP pool for all outgoing requests; wrap it in middleware to
    /// get tracing or transport-level retries.
    #[builder(default = "reqwest::Client::default().into()")]
    pub(crate) client: ClientWithMiddleware,
    /// User-Agent sent on outgoing requests
    #[builder(setter(into), default = "concat!(\"rookery/\", env!(\"CARGO_PKG_VERSION\")).into()")]
    pub(crate) user_agent: String,
    /// Timeout for all HTTP requests
    #[builder(default = "Duration::from_secs(30)")]
    pub(crate) request_timeout: Duration,
    /// Maximum number of outgoing HTTP requests per incoming HTTP request, to
    /// prevent recursive fetching of remote objects.
    #[builder(default = "20")]
    #[allow(dead_code)]
    pub(crate) http_fetch_limit: u32,
    /// Last-word gate over remote URLs, see [UrlVerifier]
    #[builder(default = "Box::new(PermitAll)")]
    pub(crate) url_verifier: Box<dyn UrlVerifier + Sync>,
    /// Permit plain-http and loopback URLs, for local development and tests.
    /// Never enable on a reachable instance.
    #[builder(default = "false")]
    pub(crate) debug: bool,
    /// Reconstruct the `host` signature entry from a proxy-forwarded host
    /// header when present. Enable only behind a trusted reverse proxy.
    #[builder(default = "false")]
    pub(crate) trust_forwarded_host: bool,
    /// Static bearer token granting admin privileges. `None` disables the
    /// token pathway entirely.
    #[builder(setter(into, strip_option), default)]
    pub(crate) admin_token: Option<String>,
    /// Username of the server-owned actor used for admin verbs and for
    /// signing outbound fetches when no user context is available.
    #[builder(setter(into), default = "\"system\".into()")]
    pub(crate) system_actor_name: String,
    /// How often the delivery worker polls for due queue items
    #[builder(default = "Duration::from_secs(1)")]
    pub(crate) poll_interval: Duration,
    /// Maximum number of queue items claimed per worker cycle
    #[builder(default = "100")]
    pub(crate) batch_size: usize,
    /// Delivery attempts before a queue item is dead
    #[builder(default = "6")]
    pub(crate) max_retries: u32,
    /// Delivered and dead queue items older than this are removed by the
    /// cleanup task
    #[builder(default = "Duration::from_secs(7 * 24 * 3600)")]
    pub(crate) queue_max_age: Duration,
    /// Lifetime of resolved public keys in the in-process cache
    #[builder(default = "Duration::from_secs(3600)")]
    pub(crate) key_cache_ttl: Duration,
    /// Lifetime of cached client GET responses
    #[builder(default = "Duration::from_secs(60)")]
    #[allow(dead_code)]
    pub(crate) response_cache_ttl: Duration,
    /// Default number of items per collection page
    #[builder(default = "20")]
    pub(crate) page_size: u64,
}

impl FederationConfig {
    /// A builder preloaded with the defaults
    pub fn builder() -> FederationConfigBuilder {
        FederationConfigBuilder::default()
    }

    /// Gate every URL the instance is about to touch: activity ids, fetch
    /// targets and delivery inboxes all pass through here. The scheme and
    /// host rules are fixed; the configured [UrlVerifier] gets the final
    /// word on whatever survives them.
    pub(crate) async fn verify_url_valid(&self, url: &Url) -> Result<(), Error> {
        if url.host_str().is_none() {
            return Err(Error::UrlVerification("Url must name a host"));
        }

        // URIs minted by this instance need no gating
        if self.is_local_url(url) {
            return Ok(());
        }

        match url.scheme() {
            "https" => {}
            "http" if self.debug => {}
            "http" => {
                return Err(Error::UrlVerification(
                    "Plain http is restricted to debug mode",
                ))
            }
            _ => return Err(Error::UrlVerification("Only http(s) urls federate")),
        }

        if is_loopback_host(url) && !self.debug {
            return Err(Error::UrlVerification(
                "Loopback hosts are restricted to debug mode",
            ));
        }

        self.url_verifier
            .verify(url)
            .await
            .map_err(Error::UrlVerification)
    }

    /// Whether the URL points at this instance, comparing its host plus
    /// explicit port against the configured domain.
    pub fn is_local_url(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        match url.port() {
            Some(port) => self.domain == format!("{}:{}", host, port),
            None => self.domain == host,
        }
    }

    /// The local domain
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// The base URL of this instance
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// URI of the local actor with the given username
    pub fn actor_uri(&self, username: &str) -> Result<Url, Error> {
        Ok(self.base_url.join(&format!("users/{}", username))?)
    }

    /// URI of the server-owned system actor
    pub fn system_actor_uri(&self) -> Result<Url, Error> {
        self.actor_uri(&self.system_actor_name)
    }

    /// Extracts the username from a local actor URI, if the URI belongs to
    /// this instance and has the expected `/users/{name}` shape.
    pub fn local_username_of(&self, uri: &Url) -> Option<String> {
        if !self.is_local_url(uri) {
            return None;
        }
        let mut segments = uri.path_segments()?;
        let (first, name, rest) = (segments.next()?, segments.next()?, segments.next());
        if first == "users" && rest.is_none() && !name.is_empty() {
            Some(name.to_string())
        } else {
            None
        }
    }

    /// Compares a presented bearer token against the configured admin token
    /// in constant time. Always false when no token is configured.
    pub fn admin_token_matches(&self, presented: Option<&str>) -> bool {
        match (&self.admin_token, presented) {
            (Some(expected), Some(got)) => expected.as_bytes().ct_eq(got.as_bytes()).into(),
            _ => false,
        }
    }
}

impl FederationConfigBuilder {
    /// Finish the builder, deriving the domain from the base URL unless one
    /// was set explicitly.
    pub fn build(&mut self) -> Result<FederationConfig, FederationConfigBuilderError> {
        let mut config = self.partial_build()?;
        if config.domain.is_empty() {
            let host = config
                .base_url
                .host_str()
                .ok_or_else(|| {
                    FederationConfigBuilderError::ValidationError(
                        "base_url must have a host".into(),
                    )
                })?
                .to_string();
            config.domain = match config.base_url.port() {
                Some(port) => format!("{}:{}", host, port),
                None => host,
            };
        }
        Ok(config)
    }
}

/// Pluggable final say over which remote URLs this instance will talk to.
///
/// Implementations typically back a domain blocklist. The verifier runs
/// after the built-in scheme and host rules, so it only ever sees URLs that
/// would otherwise be contacted; returning an error aborts whatever
/// operation presented the URL.
#[async_trait]
pub trait UrlVerifier: DynClone + Send {
    /// Err names the rule that rejected the URL; Ok lets it through.
    async fn verify(&self, url: &Url) -> Result<(), &'static str>;
}

/// Verifier used when none is configured; everything passes.
#[derive(Clone)]
struct PermitAll;

#[async_trait]
impl UrlVerifier for PermitAll {
    async fn verify(&self, _url: &Url) -> Result<(), &'static str> {
        Ok(())
    }
}

clone_trait_object!(UrlVerifier);

fn is_loopback_host(url: &Url) -> bool {
    match url.host() {
        Some(Host::Domain(domain)) => domain == "localhost",
        Some(Host::Ipv4(address)) => address.is_loopback(),
        Some(Host::Ipv6(address)) => address.is_loopback(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base: &str) -> FederationConfig {
        FederationConfig::builder()
            .base_url(Url::parse(base).unwrap())
            .debug(true)
            .build()
            .unwrap()
    }

    #[test]
    fn domain_derived_from_base_url() {
        assert_eq!(config("https://example.com").domain(), "example.com");
        assert_eq!(config("http://localhost:8080").domain(), "localhost:8080");
    }

    #[test]
    fn local_username_extraction() {
        let config = config("https://example.com");
        let uri = Url::parse("https://example.com/users/alice").unwrap();
        assert_eq!(config.local_username_of(&uri), Some("alice".to_string()));

        let remote = Url::parse("https://other.com/users/alice").unwrap();
        assert_eq!(config.local_username_of(&remote), None);

        let object = Url::parse("https://example.com/users/alice/objects/1").unwrap();
        assert_eq!(config.local_username_of(&object), None);
    }

    #[test]
    fn admin_token_comparison() {
        let config = FederationConfig::builder()
            .base_url(Url::parse("https://example.com").unwrap())
            .admin_token("s3cret")
            .build()
            .unwrap();
        assert!(config.admin_token_matches(Some("s3cret")));
        assert!(!config.admin_token_matches(Some("guess")));
        assert!(!config.admin_token_matches(None));

        let no_token = config_without_token();
        assert!(!no_token.admin_token_matches(Some("anything")));
    }

    fn config_without_token() -> FederationConfig {
        FederationConfig::builder()
            .base_url(Url::parse("https://example.com").unwrap())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn url_verification_rules() {
        let config = FederationConfig::builder()
            .base_url(Url::parse("https://example.com").unwrap())
            .build()
            .unwrap();
        let https = Url::parse("https://other.com/x").unwrap();
        assert!(config.verify_url_valid(&https).await.is_ok());
        let http = Url::parse("http://other.com/x").unwrap();
        assert!(config.verify_url_valid(&http).await.is_err());
        let ftp = Url::parse("ftp://other.com/x").unwrap();
        assert!(config.verify_url_valid(&ftp).await.is_err());

        // loopback in any spelling stays out of production instances
        for loopback in ["https://localhost/x", "https://127.0.0.1/x", "https://[::1]/x"] {
            let url = Url::parse(loopback).unwrap();
            assert!(
                config.verify_url_valid(&url).await.is_err(),
                "{loopback} must be rejected"
            );
        }
    }

    #[tokio::test]
    async fn debug_mode_admits_local_development_urls() {
        let config = FederationConfig::builder()
            .base_url(Url::parse("https://example.com").unwrap())
            .debug(true)
            .build()
            .unwrap();
        for allowed in ["http://other.com/x", "http://127.0.0.1:8080/inbox"] {
            let url = Url::parse(allowed).unwrap();
            assert!(
                config.verify_url_valid(&url).await.is_ok(),
                "{allowed} must pass in debug mode"
            );
        }
    }
}
