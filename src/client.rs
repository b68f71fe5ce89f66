//! Client for fetching and posting ActivityPub data
//!
//! The client operates in one of three modes: anonymous (no signing),
//! authenticated with an actor URI and private key, or deferred: holding an
//! actor URI and API bearer token, fetching its own actor document on first
//! use to extract the private key and upgrade itself to authenticated.
//!
//! Every operation takes a [CancellationToken]; a tripped token aborts
//! in-flight I/O at the next await point with [Error::Cancelled].

use crate::{
    error::Error,
    protocol::{
        activity::IdOrObject,
        actor::ApActor,
        collections::CollectionDocument,
        context::WithContext,
    },
    signatures::sign_request,
    webfinger::{extract_actor_uri, webfinger_query_url, Webfinger, WEBFINGER_CONTENT_TYPE},
    FEDERATION_ACCEPT, FEDERATION_CONTENT_TYPE,
};
use http::Method;
use moka::future::Cache;
use reqwest_middleware::ClientWithMiddleware;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::{collections::VecDeque, future::Future, time::Duration};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

/// Pages a single walk will follow before giving up, a guard against cyclic
/// `next` chains on misbehaving servers
const MAX_COLLECTION_PAGES: usize = 1024;

/// How the client authenticates outgoing requests
#[derive(Clone, Debug)]
pub enum Credentials {
    /// No signing
    Anonymous,
    /// Sign with the given actor's key
    Key {
        /// The actor on whose behalf requests are made
        actor: Url,
        /// Key id sent in the `Signature` header
        key_id: String,
        /// Private key in PEM format
        private_key_pem: String,
    },
    /// Bearer token, upgraded to [Credentials::Key] on first use by fetching
    /// the actor's own document
    ApiToken {
        /// The actor on whose behalf requests are made
        actor: Url,
        /// The admin API token
        token: String,
    },
}

impl Credentials {
    fn actor(&self) -> Option<&Url> {
        match self {
            Credentials::Anonymous => None,
            Credentials::Key { actor, .. } | Credentials::ApiToken { actor, .. } => Some(actor),
        }
    }
}

/// ActivityPub HTTP client
pub struct ApClient {
    http: ClientWithMiddleware,
    credentials: RwLock<Credentials>,
    user_agent: String,
    timeout: Duration,
    debug: bool,
    cache: Cache<Url, Value>,
}

impl ApClient {
    /// A client with the given credentials and defaults for everything else
    pub fn new(credentials: Credentials) -> Self {
        ApClient {
            http: reqwest::Client::default().into(),
            credentials: RwLock::new(credentials),
            user_agent: concat!("rookery/", env!("CARGO_PKG_VERSION")).to_string(),
            timeout: Duration::from_secs(30),
            debug: false,
            cache: Cache::builder()
                .max_capacity(1_000)
                .time_to_live(Duration::from_secs(60))
                .build(),
        }
    }

    /// Use the given HTTP client pool instead of a fresh one
    pub fn with_http_client(mut self, http: ClientWithMiddleware) -> Self {
        self.http = http;
        self
    }

    /// Override the per-request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the response cache lifetime
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache = Cache::builder().max_capacity(1_000).time_to_live(ttl).build();
        self
    }

    /// Allow plain-http URLs, for tests against local servers
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Override the User-Agent header
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Fetch `uri` as `T`.
    ///
    /// Returns `Ok(None)` on 404 and 410. Successful responses are cached
    /// for the configured TTL when `use_cache` is set. Requests are signed
    /// in authenticated mode.
    pub async fn get<T: DeserializeOwned>(
        &self,
        uri: &Url,
        use_cache: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<T>, Error> {
        self.ensure_initialized(cancel).await?;
        self.request_json(uri, FEDERATION_ACCEPT, use_cache, cancel)
            .await
    }

    /// POST `body` to `uri` as `application/activity+json`, signed with a
    /// digest. Requires authenticated mode; returns the response verbatim.
    pub async fn post<T: Serialize>(
        &self,
        uri: &Url,
        body: &T,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, Error> {
        self.ensure_initialized(cancel).await?;
        let credentials = self.credentials.read().await.clone();
        let Credentials::Key {
            key_id,
            private_key_pem,
            ..
        } = credentials
        else {
            return Err(Error::other(anyhow::anyhow!(
                "posting requires authenticated mode"
            )));
        };

        let bytes = serde_json::to_vec(body)?;
        let signed = sign_request(
            &Method::POST,
            uri,
            Some(&bytes),
            Some(FEDERATION_CONTENT_TYPE),
            None,
            &key_id,
            &private_key_pem,
        )?;

        let request = self
            .http
            .post(uri.as_str())
            .timeout(self.timeout)
            .header("content-type", FEDERATION_CONTENT_TYPE)
            .header("user-agent", &self.user_agent)
            .header("host", signed.host)
            .header("date", signed.date)
            .header(
                "digest",
                signed.digest.as_deref().unwrap_or_default(),
            )
            .header("signature", signed.signature)
            .body(bytes);

        Ok(cancellable(cancel, request.send()).await??)
    }

    /// POST an activity to the authenticated actor's own outbox.
    ///
    /// The actor document is fetched to resolve the outbox URI, and the
    /// activity is wrapped with the default JSON-LD context.
    pub async fn post_to_outbox<T: Serialize>(
        &self,
        activity: &T,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, Error> {
        self.ensure_initialized(cancel).await?;
        let actor_uri = self
            .credentials
            .read()
            .await
            .actor()
            .cloned()
            .ok_or_else(|| Error::other(anyhow::anyhow!("posting requires authenticated mode")))?;
        let actor: ApActor = self
            .get(&actor_uri, true, cancel)
            .await?
            .ok_or(Error::NotFound)?;
        let outbox = actor.outbox.ok_or(Error::NotFound)?;
        self.post(&outbox, &WithContext::new_default(activity), cancel)
            .await
    }

    /// Resolve a `user@host` handle via WebFinger and fetch the actor.
    ///
    /// Returns `Ok(None)` when the handle or the linked actor does not exist.
    pub async fn resolve_by_alias(
        &self,
        handle: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<ApActor>, Error> {
        let query = webfinger_query_url(handle, self.debug)?;
        let Some(webfinger) = self
            .request_json::<Webfinger>(&query, WEBFINGER_CONTENT_TYPE, false, cancel)
            .await?
        else {
            return Ok(None);
        };
        let actor_uri = extract_actor_uri(&webfinger)?;
        self.get(&actor_uri, true, cancel).await
    }

    /// Lazily walk a collection and its pages. See [CollectionWalker].
    pub fn get_collection(
        &self,
        uri: Url,
        limit: Option<usize>,
        cancel: CancellationToken,
    ) -> CollectionWalker<'_> {
        CollectionWalker {
            client: self,
            cancel,
            pending: VecDeque::new(),
            upcoming: NextDocument::Fetch(uri),
            remaining: limit,
            pages: 0,
        }
    }

    /// Upgrade API-token credentials to key credentials by fetching our own
    /// actor document with the bearer token and extracting the private key.
    async fn ensure_initialized(&self, cancel: &CancellationToken) -> Result<(), Error> {
        let (actor, token) = {
            let credentials = self.credentials.read().await;
            match &*credentials {
                Credentials::ApiToken { actor, token } => (actor.clone(), token.clone()),
                _ => return Ok(()),
            }
        };

        debug!("initializing client credentials from {}", actor);
        let request = self
            .http
            .get(actor.as_str())
            .timeout(self.timeout)
            .header("accept", FEDERATION_ACCEPT)
            .header("user-agent", &self.user_agent)
            .header("authorization", format!("Bearer {}", token));
        let response = cancellable(cancel, request.send()).await??;
        if !response.status().is_success() {
            return Err(Error::RemoteStatus {
                status: response.status(),
                url: actor,
            });
        }
        let document: ApActor = cancellable(cancel, response.json()).await??;
        let private_key_pem = document.private_key_pem.ok_or_else(|| {
            Error::other(anyhow::anyhow!(
                "actor document does not include a private key; is the token valid?"
            ))
        })?;
        let key_id = document
            .public_key
            .map(|key| key.id)
            .unwrap_or_else(|| crate::protocol::actor::key_id_for(&actor));

        let mut credentials = self.credentials.write().await;
        *credentials = Credentials::Key {
            actor,
            key_id,
            private_key_pem,
        };
        Ok(())
    }

    async fn request_json<T: DeserializeOwned>(
        &self,
        uri: &Url,
        accept: &str,
        use_cache: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<T>, Error> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if use_cache {
            if let Some(value) = self.cache.get(uri).await {
                return Ok(Some(serde_json::from_value(value)?));
            }
        }

        let mut request = self
            .http
            .get(uri.as_str())
            .timeout(self.timeout)
            .header("accept", accept)
            .header("user-agent", &self.user_agent);
        if let Credentials::Key {
            key_id,
            private_key_pem,
            ..
        } = &*self.credentials.read().await
        {
            let signed = sign_request(
                &Method::GET,
                uri,
                None,
                None,
                Some(accept),
                key_id,
                private_key_pem,
            )?;
            request = request
                .header("host", signed.host)
                .header("date", signed.date)
                .header("signature", signed.signature);
        }

        let response = cancellable(cancel, request.send()).await??;
        match response.status() {
            status if status.is_success() => {}
            http::StatusCode::NOT_FOUND | http::StatusCode::GONE => return Ok(None),
            status => {
                return Err(Error::RemoteStatus {
                    status,
                    url: uri.clone(),
                })
            }
        }

        let value: Value = cancellable(cancel, response.json()).await??;
        if use_cache {
            self.cache.insert(uri.clone(), value.clone()).await;
        }
        Ok(Some(serde_json::from_value(value)?))
    }
}

async fn cancellable<F, T>(cancel: &CancellationToken, future: F) -> Result<T, Error>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Error::Cancelled),
        result = future => Ok(result),
    }
}

enum NextDocument {
    Fetch(Url),
    Inline(Box<CollectionDocument>),
    Exhausted,
}

/// Lazy, finite walk over a collection and its pages.
///
/// Items of the current document are consumed first; when they run out the
/// walker follows `first` and then `next` links until the chain ends or the
/// limit is reached. Single objects where arrays are expected are yielded as
/// one item.
pub struct CollectionWalker<'a> {
    client: &'a ApClient,
    cancel: CancellationToken,
    pending: VecDeque<Value>,
    upcoming: NextDocument,
    remaining: Option<usize>,
    pages: usize,
}

impl CollectionWalker<'_> {
    /// The next raw item, or `Ok(None)` when the walk is exhausted
    pub async fn try_next(&mut self) -> Result<Option<Value>, Error> {
        loop {
            if self.remaining == Some(0) {
                return Ok(None);
            }
            if let Some(item) = self.pending.pop_front() {
                if let Some(remaining) = &mut self.remaining {
                    *remaining -= 1;
                }
                return Ok(Some(item));
            }

            match std::mem::replace(&mut self.upcoming, NextDocument::Exhausted) {
                NextDocument::Exhausted => return Ok(None),
                NextDocument::Inline(document) => self.ingest(*document),
                NextDocument::Fetch(url) => {
                    if self.pages >= MAX_COLLECTION_PAGES {
                        warn!("aborting collection walk after {} pages", self.pages);
                        return Ok(None);
                    }
                    self.pages += 1;
                    let document: Option<CollectionDocument> = self
                        .client
                        .request_json(&url, FEDERATION_ACCEPT, false, &self.cancel)
                        .await?;
                    match document {
                        Some(document) => self.ingest(document),
                        // a vanished page terminates the walk
                        None => return Ok(None),
                    }
                }
            }
        }
    }

    /// The next item converted to `T`. Items which fail to deserialize are
    /// skipped with a warning rather than aborting the walk.
    pub async fn try_next_typed<T: DeserializeOwned>(&mut self) -> Result<Option<T>, Error> {
        while let Some(value) = self.try_next().await? {
            match serde_json::from_value(value) {
                Ok(item) => return Ok(Some(item)),
                Err(error) => warn!("skipping malformed collection item: {}", error),
            }
        }
        Ok(None)
    }

    /// Drain the walk into a vector of `T`, skipping malformed items
    pub async fn collect_typed<T: DeserializeOwned>(mut self) -> Result<Vec<T>, Error> {
        let mut items = Vec::new();
        while let Some(item) = self.try_next_typed().await? {
            items.push(item);
        }
        Ok(items)
    }

    fn ingest(&mut self, document: CollectionDocument) {
        let next = document.next.clone();
        let first = document.first.clone();
        match document.into_items() {
            Some(items) => {
                self.pending.extend(items);
                self.upcoming = match next {
                    Some(url) => NextDocument::Fetch(url),
                    None => NextDocument::Exhausted,
                };
            }
            None => {
                self.upcoming = match first {
                    Some(IdOrObject::Id(url)) => NextDocument::Fetch(url),
                    Some(IdOrObject::Object(value)) => {
                        match serde_json::from_value::<CollectionDocument>(*value) {
                            Ok(document) => NextDocument::Inline(Box::new(document)),
                            Err(error) => {
                                warn!("skipping malformed embedded first page: {}", error);
                                NextDocument::Exhausted
                            }
                        }
                    }
                    None => NextDocument::Exhausted,
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let client = ApClient::new(Credentials::Anonymous);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let uri = Url::parse("https://unreachable.invalid/users/alice").unwrap();
        let result = client.get::<Value>(&uri, false, &cancel).await;
        assert_eq!(result.unwrap_err(), Error::Cancelled);
    }

    #[tokio::test]
    async fn walker_consumes_inline_items_without_fetching() {
        let client = ApClient::new(Credentials::Anonymous);
        let cancel = CancellationToken::new();
        let document: CollectionDocument = serde_json::from_str(
            r#"{"orderedItems": ["https://e.com/1", "https://e.com/2", "https://e.com/3"]}"#,
        )
        .unwrap();
        let mut walker = CollectionWalker {
            client: &client,
            cancel,
            pending: VecDeque::new(),
            upcoming: NextDocument::Inline(Box::new(document)),
            remaining: Some(2),
            pages: 0,
        };
        assert!(walker.try_next().await.unwrap().is_some());
        assert!(walker.try_next().await.unwrap().is_some());
        // limit reached
        assert!(walker.try_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn walker_yields_single_object_as_one_item() {
        let client = ApClient::new(Credentials::Anonymous);
        let document: CollectionDocument =
            serde_json::from_str(r#"{"items": {"id": "https://e.com/1"}}"#).unwrap();
        let mut walker = CollectionWalker {
            client: &client,
            cancel: CancellationToken::new(),
            pending: VecDeque::new(),
            upcoming: NextDocument::Inline(Box::new(document)),
            remaining: None,
            pages: 0,
        };
        assert!(walker.try_next().await.unwrap().is_some());
        assert!(walker.try_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn walker_skips_malformed_items_in_typed_mode() {
        let client = ApClient::new(Credentials::Anonymous);
        let document: CollectionDocument = serde_json::from_str(
            r#"{"orderedItems": [{"bogus": true}, "https://e.com/ok"]}"#,
        )
        .unwrap();
        let mut walker = CollectionWalker {
            client: &client,
            cancel: CancellationToken::new(),
            pending: VecDeque::new(),
            upcoming: NextDocument::Inline(Box::new(document)),
            remaining: None,
            pages: 0,
        };
        let item: Option<Url> = walker.try_next_typed().await.unwrap();
        assert_eq!(item.unwrap().as_str(), "https://e.com/ok");
    }
}
