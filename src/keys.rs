//! Resolving public keys for signature verification
//!
//! A `keyId` URL is resolved to a PEM public key: cache first, then the local
//! actor repository, then a remote fetch. Outbound fetches are signed by the
//! system actor when one is configured, since some servers reject anonymous
//! actor fetches.

use crate::{
    config::FederationConfig,
    error::Error,
    protocol::actor::ApActor,
    signatures::sign_request,
    storage::{ActorRecord, ActorStore},
    FEDERATION_ACCEPT,
};
use http::Method;
use moka::future::Cache;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

/// Resolves `keyId` URLs to public keys, caching results with a TTL
pub struct KeyResolver {
    config: FederationConfig,
    actors: Arc<dyn ActorStore>,
    cache: Cache<String, String>,
}

impl KeyResolver {
    /// A resolver over the given actor repository. Cache lifetime comes from
    /// the config's `key_cache_ttl`.
    pub fn new(config: FederationConfig, actors: Arc<dyn ActorStore>) -> Self {
        let cache = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(config.key_cache_ttl)
            .build();
        KeyResolver {
            config,
            actors,
            cache,
        }
    }

    /// Resolve a `keyId` URL to a PEM public key.
    ///
    /// The actor URI is the key id with its fragment stripped. Local and
    /// already-fetched actors are served from the repository; unknown ones
    /// are fetched over HTTP and stored. An actor which publishes its key
    /// under a different id than the requested one is tolerated with a
    /// warning.
    pub async fn resolve(&self, key_id: &str) -> Result<String, Error> {
        if let Some(pem) = self.cache.get(key_id).await {
            return Ok(pem);
        }

        let mut actor_uri = Url::parse(key_id).map_err(|_| Error::SignatureHeaderInvalid)?;
        actor_uri.set_fragment(None);

        let actor = resolve_actor(&self.config, &self.actors, &actor_uri).await?;
        let public_key = actor
            .public_key
            .as_ref()
            .ok_or_else(|| Error::MissingPublicKey(actor_uri.clone()))?;
        if public_key.id != key_id {
            warn!(
                "actor {} publishes key {} but was queried for {}",
                actor_uri, public_key.id, key_id
            );
        }

        let pem = public_key.public_key_pem.clone();
        self.cache.insert(key_id.to_string(), pem.clone()).await;
        Ok(pem)
    }

    /// Drop a cached key, forcing re-resolution on next use. Called when
    /// verification fails against a cached key that may have rotated.
    pub async fn invalidate(&self, key_id: &str) {
        self.cache.invalidate(key_id).await;
    }
}

/// Look up an actor by URI in the repository, falling back to a remote fetch
/// which stores the result.
pub async fn resolve_actor(
    config: &FederationConfig,
    actors: &Arc<dyn ActorStore>,
    uri: &Url,
) -> Result<ActorRecord, Error> {
    if let Some(actor) = actors.get_by_uri(uri).await? {
        return Ok(actor);
    }
    if config.is_local_url(uri) {
        return Err(Error::NotFound);
    }

    let document = fetch_actor_document(config, actors, uri).await?;
    let record = ActorRecord::from_document(document);
    actors.save(record.clone()).await?;
    Ok(record)
}

/// Fetch a remote actor document, signing the GET with the system actor's
/// key when one exists.
pub async fn fetch_actor_document(
    config: &FederationConfig,
    actors: &Arc<dyn ActorStore>,
    uri: &Url,
) -> Result<ApActor, Error> {
    config.verify_url_valid(uri).await?;
    info!("fetching remote actor {}", uri);

    let mut request = config
        .client
        .get(uri.as_str())
        .timeout(config.request_timeout)
        .header("accept", FEDERATION_ACCEPT)
        .header("user-agent", &config.user_agent);

    let system_actor = actors
        .get_by_username(&config.system_actor_name)
        .await?
        .filter(|actor| actor.private_key_pem.is_some());
    if let Some(system) = system_actor {
        let private_key = system
            .private_key_pem
            .as_deref()
            .ok_or(Error::KeyInvalid)?;
        let signed = sign_request(
            &Method::GET,
            uri,
            None,
            None,
            Some(FEDERATION_ACCEPT),
            &system.key_id(),
            private_key,
        )?;
        request = request
            .header("host", signed.host)
            .header("date", signed.date)
            .header("signature", signed.signature);
    } else {
        debug!("no system actor key, fetching {} anonymously", uri);
    }

    let response = request.send().await?;
    match response.status() {
        status if status.is_success() => {}
        http::StatusCode::NOT_FOUND | http::StatusCode::GONE => return Err(Error::NotFound),
        status => {
            return Err(Error::RemoteStatus {
                status,
                url: uri.clone(),
            })
        }
    }

    Ok(response.json().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crypto::generate_actor_keypair,
        protocol::actor::{ActorKind, PublicKey},
        storage::memory::InMemoryActorStore,
    };
    use chrono::Utc;
    use serde_json::Map;

    fn test_config() -> FederationConfig {
        FederationConfig::builder()
            .base_url(Url::parse("https://example.com").unwrap())
            .build()
            .unwrap()
    }

    fn remote_actor(uri: &str, key_id: &str) -> (ActorRecord, String) {
        let keypair = generate_actor_keypair().unwrap();
        let uri = Url::parse(uri).unwrap();
        let record = ActorRecord {
            preferred_username: "bob".to_string(),
            kind: ActorKind::Person,
            display_name: None,
            summary: None,
            inbox: Url::parse(&format!("{}/inbox", uri)).unwrap(),
            outbox: None,
            followers: None,
            following: None,
            liked: None,
            shared: None,
            shared_inbox: None,
            public_key: Some(PublicKey {
                id: key_id.to_string(),
                owner: uri.clone(),
                public_key_pem: keypair.public_key.clone(),
            }),
            private_key_pem: None,
            manually_approves_followers: false,
            local: false,
            published: Utc::now(),
            extensions: Map::new(),
            uri,
        };
        (record, keypair.public_key)
    }

    #[tokio::test]
    async fn resolves_stored_actor_key() {
        let actors: Arc<dyn ActorStore> = Arc::new(InMemoryActorStore::default());
        let key_id = "https://other.com/users/bob#main-key";
        let (record, pem) = remote_actor("https://other.com/users/bob", key_id);
        actors.save(record).await.unwrap();

        let resolver = KeyResolver::new(test_config(), actors);
        assert_eq!(resolver.resolve(key_id).await.unwrap(), pem);
        // second resolution hits the cache
        assert_eq!(resolver.resolve(key_id).await.unwrap(), pem);
    }

    #[tokio::test]
    async fn mismatched_key_id_still_resolves() {
        let actors: Arc<dyn ActorStore> = Arc::new(InMemoryActorStore::default());
        let (record, pem) = remote_actor(
            "https://other.com/users/bob",
            "https://other.com/users/bob#legacy-key",
        );
        actors.save(record).await.unwrap();

        let resolver = KeyResolver::new(test_config(), actors);
        let resolved = resolver
            .resolve("https://other.com/users/bob#main-key")
            .await
            .unwrap();
        assert_eq!(resolved, pem);
    }

    #[tokio::test]
    async fn actor_without_key_is_a_specific_error() {
        let actors: Arc<dyn ActorStore> = Arc::new(InMemoryActorStore::default());
        let (mut record, _) = remote_actor(
            "https://other.com/users/bob",
            "https://other.com/users/bob#main-key",
        );
        record.public_key = None;
        actors.save(record).await.unwrap();

        let resolver = KeyResolver::new(test_config(), actors);
        let result = resolver.resolve("https://other.com/users/bob#main-key").await;
        assert_eq!(
            result.unwrap_err(),
            Error::MissingPublicKey(Url::parse("https://other.com/users/bob").unwrap())
        );
    }

    #[tokio::test]
    async fn unknown_local_actor_is_not_fetched() {
        let actors: Arc<dyn ActorStore> = Arc::new(InMemoryActorStore::default());
        let config = test_config();
        let uri = Url::parse("https://example.com/users/ghost").unwrap();
        let result = resolve_actor(&config, &actors, &uri).await;
        assert_eq!(result.unwrap_err(), Error::NotFound);
    }
}
