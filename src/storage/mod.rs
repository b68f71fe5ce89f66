//! Repository traits consumed by the federation core
//!
//! The core never talks to a database directly; every handler receives these
//! traits at construction. [memory] provides reference implementations used
//! by the tests and suitable for demos.

use crate::{
    config::FederationConfig,
    crypto::generate_actor_keypair,
    custom_collections::CollectionDefinition,
    error::Error,
    protocol::{
        activity::Activity,
        actor::{key_id_for, ActorKind, ApActor, Endpoints, PublicKey},
        object::ApObject,
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use url::Url;
use uuid::Uuid;

/// In-memory reference implementations of all repository traits
pub mod memory;

/// Stored representation of an actor, local or remote
#[derive(Clone, Debug)]
pub struct ActorRecord {
    /// Globally unique actor URI
    pub uri: Url,
    /// Username, unique within this host for local actors
    pub preferred_username: String,
    /// The actor type
    pub kind: ActorKind,
    /// Display name
    pub display_name: Option<String>,
    /// Profile summary
    pub summary: Option<String>,
    /// Inbox URI
    pub inbox: Url,
    /// Outbox URI, absent on some remote actors
    pub outbox: Option<Url>,
    /// Followers collection URI
    pub followers: Option<Url>,
    /// Following collection URI
    pub following: Option<Url>,
    /// Liked collection URI
    pub liked: Option<Url>,
    /// Shared (announced) collection URI
    pub shared: Option<Url>,
    /// Shared inbox of the actor's server
    pub shared_inbox: Option<Url>,
    /// Public key, absent on remote actors which publish none
    pub public_key: Option<PublicKey>,
    /// Private key PEM, present only for locally hosted actors
    pub private_key_pem: Option<String>,
    /// Whether follows require an explicit Accept
    pub manually_approves_followers: bool,
    /// Whether the actor is hosted on this instance
    pub local: bool,
    /// Creation timestamp
    pub published: DateTime<Utc>,
    /// Arbitrary extension attributes
    pub extensions: Map<String, Value>,
}

impl ActorRecord {
    /// Create a local actor with a fresh keypair and the canonical URI layout
    /// of this instance.
    pub fn new_local(
        config: &FederationConfig,
        username: &str,
        kind: ActorKind,
    ) -> Result<Self, Error> {
        let uri = config.actor_uri(username)?;
        let keypair = generate_actor_keypair()?;
        let collection = |suffix: &str| -> Result<Url, Error> {
            Ok(Url::parse(&format!("{}/{}", uri, suffix))?)
        };
        Ok(ActorRecord {
            preferred_username: username.to_string(),
            kind,
            display_name: None,
            summary: None,
            inbox: collection("inbox")?,
            outbox: Some(collection("outbox")?),
            followers: Some(collection("followers")?),
            following: Some(collection("following")?),
            liked: Some(collection("liked")?),
            shared: Some(collection("shared")?),
            shared_inbox: Some(config.base_url().join("inbox")?),
            public_key: Some(PublicKey::for_owner(uri.clone(), keypair.public_key)),
            private_key_pem: Some(keypair.private_key),
            manually_approves_followers: false,
            local: true,
            published: Utc::now(),
            extensions: Map::new(),
            uri,
        })
    }

    /// Store a fetched remote actor document
    pub fn from_document(document: ApActor) -> Self {
        ActorRecord {
            uri: document.id,
            preferred_username: document.preferred_username,
            kind: document.kind,
            display_name: document.name,
            summary: document.summary,
            inbox: document.inbox,
            outbox: document.outbox,
            followers: document.followers,
            following: document.following,
            liked: document.liked,
            shared: document.shared,
            shared_inbox: document.endpoints.and_then(|e| e.shared_inbox),
            public_key: document.public_key,
            private_key_pem: None,
            manually_approves_followers: document.manually_approves_followers.unwrap_or(false),
            local: false,
            published: document.published.unwrap_or_else(Utc::now),
            extensions: document.extra,
        }
    }

    /// The wire representation of this actor. The private key is included
    /// only when `include_private_key` is set, which requires the admin
    /// token; it must never leave the instance otherwise.
    pub fn to_document(&self, include_private_key: bool) -> ApActor {
        ApActor {
            id: self.uri.clone(),
            kind: self.kind.clone(),
            preferred_username: self.preferred_username.clone(),
            name: self.display_name.clone(),
            summary: self.summary.clone(),
            inbox: self.inbox.clone(),
            outbox: self.outbox.clone(),
            followers: self.followers.clone(),
            following: self.following.clone(),
            liked: self.liked.clone(),
            shared: self.shared.clone(),
            endpoints: self.shared_inbox.clone().map(|shared_inbox| Endpoints {
                shared_inbox: Some(shared_inbox),
            }),
            public_key: self.public_key.clone(),
            manually_approves_followers: Some(self.manually_approves_followers),
            private_key_pem: include_private_key
                .then(|| self.private_key_pem.clone())
                .flatten(),
            published: Some(self.published),
            extra: self.extensions.clone(),
        }
    }

    /// The id of this actor's signing key
    pub fn key_id(&self) -> String {
        self.public_key
            .as_ref()
            .map(|k| k.id.clone())
            .unwrap_or_else(|| key_id_for(&self.uri))
    }

    /// Returns shared inbox if it exists, normal inbox otherwise.
    pub fn shared_inbox_or_inbox(&self) -> Url {
        self.shared_inbox.clone().unwrap_or_else(|| self.inbox.clone())
    }
}

/// Status of one pending send to one target inbox
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Waiting for its first attempt
    Pending,
    /// Claimed by a worker
    Processing,
    /// Terminal success
    Delivered,
    /// Failed at least once, due for retry at `next_attempt_at`
    Failed,
    /// Terminal failure, retries exhausted or target gone
    Dead,
}

/// One pending send to one target inbox
#[derive(Clone, Debug)]
pub struct DeliveryItem {
    /// Queue item id
    pub id: Uuid,
    /// The serialized activity, sent as the request body verbatim
    pub activity: String,
    /// Id of the activity being delivered
    pub activity_id: Url,
    /// Target inbox
    pub inbox: Url,
    /// URI of the sending actor
    pub actor_uri: Url,
    /// Username of the sending actor, used to load its signing key
    pub username: String,
    /// Number of attempts so far
    pub attempt_count: u32,
    /// Attempts before the item is dead
    pub max_retries: u32,
    /// When the item was enqueued
    pub created_at: DateTime<Utc>,
    /// Earliest time of the next attempt
    pub next_attempt_at: DateTime<Utc>,
    /// When the item was last attempted
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// When the item reached a terminal status
    pub completed_at: Option<DateTime<Utc>>,
    /// Current status
    pub status: DeliveryStatus,
    /// Error of the most recent failed attempt
    pub last_error: Option<String>,
}

/// A stored media blob
#[derive(Clone, Debug)]
pub struct Blob {
    /// Media type of the stored bytes
    pub media_type: String,
    /// The stored bytes
    pub data: Vec<u8>,
}

/// Actor persistence
#[async_trait]
pub trait ActorStore: Send + Sync {
    /// Look up a local actor by username
    async fn get_by_username(&self, username: &str) -> Result<Option<ActorRecord>, Error>;
    /// Look up any actor by URI
    async fn get_by_uri(&self, uri: &Url) -> Result<Option<ActorRecord>, Error>;
    /// Insert or replace an actor
    async fn save(&self, actor: ActorRecord) -> Result<(), Error>;
    /// Remove a local actor
    async fn delete(&self, username: &str) -> Result<(), Error>;
    /// Number of local actors, for NodeInfo
    async fn count_local(&self) -> Result<u64, Error>;
}

/// Activity and object persistence, including the per-object reply, like and
/// share sub-collections
#[async_trait]
pub trait ActivityStore: Send + Sync {
    /// Append to an inbox. Returns false when the activity id was already
    /// present; a second receipt must be a no-op.
    async fn add_inbox(&self, username: &str, activity: &Activity) -> Result<bool, Error>;
    /// Append to an outbox, deduplicated by activity id
    async fn add_outbox(&self, username: &str, activity: &Activity) -> Result<bool, Error>;
    /// Page of an inbox, newest first
    async fn inbox(&self, username: &str, limit: u64, offset: u64) -> Result<Vec<Activity>, Error>;
    /// Page of an outbox, newest first
    async fn outbox(&self, username: &str, limit: u64, offset: u64)
        -> Result<Vec<Activity>, Error>;
    /// Total inbox size
    async fn inbox_count(&self, username: &str) -> Result<u64, Error>;
    /// Total outbox size
    async fn outbox_count(&self, username: &str) -> Result<u64, Error>;
    /// Look up a stored activity by id
    async fn activity(&self, id: &Url) -> Result<Option<Activity>, Error>;
    /// Insert or replace an object
    async fn save_object(&self, object: ApObject) -> Result<(), Error>;
    /// Look up a stored object by id
    async fn object(&self, id: &Url) -> Result<Option<ApObject>, Error>;
    /// All stored objects attributed to the given actor, newest first
    async fn objects_by_actor(&self, actor: &Url) -> Result<Vec<ApObject>, Error>;
    /// Append a reply reference to an object
    async fn add_reply(&self, object: &Url, reply: &Url) -> Result<bool, Error>;
    /// Page of an object's replies
    async fn replies(&self, object: &Url, limit: u64, offset: u64) -> Result<Vec<Url>, Error>;
    /// Number of replies
    async fn replies_count(&self, object: &Url) -> Result<u64, Error>;
    /// Record a like of an object. Idempotent per actor.
    async fn add_like(&self, object: &Url, actor: &Url, activity: &Url) -> Result<bool, Error>;
    /// Remove an actor's like of an object
    async fn remove_like(&self, object: &Url, actor: &Url) -> Result<bool, Error>;
    /// Page of an object's likes
    async fn likes(&self, object: &Url, limit: u64, offset: u64) -> Result<Vec<Url>, Error>;
    /// Number of likes
    async fn likes_count(&self, object: &Url) -> Result<u64, Error>;
    /// Record an announce of an object. Idempotent per actor.
    async fn add_share(&self, object: &Url, actor: &Url, activity: &Url) -> Result<bool, Error>;
    /// Remove an actor's announce of an object
    async fn remove_share(&self, object: &Url, actor: &Url) -> Result<bool, Error>;
    /// Page of an object's shares
    async fn shares(&self, object: &Url, limit: u64, offset: u64) -> Result<Vec<Url>, Error>;
    /// Number of shares
    async fn shares_count(&self, object: &Url) -> Result<u64, Error>;
    /// Record an object in an actor's liked collection
    async fn add_actor_liked(&self, actor: &Url, object: &Url) -> Result<bool, Error>;
    /// Remove an object from an actor's liked collection
    async fn remove_actor_liked(&self, actor: &Url, object: &Url) -> Result<bool, Error>;
    /// Page of an actor's liked collection
    async fn actor_liked(&self, actor: &Url, limit: u64, offset: u64) -> Result<Vec<Url>, Error>;
    /// Size of an actor's liked collection
    async fn actor_liked_count(&self, actor: &Url) -> Result<u64, Error>;
    /// Record an object in an actor's shared collection
    async fn add_actor_shared(&self, actor: &Url, object: &Url) -> Result<bool, Error>;
    /// Remove an object from an actor's shared collection
    async fn remove_actor_shared(&self, actor: &Url, object: &Url) -> Result<bool, Error>;
    /// Page of an actor's shared collection
    async fn actor_shared(&self, actor: &Url, limit: u64, offset: u64) -> Result<Vec<Url>, Error>;
    /// Size of an actor's shared collection
    async fn actor_shared_count(&self, actor: &Url) -> Result<u64, Error>;
}

/// Follower and following edges, pending follow requests and block edges.
/// Each side of a follow records its half independently and is authoritative
/// for that half.
#[async_trait]
pub trait FollowStore: Send + Sync {
    /// Add to a local actor's followers. Idempotent.
    async fn add_follower(&self, username: &str, remote: &Url) -> Result<bool, Error>;
    /// Remove from a local actor's followers
    async fn remove_follower(&self, username: &str, remote: &Url) -> Result<bool, Error>;
    /// All followers of a local actor, in insertion order
    async fn followers(&self, username: &str) -> Result<Vec<Url>, Error>;
    /// Number of followers
    async fn follower_count(&self, username: &str) -> Result<u64, Error>;
    /// Whether the remote actor follows the local one
    async fn is_follower(&self, username: &str, remote: &Url) -> Result<bool, Error>;
    /// Add to a local actor's following set. Idempotent.
    async fn add_following(&self, username: &str, remote: &Url) -> Result<bool, Error>;
    /// Remove from a local actor's following set
    async fn remove_following(&self, username: &str, remote: &Url) -> Result<bool, Error>;
    /// Everyone a local actor follows, in insertion order
    async fn following(&self, username: &str) -> Result<Vec<Url>, Error>;
    /// Size of the following set
    async fn following_count(&self, username: &str) -> Result<u64, Error>;
    /// Whether the local actor follows the remote one
    async fn is_following(&self, username: &str, remote: &Url) -> Result<bool, Error>;
    /// Store a follow awaiting manual approval
    async fn add_pending_follow(&self, username: &str, follow: Activity) -> Result<(), Error>;
    /// Remove and return a pending follow by its activity id
    async fn take_pending_follow(
        &self,
        username: &str,
        follow_id: &Url,
    ) -> Result<Option<Activity>, Error>;
    /// Pending follows of a local actor
    async fn pending_follows(&self, username: &str) -> Result<Vec<Activity>, Error>;
    /// Record that `blocker` blocks `blocked`. Idempotent.
    async fn add_block(&self, blocker: &Url, blocked: &Url) -> Result<bool, Error>;
    /// Remove a block edge
    async fn remove_block(&self, blocker: &Url, blocked: &Url) -> Result<bool, Error>;
    /// Whether a block edge exists
    async fn is_blocked(&self, blocker: &Url, blocked: &Url) -> Result<bool, Error>;
}

/// Delivery queue persistence. [DeliveryStore::claim_due] is the single
/// operation which must be atomic; implementations back it with a
/// compare-and-set or a transaction.
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    /// Insert a new pending item
    async fn enqueue(&self, item: DeliveryItem) -> Result<(), Error>;
    /// Atomically select up to `batch` items with status Pending or Failed
    /// and `next_attempt_at <= now`, ordered by `next_attempt_at` then
    /// `created_at`, transitioning each to Processing. Two concurrent workers
    /// never receive the same item.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        batch: usize,
    ) -> Result<Vec<DeliveryItem>, Error>;
    /// Write back an item after an attempt
    async fn update(&self, item: DeliveryItem) -> Result<(), Error>;
    /// Look up an item by id
    async fn get(&self, id: Uuid) -> Result<Option<DeliveryItem>, Error>;
    /// All items created for one activity, for introspection
    async fn items_for_activity(&self, activity_id: &Url) -> Result<Vec<DeliveryItem>, Error>;
    /// Remove Delivered and Dead items completed before the cutoff,
    /// returning how many were removed
    async fn purge_completed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, Error>;
}

/// Custom collection definitions and manual membership
#[async_trait]
pub trait CollectionStore: Send + Sync {
    /// Insert or replace a definition
    async fn save_definition(
        &self,
        username: &str,
        definition: CollectionDefinition,
    ) -> Result<(), Error>;
    /// Look up a definition by slug
    async fn definition(
        &self,
        username: &str,
        slug: &str,
    ) -> Result<Option<CollectionDefinition>, Error>;
    /// All definitions of a local actor
    async fn definitions(&self, username: &str) -> Result<Vec<CollectionDefinition>, Error>;
    /// Remove a definition and its membership
    async fn delete_definition(&self, username: &str, slug: &str) -> Result<(), Error>;
    /// Append an object to a manual collection. Idempotent.
    async fn add_item(&self, username: &str, slug: &str, object: &Url) -> Result<bool, Error>;
    /// Remove an object from a manual collection
    async fn remove_item(&self, username: &str, slug: &str, object: &Url) -> Result<bool, Error>;
    /// Members of a manual collection, in insertion order
    async fn items(&self, username: &str, slug: &str) -> Result<Vec<Url>, Error>;
    /// Whether an object is a member
    async fn contains(&self, username: &str, slug: &str, object: &Url) -> Result<bool, Error>;
}

/// Media blob persistence. Only the URL contract matters to the core: blobs
/// are addressed as `{base}/users/{username}/media/{id}`.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store a blob
    async fn store(
        &self,
        username: &str,
        id: &str,
        media_type: &str,
        data: Vec<u8>,
    ) -> Result<(), Error>;
    /// Fetch a blob
    async fn get(&self, username: &str, id: &str) -> Result<Option<Blob>, Error>;
    /// Whether a blob exists
    async fn exists(&self, username: &str, id: &str) -> Result<bool, Error>;
    /// Remove a blob
    async fn delete(&self, username: &str, id: &str) -> Result<bool, Error>;
    /// Canonical URL of a blob
    fn url(&self, username: &str, id: &str) -> Result<Url, Error>;
    /// Reverse of [BlobStore::url]: the `(username, id)` a local blob URL
    /// refers to, or None for foreign URLs
    fn parse_url(&self, url: &Url) -> Option<(String, String)>;
}

/// Bundle of all repositories, cloned freely into handlers
#[derive(Clone)]
pub struct Stores {
    /// Actor persistence
    pub actors: Arc<dyn ActorStore>,
    /// Activity and object persistence
    pub activities: Arc<dyn ActivityStore>,
    /// Follow, pending-follow and block edges
    pub follows: Arc<dyn FollowStore>,
    /// Delivery queue
    pub delivery: Arc<dyn DeliveryStore>,
    /// Custom collections
    pub collections: Arc<dyn CollectionStore>,
    /// Media blobs
    pub blobs: Arc<dyn BlobStore>,
}

impl Stores {
    /// In-memory repositories for tests and demos. Blob URLs are derived
    /// from `base_url`.
    pub fn in_memory(base_url: Url) -> Stores {
        Stores {
            actors: Arc::new(memory::InMemoryActorStore::default()),
            activities: Arc::new(memory::InMemoryActivityStore::default()),
            follows: Arc::new(memory::InMemoryFollowStore::default()),
            delivery: Arc::new(memory::InMemoryDeliveryStore::default()),
            collections: Arc::new(memory::InMemoryCollectionStore::default()),
            blobs: Arc::new(memory::InMemoryBlobStore::new(base_url)),
        }
    }
}
