//! Actor documents and the signing keys they publish

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

/// Fragment under which actors conventionally publish their signing key
pub const MAIN_KEY_FRAGMENT: &str = "main-key";

/// The key id expected for an actor which publishes no explicit one: the
/// actor URI with a [MAIN_KEY_FRAGMENT] fragment attached.
pub fn key_id_for(actor: &Url) -> String {
    let mut id = actor.clone();
    id.set_fragment(Some(MAIN_KEY_FRAGMENT));
    id.into()
}

/// A signing key as it is federated inside an actor document.
///
/// Verifiers resolve the `id` by stripping its fragment and fetching the
/// remaining actor URI, so the id must live under the owner.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKey {
    /// Key id carried in `Signature` headers
    pub id: String,
    /// The actor this key signs for
    pub owner: Url,
    /// PEM-encoded key material
    pub public_key_pem: String,
}

impl PublicKey {
    /// Publish `public_key_pem` as `owner`'s key at the conventional
    /// `#main-key` id.
    pub fn for_owner(owner: Url, public_key_pem: String) -> Self {
        PublicKey {
            id: key_id_for(&owner),
            owner,
            public_key_pem,
        }
    }
}

/// Tag identifying the kind of an actor
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorKind {
    /// A person
    Person,
    /// An automated application
    Application,
    /// A service, used for server-owned system actors
    Service,
    /// A group
    Group,
    /// An organization
    Organization,
    /// Any other actor type
    #[serde(untagged)]
    Other(String),
}

/// Endpoint URIs published by an actor
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoints {
    /// Shared inbox of the actor's server, preferred for multi-recipient
    /// delivery
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared_inbox: Option<Url>,
}

/// An identifiable participant as it appears on the wire
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApActor {
    /// Globally unique actor URI
    pub id: Url,
    /// The type tag
    #[serde(rename = "type")]
    pub kind: ActorKind,
    /// Username, unique within the host
    pub preferred_username: String,
    /// Display name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Profile summary
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Where activities for this actor are delivered
    pub inbox: Url,
    /// The actor's activity feed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outbox: Option<Url>,
    /// Collection of actors following this one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub followers: Option<Url>,
    /// Collection of actors this one follows
    #[serde(skip_serializing_if = "Option::is_none")]
    pub following: Option<Url>,
    /// Collection of objects this actor liked
    #[serde(skip_serializing_if = "Option::is_none")]
    pub liked: Option<Url>,
    /// Collection of objects this actor announced
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared: Option<Url>,
    /// Additional endpoints, such as the shared inbox
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<Endpoints>,
    /// Public key for verifying this actor's HTTP signatures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<PublicKey>,
    /// Whether follows require an explicit Accept
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manually_approves_followers: Option<bool>,
    /// Private key in PEM format. Only ever serialized towards the holder of
    /// the admin token; never federated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key_pem: Option<String>,
    /// Creation timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<DateTime<Utc>>,
    /// Any other fields, preserved verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ApActor {
    /// Returns shared inbox if it exists, normal inbox otherwise.
    pub fn shared_inbox_or_inbox(&self) -> Url {
        self.endpoints
            .as_ref()
            .and_then(|e| e.shared_inbox.clone())
            .unwrap_or_else(|| self.inbox.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actor_document_parses_with_key() {
        let json = r#"{
            "id": "https://example.com/users/alice",
            "type": "Person",
            "preferredUsername": "alice",
            "inbox": "https://example.com/users/alice/inbox",
            "endpoints": {"sharedInbox": "https://example.com/inbox"},
            "publicKey": {
                "id": "https://example.com/users/alice#main-key",
                "owner": "https://example.com/users/alice",
                "publicKeyPem": "-----BEGIN PUBLIC KEY-----..."
            },
            "manuallyApprovesFollowers": false
        }"#;
        let actor: ApActor = serde_json::from_str(json).unwrap();
        assert_eq!(actor.preferred_username, "alice");
        assert_eq!(
            actor.shared_inbox_or_inbox().as_str(),
            "https://example.com/inbox"
        );
        assert_eq!(
            actor.public_key.unwrap().id,
            "https://example.com/users/alice#main-key"
        );
    }

    #[test]
    fn key_id_lives_under_the_owner() {
        let owner = Url::parse("https://example.com/users/alice").unwrap();
        let key = PublicKey::for_owner(owner.clone(), "pem".to_string());
        assert_eq!(key.id, "https://example.com/users/alice#main-key");
        assert_eq!(key.owner, owner);

        // deriving twice is stable, and existing fragments are replaced
        let odd = Url::parse("https://example.com/users/alice#other").unwrap();
        assert_eq!(key_id_for(&odd), key_id_for(&owner));
    }

    #[test]
    fn private_key_is_not_serialized_when_absent() {
        let json = r#"{
            "id": "https://example.com/users/alice",
            "type": "Person",
            "preferredUsername": "alice",
            "inbox": "https://example.com/users/alice/inbox"
        }"#;
        let actor: ApActor = serde_json::from_str(json).unwrap();
        let out = serde_json::to_value(&actor).unwrap();
        assert!(out.get("privateKeyPem").is_none());
    }
}
