//! Activity documents and the tagged activity type
//!
//! Activities are kept close to their wire form: a tagged `type`, typed
//! accessors for the fields the state machine dispatches on, and a flattened
//! remainder so that unknown extensions survive storage and redelivery
//! byte-for-byte.

use crate::{error::Error, protocol::helpers::deserialize_one_or_many};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::{Display, Formatter};
use url::Url;

/// Tag identifying what an activity does.
///
/// Unknown tags are preserved in [ActivityKind::Other]: such activities are
/// accepted, stored and delivered but have no side effect.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivityKind {
    /// Wraps a newly published object
    Create,
    /// Replaces an object or actor owned by the sender
    Update,
    /// Tombstones an object owned by the sender
    Delete,
    /// Requests to follow an actor
    Follow,
    /// Confirms an earlier activity, typically a Follow
    Accept,
    /// Tentatively confirms an earlier activity
    TentativeAccept,
    /// Declines an earlier activity, typically a Follow
    Reject,
    /// Reverts an earlier activity by the same actor
    Undo,
    /// Records appreciation of an object
    Like,
    /// Boosts an object to the sender's audience
    Announce,
    /// Adds an object to a collection
    Add,
    /// Removes an object from a collection
    Remove,
    /// Records a unidirectional block edge
    Block,
    /// Any other activity type
    #[serde(untagged)]
    Other(String),
}

impl ActivityKind {
    /// The type tag as it appears on the wire
    pub fn as_str(&self) -> &str {
        match self {
            ActivityKind::Create => "Create",
            ActivityKind::Update => "Update",
            ActivityKind::Delete => "Delete",
            ActivityKind::Follow => "Follow",
            ActivityKind::Accept => "Accept",
            ActivityKind::TentativeAccept => "TentativeAccept",
            ActivityKind::Reject => "Reject",
            ActivityKind::Undo => "Undo",
            ActivityKind::Like => "Like",
            ActivityKind::Announce => "Announce",
            ActivityKind::Add => "Add",
            ActivityKind::Remove => "Remove",
            ActivityKind::Block => "Block",
            ActivityKind::Other(other) => other,
        }
    }
}

impl Display for ActivityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An object reference which is either a bare URI or an embedded document
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IdOrObject {
    /// Reference by URI
    Id(Url),
    /// Embedded document
    Object(Box<Value>),
}

impl IdOrObject {
    /// The id of the referenced object, from the URI itself or the embedded
    /// document's `id` field
    pub fn id(&self) -> Option<Url> {
        match self {
            IdOrObject::Id(url) => Some(url.clone()),
            IdOrObject::Object(value) => value
                .get("id")
                .and_then(Value::as_str)
                .and_then(|s| Url::parse(s).ok()),
        }
    }

    /// The embedded document, if the reference is not a bare URI
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            IdOrObject::Id(_) => None,
            IdOrObject::Object(value) => Some(value),
        }
    }
}

impl From<Url> for IdOrObject {
    fn from(url: Url) -> Self {
        IdOrObject::Id(url)
    }
}

/// A verb object performed by an actor on an object, with optional addressing
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    /// Activity URI; absent only on client submissions before the server
    /// assigns one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Url>,
    /// The type tag
    #[serde(rename = "type")]
    pub kind: ActivityKind,
    /// The actor performing the activity
    pub actor: Url,
    /// The object acted upon, by URI or embedded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<IdOrObject>,
    /// Target of the activity, such as the collection of an Add
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<Url>,
    /// Primary recipients
    #[serde(default, deserialize_with = "deserialize_one_or_many")]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<Url>,
    /// Carbon-copy recipients
    #[serde(default, deserialize_with = "deserialize_one_or_many")]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<Url>,
    /// Blind-copy recipients, stripped before delivery
    #[serde(default, deserialize_with = "deserialize_one_or_many")]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub bcc: Vec<Url>,
    /// Audience collections
    #[serde(default, deserialize_with = "deserialize_one_or_many")]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub audience: Vec<Url>,
    /// Publication timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<DateTime<Utc>>,
    /// Any other fields, preserved verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Activity {
    /// The activity id, failing when the server has not assigned one yet
    pub fn require_id(&self) -> Result<&Url, Error> {
        self.id
            .as_ref()
            .ok_or_else(|| Error::other(anyhow::anyhow!("activity has no id")))
    }

    /// Id of the object acted upon, if any
    pub fn object_id(&self) -> Option<Url> {
        self.object.as_ref().and_then(IdOrObject::id)
    }

    /// The embedded object document, if the object is not a bare URI
    pub fn embedded_object(&self) -> Option<&Value> {
        self.object.as_ref().and_then(IdOrObject::as_value)
    }

    /// The embedded object parsed as an activity, for Undo/Accept/Reject
    /// whose object is itself an activity
    pub fn embedded_activity(&self) -> Option<Activity> {
        let value = self.embedded_object()?;
        serde_json::from_value(value.clone()).ok()
    }

    /// Union of `to`, `cc` and `bcc`, the recipient lists considered by the
    /// shared inbox
    pub fn recipients(&self) -> impl Iterator<Item = &Url> {
        self.to.iter().chain(self.cc.iter()).chain(self.bcc.iter())
    }

    /// Union of all addressing lists, including `audience`, considered when
    /// expanding outbox delivery targets
    pub fn addressed(&self) -> impl Iterator<Item = &Url> {
        self.recipients().chain(self.audience.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_type_round_trips() {
        let json = r#"{"id":"https://example.com/a/1","type":"Arrive","actor":"https://example.com/users/alice"}"#;
        let activity: Activity = serde_json::from_str(json).unwrap();
        assert_eq!(activity.kind, ActivityKind::Other("Arrive".to_string()));
        let out = serde_json::to_value(&activity).unwrap();
        assert_eq!(out["type"], "Arrive");
    }

    #[test]
    fn single_recipient_becomes_list() {
        let json = r#"{
            "id": "https://example.com/a/1",
            "type": "Create",
            "actor": "https://example.com/users/alice",
            "to": "https://www.w3.org/ns/activitystreams#Public"
        }"#;
        let activity: Activity = serde_json::from_str(json).unwrap();
        assert_eq!(activity.to.len(), 1);
    }

    #[test]
    fn embedded_object_id_is_extracted() {
        let json = r#"{
            "id": "https://example.com/a/1",
            "type": "Create",
            "actor": "https://example.com/users/alice",
            "object": {"id": "https://example.com/o/1", "type": "Note", "content": "hi"}
        }"#;
        let activity: Activity = serde_json::from_str(json).unwrap();
        assert_eq!(
            activity.object_id().unwrap().as_str(),
            "https://example.com/o/1"
        );
        assert!(activity.embedded_object().is_some());
    }

    #[test]
    fn extra_fields_survive() {
        let json = r#"{
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": "https://example.com/a/1",
            "type": "Like",
            "actor": "https://example.com/users/alice",
            "object": "https://example.com/o/1"
        }"#;
        let activity: Activity = serde_json::from_str(json).unwrap();
        let out = serde_json::to_value(&activity).unwrap();
        assert_eq!(out["@context"], "https://www.w3.org/ns/activitystreams");
    }
}
