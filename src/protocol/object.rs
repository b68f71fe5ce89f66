//! Content object documents: notes, documents, tombstones

use crate::protocol::helpers::deserialize_one_or_many;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

/// Tag identifying the kind of a content object
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    /// Short text object
    Note,
    /// Long-form text object
    Article,
    /// An image
    Image,
    /// A video
    Video,
    /// A generic document, used for attachments
    Document,
    /// A single page
    Page,
    /// A deleted object
    Tombstone,
    /// Any other object type
    #[serde(untagged)]
    Other(String),
}

impl ObjectKind {
    /// The type tag as it appears on the wire
    pub fn as_str(&self) -> &str {
        match self {
            ObjectKind::Note => "Note",
            ObjectKind::Article => "Article",
            ObjectKind::Image => "Image",
            ObjectKind::Video => "Video",
            ObjectKind::Document => "Document",
            ObjectKind::Page => "Page",
            ObjectKind::Tombstone => "Tombstone",
            ObjectKind::Other(other) => other,
        }
    }
}

/// A content entity wrapped by Create, updated by Update and tombstoned by Delete
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApObject {
    /// Object URI; absent only on client submissions before the server
    /// assigns one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Url>,
    /// The type tag
    #[serde(rename = "type")]
    pub kind: ObjectKind,
    /// The author's actor URI
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributed_to: Option<Url>,
    /// Content, typically HTML
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Media type of the content or of the referenced document
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Display name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Short summary, also used as content warning
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Link to the object's canonical representation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<Url>,
    /// Attached media
    #[serde(default, deserialize_with = "deserialize_one_or_many")]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attachment: Vec<Attachment>,
    /// Mentions and hashtags
    #[serde(default, deserialize_with = "deserialize_one_or_many")]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tag: Vec<Tag>,
    /// URI of the object this one replies to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<Url>,
    /// Publication timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<DateTime<Utc>>,
    /// Primary recipients
    #[serde(default, deserialize_with = "deserialize_one_or_many")]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<Url>,
    /// Carbon-copy recipients
    #[serde(default, deserialize_with = "deserialize_one_or_many")]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<Url>,
    /// Any other fields, preserved verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ApObject {
    /// True if the object carries at least one attachment
    pub fn has_attachment(&self) -> bool {
        !self.attachment.is_empty()
    }

    /// True if the object replies to another one
    pub fn is_reply(&self) -> bool {
        self.in_reply_to.is_some()
    }

    /// Names of all tags, used by query collection filters
    pub fn tag_names(&self) -> impl Iterator<Item = &str> {
        self.tag.iter().filter_map(|t| t.name.as_deref())
    }
}

/// Attached media of an object
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    /// The type tag, typically Document or Image
    #[serde(rename = "type")]
    pub kind: ObjectKind,
    /// Where the media can be fetched
    pub url: Url,
    /// Media type of the referenced file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Display name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// The kind of a tag entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TagKind {
    /// Mention of another actor
    Mention,
    /// A hashtag
    Hashtag,
    /// Any other tag type
    #[serde(untagged)]
    Other(String),
}

/// A mention or hashtag attached to an object
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    /// The type tag
    #[serde(rename = "type")]
    pub kind: TagKind,
    /// The actor or tag page referenced
    #[serde(skip_serializing_if = "Option::is_none")]
    pub href: Option<Url>,
    /// Display name, `@user@host` for mentions and `#tag` for hashtags
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// For serving deleted objects
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tombstone {
    /// Id of the deleted object
    pub id: Url,
    #[serde(rename = "type")]
    pub(crate) kind: crate::kinds::object::TombstoneType,
    /// Type the object had before deletion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub former_type: Option<String>,
    /// When the object was deleted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted: Option<DateTime<Utc>>,
}

impl Tombstone {
    /// Create a new tombstone for the given object id
    pub fn new(id: Url) -> Tombstone {
        Tombstone {
            id,
            kind: crate::kinds::object::TombstoneType::Tombstone,
            former_type: None,
            deleted: Some(Utc::now()),
        }
    }
}
