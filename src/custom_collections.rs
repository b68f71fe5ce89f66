//! User-defined curated and query-derived collections
//!
//! A definition is either Manual, a set of object URIs the owner appends to
//! explicitly, or Query, a read-only live view computed by filtering the
//! owner's objects. Visibility gates reads: Private collections are only
//! readable by the owner or admin, Unlisted ones are fetchable by direct URL
//! but absent from the catalog.

use crate::{
    config::FederationConfig,
    error::Error,
    protocol::object::ApObject,
    storage::Stores,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// Names which can never be used as collection slugs because they collide
/// with actor sub-resources
pub const RESERVED_SLUGS: [&str; 9] = [
    "inbox",
    "outbox",
    "followers",
    "following",
    "liked",
    "shares",
    "shared",
    "collections",
    "endpoints",
];

/// Validate a collection slug: lowercase alphanumeric plus `_-`, at most 64
/// characters, not a reserved name.
pub fn validate_slug(slug: &str) -> Result<(), Error> {
    let well_formed = !slug.is_empty()
        && slug.len() <= 64
        && slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if !well_formed || RESERVED_SLUGS.contains(&slug) {
        return Err(Error::InvalidSlug(slug.to_string()));
    }
    Ok(())
}

/// Whether a collection's membership is curated or computed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectionKind {
    /// Curated: the owner appends and removes items
    Manual,
    /// Computed: membership is a filter over the owner's objects
    Query,
}

/// Who may read a collection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectionVisibility {
    /// Listed in the catalog and world-readable
    Public,
    /// Fetchable by direct URL but absent from the catalog
    Unlisted,
    /// Readable only with the admin token
    Private,
}

/// Ordering of a collection's items
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectionSort {
    /// By object publication time, newest first
    Chronological,
    /// By insertion order
    Manual,
}

/// Filter evaluated by Query collections. Set predicates AND together.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryFilter {
    /// Match objects carrying at least one of these tag names
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Match objects of one of these types
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub object_types: Vec<String>,
    /// Match objects with or without attachments
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_attachment: Option<bool>,
    /// Match replies or top-level objects
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_reply: Option<bool>,
    /// Match objects published at or after this instant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after_date: Option<DateTime<Utc>>,
}

impl QueryFilter {
    /// Whether the object satisfies every set predicate
    pub fn matches(&self, object: &ApObject) -> bool {
        if !self.tags.is_empty() {
            let found = object
                .tag_names()
                .any(|name| self.tags.iter().any(|t| t == name));
            if !found {
                return false;
            }
        }
        if !self.object_types.is_empty()
            && !self.object_types.iter().any(|t| t == object.kind.as_str())
        {
            return false;
        }
        if let Some(has_attachment) = self.has_attachment {
            if object.has_attachment() != has_attachment {
                return false;
            }
        }
        if let Some(is_reply) = self.is_reply {
            if object.is_reply() != is_reply {
                return false;
            }
        }
        if let Some(after) = self.after_date {
            match object.published {
                Some(published) if published >= after => {}
                _ => return false,
            }
        }
        true
    }
}

/// A user-defined curated or query-derived stream
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionDefinition {
    /// URL-safe identifier, unique per actor
    pub slug: String,
    /// Display name
    pub name: String,
    /// Description shown in the catalog
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Manual or Query
    pub kind: CollectionKind,
    /// Read gating
    pub visibility: CollectionVisibility,
    /// Item ordering
    pub sort: CollectionSort,
    /// Cap on the number of items served
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_items: Option<usize>,
    /// Membership filter; required for Query, forbidden for Manual
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<QueryFilter>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl CollectionDefinition {
    /// Check the slug and the kind/filter invariants
    pub fn validate(&self) -> Result<(), Error> {
        validate_slug(&self.slug)?;
        match (self.kind, &self.filter) {
            (CollectionKind::Manual, Some(_)) => Err(Error::CollectionDefinitionInvalid(
                "manual collections must not have a filter",
            )),
            (CollectionKind::Query, None) => Err(Error::CollectionDefinitionInvalid(
                "query collections must have a filter",
            )),
            _ => Ok(()),
        }
    }
}

/// URI of a custom collection
pub fn collection_uri(
    config: &FederationConfig,
    username: &str,
    slug: &str,
) -> Result<Url, Error> {
    Ok(config
        .base_url()
        .join(&format!("users/{}/collections/{}", username, slug))?)
}

/// Reverse of [collection_uri]: the `(username, slug)` a local collection URI
/// refers to, or None for foreign URIs
pub fn parse_collection_uri(config: &FederationConfig, uri: &Url) -> Option<(String, String)> {
    if !config.is_local_url(uri) {
        return None;
    }
    let segments: Vec<&str> = uri.path_segments()?.collect();
    match segments.as_slice() {
        ["users", username, "collections", slug] => {
            Some((username.to_string(), slug.to_string()))
        }
        _ => None,
    }
}

/// Read-side evaluation of custom collections
pub struct CollectionReader<'a> {
    stores: &'a Stores,
}

impl<'a> CollectionReader<'a> {
    /// A reader over the given repositories
    pub fn new(stores: &'a Stores) -> Self {
        CollectionReader { stores }
    }

    /// The full member list of a collection, ordered per its definition and
    /// capped at `max_items`.
    pub async fn items(
        &self,
        username: &str,
        definition: &CollectionDefinition,
        owner: &Url,
    ) -> Result<Vec<Url>, Error> {
        let mut items = match definition.kind {
            CollectionKind::Manual => {
                let members = self
                    .stores
                    .collections
                    .items(username, &definition.slug)
                    .await?;
                match definition.sort {
                    CollectionSort::Manual => members,
                    CollectionSort::Chronological => {
                        let mut dated = Vec::with_capacity(members.len());
                        for uri in members {
                            let published = self
                                .stores
                                .activities
                                .object(&uri)
                                .await?
                                .and_then(|o| o.published);
                            dated.push((published, uri));
                        }
                        dated.sort_by(|a, b| b.0.cmp(&a.0));
                        dated.into_iter().map(|(_, uri)| uri).collect()
                    }
                }
            }
            CollectionKind::Query => {
                let filter = definition.filter.clone().unwrap_or_default();
                self.stores
                    .activities
                    .objects_by_actor(owner)
                    .await?
                    .into_iter()
                    .filter(|object| filter.matches(object))
                    .filter_map(|object| object.id)
                    .collect()
            }
        };
        if let Some(max) = definition.max_items {
            items.truncate(max);
        }
        Ok(items)
    }
}
