//! Paged collection documents
//!
//! The write side always emits `OrderedCollection` wrappers and
//! `OrderedCollectionPage`s. The read side uses [CollectionDocument], a
//! deliberately tolerant view: remote servers disagree on `orderedItems`
//! versus `items`, send single objects where arrays are expected, and embed
//! the first page instead of linking it.

use crate::{
    kinds::collection::{OrderedCollectionPageType, OrderedCollectionType},
    protocol::{activity::IdOrObject, helpers::deserialize_one_or_many_opt},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

/// Collection wrapper returned for page 0 of a paginated read
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderedCollection {
    /// Collection URI
    pub id: Url,
    #[serde(rename = "type")]
    pub(crate) kind: OrderedCollectionType,
    /// Number of items across all pages
    pub total_items: u64,
    /// URI of the first page
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first: Option<Url>,
}

impl OrderedCollection {
    /// Wrapper for a collection with `total_items` entries. The first-page
    /// link is included only when the collection is non-empty.
    pub fn new(id: Url, total_items: u64) -> Self {
        let first = (total_items > 0).then(|| {
            let mut first = id.clone();
            first.set_query(Some("page=1"));
            first
        });
        OrderedCollection {
            id,
            kind: OrderedCollectionType::OrderedCollection,
            total_items,
            first,
        }
    }
}

/// One page of an ordered collection
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderedCollectionPage {
    /// Page URI
    pub id: Url,
    #[serde(rename = "type")]
    pub(crate) kind: OrderedCollectionPageType,
    /// The collection this page belongs to
    pub part_of: Url,
    /// Items on this page
    pub ordered_items: Vec<Value>,
    /// URI of the following page, absent on the last one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<Url>,
    /// URI of the preceding page, absent on the first one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev: Option<Url>,
}

impl OrderedCollectionPage {
    /// Builds page `page` (1-based) of `collection`, linking neighbours based
    /// on `has_more`.
    pub fn new(collection: Url, page: u64, items: Vec<Value>, has_more: bool) -> Self {
        let page_url = |n: u64| {
            let mut url = collection.clone();
            url.set_query(Some(&format!("page={}", n)));
            url
        };
        OrderedCollectionPage {
            id: page_url(page),
            kind: OrderedCollectionPageType::OrderedCollectionPage,
            part_of: collection.clone(),
            ordered_items: items,
            next: has_more.then(|| page_url(page + 1)),
            prev: (page > 1).then(|| page_url(page - 1)),
        }
    }
}

/// Tolerant read-side view of a collection or collection page
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionDocument {
    /// Collection or page URI
    pub id: Option<Url>,
    /// Items under the `orderedItems` key
    #[serde(default, deserialize_with = "deserialize_one_or_many_opt")]
    pub ordered_items: Option<Vec<Value>>,
    /// Items under the `items` key
    #[serde(default, deserialize_with = "deserialize_one_or_many_opt")]
    pub items: Option<Vec<Value>>,
    /// First page, linked or embedded
    pub first: Option<IdOrObject>,
    /// Next page; absence terminates a walk
    pub next: Option<Url>,
    /// Previous page
    pub prev: Option<Url>,
    /// Declared total size
    pub total_items: Option<u64>,
}

impl CollectionDocument {
    /// Items of this document, from whichever key is present
    pub fn into_items(self) -> Option<Vec<Value>> {
        self.ordered_items.or(self.items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_links_are_consistent() {
        let collection = Url::parse("https://example.com/users/alice/outbox").unwrap();
        let page = OrderedCollectionPage::new(collection.clone(), 2, vec![], true);
        assert_eq!(page.part_of, collection);
        assert_eq!(page.next.unwrap().query(), Some("page=3"));
        assert_eq!(page.prev.unwrap().query(), Some("page=1"));

        let last = OrderedCollectionPage::new(collection, 1, vec![], false);
        assert!(last.next.is_none());
        assert!(last.prev.is_none());
    }

    #[test]
    fn empty_collection_has_no_first_link() {
        let id = Url::parse("https://example.com/users/alice/followers").unwrap();
        assert!(OrderedCollection::new(id.clone(), 0).first.is_none());
        assert!(OrderedCollection::new(id, 3).first.is_some());
    }

    #[test]
    fn tolerant_reader_accepts_items_and_ordered_items() {
        let with_items: CollectionDocument =
            serde_json::from_str(r#"{"items": [{"a": 1}, {"b": 2}]}"#).unwrap();
        assert_eq!(with_items.into_items().unwrap().len(), 2);

        let with_ordered: CollectionDocument =
            serde_json::from_str(r#"{"orderedItems": {"only": "one"}}"#).unwrap();
        assert_eq!(with_ordered.into_items().unwrap().len(), 1);

        let embedded_first: CollectionDocument = serde_json::from_str(
            r#"{"first": {"type": "OrderedCollectionPage", "orderedItems": []}}"#,
        )
        .unwrap();
        assert!(embedded_first.first.unwrap().as_value().is_some());
    }
}
