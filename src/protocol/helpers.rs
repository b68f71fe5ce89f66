//! Deserialization helpers for the loosely shaped JSON remote servers send
//!
//! ActivityStreams lets most plural fields carry a bare value instead of an
//! array, and real servers use both forms freely. These adapters normalize
//! at parse time so the rest of the crate only ever sees vectors.

use serde::{de::DeserializeOwned, Deserialize, Deserializer};
use serde_json::Value;

/// Accept either a JSON array or a single bare value for a list field.
///
/// Pair it with `#[serde(default)]` so an absent field parses as an empty
/// list.
///
/// ```
/// # use rookery::protocol::helpers::deserialize_one_or_many;
/// # use url::Url;
/// #[derive(serde::Deserialize)]
/// struct Addressing {
///     #[serde(default, deserialize_with = "deserialize_one_or_many")]
///     cc: Vec<Url>,
/// }
///
/// let bare: Addressing =
///     serde_json::from_str(r#"{"cc": "https://a.test/users/alice/followers"}"#)?;
/// assert_eq!(bare.cc.len(), 1);
///
/// let listed: Addressing = serde_json::from_str(
///     r#"{"cc": ["https://a.test/users/alice/followers", "https://b.test/users/bob"]}"#,
/// )?;
/// assert_eq!(listed.cc.len(), 2);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn deserialize_one_or_many<'de, T, D>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    T: DeserializeOwned,
    D: Deserializer<'de>,
{
    collect_entries(Value::deserialize(deserializer)?)
}

/// Like [deserialize_one_or_many], but keeps the absent/present distinction
/// instead of folding a missing field into an empty list. Collection
/// documents need this to tell "no items key" apart from "zero items".
pub fn deserialize_one_or_many_opt<'de, T, D>(
    deserializer: D,
) -> Result<Option<Vec<T>>, D::Error>
where
    T: DeserializeOwned,
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        Some(value) => collect_entries(value).map(Some),
        None => Ok(None),
    }
}

fn collect_entries<T, E>(value: Value) -> Result<Vec<T>, E>
where
    T: DeserializeOwned,
    E: serde::de::Error,
{
    let entries = match value {
        Value::Array(entries) => entries,
        bare => vec![bare],
    };
    entries
        .into_iter()
        .map(|entry| serde_json::from_value(entry).map_err(E::custom))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    #[derive(serde::Deserialize)]
    struct Page {
        #[serde(default, deserialize_with = "deserialize_one_or_many_opt")]
        ordered_items: Option<Vec<Url>>,
    }

    #[test]
    fn opt_distinguishes_absent_from_single() {
        let absent: Page = serde_json::from_str("{}").unwrap();
        assert!(absent.ordered_items.is_none());

        let single: Page =
            serde_json::from_str(r#"{"ordered_items": "https://example.com/1"}"#).unwrap();
        assert_eq!(single.ordered_items.unwrap().len(), 1);

        let empty: Page = serde_json::from_str(r#"{"ordered_items": []}"#).unwrap();
        assert_eq!(empty.ordered_items.unwrap().len(), 0);
    }

    #[test]
    fn bad_entries_fail_the_whole_field() {
        let result = serde_json::from_str::<Page>(
            r#"{"ordered_items": ["https://example.com/1", "not a url"]}"#,
        );
        assert!(result.is_err());
    }
}
