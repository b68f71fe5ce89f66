//! Creating and verifying HTTP message signatures
//!
//! Implements the cavage draft profile used across the fediverse: a signing
//! string is built from an ordered list of header entries, signed with the
//! actor's RSA key, and carried in the `Signature` header. Verification
//! reconstructs the same string from the incoming request and additionally
//! checks the body digest on POSTs. Linked-data style signatures embedded in
//! an activity's `signature` property are handled at the bottom of the
//! module.

use crate::{
    crypto::{digest_sha256, sign, verify},
    error::Error,
};
use base64::{engine::general_purpose::STANDARD as Base64, Engine};
use http::Method;
use httpdate::fmt_http_date;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::BTreeMap, time::SystemTime};
use url::Url;

/// The only algorithm we sign with
pub const SIGNATURE_ALGORITHM: &str = "rsa-sha256";

/// Legacy alias treated identically to rsa-sha256 on receive
const LEGACY_ALGORITHM: &str = "hs2019";

/// Signature entries every inbox POST must cover
const REQUIRED_POST_ENTRIES: [&str; 4] = ["(request-target)", "host", "date", "digest"];

/// Headers computed while signing an outbound request. The caller adds them
/// to the request verbatim; they are covered by `signature`.
#[derive(Clone, Debug)]
pub struct SignedHeaders {
    /// `Host` header value, port included only when non-default
    pub host: String,
    /// `Date` header value, RFC 1123 GMT
    pub date: String,
    /// `Digest` header value, present when the request has a body
    pub digest: Option<String>,
    /// The `Signature` header value
    pub signature: String,
}

/// Sign an outbound request, returning the headers to attach.
///
/// `content_type` and `accept` are included in the signing string when given,
/// so they must be sent exactly as passed here.
pub fn sign_request(
    method: &Method,
    url: &Url,
    body: Option<&[u8]>,
    content_type: Option<&str>,
    accept: Option<&str>,
    key_id: &str,
    private_key_pem: &str,
) -> Result<SignedHeaders, Error> {
    let host = host_with_port(url)?;
    let date = fmt_http_date(SystemTime::now());
    let digest = body.map(|b| format!("SHA-256={}", digest_sha256(b)));

    let mut entries = vec![
        (
            "(request-target)".to_string(),
            format!(
                "{} {}",
                method.as_str().to_lowercase(),
                request_target(url)
            ),
        ),
        ("host".to_string(), host.clone()),
        ("date".to_string(), date.clone()),
    ];
    if let Some(content_type) = content_type {
        entries.push(("content-type".to_string(), content_type.to_string()));
    }
    if let Some(accept) = accept {
        entries.push(("accept".to_string(), accept.to_string()));
    }
    if let Some(digest) = &digest {
        entries.push(("digest".to_string(), digest.clone()));
    }

    let signing_string = build_signing_string(&entries);
    let signature_bytes = sign(private_key_pem, signing_string.as_bytes())?;
    let names = entries.iter().map(|(name, _)| name.as_str()).join(" ");
    let signature = format!(
        "keyId=\"{}\",algorithm=\"{}\",headers=\"{}\",signature=\"{}\"",
        key_id,
        SIGNATURE_ALGORITHM,
        names,
        Base64.encode(signature_bytes)
    );

    Ok(SignedHeaders {
        host,
        date,
        digest,
        signature,
    })
}

/// A parsed `Signature` header
#[derive(Clone, Debug)]
pub struct SignatureHeader {
    /// URL identifying the signing key, typically `<actor>#main-key`
    pub key_id: String,
    /// Declared algorithm, absent in some implementations
    pub algorithm: Option<String>,
    /// Names of the covered entries, in signing order
    pub headers: Vec<String>,
    /// The decoded signature bytes
    pub signature: Vec<u8>,
}

impl SignatureHeader {
    /// The signing actor's URI: the key id with its fragment stripped
    pub fn actor_uri(&self) -> Result<Url, Error> {
        let mut url = Url::parse(&self.key_id).map_err(|_| Error::SignatureHeaderInvalid)?;
        url.set_fragment(None);
        Ok(url)
    }
}

/// Parse a `Signature` header into its parameters.
///
/// Fails with [Error::SignatureHeaderInvalid] when `keyId`, `headers` or
/// `signature` is missing or the signature is not valid base64.
pub fn parse_signature_header(value: &str) -> Result<SignatureHeader, Error> {
    let mut params = BTreeMap::new();
    for part in value.split(',') {
        let mut iter = part.trim().splitn(2, '=');
        let (Some(name), Some(value)) = (iter.next(), iter.next()) else {
            continue;
        };
        params.insert(name.to_string(), value.trim_matches('"').to_string());
    }

    let key_id = params.remove("keyId").ok_or(Error::SignatureHeaderInvalid)?;
    let signature = params
        .remove("signature")
        .ok_or(Error::SignatureHeaderInvalid)?;
    let headers = params
        .remove("headers")
        .ok_or(Error::SignatureHeaderInvalid)?
        .split_whitespace()
        .map(str::to_lowercase)
        .collect();

    Ok(SignatureHeader {
        key_id,
        algorithm: params.remove("algorithm"),
        headers,
        signature: Base64
            .decode(signature)
            .map_err(|_| Error::SignatureHeaderInvalid)?,
    })
}

/// Verify the signature of an incoming request against `public_key_pem`.
///
/// `headers` must be keyed by lowercased header name. `body` is given for
/// POST requests; when the signature declares a `digest` entry, the body
/// hash is recomputed and compared independently of the signature check.
pub fn verify_request(
    headers: &BTreeMap<String, String>,
    method: &Method,
    path_and_query: &str,
    public_key_pem: &str,
    body: Option<&[u8]>,
    trust_forwarded_host: bool,
) -> Result<(), Error> {
    let header = parse_signature_header(
        headers
            .get("signature")
            .ok_or(Error::SignatureHeaderInvalid)?,
    )?;
    verify_parsed_request(
        &header,
        headers,
        method,
        path_and_query,
        public_key_pem,
        body,
        trust_forwarded_host,
    )
}

/// Like [verify_request], for callers which already parsed the `Signature`
/// header to resolve the signing key.
pub fn verify_parsed_request(
    header: &SignatureHeader,
    headers: &BTreeMap<String, String>,
    method: &Method,
    path_and_query: &str,
    public_key_pem: &str,
    body: Option<&[u8]>,
    trust_forwarded_host: bool,
) -> Result<(), Error> {
    if let Some(algorithm) = &header.algorithm {
        if algorithm != SIGNATURE_ALGORITHM && algorithm != LEGACY_ALGORITHM {
            return Err(Error::UnsupportedAlgorithm(algorithm.clone()));
        }
    }

    if *method == Method::POST {
        for required in REQUIRED_POST_ENTRIES {
            if !header.headers.iter().any(|h| h == required) {
                return Err(Error::SignatureHeaderInvalid);
            }
        }
    }

    let mut entries = Vec::with_capacity(header.headers.len());
    for name in &header.headers {
        let value = match name.as_str() {
            "(request-target)" => {
                format!("{} {}", method.as_str().to_lowercase(), path_and_query)
            }
            "host" => {
                let forwarded = trust_forwarded_host
                    .then(|| headers.get("x-forwarded-host"))
                    .flatten();
                forwarded
                    .or_else(|| headers.get("host"))
                    .ok_or_else(|| Error::MissingSignedHeader(name.clone()))?
                    .clone()
            }
            "(created)" => headers
                .get("created")
                .ok_or_else(|| Error::MissingSignedHeader(name.clone()))?
                .clone(),
            other => headers
                .get(other)
                .ok_or_else(|| Error::MissingSignedHeader(name.clone()))?
                .clone(),
        };
        entries.push((name.clone(), value));
    }

    let signing_string = build_signing_string(&entries);
    if !verify(public_key_pem, &header.signature, signing_string.as_bytes())? {
        return Err(Error::SignatureInvalid);
    }

    if header.headers.iter().any(|h| h == "digest") {
        verify_body_digest(headers.get("digest").map(String::as_str), body.unwrap_or(&[]))?;
    }

    Ok(())
}

/// Verify body of an inbox request against the hash provided in `Digest` header.
pub fn verify_body_digest(digest_header: Option<&str>, body: &[u8]) -> Result<(), Error> {
    let parts = digest_header
        .and_then(DigestPart::try_from_header)
        .ok_or(Error::BodyDigestInvalid)?;

    for part in parts {
        if digest_sha256(body) != part.digest {
            return Err(Error::BodyDigestInvalid);
        }
    }
    Ok(())
}

#[derive(Clone, Debug)]
struct DigestPart {
    /// We assume that SHA256 is used which is the case with all major fediverse platforms
    #[allow(dead_code)]
    pub algorithm: String,
    /// The hashsum
    pub digest: String,
}

impl DigestPart {
    fn try_from_header(h: &str) -> Option<Vec<DigestPart>> {
        let h = h.split(';').next()?;
        let v: Vec<_> = h
            .split(',')
            .filter_map(|p| {
                let mut iter = p.splitn(2, '=');
                iter.next()
                    .and_then(|alg| iter.next().map(|value| (alg, value)))
            })
            .map(|(alg, value)| DigestPart {
                algorithm: alg.to_owned(),
                digest: value.to_owned(),
            })
            .collect();

        if v.is_empty() {
            None
        } else {
            Some(v)
        }
    }
}

fn build_signing_string(entries: &[(String, String)]) -> String {
    entries
        .iter()
        .map(|(name, value)| format!("{}: {}", name, value))
        .join("\n")
}

fn request_target(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

fn host_with_port(url: &Url) -> Result<String, Error> {
    let host = url
        .host_str()
        .ok_or(Error::UrlVerification("Url must have a host"))?;
    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// A linked-data style signature embedded in an object's `signature` property
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LdSignature {
    /// Signature suite name
    #[serde(rename = "type")]
    pub kind: String,
    /// Key id of the creator's signing key
    pub creator: String,
    /// Creation timestamp of the signature
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    /// Base64 signature over the canonicalized document
    pub signature_value: String,
}

/// Sign `document` with an embedded linked-data signature.
///
/// The document is canonicalized with the `signature` field removed, sorted
/// keys and no whitespace, then signed via RSA-SHA256.
pub fn sign_object(
    document: &Value,
    creator_key_id: &str,
    private_key_pem: &str,
) -> Result<LdSignature, Error> {
    let canonical = canonical_document(document)?;
    let signature = sign(private_key_pem, canonical.as_bytes())?;
    Ok(LdSignature {
        kind: "RsaSignature2017".to_string(),
        creator: creator_key_id.to_string(),
        created: Some(chrono::Utc::now().to_rfc3339()),
        signature_value: Base64.encode(signature),
    })
}

/// Verify the embedded `signature` property of `document` against the
/// creator's public key. The caller resolves the key from
/// [LdSignature::creator] first, see [crate::keys::KeyResolver].
pub fn verify_object_signature(document: &Value, public_key_pem: &str) -> Result<(), Error> {
    let signature = document
        .get("signature")
        .cloned()
        .ok_or(Error::SignatureHeaderInvalid)?;
    let signature: LdSignature =
        serde_json::from_value(signature).map_err(|_| Error::SignatureHeaderInvalid)?;
    let signature_bytes = Base64
        .decode(&signature.signature_value)
        .map_err(|_| Error::SignatureHeaderInvalid)?;

    let canonical = canonical_document(document)?;
    if verify(public_key_pem, &signature_bytes, canonical.as_bytes())? {
        Ok(())
    } else {
        Err(Error::SignatureInvalid)
    }
}

/// Extract the embedded signature of a document, if any
pub fn embedded_signature(document: &Value) -> Option<LdSignature> {
    serde_json::from_value(document.get("signature")?.clone()).ok()
}

fn canonical_document(document: &Value) -> Result<String, Error> {
    let mut document = document.clone();
    if let Some(map) = document.as_object_mut() {
        map.remove("signature");
    }
    Ok(serde_json::to_string(&sort_keys(&document))?)
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = serde_json::Map::with_capacity(map.len());
            for key in keys {
                if let Some(inner) = map.get(key) {
                    sorted.insert(key.clone(), sort_keys(inner));
                }
            }
            Value::Object(sorted)
        }
        Value::Array(values) => Value::Array(values.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_actor_keypair;
    use serde_json::json;

    fn request_headers(signed: &SignedHeaders, content_type: Option<&str>) -> BTreeMap<String, String> {
        let mut headers = BTreeMap::new();
        headers.insert("host".to_string(), signed.host.clone());
        headers.insert("date".to_string(), signed.date.clone());
        headers.insert("signature".to_string(), signed.signature.clone());
        if let Some(digest) = &signed.digest {
            headers.insert("digest".to_string(), digest.clone());
        }
        if let Some(content_type) = content_type {
            headers.insert("content-type".to_string(), content_type.to_string());
        }
        headers
    }

    #[test]
    fn sign_then_verify_roundtrip() {
        let keypair = generate_actor_keypair().unwrap();
        let url = Url::parse("https://example.com/users/alice/inbox").unwrap();
        let body = br#"{"type":"Follow"}"#;

        let signed = sign_request(
            &Method::POST,
            &url,
            Some(body),
            Some("application/activity+json"),
            None,
            "https://example.com/users/bob#main-key",
            &keypair.private_key,
        )
        .unwrap();

        let headers = request_headers(&signed, Some("application/activity+json"));
        verify_request(
            &headers,
            &Method::POST,
            "/users/alice/inbox",
            &keypair.public_key,
            Some(body),
            false,
        )
        .unwrap();
    }

    #[test]
    fn tampered_body_fails_digest() {
        let keypair = generate_actor_keypair().unwrap();
        let url = Url::parse("https://example.com/users/alice/inbox").unwrap();

        let signed = sign_request(
            &Method::POST,
            &url,
            Some(b"original"),
            Some("application/activity+json"),
            None,
            "https://example.com/users/bob#main-key",
            &keypair.private_key,
        )
        .unwrap();

        let headers = request_headers(&signed, Some("application/activity+json"));
        let result = verify_request(
            &headers,
            &Method::POST,
            "/users/alice/inbox",
            &keypair.public_key,
            Some(b"tampered"),
            false,
        );
        assert_eq!(result, Err(Error::BodyDigestInvalid));
    }

    #[test]
    fn wrong_key_fails_verification() {
        let keypair = generate_actor_keypair().unwrap();
        let other = generate_actor_keypair().unwrap();
        let url = Url::parse("https://example.com/users/alice/inbox").unwrap();
        let body = b"{}";

        let signed = sign_request(
            &Method::POST,
            &url,
            Some(body.as_slice()),
            Some("application/activity+json"),
            None,
            "https://example.com/users/bob#main-key",
            &keypair.private_key,
        )
        .unwrap();

        let headers = request_headers(&signed, Some("application/activity+json"));
        let result = verify_request(
            &headers,
            &Method::POST,
            "/users/alice/inbox",
            &other.public_key,
            Some(body.as_slice()),
            false,
        );
        assert_eq!(result, Err(Error::SignatureInvalid));
    }

    #[test]
    fn hs2019_is_accepted_as_alias() {
        let keypair = generate_actor_keypair().unwrap();
        let url = Url::parse("https://example.com/users/alice/inbox").unwrap();
        let body = b"{}";

        let signed = sign_request(
            &Method::POST,
            &url,
            Some(body.as_slice()),
            Some("application/activity+json"),
            None,
            "https://example.com/users/bob#main-key",
            &keypair.private_key,
        )
        .unwrap();

        let mut headers = request_headers(&signed, Some("application/activity+json"));
        let aliased = signed
            .signature
            .replace("algorithm=\"rsa-sha256\"", "algorithm=\"hs2019\"");
        headers.insert("signature".to_string(), aliased);

        verify_request(
            &headers,
            &Method::POST,
            "/users/alice/inbox",
            &keypair.public_key,
            Some(body.as_slice()),
            false,
        )
        .unwrap();
    }

    #[test]
    fn unknown_algorithm_is_rejected() {
        let keypair = generate_actor_keypair().unwrap();
        let url = Url::parse("https://example.com/users/alice/inbox").unwrap();
        let body = b"{}";

        let signed = sign_request(
            &Method::POST,
            &url,
            Some(body.as_slice()),
            Some("application/activity+json"),
            None,
            "https://example.com/users/bob#main-key",
            &keypair.private_key,
        )
        .unwrap();

        let mut headers = request_headers(&signed, Some("application/activity+json"));
        let aliased = signed
            .signature
            .replace("algorithm=\"rsa-sha256\"", "algorithm=\"ed25519\"");
        headers.insert("signature".to_string(), aliased);

        let result = verify_request(
            &headers,
            &Method::POST,
            "/users/alice/inbox",
            &keypair.public_key,
            Some(body.as_slice()),
            false,
        );
        assert_eq!(
            result,
            Err(Error::UnsupportedAlgorithm("ed25519".to_string()))
        );
    }

    #[test]
    fn missing_declared_header_fails() {
        let keypair = generate_actor_keypair().unwrap();
        let url = Url::parse("https://example.com/users/alice/inbox").unwrap();
        let body = b"{}";

        let signed = sign_request(
            &Method::POST,
            &url,
            Some(body.as_slice()),
            Some("application/activity+json"),
            None,
            "https://example.com/users/bob#main-key",
            &keypair.private_key,
        )
        .unwrap();

        let mut headers = request_headers(&signed, Some("application/activity+json"));
        headers.remove("date");

        let result = verify_request(
            &headers,
            &Method::POST,
            "/users/alice/inbox",
            &keypair.public_key,
            Some(body.as_slice()),
            false,
        );
        assert_eq!(
            result,
            Err(Error::MissingSignedHeader("date".to_string()))
        );
    }

    #[test]
    fn signature_header_parsing() {
        let header = parse_signature_header(concat!(
            "keyId=\"https://example.com/users/alice#main-key\",",
            "algorithm=\"rsa-sha256\",",
            "headers=\"(request-target) host date digest\",",
            "signature=\"aGVsbG8=\""
        ))
        .unwrap();
        assert_eq!(header.key_id, "https://example.com/users/alice#main-key");
        assert_eq!(header.algorithm.as_deref(), Some("rsa-sha256"));
        assert_eq!(header.headers.len(), 4);
        assert_eq!(header.signature, b"hello");
        assert_eq!(
            header.actor_uri().unwrap().as_str(),
            "https://example.com/users/alice"
        );

        let missing = parse_signature_header("keyId=\"x\",signature=\"aGVsbG8=\"");
        assert_eq!(missing.unwrap_err(), Error::SignatureHeaderInvalid);
    }

    #[test]
    fn post_requires_minimum_coverage() {
        let keypair = generate_actor_keypair().unwrap();
        // A signature which only covers (request-target) and date must be
        // rejected on POST regardless of validity.
        let header = SignatureHeader {
            key_id: "https://example.com/users/alice#main-key".to_string(),
            algorithm: Some(SIGNATURE_ALGORITHM.to_string()),
            headers: vec!["(request-target)".to_string(), "date".to_string()],
            signature: vec![0; 16],
        };
        let result = verify_parsed_request(
            &header,
            &BTreeMap::new(),
            &Method::POST,
            "/inbox",
            &keypair.public_key,
            Some(b"{}"),
            false,
        );
        assert_eq!(result, Err(Error::SignatureHeaderInvalid));
    }

    #[test]
    fn verify_body_digest_accepts_known_value() {
        let body = "Lorem ipsum dolor sit amet, consectetur adipiscing elit, sed do eiusmod tempor incididunt ut labore et dolore magna aliqua.";
        verify_body_digest(
            Some("SHA-256=lzFT+G7C2hdI5j8M+FuJg1tC+O6AGMVJhooTCKGfbKM="),
            body.as_bytes(),
        )
        .unwrap();

        let invalid = verify_body_digest(
            Some("SHA-256=Z9h7DJfYWjffXw2XftmWCnpEaK/yqOHKvzCIzIaqgbU="),
            b"lorem ipsum",
        );
        assert_eq!(invalid, Err(Error::BodyDigestInvalid));
    }

    #[test]
    fn object_signature_roundtrip() {
        let keypair = generate_actor_keypair().unwrap();
        let mut note = json!({
            "id": "https://example.com/o/1",
            "type": "Note",
            "content": "hello"
        });
        let signature = sign_object(
            &note,
            "https://example.com/users/alice#main-key",
            &keypair.private_key,
        )
        .unwrap();
        note["signature"] = serde_json::to_value(&signature).unwrap();

        verify_object_signature(&note, &keypair.public_key).unwrap();

        note["content"] = json!("tampered");
        assert_eq!(
            verify_object_signature(&note, &keypair.public_key),
            Err(Error::SignatureInvalid)
        );
    }

    #[test]
    fn canonicalization_is_key_order_independent() {
        let keypair = generate_actor_keypair().unwrap();
        let a = json!({"b": 1, "a": {"d": 2, "c": 3}});
        let b = json!({"a": {"c": 3, "d": 2}, "b": 1});
        let signature =
            sign_object(&a, "https://example.com/k#main-key", &keypair.private_key).unwrap();
        let mut signed_b = b.clone();
        signed_b["signature"] = serde_json::to_value(&signature).unwrap();
        verify_object_signature(&signed_b, &keypair.public_key).unwrap();
    }
}
