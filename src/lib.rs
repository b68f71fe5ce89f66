#![doc = include_str!("../README.md")]
#![deny(missing_docs)]

/// Admin back-channel driven by activities addressed to the system actor
pub mod admin;
/// Constructs well-formed activities bound to an actor identity
pub mod builder;
/// Client for fetching and posting ActivityPub data
pub mod client;
/// Configuration for the federation core
pub mod config;
/// RSA-SHA256 signing, verification and body digests
pub mod crypto;
/// User-defined curated and query-derived collections
pub mod custom_collections;
/// Repository-backed delivery queue and background worker
pub mod delivery;
/// Error messages returned by this library
pub mod error;
/// HTTP endpoint surface (axum)
pub mod http;
/// Per-activity-type inbox state machine
pub mod inbox;
/// Resolves and caches public keys for signature verification
pub mod keys;
/// Outbox handling: id assignment, local side effects, delivery fan-out
pub mod outbox;
/// Data structures which define federated messages
pub mod protocol;
/// Routes one shared-inbox activity to every local recipient
pub mod shared_inbox;
/// HTTP signature creation and verification
pub mod signatures;
/// Repository traits and in-memory implementations
pub mod storage;
/// Resolves identifiers of the form `name@example.com`
pub mod webfinger;

pub use activitystreams_kinds as kinds;

/// Mime type for Activitypub, used for `Accept` and `Content-Type` HTTP headers
pub const FEDERATION_CONTENT_TYPE: &str = "application/activity+json";

/// Preference-ordered `Accept` header value for client fetches
pub const FEDERATION_ACCEPT: &str =
    "application/activity+json, application/ld+json;q=0.9, application/json;q=0.8";
