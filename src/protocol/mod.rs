//! Data structures which define federated messages

/// Activity documents and the tagged activity type
pub mod activity;
/// Actor documents
pub mod actor;
/// Paged collection documents
pub mod collections;
/// Wrapper for federated structs which handles the `@context` field
pub mod context;
/// Serde deserialization functions which help to receive differently shaped data
pub mod helpers;
/// Content object documents (notes, documents, tombstones)
pub mod object;
