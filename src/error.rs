//! Error messages returned by this library

use url::Url;

/// Error messages returned by this library
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Object was not found in local database
    #[error("Object was not found in local database")]
    NotFound,
    /// Request body could not be parsed as JSON
    #[error("Request body could not be parsed as JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// Incoming request has invalid digest for body
    #[error("Incoming request has invalid digest for body")]
    BodyDigestInvalid,
    /// Incoming request has invalid signature
    #[error("Incoming request has invalid signature")]
    SignatureInvalid,
    /// `Signature` header is missing or lacks a required parameter
    #[error("Signature header is missing or lacks a required parameter")]
    SignatureHeaderInvalid,
    /// Signature algorithm is not rsa-sha256 or hs2019
    #[error("Unsupported signature algorithm {0}")]
    UnsupportedAlgorithm(String),
    /// A header declared in the signature is absent from the request
    #[error("Header {0} is declared in the signature but absent from the request")]
    MissingSignedHeader(String),
    /// Actor document does not publish a public key
    #[error("Actor {0} does not publish a public key")]
    MissingPublicKey(Url),
    /// A key could not be parsed from PEM data
    #[error("Could not parse key from PEM data")]
    KeyInvalid,
    /// Activity actor differs from the actor bound to the signing key
    #[error("Activity actor differs from the actor bound to the signing key")]
    ActorMismatch,
    /// Collection is private
    #[error("Collection is private")]
    CollectionPrivate,
    /// Items cannot be added to or removed from a query collection
    #[error("Items cannot be added to or removed from a query collection")]
    QueryCollectionReadOnly,
    /// Collection slug is reserved or malformed
    #[error("Invalid collection slug {0:?}")]
    InvalidSlug(String),
    /// Collection definition violates an invariant
    #[error("Invalid collection definition: {0}")]
    CollectionDefinitionInvalid(&'static str),
    /// Failed to resolve actor via webfinger
    #[error("Failed to resolve actor via webfinger")]
    WebfingerResolveFailed,
    /// URL failed verification
    #[error("URL failed verification: {0}")]
    UrlVerification(&'static str),
    /// Remote server answered with an unexpected status
    #[error("Remote server answered {status} for {url}")]
    RemoteStatus {
        /// HTTP status returned by the remote
        status: http::StatusCode,
        /// The request URL
        url: Url,
    },
    /// Operation was cancelled through its cancellation token
    #[error("Operation was cancelled")]
    Cancelled,
    /// other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub(crate) fn other<T>(error: T) -> Self
    where
        T: Into<anyhow::Error>,
    {
        Error::Other(error.into())
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

impl From<url::ParseError> for Error {
    fn from(value: url::ParseError) -> Self {
        Error::other(value)
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::other(value)
    }
}

impl From<reqwest_middleware::Error> for Error {
    fn from(value: reqwest_middleware::Error) -> Self {
        Error::other(value)
    }
}
