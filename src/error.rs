//! Error types for the encrypted submission protocol.
//!
//! Server-side failures fall into three families: integrity failures (the
//! request never reaches key material), crypto failures (fatal to the current
//! request) and identity failures. Client-side failures are surfaced through
//! [`ClientError`] and the orchestrator callbacks.

use thiserror::Error;

/// A request failed the pre-decryption gate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityError {
    /// The programmatic-call marker header is missing or wrong.
    #[error("request is not marked as a programmatic call")]
    MissingMarker,

    /// The application token header does not match the session token.
    #[error("application token mismatch")]
    TokenMismatch,

    /// The session has no application token bound to it.
    #[error("no application token bound to session")]
    UnboundSession,

    /// The checksum header is missing or not valid base64.
    #[error("checksum header missing or malformed")]
    MalformedChecksum,

    /// The checksum header does not match the recomputed digest.
    #[error("checksum mismatch")]
    ChecksumMismatch,
}

/// Cryptographic failures. Messages never carry key material.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// RSA key generation failed.
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// A PEM or DER key could not be parsed.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// RSA encryption or decryption of a chunk failed.
    #[error("RSA operation failed: {0}")]
    Rsa(String),

    /// The configured chunk does not fit into one RSA block.
    #[error("chunk size {chunk_size} exceeds key block capacity {capacity}")]
    ChunkTooLarge {
        /// Configured plaintext chunk size in bytes.
        chunk_size: usize,
        /// Maximum plaintext bytes the key can take per block.
        capacity: usize,
    },

    /// A transported field could not be decoded.
    #[error("malformed encrypted field: {0}")]
    MalformedField(String),

    /// Symmetric encryption or decryption failed.
    #[error("AES operation failed: {0}")]
    Aes(String),

    /// Certificate or CSR construction failed.
    #[error("certificate error: {0}")]
    Certificate(String),

    /// PKCS#12 export or import failed (wrong passphrase included).
    #[error("PKCS#12 error: {0}")]
    Pkcs12(String),

    /// PKCS#7 sign, verify, encrypt or decrypt failed.
    #[error("PKCS#7 error: {0}")]
    Pkcs7(String),

    /// Raw signing failed.
    #[error("signature error: {0}")]
    Signature(String),

    /// Unknown algorithm or cipher name.
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Decrypted bytes were expected to be UTF-8 text.
    #[error("decrypted data is not valid UTF-8")]
    InvalidUtf8,
}

/// No address could be resolved for the request at all.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    /// Neither a forwarding header nor the peer address was present.
    #[error("no peer address available")]
    NoPeerAddress,
}

/// Client-side storage backend failure.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested backend cannot be used in this runtime.
    #[error("storage backend {0} unavailable")]
    Unavailable(&'static str),

    /// Reading or writing the durable store failed.
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),

    /// The durable store contents could not be parsed.
    #[error("storage format error: {0}")]
    Format(#[from] serde_json::Error),
}

/// Failures surfaced to the submitting client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The transport failed before a response was received.
    #[error("network error: {0}")]
    Network(String),

    /// The server answered with a structured error body.
    #[error("server rejected submission: {message}")]
    Server {
        /// Generic server message.
        message: String,
        /// Optional diagnostic details (debug servers only).
        details: Option<serde_json::Value>,
    },

    /// The server response could not be understood.
    #[error("unexpected server response: {0}")]
    UnexpectedResponse(String),

    /// Local encryption failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Local cache storage failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Umbrella error for the server-side request flow.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// The request body was structurally invalid.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The form processor failed on decrypted fields.
    #[error("processing failed: {0}")]
    Processing(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
pub type CryptoResult<T> = std::result::Result<T, CryptoError>;

