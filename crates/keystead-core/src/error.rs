use thiserror::Error;

/// Error taxonomy for the key-lifecycle core.
///
/// `InvalidCredential` deliberately covers both a wrong credential and a
/// corrupted wrapped-secret ciphertext: the unseal path must not leak which
/// of the two happened.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),

    #[error("already initialized")]
    AlreadyInitialized,

    #[error("not initialized")]
    NotInitialized,

    #[error("invalid credential")]
    InvalidCredential,

    #[error("unsupported {kind} algorithm identifier {id}")]
    UnsupportedAlgorithm { kind: &'static str, id: u32 },

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("storage unavailable: {0}")]
    Storage(#[from] std::io::Error),

    #[error("control store error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("hardware sealer error: {0}")]
    Sealer(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("integrity mismatch on {volume}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        volume: String,
        expected: String,
        actual: String,
    },

    #[error("migration failure: {0}")]
    MigrationFailure(String),
}

pub type Result<T> = std::result::Result<T, Error>;
