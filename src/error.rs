//! src/error.rs
//!
//! Defines the library's custom, comprehensive `Error` enum using `thiserror`.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize or deserialize: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store capacity exceeded")]
    StoreFull,

    #[error("Key not found or expired")]
    NotFound,

    #[error("Request body exceeds the configured size cap")]
    Oversized,

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Signature missing or invalid")]
    AuthFailed,

    #[error("Peer {0} unreachable: {1}")]
    PeerUnreachable(String, String),

    #[error("All bootstrap seeds failed")]
    BootstrapExhausted,

    #[error("DNS resolution failed: {0}")]
    DnsResolution(#[from] hickory_resolver::error::ResolveError),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Attachment session error: {0}")]
    Session(String),

    #[error("Node is shutting down")]
    ShuttingDown,

    #[error("Tokio task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("API server error: {0}")]
    ApiServer(#[from] axum::Error),
}
