//! The core error taxonomy, as a single `thiserror` enum so callers at
//! either boundary (admin API, connection loops) can match on kind
//! instead of string-sniffing.

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Upstream 401 at the source handshake, or rover Basic-auth failure.
    #[error("authentication rejected")]
    AuthRejected,

    /// Malformed HTTP, unexpected status, truncated header, unrecognised
    /// method.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// Dial failure, read/write failure, or timeout on a live connection.
    #[error("transport error: {0}")]
    TransportError(#[from] std::io::Error),

    /// Mountpoint absent at request time.
    #[error("not found: {0}")]
    NotFound(String),

    /// Missing or invalid station fields when starting a relay.
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// A repository read failed; surfaced to the caller. Write failures
    /// (status persistence) are logged and swallowed by the caller
    /// instead of constructing this variant.
    #[error("repository error: {0}")]
    RepositoryError(String),

    /// `probe_source` exceeded its deadline.
    #[error("operation timed out")]
    Timeout,
}

pub type CoreResult<T> = Result<T, CoreError>;
