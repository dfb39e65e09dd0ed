//! Wire-level parsing and rendering for the NTRIP relay.
//!
//! Everything here is pure: no sockets, no timers, no channels. The
//! `relay` crate owns all I/O; this crate only turns bytes into values
//! and values back into bytes.

pub mod http;
pub mod nmea;
pub mod sourcetable;

#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("header section exceeded {limit} bytes without a terminator")]
    HeaderTooLarge { limit: usize },
    #[error("malformed request line: {0:?}")]
    MalformedRequestLine(String),
    #[error("malformed header line: {0:?}")]
    MalformedHeaderLine(String),
    #[error("malformed status line: {0:?}")]
    MalformedStatusLine(String),
    #[error("not valid utf-8")]
    Utf8,
}
