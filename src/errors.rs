//! Error types for the measurement engine.
//!
//! Every failure the engine can surface is a variant here; transport-level
//! errors are wrapped transparently so callers can still reach the source.

use thiserror::Error;

/// Errors produced by the measurement engine.
#[derive(Error, Debug)]
pub enum Error {
    /// An engine, server or manager handle was used before (or after) the
    /// engine that owns it existed.
    #[error("uninitialized manager")]
    UninitializedManager,

    /// The server catalog decoded to zero servers.
    #[error("no server available or found")]
    NoServer,

    /// Every probe attempt against a server failed.
    #[error("server connect timeout")]
    ConnectTimeout,

    /// HTTP round-trip failure.
    #[error("transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// Socket-level I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The remote server answered the packet-loss command with an
    /// unsupported marker.
    #[error("packet loss measurement not supported by server")]
    Unsupported,

    /// No host in a multi-host packet-loss run produced a reading.
    #[error("no available hosts")]
    NoAvailableHosts,

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error("json decode error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("xml decode error: {0}")]
    Xml(#[from] quick_xml::DeError),

    /// A coordinate string was malformed or out of range.
    #[error("invalid coordinate: {0}")]
    InvalidCoordinate(String),

    /// A source address string did not parse as an IP address.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The remote side violated the line protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The operation was cancelled by its caller.
    #[error("operation cancelled")]
    Cancelled,

    /// Both chunk handlers were invoked on the same chunk. This is a
    /// programming error in the caller.
    #[error("multiple calls to the same chunk handler are not allowed")]
    ChunkReused,

    /// A test direction was started with no registered request functions.
    #[error("empty task stack")]
    EmptyTaskStack,

    /// An upload chunk was created with a non-positive size.
    #[error("upload size must be positive, got {0}")]
    InvalidUploadSize(i64),

    /// A line-protocol command was issued on a disconnected client.
    #[error("transport connection not established")]
    NotConnected,
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
