//! Error types shared by the local and remote proxies.
//!
//! Every non-transient failure collapses to one of the kinds below, which
//! the relay and handshake callbacks use to decide whether to release the
//! owning [`crate::context::Context`] back to its pool.

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the tunnel's core subsystems.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Underlying I/O failure (anything other than `WouldBlock`, which
    /// callers filter out before an `Error` is ever constructed).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// `recv()` returned 0: the peer closed its side of the connection.
    #[error("peer closed the connection")]
    PeerClosed,

    /// A protocol violation: bad SOCKS5 version, malformed handshake
    /// fields, unknown user, malformed inner address/port.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The context pool has no free slots.
    #[error("context pool exhausted")]
    PoolExhausted,

    /// The 10-second handshake timer fired before the session reached
    /// the relay phase.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// Config file missing, unparseable, or referencing an unknown
    /// section/key.
    #[error("configuration error: {0}")]
    Config(String),

    /// Startup failure: socket bind/listen, pool/loop allocation.
    #[error("startup failure: {0}")]
    Startup(String),
}

impl Error {
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol(message.into())
    }

    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }

    pub fn startup<S: Into<String>>(message: S) -> Self {
        Self::Startup(message.into())
    }
}

/// Every read/write callback follows the same pattern: treat `WouldBlock`
/// as "yield, stay subscribed" and everything else as fatal for the
/// session (`spec.md` §4.c, §7 kind 1).
pub fn is_would_block(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock
}
