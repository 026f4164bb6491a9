//! Crate-wide error types.

use thiserror::Error;

/// Errors that can be returned by an [`crate::protocol::fsm::ExchangeFsm`] operation.
///
/// These four kinds are exhaustive: the state transition table defines
/// exactly one outcome (state change, or one of these errors) for every
/// `(state, op)` pair.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FsmError {
    /// Operation called in a state that does not allow it.
    #[error("protocol violation: operation not valid in current state")]
    Protocol,
    /// HMAC verification failed on an incoming key message.
    #[error("authentication failed: HMAC mismatch")]
    Authentication,
    /// Scalar multiplication produced the all-zero shared secret.
    #[error("unsafe peer public key: zero shared secret")]
    Parameter,
    /// The negotiation deadline has elapsed.
    #[error("negotiation deadline expired")]
    Expired,
}

/// Errors surfaced while parsing a [`crate::protocol::frame::TransportHeader`] or its body.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("datagram too short to contain a transport header")]
    Truncated,
    #[error("body length {got} does not match the declared message type (expected {expected})")]
    BodyLength { expected: usize, got: usize },
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
}

/// Errors surfaced while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level errors that abort the Key Manager process.
///
/// These are the only conditions the manager treats as fatal: an ephemeral
/// SPI collision is a programmer/adversary invariant violation, never a
/// recoverable event. A library crate can't literally call `abort()`; the
/// host binary treats any `Err` returned from a tick as fatal, logs it, and
/// exits nonzero.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("fatal: ephemeral SPI {spi} collides with an existing inbound SA on route {other_route}")]
    SpiCollision { spi: u32, other_route: String },
    #[error("failed to publish SA database: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
