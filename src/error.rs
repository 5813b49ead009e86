use thiserror::Error;

/// Errors surfaced by the tunnel device adapter.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// The interface name is owned by another process with different
    /// parameters. Re-opening with identical parameters is not an error.
    #[error("device {0} is busy with different parameters")]
    Busy(String),

    #[error("device command failed: {0}")]
    Command(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors on the management or signal transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,

    #[error("stream closed")]
    Closed,

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("codec: {0}")]
    Codec(#[from] serde_cbor::Error),

    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),

    #[error("server rejected request: {0}")]
    Rejected(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("sealing payload failed")]
    Encrypt,

    #[error("opening sealed payload failed")]
    Decrypt,
}

/// Top-level error type of the engine. Variants map onto the recovery
/// policy: `Config` and `Device` are fatal at start, `Transport` and
/// `Negotiation` are recovered internally and only reach logs.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("tunnel device: {0}")]
    Device(#[from] DeviceError),

    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("negotiation: {0}")]
    Negotiation(String),
}
