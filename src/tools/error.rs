use thiserror::Error;

/// Failure classes of the FLUTE engine.
///
/// The class decides the disposition: malformed packets and session
/// mismatches are dropped without killing the session, decode failures keep
/// the object alive for another transmission round, resource and
/// configuration failures surface to the caller.
#[derive(Debug, Error)]
pub enum FluteError {
    /// The datagram could not be parsed as an ALC/LCT packet
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// The packet belongs to another session or an unknown object
    #[error("session mismatch: {0}")]
    SessionMismatch(String),

    /// A payload could not be decoded into the target object
    #[error("decode failure: {0}")]
    Decode(String),

    /// An allocation or accounting limit was exceeded
    #[error("resource failure: {0}")]
    Resource(String),

    /// Socket level failure
    #[error("i/o failure")]
    Io(#[from] std::io::Error),

    /// The engine was constructed with invalid parameters
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result alias used all over the crate
pub type Result<T> = std::result::Result<T, FluteError>;
