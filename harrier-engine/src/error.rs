use thiserror::Error;

/// Traffic engine errors
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Packet too short: expected {expected} bytes, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    #[error("Invalid IP version: {0}")]
    InvalidIpVersion(u8),

    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("MitM error: {0}")]
    Mitm(#[from] harrier_mitm::MitmError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Device write channel closed")]
    ChannelClosed,

    #[error("Engine not running")]
    NotRunning,
}

pub type Result<T> = std::result::Result<T, EngineError>;
