use thiserror::Error;

/// MitM layer errors
#[derive(Error, Debug)]
pub enum MitmError {
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("Certificate generation error: {0}")]
    Certificate(#[from] rcgen::Error),

    #[error("Invalid server name: {0}")]
    InvalidServerName(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS session closed by peer")]
    SessionClosed,
}

pub type Result<T> = std::result::Result<T, MitmError>;
