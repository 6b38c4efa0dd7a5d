pub mod connection;
pub mod dns;
pub mod tls_passthrough;

pub use connection::ConnectionCache;
pub use dns::DnsCache;
pub use tls_passthrough::TlsPassthroughCache;
