//! Certificate forging and non-blocking TLS session engines.
//!
//! The traffic engine terminates TLS on both sides of an intercepted
//! connection: towards the real remote host it acts as a TLS client, towards
//! the intercepted local app it acts as a TLS server presenting a leaf
//! certificate forged on the fly and signed by an in-memory CA. Both sides
//! are driven byte-in/byte-out through [`TlsEngine`], which never touches a
//! socket itself.

pub mod authority;
pub mod engine;
pub mod error;

pub use authority::Authority;
pub use engine::{HandshakeStatus, TlsEngine};
pub use error::{MitmError, Result};
