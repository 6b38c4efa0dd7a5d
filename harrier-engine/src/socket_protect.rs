//! Socket protection callback.
//!
//! Outward-facing sockets must be excluded from the VPN's own routing or
//! every connection would loop back into the device interface. How that is
//! done is owned by the host application (on Android it calls
//! `VpnService.protect`), so the engine only carries a callback registry.

#[cfg(unix)]
use std::os::fd::RawFd;

#[cfg(not(unix))]
pub type RawFd = i32;

use parking_lot::RwLock;
use tracing::{trace, warn};

type ProtectCallback = Box<dyn Fn(RawFd) -> bool + Send + Sync>;

static PROTECT_CALLBACK: RwLock<Option<ProtectCallback>> = RwLock::new(None);

/// Registers the callback invoked with the raw fd of every outward-facing
/// socket the engine opens. The callback returns whether protection
/// succeeded.
pub fn set_protect_callback<F>(callback: F)
where
    F: Fn(RawFd) -> bool + Send + Sync + 'static,
{
    *PROTECT_CALLBACK.write() = Some(Box::new(callback));
}

pub fn clear_protect_callback() {
    *PROTECT_CALLBACK.write() = None;
}

/// Protects a socket fd from the VPN's routing. Returns true when no
/// callback is registered (nothing to protect against, e.g. in tests).
pub fn protect_socket(fd: RawFd) -> bool {
    match PROTECT_CALLBACK.read().as_ref() {
        Some(callback) => {
            let ok = callback(fd);
            if !ok {
                warn!("Socket fd={} protection failed, traffic may loop", fd);
            }
            ok
        }
        None => {
            trace!("No protect callback set for socket fd={}", fd);
            true
        }
    }
}
