//! Resolution of the app owning a connection's local socket.
//!
//! The lookup itself is a platform concern (on Android it walks
//! `/proc/net` or asks the ConnectivityManager); the engine only consumes
//! this trait.

use std::net::IpAddr;

pub trait AppFinder: Send + Sync {
    /// Maps a socket tuple to an application identifier.
    fn app_id(
        &self,
        local_addr: IpAddr,
        remote_addr: IpAddr,
        local_port: u16,
        remote_port: u16,
        ip_protocol: u8,
    ) -> Option<i32>;

    /// Maps an application identifier to its package name.
    fn app_package(&self, app_id: i32) -> Option<String>;
}

/// Finder that resolves nothing.
pub struct NullAppFinder;

impl AppFinder for NullAppFinder {
    fn app_id(
        &self,
        _local_addr: IpAddr,
        _remote_addr: IpAddr,
        _local_port: u16,
        _remote_port: u16,
        _ip_protocol: u8,
    ) -> Option<i32> {
        None
    }

    fn app_package(&self, _app_id: i32) -> Option<String> {
        None
    }
}
