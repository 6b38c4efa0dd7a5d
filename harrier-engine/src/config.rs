//! Engine configuration, read once at component construction.

use serde::{Deserialize, Serialize};

/// Default maximum size of a packet written to the device interface.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 16413;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Global man-in-the-middle switch. Individual connections may still be
    /// passed through when a previous TLS failure was learned for their
    /// (app, hostname) pair.
    pub do_mitm: bool,

    /// Maximum size of a single packet written back to the device interface.
    /// Inbound payloads are segmented to fit.
    pub max_packet_size: usize,

    /// When non-empty, only these app packages are in MitM scope.
    pub mitm_app_allowlist: Vec<String>,

    /// App packages never MitM'd, regardless of the allowlist.
    pub mitm_app_denylist: Vec<String>,

    /// CA certificate and key in PEM form. When absent, a fresh in-memory CA
    /// is generated at startup.
    pub ca_cert_pem: Option<String>,
    pub ca_key_pem: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            do_mitm: false,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            mitm_app_allowlist: Vec::new(),
            mitm_app_denylist: Vec::new(),
            ca_cert_pem: None,
            ca_key_pem: None,
        }
    }
}

impl EngineConfig {
    /// Whether an app (by package name) is within the MitM scope configured
    /// by the allow/deny lists. An unresolved app is in scope only when no
    /// allowlist narrows the scope.
    pub fn app_in_mitm_scope(&self, package: Option<&str>) -> bool {
        match package {
            Some(package) => {
                if self.mitm_app_denylist.iter().any(|p| p == package) {
                    return false;
                }
                self.mitm_app_allowlist.is_empty()
                    || self.mitm_app_allowlist.iter().any(|p| p == package)
            }
            None => self.mitm_app_allowlist.is_empty(),
        }
    }
}

pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    pub fn do_mitm(mut self, enable: bool) -> Self {
        self.config.do_mitm = enable;
        self
    }

    pub fn max_packet_size(mut self, size: usize) -> Self {
        self.config.max_packet_size = size;
        self
    }

    pub fn mitm_app_allowlist(mut self, packages: Vec<String>) -> Self {
        self.config.mitm_app_allowlist = packages;
        self
    }

    pub fn mitm_app_denylist(mut self, packages: Vec<String>) -> Self {
        self.config.mitm_app_denylist = packages;
        self
    }

    pub fn ca_pem(mut self, cert_pem: impl Into<String>, key_pem: impl Into<String>) -> Self {
        self.config.ca_cert_pem = Some(cert_pem.into());
        self.config.ca_key_pem = Some(key_pem.into());
        self
    }

    pub fn build(self) -> EngineConfig {
        self.config
    }
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }
}
