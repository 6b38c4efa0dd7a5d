//! In-memory certificate authority for on-the-fly leaf forging.
//!
//! The contract towards the engine is narrow: given a hostname, produce a
//! signed leaf certificate and a matching TLS engine. Server-facing engines
//! (this device acting as TLS client towards the real remote host) trust the
//! webpki root set; client-facing engines (this device acting as TLS server
//! towards the intercepted app) present a leaf forged for the hostname the
//! server-facing session was created for. Forged server configs are cached
//! per hostname so repeated connections to the same host skip key generation.

use crate::engine::TlsEngine;
use crate::error::{MitmError, Result};
use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConfig, ServerConnection};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

const CA_COMMON_NAME: &str = "Harrier Interception CA";
const CA_ORGANIZATION: &str = "Harrier";

/// Certificate authority plus the TLS configs derived from it.
pub struct Authority {
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
    ca_der: CertificateDer<'static>,
    client_config: Arc<ClientConfig>,
    forged_configs: Mutex<HashMap<String, Arc<ServerConfig>>>,
}

impl Authority {
    /// Generates a fresh in-memory CA. The host application is responsible
    /// for exporting [`Authority::ca_certificate_pem`] into the device trust
    /// store; this crate only ever holds the key material in memory.
    pub fn generate() -> Result<Self> {
        let ca_key = KeyPair::generate()?;
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, CA_COMMON_NAME);
        dn.push(DnType::OrganizationName, CA_ORGANIZATION);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let ca_cert = params.self_signed(&ca_key)?;
        Self::from_parts(ca_cert, ca_key)
    }

    /// Rebuilds the authority from a previously exported CA key pair and
    /// certificate parameters (both PEM).
    pub fn from_ca_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let ca_key = KeyPair::from_pem(key_pem)?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem)?;
        let ca_cert = params.self_signed(&ca_key)?;
        Self::from_parts(ca_cert, ca_key)
    }

    fn from_parts(ca_cert: rcgen::Certificate, ca_key: KeyPair) -> Result<Self> {
        let ca_der = ca_cert.der().clone();

        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let client_config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        debug!("Authority initialised ({})", CA_COMMON_NAME);

        Ok(Self {
            ca_cert,
            ca_key,
            ca_der,
            client_config: Arc::new(client_config),
            forged_configs: Mutex::new(HashMap::new()),
        })
    }

    /// The CA certificate in PEM form, for installation into the device
    /// trust store.
    pub fn ca_certificate_pem(&self) -> String {
        self.ca_cert.pem()
    }

    /// Creates a client-mode TLS engine towards the real remote host. The
    /// session trusts the webpki root set and sends `sni` (falling back to
    /// the literal remote address) as its server name.
    pub fn create_server_engine(&self, sni: Option<&str>, host: &str, port: u16) -> Result<TlsEngine> {
        let hostname = sni.unwrap_or(host).to_string();
        let server_name = ServerName::try_from(hostname.clone())
            .map_err(|_| MitmError::InvalidServerName(hostname.clone()))?;
        let conn = ClientConnection::new(self.client_config.clone(), server_name)?;
        debug!("Created server-facing TLS engine for {}:{}", hostname, port);
        Ok(TlsEngine::from_client(conn, hostname, port))
    }

    /// Creates a server-mode TLS engine towards the intercepted local app,
    /// presenting a leaf certificate forged for the hostname the supplied
    /// server-facing session negotiated with.
    pub fn create_client_engine_for(&self, server_engine: &TlsEngine) -> Result<TlsEngine> {
        let hostname = server_engine.hostname().to_string();
        let config = self.forged_config(&hostname)?;
        let conn = ServerConnection::new(config)?;
        debug!("Created client-facing TLS engine for {}", hostname);
        Ok(TlsEngine::from_server(conn, hostname, server_engine.port()))
    }

    fn forged_config(&self, hostname: &str) -> Result<Arc<ServerConfig>> {
        if let Some(config) = self.forged_configs.lock().get(hostname) {
            return Ok(config.clone());
        }

        let leaf_key = KeyPair::generate()?;
        let mut params = CertificateParams::new(vec![hostname.to_string()])?;
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, hostname);
        let leaf = params.signed_by(&leaf_key, &self.ca_cert, &self.ca_key)?;

        let chain = vec![leaf.der().clone(), self.ca_der.clone()];
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));
        let config = Arc::new(
            ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(chain, key)?,
        );

        self.forged_configs
            .lock()
            .insert(hostname.to_string(), config.clone());
        Ok(config)
    }
}

impl std::fmt::Debug for Authority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authority")
            .field("forged_hosts", &self.forged_configs.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_ca_and_forges_leaf() {
        let authority = Authority::generate().unwrap();
        let pem = authority.ca_certificate_pem();
        assert!(pem.contains("BEGIN CERTIFICATE"));

        let server = authority
            .create_server_engine(Some("example.com"), "93.184.216.34", 443)
            .unwrap();
        assert_eq!(server.hostname(), "example.com");

        let client = authority.create_client_engine_for(&server).unwrap();
        assert_eq!(client.hostname(), "example.com");
    }

    #[test]
    fn falls_back_to_literal_address_without_sni() {
        let authority = Authority::generate().unwrap();
        let server = authority
            .create_server_engine(None, "93.184.216.34", 443)
            .unwrap();
        assert_eq!(server.hostname(), "93.184.216.34");
    }

    #[test]
    fn forged_configs_are_cached_per_hostname() {
        let authority = Authority::generate().unwrap();
        let first = authority.forged_config("cached.example.com").unwrap();
        let second = authority.forged_config("cached.example.com").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
