//! TLS certificate selection
//!
//! The gateway reads each ClientHello before choosing a [`ServerConfig`].
//! In authority mode every host gets a leaf certificate signed on first
//! use by the rack's own CA. In ACME mode certificates come from
//! [`AcmeManager`](crate::acme::AcmeManager).

use crate::acme::AcmeManager;
use crate::storage::StorageError;
use dashmap::DashMap;
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// ALPN protocols offered for regular traffic
pub const HTTP_ALPN: &[&[u8]] = &[b"h2", b"http/1.1"];

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("client hello carried no server name")]
    MissingServerName,

    #[error("host not allowed for certificate issuance: {0}")]
    HostNotAllowed(String),

    #[error("certificate generation failed: {0}")]
    Generate(#[from] rcgen::Error),

    #[error("tls configuration failed: {0}")]
    Tls(#[from] rustls::Error),

    #[error("invalid certificate material: {0}")]
    Invalid(String),

    #[error("certificate cache: {0}")]
    Cache(#[from] StorageError),

    #[error("acme: {0}")]
    Acme(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl From<instant_acme::Error> for CertificateError {
    fn from(err: instant_acme::Error) -> Self {
        CertificateError::Acme(err.to_string())
    }
}

/// The parts of a ClientHello certificate selection depends on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HelloInfo {
    pub server_name: Option<String>,
    pub alpn: Vec<Vec<u8>>,
}

impl HelloInfo {
    pub fn from_client_hello(hello: &ClientHello<'_>) -> Self {
        Self {
            server_name: hello
                .server_name()
                .filter(|name| !name.is_empty())
                .map(|name| name.to_ascii_lowercase()),
            alpn: hello
                .alpn()
                .map(|protocols| protocols.map(|p| p.to_vec()).collect())
                .unwrap_or_default(),
        }
    }

    pub fn offers_alpn(&self, protocol: &[u8]) -> bool {
        self.alpn.iter().any(|p| p == protocol)
    }
}

/// Resolver that always presents one certificate
#[derive(Debug)]
pub(crate) struct SingleCert(pub(crate) Arc<CertifiedKey>);

impl ResolvesServerCert for SingleCert {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}

/// Build a server config presenting `key` with the given ALPN protocols
pub(crate) fn server_config_for(
    key: Arc<CertifiedKey>,
    alpn: &[&[u8]],
) -> Result<Arc<ServerConfig>, CertificateError> {
    let mut config =
        ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(SingleCert(key)));
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(Arc::new(config))
}

pub(crate) fn certified_key(
    chain: Vec<CertificateDer<'static>>,
    key: &PrivateKeyDer<'_>,
) -> Result<Arc<CertifiedKey>, CertificateError> {
    let signing_key = rustls::crypto::ring::sign::any_supported_type(key)?;
    Ok(Arc::new(CertifiedKey::new(chain, signing_key)))
}

fn key_der(key: &KeyPair) -> Result<PrivateKeyDer<'static>, CertificateError> {
    PrivateKeyDer::try_from(key.serialize_der())
        .map_err(|e| CertificateError::Invalid(format!("private key: {}", e)))
}

/// Certificate authority that signs per-host leaf certificates
pub struct CertificateAuthority {
    cert: rcgen::Certificate,
    key: KeyPair,
    der: CertificateDer<'static>,
}

impl CertificateAuthority {
    /// Generate a fresh CA for this rack
    pub fn generate(rack: &str) -> Result<Self, CertificateError> {
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, format!("{} CA", rack));
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let key = KeyPair::generate()?;
        let cert = params.self_signed(&key)?;
        let der = CertificateDer::from(cert.der().to_vec());
        info!(rack, "Generated certificate authority");

        Ok(Self { cert, key, der })
    }

    /// Load an existing CA from PEM text
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, CertificateError> {
        let der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| CertificateError::Invalid("no certificate in CA PEM".into()))??;

        let key = KeyPair::from_pem(key_pem)?;
        // Re-signing the parsed params reproduces the issuer identity used for leaf signatures
        let params = CertificateParams::from_ca_cert_pem(cert_pem)?;
        let cert = params.self_signed(&key)?;

        Ok(Self { cert, key, der })
    }

    /// Load a CA from PEM files on disk
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, CertificateError> {
        let cert_pem = std::fs::read_to_string(cert_path)?;
        let key_pem = std::fs::read_to_string(key_path)?;
        let ca = Self::from_pem(&cert_pem, &key_pem)?;
        info!(path = %cert_path.display(), "Loaded certificate authority");
        Ok(ca)
    }

    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.der
    }

    /// Sign a leaf certificate for exactly `host`
    pub fn issue(&self, host: &str) -> Result<Arc<CertifiedKey>, CertificateError> {
        let mut params = CertificateParams::new(vec![host.to_string()])?;
        params.distinguished_name.push(DnType::CommonName, host);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let key = KeyPair::generate()?;
        let cert = params.signed_by(&key, &self.cert, &self.key)?;
        let chain = vec![CertificateDer::from(cert.der().to_vec()), self.der.clone()];

        certified_key(chain, &key_der(&key)?)
    }
}

/// Self-signed certificate for handshakes that name no host
pub fn self_signed(name: &str) -> Result<Arc<CertifiedKey>, CertificateError> {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec![name.to_string()])?;
    certified_key(
        vec![CertificateDer::from(cert.der().to_vec())],
        &key_der(&key_pair)?,
    )
}

/// Per-host certificates signed by a [`CertificateAuthority`], kept for the
/// process lifetime
pub struct AuthorityStore {
    ca: CertificateAuthority,
    fallback: Arc<CertifiedKey>,
    certs: DashMap<String, Arc<CertifiedKey>>,
}

impl AuthorityStore {
    pub fn new(ca: CertificateAuthority, rack: &str) -> Result<Self, CertificateError> {
        Ok(Self {
            ca,
            fallback: self_signed(rack)?,
            certs: DashMap::new(),
        })
    }

    pub fn authority(&self) -> &CertificateAuthority {
        &self.ca
    }

    /// Certificate for a handshake; no server name gets the fallback
    pub fn certificate(&self, server_name: Option<&str>) -> Result<Arc<CertifiedKey>, CertificateError> {
        let host = match server_name {
            Some(host) if !host.is_empty() => host.to_ascii_lowercase(),
            _ => return Ok(Arc::clone(&self.fallback)),
        };

        if let Some(cert) = self.certs.get(&host) {
            return Ok(Arc::clone(&cert));
        }

        let issued = self.ca.issue(&host)?;
        debug!(host, "Signed certificate");

        // Concurrent misses both sign; the first insert wins
        let cert = self.certs.entry(host).or_insert(issued);
        Ok(Arc::clone(&cert))
    }

    pub fn len(&self) -> usize {
        self.certs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }
}

/// Certificate source chosen once at startup
pub enum CertificateManager {
    Authority(AuthorityStore),
    Acme(AcmeManager),
}

impl CertificateManager {
    /// Server configuration for one handshake
    pub async fn server_config(&self, hello: &HelloInfo) -> Result<Arc<ServerConfig>, CertificateError> {
        match self {
            CertificateManager::Authority(store) => {
                let key = store.certificate(hello.server_name.as_deref())?;
                server_config_for(key, HTTP_ALPN)
            }
            CertificateManager::Acme(acme) => acme.server_config(hello).await,
        }
    }

    pub fn acme(&self) -> Option<&AcmeManager> {
        match self {
            CertificateManager::Acme(acme) => Some(acme),
            CertificateManager::Authority(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::BasicConstraints;
    use x509_parser::prelude::*;

    fn leaf_names(key: &CertifiedKey) -> Vec<String> {
        let (_, cert) = X509Certificate::from_der(key.cert[0].as_ref()).unwrap();
        cert.subject_alternative_name()
            .unwrap()
            .unwrap()
            .value
            .general_names
            .iter()
            .filter_map(|n| match n {
                GeneralName::DNSName(name) => Some(name.to_string()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_empty_server_name_gets_fallback() {
        let store = AuthorityStore::new(CertificateAuthority::generate("test").unwrap(), "test").unwrap();

        let a = store.certificate(None).unwrap();
        let b = store.certificate(Some("")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(leaf_names(&a), vec!["test"]);
        assert!(store.is_empty());
    }

    #[test]
    fn test_host_certificate_reused() {
        let store = AuthorityStore::new(CertificateAuthority::generate("test").unwrap(), "test").unwrap();

        let first = store.certificate(Some("app.example.com")).unwrap();
        let second = store.certificate(Some("APP.example.com")).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.len(), 1);
        assert_eq!(leaf_names(&first), vec!["app.example.com"]);
    }

    #[test]
    fn test_leaf_chains_to_authority() {
        let ca = CertificateAuthority::generate("test").unwrap();
        let ca_der = ca.cert_der().clone();
        let key = ca.issue("api.example.com").unwrap();

        assert_eq!(key.cert.len(), 2);
        assert_eq!(key.cert[1], ca_der);

        let (_, leaf) = X509Certificate::from_der(key.cert[0].as_ref()).unwrap();
        let (_, issuer) = X509Certificate::from_der(ca_der.as_ref()).unwrap();
        assert_eq!(leaf.issuer().to_string(), issuer.subject().to_string());
        assert!(leaf.verify_signature(Some(issuer.public_key())).is_ok());
    }

    #[test]
    fn test_authority_pem_round_trip_signs() {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name.push(DnType::CommonName, "Loaded CA");
        let cert = params.self_signed(&key).unwrap();

        let ca = CertificateAuthority::from_pem(&cert.pem(), &key.serialize_pem()).unwrap();
        let leaf = ca.issue("app.example.com").unwrap();

        let (_, parsed) = X509Certificate::from_der(leaf.cert[0].as_ref()).unwrap();
        let (_, issuer) = X509Certificate::from_der(cert.der().as_ref()).unwrap();
        assert!(parsed.verify_signature(Some(issuer.public_key())).is_ok());
    }

    #[test]
    fn test_hello_info_alpn() {
        let hello = HelloInfo {
            server_name: Some("app.example.com".into()),
            alpn: vec![b"acme-tls/1".to_vec()],
        };
        assert!(hello.offers_alpn(b"acme-tls/1"));
        assert!(!hello.offers_alpn(b"h2"));
    }

    #[tokio::test]
    async fn test_manager_builds_config() {
        let store = AuthorityStore::new(CertificateAuthority::generate("test").unwrap(), "test").unwrap();
        let manager = CertificateManager::Authority(store);

        let config = manager
            .server_config(&HelloInfo {
                server_name: Some("app.example.com".into()),
                alpn: Vec::new(),
            })
            .await
            .unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
        assert!(manager.acme().is_none());
    }
}
