//! ACME (Let's Encrypt) certificate management
//!
//! Certificates are issued on demand, one per host, the first time a
//! handshake names that host. Supported challenges:
//! - HTTP-01 (token served at /.well-known/acme-challenge/ on the plaintext listener)
//! - TLS-ALPN-01 (certificate presented to handshakes offering acme-tls/1)
//!
//! # Security Considerations
//!
//! Account keys and certificate private keys are persisted unencrypted
//! through the configured [`CertCache`]. The directory cache writes every
//! entry with mode 0600 on Unix; the database cache inherits the
//! permissions of the database file.

use crate::certs::{certified_key, server_config_for, CertificateError, HelloInfo, HTTP_ALPN};
use crate::config::{AcmeChallengeType, AcmeConfig};
use crate::storage::StorageError;
use dashmap::DashMap;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::collections::HashMap;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell, RwLock};
use tracing::{debug, error, info, warn};

pub const ACME_TLS_ALPN_NAME: &[u8] = b"acme-tls/1";
const ACME_ALPN_OID: &[u64] = &[1, 3, 6, 1, 5, 5, 7, 1, 31];
const ACCOUNT_KEY: &str = "acme_account";
const POLL_INTERVAL: Duration = Duration::from_secs(2);
const MAX_POLLS: u32 = 30;

/// Persistent storage for ACME account credentials and issued certificates
pub trait CertCache: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    fn put(&self, key: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Deleting a missing key succeeds
    fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// Certificate cache backed by one file per key
pub struct DirCache {
    dir: PathBuf,
}

impl DirCache {
    pub fn new(path: &str) -> Result<Self, StorageError> {
        let dir = validate_cache_dir(path).map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(Self { dir })
    }

    fn path(&self, key: &str) -> Result<PathBuf, StorageError> {
        if key.is_empty() || key.contains('/') || key.contains('\\') || key.contains("..") {
            return Err(StorageError::Backend(format!("invalid cache key: {:?}", key)));
        }
        Ok(self.dir.join(key))
    }
}

fn io_error(context: &str, err: std::io::Error) -> StorageError {
    StorageError::Backend(format!("{}: {}", context, err))
}

impl CertCache for DirCache {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.path(key)?;
        match std::fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&path.display().to_string(), e)),
        }
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<(), StorageError> {
        let path = self.path(key)?;
        std::fs::create_dir_all(&self.dir).map_err(|e| io_error("create cache dir", e))?;

        // Entries hold private keys; restrict to owner (0600)
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&path)
                .map_err(|e| io_error(&path.display().to_string(), e))?;
            std::io::Write::write_all(&mut file, data)
                .map_err(|e| io_error(&path.display().to_string(), e))?;
        }
        #[cfg(not(unix))]
        {
            std::fs::write(&path, data).map_err(|e| io_error(&path.display().to_string(), e))?;
        }

        debug!(path = %path.display(), "Cache entry written");
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&path.display().to_string(), e)),
        }
    }
}

/// Pending ACME challenges for HTTP-01 validation
#[derive(Clone, Default)]
pub struct Http01Challenges {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl Http01Challenges {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, token: String, key_authorization: String) {
        self.inner.write().await.insert(token, key_authorization);
    }

    pub async fn get(&self, token: &str) -> Option<String> {
        self.inner.read().await.get(token).cloned()
    }

    pub async fn remove(&self, token: &str) {
        self.inner.write().await.remove(token);
    }
}

/// On-demand per-host certificate manager
pub struct AcmeManager {
    config: AcmeConfig,
    cache: Arc<dyn CertCache>,
    http01_challenges: Http01Challenges,
    alpn_certs: DashMap<String, Arc<CertifiedKey>>,
    certs: DashMap<String, Arc<CertifiedKey>>,
    issuing: DashMap<String, Arc<Mutex<()>>>,
    account: OnceCell<Account>,
}

impl AcmeManager {
    pub fn new(config: AcmeConfig, cache: Arc<dyn CertCache>) -> Self {
        Self {
            config,
            cache,
            http01_challenges: Http01Challenges::new(),
            alpn_certs: DashMap::new(),
            certs: DashMap::new(),
            issuing: DashMap::new(),
            account: OnceCell::new(),
        }
    }

    pub fn http01_challenges(&self) -> Http01Challenges {
        self.http01_challenges.clone()
    }

    /// Server configuration for one handshake
    pub async fn server_config(&self, hello: &HelloInfo) -> Result<Arc<ServerConfig>, CertificateError> {
        let host = hello
            .server_name
            .as_deref()
            .ok_or(CertificateError::MissingServerName)?;

        if hello.offers_alpn(ACME_TLS_ALPN_NAME) {
            let cert = self
                .alpn_certs
                .get(host)
                .map(|c| Arc::clone(&c))
                .ok_or_else(|| CertificateError::Acme(format!("no pending tls-alpn-01 challenge for {}", host)))?;
            return server_config_for(cert, &[ACME_TLS_ALPN_NAME]);
        }

        let cert = self.certificate(host).await?;
        server_config_for(cert, HTTP_ALPN)
    }

    /// Certificate for `host`, from memory, the cache, or a new order
    pub async fn certificate(&self, host: &str) -> Result<Arc<CertifiedKey>, CertificateError> {
        if let Some(cert) = self.fresh_in_memory(host) {
            return Ok(cert);
        }

        if !self.config.allows(host) {
            return Err(CertificateError::HostNotAllowed(host.to_string()));
        }

        let lock = Arc::clone(
            self.issuing
                .entry(host.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        let _guard = lock.lock().await;

        // Another handshake may have finished issuing while we waited
        if let Some(cert) = self.fresh_in_memory(host) {
            return Ok(cert);
        }

        if let Some(cert) = self.load_cached(host)? {
            self.certs.insert(host.to_string(), Arc::clone(&cert));
            return Ok(cert);
        }

        let (certs, key, bundle) = self.obtain_certificate(host).await?;
        if let Err(e) = self.cache.put(host, bundle.as_bytes()) {
            warn!(host, error = %e, "Failed to cache certificate");
        }

        let cert = certified_key(certs, &key)?;
        self.certs.insert(host.to_string(), Arc::clone(&cert));
        Ok(cert)
    }

    fn fresh_in_memory(&self, host: &str) -> Option<Arc<CertifiedKey>> {
        let cert = self.certs.get(host).map(|c| Arc::clone(&c))?;
        let leaf = cert.cert.first()?;
        if is_cert_valid_for_days(leaf, self.config.renew_before_days) {
            Some(cert)
        } else {
            None
        }
    }

    /// Load a cached certificate if it is still valid long enough
    fn load_cached(&self, host: &str) -> Result<Option<Arc<CertifiedKey>>, CertificateError> {
        let data = match self.cache.get(host)? {
            Some(data) => data,
            None => return Ok(None),
        };

        let (certs, key) = match parse_bundle(&data) {
            Some(parsed) => parsed,
            None => {
                warn!(host, "Discarding unreadable cached certificate");
                self.cache.delete(host)?;
                return Ok(None);
            }
        };

        if !certs
            .first()
            .map(|c| is_cert_valid_for_days(c, self.config.renew_before_days))
            .unwrap_or(false)
        {
            info!(host, "Cached certificate expires soon, will renew");
            return Ok(None);
        }

        debug!(host, "Loaded cached certificate");
        Ok(Some(certified_key(certs, &key)?))
    }

    /// Load or create the ACME account
    async fn account(&self) -> Result<&Account, CertificateError> {
        self.account
            .get_or_try_init(|| async {
                if let Some(data) = self.cache.get(ACCOUNT_KEY)? {
                    debug!("Loading existing ACME account");
                    let credentials: AccountCredentials = serde_json::from_slice(&data)
                        .map_err(|e| CertificateError::Invalid(format!("account credentials: {}", e)))?;
                    return Ok(Account::from_credentials(credentials).await?);
                }

                info!("Creating new ACME account");
                let contact = self.config.email.as_ref().map(|e| format!("mailto:{}", e));
                let contacts: Vec<&str> = contact.iter().map(String::as_str).collect();
                let directory_url = self
                    .config
                    .directory_url
                    .as_deref()
                    .unwrap_or(LetsEncrypt::Production.url());

                let (account, credentials) = Account::create(
                    &NewAccount {
                        contact: &contacts,
                        terms_of_service_agreed: true,
                        only_return_existing: false,
                    },
                    directory_url,
                    None,
                )
                .await?;

                let data = serde_json::to_vec_pretty(&credentials)
                    .map_err(|e| CertificateError::Invalid(format!("account credentials: {}", e)))?;
                self.cache.put(ACCOUNT_KEY, &data)?;
                info!("ACME account credentials saved");

                Ok::<Account, CertificateError>(account)
            })
            .await
    }

    /// Run one ACME order for `host`
    async fn obtain_certificate(
        &self,
        host: &str,
    ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>, String), CertificateError> {
        let account = self.account().await?;
        let identifiers = [Identifier::Dns(host.to_string())];

        info!(host, "Requesting new certificate");

        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;

        let authorizations = order.authorizations().await?;

        for authz in authorizations {
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }

            let challenge_type = match self.config.challenge_type {
                AcmeChallengeType::Http01 => ChallengeType::Http01,
                AcmeChallengeType::TlsAlpn01 => ChallengeType::TlsAlpn01,
            };

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == challenge_type)
                .ok_or_else(|| {
                    CertificateError::Acme(format!(
                        "challenge type {:?} not available for {}",
                        self.config.challenge_type, host
                    ))
                })?;

            let key_auth = order.key_authorization(challenge);

            match self.config.challenge_type {
                AcmeChallengeType::Http01 => {
                    debug!(host, token = %challenge.token, "Setting up HTTP-01 challenge");
                    self.http01_challenges
                        .set(challenge.token.clone(), key_auth.as_str().to_string())
                        .await;
                }
                AcmeChallengeType::TlsAlpn01 => {
                    debug!(host, "Setting up TLS-ALPN-01 challenge");
                    let challenge_cert = create_tls_alpn01_cert(host, key_auth.digest().as_ref())?;
                    self.alpn_certs.insert(host.to_string(), challenge_cert);
                }
            }

            let result = self.validate_challenge(&mut order, &challenge.url, host).await;

            match self.config.challenge_type {
                AcmeChallengeType::Http01 => self.http01_challenges.remove(&challenge.token).await,
                AcmeChallengeType::TlsAlpn01 => {
                    self.alpn_certs.remove(host);
                }
            }

            result?;
        }

        // Wait for order to be ready
        let mut attempts = 0;
        loop {
            match order.state().status {
                OrderStatus::Ready | OrderStatus::Valid => break,
                OrderStatus::Invalid => {
                    return Err(CertificateError::Acme(format!("order invalid for {}", host)));
                }
                OrderStatus::Pending | OrderStatus::Processing => {
                    attempts += 1;
                    if attempts > MAX_POLLS {
                        return Err(CertificateError::Acme(format!("order timeout for {}", host)));
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                    order.refresh().await?;
                }
            }
        }

        // Generate CSR and finalize order
        let mut params = CertificateParams::new(vec![host.to_string()])?;
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, host);

        let private_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let csr = params.serialize_request(&private_key)?;

        order.finalize(csr.der()).await?;

        let mut attempts = 0;
        let cert_chain_pem: String = loop {
            order.refresh().await?;

            match order.state().status {
                OrderStatus::Valid => match order.certificate().await? {
                    Some(cert) => break cert,
                    None => {
                        return Err(CertificateError::Acme(
                            "order valid but no certificate returned".into(),
                        ))
                    }
                },
                OrderStatus::Processing => {
                    attempts += 1;
                    if attempts > MAX_POLLS {
                        return Err(CertificateError::Acme(format!("certificate timeout for {}", host)));
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                _ => {
                    return Err(CertificateError::Acme(format!(
                        "unexpected order status: {:?}",
                        order.state().status
                    )))
                }
            }
        };

        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut BufReader::new(cert_chain_pem.as_bytes()))
                .filter_map(|c| c.ok())
                .collect();

        let key = PrivateKeyDer::try_from(private_key.serialize_der())
            .map_err(|e| CertificateError::Invalid(format!("private key: {}", e)))?;

        let bundle = format!("{}{}", private_key.serialize_pem(), cert_chain_pem);

        info!(host, "Certificate obtained successfully");
        Ok((certs, key, bundle))
    }

    /// Tell the server the challenge is ready and wait for the authorization
    async fn validate_challenge(
        &self,
        order: &mut instant_acme::Order,
        challenge_url: &str,
        host: &str,
    ) -> Result<(), CertificateError> {
        order.set_challenge_ready(challenge_url).await?;

        let mut attempts = 0;
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;

            order.refresh().await?;
            let auths = order.authorizations().await?;
            let current = auths
                .iter()
                .find(|a| matches!(&a.identifier, Identifier::Dns(d) if d == host));

            match current.map(|a| &a.status) {
                Some(AuthorizationStatus::Valid) => {
                    info!(host, "Authorization valid");
                    return Ok(());
                }
                Some(AuthorizationStatus::Pending) => {
                    attempts += 1;
                    if attempts > MAX_POLLS {
                        return Err(CertificateError::Acme(format!("authorization timeout for {}", host)));
                    }
                    debug!(host, attempt = attempts, "Waiting for authorization");
                }
                Some(AuthorizationStatus::Invalid) => {
                    return Err(CertificateError::Acme(format!("authorization failed for {}", host)));
                }
                Some(status) => {
                    debug!(host, status = ?status, "Authorization status");
                }
                None => {
                    return Err(CertificateError::Acme(format!("authorization not found for {}", host)));
                }
            }
        }
    }
}

/// Split a cached PEM bundle into its chain and private key
fn parse_bundle(data: &[u8]) -> Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(data))
        .filter_map(|c| c.ok())
        .collect();
    if certs.is_empty() {
        return None;
    }
    let key = load_private_key(data)?;
    Some((certs, key))
}

/// Create a TLS-ALPN-01 challenge certificate
fn create_tls_alpn01_cert(domain: &str, digest: &[u8]) -> Result<Arc<CertifiedKey>, CertificateError> {
    use rcgen::{CustomExtension, IsCa, KeyUsagePurpose};

    let mut params = CertificateParams::new(vec![domain.to_string()])?;
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];

    // acmeIdentifier extension: OCTET STRING of the 32-byte key authorization digest
    let mut ext_value = vec![0x04, 0x20];
    ext_value.extend_from_slice(digest);

    let mut extension = CustomExtension::from_oid_content(ACME_ALPN_OID, ext_value);
    extension.set_criticality(true);
    params.custom_extensions.push(extension);

    let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
    let cert = params.self_signed(&key_pair)?;

    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| CertificateError::Invalid(format!("private key: {}", e)))?;

    certified_key(vec![CertificateDer::from(cert.der().to_vec())], &key_der)
}

fn load_private_key(data: &[u8]) -> Option<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(data);

    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(rustls_pemfile::Item::Pkcs1Key(key))) => return Some(key.into()),
            Ok(Some(rustls_pemfile::Item::Pkcs8Key(key))) => return Some(key.into()),
            Ok(Some(rustls_pemfile::Item::Sec1Key(key))) => return Some(key.into()),
            Ok(None) => return None,
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

pub(crate) fn is_cert_valid_for_days(cert: &CertificateDer<'_>, days: u64) -> bool {
    use x509_parser::prelude::*;

    let (_, parsed) = match X509Certificate::from_der(cert.as_ref()) {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "Failed to parse X.509 certificate");
            return false;
        }
    };

    let expiry = parsed.validity().not_after.timestamp();
    let now = chrono::Utc::now().timestamp();

    let remaining_secs = expiry - now;
    if remaining_secs < 0 {
        info!("Certificate has already expired");
        return false;
    }

    let remaining_days = remaining_secs as u64 / (24 * 60 * 60);
    if remaining_days < days {
        info!(
            remaining_days,
            required_days = days,
            "Certificate expires soon, renewal needed"
        );
        return false;
    }

    true
}

/// Validate and canonicalize the cache directory path
fn validate_cache_dir(path: &str) -> anyhow::Result<PathBuf> {
    if path.contains("..") {
        anyhow::bail!("ACME cache directory path must not contain '..'");
    }

    let path_buf = PathBuf::from(path);

    // If path exists, canonicalize it to resolve symlinks
    if path_buf.exists() {
        let canonical = path_buf.canonicalize().map_err(|e| {
            anyhow::anyhow!("Failed to canonicalize ACME cache directory '{}': {}", path, e)
        })?;

        if !canonical.is_dir() {
            anyhow::bail!("ACME cache path '{}' exists but is not a directory", path);
        }

        return Ok(canonical);
    }

    if let Some(parent) = path_buf.parent() {
        if parent.as_os_str().is_empty() {
            return Ok(path_buf);
        }

        if parent.exists() {
            let canonical_parent = parent.canonicalize().map_err(|e| {
                anyhow::anyhow!("Failed to canonicalize parent directory: {}", e)
            })?;

            if let Some(file_name) = path_buf.file_name() {
                return Ok(canonical_parent.join(file_name));
            }
        }
    }

    // Parent doesn't exist yet; created on first write
    Ok(path_buf)
}
