use crate::cluster::IngressRoute;
use serde::Deserialize;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the router
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub tls: TlsConfig,

    #[serde(default)]
    pub dns: DnsConfig,

    #[serde(default)]
    pub idle: IdleConfig,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub ingress: IngressConfig,

    #[serde(default)]
    pub cluster: ClusterConfig,
}

/// Log output format
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for the HTTP and HTTPS listeners (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// HTTP port (default: 80, set to 0 to disable)
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// HTTPS port (default: 443, set to 0 to disable)
    #[serde(default = "default_https_port")]
    pub https_port: u16,

    /// Bind address for the control API (default: 127.0.0.1)
    #[serde(default = "default_control_bind")]
    pub control_bind: String,

    /// Control API port (default: 9477, set to 0 to disable)
    #[serde(default = "default_control_port")]
    pub control_port: u16,

    /// Bearer token for the control API
    /// If not set, a random token is generated at startup and logged
    pub control_token: Option<String>,

    /// Maximum idle connections per backend target (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Max time to wait for a backend response in seconds (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,

    #[serde(default)]
    pub log_format: LogFormat,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            http_port: default_http_port(),
            https_port: default_https_port(),
            control_bind: default_control_bind(),
            control_port: default_control_port(),
            control_token: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
            pid_file: None,
            log_format: LogFormat::default(),
        }
    }
}

/// Routing store backend
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Process-local map (default)
    #[default]
    Memory,
    /// Shared SQLite database
    #[serde(alias = "dynamodb", alias = "sqlite")]
    Durable,
}

impl std::str::FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(StorageBackend::Memory),
            "durable" | "dynamodb" | "sqlite" => Ok(StorageBackend::Durable),
            other => Err(format!("unknown storage backend: {}", other)),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// Database file for the durable backend and certificate cache
    #[serde(default = "default_database")]
    pub database: String,

    /// Routes table name
    #[serde(default = "default_routes_table")]
    pub routes_table: String,

    /// Certificate cache table name
    #[serde(default = "default_cache_table")]
    pub cache_table: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            database: default_database(),
            routes_table: default_routes_table(),
            cache_table: default_cache_table(),
        }
    }
}

/// Challenge type for ACME domain validation
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub enum AcmeChallengeType {
    /// HTTP-01: Serves challenge response on port 80 at /.well-known/acme-challenge/
    #[default]
    #[serde(alias = "http01", alias = "HTTP-01")]
    #[serde(rename = "http-01")]
    Http01,
    /// TLS-ALPN-01: Serves challenge via TLS on port 443 with special ALPN protocol
    #[serde(alias = "tls-alpn01", alias = "TLS-ALPN-01")]
    #[serde(rename = "tls-alpn-01")]
    TlsAlpn01,
}

/// Where ACME account credentials and certificates are persisted
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum AcmeCacheKind {
    /// Cache table in the storage database (default)
    #[default]
    Database,
    /// Files under `cache_dir`
    Directory,
}

/// ACME (Let's Encrypt) configuration for on-demand certificate issuance
#[derive(Debug, Deserialize, Clone)]
pub struct AcmeConfig {
    /// Enable automated issuance instead of the rack CA
    #[serde(default)]
    pub enabled: bool,

    /// Contact email for Let's Encrypt notifications
    pub email: Option<String>,

    /// ACME directory URL (defaults to Let's Encrypt production)
    /// Use "https://acme-staging-v02.api.letsencrypt.org/directory" for testing
    pub directory_url: Option<String>,

    #[serde(default)]
    pub cache: AcmeCacheKind,

    /// Local directory for the directory cache
    #[serde(default = "default_acme_cache_dir")]
    pub cache_dir: String,

    /// Challenge type for domain validation (default: http-01)
    #[serde(default)]
    pub challenge_type: AcmeChallengeType,

    /// Domain suffixes certificates may be issued for; empty allows any host
    #[serde(default)]
    pub allowed_domains: Vec<String>,

    /// Reissue certificates with fewer days of validity left (default: 30)
    #[serde(default = "default_renew_before_days")]
    pub renew_before_days: u64,
}

impl AcmeConfig {
    /// Whether `host` may receive a certificate
    pub fn allows(&self, host: &str) -> bool {
        self.allowed_domains.is_empty()
            || self.allowed_domains.iter().any(|domain| {
                let domain = domain.trim_start_matches('.').to_ascii_lowercase();
                host == domain || host.ends_with(&format!(".{}", domain))
            })
    }
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            email: None,
            directory_url: None,
            cache: AcmeCacheKind::default(),
            cache_dir: default_acme_cache_dir(),
            challenge_type: AcmeChallengeType::default(),
            allowed_domains: Vec::new(),
            renew_before_days: default_renew_before_days(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TlsConfig {
    /// Rack name, used for the CA subject and the fallback certificate
    #[serde(default = "default_rack")]
    pub rack: String,

    /// CA certificate (PEM); generated at startup when unset
    pub ca_cert: Option<String>,

    /// CA private key (PEM)
    pub ca_key: Option<String>,

    #[serde(default)]
    pub acme: AcmeConfig,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            rack: default_rack(),
            ca_cert: None,
            ca_key: None,
            acme: AcmeConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DnsConfig {
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// UDP port (default: 5453, set to 0 to disable)
    #[serde(default = "default_dns_port")]
    pub port: u16,

    /// TTL for synthesised answers in seconds (default: 5)
    #[serde(default = "default_dns_ttl")]
    pub ttl_secs: u32,

    /// Resolver configuration the upstream nameserver is read from
    #[serde(default = "default_resolv_conf")]
    pub resolv_conf: String,

    /// Explicit upstream (`ip:port`), overrides the resolver file
    pub upstream: Option<String>,

    /// Upstream forwarding timeout in milliseconds (default: 2000)
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_ms: u64,

    /// Cluster lookup timeout in milliseconds (default: 1000)
    #[serde(default = "default_lookup_timeout")]
    pub lookup_timeout_ms: u64,
}

impl DnsConfig {
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_dns_port(),
            ttl_secs: default_dns_ttl(),
            resolv_conf: default_resolv_conf(),
            upstream: None,
            upstream_timeout_ms: default_upstream_timeout(),
            lookup_timeout_ms: default_lookup_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IdleConfig {
    /// Run the idle sweep (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between idle sweeps (default: 60)
    #[serde(default = "default_idle_check_interval")]
    pub check_interval_secs: u64,

    /// Seconds without traffic before a host is idled (default: 3600)
    #[serde(default = "default_idle_timeout")]
    pub timeout_secs: u64,

    /// Max seconds a request waits for a backend to leave idle (default: 30)
    #[serde(default = "default_unidle_timeout")]
    pub unidle_timeout_secs: u64,

    /// Initial ready-replica poll interval in milliseconds (default: 250)
    #[serde(default = "default_unidle_poll")]
    pub unidle_poll_ms: u64,
}

impl IdleConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn unidle_timeout(&self) -> Duration {
        Duration::from_secs(self.unidle_timeout_secs)
    }

    pub fn unidle_poll(&self) -> Duration {
        Duration::from_millis(self.unidle_poll_ms)
    }
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_secs: default_idle_check_interval(),
            timeout_secs: default_idle_timeout(),
            unidle_timeout_secs: default_unidle_timeout(),
            unidle_poll_ms: default_unidle_poll(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct NetworkConfig {
    /// This pod's address; its first two octets identify in-cluster peers
    pub pod_ip: Option<IpAddr>,

    /// Hostname of the gateway's own service as seen from inside the cluster
    pub service_host: Option<String>,

    #[serde(default = "default_router_namespace")]
    pub router_namespace: String,

    #[serde(default = "default_router_service")]
    pub router_service: String,

    /// Retry interval for address discovery in milliseconds (default: 1000)
    #[serde(default = "default_discovery_retry")]
    pub discovery_retry_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            pod_ip: None,
            service_host: None,
            router_namespace: default_router_namespace(),
            router_service: default_router_service(),
            discovery_retry_ms: default_discovery_retry(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngressConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between full resyncs (default: 300)
    #[serde(default = "default_resync")]
    pub resync_secs: u64,

    /// Upper bound for retry backoff in seconds (default: 60)
    #[serde(default = "default_backoff_max")]
    pub backoff_max_secs: u64,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            resync_secs: default_resync(),
            backoff_max_secs: default_backoff_max(),
        }
    }
}

/// Orchestration platform the router talks to
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ClusterMode {
    /// In-memory cluster seeded from this file (default)
    #[default]
    Static,
    Kubernetes,
}

impl std::str::FromStr for ClusterMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "static" => Ok(ClusterMode::Static),
            "kubernetes" | "k8s" => Ok(ClusterMode::Kubernetes),
            other => Err(format!("unknown cluster mode: {}", other)),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StaticService {
    pub namespace: String,
    pub name: String,
    pub ip: IpAddr,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StaticDeployment {
    pub namespace: String,
    pub name: String,
    #[serde(default = "default_replicas")]
    pub replicas: i32,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ClusterConfig {
    #[serde(default)]
    pub mode: ClusterMode,

    /// Router service address in static mode
    pub router_ip: Option<IpAddr>,

    #[serde(default)]
    pub services: Vec<StaticService>,

    #[serde(default)]
    pub deployments: Vec<StaticDeployment>,

    #[serde(default)]
    pub routes: Vec<IngressRoute>,
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    80
}

fn default_https_port() -> u16 {
    443
}

fn default_control_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_control_port() -> u16 {
    9477
}

fn default_pool_max_idle_per_host() -> usize {
    10 // Keep up to 10 idle connections per backend
}

fn default_pool_idle_timeout() -> u64 {
    90 // Close idle connections after 90 seconds
}

fn default_request_timeout() -> u64 {
    30
}

fn default_database() -> String {
    "./rack-router.db".to_string()
}

fn default_routes_table() -> String {
    "routes".to_string()
}

fn default_cache_table() -> String {
    "certs".to_string()
}

fn default_acme_cache_dir() -> String {
    "./acme_cache".to_string()
}

fn default_renew_before_days() -> u64 {
    30
}

fn default_rack() -> String {
    "convox".to_string()
}

fn default_dns_port() -> u16 {
    5453
}

fn default_dns_ttl() -> u32 {
    5
}

fn default_resolv_conf() -> String {
    "/etc/resolv.conf".to_string()
}

fn default_upstream_timeout() -> u64 {
    2000
}

fn default_lookup_timeout() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

fn default_idle_check_interval() -> u64 {
    60 // 1 minute
}

fn default_idle_timeout() -> u64 {
    3600 // 1 hour
}

fn default_unidle_timeout() -> u64 {
    30
}

fn default_unidle_poll() -> u64 {
    250
}

fn default_router_namespace() -> String {
    "convox-system".to_string()
}

fn default_router_service() -> String {
    "router".to_string()
}

fn default_discovery_retry() -> u64 {
    1000
}

fn default_resync() -> u64 {
    300
}

fn default_backoff_max() -> u64 {
    60
}

fn default_replicas() -> i32 {
    1
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a file
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Config::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(backend) = lookup("BACKEND") {
            self.storage.backend = backend.parse().map_err(anyhow::Error::msg)?;
        }
        if let Some(table) = lookup("ROUTER_ROUTES") {
            self.storage.routes_table = table;
        }
        if let Some(table) = lookup("ROUTER_CACHE") {
            self.storage.cache_table = table;
        }
        if let Some(path) = lookup("ROUTER_DB") {
            self.storage.database = path;
        }
        if let Some(autocert) = lookup("AUTOCERT") {
            self.tls.acme.enabled = autocert == "true";
        }
        if let Some(rack) = lookup("RACK") {
            self.tls.rack = rack;
        }
        if let Some(pod_ip) = lookup("POD_IP") {
            self.network.pod_ip = Some(
                pod_ip
                    .parse()
                    .map_err(|e| anyhow::anyhow!("POD_IP {:?}: {}", pod_ip, e))?,
            );
        }
        if let Some(host) = lookup("SERVICE_HOST") {
            self.network.service_host = Some(host);
        }
        if let Some(mode) = lookup("CLUSTER") {
            self.cluster.mode = mode.parse().map_err(anyhow::Error::msg)?;
        }

        Ok(())
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.tls.ca_cert.is_some() != self.tls.ca_key.is_some() {
            errors.push("tls: 'ca_cert' and 'ca_key' must be set together".to_string());
        }

        if self.idle.check_interval_secs == 0 {
            errors.push("idle: 'check_interval_secs' must be greater than 0".to_string());
        }

        if self.ingress.resync_secs == 0 {
            errors.push("ingress: 'resync_secs' must be greater than 0".to_string());
        }

        if let Some(upstream) = &self.dns.upstream {
            if upstream.parse::<std::net::SocketAddr>().is_err() {
                errors.push(format!("dns: upstream {:?} is not an ip:port address", upstream));
            }
        }

        for deployment in &self.cluster.deployments {
            if deployment.replicas < 0 {
                errors.push(format!(
                    "cluster: deployment '{}/{}' has negative replicas",
                    deployment.namespace, deployment.name
                ));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config.server.http_port, 80);
        assert_eq!(config.server.https_port, 443);
        assert_eq!(config.server.control_port, 9477);
        assert_eq!(config.server.control_bind, "127.0.0.1");
        assert_eq!(config.dns.port, 5453);
        assert_eq!(config.dns.ttl_secs, 5);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.cluster.mode, ClusterMode::Static);
        assert!(!config.tls.acme.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_idle_defaults() {
        let idle = IdleConfig::default();
        assert!(idle.enabled);
        assert_eq!(idle.check_interval(), Duration::from_secs(60));
        assert_eq!(idle.timeout(), Duration::from_secs(3600));
        assert_eq!(idle.unidle_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
http_port = 8080
https_port = 8443
control_token = "secret"
log_format = "json"

[storage]
backend = "durable"
database = "/var/lib/router/routes.db"

[tls]
rack = "production"

[tls.acme]
enabled = true
email = "ops@example.com"
challenge_type = "tls-alpn-01"
allowed_domains = ["example.com"]

[dns]
port = 53
upstream = "10.0.0.2:53"

[idle]
timeout_secs = 600

[cluster]
mode = "static"
router_ip = "10.0.0.10"

[[cluster.services]]
namespace = "myapp"
name = "web"
ip = "10.96.0.12"

[[cluster.deployments]]
namespace = "myapp"
name = "web"

[[cluster.routes]]
host = "web.example.com"
target = "http://web.myapp.svc.cluster.local:3000"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.http_port, 8080);
        assert_eq!(config.server.control_token.as_deref(), Some("secret"));
        assert_eq!(config.server.log_format, LogFormat::Json);
        assert_eq!(config.storage.backend, StorageBackend::Durable);
        assert_eq!(config.tls.rack, "production");
        assert_eq!(config.tls.acme.challenge_type, AcmeChallengeType::TlsAlpn01);
        assert_eq!(config.tls.acme.renew_before_days, 30);
        assert_eq!(config.dns.port, 53);
        assert_eq!(config.idle.timeout(), Duration::from_secs(600));
        assert_eq!(config.cluster.services.len(), 1);
        assert_eq!(config.cluster.deployments[0].replicas, 1);
        assert_eq!(config.cluster.routes[0].host, "web.example.com");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_legacy_backend_alias() {
        let config: Config = toml::from_str("[storage]\nbackend = \"dynamodb\"").unwrap();
        assert_eq!(config.storage.backend, StorageBackend::Durable);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env(env(&[
                ("BACKEND", "dynamodb"),
                ("ROUTER_ROUTES", "rack_routes"),
                ("ROUTER_CACHE", "rack_certs"),
                ("AUTOCERT", "true"),
                ("POD_IP", "10.1.4.7"),
                ("SERVICE_HOST", "router.convox-system.svc.cluster.local"),
                ("RACK", "staging"),
                ("CLUSTER", "kubernetes"),
            ]))
            .unwrap();

        assert_eq!(config.storage.backend, StorageBackend::Durable);
        assert_eq!(config.storage.routes_table, "rack_routes");
        assert_eq!(config.storage.cache_table, "rack_certs");
        assert!(config.tls.acme.enabled);
        assert_eq!(config.network.pod_ip, Some("10.1.4.7".parse().unwrap()));
        assert_eq!(config.tls.rack, "staging");
        assert_eq!(config.cluster.mode, ClusterMode::Kubernetes);
    }

    #[test]
    fn test_env_autocert_only_true_enables() {
        let mut config = Config::default();
        config.tls.acme.enabled = true;
        config.apply_env(env(&[("AUTOCERT", "yes")])).unwrap();
        assert!(!config.tls.acme.enabled);
    }

    #[test]
    fn test_env_rejects_bad_values() {
        assert!(Config::default().apply_env(env(&[("BACKEND", "redis")])).is_err());
        assert!(Config::default().apply_env(env(&[("POD_IP", "nope")])).is_err());
        assert!(Config::default().apply_env(env(&[("CLUSTER", "nomad")])).is_err());
    }

    #[test]
    fn test_empty_env_values_ignored() {
        let mut config = Config::default();
        config.apply_env(env(&[("BACKEND", ""), ("RACK", "")])).unwrap();
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.tls.rack, "convox");
    }

    #[test]
    fn test_validate_ca_pair() {
        let mut config = Config::default();
        config.tls.ca_cert = Some("/etc/router/ca.pem".into());
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("ca_cert"));
    }

    #[test]
    fn test_validate_upstream() {
        let mut config = Config::default();
        config.dns.upstream = Some("not-an-address".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_acme_allowed_domains() {
        let mut acme = AcmeConfig::default();
        assert!(acme.allows("anything.test"));

        acme.allowed_domains = vec!["example.com".into()];
        assert!(acme.allows("example.com"));
        assert!(acme.allows("app.example.com"));
        assert!(!acme.allows("badexample.com"));
        assert!(!acme.allows("example.org"));
    }
}
