//! Routing facade shared by every listener
//!
//! Wraps the routing store with the behaviour listeners need: random
//! target selection, idle-flag synchronisation on target registration,
//! request accounting with guaranteed release, and the internal/external
//! address split used by DNS answers.

use crate::cluster::Cluster;
use crate::config::{IdleConfig, NetworkConfig};
use crate::error::RouterError;
use crate::idle::{deployments_for, Unidler};
use crate::server::shutdown_signalled;
use crate::storage::Storage;
use hyper::Uri;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const INTERNAL_SUFFIX: &str = ".svc.cluster.local";

/// Split `<service>.<namespace>.svc.cluster.local` into `(service, namespace)`
pub fn parse_internal_name(name: &str) -> Option<(String, String)> {
    let name = name.trim_end_matches('.').to_ascii_lowercase();
    let prefix = name.strip_suffix(INTERNAL_SUFFIX)?;
    let (service, namespace) = prefix.split_once('.')?;
    if service.is_empty() || namespace.is_empty() || namespace.contains('.') {
        return None;
    }
    Some((service.to_string(), namespace.to_string()))
}

/// Recover `(service, namespace)` from an internal target URL; other targets are opaque
pub fn parse_target(target: &str) -> Option<(String, String)> {
    let uri: Uri = target.parse().ok()?;
    parse_internal_name(uri.host()?)
}

/// Target URL for a service port inside the cluster
pub fn internal_target(service: &str, namespace: &str, port: u16) -> String {
    format!("http://{}.{}{}:{}", service, namespace, INTERNAL_SUFFIX, port)
}

/// First two octets of an IPv4 address
fn subnet_prefix(ip: IpAddr) -> Option<[u8; 2]> {
    match ip.to_canonical() {
        IpAddr::V4(v4) => {
            let [a, b, _, _] = v4.octets();
            Some([a, b])
        }
        IpAddr::V6(_) => None,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Addresses {
    /// Externally reachable router address
    pub router_ip: Option<IpAddr>,
    /// Gateway service address as seen from inside the cluster
    pub service_ip: Option<IpAddr>,
    /// Subnet of this pod; peers sharing it are in-cluster
    pub prefix: Option<[u8; 2]>,
}

/// Releases a request slot when dropped
pub struct RequestGuard {
    storage: Arc<dyn Storage>,
    host: String,
}

impl std::fmt::Debug for RequestGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestGuard").field("host", &self.host).finish()
    }
}

impl RequestGuard {
    pub fn host(&self) -> &str {
        &self.host
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        if let Err(e) = self.storage.request_end(&self.host) {
            warn!(host = %self.host, error = %e, "Failed to end request");
        }
    }
}

pub struct Router {
    storage: Arc<dyn Storage>,
    cluster: Arc<dyn Cluster>,
    unidler: Arc<Unidler>,
    addresses: RwLock<Addresses>,
}

impl Router {
    pub fn new(
        storage: Arc<dyn Storage>,
        cluster: Arc<dyn Cluster>,
        idle: &IdleConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let unidler = Arc::new(Unidler::new(
            Arc::clone(&storage),
            Arc::clone(&cluster),
            idle,
            shutdown,
        ));
        Self {
            storage,
            cluster,
            unidler,
            addresses: RwLock::new(Addresses::default()),
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn cluster(&self) -> &Arc<dyn Cluster> {
        &self.cluster
    }

    pub fn unidler(&self) -> &Arc<Unidler> {
        &self.unidler
    }

    /// Pick one of the host's targets uniformly at random
    pub fn route(&self, host: &str) -> Result<String, RouterError> {
        let targets = self.storage.target_list(host).map_err(|e| {
            debug!(host, error = %e, "Target lookup failed");
            RouterError::NoBackends
        })?;
        targets
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or(RouterError::NoBackends)
    }

    /// Register a target and resynchronise the host's idle flag
    pub async fn target_add(&self, host: &str, target: &str) -> Result<(), RouterError> {
        info!(host, target, "Target added");
        self.storage.target_add(host, target)?;

        let idle = match self.host_idle_status(host).await {
            Ok(idle) => idle,
            Err(e) => {
                warn!(host, error = %e, "Could not determine idle status");
                false
            }
        };
        self.storage.idle_set(host, idle)?;
        Ok(())
    }

    pub fn target_remove(&self, host: &str, target: &str) -> Result<(), RouterError> {
        info!(host, target, "Target removed");
        self.storage.target_remove(host, target)?;
        Ok(())
    }

    pub fn target_list(&self, host: &str) -> Result<Vec<String>, RouterError> {
        Ok(self.storage.target_list(host)?)
    }

    /// Whether every deployment behind the host's internal targets is scaled to zero
    pub async fn host_idle_status(&self, host: &str) -> Result<bool, RouterError> {
        let deployments = deployments_for(&self.storage.target_list(host)?);
        if deployments.is_empty() {
            return Ok(false);
        }

        for (namespace, deployment) in &deployments {
            match self.cluster.desired_replicas(namespace, deployment).await? {
                Some(0) => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Count a request in, unidling the host first if needed.
    ///
    /// The returned guard ends the request when dropped, including when
    /// this call itself fails after counting the request.
    pub async fn request_begin(&self, host: &str) -> Result<RequestGuard, RouterError> {
        self.storage.request_begin(host)?;
        let guard = RequestGuard {
            storage: Arc::clone(&self.storage),
            host: host.to_string(),
        };

        if self.storage.idle_get(host)? {
            let targets = self.storage.target_list(host)?;
            self.unidler.unidle(host, &targets).await?;
        }

        Ok(guard)
    }

    pub fn request_end(&self, host: &str) -> Result<(), RouterError> {
        Ok(self.storage.request_end(host)?)
    }

    pub fn addresses(&self) -> Addresses {
        self.addresses.read().clone()
    }

    pub fn set_addresses(&self, addresses: Addresses) {
        *self.addresses.write() = addresses;
    }

    /// Address a peer should use to reach the router.
    ///
    /// Peers inside this pod's subnet get the in-cluster service address;
    /// everyone else gets the externally reachable router address.
    pub fn external_ip(&self, peer: IpAddr) -> IpAddr {
        let addresses = self.addresses.read();
        let fallback = addresses
            .router_ip
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));

        match (addresses.prefix, subnet_prefix(peer), addresses.service_ip) {
            (Some(own), Some(theirs), Some(service)) if own == theirs => service,
            _ => fallback,
        }
    }

    /// Work out the router's own addresses before serving.
    ///
    /// The service host lookup is retried until it resolves or shutdown
    /// is signalled; a router service lookup failure is fatal.
    pub async fn discover_addresses(
        &self,
        network: &NetworkConfig,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let prefix = network.pod_ip.and_then(subnet_prefix);

        let service_ip = match network.service_host.as_deref() {
            Some(host) => {
                let retry = Duration::from_millis(network.discovery_retry_ms);
                tokio::select! {
                    ip = resolve_with_retry(host, retry) => Some(ip),
                    _ = shutdown_signalled(&mut shutdown) => return Ok(()),
                }
            }
            None => None,
        };

        let router_ip = self
            .cluster
            .router_ip(&network.router_namespace, &network.router_service)
            .await
            .map_err(|e| anyhow::anyhow!("router service lookup failed: {}", e))?;

        let addresses = Addresses {
            router_ip,
            service_ip,
            prefix,
        };
        info!(
            router_ip = ?addresses.router_ip,
            service_ip = ?addresses.service_ip,
            prefix = ?addresses.prefix,
            "Router addresses discovered"
        );
        self.set_addresses(addresses);
        Ok(())
    }
}

async fn resolve_with_retry(host: &str, retry: Duration) -> IpAddr {
    loop {
        match tokio::net::lookup_host((host, 0)).await {
            Ok(mut addrs) => {
                if let Some(addr) = addrs.next() {
                    return addr.ip();
                }
                debug!(host, "Service host resolved to no addresses");
            }
            Err(e) => debug!(host, error = %e, "Service host lookup failed"),
        }
        tokio::time::sleep(retry).await;
    }
}
