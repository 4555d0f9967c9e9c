//! Orchestration platform capability
//!
//! The router only needs a narrow slice of the cluster: service addresses,
//! deployment replica counts, scaling, and the ingress rules that define
//! routes. [`KubeCluster`] talks to Kubernetes; [`StaticCluster`] keeps the
//! same state in memory for standalone runs and tests.

use crate::router::internal_target;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{BoxStream, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::{Ingress, IngressServiceBackend};
use kube::api::{ListParams, Patch, PatchParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("kubernetes api: {0}")]
    Kube(#[from] kube::Error),

    #[error("watch failed: {0}")]
    Watch(#[from] watcher::Error),

    #[error("cluster unavailable: {0}")]
    Unavailable(String),
}

/// One host to target pair derived from an ingress rule
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct IngressRoute {
    pub host: String,
    pub target: String,
}

#[async_trait]
pub trait Cluster: Send + Sync {
    /// Cluster IP of a service, `None` if the service does not exist or is headless
    async fn service_ip(&self, namespace: &str, service: &str) -> Result<Option<IpAddr>, ClusterError>;

    /// Externally reachable address of the router's own service
    async fn router_ip(&self, namespace: &str, service: &str) -> Result<Option<IpAddr>, ClusterError>;

    /// Desired replica count of a deployment, `None` if it does not exist
    async fn desired_replicas(&self, namespace: &str, deployment: &str) -> Result<Option<i32>, ClusterError>;

    async fn ready_replicas(&self, namespace: &str, deployment: &str) -> Result<i32, ClusterError>;

    async fn scale(&self, namespace: &str, deployment: &str, replicas: i32) -> Result<(), ClusterError>;

    /// Desired routes from every ingress rule in the cluster
    async fn ingress_routes(&self) -> Result<Vec<IngressRoute>, ClusterError>;

    /// Yields whenever ingress or service resources change
    fn changes(&self) -> BoxStream<'static, Result<(), ClusterError>>;
}

/// Kubernetes-backed cluster access
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    /// Connect using in-cluster configuration, falling back to the local kubeconfig
    pub async fn connect() -> Result<Self, ClusterError> {
        let client = Client::try_default().await?;
        info!("Connected to Kubernetes API");
        Ok(Self { client })
    }
}

/// Services keyed by `(namespace, name)`, for resolving named ingress ports
pub type ServiceIndex = HashMap<(String, String), Service>;

/// Routes declared by one ingress.
///
/// Rules without a host and backends that are not services are skipped.
/// Named ports resolve through the backend's service in `services`.
pub fn routes_from_ingress(ingress: &Ingress, services: &ServiceIndex) -> Vec<IngressRoute> {
    let namespace = match ingress.metadata.namespace.as_deref() {
        Some(ns) => ns,
        None => return Vec::new(),
    };
    let rules = ingress.spec.as_ref().and_then(|s| s.rules.as_ref());

    let mut routes = Vec::new();
    for rule in rules.into_iter().flatten() {
        let host = match rule.host.as_deref() {
            Some(h) if !h.is_empty() => h.to_ascii_lowercase(),
            _ => continue,
        };
        let paths = rule.http.as_ref().map(|h| h.paths.as_slice()).unwrap_or_default();

        for path in paths {
            let backend = match path.backend.service.as_ref() {
                Some(b) => b,
                None => continue,
            };
            let service = services.get(&(namespace.to_string(), backend.name.clone()));
            match backend_port(backend, service) {
                Some(port) => routes.push(IngressRoute {
                    host: host.clone(),
                    target: internal_target(&backend.name, namespace, port),
                }),
                None => {
                    debug!(host, service = %backend.name, namespace, "Ingress backend port unresolved");
                }
            }
        }
    }

    routes
}

fn backend_port(backend: &IngressServiceBackend, service: Option<&Service>) -> Option<u16> {
    let port = backend.port.as_ref()?;

    if let Some(number) = port.number {
        return u16::try_from(number).ok();
    }

    let name = port.name.as_deref()?;
    service?
        .spec
        .as_ref()?
        .ports
        .as_ref()?
        .iter()
        .find(|p| p.name.as_deref() == Some(name))
        .and_then(|p| u16::try_from(p.port).ok())
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn service_ip(&self, namespace: &str, service: &str) -> Result<Option<IpAddr>, ClusterError> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let service = services.get_opt(service).await?;
        Ok(service
            .and_then(|s| s.spec)
            .and_then(|spec| spec.cluster_ip)
            .and_then(|ip| ip.parse().ok()))
    }

    async fn router_ip(&self, namespace: &str, service: &str) -> Result<Option<IpAddr>, ClusterError> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let service = match services.get_opt(service).await? {
            Some(s) => s,
            None => return Ok(None),
        };

        // Local clusters publish the load balancer as "localhost"
        let lb_hostname = service
            .status
            .as_ref()
            .and_then(|s| s.load_balancer.as_ref())
            .and_then(|lb| lb.ingress.as_ref())
            .and_then(|ingress| ingress.first())
            .and_then(|ing| ing.hostname.as_deref());
        if lb_hostname == Some("localhost") {
            return Ok(Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        }

        Ok(service
            .spec
            .and_then(|spec| spec.cluster_ip)
            .and_then(|ip| ip.parse().ok()))
    }

    async fn desired_replicas(&self, namespace: &str, deployment: &str) -> Result<Option<i32>, ClusterError> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(deployments
            .get_opt(deployment)
            .await?
            .map(|d| d.spec.and_then(|s| s.replicas).unwrap_or(1)))
    }

    async fn ready_replicas(&self, namespace: &str, deployment: &str) -> Result<i32, ClusterError> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(deployments
            .get_opt(deployment)
            .await?
            .and_then(|d| d.status)
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0))
    }

    async fn scale(&self, namespace: &str, deployment: &str, replicas: i32) -> Result<(), ClusterError> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        deployments
            .patch(deployment, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        info!(namespace, deployment, replicas, "Deployment scaled");
        Ok(())
    }

    async fn ingress_routes(&self) -> Result<Vec<IngressRoute>, ClusterError> {
        let ingresses = Api::<Ingress>::all(self.client.clone())
            .list(&ListParams::default())
            .await?;
        let services: ServiceIndex = Api::<Service>::all(self.client.clone())
            .list(&ListParams::default())
            .await?
            .items
            .into_iter()
            .filter_map(|svc| {
                let key = (svc.metadata.namespace.clone()?, svc.metadata.name.clone()?);
                Some((key, svc))
            })
            .collect();

        Ok(ingresses
            .items
            .iter()
            .flat_map(|ingress| routes_from_ingress(ingress, &services))
            .collect())
    }

    fn changes(&self) -> BoxStream<'static, Result<(), ClusterError>> {
        let ingresses = watcher(Api::<Ingress>::all(self.client.clone()), watcher::Config::default())
            .default_backoff()
            .map(|event| event.map(|_| ()).map_err(ClusterError::from));
        let services = watcher(Api::<Service>::all(self.client.clone()), watcher::Config::default())
            .default_backoff()
            .map(|event| event.map(|_| ()).map_err(ClusterError::from));

        futures::stream::select(ingresses, services).boxed()
    }
}

#[derive(Debug, Clone, Copy)]
struct DeploymentState {
    desired: i32,
    ready: i32,
}

/// In-memory cluster for running without an orchestration platform.
///
/// Scaling a deployment makes its replicas ready immediately unless
/// [`StaticCluster::hold_ready`] was called.
#[derive(Default)]
pub struct StaticCluster {
    services: DashMap<(String, String), IpAddr>,
    deployments: DashMap<(String, String), DeploymentState>,
    routes: RwLock<Vec<IngressRoute>>,
    router_ip: RwLock<Option<IpAddr>>,
    hold_ready: AtomicBool,
    watchers: Mutex<Vec<futures::channel::mpsc::UnboundedSender<Result<(), ClusterError>>>>,
}

impl StaticCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_service(&self, namespace: &str, service: &str, ip: IpAddr) {
        self.services.insert((namespace.to_string(), service.to_string()), ip);
        self.notify();
    }

    pub fn remove_service(&self, namespace: &str, service: &str) {
        self.services.remove(&(namespace.to_string(), service.to_string()));
        self.notify();
    }

    pub fn set_router_ip(&self, ip: IpAddr) {
        *self.router_ip.write() = Some(ip);
    }

    /// Register a deployment with `replicas` desired and ready
    pub fn set_deployment(&self, namespace: &str, deployment: &str, replicas: i32) {
        self.deployments.insert(
            (namespace.to_string(), deployment.to_string()),
            DeploymentState {
                desired: replicas,
                ready: replicas,
            },
        );
    }

    /// `(desired, ready)` replicas of a deployment
    pub fn replicas(&self, namespace: &str, deployment: &str) -> Option<(i32, i32)> {
        self.deployments
            .get(&(namespace.to_string(), deployment.to_string()))
            .map(|d| (d.desired, d.ready))
    }

    /// Stop scale-ups from producing ready replicas (simulates a stuck rollout)
    pub fn hold_ready(&self, hold: bool) {
        self.hold_ready.store(hold, Ordering::SeqCst);
    }

    pub fn set_ingress_routes(&self, routes: Vec<IngressRoute>) {
        *self.routes.write() = routes;
        self.notify();
    }

    fn notify(&self) {
        self.watchers
            .lock()
            .retain(|tx| tx.unbounded_send(Ok(())).is_ok());
    }
}

#[async_trait]
impl Cluster for StaticCluster {
    async fn service_ip(&self, namespace: &str, service: &str) -> Result<Option<IpAddr>, ClusterError> {
        Ok(self
            .services
            .get(&(namespace.to_string(), service.to_string()))
            .map(|ip| *ip))
    }

    async fn router_ip(&self, _namespace: &str, _service: &str) -> Result<Option<IpAddr>, ClusterError> {
        Ok(*self.router_ip.read())
    }

    async fn desired_replicas(&self, namespace: &str, deployment: &str) -> Result<Option<i32>, ClusterError> {
        Ok(self.replicas(namespace, deployment).map(|(desired, _)| desired))
    }

    async fn ready_replicas(&self, namespace: &str, deployment: &str) -> Result<i32, ClusterError> {
        Ok(self.replicas(namespace, deployment).map(|(_, ready)| ready).unwrap_or(0))
    }

    async fn scale(&self, namespace: &str, deployment: &str, replicas: i32) -> Result<(), ClusterError> {
        let hold = self.hold_ready.load(Ordering::SeqCst);
        let mut entry = self
            .deployments
            .entry((namespace.to_string(), deployment.to_string()))
            .or_insert(DeploymentState { desired: 0, ready: 0 });
        entry.desired = replicas;
        if !hold || replicas < entry.ready {
            entry.ready = replicas;
        }
        debug!(namespace, deployment, replicas, "Static deployment scaled");
        Ok(())
    }

    async fn ingress_routes(&self) -> Result<Vec<IngressRoute>, ClusterError> {
        Ok(self.routes.read().clone())
    }

    fn changes(&self) -> BoxStream<'static, Result<(), ClusterError>> {
        let (tx, rx) = futures::channel::mpsc::unbounded();
        self.watchers.lock().push(tx);
        rx.boxed()
    }
}
