//! Scale-to-zero lifecycle
//!
//! [`IdleController`] periodically idles hosts that have seen no traffic
//! for the configured timeout and scales their deployments to zero.
//! [`Unidler`] brings them back when a request arrives: one shared task
//! per host scales each deployment up and waits for ready replicas while
//! callers wait on it with a bound.

use crate::cluster::Cluster;
use crate::config::IdleConfig;
use crate::error::RouterError;
use crate::router::{parse_target, Router};
use crate::server::shutdown_signalled;
use crate::storage::{normalize_host, Storage};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const MAX_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Unidle tasks keep waiting for readiness this many times longer than callers do
const TASK_LIMIT_FACTOR: u32 = 4;

#[derive(Debug, Clone, PartialEq)]
enum UnidleOutcome {
    Ready,
    Failed(String),
}

/// `(namespace, deployment)` pairs behind a host's internal targets
pub fn deployments_for(targets: &[String]) -> Vec<(String, String)> {
    let mut deployments: Vec<(String, String)> = targets
        .iter()
        .filter_map(|t| parse_target(t))
        .map(|(service, namespace)| (namespace, service))
        .collect();
    deployments.sort();
    deployments.dedup();
    deployments
}

/// Deduplicated scale-from-zero tasks
pub struct Unidler {
    storage: Arc<dyn Storage>,
    cluster: Arc<dyn Cluster>,
    timeout: Duration,
    poll: Duration,
    pending: DashMap<String, watch::Receiver<Option<UnidleOutcome>>>,
    shutdown: watch::Receiver<bool>,
}

impl Unidler {
    pub fn new(
        storage: Arc<dyn Storage>,
        cluster: Arc<dyn Cluster>,
        config: &IdleConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            storage,
            cluster,
            timeout: config.unidle_timeout(),
            poll: config.unidle_poll(),
            pending: DashMap::new(),
            shutdown,
        }
    }

    /// Number of hosts currently being unidled
    pub fn in_progress(&self) -> usize {
        self.pending.len()
    }

    /// Bring `host` out of idle, waiting at most the configured bound.
    ///
    /// Concurrent callers for the same host share one task. A timeout does
    /// not cancel the task; the scale-up stands and the idle flag clears
    /// once replicas are ready.
    pub async fn unidle(self: &Arc<Self>, host: &str, targets: &[String]) -> Result<(), RouterError> {
        let key = normalize_host(host)?;
        let host = key.as_str();
        let mut rx = match self.pending.entry(host.to_string()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let (tx, rx) = watch::channel(None);
                entry.insert(rx.clone());
                let deployments = deployments_for(targets);
                tokio::spawn(Arc::clone(self).drive(host.to_string(), deployments, tx));
                rx
            }
        };

        let outcome = match tokio::time::timeout(self.timeout, rx.wait_for(|o| o.is_some())).await {
            Err(_) => {
                warn!(host, timeout_secs = self.timeout.as_secs(), "Unidle timed out");
                return Err(RouterError::UnidleTimeout);
            }
            Ok(Err(_)) => return Err(RouterError::Unidle("unidle task ended".into())),
            Ok(Ok(outcome)) => outcome.clone(),
        };

        match outcome {
            Some(UnidleOutcome::Ready) => Ok(()),
            Some(UnidleOutcome::Failed(reason)) => Err(RouterError::Unidle(reason)),
            None => Err(RouterError::Unidle("unidle task ended".into())),
        }
    }

    async fn drive(
        self: Arc<Self>,
        host: String,
        deployments: Vec<(String, String)>,
        tx: watch::Sender<Option<UnidleOutcome>>,
    ) {
        let mut shutdown = self.shutdown.clone();
        let limit = self.timeout * TASK_LIMIT_FACTOR;

        let outcome = tokio::select! {
            result = tokio::time::timeout(limit, self.scale_up(&host, &deployments)) => {
                result.unwrap_or_else(|_| UnidleOutcome::Failed("backend did not become ready".into()))
            }
            _ = shutdown_signalled(&mut shutdown) => UnidleOutcome::Failed("shutting down".into()),
        };

        let outcome = match outcome {
            UnidleOutcome::Ready => match self.storage.idle_set(&host, false) {
                Ok(()) => {
                    info!(host, "Host unidled");
                    UnidleOutcome::Ready
                }
                Err(e) => UnidleOutcome::Failed(e.to_string()),
            },
            failed => failed,
        };

        if let UnidleOutcome::Failed(reason) = &outcome {
            warn!(host, reason, "Unidle failed");
        }

        // Publish before removing so late joiners see the result
        let _ = tx.send(Some(outcome));
        self.pending.remove(&host);
    }

    async fn scale_up(&self, host: &str, deployments: &[(String, String)]) -> UnidleOutcome {
        for (namespace, deployment) in deployments {
            match self.cluster.desired_replicas(namespace, deployment).await {
                Ok(Some(0)) => {
                    if let Err(e) = self.cluster.scale(namespace, deployment, 1).await {
                        return UnidleOutcome::Failed(e.to_string());
                    }
                    info!(host, namespace, deployment, "Scaling up from zero");
                }
                Ok(Some(_)) => {}
                Ok(None) => debug!(host, namespace, deployment, "Deployment not found"),
                Err(e) => return UnidleOutcome::Failed(e.to_string()),
            }
        }

        let mut delay = self.poll;
        loop {
            if self.all_ready(host, deployments).await {
                return UnidleOutcome::Ready;
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(MAX_POLL_INTERVAL);
        }
    }

    async fn all_ready(&self, host: &str, deployments: &[(String, String)]) -> bool {
        for (namespace, deployment) in deployments {
            match self.cluster.ready_replicas(namespace, deployment).await {
                Ok(n) if n > 0 => {}
                Ok(_) => return false,
                Err(e) => {
                    debug!(host, namespace, deployment, error = %e, "Ready check failed");
                    return false;
                }
            }
        }
        true
    }
}

/// Periodic idle sweep
pub struct IdleController {
    router: Arc<Router>,
    interval: Duration,
    timeout: Duration,
}

impl IdleController {
    pub fn new(router: Arc<Router>, config: &IdleConfig) -> Self {
        Self {
            router,
            interval: config.check_interval(),
            timeout: config.timeout(),
        }
    }

    /// Idle every stale host with internal targets; returns the hosts idled
    pub async fn sweep(&self) -> Result<Vec<String>, RouterError> {
        let timeout = chrono::Duration::from_std(self.timeout)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let cutoff = chrono::Utc::now() - timeout;

        let storage = self.router.storage();
        let cluster = self.router.cluster();
        let mut idled = Vec::new();

        for host in storage.stale(cutoff)? {
            let targets = match storage.target_list(&host) {
                Ok(targets) => targets,
                Err(e) => {
                    warn!(host, error = %e, "Failed to list targets during idle sweep");
                    continue;
                }
            };

            let deployments = deployments_for(&targets);
            if deployments.is_empty() {
                continue;
            }

            match storage.idle_if_stale(&host, cutoff) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(host, "Host became active during idle sweep");
                    continue;
                }
                Err(e) => {
                    warn!(host, error = %e, "Failed to mark host idle");
                    continue;
                }
            }
            info!(host, idle_secs = self.timeout.as_secs(), "Host idle timeout reached");

            for (namespace, deployment) in &deployments {
                if let Err(e) = cluster.scale(namespace, deployment, 0).await {
                    warn!(host, namespace, deployment, error = %e, "Failed to scale down");
                }
            }

            idled.push(host);
        }

        Ok(idled)
    }

    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.sweep().await {
                        warn!(error = %e, "Idle sweep failed");
                    }
                }
                _ = shutdown_signalled(&mut shutdown_rx) => break,
            }
        }
        debug!("Idle controller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::StaticCluster;
    use crate::storage::{HostActivity, MemoryStorage, StorageError};
    use chrono::{DateTime, Utc};

    /// Store where a request begins on every stale host right after it is listed
    struct ActiveAfterListing(MemoryStorage);

    impl Storage for ActiveAfterListing {
        fn host_list(&self) -> Result<Vec<String>, StorageError> {
            self.0.host_list()
        }
        fn idle_get(&self, host: &str) -> Result<bool, StorageError> {
            self.0.idle_get(host)
        }
        fn idle_set(&self, host: &str, idle: bool) -> Result<(), StorageError> {
            self.0.idle_set(host, idle)
        }
        fn request_begin(&self, host: &str) -> Result<(), StorageError> {
            self.0.request_begin(host)
        }
        fn request_end(&self, host: &str) -> Result<(), StorageError> {
            self.0.request_end(host)
        }
        fn stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, StorageError> {
            let hosts = self.0.stale(cutoff)?;
            for host in &hosts {
                self.0.request_begin(host)?;
            }
            Ok(hosts)
        }
        fn idle_if_stale(&self, host: &str, cutoff: DateTime<Utc>) -> Result<bool, StorageError> {
            self.0.idle_if_stale(host, cutoff)
        }
        fn target_add(&self, host: &str, target: &str) -> Result<(), StorageError> {
            self.0.target_add(host, target)
        }
        fn target_list(&self, host: &str) -> Result<Vec<String>, StorageError> {
            self.0.target_list(host)
        }
        fn target_remove(&self, host: &str, target: &str) -> Result<(), StorageError> {
            self.0.target_remove(host, target)
        }
        fn activity(&self, host: &str) -> Result<Option<HostActivity>, StorageError> {
            self.0.activity(host)
        }
    }

    const WEB: &str = "http://web.myapp.svc.cluster.local:3000";

    fn idle_config(timeout_secs: u64, unidle_timeout_secs: u64) -> IdleConfig {
        IdleConfig {
            timeout_secs,
            unidle_timeout_secs,
            unidle_poll_ms: 10,
            ..IdleConfig::default()
        }
    }

    fn setup(config: &IdleConfig) -> (Arc<Router>, Arc<StaticCluster>, watch::Sender<bool>) {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let cluster = Arc::new(StaticCluster::new());
        cluster.set_deployment("myapp", "web", 1);
        let (tx, rx) = watch::channel(false);
        let router = Arc::new(Router::new(storage, cluster.clone(), config, rx));
        (router, cluster, tx)
    }

    #[test]
    fn test_deployments_for_ignores_opaque_targets() {
        let targets = vec![
            WEB.to_string(),
            "http://web.myapp.svc.cluster.local:4000".to_string(),
            "http://10.0.0.4:8080".to_string(),
        ];
        assert_eq!(
            deployments_for(&targets),
            vec![("myapp".to_string(), "web".to_string())]
        );
    }

    #[tokio::test]
    async fn test_sweep_idles_after_threshold_only() {
        let config = idle_config(3600, 5);
        let (router, cluster, _tx) = setup(&config);
        router.target_add("app.example.com", WEB).await.unwrap();

        let controller = IdleController::new(Arc::clone(&router), &config);
        assert!(controller.sweep().await.unwrap().is_empty());
        assert!(!router.storage().idle_get("app.example.com").unwrap());

        let controller = IdleController::new(Arc::clone(&router), &idle_config(0, 5));
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(controller.sweep().await.unwrap(), vec!["app.example.com"]);
        assert!(router.storage().idle_get("app.example.com").unwrap());
        assert_eq!(cluster.replicas("myapp", "web"), Some((0, 0)));

        // Already idle hosts are not swept again
        assert!(controller.sweep().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_skips_busy_and_opaque_hosts() {
        let config = idle_config(0, 5);
        let (router, _cluster, _tx) = setup(&config);
        router.target_add("busy.example.com", WEB).await.unwrap();
        router.target_add("external.example.com", "http://10.0.0.4:8080").await.unwrap();
        router.storage().request_begin("busy.example.com").unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let controller = IdleController::new(Arc::clone(&router), &config);
        assert!(controller.sweep().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_leaves_host_that_became_active() {
        let config = idle_config(0, 5);
        let storage: Arc<dyn Storage> = Arc::new(ActiveAfterListing(MemoryStorage::new()));
        let cluster = Arc::new(StaticCluster::new());
        cluster.set_deployment("myapp", "web", 1);
        let (_tx, rx) = watch::channel(false);
        let router = Arc::new(Router::new(storage, cluster.clone(), &config, rx));
        router.target_add("app.example.com", WEB).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let controller = IdleController::new(Arc::clone(&router), &config);
        assert!(controller.sweep().await.unwrap().is_empty());

        assert!(!router.storage().idle_get("app.example.com").unwrap());
        assert_eq!(cluster.replicas("myapp", "web"), Some((1, 1)));
    }

    #[tokio::test]
    async fn test_unidle_shares_task_across_host_case() {
        let config = idle_config(3600, 5);
        let (router, cluster, _tx) = setup(&config);
        router.target_add("app.example.com", WEB).await.unwrap();
        cluster.scale("myapp", "web", 0).await.unwrap();
        router.storage().idle_set("app.example.com", true).unwrap();
        cluster.hold_ready(true);

        let targets = router.target_list("app.example.com").unwrap();
        let waiters: Vec<_> = ["App.Example.com", "app.example.com"]
            .into_iter()
            .map(|host| {
                let unidler = Arc::clone(router.unidler());
                let targets = targets.clone();
                tokio::spawn(async move { unidler.unidle(host, &targets).await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(router.unidler().in_progress(), 1);

        cluster.hold_ready(false);
        cluster.scale("myapp", "web", 1).await.unwrap();
        for waiter in waiters {
            waiter.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_unidle_scales_up_and_clears_flag() {
        let config = idle_config(3600, 5);
        let (router, cluster, _tx) = setup(&config);
        router.target_add("app.example.com", WEB).await.unwrap();
        cluster.scale("myapp", "web", 0).await.unwrap();
        router.storage().idle_set("app.example.com", true).unwrap();

        let guard = router.request_begin("app.example.com").await.unwrap();
        assert_eq!(cluster.replicas("myapp", "web"), Some((1, 1)));
        assert!(!router.storage().idle_get("app.example.com").unwrap());
        drop(guard);
    }

    #[tokio::test]
    async fn test_unidle_times_out_without_rollback() {
        let config = idle_config(3600, 1);
        let (router, cluster, _tx) = setup(&config);
        router.target_add("app.example.com", WEB).await.unwrap();
        cluster.scale("myapp", "web", 0).await.unwrap();
        router.storage().idle_set("app.example.com", true).unwrap();
        cluster.hold_ready(true);

        let err = router.request_begin("app.example.com").await.unwrap_err();
        assert!(matches!(err, RouterError::UnidleTimeout));
        assert_eq!(cluster.replicas("myapp", "web"), Some((1, 0)));
        assert!(router.storage().idle_get("app.example.com").unwrap());

        // The failed request still released its in-flight slot
        let activity = router.storage().activity("app.example.com").unwrap().unwrap();
        assert_eq!(activity.in_flight, 0);
    }

    #[tokio::test]
    async fn test_concurrent_unidles_share_one_task() {
        let config = idle_config(3600, 5);
        let (router, cluster, _tx) = setup(&config);
        router.target_add("app.example.com", WEB).await.unwrap();
        cluster.scale("myapp", "web", 0).await.unwrap();
        router.storage().idle_set("app.example.com", true).unwrap();
        cluster.hold_ready(true);

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let router = Arc::clone(&router);
                tokio::spawn(async move { router.request_begin("app.example.com").await.map(drop) })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(router.unidler().in_progress(), 1);

        cluster.hold_ready(false);
        cluster.scale("myapp", "web", 1).await.unwrap();

        for waiter in waiters {
            waiter.await.unwrap().unwrap();
        }
        assert!(!router.storage().idle_get("app.example.com").unwrap());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_unidle() {
        let config = idle_config(3600, 5);
        let (router, cluster, tx) = setup(&config);
        router.target_add("app.example.com", WEB).await.unwrap();
        cluster.scale("myapp", "web", 0).await.unwrap();
        router.storage().idle_set("app.example.com", true).unwrap();
        cluster.hold_ready(true);

        let pending = {
            let router = Arc::clone(&router);
            tokio::spawn(async move { router.request_begin("app.example.com").await.map(drop) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, RouterError::Unidle(_)));
    }
}
