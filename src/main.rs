use anyhow::Context;
use rack_router::acme::{AcmeManager, CertCache, DirCache};
use rack_router::certs::{AuthorityStore, CertificateAuthority, CertificateManager};
use rack_router::cluster::{Cluster, KubeCluster, StaticCluster};
use rack_router::config::{AcmeCacheKind, AcmeChallengeType, ClusterConfig, ClusterMode, Config, LogFormat, StorageBackend};
use rack_router::control::{ControlServer, PKG_NAME, VERSION};
use rack_router::dns::{upstream_from_resolv_conf, DnsResolver, DnsServer};
use rack_router::idle::IdleController;
use rack_router::ingress::IngressReconciler;
use rack_router::pool::PoolConfig;
use rack_router::proxy::{Gateway, GatewayServer};
use rack_router::router::Router;
use rack_router::server::{serve_all, Server};
use rack_router::storage::{Database, MemoryStorage, SqliteCertCache, SqliteStorage, Storage};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

const DEFAULT_CONFIG: &str = "router.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from).or_else(|| {
        let default = PathBuf::from(DEFAULT_CONFIG);
        default.exists().then_some(default)
    });

    let config = match &config_path {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::from_env()?,
    };

    init_tracing(config.server.log_format);
    print_startup_banner(&config, config_path.as_deref());

    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = match pid_file_path {
        Some(ref path) => {
            let pid_file = PidFile::create(path)?;
            info!(path = %path.display(), "PID file written and locked");
            Some(pid_file)
        }
        None => None,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let database = open_database(&config)?;

    let storage: Arc<dyn Storage> = match config.storage.backend {
        StorageBackend::Memory => Arc::new(MemoryStorage::new()),
        StorageBackend::Durable => {
            let db = database.clone().context("durable storage requires a database")?;
            Arc::new(SqliteStorage::new(db, &config.storage.routes_table)?)
        }
    };

    let cluster: Arc<dyn Cluster> = match config.cluster.mode {
        ClusterMode::Static => Arc::new(static_cluster(&config.cluster)),
        ClusterMode::Kubernetes => Arc::new(
            KubeCluster::connect()
                .await
                .context("connecting to the Kubernetes API")?,
        ),
    };

    let router = Arc::new(Router::new(storage, cluster, &config.idle, shutdown_rx.clone()));
    let certs = Arc::new(certificate_manager(&config, database.as_ref())?);

    let upstream = match config.dns.upstream.as_deref() {
        Some(addr) => addr.parse::<SocketAddr>()?,
        None => upstream_from_resolv_conf(Path::new(&config.dns.resolv_conf))?,
    };

    // Every socket is bound before any server starts accepting
    let dns = DnsServer::bind(
        socket_addr(&config.dns.bind, config.dns.port)?,
        DnsResolver::new(Arc::clone(&router), upstream, &config.dns),
        shutdown_rx.clone(),
    )
    .await?;

    let challenges = match certs.acme() {
        Some(acme) if config.tls.acme.challenge_type == AcmeChallengeType::Http01 => {
            Some(acme.http01_challenges())
        }
        _ => None,
    };
    let gateway = Arc::new(Gateway::new(
        Arc::clone(&router),
        PoolConfig::from(&config.server),
        config.server.request_timeout(),
        challenges,
    ));

    let http = GatewayServer::bind_http(
        socket_addr(&config.server.bind, config.server.http_port)?,
        Arc::clone(&gateway),
        shutdown_rx.clone(),
    )
    .await?;

    let https = GatewayServer::bind_https(
        socket_addr(&config.server.bind, config.server.https_port)?,
        Arc::clone(&gateway),
        Arc::clone(&certs),
        shutdown_rx.clone(),
    )
    .await?;

    let control = ControlServer::bind(
        socket_addr(&config.server.control_bind, config.server.control_port)?,
        Arc::clone(&router),
        config.server.control_token.clone(),
        shutdown_rx.clone(),
    )
    .await?;

    router
        .discover_addresses(&config.network, shutdown_rx.clone())
        .await?;

    if config.idle.enabled {
        let controller = IdleController::new(Arc::clone(&router), &config.idle);
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { controller.run(rx).await });
    }

    if config.ingress.enabled {
        let reconciler = IngressReconciler::new(Arc::clone(&router), &config.ingress);
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { reconciler.run(rx).await });
    }

    let servers: Vec<Arc<dyn Server>> = vec![Arc::new(dns), Arc::new(http), Arc::new(https), Arc::new(control)];
    let mut servers_task = tokio::spawn(serve_all(servers));

    let server_result = tokio::select! {
        result = &mut servers_task => Some(result),
        result = wait_for_signal() => {
            result?;
            None
        }
    };

    let _ = shutdown_tx.send(true);

    let result = match server_result {
        Some(joined) => joined.map_err(|e| anyhow::anyhow!("server task panicked: {}", e))?,
        None => {
            match tokio::time::timeout(Duration::from_secs(5), servers_task).await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => Err(anyhow::anyhow!("server task panicked: {}", e)),
                Err(_) => {
                    warn!("Servers did not stop within 5 seconds");
                    Ok(())
                }
            }
        }
    };

    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    match &result {
        Ok(()) => info!("Shutdown complete"),
        Err(e) => error!(error = %e, "Router stopped with an error"),
    }
    result
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("rack_router=info"));

    match format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

/// Resolves on SIGINT or SIGTERM
async fn wait_for_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("listening for SIGINT")?;
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("listening for Ctrl+C")?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

fn socket_addr(bind: &str, port: u16) -> anyhow::Result<SocketAddr> {
    let ip: IpAddr = bind
        .parse()
        .with_context(|| format!("invalid bind address {:?}", bind))?;
    Ok(SocketAddr::new(ip, port))
}

/// The shared database, when durable routes or the certificate cache need it
fn open_database(config: &Config) -> anyhow::Result<Option<Database>> {
    let needs_db = config.storage.backend == StorageBackend::Durable
        || (config.tls.acme.enabled && config.tls.acme.cache == AcmeCacheKind::Database);

    if !needs_db {
        return Ok(None);
    }

    let db = Database::open(&config.storage.database)
        .with_context(|| format!("opening database {}", config.storage.database))?;
    Ok(Some(db))
}

fn static_cluster(config: &ClusterConfig) -> StaticCluster {
    let cluster = StaticCluster::new();
    for service in &config.services {
        cluster.set_service(&service.namespace, &service.name, service.ip);
    }
    for deployment in &config.deployments {
        cluster.set_deployment(&deployment.namespace, &deployment.name, deployment.replicas);
    }
    if let Some(ip) = config.router_ip {
        cluster.set_router_ip(ip);
    }
    cluster.set_ingress_routes(config.routes.clone());
    cluster
}

fn certificate_manager(config: &Config, database: Option<&Database>) -> anyhow::Result<CertificateManager> {
    let tls = &config.tls;

    if tls.acme.enabled {
        let cache: Arc<dyn CertCache> = match tls.acme.cache {
            AcmeCacheKind::Database => {
                let db = database.cloned().context("certificate cache requires a database")?;
                Arc::new(SqliteCertCache::new(db, &config.storage.cache_table)?)
            }
            AcmeCacheKind::Directory => Arc::new(DirCache::new(&tls.acme.cache_dir)?),
        };

        info!(
            email = ?tls.acme.email,
            challenge_type = ?tls.acme.challenge_type,
            cache = ?tls.acme.cache,
            allowed_domains = ?tls.acme.allowed_domains,
            "Automated certificate issuance enabled"
        );
        return Ok(CertificateManager::Acme(AcmeManager::new(tls.acme.clone(), cache)));
    }

    let ca = match (&tls.ca_cert, &tls.ca_key) {
        (Some(cert), Some(key)) => {
            info!(cert, "Loading certificate authority");
            CertificateAuthority::load(Path::new(cert), Path::new(key))?
        }
        _ => {
            warn!(rack = %tls.rack, "No CA configured, generating an ephemeral one");
            CertificateAuthority::generate(&tls.rack)?
        }
    };

    Ok(CertificateManager::Authority(AuthorityStore::new(ca, &tls.rack)?))
}

/// PID file handle that holds an exclusive lock while open
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("opening PID file {}", path.display()))?;

        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        writeln!(&file, "{}", std::process::id())?;
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self)
    }
}

fn print_startup_banner(config: &Config, path: Option<&Path>) {
    info!(name = PKG_NAME, version = VERSION, config = ?path, "Starting rack router");

    info!(
        bind = %config.server.bind,
        http_port = config.server.http_port,
        https_port = config.server.https_port,
        control = %format!("{}:{}", config.server.control_bind, config.server.control_port),
        dns_port = config.dns.port,
        "Listeners"
    );

    info!(
        backend = ?config.storage.backend,
        database = %config.storage.database,
        routes_table = %config.storage.routes_table,
        cluster = ?config.cluster.mode,
        rack = %config.tls.rack,
        acme = config.tls.acme.enabled,
        "Routing state"
    );

    info!(
        enabled = config.idle.enabled,
        check_interval_secs = config.idle.check_interval_secs,
        timeout_secs = config.idle.timeout_secs,
        unidle_timeout_secs = config.idle.unidle_timeout_secs,
        "Idle settings"
    );

    info!(
        request_timeout_secs = config.server.request_timeout_secs,
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Gateway settings"
    );
}
