//! Integration tests for the rack router listeners

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, Query, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use rack_router::certs::{AuthorityStore, CertificateAuthority, CertificateManager};
use rack_router::cluster::StaticCluster;
use rack_router::config::{DnsConfig, IdleConfig};
use rack_router::control::ControlServer;
use rack_router::dns::{DnsResolver, DnsServer};
use rack_router::pool::PoolConfig;
use rack_router::proxy::{Gateway, GatewayServer};
use rack_router::router::{internal_target, Router};
use rack_router::server::Server;
use rack_router::storage::MemoryStorage;
use std::str::FromStr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{watch, Notify};

const LOOPBACK: &str = "127.0.0.1:0";

struct Rack {
    router: Arc<Router>,
    cluster: Arc<StaticCluster>,
    shutdown_tx: watch::Sender<bool>,
}

impl Rack {
    fn new(idle: IdleConfig) -> Self {
        let cluster = Arc::new(StaticCluster::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let router = Arc::new(Router::new(
            Arc::new(MemoryStorage::new()),
            cluster.clone(),
            &idle,
            shutdown_rx,
        ));
        Self {
            router,
            cluster,
            shutdown_tx,
        }
    }

    fn gateway(&self) -> Arc<Gateway> {
        Arc::new(Gateway::new(
            Arc::clone(&self.router),
            PoolConfig::default(),
            Duration::from_secs(5),
            None,
        ))
    }

    fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }
}

fn spawn_server<S: Server + 'static>(server: S) -> tokio::task::JoinHandle<anyhow::Result<()>> {
    let server = Arc::new(server);
    tokio::spawn(async move { server.serve().await })
}

/// Backend that echoes the forwarding headers it received
async fn spawn_backend() -> SocketAddr {
    let listener = TcpListener::bind(LOOPBACK).await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let service = service_fn(|req: Request<Incoming>| async move {
                    let header = |name: &str| {
                        req.headers()
                            .get(name)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("-")
                            .to_string()
                    };
                    let body = format!(
                        "Hello from backend path={} xff={} xfh={} xfp={} rid={}",
                        req.uri(),
                        header("x-forwarded-for"),
                        header("x-forwarded-host"),
                        header("x-forwarded-proto"),
                        header("x-request-id"),
                    );
                    Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(body))))
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    addr
}

async fn send_raw(addr: SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

fn forwarded_get(host: &str, path: &str) -> String {
    format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nX-Forwarded-Proto: https\r\nConnection: close\r\n\r\n",
        path, host
    )
}

// ============================================================================
// Gateway
// ============================================================================

#[tokio::test]
async fn test_http_redirects_to_https() {
    let rack = Rack::new(IdleConfig::default());
    let server = GatewayServer::bind_http(LOOPBACK.parse().unwrap(), rack.gateway(), rack.shutdown_rx())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let handle = spawn_server(server);

    let response = send_raw(
        addr,
        "GET /a/b?c=d HTTP/1.1\r\nHost: app.example.com:8080\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 301"), "got: {}", response);
    assert!(
        response.to_lowercase().contains("location: https://app.example.com/a/b?c=d\r\n"),
        "got: {}",
        response
    );

    rack.shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_forwarded_https_is_proxied() {
    let rack = Rack::new(IdleConfig::default());
    let backend = spawn_backend().await;
    rack.router
        .target_add("app.example.com", &format!("http://{}", backend))
        .await
        .unwrap();

    let server = GatewayServer::bind_http(LOOPBACK.parse().unwrap(), rack.gateway(), rack.shutdown_rx())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    spawn_server(server);

    let response = send_raw(addr, &forwarded_get("App.Example.com", "/hello?x=1")).await;

    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);
    assert!(response.contains("Hello from backend path=/hello?x=1"), "got: {}", response);
    assert!(response.contains("xff=127.0.0.1"), "got: {}", response);
    assert!(response.contains("xfh=App.Example.com"), "got: {}", response);
    assert!(response.contains("xfp=https"), "got: {}", response);
    assert!(!response.contains("rid=-"), "got: {}", response);

    let activity = rack.router.storage().activity("app.example.com").unwrap().unwrap();
    assert_eq!(activity.in_flight, 0);

    rack.shutdown_tx.send(true).unwrap();
}

#[tokio::test]
async fn test_no_backends_returns_502() {
    let rack = Rack::new(IdleConfig::default());
    let server = GatewayServer::bind_http(LOOPBACK.parse().unwrap(), rack.gateway(), rack.shutdown_rx())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    spawn_server(server);

    let response = send_raw(addr, &forwarded_get("unknown.example.com", "/")).await;

    assert!(response.starts_with("HTTP/1.1 502"), "got: {}", response);
    assert!(response.contains("no backends available"), "got: {}", response);
    assert!(response.contains("NO_BACKENDS"), "got: {}", response);

    rack.shutdown_tx.send(true).unwrap();
}

#[tokio::test]
async fn test_missing_host_returns_400() {
    let rack = Rack::new(IdleConfig::default());
    let server = GatewayServer::bind_http(LOOPBACK.parse().unwrap(), rack.gateway(), rack.shutdown_rx())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    spawn_server(server);

    let response = send_raw(addr, "GET / HTTP/1.0\r\nX-Forwarded-Proto: https\r\n\r\n").await;

    assert!(response.contains(" 400 "), "got: {}", response);
    assert!(response.contains("MISSING_HOST_HEADER"), "got: {}", response);

    rack.shutdown_tx.send(true).unwrap();
}

#[tokio::test]
async fn test_unreachable_target_returns_502() {
    let rack = Rack::new(IdleConfig::default());
    // Bind then drop to get a port nothing listens on
    let closed = TcpListener::bind(LOOPBACK).await.unwrap().local_addr().unwrap();
    rack.router
        .target_add("app.example.com", &format!("http://{}", closed))
        .await
        .unwrap();

    let server = GatewayServer::bind_http(LOOPBACK.parse().unwrap(), rack.gateway(), rack.shutdown_rx())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    spawn_server(server);

    let response = send_raw(addr, &forwarded_get("app.example.com", "/")).await;
    assert!(response.starts_with("HTTP/1.1 502"), "got: {}", response);
    assert!(response.contains("CONNECTION_FAILED"), "got: {}", response);

    let activity = rack.router.storage().activity("app.example.com").unwrap().unwrap();
    assert_eq!(activity.in_flight, 0);

    rack.shutdown_tx.send(true).unwrap();
}

#[tokio::test]
async fn test_idle_host_times_out_waiting_for_unidle() {
    let idle = IdleConfig {
        unidle_timeout_secs: 1,
        unidle_poll_ms: 50,
        ..IdleConfig::default()
    };
    let rack = Rack::new(idle);
    rack.cluster.set_deployment("myapp", "web", 0);
    rack.cluster.hold_ready(true);
    rack.router
        .target_add("app.example.com", &internal_target("web", "myapp", 80))
        .await
        .unwrap();
    assert!(rack.router.storage().idle_get("app.example.com").unwrap());

    let server = GatewayServer::bind_http(LOOPBACK.parse().unwrap(), rack.gateway(), rack.shutdown_rx())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    spawn_server(server);

    let response = send_raw(addr, &forwarded_get("app.example.com", "/")).await;

    assert!(response.starts_with("HTTP/1.1 504"), "got: {}", response);
    assert!(response.contains("UNIDLE_TIMEOUT"), "got: {}", response);

    // The scale-up stays in place after the timeout
    assert_eq!(rack.cluster.replicas("myapp", "web"), Some((1, 0)));
    let activity = rack.router.storage().activity("app.example.com").unwrap().unwrap();
    assert_eq!(activity.in_flight, 0);

    rack.shutdown_tx.send(true).unwrap();
}

#[tokio::test]
async fn test_https_with_rack_authority() {
    let rack = Rack::new(IdleConfig::default());
    let backend = spawn_backend().await;
    rack.router
        .target_add("app.example.com", &format!("http://{}", backend))
        .await
        .unwrap();

    let ca = CertificateAuthority::generate("test").unwrap();
    let ca_der = ca.cert_der().clone();
    let certs = Arc::new(CertificateManager::Authority(AuthorityStore::new(ca, "test").unwrap()));

    let server = GatewayServer::bind_https(LOOPBACK.parse().unwrap(), rack.gateway(), certs, rack.shutdown_rx())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    spawn_server(server);

    let mut root_store = rustls::RootCertStore::empty();
    root_store.add(ca_der).unwrap();

    let client_config = rustls::ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));

    let stream = TcpStream::connect(addr).await.unwrap();
    let domain = rustls::pki_types::ServerName::try_from("app.example.com").unwrap();
    let mut tls_stream = connector.connect(domain, stream).await.unwrap();

    let request = "GET /secure HTTP/1.1\r\nHost: app.example.com\r\nConnection: close\r\n\r\n";
    tls_stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    tls_stream.read_to_string(&mut response).await.unwrap();

    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);
    assert!(response.contains("path=/secure"), "got: {}", response);
    assert!(response.contains("xfp=https"), "got: {}", response);

    rack.shutdown_tx.send(true).unwrap();
}

/// Backend that sends a first chunk, then holds the body open until released
async fn spawn_streaming_backend(release: Arc<Notify>) -> SocketAddr {
    let listener = TcpListener::bind(LOOPBACK).await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                return;
            }
            request.extend_from_slice(&buf[..n]);
        }

        stream
            .write_all(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nfirst\r\n")
            .await
            .unwrap();
        release.notified().await;
        stream.write_all(b"4\r\nlast\r\n0\r\n\r\n").await.unwrap();
    });

    addr
}

#[tokio::test]
async fn test_streaming_response_stays_in_flight() {
    let rack = Rack::new(IdleConfig::default());
    let release = Arc::new(Notify::new());
    let backend = spawn_streaming_backend(Arc::clone(&release)).await;
    rack.router
        .target_add("app.example.com", &format!("http://{}", backend))
        .await
        .unwrap();

    let server = GatewayServer::bind_http(LOOPBACK.parse().unwrap(), rack.gateway(), rack.shutdown_rx())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    spawn_server(server);

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(forwarded_get("app.example.com", "/download").as_bytes())
        .await
        .unwrap();

    let mut received = Vec::new();
    let mut buf = [0u8; 1024];
    while !String::from_utf8_lossy(&received).contains("first") {
        let n = tokio::time::timeout(Duration::from_secs(3), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(n > 0, "connection closed early");
        received.extend_from_slice(&buf[..n]);
    }
    assert!(received.starts_with(b"HTTP/1.1 200"));

    let in_flight = || rack.router.storage().activity("app.example.com").unwrap().unwrap().in_flight;
    assert_eq!(in_flight(), 1);

    release.notify_one();
    let mut rest = String::new();
    tokio::time::timeout(Duration::from_secs(3), stream.read_to_string(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert!(rest.contains("last"), "got: {}", rest);

    let mut released = false;
    for _ in 0..40 {
        if in_flight() == 0 {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(released);

    rack.shutdown_tx.send(true).unwrap();
}

#[tokio::test]
async fn test_silent_tls_client_is_dropped() {
    let rack = Rack::new(IdleConfig::default());
    let ca = CertificateAuthority::generate("test").unwrap();
    let certs = Arc::new(CertificateManager::Authority(AuthorityStore::new(ca, "test").unwrap()));

    let server = GatewayServer::bind_https(LOOPBACK.parse().unwrap(), rack.gateway(), certs, rack.shutdown_rx())
        .await
        .unwrap()
        .with_handshake_timeout(Duration::from_millis(200));
    let addr = server.local_addr().unwrap();
    spawn_server(server);

    // Connect and never send a ClientHello
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(3), stream.read(&mut buf))
        .await
        .expect("server should close a silent connection");
    assert!(matches!(read, Ok(0) | Err(_)));

    rack.shutdown_tx.send(true).unwrap();
}

// ============================================================================
// DNS
// ============================================================================

fn dns_query(id: u16, name: &str) -> Vec<u8> {
    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(Name::from_str(name).unwrap(), RecordType::A));
    message.to_bytes().unwrap()
}

async fn exchange(server: SocketAddr, packet: &[u8]) -> Vec<u8> {
    let client = UdpSocket::bind(LOOPBACK).await.unwrap();
    client.send_to(packet, server).await.unwrap();
    let mut buf = vec![0u8; 4096];
    let (len, _) = tokio::time::timeout(Duration::from_secs(3), client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    buf.truncate(len);
    buf
}

#[tokio::test]
async fn test_dns_internal_and_forwarded() {
    let rack = Rack::new(IdleConfig::default());
    rack.cluster.set_service("myapp", "web", "10.96.3.4".parse().unwrap());

    // Fake upstream that answers every query with a fixed record
    let upstream = UdpSocket::bind(LOOPBACK).await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        while let Ok((len, from)) = upstream.recv_from(&mut buf).await {
            let mut reply = Message::from_bytes(&buf[..len]).unwrap();
            let name = reply.queries()[0].name().clone();
            reply
                .set_message_type(MessageType::Response)
                .add_answer(Record::from_rdata(name, 60, RData::A(A("93.184.216.34".parse().unwrap()))));
            upstream.send_to(&reply.to_bytes().unwrap(), from).await.unwrap();
        }
    });

    let config = DnsConfig::default();
    let server = DnsServer::bind(
        LOOPBACK.parse().unwrap(),
        DnsResolver::new(Arc::clone(&rack.router), upstream_addr, &config),
        rack.shutdown_rx(),
    )
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    let handle = spawn_server(server);

    let response = Message::from_bytes(&exchange(addr, &dns_query(1, "web.myapp.svc.cluster.local.")).await).unwrap();
    assert_eq!(response.id(), 1);
    assert_eq!(response.response_code(), ResponseCode::NoError);
    assert_eq!(
        response.answers()[0].data(),
        Some(&RData::A(A("10.96.3.4".parse().unwrap())))
    );

    let response = Message::from_bytes(&exchange(addr, &dns_query(2, "gone.myapp.svc.cluster.local.")).await).unwrap();
    assert_eq!(response.response_code(), ResponseCode::NXDomain);

    let response = Message::from_bytes(&exchange(addr, &dns_query(3, "example.com.")).await).unwrap();
    assert_eq!(response.id(), 3);
    assert_eq!(response.answers()[0].ttl(), 60);
    assert_eq!(
        response.answers()[0].data(),
        Some(&RData::A(A("93.184.216.34".parse().unwrap())))
    );

    rack.shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap().unwrap();
}

// ============================================================================
// Control API
// ============================================================================

async fn control_request(addr: SocketAddr, method: &str, path: &str, token: Option<&str>) -> String {
    let auth = token
        .map(|t| format!("Authorization: Bearer {}\r\n", t))
        .unwrap_or_default();
    let request = format!(
        "{} {} HTTP/1.1\r\nHost: 127.0.0.1\r\n{}Content-Length: 0\r\nConnection: close\r\n\r\n",
        method, path, auth
    );
    send_raw(addr, &request).await
}

#[tokio::test]
async fn test_control_api() {
    let rack = Rack::new(IdleConfig::default());
    let server = ControlServer::bind(
        LOOPBACK.parse().unwrap(),
        Arc::clone(&rack.router),
        Some("s3cret".to_string()),
        rack.shutdown_rx(),
    )
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    spawn_server(server);

    let token = Some("s3cret");

    let response = control_request(addr, "GET", "/health", None).await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);

    let response = control_request(addr, "GET", "/version", None).await;
    assert!(response.contains("rack-router"), "got: {}", response);

    let response = control_request(addr, "GET", "/hosts", None).await;
    assert!(response.starts_with("HTTP/1.1 401"), "got: {}", response);

    let response = control_request(addr, "GET", "/hosts", Some("wrong")).await;
    assert!(response.starts_with("HTTP/1.1 401"), "got: {}", response);

    let response = control_request(
        addr,
        "POST",
        "/targets/app.example.com?target=http%3A%2F%2F10.0.0.1%3A80",
        token,
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);
    assert_eq!(
        rack.router.target_list("app.example.com").unwrap(),
        vec!["http://10.0.0.1:80".to_string()]
    );

    let response = control_request(addr, "POST", "/targets/app.example.com", token).await;
    assert!(response.starts_with("HTTP/1.1 400"), "got: {}", response);

    let response = control_request(addr, "GET", "/targets/app.example.com", token).await;
    assert!(response.contains("http://10.0.0.1:80"), "got: {}", response);

    let response = control_request(addr, "PUT", "/idle/app.example.com?idle=true", token).await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);
    let response = control_request(addr, "GET", "/idle/app.example.com", token).await;
    assert!(response.contains("\"idle\":true"), "got: {}", response);

    let response = control_request(addr, "POST", "/requests/app.example.com/begin", token).await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);
    let response = control_request(addr, "GET", "/hosts", token).await;
    assert!(response.contains("\"in_flight\":1"), "got: {}", response);
    let response = control_request(addr, "POST", "/requests/app.example.com/end", token).await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);

    let response = control_request(
        addr,
        "DELETE",
        "/targets/app.example.com?target=http%3A%2F%2F10.0.0.1%3A80",
        token,
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);
    assert!(rack.router.target_list("app.example.com").unwrap().is_empty());

    let response = control_request(addr, "GET", "/nope", token).await;
    assert!(response.starts_with("HTTP/1.1 404"), "got: {}", response);

    rack.shutdown_tx.send(true).unwrap();
}
