//! HTTP/HTTPS gateway
//!
//! The plaintext listener answers ACME HTTP-01 challenges and redirects
//! everything else to HTTPS, unless a TLS-terminating load balancer already
//! marked the request with `X-Forwarded-Proto: https`. The TLS listener picks
//! a certificate per handshake and forwards requests to one of the host's
//! targets, chosen uniformly at random.

use crate::acme::{Http01Challenges, ACME_TLS_ALPN_NAME};
use crate::certs::{CertificateManager, HelloInfo};
use crate::error::{json_error_response, ProxyErrorCode, RouterError};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::router::{RequestGuard, Router};
use crate::server::{shutdown_signalled, Server};
use async_trait::async_trait;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use hyper::header::{HeaderName, HeaderValue};
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::http::uri::Authority;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::{Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

const X_REQUEST_ID: &str = "x-request-id";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

/// Bound on reading the ClientHello and on completing the handshake
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type ProxyResponse = Response<BoxBody<Bytes, hyper::Error>>;

/// Request handling shared by the HTTP and HTTPS listeners
pub struct Gateway {
    router: Arc<Router>,
    pool: ConnectionPool,
    request_timeout: Duration,
    challenges: Option<Http01Challenges>,
}

impl Gateway {
    pub fn new(
        router: Arc<Router>,
        pool_config: PoolConfig,
        request_timeout: Duration,
        challenges: Option<Http01Challenges>,
    ) -> Self {
        Self {
            router,
            pool: ConnectionPool::new(pool_config),
            request_timeout,
            challenges,
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    async fn handle(
        self: Arc<Self>,
        req: Request<Incoming>,
        client_addr: SocketAddr,
        is_tls: bool,
    ) -> Result<ProxyResponse, hyper::Error> {
        if is_tls {
            return Ok(self.forward(req, client_addr, "https").await);
        }

        if let Some(ref challenges) = self.challenges {
            if let Some(token) = req.uri().path().strip_prefix(ACME_CHALLENGE_PREFIX) {
                if let Some(key_auth) = challenges.get(token).await {
                    debug!(token, "Responding to ACME HTTP-01 challenge");
                    return Ok(Response::builder()
                        .status(StatusCode::OK)
                        .header(hyper::header::CONTENT_TYPE, "text/plain")
                        .body(Full::new(Bytes::from(key_auth)).map_err(|never| match never {}).boxed())
                        .expect("valid response builder"));
                }
            }
        }

        let forwarded_https = req
            .headers()
            .get(X_FORWARDED_PROTO)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("https"))
            .unwrap_or(false);

        if forwarded_https {
            return Ok(self.forward(req, client_addr, "https").await);
        }

        Ok(build_https_redirect(&req))
    }

    async fn forward(&self, mut req: Request<Incoming>, client_addr: SocketAddr, proto: &'static str) -> ProxyResponse {
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let host = match extract_hostname(&req) {
            Some(h) => h,
            None => {
                return json_error_response(ProxyErrorCode::MissingHostHeader, "Missing or invalid Host header");
            }
        };

        // Overwrite rather than append: this gateway is the first trusted hop
        let original_host = req
            .headers()
            .get(hyper::header::HOST)
            .cloned()
            .or_else(|| req.uri().authority().and_then(|a| HeaderValue::from_str(a.as_str()).ok()));
        let headers = req.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            headers.insert(X_REQUEST_ID, value);
        }
        if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
            headers.insert(X_FORWARDED_FOR, value);
        }
        if let Some(value) = original_host {
            headers.insert(X_FORWARDED_HOST, value);
        }
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));

        debug!(host, method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

        let guard = match self.router.request_begin(&host).await {
            Ok(guard) => guard,
            Err(e) => return error_response(&host, &e),
        };

        let target = match self.router.route(&host) {
            Ok(target) => target,
            Err(e) => return error_response(&host, &e),
        };

        if is_upgrade_request(&req) {
            return handle_upgrade(req, guard, target, request_id).await;
        }

        let result = tokio::time::timeout(self.request_timeout, self.pool.send_request(req, &target)).await;

        let response = match result {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                error!(host, target, error = %e, "Failed to forward request");
                json_error_response(ProxyErrorCode::ConnectionFailed, "Failed to connect to backend")
            }
            Err(_) => {
                warn!(host, target, timeout_secs = self.request_timeout.as_secs(), "Request timed out");
                json_error_response(
                    ProxyErrorCode::RequestTimeout,
                    format!("Request timed out after {} seconds", self.request_timeout.as_secs()),
                )
            }
        };

        // The request stays in flight until its body has been sent
        response.map(|body| GuardedBody::new(body, guard).boxed())
    }
}

/// Response body that ends its request once the last frame is sent or the
/// body is dropped
struct GuardedBody {
    inner: BoxBody<Bytes, hyper::Error>,
    guard: Option<RequestGuard>,
}

impl GuardedBody {
    fn new(inner: BoxBody<Bytes, hyper::Error>, guard: RequestGuard) -> Self {
        Self {
            inner,
            guard: Some(guard),
        }
    }
}

impl Body for GuardedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Bytes>, hyper::Error>>> {
        let this = self.get_mut();
        let frame = Pin::new(&mut this.inner).poll_frame(cx);
        if matches!(frame, Poll::Ready(None) | Poll::Ready(Some(Err(_)))) {
            this.guard.take();
        }
        frame
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

fn error_response(host: &str, err: &RouterError) -> ProxyResponse {
    match err {
        RouterError::NoBackends => debug!(host, "No backends available"),
        RouterError::UnidleTimeout => warn!(host, "Timed out waiting for unidle"),
        _ => error!(host, error = %err, "Request failed before forwarding"),
    }
    json_error_response(err.code(), err.to_string())
}

/// One listening socket of the gateway, plaintext or TLS
pub struct GatewayServer {
    listener: TcpListener,
    gateway: Arc<Gateway>,
    certs: Option<Arc<CertificateManager>>,
    handshake_timeout: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl GatewayServer {
    pub async fn bind_http(
        addr: SocketAddr,
        gateway: Arc<Gateway>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("HTTP bind {}: {}", addr, e))?;
        Ok(Self {
            listener,
            gateway,
            certs: None,
            handshake_timeout: TLS_HANDSHAKE_TIMEOUT,
            shutdown_rx,
        })
    }

    pub async fn bind_https(
        addr: SocketAddr,
        gateway: Arc<Gateway>,
        certs: Arc<CertificateManager>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("HTTPS bind {}: {}", addr, e))?;
        Ok(Self {
            listener,
            gateway,
            certs: Some(certs),
            handshake_timeout: TLS_HANDSHAKE_TIMEOUT,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn tls_enabled(&self) -> bool {
        self.certs.is_some()
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

#[async_trait]
impl Server for GatewayServer {
    fn name(&self) -> &'static str {
        if self.tls_enabled() {
            "https"
        } else {
            "http"
        }
    }

    async fn serve(&self) -> anyhow::Result<()> {
        let protocol = if self.tls_enabled() { "HTTPS" } else { "HTTP" };
        info!(addr = %self.listener.local_addr()?, protocol, "Gateway listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let gateway = Arc::clone(&self.gateway);
                            let certs = self.certs.clone();
                            let handshake_timeout = self.handshake_timeout;

                            tokio::spawn(async move {
                                match certs {
                                    Some(certs) => accept_tls(stream, addr, gateway, certs, handshake_timeout).await,
                                    None => {
                                        if let Err(e) = handle_connection(stream, addr, gateway, false).await {
                                            debug!(addr = %addr, error = %e, "Connection error");
                                        }
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_signalled(&mut shutdown_rx) => {
                    info!(protocol, "Gateway shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

/// Select a certificate from the ClientHello, then serve the connection
async fn accept_tls(
    stream: TcpStream,
    addr: SocketAddr,
    gateway: Arc<Gateway>,
    certs: Arc<CertificateManager>,
    handshake_timeout: Duration,
) {
    let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);
    let start = match tokio::time::timeout(handshake_timeout, acceptor).await {
        Ok(Ok(start)) => start,
        Ok(Err(e)) => {
            debug!(addr = %addr, error = %e, "Failed to read ClientHello");
            return;
        }
        Err(_) => {
            debug!(addr = %addr, "Timed out waiting for ClientHello");
            return;
        }
    };

    let hello = HelloInfo::from_client_hello(&start.client_hello());
    let config = match certs.server_config(&hello).await {
        Ok(config) => config,
        Err(e) => {
            warn!(addr = %addr, server_name = ?hello.server_name, error = %e, "Refusing TLS handshake");
            return;
        }
    };

    let tls_stream = match tokio::time::timeout(handshake_timeout, start.into_stream(config)).await {
        Ok(Ok(tls_stream)) => tls_stream,
        Ok(Err(e)) => {
            debug!(addr = %addr, error = %e, "TLS handshake failed");
            return;
        }
        Err(_) => {
            debug!(addr = %addr, "TLS handshake timed out");
            return;
        }
    };

    // A TLS-ALPN-01 validation connection ends after the handshake
    if tls_stream.get_ref().1.alpn_protocol() == Some(ACME_TLS_ALPN_NAME) {
        debug!(addr = %addr, server_name = ?hello.server_name, "Served ACME TLS-ALPN-01 challenge");
        return;
    }

    if let Err(e) = handle_connection(tls_stream, addr, gateway, true).await {
        debug!(addr = %addr, error = %e, "TLS connection error");
    }
}

async fn handle_connection<S>(stream: S, addr: SocketAddr, gateway: Arc<Gateway>, is_tls: bool) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let gateway = Arc::clone(&gateway);
        async move { gateway.handle(req, addr, is_tls).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

/// Host header (or HTTP/2 authority) without port, validated and lowercased
fn extract_hostname<B>(req: &Request<B>) -> Option<String> {
    let raw = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(String::from)
        .or_else(|| req.uri().authority().map(|a| a.as_str().to_string()))?;

    let hostname = host_without_port(&raw)?;

    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }

    // Prevents log injection through the Host header
    if !is_ipv6_literal(&hostname) && !hostname.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.') {
        return None;
    }

    Some(hostname.to_ascii_lowercase())
}

/// Host part of an authority; IPv6 literals keep their brackets
fn host_without_port(authority: &str) -> Option<String> {
    Authority::from_str(authority).ok().map(|a| a.host().to_string())
}

fn is_ipv6_literal(host: &str) -> bool {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .map(|h| h.parse::<Ipv6Addr>().is_ok())
        .unwrap_or(false)
}

/// 301 to the same host and path over HTTPS
fn build_https_redirect<B>(req: &Request<B>) -> ProxyResponse {
    let host = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))
        .and_then(host_without_port)
        .unwrap_or_else(|| "localhost".to_string());

    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let location = format!("https://{}{}", host, path);

    let mut response = Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(hyper::header::CONTENT_TYPE, "text/plain");
    if let Ok(value) = HeaderValue::from_str(&location) {
        response = response.header(hyper::header::LOCATION, value);
    }

    response
        .body(Full::new(Bytes::from("Redirecting to HTTPS")).map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

/// `host:port` to dial for a target URL
fn target_authority(target: &str) -> Option<String> {
    let uri: Uri = target.parse().ok()?;
    let host = uri.host()?;
    let port = uri.port_u16().unwrap_or(80);
    Some(format!("{}:{}", host, port))
}

/// Raw HTTP/1.1 upgrade request for the target, with its own Host header
fn build_upgrade_request<B>(req: &Request<B>, authority: &str) -> Vec<u8> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    request.push_str(&format!("Host: {}\r\n\r\n", authority));
    request.into_bytes()
}

/// Status line and headers of the target's reply to an upgrade request
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    let status_line = lines.next()?;
    let status_code: u16 = status_line.split(' ').nth(1)?.parse().ok()?;
    let status = StatusCode::from_u16(status_code).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

async fn forward_bidirectional(client: Upgraded, mut backend: TcpStream, host: &str, request_id: &str) {
    let mut client_io = TokioIo::new(client);

    match tokio::io::copy_bidirectional(&mut client_io, &mut backend).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(host, request_id, client_to_backend, backend_to_client, "Upgraded connection closed");
        }
        Err(e) => {
            debug!(host, request_id, error = %e, "Upgraded connection closed with error");
        }
    }
}

/// Tunnel a WebSocket or other HTTP upgrade to the target.
///
/// The request guard moves into the tunnel task so the host counts as busy
/// until the tunnel closes.
async fn handle_upgrade(
    req: Request<Incoming>,
    guard: RequestGuard,
    target: String,
    request_id: String,
) -> ProxyResponse {
    let host = guard.host().to_string();

    let authority = match target_authority(&target) {
        Some(authority) => authority,
        None => {
            error!(host, target, "Target is not a dialable URL");
            return json_error_response(ProxyErrorCode::ConnectionFailed, "Failed to connect to backend");
        }
    };

    let raw_request = build_upgrade_request(&req, &authority);

    let mut backend_stream = match TcpStream::connect(&authority).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(host, target, error = %e, "Failed to connect to target for upgrade");
            return json_error_response(ProxyErrorCode::ConnectionFailed, "Failed to connect to backend");
        }
    };

    if let Err(e) = backend_stream.write_all(&raw_request).await {
        error!(host, error = %e, "Failed to send upgrade request to target");
        return json_error_response(ProxyErrorCode::ConnectionFailed, "Failed to send upgrade request");
    }

    let mut response_buf = vec![0u8; 4096];
    let n = match backend_stream.read(&mut response_buf).await {
        Ok(n) if n > 0 => n,
        Ok(_) => {
            error!(host, "Target closed connection before answering upgrade");
            return json_error_response(ProxyErrorCode::ConnectionFailed, "Backend closed connection");
        }
        Err(e) => {
            error!(host, error = %e, "Failed to read upgrade response from target");
            return json_error_response(ProxyErrorCode::ConnectionFailed, "Failed to read backend response");
        }
    };

    let (status, response_headers) = match parse_upgrade_response(&response_buf[..n]) {
        Some(parsed) => parsed,
        None => {
            error!(host, "Failed to parse target upgrade response");
            return json_error_response(ProxyErrorCode::ConnectionFailed, "Invalid upgrade response from backend");
        }
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(host, status = %status, "Target rejected upgrade request");
        let mut response = Response::builder().status(status);
        for (name, value) in &response_headers {
            if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
                response = response.header(name, value);
            }
        }
        return response
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .expect("valid response builder");
    }

    info!(host, request_id, target, "Upgrade successful");

    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in &response_headers {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        if name == hyper::header::CONTENT_LENGTH || name == hyper::header::TRANSFER_ENCODING {
            continue;
        }
        if let Ok(value) = HeaderValue::from_str(value) {
            response = response.header(name, value);
        }
    }

    let response = response
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder");

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => forward_bidirectional(upgraded, backend_stream, &host, &request_id).await,
            Err(e) => error!(host, error = %e, "Failed to upgrade client connection"),
        }
        drop(guard);
    });

    response
}
