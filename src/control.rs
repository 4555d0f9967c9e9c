//! Routing control API
//!
//! A small HTTP surface over the routing store, bound to loopback by
//! default. Every endpoint except `/health` and `/version` requires the
//! configured bearer token.

use crate::error::RouterError;
use crate::router::Router;
use crate::server::{shutdown_signalled, Server};
use crate::storage::StorageError;
use async_trait::async_trait;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("valid response with StatusCode enum and static header")
}

fn error_json(err: &RouterError) -> Response<Full<Bytes>> {
    let status = match err {
        RouterError::Storage(StorageError::InvalidHost(_)) => StatusCode::BAD_REQUEST,
        RouterError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!(error = %err, "Control request failed");
    }
    json_response(status, json!({ "error": err.to_string() }))
}

pub struct ControlServer {
    listener: TcpListener,
    router: Arc<Router>,
    auth_token: Option<Arc<String>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ControlServer {
    pub async fn bind(
        addr: SocketAddr,
        router: Arc<Router>,
        auth_token: Option<String>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("control bind {}: {}", addr, e))?;
        Ok(Self {
            listener,
            router,
            auth_token: auth_token.filter(|t| !t.is_empty()).map(Arc::new),
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

#[async_trait]
impl Server for ControlServer {
    fn name(&self) -> &'static str {
        "control"
    }

    async fn serve(&self) -> anyhow::Result<()> {
        let addr = self.listener.local_addr()?;
        info!(addr = %addr, auth = self.auth_token.is_some(), "Control API listening");
        if self.auth_token.is_none() {
            warn!("Control API has no token configured; requests are not authenticated");
        }

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let router = Arc::clone(&self.router);
                            let auth_token = self.auth_token.clone();

                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let router = Arc::clone(&router);
                                    let token = auth_token.clone();
                                    async move { handle_control_request(req, router, token).await }
                                });

                                if let Err(e) = AutoBuilder::new(TokioExecutor::new()).serve_connection(io, service).await {
                                    debug!(addr = %peer, error = %e, "Control connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept control connection");
                        }
                    }
                }
                _ = shutdown_signalled(&mut shutdown_rx) => {
                    info!("Control API shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

fn check_auth<B>(req: &Request<B>, expected_token: Option<&str>) -> bool {
    let Some(expected) = expected_token else {
        return true;
    };
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| auth.strip_prefix("Bearer ").unwrap_or(auth) == expected)
        .unwrap_or(false)
}

fn query_params<B>(req: &Request<B>) -> HashMap<String, String> {
    req.uri()
        .query()
        .unwrap_or("")
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = urlencoding::decode(key).ok()?.into_owned();
            let value = urlencoding::decode(&value.replace('+', " ")).ok()?.into_owned();
            Some((key, value))
        })
        .collect()
}

/// Split `/prefix/{host}` or `/prefix/{host}/{action}`
fn path_segments(path: &str) -> Vec<&str> {
    path.trim_matches('/').split('/').filter(|s| !s.is_empty()).collect()
}

async fn handle_control_request(
    req: Request<Incoming>,
    router: Arc<Router>,
    auth_token: Option<Arc<String>>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!(%method, %path, "Control API request");

    match (&method, path.as_str()) {
        (&Method::GET, "/health") => return Ok(response(StatusCode::OK, "ok")),
        (&Method::GET, "/version") => {
            return Ok(json_response(StatusCode::OK, json!({ "name": PKG_NAME, "version": VERSION })));
        }
        _ => {}
    }

    if !check_auth(&req, auth_token.as_deref().map(String::as_str)) {
        warn!(path, "Unauthorized control API request");
        return Ok(response(StatusCode::UNAUTHORIZED, "unauthorized"));
    }

    let params = query_params(&req);
    let segments = path_segments(&path);

    let result = match (&method, segments.as_slice()) {
        (&Method::GET, ["hosts"]) => list_hosts(&router),

        (&Method::GET, ["targets", host]) => router
            .target_list(host)
            .map(|targets| json_response(StatusCode::OK, json!({ "host": host, "targets": targets }))),

        (&Method::POST, ["targets", host]) => match params.get("target").filter(|t| !t.is_empty()) {
            Some(target) => router
                .target_add(host, target)
                .await
                .map(|()| json_response(StatusCode::OK, json!({ "host": host, "target": target }))),
            None => Ok(response(StatusCode::BAD_REQUEST, "missing target")),
        },

        (&Method::DELETE, ["targets", host]) => match params.get("target").filter(|t| !t.is_empty()) {
            Some(target) => {
                info!(host, target, "Removing target via control API");
                router
                    .target_remove(host, target)
                    .map(|()| json_response(StatusCode::OK, json!({ "host": host, "target": target })))
            }
            None => Ok(response(StatusCode::BAD_REQUEST, "missing target")),
        },

        (&Method::GET, ["idle", host]) => router
            .storage()
            .idle_get(host)
            .map(|idle| json_response(StatusCode::OK, json!({ "host": host, "idle": idle })))
            .map_err(RouterError::from),

        (&Method::PUT, ["idle", host]) => match params.get("idle").map(|v| v.parse::<bool>()) {
            Some(Ok(idle)) => {
                info!(host, idle, "Setting idle flag via control API");
                router
                    .storage()
                    .idle_set(host, idle)
                    .map(|()| json_response(StatusCode::OK, json!({ "host": host, "idle": idle })))
                    .map_err(RouterError::from)
            }
            _ => Ok(response(StatusCode::BAD_REQUEST, "idle must be true or false")),
        },

        (&Method::POST, ["requests", host, "begin"]) => router
            .storage()
            .request_begin(host)
            .map(|()| response(StatusCode::OK, "ok"))
            .map_err(RouterError::from),

        (&Method::POST, ["requests", host, "end"]) => {
            router.request_end(host).map(|()| response(StatusCode::OK, "ok"))
        }

        _ => Ok(response(StatusCode::NOT_FOUND, "not found")),
    };

    Ok(result.unwrap_or_else(|e| error_json(&e)))
}

fn list_hosts(router: &Router) -> Result<Response<Full<Bytes>>, RouterError> {
    let storage = router.storage();
    let mut hosts = Vec::new();

    for host in storage.host_list()? {
        let targets = storage.target_list(&host)?;
        let entry = match storage.activity(&host)? {
            Some(activity) => json!({
                "host": host,
                "idle": activity.idle,
                "in_flight": activity.in_flight,
                "last_activity": activity.last_activity.to_rfc3339(),
                "targets": targets,
            }),
            None => json!({ "host": host, "idle": false, "in_flight": 0, "targets": targets }),
        };
        hosts.push(entry);
    }

    Ok(json_response(StatusCode::OK, json!({ "count": hosts.len(), "hosts": hosts })))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str, auth: Option<&str>) -> Request<()> {
        let mut builder = Request::builder().uri(uri);
        if let Some(auth) = auth {
            builder = builder.header(AUTHORIZATION, auth);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_check_auth() {
        assert!(check_auth(&request("/hosts", Some("Bearer s3cret")), Some("s3cret")));
        assert!(check_auth(&request("/hosts", Some("s3cret")), Some("s3cret")));
        assert!(!check_auth(&request("/hosts", Some("Bearer wrong")), Some("s3cret")));
        assert!(!check_auth(&request("/hosts", None), Some("s3cret")));
        assert!(check_auth(&request("/hosts", None), None));
    }

    #[test]
    fn test_query_params_decoded() {
        let params = query_params(&request(
            "/targets/a.example.com?target=http%3A%2F%2F10.0.0.1%3A80&flag",
            None,
        ));
        assert_eq!(params.get("target").unwrap(), "http://10.0.0.1:80");
        assert_eq!(params.get("flag").unwrap(), "");
    }

    #[test]
    fn test_path_segments() {
        assert_eq!(path_segments("/requests/a.example.com/begin"), vec!["requests", "a.example.com", "begin"]);
        assert_eq!(path_segments("/hosts/"), vec!["hosts"]);
        assert!(path_segments("/").is_empty());
    }
}
