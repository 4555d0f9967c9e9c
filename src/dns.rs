//! DNS responder
//!
//! Answers A queries for `<service>.<namespace>.svc.cluster.local` from the
//! cluster's service addresses and for routed hosts with the router's own
//! address. Every other query is forwarded verbatim to the upstream
//! resolver and its answer relayed unmodified.

use crate::config::DnsConfig;
use crate::error::RouterError;
use crate::router::{parse_internal_name, Router};
use crate::server::{shutdown_signalled, Server};
use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const MAX_PACKET: usize = 4096;
const HEADER_LEN: usize = 12;

/// First nameserver in a resolver configuration file, on port 53
pub fn upstream_from_resolv_conf(path: &Path) -> Result<SocketAddr, RouterError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| RouterError::Upstream(format!("{}: {}", path.display(), e)))?;
    parse_resolv_conf(&content).ok_or_else(|| RouterError::Upstream("no upstream dns".into()))
}

fn parse_resolv_conf(content: &str) -> Option<SocketAddr> {
    content
        .lines()
        .map(|line| line.split(['#', ';']).next().unwrap_or("").trim())
        .filter_map(|line| line.strip_prefix("nameserver"))
        .filter_map(|rest| {
            // Drop any IPv6 zone suffix
            let addr = rest.trim().split('%').next()?;
            addr.parse::<IpAddr>().ok()
        })
        .map(|ip| SocketAddr::new(ip, 53))
        .next()
}

/// Per-query resolution logic, shared by every query task
pub struct DnsResolver {
    router: Arc<Router>,
    upstream: SocketAddr,
    ttl: u32,
    lookup_timeout: Duration,
    upstream_timeout: Duration,
}

enum Answer {
    Address(IpAddr),
    NoData,
    NxDomain,
    Forward,
}

impl DnsResolver {
    pub fn new(router: Arc<Router>, upstream: SocketAddr, config: &DnsConfig) -> Self {
        Self {
            router,
            upstream,
            ttl: config.ttl_secs,
            lookup_timeout: config.lookup_timeout(),
            upstream_timeout: config.upstream_timeout(),
        }
    }

    pub fn upstream(&self) -> SocketAddr {
        self.upstream
    }

    /// Response bytes for one query packet, `None` if the packet is dropped
    pub async fn handle(&self, packet: &[u8], peer: SocketAddr) -> Option<Vec<u8>> {
        let request = match Message::from_bytes(packet) {
            Ok(request) => request,
            Err(e) => {
                debug!(peer = %peer, error = %e, "Undecodable DNS packet");
                return format_error(packet);
            }
        };

        let query = match request.queries().first() {
            Some(query) => query.clone(),
            None => return encode(&reply(&request, ResponseCode::FormErr)),
        };
        let name = query.name().to_utf8();

        let answer = match self.answer(&name, query.query_type(), peer).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!(name, error = %e, "DNS resolution failed");
                return encode(&reply(&request, ResponseCode::ServFail));
            }
        };

        match answer {
            Answer::Address(IpAddr::V4(ip)) => {
                let mut response = reply(&request, ResponseCode::NoError);
                response.set_authoritative(true);
                response.add_answer(Record::from_rdata(query.name().clone(), self.ttl, RData::A(A(ip))));
                encode(&response)
            }
            Answer::Address(IpAddr::V6(_)) | Answer::NoData => {
                let mut response = reply(&request, ResponseCode::NoError);
                response.set_authoritative(true);
                encode(&response)
            }
            Answer::NxDomain => {
                let mut response = reply(&request, ResponseCode::NXDomain);
                response.set_authoritative(true);
                encode(&response)
            }
            Answer::Forward => match self.forward(packet, request.id()).await {
                Ok(response) => Some(response),
                Err(e) => {
                    warn!(name, upstream = %self.upstream, error = %e, "Upstream DNS failed");
                    encode(&reply(&request, ResponseCode::ServFail))
                }
            },
        }
    }

    async fn answer(&self, name: &str, record_type: RecordType, peer: SocketAddr) -> Result<Answer, RouterError> {
        if let Some((service, namespace)) = parse_internal_name(name) {
            let lookup = self.router.cluster().service_ip(&namespace, &service);
            let ip = tokio::time::timeout(self.lookup_timeout, lookup)
                .await
                .map_err(|_| RouterError::Upstream(format!("service lookup timed out for {}", name)))??;

            return Ok(match ip {
                None => Answer::NxDomain,
                Some(ip) if record_type == RecordType::A => {
                    debug!(name, ip = %ip, "Resolved internal name");
                    Answer::Address(ip)
                }
                Some(_) => Answer::NoData,
            });
        }

        if record_type == RecordType::A {
            let host = name.trim_end_matches('.');
            if !host.is_empty() && !self.router.target_list(host)?.is_empty() {
                let ip = self.router.external_ip(peer.ip());
                debug!(name, ip = %ip, peer = %peer, "Resolved routed host");
                return Ok(Answer::Address(ip));
            }
        }

        Ok(Answer::Forward)
    }

    /// Send the packet unchanged to the upstream and return its reply unchanged
    async fn forward(&self, packet: &[u8], id: u16) -> std::io::Result<Vec<u8>> {
        let bind: SocketAddr = match self.upstream {
            SocketAddr::V4(_) => "0.0.0.0:0".parse().map_err(std::io::Error::other)?,
            SocketAddr::V6(_) => "[::]:0".parse().map_err(std::io::Error::other)?,
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(self.upstream).await?;
        socket.send(packet).await?;

        let mut buf = vec![0u8; MAX_PACKET];
        tokio::time::timeout(self.upstream_timeout, async {
            loop {
                let len = socket.recv(&mut buf).await?;
                // Ignore stray datagrams that do not answer this query
                if len >= 2 && u16::from_be_bytes([buf[0], buf[1]]) == id {
                    return Ok(buf[..len].to_vec());
                }
            }
        })
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "upstream timed out"))?
    }
}

/// Response skeleton mirroring the request's id, opcode and question
fn reply(request: &Message, code: ResponseCode) -> Message {
    let mut response = Message::new();
    response
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(request.op_code())
        .set_recursion_desired(request.recursion_desired())
        .set_recursion_available(true)
        .set_response_code(code);
    response.add_queries(request.queries().iter().cloned());
    response
}

/// FORMERR for a packet whose id can still be read
fn format_error(packet: &[u8]) -> Option<Vec<u8>> {
    if packet.len() < HEADER_LEN {
        return None;
    }
    let mut response = Message::new();
    response
        .set_id(u16::from_be_bytes([packet[0], packet[1]]))
        .set_message_type(MessageType::Response)
        .set_response_code(ResponseCode::FormErr);
    encode(&response)
}

fn encode(message: &Message) -> Option<Vec<u8>> {
    match message.to_bytes() {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!(error = %e, "Failed to encode DNS response");
            None
        }
    }
}

/// UDP listener handing each query to its own task
pub struct DnsServer {
    socket: Arc<UdpSocket>,
    resolver: Arc<DnsResolver>,
    shutdown: watch::Receiver<bool>,
}

impl DnsServer {
    /// Bind the socket; fails startup if the address is unavailable
    pub async fn bind(
        addr: SocketAddr,
        resolver: DnsResolver,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("DNS bind {}: {}", addr, e))?;
        Ok(Self {
            socket: Arc::new(socket),
            resolver: Arc::new(resolver),
            shutdown,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[async_trait]
impl Server for DnsServer {
    fn name(&self) -> &'static str {
        "dns"
    }

    async fn serve(&self) -> anyhow::Result<()> {
        info!(
            addr = %self.socket.local_addr()?,
            upstream = %self.resolver.upstream(),
            "DNS responder listening"
        );

        let mut shutdown = self.shutdown.clone();
        let mut buf = vec![0u8; MAX_PACKET];

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    let (len, peer) = match result {
                        Ok(received) => received,
                        Err(e) => {
                            debug!(error = %e, "DNS receive failed");
                            continue;
                        }
                    };

                    let packet = buf[..len].to_vec();
                    let resolver = Arc::clone(&self.resolver);
                    let socket = Arc::clone(&self.socket);

                    tokio::spawn(async move {
                        if let Some(response) = resolver.handle(&packet, peer).await {
                            if let Err(e) = socket.send_to(&response, peer).await {
                                debug!(peer = %peer, error = %e, "DNS send failed");
                            }
                        }
                    });
                }
                _ = shutdown_signalled(&mut shutdown) => {
                    info!("DNS responder shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}
