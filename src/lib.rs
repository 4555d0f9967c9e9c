//! Rack router - the ingress core of a container platform rack
//!
//! This library provides:
//! - A routing store mapping hosts to backend targets, with idle and
//!   in-flight request state
//! - A DNS responder for internal service names and routed hosts
//! - An HTTP/HTTPS gateway with per-handshake certificate selection
//! - Scale-to-zero: idle hosts are scaled down and woken on the next request
//! - An ingress reconciler that keeps routes in line with the cluster

pub mod acme;
pub mod certs;
pub mod cluster;
pub mod config;
pub mod control;
pub mod dns;
pub mod error;
pub mod idle;
pub mod ingress;
pub mod pool;
pub mod proxy;
pub mod router;
pub mod server;
pub mod storage;
