pub mod tcp;
pub mod udp;

use crate::config::types::Protocol;
use crate::metrics::MetricsRegistry;
use crate::pipeline::QueueHandle;
use parking_lot::RwLock;
use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

pub type EndpointKey = (Protocol, u16);

/// Largest record accepted per transport. UDP is bounded by the maximum
/// datagram payload; TCP lines beyond the cap are dropped as parse
/// failures.
pub const MAX_UDP_RECORD: usize = 65_507;
pub const MAX_TCP_RECORD: usize = 1024 * 1024;

/// Where records from one peer go: the owning source and its queue.
#[derive(Clone)]
pub struct Route {
    pub source_id: Uuid,
    pub queue: QueueHandle,
}

pub type RouteTable = HashMap<IpAddr, Route>;

/// The peer-IP routing table of one endpoint, swapped wholesale on
/// reload. Readers clone the inner Arc; the ingest path never holds the
/// lock across an await.
#[derive(Clone)]
pub struct SharedRoutes {
    inner: Arc<RwLock<Arc<RouteTable>>>,
}

impl SharedRoutes {
    fn new(table: RouteTable) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(table))),
        }
    }

    pub fn snapshot(&self) -> Arc<RouteTable> {
        self.inner.read().clone()
    }

    fn swap(&self, table: RouteTable) {
        *self.inner.write() = Arc::new(table);
    }
}

/// IPv4 peers on dual-stack sockets arrive as mapped IPv6 addresses;
/// compare against configured literals in canonical form.
pub fn canonical_ip(ip: IpAddr) -> IpAddr {
    ip.to_canonical()
}

/// Endpoints bind the IPv6 wildcard with `IPV6_V6ONLY` off so one
/// socket serves peers of both families; sources may claim IPv4 or
/// IPv6 literals.
fn bind_udp(port: u16) -> Result<UdpSocket, std::io::Error> {
    let addr = SocketAddr::from(([0u16; 8], port));
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(SockProtocol::UDP))?;
    socket.set_only_v6(false)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

fn bind_tcp(port: u16) -> Result<TcpListener, std::io::Error> {
    let addr = SocketAddr::from(([0u16; 8], port));
    let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(SockProtocol::TCP))?;
    socket.set_only_v6(false)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    TcpListener::from_std(socket.into())
}

struct Endpoint {
    routes: SharedRoutes,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Debug)]
pub struct BindFailure {
    pub endpoint: EndpointKey,
    pub error: std::io::Error,
}

/// Owns one listening socket per distinct `(protocol, port)` and the
/// routing table that demultiplexes peers onto source queues.
pub struct ListenerMux {
    endpoints: HashMap<EndpointKey, Endpoint>,
    registry: Arc<MetricsRegistry>,
    idle_timeout: Duration,
    drain_deadline: Duration,
}

impl ListenerMux {
    pub fn new(
        registry: Arc<MetricsRegistry>,
        idle_timeout: Duration,
        drain_deadline: Duration,
    ) -> Self {
        Self {
            endpoints: HashMap::new(),
            registry,
            idle_timeout,
            drain_deadline,
        }
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    /// Diff the running endpoints against the desired set: close removed
    /// endpoints, open added ones, and swap routing tables on survivors.
    /// Surviving endpoints keep their socket, so an unchanged
    /// configuration causes no socket churn.
    ///
    /// Bind failures are collected, not fatal: every other endpoint
    /// keeps running.
    pub async fn reconcile(
        &mut self,
        mut desired: HashMap<EndpointKey, RouteTable>,
    ) -> Vec<BindFailure> {
        let stale: Vec<EndpointKey> = self
            .endpoints
            .keys()
            .filter(|key| !desired.contains_key(key))
            .copied()
            .collect();

        for key in stale {
            if let Some(endpoint) = self.endpoints.remove(&key) {
                info!(protocol = %key.0, port = key.1, "Closing endpoint");
                endpoint.cancel.cancel();
                let _ = endpoint.handle.await;
            }
        }

        let mut failures = Vec::new();
        for (key, table) in desired.drain() {
            if let Some(endpoint) = self.endpoints.get(&key) {
                endpoint.routes.swap(table);
                continue;
            }

            match self.open(key, table) {
                Ok(endpoint) => {
                    info!(protocol = %key.0, port = key.1, "Opened endpoint");
                    self.endpoints.insert(key, endpoint);
                }
                Err(error) => {
                    error!(
                        protocol = %key.0,
                        port = key.1,
                        error = %error,
                        "Failed to bind endpoint"
                    );
                    failures.push(BindFailure {
                        endpoint: key,
                        error,
                    });
                }
            }
        }

        failures
    }

    fn open(&self, key: EndpointKey, table: RouteTable) -> Result<Endpoint, std::io::Error> {
        let (protocol, port) = key;
        let routes = SharedRoutes::new(table);
        let cancel = CancellationToken::new();

        let handle = match protocol {
            Protocol::Udp => {
                let socket = bind_udp(port)?;
                tokio::spawn(udp::run_udp(
                    socket,
                    routes.clone(),
                    self.registry.clone(),
                    cancel.clone(),
                ))
            }
            Protocol::Tcp => {
                let listener = bind_tcp(port)?;
                tokio::spawn(tcp::run_tcp(
                    listener,
                    routes.clone(),
                    self.registry.clone(),
                    self.idle_timeout,
                    self.drain_deadline,
                    cancel.clone(),
                ))
            }
        };

        Ok(Endpoint {
            routes,
            cancel,
            handle,
        })
    }

    /// Close every endpoint. After this returns no listening socket is
    /// open.
    pub async fn shutdown(&mut self) {
        for (key, endpoint) in self.endpoints.drain() {
            info!(protocol = %key.0, port = key.1, "Closing endpoint");
            endpoint.cancel.cancel();
            let _ = endpoint.handle.await;
        }
    }
}
