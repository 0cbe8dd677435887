//! Firefly UDP backend.
//!
//! Encodes each lifecycle event as one syslog-framed firefly datagram and
//! sends it fire-and-forget: no acknowledgement, no retry. The destination is
//! either a fixed collector or, when none is configured, the remote address
//! of the flow itself on the firefly port.

use crate::backend::{Backend, BackendCounters, BackendError, BackendResult, BackendStats};
use crate::config::{FireflyConfig, UDP_FIREFLY};
use async_trait::async_trait;
use flowd_core::firefly::system_hostname;
use flowd_core::{FireflyEncoder, LifecycleEvent};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::UdpSocket;

/// Where fireflies are sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// Fixed collector endpoint
    Collector(SocketAddr),
    /// The flow's remote address on this port
    FlowRemote(u16),
}

impl Destination {
    /// Datagram target for `event`
    #[must_use]
    pub fn target(&self, event: &LifecycleEvent) -> SocketAddr {
        match self {
            Self::Collector(addr) => *addr,
            Self::FlowRemote(port) => SocketAddr::new(event.key.remote.ip(), *port),
        }
    }
}

/// Firefly emitter over UDP
pub struct UdpFireflyBackend {
    v4: Option<UdpSocket>,
    v6: Option<UdpSocket>,
    destination: Destination,
    encoder: FireflyEncoder,
    closed: AtomicBool,
    counters: BackendCounters,
}

impl UdpFireflyBackend {
    /// Resolve the collector and open the sending sockets
    ///
    /// # Errors
    /// Returns `BackendError::InvalidConfig` if the collector does not
    /// resolve, or `BackendError::Io` if no socket can be opened
    pub async fn connect(config: &FireflyConfig) -> BackendResult<Self> {
        let destination = match &config.collector {
            Some(collector) => Destination::Collector(resolve_collector(collector).await?),
            None => Destination::FlowRemote(config.port),
        };

        let wants = |v4: bool| match destination {
            Destination::Collector(addr) => addr.is_ipv4() == v4,
            Destination::FlowRemote(_) => true,
        };
        let v4 = if wants(true) {
            Some(bind_socket(Ipv4Addr::UNSPECIFIED.into(), config.send_buffer_size)?)
        } else {
            None
        };
        let v6 = if wants(false) {
            match bind_socket(Ipv6Addr::UNSPECIFIED.into(), config.send_buffer_size) {
                Ok(socket) => Some(socket),
                // v6-less hosts still get v4 fireflies
                Err(e) if v4.is_some() => {
                    tracing::debug!(error = %e, "no IPv6 firefly socket");
                    None
                }
                Err(e) => return Err(e),
            }
        } else {
            None
        };

        let hostname = config.hostname.clone().unwrap_or_else(system_hostname);
        tracing::info!(?destination, %hostname, "firefly backend ready");

        Ok(Self {
            v4,
            v6,
            destination,
            encoder: FireflyEncoder::new(hostname),
            closed: AtomicBool::new(false),
            counters: BackendCounters::default(),
        })
    }

    /// Configured destination
    #[must_use]
    pub fn destination(&self) -> Destination {
        self.destination
    }

    async fn send(&self, event: &LifecycleEvent) -> BackendResult<usize> {
        let datagram = self.encoder.encode(event)?;
        let target = self.destination.target(event);
        let socket = if target.is_ipv4() { &self.v4 } else { &self.v6 };
        let socket = socket.as_ref().ok_or_else(|| {
            BackendError::Other(format!("no socket for the address family of {target}"))
        })?;
        Ok(socket.send_to(&datagram, target).await?)
    }
}

#[async_trait]
impl Backend for UdpFireflyBackend {
    fn name(&self) -> &str {
        UDP_FIREFLY
    }

    async fn accept(&self, event: &LifecycleEvent) -> BackendResult<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(BackendError::Closed);
        }

        match self.send(event).await {
            Ok(sent) => {
                self.counters.record_sent(sent);
                tracing::trace!(flow = %event.key, kind = %event.kind, bytes = sent, "firefly sent");
                Ok(())
            }
            Err(e) => {
                self.counters.record_error();
                Err(e)
            }
        }
    }

    async fn close(&self) -> BackendResult<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn stats(&self) -> BackendStats {
        self.counters.snapshot()
    }
}

async fn resolve_collector(collector: &str) -> BackendResult<SocketAddr> {
    tokio::net::lookup_host(collector)
        .await
        .map_err(|e| BackendError::InvalidConfig(format!("collector '{collector}': {e}")))?
        .next()
        .ok_or_else(|| {
            BackendError::InvalidConfig(format!("collector '{collector}' has no address"))
        })
}

fn bind_socket(ip: std::net::IpAddr, send_buffer_size: Option<usize>) -> BackendResult<UdpSocket> {
    let addr = SocketAddr::new(ip, 0);
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    if let Some(size) = send_buffer_size {
        socket.set_send_buffer_size(size)?;
    }
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}
