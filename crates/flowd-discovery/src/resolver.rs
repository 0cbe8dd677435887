//! Address Resolver
//!
//! Keeps the host's source identity current: the local address per IP family
//! and, when STUN is enabled, the NAT-mapped public endpoint. The latest
//! identity is published through a `watch` channel as an immutable
//! `Arc<ResolvedIdentity>`; readers never block the refresh task and never
//! see a half-updated value.

use crate::error::ResolverError;
use crate::local::{DEFAULT_HOP_LIMIT, DEFAULT_V4_TARGET, DEFAULT_V6_TARGET, probe_local_address};
use crate::nat::StunClient;
use flowd_core::{FamilyIdentity, ResolvedIdentity};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Default public STUN servers, tried in order
pub const DEFAULT_STUN_SERVERS: [&str; 2] =
    ["stun.l.google.com:19305", "stun.services.mozilla.org:3478"];

/// Resolver configuration
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// IPv4 discovery target; `None` disables the family
    pub v4_target: Option<SocketAddr>,
    /// IPv6 discovery target; `None` disables the family
    pub v6_target: Option<SocketAddr>,
    /// TTL / unicast hop limit for the probe socket
    pub hop_limit: u32,
    /// Query STUN servers for the public mapping
    pub stun_enabled: bool,
    /// STUN servers as `host:port`, tried in order
    pub stun_servers: Vec<String>,
    /// Per-server STUN timeout
    pub stun_timeout: Duration,
    /// Refresh period
    pub refresh_interval: Duration,
    /// How long an unconfirmed public mapping is kept
    pub public_validity: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            v4_target: DEFAULT_V4_TARGET.parse().ok(),
            v6_target: DEFAULT_V6_TARGET.parse().ok(),
            hop_limit: DEFAULT_HOP_LIMIT,
            stun_enabled: true,
            stun_servers: DEFAULT_STUN_SERVERS.iter().map(ToString::to_string).collect(),
            stun_timeout: Duration::from_secs(3),
            refresh_interval: Duration::from_secs(300),
            public_validity: Duration::from_secs(900),
        }
    }
}

impl ResolverConfig {
    /// Check targets, hop limit and server syntax
    ///
    /// # Errors
    ///
    /// Returns [`ResolverError::InvalidConfig`] describing the first problem.
    pub fn validate(&self) -> Result<(), ResolverError> {
        if let Some(target) = self.v4_target {
            if !target.is_ipv4() {
                return Err(ResolverError::InvalidConfig(format!(
                    "IPv4 discovery target {target} is not an IPv4 address"
                )));
            }
        }
        if let Some(target) = self.v6_target {
            if !target.is_ipv6() {
                return Err(ResolverError::InvalidConfig(format!(
                    "IPv6 discovery target {target} is not an IPv6 address"
                )));
            }
        }
        if self.hop_limit == 0 || self.hop_limit > 255 {
            return Err(ResolverError::InvalidConfig(format!(
                "hop limit must be between 1 and 255, got {}",
                self.hop_limit
            )));
        }
        if self.refresh_interval.is_zero() {
            return Err(ResolverError::InvalidConfig(
                "resolver refresh interval must be non-zero".into(),
            ));
        }
        for server in &self.stun_servers {
            validate_host_port(server)?;
        }
        Ok(())
    }
}

/// Check a `host:port` or `[v6]:port` string
///
/// # Errors
///
/// Returns [`ResolverError::InvalidConfig`] if the host is empty or the port
/// is missing, zero or not a number.
pub fn validate_host_port(value: &str) -> Result<(), ResolverError> {
    let invalid = |why: &str| ResolverError::InvalidConfig(format!("'{value}': {why}"));

    let (host, port) = value.rsplit_once(':').ok_or_else(|| invalid("expected host:port"))?;
    let host = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(host);
    if host.is_empty() {
        return Err(invalid("empty host"));
    }
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(invalid("invalid port")),
        Ok(_) => Ok(()),
    }
}

/// Read side of the identity cache
#[derive(Debug, Clone)]
pub struct IdentityHandle {
    rx: watch::Receiver<Arc<ResolvedIdentity>>,
}

impl IdentityHandle {
    /// Latest published identity
    #[must_use]
    pub fn current(&self) -> Arc<ResolvedIdentity> {
        Arc::clone(&self.rx.borrow())
    }

    /// Wait for the next publish
    ///
    /// Returns `false` once the resolver is gone.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

/// Periodically resolves local and public addresses
#[derive(Debug)]
pub struct AddressResolver {
    config: ResolverConfig,
    tx: watch::Sender<Arc<ResolvedIdentity>>,
}

impl AddressResolver {
    /// Create a resolver; nothing is resolved until [`refresh`](Self::refresh)
    /// or [`run`](Self::run)
    #[must_use]
    pub fn new(config: ResolverConfig) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(ResolvedIdentity::default()));
        Self { config, tx }
    }

    /// Handle for reading the identity cache
    #[must_use]
    pub fn handle(&self) -> IdentityHandle {
        IdentityHandle {
            rx: self.tx.subscribe(),
        }
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Resolve both families once and publish the result
    pub async fn refresh(&self) -> Arc<ResolvedIdentity> {
        let previous = Arc::clone(&self.tx.borrow());
        let now = SystemTime::now();

        let v4 = self.resolve_family(self.config.v4_target, &previous.v4, now).await;
        let v6 = self.resolve_family(self.config.v6_target, &previous.v6, now).await;

        let identity = Arc::new(ResolvedIdentity {
            v4,
            v6,
            generation: previous.generation + 1,
        });
        tracing::debug!(
            generation = identity.generation,
            v4_local = ?identity.v4.local,
            v4_public = ?identity.v4.public,
            v6_local = ?identity.v6.local,
            v6_public = ?identity.v6.public,
            "identity refreshed"
        );
        self.tx.send_replace(Arc::clone(&identity));
        identity
    }

    /// Refresh on the configured period until `shutdown` flips to `true`.
    ///
    /// The first refresh happens one period after the call; callers that need
    /// an identity straight away run [`refresh`](Self::refresh) first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let period = self.config.refresh_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.refresh().await;
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("address resolver stopped");
    }

    async fn resolve_family(
        &self,
        target: Option<SocketAddr>,
        previous: &FamilyIdentity,
        now: SystemTime,
    ) -> FamilyIdentity {
        let Some(target) = target else {
            return FamilyIdentity::default();
        };

        let local = match probe_local_address(target, self.config.hop_limit) {
            Ok(ip) => Some(ip),
            Err(e) => {
                tracing::debug!(error = %e, "local address unavailable");
                None
            }
        };

        let mut family = FamilyIdentity {
            local,
            ..FamilyIdentity::default()
        };
        if !self.config.stun_enabled {
            return family;
        }

        let bind_ip = local.unwrap_or(if target.is_ipv4() {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        });

        match self.discover_public(bind_ip).await {
            Some(public) => {
                family.public = Some(public);
                family.public_seen_at = Some(now);
            }
            None => {
                // keep an unconfirmed mapping until it expires
                if previous.public_within(self.config.public_validity, now).is_some() {
                    family.public = previous.public;
                    family.public_seen_at = previous.public_seen_at;
                }
            }
        }
        family
    }

    /// Query the configured servers in order; first success wins
    async fn discover_public(&self, bind_ip: IpAddr) -> Option<SocketAddr> {
        let mut client = match StunClient::bind(SocketAddr::new(bind_ip, 0)).await {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!(%bind_ip, error = %e, "cannot bind STUN socket");
                return None;
            }
        };
        client.set_timeout(self.config.stun_timeout);

        for server in &self.config.stun_servers {
            match query_server(&client, server, bind_ip.is_ipv4()).await {
                Ok(mapped) => {
                    tracing::debug!(%server, %mapped, "public mapping discovered");
                    return Some(mapped);
                }
                Err(e) => tracing::warn!(error = %e, "STUN server failed, trying next"),
            }
        }

        tracing::info!(%bind_ip, "no public mapping: all STUN servers failed");
        None
    }
}

async fn query_server(
    client: &StunClient,
    server: &str,
    want_v4: bool,
) -> Result<SocketAddr, ResolverError> {
    let addr = tokio::net::lookup_host(server)
        .await
        .map_err(|e| ResolverError::Stun {
            server: server.to_string(),
            source: e.into(),
        })?
        .find(|addr| addr.is_ipv4() == want_v4)
        .ok_or_else(|| ResolverError::Unresolvable(server.to_string()))?;

    client
        .get_mapped_address(addr)
        .await
        .map_err(|source| ResolverError::Stun {
            server: server.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat::StunMessage;
    use tokio::net::UdpSocket;

    fn loopback_config(stun_servers: Vec<String>) -> ResolverConfig {
        ResolverConfig {
            v4_target: "127.0.0.1:9".parse().ok(),
            v6_target: None,
            stun_servers,
            stun_timeout: Duration::from_millis(100),
            ..ResolverConfig::default()
        }
    }

    async fn fake_stun(mapped: SocketAddr) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            while let Ok((len, from)) = socket.recv_from(&mut buf).await {
                if let Ok(request) = StunMessage::decode(&buf[..len]) {
                    let response = StunMessage::binding_success(request.transaction_id, mapped);
                    let _ = socket.send_to(&response.encode(), from).await;
                }
            }
        });
        addr
    }

    /// Answers every request, but only after `delay`
    async fn slow_stun(mapped: SocketAddr, delay: Duration) -> SocketAddr {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            while let Ok((len, from)) = socket.recv_from(&mut buf).await {
                if let Ok(request) = StunMessage::decode(&buf[..len]) {
                    let socket = Arc::clone(&socket);
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let response = StunMessage::binding_success(request.transaction_id, mapped);
                        let _ = socket.send_to(&response.encode(), from).await;
                    });
                }
            }
        });
        addr
    }

    async fn dead_server() -> String {
        // bound but never answers
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let _keep = socket;
            std::future::pending::<()>().await;
        });
        addr.to_string()
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = ResolverConfig::default();
        config.validate().unwrap();
        assert_eq!(config.stun_servers.len(), 2);
        assert_eq!(config.hop_limit, 1);
    }

    #[test]
    fn test_validate_rejects_wrong_family() {
        let config = ResolverConfig {
            v4_target: "[fc00::]:1".parse().ok(),
            ..ResolverConfig::default()
        };
        assert!(matches!(config.validate(), Err(ResolverError::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_host_port() {
        assert!(validate_host_port("stun.example.org:3478").is_ok());
        assert!(validate_host_port("[2001:db8::1]:3478").is_ok());
        assert!(validate_host_port("stun.example.org").is_err());
        assert!(validate_host_port(":3478").is_err());
        assert!(validate_host_port("host:0").is_err());
        assert!(validate_host_port("host:http").is_err());
    }

    #[tokio::test]
    async fn test_refresh_with_fallback() {
        let mapped: SocketAddr = "203.0.113.7:40000".parse().unwrap();
        let good = fake_stun(mapped).await;
        let resolver = AddressResolver::new(loopback_config(vec![
            dead_server().await,
            good.to_string(),
        ]));
        let handle = resolver.handle();

        let identity = resolver.refresh().await;
        assert_eq!(identity.v4.local, Some(IpAddr::from([127, 0, 0, 1])));
        assert_eq!(identity.v4.public, Some(mapped));
        assert!(identity.v4.public_seen_at.is_some());
        assert_eq!(identity.v6, FamilyIdentity::default());
        assert_eq!(handle.current().generation, 1);
    }

    #[tokio::test]
    async fn test_late_reply_does_not_break_fallback() {
        let stale: SocketAddr = "198.51.100.1:1111".parse().unwrap();
        let mapped: SocketAddr = "203.0.113.7:40000".parse().unwrap();
        // first server answers after the 100ms query timeout, while the
        // second query is waiting on the same socket
        let late = slow_stun(stale, Duration::from_millis(150)).await;
        let good = slow_stun(mapped, Duration::from_millis(80)).await;
        let resolver = AddressResolver::new(loopback_config(vec![
            late.to_string(),
            good.to_string(),
        ]));

        let identity = resolver.refresh().await;
        assert_eq!(identity.v4.public, Some(mapped));
    }

    #[tokio::test]
    async fn test_all_servers_fail() {
        let resolver = AddressResolver::new(loopback_config(vec![
            dead_server().await,
            dead_server().await,
        ]));
        let identity = resolver.refresh().await;
        assert!(identity.v4.local.is_some());
        assert_eq!(identity.v4.public, None);
    }

    #[tokio::test]
    async fn test_stale_mapping_kept_then_dropped() {
        let mapped: SocketAddr = "203.0.113.7:40000".parse().unwrap();
        let good = fake_stun(mapped).await;
        let dead = dead_server().await;

        let resolver = AddressResolver::new(loopback_config(vec![good.to_string()]));
        assert_eq!(resolver.refresh().await.v4.public, Some(mapped));

        // servers now unreachable, mapping still within validity
        let mut config = loopback_config(vec![dead.clone()]);
        config.public_validity = Duration::from_secs(60);
        let resolver = AddressResolver {
            config,
            tx: resolver.tx,
        };
        assert_eq!(resolver.refresh().await.v4.public, Some(mapped));

        let mut config = loopback_config(vec![dead]);
        config.public_validity = Duration::ZERO;
        let resolver = AddressResolver {
            config,
            tx: resolver.tx,
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(resolver.refresh().await.v4.public, None);
    }

    #[tokio::test]
    async fn test_stun_disabled() {
        let config = ResolverConfig {
            stun_enabled: false,
            ..loopback_config(Vec::new())
        };
        let identity = AddressResolver::new(config).refresh().await;
        assert!(identity.v4.local.is_some());
        assert!(identity.v4.public.is_none());
    }

    #[tokio::test]
    async fn test_run_publishes_and_stops() {
        let config = ResolverConfig {
            stun_enabled: false,
            refresh_interval: Duration::from_millis(20),
            ..loopback_config(Vec::new())
        };
        let resolver = Arc::new(AddressResolver::new(config));
        let mut handle = resolver.handle();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = {
            let resolver = Arc::clone(&resolver);
            tokio::spawn(async move { resolver.run(shutdown_rx).await })
        };

        assert!(handle.changed().await);
        assert!(handle.current().generation >= 1);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
