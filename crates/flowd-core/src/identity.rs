//! Resolved source identity of this host.
//!
//! Produced by the address resolver and stamped onto every lifecycle event.
//! Values are immutable snapshots shared through `Arc`; a refresh publishes a
//! new snapshot instead of mutating the old one.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, SystemTime};

/// Identity for one IP family
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FamilyIdentity {
    /// Address the OS binds outbound traffic of this family to
    pub local: Option<IpAddr>,
    /// NAT-mapped public endpoint, if STUN discovery succeeded
    pub public: Option<SocketAddr>,
    /// When `public` was last confirmed
    pub public_seen_at: Option<SystemTime>,
}

impl FamilyIdentity {
    /// Public mapping if it was confirmed within `max_age` of `now`
    #[must_use]
    pub fn public_within(&self, max_age: Duration, now: SystemTime) -> Option<SocketAddr> {
        let seen = self.public_seen_at?;
        let age = now.duration_since(seen).unwrap_or(Duration::ZERO);
        if age <= max_age { self.public } else { None }
    }
}

/// Latest known source identity, both families
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedIdentity {
    /// IPv4 identity
    pub v4: FamilyIdentity,
    /// IPv6 identity
    pub v6: FamilyIdentity,
    /// Refresh generation, incremented by each publish
    pub generation: u64,
}

impl ResolvedIdentity {
    /// Identity matching the family of `addr`
    #[must_use]
    pub fn for_addr(&self, addr: &IpAddr) -> &FamilyIdentity {
        match addr {
            IpAddr::V4(_) => &self.v4,
            IpAddr::V6(_) => &self.v6,
        }
    }

    /// Whether neither family has resolved anything
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.v4 == FamilyIdentity::default() && self.v6 == FamilyIdentity::default()
    }
}
