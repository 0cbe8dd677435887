//! # flowd Discovery
//!
//! Source identity discovery for flowd:
//!
//! - **Local address probe**: which address the kernel picks for outbound
//!   traffic of each IP family ([`probe_local_address`])
//! - **STUN client**: the NAT-mapped public endpoint ([`nat::StunClient`])
//! - **Address resolver**: periodic refresh of both, published as a shared
//!   [`flowd_core::ResolvedIdentity`] ([`AddressResolver`])
//!
//! # Example
//!
//! ```rust,no_run
//! use flowd_discovery::{AddressResolver, ResolverConfig};
//!
//! # async fn example() {
//! let resolver = AddressResolver::new(ResolverConfig::default());
//! let identity = resolver.refresh().await;
//! println!("v4 local: {:?}, public: {:?}", identity.v4.local, identity.v4.public);
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod local;
pub mod nat;
pub mod resolver;

pub use error::ResolverError;
pub use local::{DEFAULT_HOP_LIMIT, DEFAULT_V4_TARGET, DEFAULT_V6_TARGET, probe_local_address};
pub use resolver::{
    AddressResolver, DEFAULT_STUN_SERVERS, IdentityHandle, ResolverConfig, validate_host_port,
};
