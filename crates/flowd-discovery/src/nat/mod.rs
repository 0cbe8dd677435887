//! NAT traversal
//!
//! Server reflexive address discovery over STUN (RFC 5389). Only the Binding
//! transaction is implemented; the resolver uses it to learn the public
//! endpoint a NAT maps the host's outbound UDP traffic to.

pub mod stun;

pub use stun::{
    StunAttribute, StunClient, StunError, StunMessage, StunMessageClass, StunMessageType,
};
