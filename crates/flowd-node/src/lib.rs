//! # flowd Node
//!
//! The running daemon: a [`Node`] owns the address resolver task and the
//! [`Pipeline`] task that polls connections, tracks lifecycles and dispatches
//! events every interval.
//!
//! ```no_run
//! use flowd_node::{Node, NodeConfig};
//!
//! # async fn example() -> Result<(), flowd_node::NodeError> {
//! let node = Node::new(NodeConfig::default())?;
//! let stats = node
//!     .run_until(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await?;
//! println!("{} flows started", stats.started);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod health;
pub mod node;
pub mod pipeline;

pub use config::{NodeConfig, PathsConfig, PollConfig};
pub use error::{NodeError, Result};
pub use health::{HealthConfig, HealthMetrics, HealthMonitor, HealthStatus};
pub use node::Node;
pub use pipeline::{CycleOutcome, CycleReport, Pipeline};
