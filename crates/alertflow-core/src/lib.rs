//! # AlertFlow
//!
//! Alert batching and webhook delivery for LLM gateways.
//!
//! AlertFlow collects alert events from a request-serving pipeline, squashes
//! duplicates and delivers them to chat webhooks on a bounded schedule. It
//! also watches in-flight requests for ones that hang past a threshold.
//!
//! ## Architecture
//!
//! - **Queue**: buffered alerts flushed by size or on a timer, one flush at a time
//! - **Dispatcher**: one signed webhook post per squashed group
//! - **Monitors**: hanging requests, deployment outages, daily and spend reports
//! - **Stores**: usage counters and request status, in memory or in Redis
//!
//! ## Quick Start
//!
//! ```bash
//! # Run the alerting loops
//! alertflow --config alertflow.toml serve
//!
//! # Send a test alert
//! alertflow send --type budget_alerts --severity high "Budget crossed"
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod alerting;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use self::config::Config;
pub use error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::alerting::{AlertEvent, AlertObserver, AlertingEngine, AlertingUpdate, EngineBuilder};
    pub use crate::config::{Config, ResolvedConfig};
    pub use crate::error::{Error, Result};
    pub use crate::models::*;
}
