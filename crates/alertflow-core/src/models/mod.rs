//! Data models for AlertFlow

mod alert;
mod metrics;
mod request;

pub use alert::*;
pub use metrics::*;
pub use request::*;
