//! In-process caches

mod ttl;

pub use ttl::TtlCache;
