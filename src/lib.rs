//! vmkeeper Library
//!
//! Single-host VM manager: lifecycle controller over a pluggable hypervisor,
//! and a cached, resumable client for multi-part VM images stored in an
//! OCI-style registry.

pub mod cancel;
pub mod config;
pub mod metrics;
pub mod registry;
pub mod server;
pub mod units;
pub mod vm;
