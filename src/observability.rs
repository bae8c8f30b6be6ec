//! Ambient logging bootstrap for the `cloudctl` binary. Metrics collection
//! is handled by an external collector scraping the hypervisor cluster
//! directly, not by this crate.

pub mod logging;
