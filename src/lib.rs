//! # cloudctl — multi-tenant instance orchestration engine
//!
//! Facade crate that re-exports the `cloud-*` workspace libraries so
//! consumers can depend on a single `cloudctl` library.
//!
//! ## Crate breakdown
//!
//! | Module | Crate | Purpose |
//! |--------|-------|---------|
//! | [`core`] | cloud-core | Data model, config, metadata codec, image catalogue, activity tracker |
//! | [`transport`] | cloud-transport | Hypervisor REST client + scoped node shell |
//! | [`engine`] | cloud-engine | Node selector, resource allocator, image materializer, lifecycle manager, domain validator |
//! | [`routing`] | cloud-routing | Reverse-proxy routing config builder |

pub mod observability;

pub use cloud_core as core;
pub use cloud_engine as engine;
pub use cloud_routing as routing;
pub use cloud_transport as transport;
