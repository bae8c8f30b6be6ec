//! Instance lifecycle manager, schedulers, and allocators: the layer above
//! the raw hypervisor transport (`cloud-transport`) and data model
//! (`cloud-core`) that actually provisions, starts, stops, and tears down
//! instances.

pub mod allocator;
pub mod credentials;
pub mod domain;
pub mod engine;
pub mod lifecycle;
pub mod materializer;
pub mod read;
pub mod selector;
pub mod wait;

pub use engine::{Engine, NodeShellFactory, SshNodeShellFactory};
