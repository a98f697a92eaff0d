// nodeward-agent: Node-local boot components
// Depends on nodeward-core (types, clock, config) and nodeward-store (coordination store)

pub mod automation;
pub mod boot;
pub mod consumer;
pub mod control_plane;
pub mod error;
pub mod gate;
pub mod install;
pub mod join;
pub mod kubeconfig;
pub mod metadata;
pub mod publisher;
pub mod signal;
pub mod ssm_runner;
pub mod steps;
pub mod validate;

pub use error::BootError;
