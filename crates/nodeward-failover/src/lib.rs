// nodeward-failover: Floating-IP failover controller
// Depends on nodeward-core (binding and instance types) and nodeward-store (owner record)

pub mod controller;
pub mod ec2;
pub mod event;
pub mod provider;
pub mod server;

pub use controller::{FailoverController, FailoverError, FailoverOutcome};
pub use event::TerminationEvent;
pub use provider::{ComputeProvider, MemoryComputeProvider};
