// nodeward-core: Pure types, config, clock, retry utilities
// No internal nodeward dependencies; this is the foundation crate.

pub mod automation;
pub mod clock;
pub mod config;
pub mod failover;
pub mod join;
pub mod naming;
pub mod poll;
pub mod retry;
pub mod role;
pub mod shell;
