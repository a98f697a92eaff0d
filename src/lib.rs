//! # nodeward: cluster node bootstrap and floating-IP failover
//!
//! Facade crate that re-exports the nodeward workspace crates so consumers
//! can depend on a single `nodeward` library.
//!
//! ## Crate breakdown
//!
//! | Module | Crate | Purpose |
//! |--------|-------|---------|
//! | [`core`] | nodeward-core | Domain types, config, clock and deadline, retry/poll, command runner |
//! | [`store`] | nodeward-store | Coordination store trait, memory/etcd/SSM backends, envelope encryption |
//! | [`agent`] | nodeward-agent | Gate, join publisher/consumer, automation executor, boot signal, boot sequence |
//! | [`failover`] | nodeward-failover | Floating-IP failover controller, compute providers, event listener |
//! | [`cli`] | nodeward-cli | Command tree, logging, terminal UI |

pub use nodeward_agent as agent;
pub use nodeward_cli as cli;
pub use nodeward_core as core;
pub use nodeward_failover as failover;
pub use nodeward_store as store;
