// nodeward-cli: Clap commands, logging, UI
// Depends on nodeward-core, nodeward-store, nodeward-agent, nodeward-failover

pub mod commands;
pub mod logging;
pub mod ui;

pub use commands::{command, run};
