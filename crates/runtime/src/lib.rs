mod client;
mod commands;
pub mod maintenance;
pub mod processor;
mod server;
pub mod stats;
pub mod supervisor;

pub use client::DaemonClient;
pub use commands::{ClientCommand, DaemonStatus, Health, ServerEvent};
pub use processor::{Decision, Disposition, EventProcessor, ProcessorSettings, Reply};
pub use server::{open_ledger, run_daemon};
pub use supervisor::{
    ConnectionState, HealthSnapshot, Supervisor, SupervisorHandle, SupervisorSettings, backoff_delay,
};
