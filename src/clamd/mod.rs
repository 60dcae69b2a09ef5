//! clamd protocol client, multiplexed sessions and the worker-pool
//! coordinator that brokers commands onto them.

pub mod client;
pub mod conn;
pub mod coordinator;
pub mod parser;
pub mod session;
pub mod types;

pub use client::Clamd;
pub use conn::Connection;
pub use coordinator::{ClamdBroker, Coordinator, CoordinatorOpts, Outcome, Reply};
pub use session::Session;
pub use types::{ClamdAddress, ConnectOpts, RetryPolicy, ScanResult, ScanStatus, SessionOpts};
