//! # warden-core
//!
//! Core library for Warden, a self-healing watchdog for an embedded
//! home-automation gateway. The daemon binary wires these pieces into
//! supervised worker processes; everything with decision logic lives here.
//!
//! ## Design principles
//!
//! - **Synchronous**: tight poll loops with bounded sleeps, no async runtime.
//! - **One process, one owner**: monitor state is never shared across
//!   processes; cross-process visibility happens only through the key/value
//!   store mirror.
//! - **Explicit escalation**: remediation is tiered and bounded (tolerate,
//!   restart the dependent service, reboot the host) and every step is
//!   counted and persisted.

pub mod broker;
pub mod command;
pub mod config;
pub mod connector;
pub mod error;
pub mod heartbeat;
pub mod metrics;
pub mod reporter;
pub mod shutdown;
pub mod store;

pub use broker::{pump, BrokerSession, ConnectionStatus, SessionEvent, SessionObserver};
pub use command::exec_command;
pub use config::{BrokerConfig, Config, HeartbeatConfig, Paths};
pub use connector::Connector;
pub use error::{Result, WardenError};
pub use heartbeat::Heartbeater;
pub use reporter::Reporter;
pub use shutdown::ShutdownToken;
pub use store::Store;
