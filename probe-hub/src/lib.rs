//! # probe-hub
//!
//! A shared-hardware dispatcher: one network-accessible service mediating
//! many developers' access to a fixed pool of USB debug probes attached to a
//! single host. Clients ask for one of three kinds of work against a named
//! MCU target and a probe (a one-shot firmware flash, a long-lived GDB debug
//! session, or a UART print bridge) and the hub routes the request to the
//! right toolchain container, serializes access per probe, launches the
//! vendor tool and tears the session down on disconnect or timeout.
//!
//! The crate is built around a handful of pieces:
//!
//! * [`config::HubConfig`]: the declarative catalog of containers, probes,
//!   targets and command templates, validated once at load.
//! * [`inventory::Inventory`]: the live USB bus view joined against the
//!   catalog.
//! * [`lock`]: one advisory exclusive file lock per probe.
//! * [`container::ContainerManager`]: lazy per-probe toolchain containers
//!   and command execution inside them.
//! * [`dispatch::Hub`]: the decision core tying the above together.
//! * [`session::Supervisor`]: the state machine watching a live session's
//!   server process and its clients.
//! * [`server`]: the axum HTTP API.

pub mod config;
pub mod container;
pub mod dispatch;
pub mod inventory;
pub mod lock;
pub mod ports;
pub mod server;
pub mod session;
pub mod staging;

pub use crate::config::HubConfig;
pub use crate::dispatch::{DispatchError, DispatchOutcome, DispatchRequest, Hub};
pub use crate::inventory::Inventory;
pub use crate::session::{SessionState, StopKind, StopReason};
