//! # Fleet Control
//!
//! The control plane of the fleet simulator: a typed in-process bus between
//! the UI server and the worker hosts, with request fan-out and response
//! aggregation by correlation id, and the UI server itself (WebSocket
//! sub-protocol `ui0.0.1` or HTTP POST `/ui/{version}/{procedure}`).

pub mod bus;
pub mod error;
pub mod procedures;
pub mod ui_server;

pub use bus::{AggregatedResponse, BusRequest, BusResponse, ControlBus, ProcedureFailure};
pub use error::{ControlError, ControlResult};
pub use procedures::{ProcedureName, RequestPayload, ResponseStatus};
pub use ui_server::{SimulatorControl, UiServer, UiServerConfig};

use std::time::Duration;

/// Server-side deadline for fan-out aggregation
pub const FANOUT_TIMEOUT: Duration = Duration::from_secs(120);

/// WebSocket sub-protocol of the UI transport
pub const UI_SUB_PROTOCOL: &str = "ui0.0.1";
