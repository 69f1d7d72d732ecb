//! # Fleet Station
//!
//! The per-station protocol engine of the fleet simulator. Each
//! [`StationEngine`] owns one WebSocket connection to the CSMS and the full
//! protocol state behind it:
//! - connection lifecycle with reconnect policy and message buffering
//! - request/response correlation with per-request timeouts
//! - boot/heartbeat/status/meter-values sequencing
//! - per-connector (or per-EVSE) state machines and transactions
//! - the OCPP configuration-key store
//! - the automatic transaction generator

pub mod atg;
pub mod config_keys;
pub mod connection;
pub mod connectors;
pub mod error;
pub mod id_tags;
pub mod meter;
pub mod ocpp;
pub mod persist;
pub mod request_cache;
pub mod station;
pub mod template;

pub use error::{StationError, StationResult};
pub use station::{StationEngine, StationEvent, StationSnapshot};

use std::time::Duration;

/// Deadline applied to every outgoing OCPP request
pub const OCPP_WS_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Default heartbeat interval when the CSMS does not provide one, in seconds
pub const DEFAULT_HEARTBEAT_INTERVAL: u64 = 60;

/// Default boot-retry pause when the CSMS response carries no interval
pub const DEFAULT_BOOT_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// Default authorization timeout key value, in seconds
pub const DEFAULT_CONNECTION_TIMEOUT: u64 = 30;

/// Bound on the station message buffer
pub const MESSAGE_BUFFER_CAPACITY: usize = 1000;
