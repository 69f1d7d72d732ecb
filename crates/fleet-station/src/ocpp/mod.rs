//! OCPP services
//!
//! Per-version request builders and incoming-request dispatch. The engine
//! holds the version discriminator; this module routes to the 1.6 or 2.0
//! implementation behind a shared surface of `send_*` helpers used by the
//! boot sequence, timers and transaction paths.

pub mod v16;
pub mod v20;

use crate::station::{BootResponse, SendOptions, StationEngine};
use fleet_types::common::FirmwareStatus;
use fleet_types::v16::{ChargePointErrorCode, ChargePointStatus};
use fleet_types::{Call, Frame, OcppResult, OcppVersion};
use tracing::debug;

/// Dispatch one incoming CALL to the station's dialect handler
pub async fn dispatch(engine: &StationEngine, call: Call) -> Frame {
    let version = engine.template().ocpp_version;
    debug!(action = %call.action, %version, "Dispatching incoming request");
    match version {
        OcppVersion::V16 => v16::handle_incoming(engine, call).await,
        OcppVersion::V201 => v20::handle_incoming(engine, call).await,
    }
}

/// Send BootNotification in the station's dialect
pub async fn send_boot_notification(engine: &StationEngine) -> OcppResult<BootResponse> {
    match engine.template().ocpp_version {
        OcppVersion::V16 => v16::send_boot_notification(engine).await,
        OcppVersion::V201 => v20::send_boot_notification(engine).await,
    }
}

/// Send Heartbeat in the station's dialect
pub async fn send_heartbeat(engine: &StationEngine) -> OcppResult<()> {
    match engine.template().ocpp_version {
        OcppVersion::V16 => {
            engine
                .send_request(
                    fleet_messages::v16::HeartbeatRequest {},
                    SendOptions::default(),
                )
                .await?;
        }
        OcppVersion::V201 => {
            engine
                .send_request(
                    fleet_messages::v20::HeartbeatRequest {},
                    SendOptions::default(),
                )
                .await?;
        }
    }
    Ok(())
}

/// Send StatusNotification in the station's dialect. The internal state
/// machine always runs on the 1.6 state set; the 2.0 path collapses it onto
/// the reduced status enum on the wire.
pub async fn send_status_notification(
    engine: &StationEngine,
    connector_id: u32,
    status: ChargePointStatus,
) -> OcppResult<()> {
    match engine.template().ocpp_version {
        OcppVersion::V16 => {
            engine
                .send_request(
                    fleet_messages::v16::StatusNotificationRequest {
                        connector_id,
                        error_code: ChargePointErrorCode::NoError,
                        info: None,
                        status,
                        timestamp: Some(chrono::Utc::now()),
                        vendor_error_code: None,
                        vendor_id: None,
                    },
                    SendOptions::default(),
                )
                .await?;
        }
        OcppVersion::V201 => {
            let evse_id = engine
                .inner()
                .topology
                .read()
                .await
                .evse_of(connector_id)
                .unwrap_or(connector_id);
            engine
                .send_request(
                    fleet_messages::v20::StatusNotificationRequest {
                        timestamp: chrono::Utc::now(),
                        connector_status: status.into(),
                        evse_id,
                        connector_id,
                    },
                    SendOptions::default(),
                )
                .await?;
        }
    }
    Ok(())
}

/// Send FirmwareStatusNotification (1.6 only; the 2.0 subset does not carry
/// firmware management)
pub async fn send_firmware_status_notification(
    engine: &StationEngine,
    status: FirmwareStatus,
) -> OcppResult<()> {
    match engine.template().ocpp_version {
        OcppVersion::V16 => {
            engine
                .send_request(
                    fleet_messages::v16::FirmwareStatusNotificationRequest { status },
                    SendOptions::default(),
                )
                .await?;
        }
        OcppVersion::V201 => {
            debug!("FirmwareStatusNotification skipped for the 2.0 dialect");
        }
    }
    Ok(())
}
