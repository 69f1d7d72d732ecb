//! OCPP 2.0 service
//!
//! The 2.0 dialect covers BootNotification, Heartbeat and StatusNotification
//! on the outgoing side. Incoming requests are acknowledged with
//! NotImplemented until the remaining action set lands.

use crate::station::{BootResponse, SendOptions, StationEngine};
use fleet_messages::v20::*;
use fleet_types::v20::BootReason;
use fleet_types::{Call, CallErrorCode, Frame, OcppResult};
use tracing::debug;

/// Send a 2.0 BootNotification built from the station info block
pub(crate) async fn send_boot_notification(engine: &StationEngine) -> OcppResult<BootResponse> {
    let info = engine.info().await;
    let request = BootNotificationRequest {
        charging_station: ChargingStationType {
            model: info.charge_point_model,
            vendor_name: info.charge_point_vendor,
            firmware_version: info.firmware_version,
            serial_number: info.charge_point_serial_number,
        },
        reason: BootReason::PowerUp,
    };
    let response = engine
        .send_request(
            request,
            SendOptions {
                bypass_gate: true,
                skip_buffering: true,
            },
        )
        .await?;
    Ok(BootResponse {
        current_time: response.current_time,
        interval: response.interval,
        status: response.status,
    })
}

/// Answer incoming 2.0 requests
pub(crate) async fn handle_incoming(engine: &StationEngine, call: Call) -> Frame {
    let _ = engine;
    debug!(action = %call.action, "Incoming 2.0 request not implemented");
    Frame::call_error(
        call.unique_id,
        CallErrorCode::NotImplemented,
        format!("Action {} is not implemented for OCPP 2.0", call.action),
        None,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::station::{StationBuild, StationEngine};
    use crate::template::StationTemplate;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use url::Url;

    #[tokio::test]
    async fn test_incoming_answers_not_implemented() {
        let dir = tempfile::tempdir().unwrap();
        let template_json = json!({
            "chargePointModel": "Virtual",
            "chargePointVendor": "FleetSim",
            "power": 50000.0,
            "powerUnit": "W",
            "ocppVersion": "2.0.1",
            "evses": {"1": {"connectors": {"1": {}}}}
        });
        let bytes = serde_json::to_vec(&template_json).unwrap();
        let template_file = dir.path().join("template.json");
        std::fs::write(&template_file, &bytes).unwrap();
        let template = StationTemplate::from_bytes(&template_file, &bytes).unwrap();
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let engine = StationEngine::new(
            StationBuild {
                template_file,
                template,
                template_hash: crate::template::content_hash(&bytes),
                index: 1,
                supervision_url: Url::parse("ws://localhost:8180/ocpp").unwrap(),
                config_dir: dir.path().join("configs"),
            },
            Arc::new(crate::id_tags::IdTagsCache::new()),
            event_tx,
        );
        engine.initialize().await.unwrap();

        let frame = handle_incoming(
            &engine,
            Call {
                unique_id: "msg-1".to_string(),
                action: "Reset".to_string(),
                payload: json!({}),
            },
        )
        .await;
        match frame {
            Frame::CallError(error) => {
                assert_eq!(error.error_code, CallErrorCode::NotImplemented);
            }
            other => panic!("Expected CallError, got {:?}", other),
        }
    }
}
