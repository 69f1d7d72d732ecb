//! OCPP 1.6 service
//!
//! Request builders for the station-initiated actions and handlers for the
//! full CSMS-initiated set. Handlers act on the engine's state and answer
//! with a CALLRESULT, or a CALLERROR when the payload or state refuses the
//! request.

use crate::config_keys::{keys, SetKeyOutcome};
use crate::station::{BootResponse, SendOptions, StationEngine};
use fleet_messages::v16::*;
use fleet_messages::OcppAction;
use fleet_types::common::{
    AvailabilityStatus, AvailabilityType, DiagnosticsStatus, FirmwareStatus, Reservation,
    ReservationStatus, ReservationTerminationReason, StopReason,
};
use fleet_types::v16::*;
use fleet_types::{Call, CallErrorCode, ConnectorId, Frame, OcppResult};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Pace of the simulated firmware download/install phases
const FIRMWARE_PHASE_DELAY: Duration = Duration::from_secs(5);

/// Send BootNotification built from the station info block
pub(crate) async fn send_boot_notification(engine: &StationEngine) -> OcppResult<BootResponse> {
    let info = engine.info().await;
    let request = BootNotificationRequest {
        charge_point_vendor: info.charge_point_vendor,
        charge_point_model: info.charge_point_model,
        charge_point_serial_number: info.charge_point_serial_number,
        charge_box_serial_number: None,
        firmware_version: info.firmware_version,
        iccid: None,
        imsi: None,
        meter_type: None,
        meter_serial_number: None,
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

/// Route one incoming CALL to its action handler
pub(crate) async fn handle_incoming(engine: &StationEngine, call: Call) -> Frame {
    match call.action.as_str() {
        ResetRequest::ACTION_NAME => handle_reset(engine, &call).await,
        ClearCacheRequest::ACTION_NAME => handle_clear_cache(engine, &call).await,
        ChangeAvailabilityRequest::ACTION_NAME => handle_change_availability(engine, &call).await,
        UnlockConnectorRequest::ACTION_NAME => handle_unlock_connector(engine, &call).await,
        GetConfigurationRequest::ACTION_NAME => handle_get_configuration(engine, &call).await,
        ChangeConfigurationRequest::ACTION_NAME => {
            handle_change_configuration(engine, &call).await
        }
        GetCompositeScheduleRequest::ACTION_NAME => {
            handle_get_composite_schedule(engine, &call).await
        }
        SetChargingProfileRequest::ACTION_NAME => handle_set_charging_profile(engine, &call).await,
        ClearChargingProfileRequest::ACTION_NAME => {
            handle_clear_charging_profile(engine, &call).await
        }
        RemoteStartTransactionRequest::ACTION_NAME => handle_remote_start(engine, &call).await,
        RemoteStopTransactionRequest::ACTION_NAME => handle_remote_stop(engine, &call).await,
        GetDiagnosticsRequest::ACTION_NAME => handle_get_diagnostics(engine, &call).await,
        TriggerMessageRequest::ACTION_NAME => handle_trigger_message(engine, &call).await,
        DataTransferRequest::ACTION_NAME => handle_data_transfer(engine, &call).await,
        UpdateFirmwareRequest::ACTION_NAME => handle_update_firmware(engine, &call).await,
        ReserveNowRequest::ACTION_NAME => handle_reserve_now(engine, &call).await,
        CancelReservationRequest::ACTION_NAME => handle_cancel_reservation(engine, &call).await,
        action => Frame::call_error(
            call.unique_id,
            CallErrorCode::NotImplemented,
            format!("Action {} is not implemented", action),
            None,
        ),
    }
}

fn result<T: Serialize>(call: &Call, payload: T) -> Frame {
    Frame::call_result(call.unique_id.clone(), payload).unwrap_or_else(|e| {
        Frame::call_error(
            call.unique_id.clone(),
            CallErrorCode::InternalError,
            e.to_string(),
            None,
        )
    })
}

fn formation_error(call: &Call, error: impl std::fmt::Display) -> Frame {
    Frame::call_error(
        call.unique_id.clone(),
        CallErrorCode::FormationViolation,
        error.to_string(),
        None,
    )
}

macro_rules! parse_payload {
    ($call:expr, $ty:ty) => {
        match $call.payload_as::<$ty>() {
            Ok(request) => request,
            Err(e) => return formation_error($call, e),
        }
    };
}

async fn handle_reset(engine: &StationEngine, call: &Call) -> Frame {
    let request = parse_payload!(call, ResetRequest);
    let reason = match request.reset_type {
        ResetType::Hard => StopReason::HardReset,
        ResetType::Soft => StopReason::SoftReset,
    };
    let worker = engine.clone();
    tokio::spawn(async move {
        if let Err(e) = worker.reset(Some(reason)).await {
            error!(error = %e, "Reset failed");
        }
    });
    result(call, ResetResponse {
        status: CommandStatus::Accepted,
    })
}

async fn handle_clear_cache(_engine: &StationEngine, call: &Call) -> Frame {
    let _request = parse_payload!(call, ClearCacheRequest);
    result(call, ClearCacheResponse {
        status: CommandStatus::Accepted,
    })
}

async fn handle_change_availability(engine: &StationEngine, call: &Call) -> Frame {
    let request = parse_payload!(call, ChangeAvailabilityRequest);
    let availability = request.availability_type;

    let affected: Vec<u32> = if request.connector_id == 0 {
        engine.set_station_availability(availability).await;
        engine.inner().topology.read().await.connector_ids()
    } else {
        if engine
            .inner()
            .topology
            .read()
            .await
            .connector(request.connector_id)
            .is_none()
        {
            return result(call, ChangeAvailabilityResponse {
                status: AvailabilityStatus::Rejected,
            });
        }
        vec![request.connector_id]
    };

    let mut scheduled = false;
    for connector_id in affected {
        let transacting = engine
            .inner()
            .topology
            .read()
            .await
            .connector(connector_id)
            .map(|c| c.transaction_started)
            .unwrap_or(false);
        let _ = engine
            .set_connector_availability(connector_id, availability)
            .await;
        if transacting {
            // Takes effect when the running transaction ends
            scheduled = true;
            continue;
        }
        let target = match availability {
            AvailabilityType::Inoperative => ChargePointStatus::Unavailable,
            AvailabilityType::Operative => ChargePointStatus::Available,
        };
        if let Err(e) = engine.send_status_notification(connector_id, target).await {
            warn!(connector_id, error = %e, "Availability status notification failed");
        }
    }
    result(call, ChangeAvailabilityResponse {
        status: if scheduled {
            AvailabilityStatus::Scheduled
        } else {
            AvailabilityStatus::Accepted
        },
    })
}

async fn handle_unlock_connector(engine: &StationEngine, call: &Call) -> Frame {
    let request = parse_payload!(call, UnlockConnectorRequest);
    let transaction_id = engine
        .inner()
        .topology
        .read()
        .await
        .connector(request.connector_id)
        .map(|c| c.transaction_id);
    match transaction_id {
        None => result(call, UnlockConnectorResponse {
            status: UnlockStatus::UnlockFailed,
        }),
        Some(Some(transaction_id)) => {
            let worker = engine.clone();
            tokio::spawn(async move {
                if let Err(e) = worker
                    .stop_transaction(Some(transaction_id), StopReason::UnlockCommand, None)
                    .await
                {
                    error!(transaction_id, error = %e, "Unlock-triggered stop failed");
                }
            });
            result(call, UnlockConnectorResponse {
                status: UnlockStatus::Unlocked,
            })
        }
        Some(None) => result(call, UnlockConnectorResponse {
            status: UnlockStatus::Unlocked,
        }),
    }
}

async fn handle_get_configuration(engine: &StationEngine, call: &Call) -> Frame {
    let request = parse_payload!(call, GetConfigurationRequest);
    let store = engine.inner().config_keys.read().await;
    let (configuration_key, unknown_key) = store.wire_entries(request.key.as_deref());
    result(call, GetConfigurationResponse {
        configuration_key: Some(configuration_key),
        unknown_key: if unknown_key.is_empty() {
            None
        } else {
            Some(unknown_key)
        },
    })
}

async fn handle_change_configuration(engine: &StationEngine, call: &Call) -> Frame {
    let request = parse_payload!(call, ChangeConfigurationRequest);
    let outcome = engine
        .inner()
        .config_keys
        .write()
        .await
        .set_value(&request.key, &request.value);
    let status = match outcome {
        SetKeyOutcome::Changed => ConfigurationStatus::Accepted,
        SetKeyOutcome::ReadOnly => ConfigurationStatus::Rejected,
        SetKeyOutcome::RebootRequired => ConfigurationStatus::RebootRequired,
        SetKeyOutcome::Unknown => ConfigurationStatus::NotSupported,
    };
    if outcome == SetKeyOutcome::Changed {
        if request.key == keys::HEARTBEAT_INTERVAL || request.key == keys::HEARTBEAT_INTERVAL_LEGACY
        {
            engine.restart_heartbeat().await;
        }
        if let Err(e) = engine.persist_configuration().await {
            warn!(error = %e, "Failed to persist configuration change");
        }
    }
    result(call, ChangeConfigurationResponse { status })
}

async fn handle_get_composite_schedule(engine: &StationEngine, call: &Call) -> Frame {
    let request = parse_payload!(call, GetCompositeScheduleRequest);
    let schedule = engine
        .inner()
        .topology
        .read()
        .await
        .connector(request.connector_id)
        .and_then(|connector| {
            connector
                .charging_profiles
                .iter()
                .max_by_key(|profile| profile.stack_level)
                .map(|profile| profile.charging_schedule.clone())
        });
    match schedule {
        Some(charging_schedule) => result(call, GetCompositeScheduleResponse {
            status: GetCompositeScheduleStatus::Accepted,
            connector_id: Some(request.connector_id),
            schedule_start: Some(chrono::Utc::now()),
            charging_schedule: Some(charging_schedule),
        }),
        None => result(call, GetCompositeScheduleResponse {
            status: GetCompositeScheduleStatus::Rejected,
            connector_id: None,
            schedule_start: None,
            charging_schedule: None,
        }),
    }
}

async fn handle_set_charging_profile(engine: &StationEngine, call: &Call) -> Frame {
    let request = parse_payload!(call, SetChargingProfileRequest);
    let profile = request.cs_charging_profiles;
    let mut topology = engine.inner().topology.write().await;
    let Some(connector) = topology.connector_mut(request.connector_id) else {
        return result(call, SetChargingProfileResponse {
            status: ChargingProfileStatus::Rejected,
        });
    };
    if profile.charging_profile_purpose == ChargingProfilePurpose::TxProfile
        && profile.transaction_id != connector.transaction_id
    {
        return result(call, SetChargingProfileResponse {
            status: ChargingProfileStatus::Rejected,
        });
    }
    connector.charging_profiles.retain(|existing| {
        existing.charging_profile_id != profile.charging_profile_id
            && !(existing.stack_level == profile.stack_level
                && existing.charging_profile_purpose == profile.charging_profile_purpose)
    });
    connector.charging_profiles.push(profile);
    result(call, SetChargingProfileResponse {
        status: ChargingProfileStatus::Accepted,
    })
}

async fn handle_clear_charging_profile(engine: &StationEngine, call: &Call) -> Frame {
    let request = parse_payload!(call, ClearChargingProfileRequest);
    let mut cleared = false;
    let mut topology = engine.inner().topology.write().await;
    let connector_ids: Vec<u32> = match request.connector_id {
        Some(connector_id) => vec![connector_id],
        None => topology.connector_ids(),
    };
    for connector_id in connector_ids {
        if let Some(connector) = topology.connector_mut(connector_id) {
            let before = connector.charging_profiles.len();
            connector.charging_profiles.retain(|profile| {
                if let Some(id) = request.id {
                    return profile.charging_profile_id != id;
                }
                let purpose_matches = request
                    .charging_profile_purpose
                    .map(|purpose| profile.charging_profile_purpose == purpose)
                    .unwrap_or(true);
                let stack_matches = request
                    .stack_level
                    .map(|level| profile.stack_level == level)
                    .unwrap_or(true);
                !(purpose_matches && stack_matches)
            });
            cleared |= connector.charging_profiles.len() != before;
        }
    }
    result(call, ClearChargingProfileResponse {
        status: if cleared {
            ClearChargingProfileStatus::Accepted
        } else {
            ClearChargingProfileStatus::Unknown
        },
    })
}

async fn handle_remote_start(engine: &StationEngine, call: &Call) -> Frame {
    let request = parse_payload!(call, RemoteStartTransactionRequest);
    let connector_id = match request.connector_id {
        Some(connector_id) => Some(connector_id),
        None => {
            // First connector able to take a transaction
            let topology = engine.inner().topology.read().await;
            topology.connector_ids().into_iter().find(|id| {
                topology
                    .connector(*id)
                    .map(|c| {
                        !c.transaction_started
                            && c.is_operative()
                            && c.status
                                .unwrap_or(ChargePointStatus::Available)
                                .accepts_transaction()
                    })
                    .unwrap_or(false)
            })
        }
    };
    let Some(connector_id) = connector_id else {
        return result(call, RemoteStartTransactionResponse {
            status: CommandStatus::Rejected,
        });
    };
    let startable = engine
        .inner()
        .topology
        .read()
        .await
        .connector(connector_id)
        .map(|c| {
            !c.transaction_started
                && c.is_operative()
                && c.status
                    .unwrap_or(ChargePointStatus::Available)
                    .accepts_transaction()
        })
        .unwrap_or(false);
    if !startable {
        return result(call, RemoteStartTransactionResponse {
            status: CommandStatus::Rejected,
        });
    }
    if let Some(profile) = request.charging_profile {
        if let Some(connector) = engine
            .inner()
            .topology
            .write()
            .await
            .connector_mut(connector_id)
        {
            connector.charging_profiles.push(profile);
        }
    }
    let id_tag = request.id_tag;
    let worker = engine.clone();
    tokio::spawn(async move {
        match worker.start_transaction(connector_id, Some(id_tag)).await {
            Ok(Some(transaction_id)) => {
                debug!(connector_id, transaction_id, "Remote start accepted")
            }
            Ok(None) => warn!(connector_id, "Remote start rejected by CSMS"),
            Err(e) => error!(connector_id, error = %e, "Remote start failed"),
        }
    });
    result(call, RemoteStartTransactionResponse {
        status: CommandStatus::Accepted,
    })
}

async fn handle_remote_stop(engine: &StationEngine, call: &Call) -> Frame {
    let request = parse_payload!(call, RemoteStopTransactionRequest);
    let known = {
        let topology = engine.inner().topology.read().await;
        topology.connector_ids().into_iter().any(|id| {
            topology
                .connector(id)
                .map(|c| c.transaction_id == Some(request.transaction_id))
                .unwrap_or(false)
        })
    };
    if !known {
        return result(call, RemoteStopTransactionResponse {
            status: CommandStatus::Rejected,
        });
    }
    let worker = engine.clone();
    let transaction_id = request.transaction_id;
    tokio::spawn(async move {
        if let Err(e) = worker
            .stop_transaction(Some(transaction_id), StopReason::Remote, None)
            .await
        {
            error!(transaction_id, error = %e, "Remote stop failed");
        }
    });
    result(call, RemoteStopTransactionResponse {
        status: CommandStatus::Accepted,
    })
}

async fn handle_get_diagnostics(engine: &StationEngine, call: &Call) -> Frame {
    let _request = parse_payload!(call, GetDiagnosticsRequest);
    let station_id = engine.info().await.charging_station_id;
    let file_name = format!("{}-diagnostics.log", station_id);
    let worker = engine.clone();
    tokio::spawn(async move {
        for status in [DiagnosticsStatus::Uploading, DiagnosticsStatus::Uploaded] {
            if let Err(e) = worker
                .send_request(
                    DiagnosticsStatusNotificationRequest { status },
                    SendOptions::default(),
                )
                .await
            {
                warn!(error = %e, "DiagnosticsStatusNotification failed");
                return;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    });
    result(call, GetDiagnosticsResponse {
        file_name: Some(file_name),
    })
}

async fn handle_trigger_message(engine: &StationEngine, call: &Call) -> Frame {
    let request = parse_payload!(call, TriggerMessageRequest);
    let worker = engine.clone();
    let connector_id = request.connector_id;
    let status = match request.requested_message {
        MessageTrigger::BootNotification => {
            tokio::spawn(async move {
                if let Err(e) = send_boot_notification(&worker).await {
                    warn!(error = %e, "Triggered BootNotification failed");
                }
            });
            TriggerMessageStatus::Accepted
        }
        MessageTrigger::Heartbeat => {
            tokio::spawn(async move {
                if let Err(e) = worker
                    .send_request(
                        HeartbeatRequest {},
                        SendOptions {
                            bypass_gate: true,
                            skip_buffering: false,
                        },
                    )
                    .await
                {
                    warn!(error = %e, "Triggered Heartbeat failed");
                }
            });
            TriggerMessageStatus::Accepted
        }
        MessageTrigger::StatusNotification => {
            tokio::spawn(async move {
                let ids = match connector_id {
                    Some(id) => vec![id],
                    None => worker.inner().topology.read().await.connector_ids(),
                };
                for id in ids {
                    let status = worker
                        .inner()
                        .topology
                        .read()
                        .await
                        .connector(id)
                        .and_then(|c| c.status)
                        .unwrap_or(ChargePointStatus::Available);
                    // Re-notify the current status; same-state is always legal
                    if let Err(e) = worker.send_status_notification(id, status).await {
                        warn!(connector_id = id, error = %e, "Triggered StatusNotification failed");
                    }
                }
            });
            TriggerMessageStatus::Accepted
        }
        MessageTrigger::MeterValues => {
            tokio::spawn(async move {
                let ids = connector_id.map(|id| vec![id]);
                if let Err(e) = worker.send_triggered_meter_values(ids).await {
                    warn!(error = %e, "Triggered MeterValues failed");
                }
            });
            TriggerMessageStatus::Accepted
        }
        MessageTrigger::FirmwareStatusNotification => {
            tokio::spawn(async move {
                let status = worker.firmware_status().await;
                if let Err(e) = super::send_firmware_status_notification(&worker, status).await {
                    warn!(error = %e, "Triggered FirmwareStatusNotification failed");
                }
            });
            TriggerMessageStatus::Accepted
        }
        MessageTrigger::DiagnosticsStatusNotification => {
            tokio::spawn(async move {
                if let Err(e) = worker.send_diagnostics_status(DiagnosticsStatus::Idle).await {
                    warn!(error = %e, "Triggered DiagnosticsStatusNotification failed");
                }
            });
            TriggerMessageStatus::Accepted
        }
    };
    result(call, TriggerMessageResponse { status })
}

async fn handle_data_transfer(engine: &StationEngine, call: &Call) -> Frame {
    let request = parse_payload!(call, DataTransferRequest);
    let vendor = engine.info().await.charge_point_vendor;
    let status = if request.vendor_id == vendor {
        DataTransferStatus::Accepted
    } else {
        DataTransferStatus::UnknownVendorId
    };
    result(call, DataTransferResponse { status, data: None })
}

async fn handle_update_firmware(engine: &StationEngine, call: &Call) -> Frame {
    let request = parse_payload!(call, UpdateFirmwareRequest);
    debug!(location = %request.location, "Starting firmware update simulation");
    let worker = engine.clone();
    tokio::spawn(async move { simulate_firmware_update(worker).await });
    result(call, UpdateFirmwareResponse {})
}

async fn simulate_firmware_update(engine: StationEngine) {
    for status in [FirmwareStatus::Downloading, FirmwareStatus::Downloaded] {
        if let Err(e) = engine.set_firmware_status(status).await {
            warn!(error = %e, "Firmware status notification failed");
        }
        tokio::time::sleep(FIRMWARE_PHASE_DELAY).await;
    }
    if let Err(e) = engine.set_firmware_status(FirmwareStatus::Installing).await {
        warn!(error = %e, "Firmware status notification failed");
    }
    let reset = engine
        .template()
        .firmware_upgrade
        .as_ref()
        .map(|upgrade| upgrade.reset)
        .unwrap_or(false);
    if reset {
        // The post-reset boot sequence reports Installed once accepted
        if let Err(e) = engine.reset(Some(StopReason::Reboot)).await {
            error!(error = %e, "Firmware reset failed");
        }
    } else {
        tokio::time::sleep(FIRMWARE_PHASE_DELAY).await;
        if let Err(e) = engine.set_firmware_status(FirmwareStatus::Installed).await {
            warn!(error = %e, "Firmware status notification failed");
        }
    }
}

async fn handle_reserve_now(engine: &StationEngine, call: &Call) -> Frame {
    let request = parse_payload!(call, ReserveNowRequest);
    if request.connector_id == 0 {
        return result(call, ReserveNowResponse {
            status: ReservationStatus::Rejected,
        });
    }
    let status = {
        let topology = engine.inner().topology.read().await;
        match topology.connector(request.connector_id) {
            None => Some(ReservationStatus::Rejected),
            Some(connector) if !connector.is_operative() => {
                Some(ReservationStatus::Unavailable)
            }
            Some(connector) if connector.status == Some(ChargePointStatus::Faulted) => {
                Some(ReservationStatus::Faulted)
            }
            Some(connector) if connector.transaction_started => {
                Some(ReservationStatus::Occupied)
            }
            Some(_) => None,
        }
    };
    if let Some(status) = status {
        return result(call, ReserveNowResponse { status });
    }
    let reservation = Reservation {
        id: request.reservation_id,
        connector_id: ConnectorId(request.connector_id),
        id_tag: request.id_tag,
        parent_id_tag: request.parent_id_tag,
        expiry_date: request.expiry_date,
    };
    match engine.add_reservation(reservation).await {
        Ok(()) => result(call, ReserveNowResponse {
            status: ReservationStatus::Accepted,
        }),
        Err(e) => {
            warn!(error = %e, "ReserveNow failed");
            result(call, ReserveNowResponse {
                status: ReservationStatus::Rejected,
            })
        }
    }
}

async fn handle_cancel_reservation(engine: &StationEngine, call: &Call) -> Frame {
    let request = parse_payload!(call, CancelReservationRequest);
    let removed = engine
        .remove_reservation(
            request.reservation_id,
            ReservationTerminationReason::ReservationCanceled,
        )
        .await;
    result(call, CancelReservationResponse {
        status: if removed {
            CommandStatus::Accepted
        } else {
            CommandStatus::Rejected
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::station::{StationBuild, StationEngine};
    use crate::template::StationTemplate;
    use fleet_types::common::RegistrationStatus;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use url::Url;

    async fn engine() -> (StationEngine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let template_json = json!({
            "chargePointModel": "Virtual",
            "chargePointVendor": "FleetSim",
            "power": 22000.0,
            "powerUnit": "W",
            "connectors": {"0": {}, "1": {}, "2": {}}
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
        (engine, dir)
    }

    fn call(action: &str, payload: serde_json::Value) -> Call {
        Call {
            unique_id: "msg-1".to_string(),
            action: action.to_string(),
            payload,
        }
    }

    fn result_payload(frame: Frame) -> serde_json::Value {
        match frame {
            Frame::CallResult(result) => result.payload,
            other => panic!("Expected CallResult, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_action_answers_not_implemented() {
        let (engine, _dir) = engine().await;
        let frame = handle_incoming(&engine, call("NoSuchAction", json!({}))).await;
        match frame {
            Frame::CallError(error) => {
                assert_eq!(error.error_code, CallErrorCode::NotImplemented);
            }
            other => panic!("Expected CallError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_payload_answers_formation_violation() {
        let (engine, _dir) = engine().await;
        let frame =
            handle_incoming(&engine, call("Reset", json!({"type": "NotAResetType"}))).await;
        match frame {
            Frame::CallError(error) => {
                assert_eq!(error.error_code, CallErrorCode::FormationViolation);
            }
            other => panic!("Expected CallError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_get_configuration_returns_visible_keys() {
        let (engine, _dir) = engine().await;
        let payload =
            result_payload(handle_incoming(&engine, call("GetConfiguration", json!({}))).await);
        let configuration_key = payload["configurationKey"].as_array().unwrap();
        assert!(configuration_key
            .iter()
            .any(|kv| kv["key"] == "HeartbeatInterval"));
        // The hidden legacy twin never crosses the wire
        assert!(!configuration_key
            .iter()
            .any(|kv| kv["key"] == "HeartBeatInterval"));
    }

    #[tokio::test]
    async fn test_get_configuration_reports_unknown_keys() {
        let (engine, _dir) = engine().await;
        let payload = result_payload(
            handle_incoming(&engine, call("GetConfiguration", json!({"key": ["Bogus"]}))).await,
        );
        assert_eq!(payload["unknownKey"][0], "Bogus");
    }

    #[tokio::test]
    async fn test_change_configuration_outcomes() {
        let (engine, _dir) = engine().await;
        let payload = result_payload(
            handle_incoming(
                &engine,
                call(
                    "ChangeConfiguration",
                    json!({"key": "MeterValueSampleInterval", "value": "30"}),
                ),
            )
            .await,
        );
        assert_eq!(payload["status"], "Accepted");

        let payload = result_payload(
            handle_incoming(
                &engine,
                call(
                    "ChangeConfiguration",
                    json!({"key": "NumberOfConnectors", "value": "4"}),
                ),
            )
            .await,
        );
        assert_eq!(payload["status"], "Rejected");

        let payload = result_payload(
            handle_incoming(
                &engine,
                call("ChangeConfiguration", json!({"key": "Bogus", "value": "1"})),
            )
            .await,
        );
        assert_eq!(payload["status"], "NotSupported");
    }

    #[tokio::test]
    async fn test_change_availability_unknown_connector_rejected() {
        let (engine, _dir) = engine().await;
        let payload = result_payload(
            handle_incoming(
                &engine,
                call(
                    "ChangeAvailability",
                    json!({"connectorId": 9, "type": "Inoperative"}),
                ),
            )
            .await,
        );
        assert_eq!(payload["status"], "Rejected");
    }

    #[tokio::test]
    async fn test_change_availability_scheduled_when_transacting() {
        let (engine, _dir) = engine().await;
        engine
            .inner()
            .topology
            .write()
            .await
            .connector_mut(1)
            .unwrap()
            .begin_transaction(7, "TAG-1".to_string());
        let payload = result_payload(
            handle_incoming(
                &engine,
                call(
                    "ChangeAvailability",
                    json!({"connectorId": 1, "type": "Inoperative"}),
                ),
            )
            .await,
        );
        assert_eq!(payload["status"], "Scheduled");
    }

    #[tokio::test]
    async fn test_remote_stop_unknown_transaction_rejected() {
        let (engine, _dir) = engine().await;
        let payload = result_payload(
            handle_incoming(
                &engine,
                call("RemoteStopTransaction", json!({"transactionId": 99})),
            )
            .await,
        );
        assert_eq!(payload["status"], "Rejected");
    }

    #[tokio::test]
    async fn test_reserve_now_statuses() {
        let (engine, _dir) = engine().await;
        *engine.inner().boot_response.write().await = Some(crate::station::BootResponse {
            current_time: chrono::Utc::now(),
            interval: 30,
            status: RegistrationStatus::Accepted,
        });

        // Occupied connector
        engine
            .inner()
            .topology
            .write()
            .await
            .connector_mut(1)
            .unwrap()
            .begin_transaction(7, "TAG-1".to_string());
        let payload = result_payload(
            handle_incoming(
                &engine,
                call(
                    "ReserveNow",
                    json!({
                        "connectorId": 1,
                        "expiryDate": "2030-01-01T00:00:00Z",
                        "idTag": "TAG-2",
                        "reservationId": 5
                    }),
                ),
            )
            .await,
        );
        assert_eq!(payload["status"], "Occupied");

        // Unknown connector
        let payload = result_payload(
            handle_incoming(
                &engine,
                call(
                    "ReserveNow",
                    json!({
                        "connectorId": 9,
                        "expiryDate": "2030-01-01T00:00:00Z",
                        "idTag": "TAG-2",
                        "reservationId": 6
                    }),
                ),
            )
            .await,
        );
        assert_eq!(payload["status"], "Rejected");
    }

    #[tokio::test]
    async fn test_cancel_reservation_unknown_rejected() {
        let (engine, _dir) = engine().await;
        let payload = result_payload(
            handle_incoming(&engine, call("CancelReservation", json!({"reservationId": 1}))).await,
        );
        assert_eq!(payload["status"], "Rejected");
    }

    #[tokio::test]
    async fn test_set_charging_profile_tx_profile_requires_transaction() {
        let (engine, _dir) = engine().await;
        let profile = json!({
            "chargingProfileId": 1,
            "stackLevel": 0,
            "chargingProfilePurpose": "TxProfile",
            "chargingProfileKind": "Absolute",
            "chargingSchedule": {"chargingRateUnit": "A", "chargingSchedulePeriod": []}
        });
        let payload = result_payload(
            handle_incoming(
                &engine,
                call(
                    "SetChargingProfile",
                    json!({"connectorId": 1, "csChargingProfiles": profile}),
                ),
            )
            .await,
        );
        assert_eq!(payload["status"], "Rejected");

        engine
            .inner()
            .topology
            .write()
            .await
            .connector_mut(1)
            .unwrap()
            .begin_transaction(42, "TAG-1".to_string());
        let profile = json!({
            "chargingProfileId": 1,
            "transactionId": 42,
            "stackLevel": 0,
            "chargingProfilePurpose": "TxProfile",
            "chargingProfileKind": "Absolute",
            "chargingSchedule": {"chargingRateUnit": "A", "chargingSchedulePeriod": []}
        });
        let payload = result_payload(
            handle_incoming(
                &engine,
                call(
                    "SetChargingProfile",
                    json!({"connectorId": 1, "csChargingProfiles": profile}),
                ),
            )
            .await,
        );
        assert_eq!(payload["status"], "Accepted");
    }

    #[tokio::test]
    async fn test_clear_charging_profile() {
        let (engine, _dir) = engine().await;
        let profile = json!({
            "chargingProfileId": 3,
            "stackLevel": 1,
            "chargingProfilePurpose": "TxDefaultProfile",
            "chargingProfileKind": "Absolute",
            "chargingSchedule": {}
        });
        result_payload(
            handle_incoming(
                &engine,
                call(
                    "SetChargingProfile",
                    json!({"connectorId": 1, "csChargingProfiles": profile}),
                ),
            )
            .await,
        );

        let payload = result_payload(
            handle_incoming(&engine, call("ClearChargingProfile", json!({"id": 3}))).await,
        );
        assert_eq!(payload["status"], "Accepted");

        let payload = result_payload(
            handle_incoming(&engine, call("ClearChargingProfile", json!({"id": 3}))).await,
        );
        assert_eq!(payload["status"], "Unknown");
    }

    #[tokio::test]
    async fn test_data_transfer_vendor_check() {
        let (engine, _dir) = engine().await;
        let payload = result_payload(
            handle_incoming(&engine, call("DataTransfer", json!({"vendorId": "FleetSim"}))).await,
        );
        assert_eq!(payload["status"], "Accepted");

        let payload = result_payload(
            handle_incoming(&engine, call("DataTransfer", json!({"vendorId": "Other"}))).await,
        );
        assert_eq!(payload["status"], "UnknownVendorId");
    }

    #[tokio::test]
    async fn test_clear_cache_accepted() {
        let (engine, _dir) = engine().await;
        let payload =
            result_payload(handle_incoming(&engine, call("ClearCache", json!({}))).await);
        assert_eq!(payload["status"], "Accepted");
    }
}
