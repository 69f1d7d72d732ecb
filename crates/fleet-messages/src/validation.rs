//! Payload validation
//!
//! Outgoing payloads are checked against the structural constraints of the
//! OCPP 1.6 specification before they are framed, when the station enables
//! `payload_schema_validation`. Incoming requests are checked the same way
//! before dispatch.

use crate::v16::*;
use fleet_types::{OcppError, OcppResult};

/// Maximum length of a CiString20Type field (id tags, serial numbers)
const CI_STRING_20: usize = 20;
/// Maximum length of a CiString25Type field
const CI_STRING_25: usize = 25;
/// Maximum length of a CiString50Type field
const CI_STRING_50: usize = 50;

/// Validation applied to payloads before framing or dispatch
pub trait Validate {
    fn validate(&self) -> OcppResult<()>;
}

/// Check a bounded, non-empty string field
pub fn validate_string_field(
    value: &str,
    field: &str,
    max_length: usize,
    allow_empty: bool,
) -> OcppResult<()> {
    if !allow_empty && value.is_empty() {
        return Err(OcppError::formation(format!("{} must not be empty", field)));
    }
    if value.len() > max_length {
        return Err(OcppError::formation(format!(
            "{} exceeds {} characters",
            field, max_length
        )));
    }
    Ok(())
}

/// Check a connector id; index 0 is only valid where the station-global
/// pseudo-connector is addressable
pub fn validate_connector_id(connector_id: u32, allow_zero: bool) -> OcppResult<()> {
    if connector_id == 0 && !allow_zero {
        return Err(OcppError::formation("connectorId must be > 0"));
    }
    Ok(())
}

impl Validate for AuthorizeRequest {
    fn validate(&self) -> OcppResult<()> {
        validate_string_field(&self.id_tag, "idTag", CI_STRING_20, false)
    }
}

impl Validate for BootNotificationRequest {
    fn validate(&self) -> OcppResult<()> {
        validate_string_field(
            &self.charge_point_vendor,
            "chargePointVendor",
            CI_STRING_20,
            false,
        )?;
        validate_string_field(
            &self.charge_point_model,
            "chargePointModel",
            CI_STRING_20,
            false,
        )?;
        if let Some(ref firmware_version) = self.firmware_version {
            validate_string_field(firmware_version, "firmwareVersion", CI_STRING_50, true)?;
        }
        if let Some(ref serial) = self.charge_point_serial_number {
            validate_string_field(serial, "chargePointSerialNumber", CI_STRING_25, true)?;
        }
        Ok(())
    }
}

impl Validate for HeartbeatRequest {
    fn validate(&self) -> OcppResult<()> {
        Ok(())
    }
}

impl Validate for StartTransactionRequest {
    fn validate(&self) -> OcppResult<()> {
        validate_connector_id(self.connector_id, false)?;
        validate_string_field(&self.id_tag, "idTag", CI_STRING_20, false)
    }
}

impl Validate for StopTransactionRequest {
    fn validate(&self) -> OcppResult<()> {
        if let Some(ref id_tag) = self.id_tag {
            validate_string_field(id_tag, "idTag", CI_STRING_20, false)?;
        }
        if self.meter_stop < 0 {
            return Err(OcppError::formation("meterStop must be >= 0"));
        }
        Ok(())
    }
}

impl Validate for StatusNotificationRequest {
    fn validate(&self) -> OcppResult<()> {
        validate_connector_id(self.connector_id, true)?;
        if let Some(ref info) = self.info {
            validate_string_field(info, "info", CI_STRING_50, true)?;
        }
        Ok(())
    }
}

impl Validate for MeterValuesRequest {
    fn validate(&self) -> OcppResult<()> {
        validate_connector_id(self.connector_id, true)?;
        if self.meter_value.is_empty() {
            return Err(OcppError::formation("meterValue must not be empty"));
        }
        if self
            .meter_value
            .iter()
            .any(|mv| mv.sampled_value.is_empty())
        {
            return Err(OcppError::formation("sampledValue must not be empty"));
        }
        Ok(())
    }
}

impl Validate for DataTransferRequest {
    fn validate(&self) -> OcppResult<()> {
        validate_string_field(&self.vendor_id, "vendorId", 255, false)?;
        if let Some(ref message_id) = self.message_id {
            validate_string_field(message_id, "messageId", CI_STRING_50, true)?;
        }
        Ok(())
    }
}

impl Validate for DiagnosticsStatusNotificationRequest {
    fn validate(&self) -> OcppResult<()> {
        Ok(())
    }
}

impl Validate for FirmwareStatusNotificationRequest {
    fn validate(&self) -> OcppResult<()> {
        Ok(())
    }
}

impl Validate for ChangeConfigurationRequest {
    fn validate(&self) -> OcppResult<()> {
        validate_string_field(&self.key, "key", CI_STRING_50, false)?;
        validate_string_field(&self.value, "value", 500, true)
    }
}

impl Validate for RemoteStartTransactionRequest {
    fn validate(&self) -> OcppResult<()> {
        validate_string_field(&self.id_tag, "idTag", CI_STRING_20, false)?;
        if let Some(connector_id) = self.connector_id {
            validate_connector_id(connector_id, false)?;
        }
        Ok(())
    }
}

impl Validate for ReserveNowRequest {
    fn validate(&self) -> OcppResult<()> {
        validate_connector_id(self.connector_id, true)?;
        validate_string_field(&self.id_tag, "idTag", CI_STRING_20, false)?;
        if let Some(ref parent) = self.parent_id_tag {
            validate_string_field(parent, "parentIdTag", CI_STRING_20, true)?;
        }
        Ok(())
    }
}

impl Validate for crate::v20::BootNotificationRequest {
    fn validate(&self) -> OcppResult<()> {
        validate_string_field(&self.charging_station.model, "model", CI_STRING_20, false)?;
        validate_string_field(
            &self.charging_station.vendor_name,
            "vendorName",
            CI_STRING_50,
            false,
        )
    }
}

impl Validate for crate::v20::HeartbeatRequest {
    fn validate(&self) -> OcppResult<()> {
        Ok(())
    }
}

impl Validate for crate::v20::StatusNotificationRequest {
    fn validate(&self) -> OcppResult<()> {
        validate_connector_id(self.connector_id, false)
    }
}
