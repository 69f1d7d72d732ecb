//! OCPP-J frame envelope
//!
//! Frames travel as positional JSON arrays: CALL `[2, id, action, payload]`,
//! CALLRESULT `[3, id, payload]`, CALLERROR `[4, id, code, description,
//! details]`. The `WireFrame` enum maps the raw arrays; `Frame` is the typed
//! view used by the rest of the simulator.

use crate::{CallErrorCode, MessageType, OcppError, OcppResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Typed OCPP-J frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl Frame {
    pub fn message_type(&self) -> MessageType {
        match self {
            Frame::Call(_) => MessageType::Call,
            Frame::CallResult(_) => MessageType::CallResult,
            Frame::CallError(_) => MessageType::CallError,
        }
    }

    /// Unique message id shared by a call and its response
    pub fn unique_id(&self) -> &str {
        match self {
            Frame::Call(f) => &f.unique_id,
            Frame::CallResult(f) => &f.unique_id,
            Frame::CallError(f) => &f.unique_id,
        }
    }

    /// Build a CALL frame with a fresh UUID v4 message id
    pub fn call<T: Serialize>(action: &str, payload: T) -> OcppResult<Self> {
        Ok(Frame::Call(Call {
            unique_id: Uuid::new_v4().to_string(),
            action: action.to_string(),
            payload: serde_json::to_value(payload)?,
        }))
    }

    /// Build a CALLRESULT frame echoing the call's message id
    pub fn call_result<T: Serialize>(unique_id: String, payload: T) -> OcppResult<Self> {
        Ok(Frame::CallResult(CallResult {
            unique_id,
            payload: serde_json::to_value(payload)?,
        }))
    }

    /// Build a CALLERROR frame echoing the call's message id
    pub fn call_error(
        unique_id: String,
        error_code: CallErrorCode,
        error_description: String,
        error_details: Option<serde_json::Value>,
    ) -> Self {
        Frame::CallError(CallError {
            unique_id,
            error_code,
            error_description,
            error_details: error_details.unwrap_or(serde_json::Value::Object(Default::default())),
        })
    }

    /// Serialize to the wire representation
    pub fn to_wire(&self) -> OcppResult<String> {
        Ok(serde_json::to_string(&WireFrame::from(self.clone()))?)
    }

    /// Parse a frame from the wire representation
    pub fn from_wire(raw: &str) -> OcppResult<Self> {
        let wire: WireFrame = serde_json::from_str(raw).map_err(|e| OcppError::ProtocolViolation {
            message: format!("Malformed frame: {}", e),
        })?;
        wire.into_frame()
    }
}

/// CALL frame (request)
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    /// Unique message identifier
    pub unique_id: String,
    /// Action name (e.g. "BootNotification")
    pub action: String,
    /// Request payload
    pub payload: serde_json::Value,
}

impl Call {
    /// Extract the payload as a typed request
    pub fn payload_as<T: for<'de> Deserialize<'de>>(&self) -> OcppResult<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| OcppError::FormationViolation {
            message: format!("{}: {}", self.action, e),
        })
    }
}

/// CALLRESULT frame (successful response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub unique_id: String,
    pub payload: serde_json::Value,
}

impl CallResult {
    /// Extract the payload as a typed response
    pub fn payload_as<T: for<'de> Deserialize<'de>>(&self) -> OcppResult<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| OcppError::FormationViolation {
            message: e.to_string(),
        })
    }
}

/// CALLERROR frame (error response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub unique_id: String,
    pub error_code: CallErrorCode,
    pub error_description: String,
    pub error_details: serde_json::Value,
}

/// Raw frame as it appears on the wire (positional array encoding)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireFrame {
    /// `[2, "unique_id", "action", payload]`
    Call(u8, String, String, serde_json::Value),
    /// `[3, "unique_id", payload]`
    CallResult(u8, String, serde_json::Value),
    /// `[4, "unique_id", "error_code", "error_description", error_details]`
    CallError(u8, String, String, String, serde_json::Value),
}

impl WireFrame {
    /// Convert the raw array to a typed frame, checking the discriminator
    pub fn into_frame(self) -> OcppResult<Frame> {
        match self {
            WireFrame::Call(msg_type, unique_id, action, payload) => {
                if msg_type != 2 {
                    return Err(OcppError::InvalidMessageType(msg_type));
                }
                Ok(Frame::Call(Call {
                    unique_id,
                    action,
                    payload,
                }))
            }
            WireFrame::CallResult(msg_type, unique_id, payload) => {
                if msg_type != 3 {
                    return Err(OcppError::InvalidMessageType(msg_type));
                }
                Ok(Frame::CallResult(CallResult { unique_id, payload }))
            }
            WireFrame::CallError(msg_type, unique_id, code_str, description, details) => {
                if msg_type != 4 {
                    return Err(OcppError::InvalidMessageType(msg_type));
                }
                let error_code =
                    CallErrorCode::parse(&code_str).ok_or_else(|| OcppError::ProtocolViolation {
                        message: format!("Unknown error code: {}", code_str),
                    })?;
                Ok(Frame::CallError(CallError {
                    unique_id,
                    error_code,
                    error_description: description,
                    error_details: details,
                }))
            }
        }
    }
}

impl From<Frame> for WireFrame {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Call(f) => WireFrame::Call(2, f.unique_id, f.action, f.payload),
            Frame::CallResult(f) => WireFrame::CallResult(3, f.unique_id, f.payload),
            Frame::CallError(f) => WireFrame::CallError(
                4,
                f.unique_id,
                f.error_code.as_str().to_string(),
                f.error_description,
                f.error_details,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_frame_creation() {
        let frame = Frame::call("Authorize", json!({"idTag": "TAG-1"})).unwrap();
        assert_eq!(frame.message_type(), MessageType::Call);
        assert!(Uuid::parse_str(frame.unique_id()).is_ok());
    }

    #[test]
    fn test_call_wire_round_trip() {
        let frame = Frame::call("Heartbeat", json!({})).unwrap();
        let wire = frame.to_wire().unwrap();
        assert!(wire.starts_with("[2,"));

        let parsed = Frame::from_wire(&wire).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn test_call_result_wire_round_trip() {
        let frame =
            Frame::call_result("msg-1".to_string(), json!({"currentTime": "2024-01-01T00:00:00Z"}))
                .unwrap();
        let wire = frame.to_wire().unwrap();
        let parsed = Frame::from_wire(&wire).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn test_call_error_wire_round_trip() {
        let frame = Frame::call_error(
            "msg-2".to_string(),
            CallErrorCode::ProtocolError,
            "bad frame".to_string(),
            Some(json!({"detail": "more"})),
        );
        let wire = frame.to_wire().unwrap();
        assert!(wire.starts_with("[4,"));

        let parsed = Frame::from_wire(&wire).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn test_invalid_message_type() {
        let result = Frame::from_wire(r#"[5,"id","Action",{}]"#);
        assert!(matches!(result, Err(OcppError::InvalidMessageType(5))));
    }

    #[test]
    fn test_malformed_frame() {
        let result = Frame::from_wire(r#"{"not":"an array"}"#);
        assert!(matches!(result, Err(OcppError::ProtocolViolation { .. })));
    }

    #[test]
    fn test_unknown_error_code_rejected() {
        let result = Frame::from_wire(r#"[4,"id","NoSuchCode","desc",{}]"#);
        assert!(matches!(result, Err(OcppError::ProtocolViolation { .. })));
    }

    #[test]
    fn test_payload_extraction() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct TestPayload {
            #[serde(rename = "idTag")]
            id_tag: String,
        }

        let frame = Frame::call("Authorize", json!({"idTag": "TAG-9"})).unwrap();
        if let Frame::Call(call) = frame {
            let extracted: TestPayload = call.payload_as().unwrap();
            assert_eq!(extracted.id_tag, "TAG-9");
        } else {
            panic!("Expected Call frame");
        }
    }
}
