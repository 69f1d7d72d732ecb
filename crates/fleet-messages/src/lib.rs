//! # Fleet Messages
//!
//! Typed request/response payloads for the OCPP dialects spoken by the
//! simulator: the full 1.6 action set (both directions) and the 2.0
//! boot/heartbeat/status subset. Payloads carry their wire field names via
//! explicit serde renames and know their action name and response type
//! through the [`OcppAction`] trait.

pub mod v16;
pub mod v20;
pub mod validation;

pub use validation::Validate;

use serde::{de::DeserializeOwned, Serialize};

/// A request payload bound to its OCPP action name and response type
pub trait OcppAction: Serialize + Sized {
    /// Wire action name (e.g. "BootNotification")
    const ACTION_NAME: &'static str;
    /// Response payload paired with this request
    type Response: DeserializeOwned + Serialize;
}

/// Marker for payloads that may appear in a CALLRESULT
pub trait OcppResponse: Serialize {}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_types::Frame;

    #[test]
    fn test_action_name_flows_into_frame() {
        let request = v16::HeartbeatRequest {};
        let frame = Frame::call(v16::HeartbeatRequest::ACTION_NAME, &request).unwrap();
        if let Frame::Call(call) = frame {
            assert_eq!(call.action, "Heartbeat");
        } else {
            panic!("Expected Call frame");
        }
    }
}
