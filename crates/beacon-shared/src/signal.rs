//! JSON payload shapes carried in the `signal_data` column of
//! `call_signals` rows.
//!
//! These follow the standard offer/answer/candidate shapes of the
//! underlying peer-to-peer transport, so a Beacon client interoperates
//! with peers that serialize descriptions and candidates the usual way
//! (`{ "sdp": ..., "type": "offer" }`, `candidate.toJSON()`).

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("Malformed signal payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Which side of the negotiation a description belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A session description as exchanged through the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn to_value(&self) -> Result<serde_json::Value, PayloadError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: &serde_json::Value) -> Result<Self, PayloadError> {
        Ok(serde_json::from_value(value.clone())?)
    }
}

/// A single ICE candidate as exchanged through the relay.
///
/// Field names match the browser `RTCIceCandidate.toJSON()` shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CandidatePayload {
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment")]
    pub username_fragment: Option<String>,
}

impl CandidatePayload {
    pub fn to_value(&self) -> Result<serde_json::Value, PayloadError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: &serde_json::Value) -> Result<Self, PayloadError> {
        Ok(serde_json::from_value(value.clone())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn description_uses_wire_field_names() {
        let desc = SessionDescription::offer("v=0");
        let value = desc.to_value().unwrap();
        assert_eq!(value["type"], "offer");
        assert_eq!(value["sdp"], "v=0");
    }

    #[test]
    fn candidate_uses_browser_json_shape() {
        let candidate = CandidatePayload {
            candidate: "candidate:1 1 udp 2130706431 192.0.2.1 54321 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        let value = candidate.to_value().unwrap();
        assert_eq!(value["sdpMid"], "0");
        assert_eq!(value["sdpMLineIndex"], 0);

        let back = CandidatePayload::from_value(&value).unwrap();
        assert_eq!(back, candidate);
    }

    #[test]
    fn malformed_payload_is_rejected() {
        let value = serde_json::json!({ "type": "offer" });
        assert!(SessionDescription::from_value(&value).is_err());
    }
}
