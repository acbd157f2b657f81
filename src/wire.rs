//! Relay wire schema.
//!
//! Everything the relay puts on the wire is snake_case JSON; what the
//! listener sees is mapped to this crate's types (and camelCase where a
//! value is re-serialized for a host UI). The mapping is explicit at this
//! boundary.

use serde::{Deserialize, Serialize};

/// JSON envelope of a non-heartbeat SSE frame.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct FrameEnvelope {
    /// Hex public key of the sending peer.
    pub from: String,
    /// Base64 of the authenticated-box ciphertext.
    pub message: String,
    #[serde(default)]
    pub trace_id: Option<String>,
    /// Base64 of an anonymous sealed box addressed to the receiver.
    #[serde(default)]
    pub request_source: Option<String>,
    #[serde(default)]
    pub connect_source: Option<ConnectSource>,
}

/// Origin metadata the relay sealed to the receiving peer.
///
/// Decoded from the sealed `request_source` blob. Wire field names are
/// snake_case; re-serialization uses camelCase for host consumption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSource {
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub time: Option<u64>,
    #[serde(
        default,
        rename(deserialize = "user_agent", serialize = "userAgent")
    )]
    pub user_agent: Option<String>,
}

/// Connection metadata attached in clear by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectSource {
    #[serde(default)]
    pub ip: Option<String>,
}

/// Body of a `POST /verify` request.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyRequest {
    /// Session id performing the verification.
    pub client_id: String,
    /// URL being verified.
    pub url: String,
    /// Verification kind tag.
    #[serde(rename = "type")]
    pub kind: String,
}

/// Body of a `POST /verify` response.
#[derive(Debug, Clone, Deserialize)]
pub struct VerifyResponse {
    /// Relay-assigned verification status.
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_envelope_minimal() {
        let envelope: FrameEnvelope =
            serde_json::from_str(r#"{"from":"ab12","message":"aGk="}"#).unwrap();
        assert_eq!(envelope.from, "ab12");
        assert_eq!(envelope.message, "aGk=");
        assert!(envelope.trace_id.is_none());
        assert!(envelope.request_source.is_none());
        assert!(envelope.connect_source.is_none());
    }

    #[test]
    fn test_frame_envelope_full() {
        let raw = r#"{
            "from": "ab12",
            "message": "aGk=",
            "trace_id": "t-1",
            "request_source": "c2VhbGVk",
            "connect_source": {"ip": "10.0.0.1"}
        }"#;
        let envelope: FrameEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.trace_id.as_deref(), Some("t-1"));
        assert_eq!(envelope.request_source.as_deref(), Some("c2VhbGVk"));
        assert_eq!(
            envelope.connect_source.unwrap().ip.as_deref(),
            Some("10.0.0.1")
        );
    }

    #[test]
    fn test_request_source_snake_in_camel_out() {
        let raw = r#"{"origin":"https://app","ip":"1.2.3.4","time":1700000000,"user_agent":"UA/1.0"}"#;
        let source: RequestSource = serde_json::from_str(raw).unwrap();
        assert_eq!(source.user_agent.as_deref(), Some("UA/1.0"));

        let out = serde_json::to_value(&source).unwrap();
        assert_eq!(out["userAgent"], "UA/1.0");
        assert!(out.get("user_agent").is_none());
    }

    #[test]
    fn test_verify_request_uses_type_on_wire() {
        let request = VerifyRequest {
            client_id: "ab12".into(),
            url: "https://app.example".into(),
            kind: "wallet".into(),
        };
        let out = serde_json::to_value(&request).unwrap();
        assert_eq!(out["type"], "wallet");
        assert_eq!(out["client_id"], "ab12");
    }
}
