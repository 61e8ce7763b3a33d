//! The JSON wire envelope shared by requests and responses.
//!
//! Envelopes are UTF-8 JSON objects. The codec treats `bizData` as an opaque
//! subtree and never inspects it beyond checking that it is an object. Event
//! codes round-trip in a lenient shape: an all-digit code is emitted as a
//! JSON number, anything else as a string, and readers accept both.

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use serde_json::Value;
use std::fmt;

use crate::{TraceId, action::Action};

/// Fields an envelope must always carry.
const REQUIRED_FIELDS: [&str; 5] = ["appSign", "version", "timeStamp", "action", "traceId"];

/// Errors produced while decoding an inbound frame.
///
/// Corrupt frames do not poison the transport. They are logged and dropped
/// by the caller; an outstanding call affected by a dropped frame surfaces
/// through its per-trace timeout.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// A required envelope field is absent.
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    /// `bizData` is present but not a JSON object.
    #[error("bizData must be a JSON object")]
    BizDataNotObject,
    /// The event code does not name a known payment event.
    ///
    /// Not fatal: downstream maps unknown events to `Processing`.
    #[error("unknown event code `{0}`")]
    UnknownEvent(String),
    /// The frame is not valid JSON (or not an object at all).
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// An event code as carried on the wire.
///
/// The runtime value is always a string. Serialization emits a JSON number
/// iff the string is all digits; deserialization accepts numbers, numeric
/// strings and alphabetic strings alike.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EventCode(String);

impl EventCode {
    /// Wraps a string code.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the code as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the numeric value iff the code is all digits.
    ///
    /// Codes whose digits do not survive the number form, e.g. the legacy
    /// `000`, stay strings so they round-trip.
    pub fn as_number(&self) -> Option<u64> {
        if self.0.is_empty() || !self.0.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let parsed: u64 = self.0.parse().ok()?;
        (parsed.to_string() == self.0).then_some(parsed)
    }
}

impl From<u64> for EventCode {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for EventCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for EventCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.as_number() {
            Some(n) => serializer.serialize_u64(n),
            None => serializer.serialize_str(&self.0),
        }
    }
}

impl<'de> Deserialize<'de> for EventCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        match value {
            Value::Number(n) => Ok(Self(n.to_string())),
            Value::String(s) => Ok(Self(s)),
            other => Err(de::Error::custom(format!(
                "eventCode must be a number or string, got {other}"
            ))),
        }
    }
}

/// The request/response envelope.
///
/// Requests and responses share this shape; responses additionally carry an
/// `eventCode` and the legacy `eventMsg`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Merchant application signature.
    pub app_sign: String,
    /// Protocol version.
    pub version: String,
    /// Milliseconds since epoch, as a string.
    pub time_stamp: String,
    /// The operation this envelope requests or answers.
    pub action: Action,
    /// Correlates this envelope with exactly one outstanding request, or
    /// marks a stream event not tied to a pending completion.
    pub trace_id: TraceId,
    /// Action-specific payload, passed through as an opaque subtree.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub biz_data: Option<Value>,
    /// Response event code; absent on requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_code: Option<EventCode>,
    /// Legacy human-readable event message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_msg: Option<String>,
}

impl Envelope {
    /// Serializes the envelope to UTF-8 JSON bytes.
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("envelope serializes")
    }

    /// Parses an envelope from UTF-8 JSON bytes.
    ///
    /// Verifies the required fields and that `bizData`, when present, is an
    /// object.
    pub fn decode(bytes: &[u8]) -> Result<Self, ParseError> {
        let raw: Value = serde_json::from_slice(bytes)?;
        for field in REQUIRED_FIELDS {
            if raw.get(field).is_none() {
                return Err(ParseError::MissingField(field));
            }
        }
        if let Some(biz_data) = raw.get("bizData")
            && !biz_data.is_object()
        {
            return Err(ParseError::BizDataNotObject);
        }
        Ok(serde_json::from_value(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(event_code: Option<EventCode>) -> Envelope {
        Envelope {
            app_sign: "sign-1".to_string(),
            version: "1.0".to_string(),
            time_stamp: "1722470400000".to_string(),
            action: Action::Sale,
            trace_id: TraceId::mint(),
            biz_data: Some(serde_json::json!({"referenceOrderId": "O-000001"})),
            event_code,
            event_msg: None,
        }
    }

    #[test]
    fn round_trips_numeric_event_code() {
        let env = envelope(Some(EventCode::new("4003")));
        let bytes = env.encode();
        // all-digit codes are emitted as JSON numbers
        let raw: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(raw["eventCode"], serde_json::json!(4003));
        assert_eq!(Envelope::decode(&bytes).unwrap(), env);
    }

    #[test]
    fn leading_zero_code_stays_a_string() {
        let env = envelope(Some(EventCode::new("000")));
        let bytes = env.encode();
        let raw: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(raw["eventCode"], serde_json::json!("000"));
        assert_eq!(Envelope::decode(&bytes).unwrap(), env);
    }

    #[test]
    fn round_trips_alpha_event_code() {
        let env = envelope(Some(EventCode::new("TIMEOUT")));
        let bytes = env.encode();
        let raw: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(raw["eventCode"], serde_json::json!("TIMEOUT"));
        assert_eq!(Envelope::decode(&bytes).unwrap(), env);
    }

    #[test]
    fn rejects_missing_trace_id() {
        let mut raw = serde_json::to_value(envelope(None)).unwrap();
        raw.as_object_mut().unwrap().remove("traceId");
        let bytes = serde_json::to_vec(&raw).unwrap();
        assert!(matches!(
            Envelope::decode(&bytes),
            Err(ParseError::MissingField("traceId"))
        ));
    }

    #[test]
    fn rejects_non_object_biz_data() {
        let mut raw = serde_json::to_value(envelope(None)).unwrap();
        raw.as_object_mut().unwrap()["bizData"] = serde_json::json!("not-an-object");
        let bytes = serde_json::to_vec(&raw).unwrap();
        assert!(matches!(
            Envelope::decode(&bytes),
            Err(ParseError::BizDataNotObject)
        ));
    }

    #[test]
    fn biz_data_is_passed_through_untouched() {
        let env = envelope(None);
        let decoded = Envelope::decode(&env.encode()).unwrap();
        assert_eq!(decoded.biz_data, env.biz_data);
    }
}
