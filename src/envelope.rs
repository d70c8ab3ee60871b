/********************************************************************************
 * Copyright (c) 2026 Contributors to the mqtt-queue project
 *
 * This program and the accompanying materials are made available under the
 * terms of the Apache License Version 2.0 which is available at
 * https://www.apache.org/licenses/LICENSE-2.0
 *
 * SPDX-License-Identifier: Apache-2.0
 ********************************************************************************/

use std::fmt::Display;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A domain-level message wrapper, independent of the wire encoding.
///
/// Envelopes are created by callers when sending and by the queue when
/// decoding an incoming publish. The payload is immutable after creation.
///
/// # Examples
///
/// ```rust
/// use mqtt_queue::MessageEnvelope;
///
/// let envelope = MessageEnvelope::new(
///     Some("123".to_string()),
///     Some("Test".to_string()),
///     "Test message".as_bytes().to_vec(),
/// );
/// assert_eq!(envelope.message_type.as_deref(), Some("Test"));
/// assert_eq!(envelope.payload_as_string(), "Test message");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Unique identifier of this message.
    pub message_id: String,
    /// Identifier used to correlate this message with related business
    /// transactions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Application defined message type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    /// The point in time at which the message was created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_time: Option<DateTime<Utc>>,
    /// The opaque message payload.
    #[serde(default)]
    pub payload: Bytes,
}

impl MessageEnvelope {
    /// Creates a new envelope with a generated message id and the current
    /// time as sent time.
    pub fn new(
        correlation_id: Option<String>,
        message_type: Option<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        MessageEnvelope {
            message_id: Uuid::new_v4().to_string(),
            correlation_id,
            message_type,
            sent_time: Some(Utc::now()),
            payload: payload.into(),
        }
    }

    /// Creates a new envelope with a UTF-8 string payload.
    pub fn with_string_payload(
        correlation_id: Option<String>,
        message_type: Option<String>,
        payload: &str,
    ) -> Self {
        Self::new(
            correlation_id,
            message_type,
            payload.as_bytes().to_vec(),
        )
    }

    /// Returns the payload rendered as a UTF-8 string.
    ///
    /// Invalid UTF-8 sequences are replaced with the Unicode replacement
    /// character.
    pub fn payload_as_string(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Encodes this envelope into its JSON wire representation.
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope cannot be serialized.
    pub fn to_json(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    /// Decodes an envelope from its JSON wire representation.
    ///
    /// # Errors
    ///
    /// Returns an error if the given bytes are not a valid JSON encoding of
    /// an envelope.
    pub fn from_json(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

impl Display for MessageEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}, {}, {}, {}b]",
            self.message_id,
            self.correlation_id.as_deref().unwrap_or("---"),
            self.message_type.as_deref().unwrap_or("---"),
            self.payload.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_assigns_message_id_and_sent_time() {
        let envelope = MessageEnvelope::with_string_payload(None, None, "abc");
        assert!(!envelope.message_id.is_empty());
        assert!(envelope.sent_time.is_some());

        let other = MessageEnvelope::with_string_payload(None, None, "abc");
        assert_ne!(envelope.message_id, other.message_id);
    }

    #[test]
    fn test_json_round_trip_preserves_all_fields() {
        let envelope = MessageEnvelope::with_string_payload(
            Some("123".to_string()),
            Some("Test".to_string()),
            "Test message",
        );

        let encoded = envelope.to_json().expect("envelope should serialize");
        let decoded =
            MessageEnvelope::from_json(&encoded).expect("envelope should deserialize");

        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_from_json_tolerates_missing_optional_fields() {
        let decoded = MessageEnvelope::from_json(br#"{"message_id": "m1"}"#)
            .expect("envelope should deserialize");
        assert_eq!(decoded.message_id, "m1");
        assert!(decoded.correlation_id.is_none());
        assert!(decoded.message_type.is_none());
        assert!(decoded.sent_time.is_none());
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_from_json_fails_for_garbage() {
        assert!(MessageEnvelope::from_json(b"not json at all").is_err());
    }

    #[test]
    fn test_display_renders_placeholders_for_missing_fields() {
        let envelope = MessageEnvelope::with_string_payload(None, None, "xy");
        let rendered = envelope.to_string();
        assert!(rendered.contains("---"));
        assert!(rendered.contains("2b"));
    }
}
