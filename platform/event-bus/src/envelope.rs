//! # Event Envelope
//!
//! Wire shape for every event the relay publishes, whether it travels through
//! the outbox or the direct bypass. Both paths build the same envelope so
//! consumers see one format regardless of how the message got to the bus.
//!
//! Fields:
//!
//! - `event_id`: unique identifier, the consumer-side idempotency key
//! - `occurred_at`: when the producer created the event
//! - `source`: producing process name
//! - `ordering_key`: optional; consumers can use it to partition work
//! - `payload`: event-specific data (generic type parameter)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope wrapping every published event.
///
/// Delivery is at-least-once end to end, so `event_id` is the handle
/// consumers deduplicate on.
///
/// # Examples
///
/// ```rust
/// use event_bus::EventEnvelope;
/// use serde_json::json;
///
/// let envelope = EventEnvelope::new(
///     "outbox-relay".to_string(),
///     json!({"message": "hello"}),
/// )
/// .with_ordering_key(Some("k1".to_string()));
///
/// assert_eq!(envelope.source, "outbox-relay");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope<T> {
    /// Unique event identifier (idempotency key)
    pub event_id: Uuid,

    /// Timestamp when the event was generated
    pub occurred_at: DateTime<Utc>,

    /// Process that generated the event
    pub source: String,

    /// Ordering key the event was published with, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ordering_key: Option<String>,

    /// Event-specific payload
    pub payload: T,
}

impl<T> EventEnvelope<T> {
    /// Create a new envelope with a fresh event_id and the current time.
    pub fn new(source: String, payload: T) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            source,
            ordering_key: None,
            payload,
        }
    }

    /// Set the ordering key.
    pub fn with_ordering_key(mut self, ordering_key: Option<String>) -> Self {
        self.ordering_key = ordering_key;
        self
    }
}

/// Validate the envelope fields of a raw inbound message.
///
/// Consumers parse payloads as `serde_json::Value` first so a malformed
/// message can be rejected (and acked away) without a typed deserialization
/// attempt.
///
/// # Errors
///
/// Returns a descriptive error string if validation fails
pub fn validate_envelope_fields(envelope: &serde_json::Value) -> Result<(), String> {
    let event_id = envelope
        .get("event_id")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid event_id")?;

    Uuid::parse_str(event_id).map_err(|_| "event_id is not a valid UUID".to_string())?;

    envelope
        .get("occurred_at")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid occurred_at")?;

    let source = envelope
        .get("source")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid source")?;

    if source.is_empty() {
        return Err("source cannot be empty".to_string());
    }

    // ordering_key is optional
    Ok(())
}

/// Parse an inbound payload as an envelope and validate its fields.
///
/// Returns the event id alongside the parsed value. An `Err` means the
/// message is malformed: consumers should log it and ack it away, since
/// nacking a message that can never validate just redelivers it forever.
pub fn parse_envelope(payload: &[u8]) -> Result<(Uuid, serde_json::Value), String> {
    let envelope: serde_json::Value =
        serde_json::from_slice(payload).map_err(|e| format!("payload is not JSON: {e}"))?;

    validate_envelope_fields(&envelope)?;

    // validate_envelope_fields already proved event_id is a valid UUID.
    let event_id = envelope
        .get("event_id")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or("Missing or invalid event_id")?;

    Ok((event_id, envelope))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_creation() {
        let envelope = EventEnvelope::new("outbox-relay".to_string(), json!({"n": 1}));

        assert_eq!(envelope.source, "outbox-relay");
        assert!(envelope.ordering_key.is_none());
    }

    #[test]
    fn test_envelope_with_ordering_key() {
        let envelope = EventEnvelope::new("outbox-relay".to_string(), json!({"n": 1}))
            .with_ordering_key(Some("k1".to_string()));

        assert_eq!(envelope.ordering_key.as_deref(), Some("k1"));
    }

    #[test]
    fn test_envelope_round_trips_through_json() {
        let envelope = EventEnvelope::new("outbox-relay".to_string(), json!({"n": 1}))
            .with_ordering_key(Some("k1".to_string()));

        let value = serde_json::to_value(&envelope).unwrap();
        assert!(validate_envelope_fields(&value).is_ok());

        let parsed: EventEnvelope<serde_json::Value> = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.event_id, envelope.event_id);
        assert_eq!(parsed.ordering_key, envelope.ordering_key);
    }

    #[test]
    fn test_validate_missing_event_id() {
        let envelope = json!({
            "occurred_at": "2024-01-01T00:00:00Z",
            "source": "outbox-relay",
            "payload": {}
        });

        assert!(validate_envelope_fields(&envelope).is_err());
    }

    #[test]
    fn test_validate_empty_source() {
        let envelope = json!({
            "event_id": "550e8400-e29b-41d4-a716-446655440000",
            "occurred_at": "2024-01-01T00:00:00Z",
            "source": "",
            "payload": {}
        });

        assert!(validate_envelope_fields(&envelope).is_err());
    }

    #[test]
    fn test_validate_bad_uuid() {
        let envelope = json!({
            "event_id": "not-a-uuid",
            "occurred_at": "2024-01-01T00:00:00Z",
            "source": "outbox-relay",
            "payload": {}
        });

        assert!(validate_envelope_fields(&envelope).is_err());
    }

    #[test]
    fn test_parse_envelope_accepts_valid_payload() {
        let envelope = EventEnvelope::new("outbox-relay".to_string(), json!({"n": 1}));
        let payload = serde_json::to_vec(&envelope).unwrap();

        let (event_id, value) = parse_envelope(&payload).unwrap();
        assert_eq!(event_id, envelope.event_id);
        assert_eq!(value.pointer("/payload/n").and_then(|v| v.as_u64()), Some(1));
    }

    #[test]
    fn test_parse_envelope_rejects_garbage() {
        assert!(parse_envelope(b"not json at all").is_err());
        assert!(parse_envelope(b"{\"payload\": {}}").is_err());
        assert!(parse_envelope(
            br#"{"event_id": "nope", "occurred_at": "2024-01-01T00:00:00Z", "source": "s"}"#
        )
        .is_err());
    }
}
