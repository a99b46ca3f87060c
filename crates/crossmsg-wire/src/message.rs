//! Wire envelope types.
//!
//! Everything that crosses the raw channel is a JSON object tagged by
//! `kind`. Inbound values that do not decode to an [`Envelope`] are not an
//! error: they simply never match an exchange.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A wire envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Envelope {
    /// Payload-carrying envelope, possibly retransmitted.
    #[serde(rename = "DATA")]
    Data(DataEnvelope),
    /// Acknowledgement of an accepted Data envelope.
    #[serde(rename = "ACK")]
    Ack(AckEnvelope),
}

/// Body of a Data envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataEnvelope {
    /// Logical key of the exchange.
    pub key: String,
    /// Application payload.
    #[serde(default)]
    pub payload: Value,
    /// Whether the receiver should answer with an Ack.
    #[serde(rename = "expectAck", default)]
    pub expect_ack: bool,
    /// Per-transmission token, regenerated on every retransmission.
    pub id: String,
}

/// Body of an Ack envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckEnvelope {
    /// Logical key of the acknowledged exchange.
    pub key: String,
    /// Always false; kept so both kinds share one wire shape.
    #[serde(rename = "expectAck", default)]
    pub expect_ack: bool,
    /// The `id` of the Data envelope that was accepted.
    pub id: String,
}

impl Envelope {
    /// Build a Data envelope with a fresh transmission id.
    pub fn data(key: &str, payload: Value) -> Self {
        Self::Data(DataEnvelope {
            key: key.to_string(),
            payload,
            expect_ack: true,
            id: new_envelope_id(),
        })
    }

    /// Build the Ack answering `data`.
    pub fn ack_for(data: &DataEnvelope) -> Self {
        Self::Ack(AckEnvelope {
            key: data.key.clone(),
            expect_ack: false,
            id: data.id.clone(),
        })
    }

    /// The logical key carried by either kind.
    pub fn key(&self) -> &str {
        match self {
            Self::Data(d) => &d.key,
            Self::Ack(a) => &a.key,
        }
    }

    /// The transmission id carried by either kind.
    pub fn id(&self) -> &str {
        match self {
            Self::Data(d) => &d.id,
            Self::Ack(a) => &a.id,
        }
    }

    /// Decode an inbound structured value, returning `None` for anything
    /// that is not a well-formed envelope.
    pub fn decode(value: &Value) -> Option<Self> {
        if !value.is_object() {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }

    /// Encode into the structured value handed to the raw channel.
    pub fn to_value(&self) -> Value {
        // Both variants are plain structs of strings, bools and an owned Value.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Generate a new opaque envelope id.
pub fn new_envelope_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Encode an envelope to JSON bytes, for channels that carry text.
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(envelope)
}

/// Decode JSON bytes into an envelope, treating malformed input as absent.
pub fn decode_envelope(body: &[u8]) -> Option<Envelope> {
    let value: Value = serde_json::from_slice(body).ok()?;
    Envelope::decode(&value)
}
