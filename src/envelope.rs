//! Envelope: the wire message wrapping every domain event.
//!
//! The envelope is a protobuf message (prost derive, no `.proto` file):
//!
//! | tag | field        | type                         |
//! |-----|--------------|------------------------------|
//! | 1   | `event_type` | string                       |
//! | 2   | `event_id`   | string                       |
//! | 3   | `timestamp`  | `google.protobuf.Timestamp`  |
//! | 4   | `version`    | int32                        |
//! | 5   | `payload`    | bytes                        |
//! | 6   | `metadata`   | map<string, string>          |
//!
//! The bus never looks inside `payload`; consumers decode it, typically with
//! [`Envelope::decode_payload`].

use std::collections::HashMap;
use std::time::SystemTime;

use prost::Message;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Payload schema version written by this crate.
pub const CURRENT_VERSION: i32 = 1;

/// Metadata key holding the publisher identity.
pub const METADATA_PUBLISHER: &str = "publisher";

/// Metadata key holding the payload's logical type name.
pub const METADATA_PAYLOAD_TYPE: &str = "payload_type";

/// Event envelope as carried in the message body.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Envelope {
    /// Routing key the envelope was published under.
    #[prost(string, tag = "1")]
    pub event_type: String,
    /// Publisher-assigned id, unique per publish.
    #[prost(string, tag = "2")]
    pub event_id: String,
    /// Publish time.
    #[prost(message, optional, tag = "3")]
    pub timestamp: Option<prost_types::Timestamp>,
    /// Payload schema tag.
    #[prost(int32, tag = "4")]
    pub version: i32,
    /// Serialized domain event.
    #[prost(bytes = "vec", tag = "5")]
    pub payload: Vec<u8>,
    /// Provenance (publisher, payload type, ...).
    #[prost(map = "string, string", tag = "6")]
    pub metadata: HashMap<String, String>,
}

/// Failure to read an envelope from bytes.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Wire(#[from] prost::DecodeError),

    #[error("envelope is missing `{0}`")]
    MissingField(&'static str),

    #[error("failed to decode payload: {0}")]
    Payload(#[from] bitcode::Error),
}

/// Generate a fresh event id.
pub fn new_event_id() -> String {
    format!("evt_{}", uuid::Uuid::new_v4().simple())
}

impl Envelope {
    /// Create an envelope stamped with a fresh id, the current time and
    /// [`CURRENT_VERSION`].
    pub fn new(event_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            event_type: event_type.into(),
            event_id: new_event_id(),
            timestamp: Some(prost_types::Timestamp::from(SystemTime::now())),
            version: CURRENT_VERSION,
            payload,
            metadata: HashMap::new(),
        }
    }

    /// Serialize `event` with bitcode and wrap it.
    pub fn wrap<T: Serialize>(
        event_type: impl Into<String>,
        event: &T,
    ) -> Result<Self, bitcode::Error> {
        let payload = bitcode::serialize(event)?;
        Ok(Self::new(event_type, payload))
    }

    /// Add a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Encode to protobuf bytes.
    pub fn encode(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    /// Decode from protobuf bytes.
    ///
    /// Fails on wire errors and on messages without `event_type` or
    /// `event_id`; an empty byte string is therefore not an envelope.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let envelope = <Self as Message>::decode(bytes)?;
        if envelope.event_type.is_empty() {
            return Err(DecodeError::MissingField("event_type"));
        }
        if envelope.event_id.is_empty() {
            return Err(DecodeError::MissingField("event_id"));
        }
        Ok(envelope)
    }

    /// Decode the payload from bitcode.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, DecodeError> {
        Ok(bitcode::deserialize(&self.payload)?)
    }

    pub fn publisher(&self) -> Option<&str> {
        self.metadata.get(METADATA_PUBLISHER).map(String::as_str)
    }

    pub fn payload_type(&self) -> Option<&str> {
        self.metadata.get(METADATA_PAYLOAD_TYPE).map(String::as_str)
    }

    /// Publish time, if present and representable.
    pub fn published_at(&self) -> Option<SystemTime> {
        self.timestamp
            .clone()
            .and_then(|ts| SystemTime::try_from(ts).ok())
    }
}
