//! Envelope: the unit exchanged over a transport.
//!
//! An envelope that carries a `name` is a call; one without is a reply to the
//! call sharing its `id`. The payload is an opaque JSON value.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::EnvelopeError;

/// Integer correlating a call with its reply.
pub type CallId = u64;

/// Never allocated and never accepted from a peer, so a counter that has
/// seen every other id can still be one past it.
pub const RESERVED_ID: CallId = CallId::MAX;

/// Identity of one correlation endpoint, used only for log correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(pub Uuid);

impl PeerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // First block of the UUID is plenty to tell two peers apart in logs.
        let full = self.0.to_string();
        write!(f, "{}", &full[..8])
    }
}

/// The wire unit: `{ "id": <integer>, "data": <any>, "name": <string, optional> }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Caller-assigned id; a reply repeats the id of the call it answers.
    pub id: CallId,

    /// Opaque payload, passed through untouched.
    #[serde(default)]
    pub data: Value,

    /// Handler name. Present on calls, absent on replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// What an envelope claims to be, judged only by its shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Call,
    Reply,
}

impl Envelope {
    /// Build a call envelope.
    pub fn call(id: CallId, name: impl Into<String>, data: Value) -> Self {
        Self {
            id,
            data,
            name: Some(name.into()),
        }
    }

    /// Build a reply envelope for the call `id`.
    pub fn reply(id: CallId, data: Value) -> Self {
        Self {
            id,
            data,
            name: None,
        }
    }

    pub fn kind(&self) -> EnvelopeKind {
        if self.name.is_some() {
            EnvelopeKind::Call
        } else {
            EnvelopeKind::Reply
        }
    }

    pub fn is_call(&self) -> bool {
        self.kind() == EnvelopeKind::Call
    }

    /// Validate and decode a raw JSON value received from a transport.
    ///
    /// A value without an `id` is rejected rather than guessed at, as is
    /// [`RESERVED_ID`]. An empty `name` is treated the same as a missing one.
    pub fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        let Some(object) = value.as_object() else {
            return Err(EnvelopeError::NotAnObject);
        };

        match object.get("id") {
            None | Some(Value::Null) => return Err(EnvelopeError::MissingId),
            Some(_) => {}
        }

        let mut envelope: Envelope =
            serde_json::from_value(value).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;

        if envelope.id == RESERVED_ID {
            return Err(EnvelopeError::Malformed(format!(
                "id {RESERVED_ID} is reserved"
            )));
        }

        if envelope.name.as_deref() == Some("") {
            envelope.name = None;
        }

        Ok(envelope)
    }

    /// Decode an envelope from JSON text.
    pub fn from_json(text: &str) -> Result<Self, EnvelopeError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        Self::from_value(value)
    }

    /// Encode as a JSON value.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}
