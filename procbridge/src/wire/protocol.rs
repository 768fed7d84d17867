//! Wire types shared by the master and the worker.
//!
//! Every frame carries one [`Envelope`]. Direction is implied by which side
//! wrote it, not by a tag in the payload.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

/// Unframed token the worker must write before anything else on stdout.
pub const PROCESS_ALIVE: &str = "#proc-alive";

/// Sentinel closing every frame. Always preceded by a newline on the wire.
pub const MESSAGE_DELIMITER: &str = "#msg-end";

/// Identifier correlating a request with its response.
///
/// Generated ids are UUID v4 strings, but any string the peer sends back is
/// accepted as-is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub type Query = serde_json::Map<String, serde_json::Value>;

/// One message in either direction.
///
/// Immutable once built: outgoing envelopes come from [`EnvelopeBuilder`],
/// incoming ones from [`Envelope::from_frame`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    query: Option<Query>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<String>,
}

impl Envelope {
    /// Response carrying only an error, for when the normal reply can't be built.
    pub fn error_reply(id: MessageId, error: serde_json::Value) -> Self {
        Self {
            id,
            query: None,
            error: (!error.is_null()).then_some(error),
            data: None,
        }
    }

    /// Parse the text of one complete frame.
    pub fn from_frame(frame: &str) -> Result<Self, BridgeError> {
        serde_json::from_str(frame).map_err(BridgeError::Parse)
    }

    pub fn id(&self) -> &MessageId {
        &self.id
    }

    pub fn query(&self) -> Option<&Query> {
        self.query.as_ref()
    }

    pub fn query_field(&self, key: &str) -> Option<&serde_json::Value> {
        self.query.as_ref().and_then(|q| q.get(key))
    }

    pub fn error(&self) -> Option<&serde_json::Value> {
        self.error.as_ref()
    }

    pub fn data(&self) -> Option<&str> {
        self.data.as_deref()
    }

    /// Decode the pre-serialized `data` payload as JSON.
    ///
    /// Returns `Ok(None)` when there is no payload.
    pub fn json<T: DeserializeOwned>(&self) -> Result<Option<T>, BridgeError> {
        self.data
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(BridgeError::Parse)
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Turn a response carrying an `error` into [`BridgeError::Remote`].
    pub fn into_result(self) -> Result<Self, BridgeError> {
        match self.error {
            Some(error) => Err(BridgeError::Remote(error)),
            None => Ok(self),
        }
    }
}

/// Builder for an outgoing envelope.
///
/// Setters never fail; the first invalid input is remembered and reported by
/// [`EnvelopeBuilder::finish`], so a request-building closure stays a plain
/// sequence of calls.
#[derive(Debug)]
pub struct EnvelopeBuilder {
    envelope: Envelope,
    error: Option<String>,
}

impl EnvelopeBuilder {
    pub fn new(id: MessageId) -> Self {
        Self {
            envelope: Envelope {
                id,
                query: None,
                error: None,
                data: None,
            },
            error: None,
        }
    }

    pub fn id(&self) -> &MessageId {
        &self.envelope.id
    }

    /// Set one query field. The key is trimmed and must not be empty.
    pub fn set_query_field(
        &mut self,
        key: impl AsRef<str>,
        value: impl Into<serde_json::Value>,
    ) -> &mut Self {
        let key = key.as_ref().trim();
        if key.is_empty() {
            self.fail("query key cannot be empty");
            return self;
        }
        self.envelope
            .query
            .get_or_insert_with(Query::new)
            .insert(key.to_string(), value.into());
        self
    }

    pub fn set_payload(&mut self, data: impl Into<String>) -> &mut Self {
        self.envelope.data = Some(data.into());
        self
    }

    /// Serialize `value` into the `data` field. A value serializing to
    /// `null` leaves `data` absent.
    pub fn set_json_payload<T: Serialize + ?Sized>(&mut self, value: &T) -> &mut Self {
        match serde_json::to_string(value) {
            Ok(data) => self.envelope.data = (data != "null").then_some(data),
            Err(e) => self.fail(format!("payload is not serializable: {e}")),
        }
        self
    }

    /// Attach an error. `null` clears it.
    pub fn set_error(&mut self, error: impl Into<serde_json::Value>) -> &mut Self {
        self.envelope.error = match error.into() {
            serde_json::Value::Null => None,
            value => Some(value),
        };
        self
    }

    pub fn finish(self) -> Result<Envelope, BridgeError> {
        match self.error {
            Some(reason) => Err(BridgeError::InvalidRequest(reason)),
            None => Ok(self.envelope),
        }
    }

    fn fail(&mut self, reason: impl Into<String>) {
        if self.error.is_none() {
            self.error = Some(reason.into());
        }
    }
}
