use bytes::{Bytes, BytesMut};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;
use uuid::Uuid;

use crate::frame::{FrameCodec, FrameError};

/// Envelope types carried inside every frame payload.
///
/// The wire form is a JSON object tagged by `"type"`:
/// ```json
/// {"type":"request","id":"…","action":"storage.get","payload":{"key":"x"}}
/// {"type":"response","id":"…","payload":{"value":"bar"}}
/// {"type":"event","action":"render","payload":{"root":{…}},"sessionId":"S1"}
/// ```
/// `sessionId` only appears on traffic crossing the manager ⇄ host boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Envelope {
    Request(Request),
    Response(Response),
    Event(Event),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub id: String,
    pub action: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Exactly one of `payload` or `error` is expected, but a response carrying
/// neither resolves to `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub action: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ErrorBody {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// Error codes. The JSON-RPC ones keep their usual meaning.
pub const INVALID_PARAMS: i64 = -32602;
pub const ACTION_NOT_FOUND: i64 = -32601;
pub const INTERNAL_ERROR: i64 = -32603;
pub const CONTEXT_TERMINATED: i64 = -32001;
pub const UNKNOWN_SESSION: i64 = -32002;

// -----------------------------------------------------------------------------
// Helper constructors
// -----------------------------------------------------------------------------
impl Request {
    /// New request with a fresh unique id.
    pub fn new(action: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            action: action.into(),
            payload,
            session_id: None,
        }
    }
}

impl Response {
    pub fn success(id: impl Into<String>, payload: Value) -> Self {
        Self { id: id.into(), payload: Some(payload), error: None, session_id: None }
    }

    pub fn fail(id: impl Into<String>, code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            id: id.into(),
            payload: None,
            error: Some(ErrorBody { code, message: message.into(), data }),
            session_id: None,
        }
    }
}

impl Event {
    pub fn new(action: impl Into<String>, payload: Value) -> Self {
        Self { action: action.into(), payload, session_id: None }
    }
}

impl From<Request> for Envelope {
    fn from(r: Request) -> Self {
        Envelope::Request(r)
    }
}

impl From<Response> for Envelope {
    fn from(r: Response) -> Self {
        Envelope::Response(r)
    }
}

impl From<Event> for Envelope {
    fn from(e: Event) -> Self {
        Envelope::Event(e)
    }
}

impl Envelope {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Envelope::Request(r) => r.session_id.as_deref(),
            Envelope::Response(r) => r.session_id.as_deref(),
            Envelope::Event(e) => e.session_id.as_deref(),
        }
    }

    /// Removes and returns the session tag, leaving the envelope as the
    /// context should see it.
    pub fn take_session_id(&mut self) -> Option<String> {
        match self {
            Envelope::Request(r) => r.session_id.take(),
            Envelope::Response(r) => r.session_id.take(),
            Envelope::Event(e) => e.session_id.take(),
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        let session_id = Some(session_id.into());
        match &mut self {
            Envelope::Request(r) => r.session_id = session_id,
            Envelope::Response(r) => r.session_id = session_id,
            Envelope::Event(e) => e.session_id = session_id,
        }
        self
    }

    /// Action name for requests and events; responses have none.
    pub fn action(&self) -> Option<&str> {
        match self {
            Envelope::Request(r) => Some(&r.action),
            Envelope::Event(e) => Some(&e.action),
            Envelope::Response(_) => None,
        }
    }

    /// Correlation id for requests and responses; events have none.
    pub fn id(&self) -> Option<&str> {
        match self {
            Envelope::Request(r) => Some(&r.id),
            Envelope::Response(r) => Some(&r.id),
            Envelope::Event(_) => None,
        }
    }
}

// -----------------------------------------------------------------------------
// Codec: frames carrying JSON envelopes
// -----------------------------------------------------------------------------

/// Frames whose payload does not decode as an [`Envelope`] are logged and
/// skipped; the length prefix already told us where the next frame starts.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeCodec {
    frames: FrameCodec,
}

impl EnvelopeCodec {
    pub fn new(frames: FrameCodec) -> Self {
        Self { frames }
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>, FrameError> {
        while let Some(frame) = self.frames.decode(src)? {
            match serde_json::from_slice::<Envelope>(&frame) {
                Ok(envelope) => return Ok(Some(envelope)),
                Err(err) => {
                    warn!(len = frame.len(), error = %err, "dropping undecodable frame");
                }
            }
        }
        Ok(None)
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), FrameError> {
        let payload = serde_json::to_vec(&item)?;
        self.frames.encode(Bytes::from(payload), dst)
    }
}
