//! Named messages exchanged between nodes.
//!
//! A node relays a change to the leader as a request envelope carrying the
//! serialized record; the leader answers with a response envelope whose
//! payload is UTF-8 text, either [`OK`] or a failure description.

use serde::{Deserialize, Serialize};

/// Cache change relayed to the leader.
pub const CACHE_REQUEST: &str = "cache-request";

/// Answer to [`CACHE_REQUEST`].
pub const CACHE_RESPONSE: &str = "cache-response";

/// Membership change relayed to the leader.
pub const MEMBER_REQUEST: &str = "member-request";

/// Answer to [`MEMBER_REQUEST`].
pub const MEMBER_RESPONSE: &str = "member-response";

/// Answer to a request whose name is not recognised.
pub const ERROR_RESPONSE: &str = "error-response";

/// Reply text of a successfully applied change.
pub const OK: &str = "OK";

/// Largest frame accepted on the wire.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// A named message with an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub name: String,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(name: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }

    /// Create a text reply.
    pub fn text(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(name, text.into().into_bytes())
    }

    /// Read the payload as text.
    pub fn as_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Whether this reply reports success.
    pub fn is_ok(&self) -> bool {
        self.payload == OK.as_bytes()
    }
}

/// Encode an envelope to bytes.
pub fn encode_message(msg: &Envelope) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(msg)
}

/// Decode an envelope from bytes.
pub fn decode_message(data: &[u8]) -> Result<Envelope, bincode::Error> {
    bincode::deserialize(data)
}

/// Frame an envelope with length prefix for TCP transmission.
pub fn frame_message(msg: &Envelope) -> Result<Vec<u8>, bincode::Error> {
    let data = encode_message(msg)?;
    let len = data.len() as u32;

    let mut framed = Vec::with_capacity(4 + data.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(&data);

    Ok(framed)
}
