use serde::Serialize;
use serde_json::{Map, Value};

use super::types::{OutboundMessage, PeerId, PeerInfo};

/// Fields of a `hello` frame, all optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hello {
    pub device_id: Option<String>,
    pub name: Option<String>,
    pub role: Option<String>,
    pub room: Option<String>,
}

/// A negotiation frame (`offer`, `answer` or `ice`) kept verbatim for
/// forwarding.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayFrame {
    pub to: Option<PeerId>,
    body: Map<String, Value>,
}

impl RelayFrame {
    fn from_body(body: Map<String, Value>) -> Self {
        let to = body
            .get("to")
            .and_then(scalar_string)
            .filter(|to| !to.is_empty())
            .map(PeerId::from);
        Self { to, body }
    }

    /// The original frame with the sender's id appended as `from`.
    pub fn forwarded(&self, from: &PeerId) -> OutboundMessage {
        let mut body = self.body.clone();
        body.insert("from".to_string(), Value::String(from.as_str().to_string()));
        OutboundMessage::from(Value::Object(body).to_string())
    }
}

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Hello(Hello),
    Presence { status: Option<String> },
    Offer(RelayFrame),
    Answer(RelayFrame),
    Ice(RelayFrame),
    /// Valid JSON that is not a recognized frame.
    Unknown,
}

impl ClientMessage {
    /// Parse one text frame. Only unparsable JSON is an error; anything else
    /// that is not a known frame becomes `Unknown`.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(body) = value else {
            return Ok(Self::Unknown);
        };

        let kind = body.get("type").and_then(Value::as_str).unwrap_or_default();
        let msg = match kind {
            "hello" => Self::Hello(Hello {
                device_id: body.get("deviceId").and_then(scalar_string),
                name: body.get("name").and_then(scalar_string),
                role: body.get("role").and_then(scalar_string),
                room: body.get("room").and_then(scalar_string),
            }),
            "presence" => Self::Presence {
                status: body.get("status").and_then(Value::as_str).map(str::to_string),
            },
            "offer" => Self::Offer(RelayFrame::from_body(body)),
            "answer" => Self::Answer(RelayFrame::from_body(body)),
            "ice" => Self::Ice(RelayFrame::from_body(body)),
            _ => Self::Unknown,
        };
        Ok(msg)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello(_) => "hello",
            Self::Presence { .. } => "presence",
            Self::Offer(_) => "offer",
            Self::Answer(_) => "answer",
            Self::Ice(_) => "ice",
            Self::Unknown => "unknown",
        }
    }
}

/// Scalars are accepted as text so numeric device ids still work.
fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Messages sent from server to client
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Current membership of the recipient's room
    #[serde(rename = "roster")]
    Roster { list: Vec<PeerInfo> },
}
