//! JSON control messages carried in WebSocket text frames.
//!
//! Binary frames are raw terminal bytes and never pass through this module.
//! Text frames from the client carry a `type` discriminator; anything that
//! does not decode into a known variant is dropped by the caller.

use crate::error::TermResult;
use serde::{Deserialize, Serialize};

/// Client → server control message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Explicit keystroke/paste payload, written to the PTY like a binary frame.
    Input { data: String },
    /// New terminal geometry.
    Resize { rows: u16, cols: u16 },
}

impl ClientMessage {
    /// Decode a text frame.
    pub fn parse(text: &str) -> TermResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Server → client control message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Setup failure, sent once before the connection is dropped.
    Error { message: String },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    /// Encode as the JSON text of a frame.
    pub fn to_json(&self) -> TermResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}
