//! Terminal wire messages (JSON text frames).

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Control message from the browser.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Resize { rows: u32, cols: u32 },
    Input { data: String },
}

/// What an inbound text frame asks for.
#[derive(Debug, PartialEq, Eq)]
pub enum ClientFrame {
    Control(ClientMessage),
    /// Legacy clients send keystrokes as plain text.
    Raw(Vec<u8>),
    /// Looked like a control message but was not one.
    Invalid(String),
}

impl ClientFrame {
    pub fn parse(text: &str) -> Self {
        if !text.trim_start().starts_with('{') {
            return ClientFrame::Raw(text.as_bytes().to_vec());
        }
        match serde_json::from_str::<serde_json::Value>(text) {
            // Valid JSON, but is it one of ours?
            Ok(value) => match serde_json::from_value::<ClientMessage>(value) {
                Ok(message) => ClientFrame::Control(message),
                Err(e) => ClientFrame::Invalid(e.to_string()),
            },
            Err(_) => ClientFrame::Raw(text.as_bytes().to_vec()),
        }
    }
}

/// Message to the browser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Connected { host: String, username: String },
    Output { data: String },
    Error { message: String },
    Disconnected,
}

impl ServerMessage {
    /// Wrap remote output bytes.
    pub fn output(bytes: &[u8]) -> Self {
        ServerMessage::Output {
            data: STANDARD.encode(bytes),
        }
    }

    pub fn to_json(&self) -> String {
        // Plain enum of strings: serialisation cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}
