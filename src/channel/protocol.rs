//! Frames exchanged with the inference WebSocket server.

use serde::{Deserialize, Serialize};

use crate::error::{LlamadError, Result};

/// Client → server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientFrame {
    Prompt {
        prompt: String,
        #[serde(rename = "promptId")]
        prompt_id: String,
    },
    Cancel {
        #[serde(rename = "promptId")]
        prompt_id: String,
    },
    ClearMemory,
}

impl ClientFrame {
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| LlamadError::Channel(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Started,
    Canceled,
    MemoryCleared,
}

/// Server → client, after discriminating the loosely-typed wire object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    /// Greeting sent right after the socket opens.
    Hello { session_id: Option<String> },
    Token { prompt_id: String, token: String },
    Complete { prompt_id: Option<String> },
    Error {
        prompt_id: Option<String>,
        error: String,
    },
    Status {
        status: StatusKind,
        prompt_id: Option<String>,
        session_id: Option<String>,
    },
}

#[derive(Debug, Default, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(rename = "promptId")]
    prompt_id: Option<String>,
    token: Option<String>,
    complete: Option<bool>,
    error: Option<String>,
    status: Option<String>,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

fn status_kind(value: &str) -> Option<StatusKind> {
    match value {
        "started" => Some(StatusKind::Started),
        "canceled" | "cancelled" => Some(StatusKind::Canceled),
        "memory_cleared" | "history_cleared" => Some(StatusKind::MemoryCleared),
        _ => None,
    }
}

/// Decode one text frame.
///
/// `complete: true` wins over any `type` tag. Status frames are recognised
/// by their `status` field or by a `started` / `memory_cleared` type tag.
pub fn decode(text: &str) -> Result<ServerFrame> {
    let raw: RawFrame =
        serde_json::from_str(text).map_err(|e| LlamadError::ProtocolDecode(e.to_string()))?;

    if raw.complete == Some(true) {
        return Ok(ServerFrame::Complete {
            prompt_id: raw.prompt_id,
        });
    }

    match raw.kind.as_deref() {
        Some("token") => match (raw.prompt_id, raw.token) {
            (Some(prompt_id), Some(token)) => Ok(ServerFrame::Token { prompt_id, token }),
            _ => Err(LlamadError::ProtocolDecode(
                "token frame without promptId or token".to_string(),
            )),
        },
        Some("error") => Ok(ServerFrame::Error {
            prompt_id: raw.prompt_id,
            error: raw.error.unwrap_or_else(|| "unknown error".to_string()),
        }),
        Some("ready") => Ok(ServerFrame::Hello {
            session_id: raw.session_id,
        }),
        kind => {
            let status = raw
                .status
                .as_deref()
                .and_then(status_kind)
                .or_else(|| kind.and_then(status_kind));
            match status {
                Some(status) => Ok(ServerFrame::Status {
                    status,
                    prompt_id: raw.prompt_id,
                    session_id: raw.session_id,
                }),
                None => Err(LlamadError::ProtocolDecode(format!(
                    "unrecognised frame (type {kind:?}, status {:?})",
                    raw.status
                ))),
            }
        }
    }
}
