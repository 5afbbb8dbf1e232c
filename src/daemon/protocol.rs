//! askd wire protocol
//!
//! Newline-delimited JSON over a loopback TCP socket: one request line, one
//! response line per connection.
//!
//! - Each message is one line
//! - UTF-8 encoded
//! - Messages carry a `"type"` field of the form `<prefix>.<kind>`, where the
//!   prefix belongs to the provider (`cask` for codex, `gask` for gemini, ...)
//!
//! ```text
//! → {"type":"cask.request","v":1,"id":"c1","token":"…","work_dir":"/src/app","timeout_s":60.0,"quiet":false,"message":"hi"}
//! ← {"type":"cask.response","v":1,"id":"c1","req_id":"9f1c…","exit_code":0,"reply":"hello","meta":{"session_key":"codex:…","done_seen":true,"done_ms":1830}}
//! ```

use crate::daemon::worker::TaskResult;
use crate::error::{AskError, ErrorReport};
use crate::provider::ProviderSpec;
use serde::{Deserialize, Serialize};
use std::io::{self, BufRead};

/// Wire protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum request/response line (10MB to prevent memory exhaustion)
pub const MAX_LINE_BYTES: usize = 10 * 1024 * 1024;

fn protocol_version() -> u32 {
    PROTOCOL_VERSION
}

fn unbounded() -> f64 {
    -1.0
}

/// Client → daemon message (request, ping or shutdown)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "protocol_version")]
    pub v: u32,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,
    /// Seconds; negative means no deadline
    #[serde(default = "unbounded")]
    pub timeout_s: f64,
    #[serde(default)]
    pub quiet: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    /// Agents already delegating, outermost first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delegation_chain: Vec<String>,
}

impl RpcRequest {
    fn control(kind: String, id: &str, token: &str) -> Self {
        Self {
            kind,
            v: PROTOCOL_VERSION,
            id: id.to_string(),
            token: token.to_string(),
            work_dir: None,
            timeout_s: unbounded(),
            quiet: false,
            message: String::new(),
            output_path: None,
            delegation_chain: Vec::new(),
        }
    }

    pub fn ask(
        spec: &ProviderSpec,
        id: &str,
        token: &str,
        work_dir: &str,
        message: &str,
        timeout_s: f64,
        quiet: bool,
    ) -> Self {
        Self {
            work_dir: Some(work_dir.to_string()),
            timeout_s,
            quiet,
            message: message.to_string(),
            ..Self::control(spec.request_type(), id, token)
        }
    }

    pub fn ping(spec: &ProviderSpec, id: &str, token: &str) -> Self {
        Self::control(spec.ping_type(), id, token)
    }

    pub fn shutdown(spec: &ProviderSpec, id: &str, token: &str) -> Self {
        Self::control(spec.shutdown_type(), id, token)
    }
}

/// Completion metadata attached to every response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseMeta {
    #[serde(default)]
    pub session_key: Option<String>,
    #[serde(default)]
    pub done_seen: bool,
    #[serde(default)]
    pub done_ms: Option<u64>,
}

/// Daemon → client message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "protocol_version")]
    pub v: u32,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub req_id: Option<String>,
    pub exit_code: i32,
    #[serde(default)]
    pub reply: String,
    #[serde(default)]
    pub meta: ResponseMeta,
    /// `"<ERROR_CODE>: <message>"` when the daemon could not serve the request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    pub fn from_result(spec: &ProviderSpec, id: &str, result: TaskResult) -> Self {
        Self {
            kind: spec.response_type(),
            v: PROTOCOL_VERSION,
            id: id.to_string(),
            req_id: Some(result.req_id),
            exit_code: result.exit_code,
            reply: result.reply,
            meta: ResponseMeta {
                session_key: Some(result.session_key),
                done_seen: result.done_seen,
                done_ms: result.done_ms,
            },
            error: None,
        }
    }

    pub fn error(spec: &ProviderSpec, id: &str, err: &AskError) -> Self {
        Self::error_report(spec, id, &ErrorReport::from(err))
    }

    pub fn error_report(spec: &ProviderSpec, id: &str, report: &ErrorReport) -> Self {
        Self {
            kind: spec.response_type(),
            v: PROTOCOL_VERSION,
            id: id.to_string(),
            req_id: None,
            exit_code: report.exit_code,
            reply: String::new(),
            meta: ResponseMeta::default(),
            error: Some(report.to_text()),
        }
    }

    pub fn pong(spec: &ProviderSpec, id: &str) -> Self {
        Self {
            kind: spec.pong_type(),
            v: PROTOCOL_VERSION,
            id: id.to_string(),
            req_id: None,
            exit_code: 0,
            reply: "pong".to_string(),
            meta: ResponseMeta::default(),
            error: None,
        }
    }

    /// Acknowledgement of a control message
    pub fn ack(spec: &ProviderSpec, id: &str, reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            kind: spec.response_type(),
            ..Self::pong(spec, id)
        }
    }
}

/// Encode a message to JSONL format (single line with newline)
pub fn encode_jsonl<T: Serialize>(message: &T) -> io::Result<String> {
    let json = serde_json::to_string(message)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(format!("{}\n", json))
}

/// Decode a message from a JSONL line
pub fn decode_jsonl<T: for<'de> Deserialize<'de>>(line: &str) -> io::Result<T> {
    serde_json::from_str(line.trim())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Read one line, refusing lines longer than `max` bytes.
///
/// Returns `Ok(None)` at EOF before any byte was read.
pub fn read_line_limited<R: BufRead>(reader: &mut R, max: usize) -> io::Result<Option<String>> {
    let mut buf = Vec::new();
    loop {
        let available = reader.fill_buf()?;
        if available.is_empty() {
            break;
        }
        let (chunk, found) = match available.iter().position(|&b| b == b'\n') {
            Some(pos) => (&available[..=pos], true),
            None => (available, false),
        };
        if buf.len() + chunk.len() > max {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Message too large: more than {} bytes", max),
            ));
        }
        buf.extend_from_slice(chunk);
        let consumed = chunk.len();
        reader.consume(consumed);
        if found {
            break;
        }
    }

    if buf.is_empty() {
        return Ok(None);
    }
    String::from_utf8(buf)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
