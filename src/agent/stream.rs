//! The streaming-JSON protocol consumed from agent CLIs.
//!
//! Agents emit newline-delimited JSON on stdout, one record per line. The
//! orchestrator never interprets agent output semantically; it recognizes a
//! handful of record types for progress reporting and guard enforcement and
//! keeps everything else verbatim for the response buffer. Unparseable
//! lines are plain text, never an error.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct StreamRecord {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub content: Option<String>,
    pub result: Option<String>,
    #[serde(alias = "tool", alias = "name")]
    pub tool_name: Option<String>,
    pub tool_input: Option<serde_json::Value>,
}

/// One stdout line, classified for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// `assistant` / `text` records: response prose.
    Assistant(String),
    /// `tool_use` records: checked against the permission guard.
    ToolUse { name: String, input: String },
    /// `result` records: final output chunk.
    ResultChunk(String),
    /// `input_needed` records: the agent wants an out-of-band answer.
    InputRequest(String),
    /// Valid JSON of an unrecognized type; the raw line is kept.
    Other(String),
    /// Not JSON at all; treated as plain response text.
    Plain(String),
}

impl StreamEvent {
    /// The text this event contributes to the accumulated response.
    pub fn response_text(&self) -> &str {
        match self {
            StreamEvent::Assistant(text)
            | StreamEvent::ResultChunk(text)
            | StreamEvent::Other(text)
            | StreamEvent::Plain(text) => text,
            StreamEvent::ToolUse { .. } | StreamEvent::InputRequest(_) => "",
        }
    }
}

/// Classify one stdout line.
pub fn classify_line(line: &str) -> StreamEvent {
    let record: StreamRecord = match serde_json::from_str(line) {
        Ok(record) => record,
        Err(_) => return StreamEvent::Plain(line.to_string()),
    };

    match record.kind.as_deref() {
        Some("assistant") | Some("text") => {
            StreamEvent::Assistant(record.content.unwrap_or_default())
        }
        Some("tool_use") => StreamEvent::ToolUse {
            name: record.tool_name.unwrap_or_else(|| "tool".to_string()),
            input: tool_input_text(record.tool_input),
        },
        Some("result") => StreamEvent::ResultChunk(record.result.unwrap_or_default()),
        Some("input_needed") => StreamEvent::InputRequest(record.content.unwrap_or_default()),
        _ => StreamEvent::Other(line.to_string()),
    }
}

/// Flatten a tool_use payload to the text the guard inspects. String
/// payloads are taken verbatim; structured payloads have their string
/// leaves joined so embedded commands stay visible.
fn tool_input_text(input: Option<serde_json::Value>) -> String {
    fn collect(value: &serde_json::Value, out: &mut Vec<String>) {
        match value {
            serde_json::Value::String(s) => out.push(s.clone()),
            serde_json::Value::Array(items) => {
                for item in items {
                    collect(item, out);
                }
            }
            serde_json::Value::Object(map) => {
                for item in map.values() {
                    collect(item, out);
                }
            }
            _ => {}
        }
    }

    match input {
        None => String::new(),
        Some(serde_json::Value::String(s)) => s,
        Some(value) => {
            let mut parts = Vec::new();
            collect(&value, &mut parts);
            parts.join(" ")
        }
    }
}
