//! ComfyUI WebSocket message types and parser.
//!
//! ComfyUI sends JSON messages over WebSocket with the shape
//! `{"type": "<kind>", "data": {...}}`. This module deserializes them
//! into a strongly-typed [`ComfyUIMessage`] enum. Tags this parser does
//! not know about decode to [`ComfyUIMessage::Unrecognized`] rather than
//! an error, so protocol additions on the server never look like
//! corruption.

use serde::Deserialize;

/// All ComfyUI WebSocket message types the gateway understands.
#[derive(Debug, Clone)]
pub enum ComfyUIMessage {
    /// Server status broadcast (queue depth, etc.).
    Status(StatusData),

    /// A prompt has started executing.
    ExecutionStart(ExecutionStartData),

    /// Some nodes were skipped because their outputs are cached.
    ExecutionCached(ExecutionCachedData),

    /// A specific node is currently executing (or execution finished when `node` is `None`).
    Executing(ExecutingData),

    /// Progress update from a long-running node (e.g. KSampler).
    Progress(ProgressData),

    /// A node has finished and produced output.
    Executed(ExecutedData),

    /// The whole prompt finished successfully.
    ExecutionSuccess(ExecutionSuccessData),

    /// Execution failed with an error.
    ExecutionError(ErrorData),

    /// Execution was interrupted on the server.
    ExecutionInterrupted(InterruptedData),

    /// A well-formed frame whose `type` tag is not known to this parser.
    Unrecognized {
        kind: String,
        prompt_id: Option<String>,
    },
}

impl ComfyUIMessage {
    /// The job identity carried by the frame, if any.
    ///
    /// Connection-wide telemetry (queue status) carries none.
    pub fn prompt_id(&self) -> Option<&str> {
        match self {
            Self::Status(_) => None,
            Self::ExecutionStart(d) => Some(&d.prompt_id),
            Self::ExecutionCached(d) => Some(&d.prompt_id),
            Self::Executing(d) => d.prompt_id.as_deref(),
            Self::Progress(d) => d.prompt_id.as_deref(),
            Self::Executed(d) => d.prompt_id.as_deref(),
            Self::ExecutionSuccess(d) => Some(&d.prompt_id),
            Self::ExecutionError(d) => Some(&d.prompt_id),
            Self::ExecutionInterrupted(d) => Some(&d.prompt_id),
            Self::Unrecognized { prompt_id, .. } => prompt_id.as_deref(),
        }
    }

    /// Wire tag of the frame.
    pub fn kind(&self) -> &str {
        match self {
            Self::Status(_) => "status",
            Self::ExecutionStart(_) => "execution_start",
            Self::ExecutionCached(_) => "execution_cached",
            Self::Executing(_) => "executing",
            Self::Progress(_) => "progress",
            Self::Executed(_) => "executed",
            Self::ExecutionSuccess(_) => "execution_success",
            Self::ExecutionError(_) => "execution_error",
            Self::ExecutionInterrupted(_) => "execution_interrupted",
            Self::Unrecognized { kind, .. } => kind,
        }
    }
}

/// Queue status information.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusData {
    pub status: QueueStatus,
}

/// Current queue state.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueStatus {
    pub exec_info: ExecInfo,
}

/// Execution queue statistics.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecInfo {
    pub queue_remaining: i32,
}

/// Payload for `execution_start` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionStartData {
    pub prompt_id: String,
}

/// Payload for `execution_cached` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionCachedData {
    pub prompt_id: String,
    /// Node IDs whose outputs were served from cache.
    #[serde(default)]
    pub nodes: Vec<String>,
}

/// Payload for `executing` messages.
///
/// When `node` is `None`, execution of the prompt has completed.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutingData {
    pub node: Option<String>,
    #[serde(default)]
    pub prompt_id: Option<String>,
}

/// Payload for `progress` messages (step-level progress within a node).
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressData {
    /// Current step number.
    pub value: i64,
    /// Total number of steps.
    pub max: i64,
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub prompt_id: Option<String>,
}

/// Payload for `executed` messages (node output).
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutedData {
    /// The node that produced this output.
    pub node: String,
    /// Raw output value (images, filenames, etc.).
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default)]
    pub prompt_id: Option<String>,
}

/// Payload for `execution_success` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionSuccessData {
    pub prompt_id: String,
}

/// Payload for `execution_error` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorData {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub exception_message: String,
    #[serde(default)]
    pub exception_type: String,
}

/// Payload for `execution_interrupted` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct InterruptedData {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
}

/// Outer envelope shared by every frame.
#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// Parse a ComfyUI WebSocket text message into a typed enum.
///
/// Returns `Err` for malformed JSON, a missing `type` tag, or a known
/// tag whose payload does not match its schema. Unknown tags are not
/// errors; they come back as [`ComfyUIMessage::Unrecognized`].
pub fn parse_message(text: &str) -> Result<ComfyUIMessage, serde_json::Error> {
    let Envelope { kind, data } = serde_json::from_str(text)?;

    let msg = match kind.as_str() {
        "status" => ComfyUIMessage::Status(serde_json::from_value(data)?),
        "execution_start" => ComfyUIMessage::ExecutionStart(serde_json::from_value(data)?),
        "execution_cached" => ComfyUIMessage::ExecutionCached(serde_json::from_value(data)?),
        "executing" => ComfyUIMessage::Executing(serde_json::from_value(data)?),
        "progress" => ComfyUIMessage::Progress(serde_json::from_value(data)?),
        "executed" => ComfyUIMessage::Executed(serde_json::from_value(data)?),
        "execution_success" => ComfyUIMessage::ExecutionSuccess(serde_json::from_value(data)?),
        "execution_error" => ComfyUIMessage::ExecutionError(serde_json::from_value(data)?),
        "execution_interrupted" => {
            ComfyUIMessage::ExecutionInterrupted(serde_json::from_value(data)?)
        }
        _ => {
            let prompt_id = data
                .get("prompt_id")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            ComfyUIMessage::Unrecognized { kind, prompt_id }
        }
    };

    Ok(msg)
}
