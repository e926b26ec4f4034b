//! Turns one job's raw ComfyUI frames into status lines and a terminal
//! signal.
//!
//! [`ProgressNormalizer`] is a pull-based state machine:
//!
//! ```text
//! CONNECTING -> STREAMING -> (RECONNECTING -> STREAMING)* -> SUCCEEDED | FAILED
//! ```
//!
//! Each call to [`ProgressNormalizer::next_event`] reads frames until it
//! has something to report. Lines come out in wire order. A dropped
//! connection is reopened under the same client id without restarting
//! the job, and the job's recorded history is checked after every
//! reconnect so a success sent during the outage is not lost.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::StreamExt;
use sds_comfyui::api::ComfyUIApiError;
use sds_comfyui::backend::JobBackend;
use sds_comfyui::client::{FrameStream, StreamError};
use sds_comfyui::messages::{parse_message, ComfyUIMessage};
use sds_comfyui::reconnect::{reconnect_loop, ReconnectBudget, ReconnectError};
use tokio_util::sync::CancellationToken;

use crate::config::NormalizerConfig;

/// What the normalizer reports to its consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizedEvent {
    /// A human-readable status line.
    Line(String),
    /// The job finished successfully. Always the last event.
    Succeeded,
    /// The job cannot succeed. Always the last event.
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizerState {
    Connecting,
    Streaming,
    Reconnecting,
    Succeeded,
    Failed,
}

impl NormalizerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

pub const LINE_STARTED: &str = "Generation started.";
pub const LINE_COMPLETE: &str = "Generation complete.";
pub const LINE_INTERRUPTED: &str = "Generation interrupted.";

/// Progress producer scoped to a single job.
pub struct ProgressNormalizer {
    backend: Arc<dyn JobBackend>,
    client_id: String,
    prompt_id: String,
    config: NormalizerConfig,
    state: NormalizerState,
    stream: Option<FrameStream>,
    budget: ReconnectBudget,
    pending: VecDeque<NormalizedEvent>,
    /// Unrecognized frames tagged with this job's id.
    unrecognized: u32,
    cancel: CancellationToken,
}

enum Read {
    Cancelled,
    Frame(Option<Result<String, StreamError>>),
}

impl ProgressNormalizer {
    /// Track `prompt_id` on streams opened under `client_id`.
    ///
    /// Pass the stream that was open while the job was submitted, if
    /// any; without one the normalizer starts in `Connecting`.
    pub fn new(
        backend: Arc<dyn JobBackend>,
        client_id: impl Into<String>,
        prompt_id: impl Into<String>,
        stream: Option<FrameStream>,
        config: NormalizerConfig,
        cancel: CancellationToken,
    ) -> Self {
        let state = if stream.is_some() {
            NormalizerState::Streaming
        } else {
            NormalizerState::Connecting
        };
        let budget = ReconnectBudget::new(&config.reconnect);

        Self {
            backend,
            client_id: client_id.into(),
            prompt_id: prompt_id.into(),
            config,
            state,
            stream,
            budget,
            pending: VecDeque::new(),
            unrecognized: 0,
            cancel,
        }
    }

    pub fn state(&self) -> NormalizerState {
        self.state
    }

    pub fn prompt_id(&self) -> &str {
        &self.prompt_id
    }

    /// Pull the next event. Returns `None` once the terminal event has
    /// been delivered.
    pub async fn next_event(&mut self) -> Option<NormalizedEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }

            if self.state.is_terminal() {
                return None;
            }
            match self.state {
                NormalizerState::Connecting | NormalizerState::Reconnecting => {
                    self.reconnect().await
                }
                _ => self.read_frame().await,
            }
        }
    }

    // ---- state handlers ----

    async fn reconnect(&mut self) {
        let result = reconnect_loop(
            self.backend.as_ref(),
            &self.client_id,
            &self.config.reconnect,
            &mut self.budget,
            &self.cancel,
        )
        .await;

        match result {
            Ok(stream) => {
                self.stream = Some(stream);
                self.state = NormalizerState::Streaming;
                self.check_recorded_outcome().await;
            }
            Err(ReconnectError::Cancelled) => self.fail("Cancelled".to_string()),
            Err(e @ ReconnectError::Exhausted { .. }) => {
                tracing::error!(prompt_id = %self.prompt_id, error = %e, "Giving up on progress stream");
                self.fail(format!("Progress stream ended without success: {e}"));
            }
        }
    }

    /// After (re)connecting, look at what the backend already recorded
    /// for the job. Frames sent while no socket was open are gone, so a
    /// finished job would otherwise never be noticed.
    async fn check_recorded_outcome(&mut self) {
        let lookup = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            lookup = self.backend.fetch_result_metadata(&self.prompt_id) => Some(lookup),
        };
        let Some(lookup) = lookup else {
            self.fail("Cancelled".to_string());
            return;
        };

        match lookup {
            Ok(history) if history.succeeded() => {
                tracing::info!(prompt_id = %self.prompt_id, "Job finished while disconnected");
                self.succeed();
            }
            Ok(history) if history.failed() => {
                self.fail_with_line(
                    "Generation failed on the backend while disconnected.".to_string(),
                    "Backend recorded the job as failed".to_string(),
                );
            }
            Ok(_) | Err(ComfyUIApiError::NotFound(_)) => {}
            Err(e) => {
                tracing::warn!(prompt_id = %self.prompt_id, error = %e, "Could not check job history after reconnect");
            }
        }
    }

    async fn read_frame(&mut self) {
        let read = match self.stream.as_mut() {
            Some(stream) => {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Read::Cancelled,
                    item = stream.next() => Read::Frame(item),
                }
            }
            None => Read::Frame(None),
        };

        match read {
            Read::Cancelled => self.fail("Cancelled".to_string()),
            Read::Frame(Some(Ok(text))) => {
                self.budget.reset();
                self.handle_text(&text);
            }
            Read::Frame(Some(Err(StreamError::Malformed(e)))) => {
                self.budget.reset();
                tracing::warn!(prompt_id = %self.prompt_id, error = %e, "Skipping unreadable frame");
            }
            Read::Frame(Some(Err(StreamError::Closed(e)))) => self.connection_lost(&e),
            Read::Frame(None) => self.connection_lost("stream ended"),
            Read::Frame(Some(Err(StreamError::Fatal(e)))) => {
                self.fail_with_line(format!("Error processing message: {e}"), e);
            }
        }
    }

    fn connection_lost(&mut self, reason: &str) {
        tracing::warn!(
            prompt_id = %self.prompt_id,
            client_id = %self.client_id,
            reason,
            "Progress stream dropped, reconnecting",
        );
        self.stream = None;
        self.state = NormalizerState::Reconnecting;
    }

    // ---- frame classification ----

    fn handle_text(&mut self, text: &str) {
        let msg = match parse_message(text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(
                    prompt_id = %self.prompt_id,
                    error = %e,
                    raw_message = %text,
                    "Failed to parse ComfyUI message",
                );
                return;
            }
        };

        if let Some(id) = msg.prompt_id() {
            if id != self.prompt_id {
                tracing::trace!(prompt_id = %self.prompt_id, other = %id, kind = msg.kind(), "Ignoring frame for another job");
                return;
            }
        }

        match msg {
            ComfyUIMessage::Status(data) => self.line(format!(
                "Queue remaining: {}",
                data.status.exec_info.queue_remaining
            )),
            ComfyUIMessage::ExecutionStart(_) => self.line(LINE_STARTED.to_string()),
            ComfyUIMessage::ExecutionCached(data) => {
                self.line(format!("Cached nodes: {}", data.nodes.join(", ")))
            }
            ComfyUIMessage::Executing(data) => match data.node {
                Some(node) => self.line(format!("Executing node: {node}")),
                None => self.line("Finished executing nodes.".to_string()),
            },
            ComfyUIMessage::Progress(data) => match data.node {
                Some(node) => self.line(format!("Progress: {}/{} (node {node})", data.value, data.max)),
                None => self.line(format!("Progress: {}/{}", data.value, data.max)),
            },
            ComfyUIMessage::Executed(data) => self.line(format!("Executed node: {}", data.node)),
            ComfyUIMessage::ExecutionSuccess(_) => {
                tracing::info!(prompt_id = %self.prompt_id, "Execution succeeded");
                self.succeed();
            }
            ComfyUIMessage::ExecutionError(data) => {
                let node = data.node_id.as_deref().unwrap_or("?");
                tracing::error!(
                    prompt_id = %self.prompt_id,
                    node_id = %node,
                    error_type = %data.exception_type,
                    error_message = %data.exception_message,
                    "Execution error",
                );
                self.fail_with_line(
                    format!(
                        "Error on node {node} ({}): {}",
                        data.exception_type, data.exception_message
                    ),
                    format!("Backend error on node {node}: {}", data.exception_message),
                );
            }
            ComfyUIMessage::ExecutionInterrupted(_) => {
                self.fail_with_line(
                    LINE_INTERRUPTED.to_string(),
                    "Execution was interrupted on the backend".to_string(),
                );
            }
            ComfyUIMessage::Unrecognized { kind, prompt_id: None } => {
                // Connection-wide broadcast (e.g. system monitors).
                tracing::debug!(prompt_id = %self.prompt_id, kind = %kind, "Unrecognized broadcast frame");
            }
            ComfyUIMessage::Unrecognized { kind, prompt_id: Some(_) } => self.unrecognized(kind),
        }
    }

    fn unrecognized(&mut self, kind: String) {
        self.unrecognized += 1;
        tracing::warn!(
            prompt_id = %self.prompt_id,
            kind = %kind,
            count = self.unrecognized,
            "Unrecognized ComfyUI frame",
        );

        if let Some(limit) = self.config.unrecognized_frame_limit {
            if self.unrecognized >= limit {
                self.fail_with_line(
                    format!("Too many unrecognized frames ({}), last was {kind}.", self.unrecognized),
                    format!("Backend protocol drift: {} unrecognized frames", self.unrecognized),
                );
            }
        }
    }

    // ---- emission ----

    fn line(&mut self, line: String) {
        tracing::debug!(prompt_id = %self.prompt_id, line = %line, "Progress");
        self.pending.push_back(NormalizedEvent::Line(line));
    }

    fn succeed(&mut self) {
        self.line(LINE_COMPLETE.to_string());
        self.pending.push_back(NormalizedEvent::Succeeded);
        self.state = NormalizerState::Succeeded;
        self.stream = None;
    }

    fn fail(&mut self, reason: String) {
        self.pending.push_back(NormalizedEvent::Failed(reason));
        self.state = NormalizerState::Failed;
        self.stream = None;
    }

    fn fail_with_line(&mut self, line: String, reason: String) {
        self.line(line);
        self.fail(reason);
    }
}
