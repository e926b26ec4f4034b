//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps the ComfyUI HTTP API (workflow submission, history retrieval,
//! output download, image upload) using [`reqwest`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// HTTP client for a single ComfyUI instance.
#[derive(Clone)]
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
}

/// Response returned by the ComfyUI `/prompt` endpoint after
/// successfully queuing a workflow.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued prompt.
    pub prompt_id: String,
    /// Position in the execution queue.
    #[serde(default)]
    pub number: i64,
    /// Per-node validation problems reported alongside a queued prompt.
    #[serde(default)]
    pub node_errors: serde_json::Value,
}

/// Result metadata recorded by ComfyUI for one prompt.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryEntry {
    /// Raw per-node outputs, keyed by node id.
    #[serde(default)]
    pub outputs: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub status: Option<HistoryStatus>,
}

/// Execution status block of a [`HistoryEntry`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryStatus {
    /// `"success"` or `"error"`.
    #[serde(default)]
    pub status_str: String,
    #[serde(default)]
    pub completed: bool,
}

impl HistoryEntry {
    /// Output value of a single node, if it produced one.
    pub fn output(&self, node_id: &str) -> Option<&serde_json::Value> {
        self.outputs.get(node_id)
    }

    /// `true` when the backend recorded a finished, successful run.
    pub fn succeeded(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.completed && s.status_str == "success")
    }

    /// `true` when the backend recorded the run as failed.
    pub fn failed(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.status_str == "error")
    }
}

/// Location of one output file on the ComfyUI server, as accepted by
/// `GET /view`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    /// Storage area: `output`, `input` or `temp`.
    #[serde(rename = "type", default = "default_output_kind")]
    pub kind: String,
}

fn default_output_kind() -> String {
    "output".to_string()
}

/// Response of `POST /upload/image`.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadedImage {
    /// Name to reference in a workflow's image loader node.
    pub name: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// ComfyUI returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// The response body did not match the expected schema.
    #[error("Unexpected response shape: {0}")]
    Decode(#[from] serde_json::Error),

    /// ComfyUI has no history record for the prompt.
    #[error("No history recorded for prompt {0}")]
    NotFound(String),
}

impl ComfyUIApi {
    /// Create a new API client for a ComfyUI instance.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://host:8188`.
    pub fn new(api_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
        }
    }

    /// HTTP API base URL.
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Submit a workflow for execution.
    ///
    /// Sends a `POST /prompt` request with the given workflow JSON and
    /// client ID.  Returns the server-assigned `prompt_id` and queue
    /// position.
    pub async fn submit_workflow(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });

        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .json(&body)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Retrieve execution history for a specific prompt.
    ///
    /// Sends a `GET /history/{prompt_id}` request. ComfyUI answers with
    /// an empty object until the prompt has finished, which maps to
    /// [`ComfyUIApiError::NotFound`].
    pub async fn get_history(&self, prompt_id: &str) -> Result<HistoryEntry, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/history/{}", self.api_url, prompt_id))
            .send()
            .await?;

        let body: serde_json::Value = Self::parse_response(response).await?;
        history_entry(prompt_id, body)
    }

    /// Download the raw bytes of an output file via `GET /view`.
    pub async fn view(&self, file: &OutputFile) -> Result<Vec<u8>, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/view", self.api_url))
            .query(&[
                ("filename", file.filename.as_str()),
                ("subfolder", file.subfolder.as_str()),
                ("type", file.kind.as_str()),
            ])
            .send()
            .await?;

        let response = Self::ensure_success(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    /// Upload an input image via `POST /upload/image`.
    ///
    /// The file is named after the SHA-256 digest of its contents so that
    /// re-uploading the same image does not create duplicates on the
    /// server.
    pub async fn upload_image(
        &self,
        bytes: Vec<u8>,
        extension: &str,
        mime: &str,
    ) -> Result<UploadedImage, ComfyUIApiError> {
        let filename = content_filename(&bytes, extension);
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(filename)
            .mime_str(mime)?;
        let form = reqwest::multipart::Form::new()
            .part("image", part)
            .text("type", "input")
            .text("overwrite", "false");

        let response = self
            .client
            .post(format!("{}/upload/image", self.api_url))
            .multipart(form)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`ComfyUIApiError::ApiError`]
    /// containing the status and body text on failure.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ComfyUIApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ComfyUIApiError> {
        let response = Self::ensure_success(response).await?;
        let text = response.text().await?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Pick the entry for `prompt_id` out of a `/history/{id}` response body.
pub fn history_entry(
    prompt_id: &str,
    mut body: serde_json::Value,
) -> Result<HistoryEntry, ComfyUIApiError> {
    match body.get_mut(prompt_id).map(serde_json::Value::take) {
        Some(entry) => Ok(serde_json::from_value(entry)?),
        None => Err(ComfyUIApiError::NotFound(prompt_id.to_string())),
    }
}

/// Content-addressed file name: `<sha256 hex>.<extension>`.
pub fn content_filename(bytes: &[u8], extension: &str) -> String {
    let digest = Sha256::digest(bytes);
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("{hex}.{}", extension.trim_start_matches('.'))
}
