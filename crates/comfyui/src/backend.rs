//! The [`JobBackend`] seam over a remote job-execution server.
//!
//! Consumers (the progress normalizer and generation tasks) only see
//! this trait. [`ComfyUIBackend`] is the production implementation
//! combining the REST ([`ComfyUIApi`]) and WebSocket ([`ComfyUIClient`])
//! channels of one ComfyUI instance.

use async_trait::async_trait;

use crate::api::{ComfyUIApi, ComfyUIApiError, HistoryEntry, OutputFile, SubmitResponse, UploadedImage};
use crate::client::{ComfyUIClient, ComfyUIClientError, FrameStream};

/// Control and streaming channels of a remote job backend.
#[async_trait]
pub trait JobBackend: Send + Sync {
    /// Queue a filled workflow under `client_id`.
    async fn submit(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError>;

    /// Open an independent streaming connection for `client_id`.
    ///
    /// Frames for every job submitted under the same ID arrive on it.
    async fn open_stream(&self, client_id: &str) -> Result<FrameStream, ComfyUIClientError>;

    /// Output locations recorded against a finished job.
    ///
    /// Fails with [`ComfyUIApiError::NotFound`] while the backend has no
    /// record of the job.
    async fn fetch_result_metadata(&self, prompt_id: &str) -> Result<HistoryEntry, ComfyUIApiError>;

    /// Raw bytes of one output file.
    async fn fetch_result_bytes(&self, file: &OutputFile) -> Result<Vec<u8>, ComfyUIApiError>;

    /// Store an input image on the backend for a workflow to reference.
    async fn upload_image(
        &self,
        bytes: Vec<u8>,
        extension: &str,
        mime: &str,
    ) -> Result<UploadedImage, ComfyUIApiError>;
}

/// A ComfyUI instance reached over HTTP and WebSocket.
#[derive(Clone)]
pub struct ComfyUIBackend {
    api: ComfyUIApi,
    client: ComfyUIClient,
}

impl ComfyUIBackend {
    /// * `api_url` - HTTP base URL, e.g. `http://host:8188`.
    /// * `ws_url`  - WebSocket base URL, e.g. `ws://host:8188`.
    pub fn new(api_url: String, ws_url: String) -> Self {
        Self {
            api: ComfyUIApi::new(api_url),
            client: ComfyUIClient::new(ws_url),
        }
    }
}

#[async_trait]
impl JobBackend for ComfyUIBackend {
    async fn submit(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let response = self.api.submit_workflow(workflow, client_id).await?;
        tracing::info!(
            client_id = %client_id,
            prompt_id = %response.prompt_id,
            queue_number = response.number,
            "Workflow submitted to ComfyUI",
        );
        Ok(response)
    }

    async fn open_stream(&self, client_id: &str) -> Result<FrameStream, ComfyUIClientError> {
        Ok(self.client.connect(client_id).await?.into_frames())
    }

    async fn fetch_result_metadata(&self, prompt_id: &str) -> Result<HistoryEntry, ComfyUIApiError> {
        self.api.get_history(prompt_id).await
    }

    async fn fetch_result_bytes(&self, file: &OutputFile) -> Result<Vec<u8>, ComfyUIApiError> {
        self.api.view(file).await
    }

    async fn upload_image(
        &self,
        bytes: Vec<u8>,
        extension: &str,
        mime: &str,
    ) -> Result<UploadedImage, ComfyUIApiError> {
        self.api.upload_image(bytes, extension, mime).await
    }
}
