//! Scripted in-memory backend shared by the gateway integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use sds_comfyui::api::{
    content_filename, ComfyUIApiError, HistoryEntry, OutputFile, SubmitResponse, UploadedImage,
};
use sds_comfyui::backend::JobBackend;
use sds_comfyui::client::{ComfyUIClientError, FrameStream, StreamError};
use sds_comfyui::reconnect::ReconnectConfig;
use sds_comfyui::workflow::WorkflowTemplate;
use sds_gateway::config::{NormalizerConfig, TaskConfig};
use sds_gateway::recipe::{HdriRecipe, JobRecipe, ObjRecipe};
use sds_gateway::task::{GenerationTask, TaskStatus};
use serde_json::{json, Value};

/// One scripted event on a fake streaming connection.
#[derive(Debug, Clone)]
pub enum Step {
    Frame(String),
    /// Connection closed uncleanly.
    Close,
    Fatal(String),
    Pause(Duration),
    /// Never yield again.
    Hang,
}

/// What `open_stream` does once every scripted connection is used up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhenExhausted {
    /// Connect, then never deliver a frame.
    Hang,
    /// Refuse the connection.
    Refuse,
}

pub struct FakeBackend {
    streams: Mutex<VecDeque<Vec<Step>>>,
    when_exhausted: WhenExhausted,
    prompt_ids: Mutex<VecDeque<String>>,
    submit_error: Option<String>,
    histories: HashMap<String, Value>,
    history_ready_after: u32,
    files: HashMap<String, Vec<u8>>,

    pub opened: AtomicU32,
    pub history_calls: AtomicU32,
    pub submitted: Mutex<Vec<(Value, String)>>,
    pub uploads: Mutex<Vec<Vec<u8>>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            streams: Mutex::new(VecDeque::new()),
            when_exhausted: WhenExhausted::Hang,
            prompt_ids: Mutex::new(VecDeque::new()),
            submit_error: None,
            histories: HashMap::new(),
            history_ready_after: 0,
            files: HashMap::new(),
            opened: AtomicU32::new(0),
            history_calls: AtomicU32::new(0),
            submitted: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
        }
    }

    /// Script the next streaming connection.
    pub fn with_stream(self, steps: Vec<Step>) -> Self {
        self.streams.lock().unwrap().push_back(steps);
        self
    }

    /// Next submission gets `prompt_id`; its history records success with
    /// `outputs`.
    pub fn with_job(mut self, prompt_id: &str, outputs: Value) -> Self {
        self.prompt_ids.lock().unwrap().push_back(prompt_id.to_string());
        self.histories.insert(
            prompt_id.to_string(),
            json!({
                "outputs": outputs,
                "status": {"status_str": "success", "completed": true}
            }),
        );
        self
    }

    /// Next submission gets `prompt_id` but no history is ever recorded.
    pub fn with_unrecorded_job(self, prompt_id: &str) -> Self {
        self.prompt_ids.lock().unwrap().push_back(prompt_id.to_string());
        self
    }

    pub fn with_file(mut self, filename: &str, bytes: &[u8]) -> Self {
        self.files.insert(filename.to_string(), bytes.to_vec());
        self
    }

    /// The first `calls` history lookups report no record.
    pub fn history_ready_after(mut self, calls: u32) -> Self {
        self.history_ready_after = calls;
        self
    }

    pub fn refuse_when_exhausted(mut self) -> Self {
        self.when_exhausted = WhenExhausted::Refuse;
        self
    }

    pub fn reject_submission(mut self, body: &str) -> Self {
        self.submit_error = Some(body.to_string());
        self
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn opened(&self) -> u32 {
        self.opened.load(Ordering::SeqCst)
    }
}

fn scripted(steps: Vec<Step>) -> FrameStream {
    futures::stream::unfold(VecDeque::from(steps), |mut steps| async move {
        loop {
            match steps.pop_front()? {
                Step::Frame(text) => return Some((Ok(text), steps)),
                Step::Close => return Some((Err(StreamError::Closed("reset by peer".into())), steps)),
                Step::Fatal(e) => return Some((Err(StreamError::Fatal(e)), steps)),
                Step::Pause(d) => tokio::time::sleep(d).await,
                Step::Hang => futures::future::pending::<()>().await,
            }
        }
    })
    .boxed()
}

#[async_trait]
impl JobBackend for FakeBackend {
    async fn submit(&self, workflow: &Value, client_id: &str) -> Result<SubmitResponse, ComfyUIApiError> {
        if let Some(body) = &self.submit_error {
            return Err(ComfyUIApiError::ApiError {
                status: 400,
                body: body.clone(),
            });
        }

        self.submitted
            .lock()
            .unwrap()
            .push((workflow.clone(), client_id.to_string()));
        let prompt_id = self
            .prompt_ids
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| "J1".to_string());

        Ok(SubmitResponse {
            prompt_id,
            number: 1,
            node_errors: json!({}),
        })
    }

    async fn open_stream(&self, _client_id: &str) -> Result<FrameStream, ComfyUIClientError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let next = self.streams.lock().unwrap().pop_front();
        match (next, self.when_exhausted) {
            (Some(steps), _) => Ok(scripted(steps)),
            (None, WhenExhausted::Hang) => Ok(scripted(vec![Step::Hang])),
            (None, WhenExhausted::Refuse) => Err(ComfyUIClientError::Connection("connection refused".into())),
        }
    }

    async fn fetch_result_metadata(&self, prompt_id: &str) -> Result<HistoryEntry, ComfyUIApiError> {
        let call = self.history_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.history_ready_after {
            return Err(ComfyUIApiError::NotFound(prompt_id.to_string()));
        }
        match self.histories.get(prompt_id) {
            Some(entry) => Ok(serde_json::from_value(entry.clone())?),
            None => Err(ComfyUIApiError::NotFound(prompt_id.to_string())),
        }
    }

    async fn fetch_result_bytes(&self, file: &OutputFile) -> Result<Vec<u8>, ComfyUIApiError> {
        self.files
            .get(&file.filename)
            .cloned()
            .ok_or_else(|| ComfyUIApiError::ApiError {
                status: 404,
                body: file.filename.clone(),
            })
    }

    async fn upload_image(
        &self,
        bytes: Vec<u8>,
        extension: &str,
        _mime: &str,
    ) -> Result<UploadedImage, ComfyUIApiError> {
        let name = content_filename(&bytes, extension);
        self.uploads.lock().unwrap().push(bytes);
        Ok(UploadedImage {
            name,
            subfolder: String::new(),
            kind: "input".to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

pub fn frame(value: Value) -> Step {
    Step::Frame(value.to_string())
}

pub fn queue_status(remaining: i32) -> Step {
    frame(json!({"type": "status", "data": {"status": {"exec_info": {"queue_remaining": remaining}}}}))
}

pub fn progress(prompt_id: &str, value: i64, max: i64) -> Step {
    frame(json!({"type": "progress", "data": {"value": value, "max": max, "prompt_id": prompt_id}}))
}

pub fn progress_on(prompt_id: &str, node: &str, value: i64, max: i64) -> Step {
    frame(json!({
        "type": "progress",
        "data": {"value": value, "max": max, "node": node, "prompt_id": prompt_id}
    }))
}

pub fn executing(prompt_id: &str, node: &str) -> Step {
    frame(json!({"type": "executing", "data": {"node": node, "prompt_id": prompt_id}}))
}

pub fn success(prompt_id: &str) -> Step {
    frame(json!({"type": "execution_success", "data": {"prompt_id": prompt_id}}))
}

pub fn execution_error(prompt_id: &str, node: &str, message: &str) -> Step {
    frame(json!({
        "type": "execution_error",
        "data": {
            "prompt_id": prompt_id,
            "node_id": node,
            "exception_message": message,
            "exception_type": "RuntimeError"
        }
    }))
}

// ---------------------------------------------------------------------------
// Recipes and config
// ---------------------------------------------------------------------------

pub fn hdri_outputs(filename: &str) -> Value {
    json!({"173": {"images": [{"filename": filename, "subfolder": "", "type": "output"}]}})
}

pub fn obj_outputs(filename: &str) -> Value {
    json!({"154": {"result": [filename]}})
}

pub fn hdri_recipe() -> Box<dyn JobRecipe> {
    let template = WorkflowTemplate::from_value(json!({
        "27": {"class_type": "CLIPTextEncodeFlux", "inputs": {"clip_l": "", "t5xxl": "", "guidance": 3.5}},
        "173": {"class_type": "SaveImage", "inputs": {"filename_prefix": "hdri"}}
    }))
    .unwrap();
    Box::new(HdriRecipe::new(Arc::new(template), "A misty forest.", "misty, forest"))
}

pub fn obj_recipe(image: &[u8], description: &str) -> Box<dyn JobRecipe> {
    let template = WorkflowTemplate::from_value(json!({
        "196": {"class_type": "LoadImage", "inputs": {"image": ""}},
        "192": {"class_type": "CLIPTextEncode", "inputs": {"text": ""}},
        "154": {"class_type": "SaveGLB", "inputs": {}}
    }))
    .unwrap();
    Box::new(ObjRecipe::new(
        Arc::new(template),
        image.to_vec(),
        "png",
        "image/png",
        description,
    ))
}

/// Millisecond-scale delays so tests never wait on real backoff.
pub fn fast_config(max_attempts: Option<u32>) -> TaskConfig {
    TaskConfig {
        normalizer: NormalizerConfig {
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                max_attempts,
                max_outage: None,
                ..Default::default()
            },
            unrecognized_frame_limit: None,
        },
        result_poll_attempts: 5,
        result_poll_interval: Duration::from_millis(1),
    }
}

pub fn new_task(backend: &Arc<FakeBackend>, recipe: Box<dyn JobRecipe>, config: TaskConfig) -> Arc<GenerationTask> {
    GenerationTask::new("task-1", "client-1", recipe, Arc::clone(backend) as Arc<dyn JobBackend>, config)
}

/// Wait (bounded) for a terminal status.
pub async fn wait_terminal(task: &GenerationTask) -> TaskStatus {
    let mut rx = task.subscribe();
    let status = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.is_terminal()))
        .await
        .expect("task did not finish in time")
        .expect("status channel closed");
    *status
}
