//! One generation job, driven end to end.
//!
//! A [`GenerationTask`] has a single writer (its driving routine) and any
//! number of readers polling [`status`](GenerationTask::status),
//! [`events`](GenerationTask::events) and
//! [`result`](GenerationTask::result). The event log is append-only, so a
//! reader that passes back the previous `total` as `from` never sees a
//! line twice and never misses one.

use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use sds_comfyui::api::{ComfyUIApiError, OutputFile};
use sds_comfyui::backend::JobBackend;
use sds_core::error::CoreError;
use sds_core::types::{now, Timestamp};
use serde::Serialize;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::TaskConfig;
use crate::error::GenerationError;
use crate::normalizer::{NormalizedEvent, ProgressNormalizer};
use crate::recipe::JobRecipe;

/// Task lifecycle. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    NotStarted,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "NOT_STARTED",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::NotStarted, Self::InProgress)
                | (Self::InProgress, Self::Completed)
                | (Self::InProgress, Self::Failed)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The downloaded output of a successful job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Name the backend gave the file.
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// A suffix of the event log plus the log length at read time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventSlice {
    pub events: Vec<String>,
    pub total: usize,
}

/// Serializable summary of a task for status endpoints and logs.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub client_id: String,
    pub kind: &'static str,
    pub status: TaskStatus,
    pub job_id: Option<String>,
    pub created_at: Timestamp,
    pub elapsed_ms: Option<u64>,
    pub event_count: usize,
    pub failure: Option<String>,
}

#[derive(Debug)]
enum Outcome {
    Completed(Arc<Artifact>),
    Failed(String),
}

#[derive(Debug)]
struct Finished {
    outcome: Outcome,
    elapsed: Duration,
}

/// What `start` hands to the driving routine.
struct Launch {
    recipe: Box<dyn JobRecipe>,
    backend: Arc<dyn JobBackend>,
}

pub struct GenerationTask {
    id: String,
    client_id: String,
    kind: &'static str,
    created_at: Timestamp,
    config: TaskConfig,
    status: watch::Sender<TaskStatus>,
    events: RwLock<Vec<String>>,
    job_id: OnceLock<String>,
    started_at: OnceLock<Instant>,
    finished: OnceLock<Finished>,
    last_access_ms: AtomicI64,
    launch: Mutex<Option<Launch>>,
    cancel: CancellationToken,
}

impl GenerationTask {
    /// Create a task in `NOT_STARTED`. Nothing runs until
    /// [`start`](Self::start).
    pub fn new(
        id: impl Into<String>,
        client_id: impl Into<String>,
        recipe: Box<dyn JobRecipe>,
        backend: Arc<dyn JobBackend>,
        config: TaskConfig,
    ) -> Arc<Self> {
        let created_at = now();
        let (status, _) = watch::channel(TaskStatus::NotStarted);

        Arc::new(Self {
            id: id.into(),
            client_id: client_id.into(),
            kind: recipe.kind(),
            created_at,
            config,
            status,
            events: RwLock::new(Vec::new()),
            job_id: OnceLock::new(),
            started_at: OnceLock::new(),
            finished: OnceLock::new(),
            last_access_ms: AtomicI64::new(created_at.timestamp_millis()),
            launch: Mutex::new(Some(Launch { recipe, backend })),
            cancel: CancellationToken::new(),
        })
    }

    /// Move to `IN_PROGRESS` and spawn the driving routine.
    ///
    /// Must be called from within a Tokio runtime. A second call fails
    /// with [`CoreError::Conflict`].
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<()>, CoreError> {
        let launch = self
            .launch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| CoreError::Conflict(format!("Task {} was already started", self.id)))?;

        let _ = self.started_at.set(Instant::now());
        self.set_status(TaskStatus::InProgress);
        tracing::info!(task_id = %self.id, client_id = %self.client_id, kind = self.kind, "Task started");

        let task = Arc::clone(self);
        Ok(tokio::spawn(async move { task.drive(launch).await }))
    }

    /// Stop tracking the job locally.
    ///
    /// The task ends `FAILED` at its next suspension point. The remote job
    /// is not aborted and keeps running on the backend. Cancelling a task
    /// that was never started makes it fail as soon as it is started.
    pub fn cancel(&self) {
        if !self.status().is_terminal() {
            tracing::info!(task_id = %self.id, "Task cancel requested");
        }
        self.cancel.cancel();
    }

    // ---- reads ----

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    /// Backend job identity, once submission succeeded.
    pub fn job_id(&self) -> Option<&str> {
        self.job_id.get().map(String::as_str)
    }

    /// Current status. Does not count as an access for eviction.
    pub fn status(&self) -> TaskStatus {
        *self.status.borrow()
    }

    /// Watch status changes.
    pub fn subscribe(&self) -> watch::Receiver<TaskStatus> {
        self.status.subscribe()
    }

    /// Log lines from index `from` onward, plus the total length.
    ///
    /// `from` past the end yields an empty slice.
    pub async fn events(&self, from: usize) -> EventSlice {
        self.touch();
        let log = self.events.read().await;
        let start = from.min(log.len());
        EventSlice {
            events: log[start..].to_vec(),
            total: log.len(),
        }
    }

    /// Time from start to the terminal state.
    pub fn elapsed(&self) -> Option<Duration> {
        self.finished.get().map(|f| f.elapsed)
    }

    pub fn failure(&self) -> Option<&str> {
        match &self.finished.get()?.outcome {
            Outcome::Failed(detail) => Some(detail),
            Outcome::Completed(_) => None,
        }
    }

    /// The artifact, if the task completed.
    pub fn artifact(&self) -> Option<Arc<Artifact>> {
        match &self.finished.get()?.outcome {
            Outcome::Completed(artifact) => Some(Arc::clone(artifact)),
            Outcome::Failed(_) => None,
        }
    }

    /// Wait for the task to finish.
    ///
    /// Returns `None` when the task failed. Fails with
    /// [`CoreError::NotStarted`] if `start` has not been called.
    pub async fn result(&self) -> Result<Option<Arc<Artifact>>, CoreError> {
        self.touch();
        let mut rx = self.status.subscribe();
        let current = *rx.borrow_and_update();
        if current == TaskStatus::NotStarted {
            return Err(CoreError::NotStarted(self.id.clone()));
        }

        rx.wait_for(|status| status.is_terminal())
            .await
            .map_err(|_| CoreError::Internal(format!("status channel of task {} closed", self.id)))?;

        Ok(self.artifact())
    }

    pub async fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id.clone(),
            client_id: self.client_id.clone(),
            kind: self.kind,
            status: self.status(),
            job_id: self.job_id().map(str::to_string),
            created_at: self.created_at,
            elapsed_ms: self.elapsed().map(|d| d.as_millis() as u64),
            event_count: self.events.read().await.len(),
            failure: self.failure().map(str::to_string),
        }
    }

    /// Record a read for idle eviction.
    pub fn touch(&self) {
        self.last_access_ms
            .store(now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_access(&self) -> Timestamp {
        Timestamp::from_timestamp_millis(self.last_access_ms.load(Ordering::Relaxed))
            .unwrap_or(self.created_at)
    }

    /// Time since the last read.
    pub fn idle_for(&self) -> Duration {
        (now() - self.last_access()).to_std().unwrap_or_default()
    }

    // ---- driving routine ----

    /// Runs the job in its own Tokio task so a panic inside it is caught
    /// here and recorded as a failure instead of being lost.
    async fn drive(self: Arc<Self>, launch: Launch) {
        let runner = Arc::clone(&self);
        let outcome = match tokio::spawn(async move { runner.run(launch).await }).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => {
                let payload = e.into_panic();
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(GenerationError::Panicked(message))
            }
            Err(e) => Err(GenerationError::Panicked(e.to_string())),
        };

        match outcome {
            Ok(artifact) => self.complete(artifact),
            Err(e) => self.fail(e).await,
        }
    }

    async fn run(&self, launch: Launch) -> Result<Artifact, GenerationError> {
        let Launch { recipe, backend } = launch;

        // Open the stream before submitting so early frames are not missed.
        let stream = match self.guard(backend.open_stream(&self.client_id)).await? {
            Ok(stream) => Some(stream),
            Err(e) => {
                tracing::warn!(task_id = %self.id, error = %e, "Initial stream connection failed, will retry");
                None
            }
        };

        let workflow = self.guard(recipe.build(backend.as_ref())).await??;
        let submitted = self
            .guard(backend.submit(&workflow, &self.client_id))
            .await?
            .map_err(|e| GenerationError::Submission(e.to_string()))?;
        let prompt_id = submitted.prompt_id;
        let _ = self.job_id.set(prompt_id.clone());
        self.append(format!("Submitted job {prompt_id}.")).await;

        let mut normalizer = ProgressNormalizer::new(
            Arc::clone(&backend),
            self.client_id.clone(),
            prompt_id.clone(),
            stream,
            self.config.normalizer.clone(),
            self.cancel.clone(),
        );

        loop {
            match normalizer.next_event().await {
                Some(NormalizedEvent::Line(line)) => self.append(line).await,
                Some(NormalizedEvent::Succeeded) => break,
                Some(NormalizedEvent::Failed(_)) if self.cancel.is_cancelled() => {
                    return Err(GenerationError::Cancelled)
                }
                Some(NormalizedEvent::Failed(reason)) => return Err(GenerationError::JobFailed(reason)),
                None => return Err(GenerationError::StreamExhausted),
            }
        }

        let file = self.await_result(recipe.as_ref(), backend.as_ref(), &prompt_id).await?;
        let bytes = self
            .guard(backend.fetch_result_bytes(&file))
            .await?
            .map_err(|e| GenerationError::ResultFetch(e.to_string()))?;
        if bytes.is_empty() {
            return Err(GenerationError::ResultFetch(format!("{} is empty", file.filename)));
        }

        Ok(Artifact {
            filename: file.filename,
            bytes,
        })
    }

    /// Poll result metadata until the recipe can locate its output.
    ///
    /// The success frame can arrive before the backend has finished
    /// recording outputs.
    async fn await_result(
        &self,
        recipe: &dyn JobRecipe,
        backend: &dyn JobBackend,
        prompt_id: &str,
    ) -> Result<OutputFile, GenerationError> {
        let attempts = self.config.result_poll_attempts.max(1);
        let mut last_error =
            GenerationError::ResultUnavailable(format!("no history recorded for job {prompt_id}"));

        for attempt in 1..=attempts {
            match self.guard(backend.fetch_result_metadata(prompt_id)).await? {
                Ok(history) => match recipe.locate_output(&history) {
                    Ok(file) => return Ok(file),
                    Err(e @ GenerationError::ResultUnavailable(_)) => last_error = e,
                    Err(e) => return Err(e),
                },
                Err(ComfyUIApiError::NotFound(_)) => {}
                Err(e) => last_error = GenerationError::ResultFetch(e.to_string()),
            }

            tracing::debug!(task_id = %self.id, prompt_id, attempt, "Result not available yet");
            if attempt < attempts {
                self.guard(tokio::time::sleep(self.config.result_poll_interval))
                    .await?;
            }
        }

        Err(last_error)
    }

    /// Run `fut` unless the task is cancelled first.
    async fn guard<F: Future>(&self, fut: F) -> Result<F::Output, GenerationError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(GenerationError::Cancelled),
            out = fut => Ok(out),
        }
    }

    async fn append(&self, line: String) {
        self.events.write().await.push(line);
    }

    fn run_time(&self) -> Duration {
        self.started_at
            .get()
            .map(Instant::elapsed)
            .unwrap_or_default()
    }

    fn complete(&self, artifact: Artifact) {
        let size = artifact.bytes.len();
        let finished = Finished {
            outcome: Outcome::Completed(Arc::new(artifact)),
            elapsed: self.run_time(),
        };
        let elapsed_ms = finished.elapsed.as_millis() as u64;
        if self.finished.set(finished).is_err() {
            return;
        }

        tracing::info!(task_id = %self.id, job_id = ?self.job_id(), size, elapsed_ms, "Task completed");
        // The idle clock restarts at the terminal transition.
        self.touch();
        self.set_status(TaskStatus::Completed);
    }

    async fn fail(&self, error: GenerationError) {
        let detail = error.to_string();
        self.append(format!("Generation failed: {detail}")).await;

        let finished = Finished {
            outcome: Outcome::Failed(detail.clone()),
            elapsed: self.run_time(),
        };
        if self.finished.set(finished).is_err() {
            return;
        }

        tracing::warn!(task_id = %self.id, job_id = ?self.job_id(), error = %detail, "Task failed");
        self.touch();
        self.set_status(TaskStatus::Failed);
    }

    fn set_status(&self, next: TaskStatus) {
        self.status.send_if_modified(|current| {
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                false
            }
        });
    }
}

impl std::fmt::Debug for GenerationTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationTask")
            .field("id", &self.id)
            .field("client_id", &self.client_id)
            .field("kind", &self.kind)
            .field("status", &*self.status.borrow())
            .field("job_id", &self.job_id.get())
            .finish()
    }
}
