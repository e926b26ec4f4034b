//! Process-wide task registry and the orchestrator-facing API.
//!
//! Tasks are keyed by client identifier, then task identifier. Lookups of
//! an unknown pair fail with [`CoreError::NotFound`]. Entries live until
//! removed explicitly or evicted after sitting idle in a terminal state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sds_comfyui::backend::JobBackend;
use sds_core::error::CoreError;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{EvictionConfig, TaskConfig};
use crate::recipe::JobRecipe;
use crate::task::{Artifact, EventSlice, GenerationTask, TaskStatus};

type ClientTasks = HashMap<String, Arc<GenerationTask>>;

/// Thread-safe via interior `RwLock`; designed to be wrapped in `Arc` and
/// shared across the application.
pub struct TaskRegistry {
    backend: Arc<dyn JobBackend>,
    config: TaskConfig,
    clients: RwLock<HashMap<String, ClientTasks>>,
}

impl TaskRegistry {
    pub fn new(backend: Arc<dyn JobBackend>, config: TaskConfig) -> Self {
        Self {
            backend,
            config,
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new task under `client_id` without starting it.
    pub async fn create(
        &self,
        client_id: &str,
        recipe: Box<dyn JobRecipe>,
    ) -> (String, Arc<GenerationTask>) {
        let mut clients = self.clients.write().await;
        let tasks = clients.entry(client_id.to_string()).or_default();

        let mut task_id = new_task_id();
        while tasks.contains_key(&task_id) {
            task_id = new_task_id();
        }

        let task = GenerationTask::new(
            task_id.clone(),
            client_id,
            recipe,
            Arc::clone(&self.backend),
            self.config.clone(),
        );
        tasks.insert(task_id.clone(), Arc::clone(&task));

        tracing::debug!(client_id, task_id = %task_id, kind = task.kind(), "Task registered");
        (task_id, task)
    }

    /// Look up a task. Does not count as an access for eviction.
    pub async fn get(&self, client_id: &str, task_id: &str) -> Option<Arc<GenerationTask>> {
        self.clients
            .read()
            .await
            .get(client_id)
            .and_then(|tasks| tasks.get(task_id))
            .cloned()
    }

    async fn require(&self, client_id: &str, task_id: &str) -> Result<Arc<GenerationTask>, CoreError> {
        self.get(client_id, task_id)
            .await
            .ok_or_else(|| CoreError::task_not_found(task_id))
    }

    // ---- orchestrator API ----

    /// Create and start a task; returns its identity.
    pub async fn create_task(
        &self,
        client_id: &str,
        recipe: Box<dyn JobRecipe>,
    ) -> Result<String, CoreError> {
        let (task_id, task) = self.create(client_id, recipe).await;
        task.start()?;
        Ok(task_id)
    }

    pub async fn get_status(&self, client_id: &str, task_id: &str) -> Result<TaskStatus, CoreError> {
        let task = self.require(client_id, task_id).await?;
        task.touch();
        Ok(task.status())
    }

    pub async fn get_events(
        &self,
        client_id: &str,
        task_id: &str,
        from: usize,
    ) -> Result<EventSlice, CoreError> {
        Ok(self.require(client_id, task_id).await?.events(from).await)
    }

    /// Wait for the task and return its artifact, or `None` if it failed.
    pub async fn get_result(
        &self,
        client_id: &str,
        task_id: &str,
    ) -> Result<Option<Arc<Artifact>>, CoreError> {
        self.require(client_id, task_id).await?.result().await
    }

    /// Stop tracking a task locally. See [`GenerationTask::cancel`].
    pub async fn cancel_task(&self, client_id: &str, task_id: &str) -> Result<(), CoreError> {
        self.require(client_id, task_id).await?.cancel();
        Ok(())
    }

    /// Drop a task from the registry, cancelling it if still running.
    pub async fn remove(&self, client_id: &str, task_id: &str) -> Result<Arc<GenerationTask>, CoreError> {
        let mut clients = self.clients.write().await;
        let tasks = clients
            .get_mut(client_id)
            .ok_or_else(|| CoreError::task_not_found(task_id))?;
        let task = tasks
            .remove(task_id)
            .ok_or_else(|| CoreError::task_not_found(task_id))?;
        if tasks.is_empty() {
            clients.remove(client_id);
        }
        drop(clients);

        task.cancel();
        Ok(task)
    }

    // ---- eviction ----

    /// Drop terminal tasks not read for at least `ttl`. Tasks still in
    /// progress are kept regardless of age. Returns how many were dropped.
    pub async fn evict_idle(&self, ttl: Duration) -> usize {
        let mut clients = self.clients.write().await;
        let mut evicted = 0;

        clients.retain(|client_id, tasks| {
            tasks.retain(|task_id, task| {
                let keep = !(task.status().is_terminal() && task.idle_for() >= ttl);
                if !keep {
                    tracing::debug!(client_id = %client_id, task_id = %task_id, "Evicting idle task");
                    evicted += 1;
                }
                keep
            });
            !tasks.is_empty()
        });

        evicted
    }

    /// Run [`evict_idle`](Self::evict_idle) every `config.interval` until
    /// `cancel` is triggered.
    pub fn spawn_evictor(self: &Arc<Self>, config: EvictionConfig, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);

        tokio::spawn(async move {
            tracing::info!(
                idle_ttl_secs = config.idle_ttl.as_secs(),
                interval_secs = config.interval.as_secs(),
                "Task evictor started"
            );

            let mut interval = tokio::time::interval(config.interval);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("Task evictor stopping");
                        break;
                    }
                    _ = interval.tick() => {
                        let evicted = registry.evict_idle(config.idle_ttl).await;
                        if evicted > 0 {
                            tracing::info!(evicted, "Evicted idle tasks");
                        } else {
                            tracing::debug!("No idle tasks to evict");
                        }
                    }
                }
            }
        })
    }

    /// Number of tasks across all clients.
    pub async fn task_count(&self) -> usize {
        self.clients.read().await.values().map(HashMap::len).sum()
    }
}

fn new_task_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
