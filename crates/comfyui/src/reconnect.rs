//! Exponential-backoff reconnection logic for ComfyUI WebSocket
//! connections.
//!
//! When a streaming connection drops, the consumer calls
//! [`reconnect_loop`] to keep retrying with increasing delays until the
//! connection is restored, the [`ReconnectBudget`] runs out, or the
//! [`CancellationToken`] is triggered.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::backend::JobBackend;
use crate::client::FrameStream;

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the second attempt of an outage (the first is immediate).
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
    /// Give up after this many attempts within one outage. `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Give up once an outage has lasted this long. `None` has no ceiling.
    pub max_outage: Option<Duration>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: Some(20),
            max_outage: Some(Duration::from_secs(300)),
        }
    }
}

impl ReconnectConfig {
    /// Retry forever with no wall-clock ceiling.
    pub fn unbounded() -> Self {
        Self {
            max_attempts: None,
            max_outage: None,
            ..Default::default()
        }
    }
}

/// Calculate the next backoff delay from the current delay and config.
///
/// The result is clamped to [`ReconnectConfig::max_delay`].
pub fn next_delay(current: Duration, config: &ReconnectConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}

/// Attempt accounting for one outage.
///
/// Survives across calls to [`reconnect_loop`] so that a connection
/// which opens and immediately drops again still consumes the budget.
/// The consumer calls [`reset`](Self::reset) once the connection has
/// proven healthy (a frame arrived).
#[derive(Debug, Clone)]
pub struct ReconnectBudget {
    attempts: u32,
    delay: Duration,
    outage_started: Option<Instant>,
    initial_delay: Duration,
}

impl ReconnectBudget {
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            attempts: 0,
            delay: config.initial_delay,
            outage_started: None,
            initial_delay: config.initial_delay,
        }
    }

    /// Forget the current outage.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.delay = self.initial_delay;
        self.outage_started = None;
    }

    /// Attempts made since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// `true` once either limit in `config` has been reached.
    pub fn exhausted(&self, config: &ReconnectConfig) -> bool {
        let over_attempts = config.max_attempts.is_some_and(|max| self.attempts >= max);
        let over_time = match (config.max_outage, self.outage_started) {
            (Some(max), Some(started)) => started.elapsed() >= max,
            _ => false,
        };
        over_attempts || over_time
    }

    fn record_attempt(&mut self) {
        self.attempts += 1;
        self.outage_started.get_or_insert_with(Instant::now);
    }
}

/// Why [`reconnect_loop`] stopped without a connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconnectError {
    #[error("Reconnect cancelled")]
    Cancelled,

    #[error("Gave up reconnecting after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

/// Open a streaming connection with exponential backoff.
///
/// The first attempt of an outage is made immediately; later attempts
/// wait for the current backoff delay. Returns the new stream once a
/// connection succeeds.
pub async fn reconnect_loop(
    backend: &dyn JobBackend,
    client_id: &str,
    config: &ReconnectConfig,
    budget: &mut ReconnectBudget,
    cancel: &CancellationToken,
) -> Result<FrameStream, ReconnectError> {
    let mut last_error = String::from("no attempt made");

    loop {
        if budget.exhausted(config) {
            return Err(ReconnectError::Exhausted {
                attempts: budget.attempts,
                last_error,
            });
        }

        if budget.attempts > 0 {
            // Wait before the next attempt, respecting cancellation.
            tokio::select! {
                _ = cancel.cancelled() => return Err(ReconnectError::Cancelled),
                _ = tokio::time::sleep(budget.delay) => {}
            }
            budget.delay = next_delay(budget.delay, config);
        }

        budget.record_attempt();
        let attempt = budget.attempts;
        tracing::info!(
            client_id = %client_id,
            attempt,
            delay_ms = budget.delay.as_millis() as u64,
            "Reconnecting to ComfyUI",
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(client_id = %client_id, "Reconnect cancelled");
                return Err(ReconnectError::Cancelled);
            }
            result = backend.open_stream(client_id) => {
                match result {
                    Ok(stream) => {
                        tracing::info!(client_id = %client_id, attempt, "Reconnected to ComfyUI");
                        return Ok(stream);
                    }
                    Err(e) => {
                        tracing::warn!(
                            client_id = %client_id,
                            error = %e,
                            "Reconnect attempt {attempt} failed",
                        );
                        last_error = e.to_string();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use futures::StreamExt;

    use super::*;
    use crate::api::{ComfyUIApiError, HistoryEntry, OutputFile, SubmitResponse, UploadedImage};
    use crate::client::ComfyUIClientError;

    /// Backend whose stream endpoint fails a fixed number of times.
    struct FlakyStreams {
        failures_left: AtomicU32,
        opened: AtomicU32,
    }

    impl FlakyStreams {
        fn failing(times: u32) -> Self {
            Self {
                failures_left: AtomicU32::new(times),
                opened: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl JobBackend for FlakyStreams {
        async fn submit(
            &self,
            _workflow: &serde_json::Value,
            _client_id: &str,
        ) -> Result<SubmitResponse, ComfyUIApiError> {
            unreachable!("not used by reconnect tests")
        }

        async fn open_stream(&self, _client_id: &str) -> Result<FrameStream, ComfyUIClientError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(ComfyUIClientError::Connection("refused".into()));
            }
            Ok(futures::stream::empty().boxed())
        }

        async fn fetch_result_metadata(
            &self,
            prompt_id: &str,
        ) -> Result<HistoryEntry, ComfyUIApiError> {
            Err(ComfyUIApiError::NotFound(prompt_id.to_string()))
        }

        async fn fetch_result_bytes(&self, _file: &OutputFile) -> Result<Vec<u8>, ComfyUIApiError> {
            unreachable!("not used by reconnect tests")
        }

        async fn upload_image(
            &self,
            _bytes: Vec<u8>,
            _extension: &str,
            _mime: &str,
        ) -> Result<UploadedImage, ComfyUIApiError> {
            unreachable!("not used by reconnect tests")
        }
    }

    fn fast(max_attempts: Option<u32>) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            max_attempts,
            max_outage: None,
            ..Default::default()
        }
    }

    #[test]
    fn next_delay_doubles() {
        let config = ReconnectConfig::default();
        let d = next_delay(Duration::from_secs(1), &config);
        assert_eq!(d, Duration::from_secs(2));
    }

    #[test]
    fn next_delay_clamps_at_max() {
        let config = ReconnectConfig {
            max_delay: Duration::from_secs(10),
            ..Default::default()
        };
        let d = next_delay(Duration::from_secs(8), &config);
        assert_eq!(d, Duration::from_secs(10));
    }

    #[test]
    fn custom_multiplier() {
        let config = ReconnectConfig {
            multiplier: 3.0,
            max_delay: Duration::from_secs(60),
            ..Default::default()
        };
        let d = next_delay(Duration::from_secs(2), &config);
        assert_eq!(d, Duration::from_secs(6));
    }

    #[test]
    fn full_backoff_sequence() {
        let config = ReconnectConfig::default();
        let mut delay = config.initial_delay;
        let expected = [1, 2, 4, 8, 16, 30, 30, 30];

        for &expected_secs in &expected {
            assert_eq!(delay.as_secs(), expected_secs);
            delay = next_delay(delay, &config);
        }
    }

    #[test]
    fn budget_exhausts_at_max_attempts() {
        let config = fast(Some(2));
        let mut budget = ReconnectBudget::new(&config);
        assert!(!budget.exhausted(&config));
        budget.record_attempt();
        assert!(!budget.exhausted(&config));
        budget.record_attempt();
        assert!(budget.exhausted(&config));
        budget.reset();
        assert!(!budget.exhausted(&config));
        assert_eq!(budget.attempts(), 0);
    }

    #[test]
    fn zero_outage_ceiling_exhausts_after_first_attempt() {
        let config = ReconnectConfig {
            max_attempts: None,
            max_outage: Some(Duration::ZERO),
            ..Default::default()
        };
        let mut budget = ReconnectBudget::new(&config);
        assert!(!budget.exhausted(&config));
        budget.record_attempt();
        assert!(budget.exhausted(&config));
    }

    #[test]
    fn unbounded_budget_never_exhausts() {
        let config = ReconnectConfig::unbounded();
        let mut budget = ReconnectBudget::new(&config);
        for _ in 0..1000 {
            budget.record_attempt();
        }
        assert!(!budget.exhausted(&config));
    }

    #[tokio::test]
    async fn reconnects_after_transient_failures() {
        let backend = FlakyStreams::failing(2);
        let config = fast(Some(5));
        let mut budget = ReconnectBudget::new(&config);
        let cancel = CancellationToken::new();

        let result = reconnect_loop(&backend, "c1", &config, &mut budget, &cancel).await;
        assert!(result.is_ok());
        assert_eq!(budget.attempts(), 3);
        assert_eq!(backend.opened.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_when_budget_is_spent() {
        let backend = FlakyStreams::failing(u32::MAX);
        let config = fast(Some(3));
        let mut budget = ReconnectBudget::new(&config);
        let cancel = CancellationToken::new();

        let result = reconnect_loop(&backend, "c1", &config, &mut budget, &cancel).await;
        assert_matches!(result.map(|_| ()), Err(ReconnectError::Exhausted { attempts: 3, .. }));
        assert_eq!(backend.opened.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn budget_carries_across_calls() {
        let backend = FlakyStreams::failing(0);
        let config = fast(Some(2));
        let mut budget = ReconnectBudget::new(&config);
        let cancel = CancellationToken::new();

        assert!(reconnect_loop(&backend, "c1", &config, &mut budget, &cancel).await.is_ok());
        assert!(reconnect_loop(&backend, "c1", &config, &mut budget, &cancel).await.is_ok());
        let third = reconnect_loop(&backend, "c1", &config, &mut budget, &cancel).await;
        assert_matches!(third.map(|_| ()), Err(ReconnectError::Exhausted { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn cancellation_token_stops_reconnect() {
        let backend = FlakyStreams::failing(u32::MAX);
        let config = ReconnectConfig::unbounded();
        let mut budget = ReconnectBudget::new(&config);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = reconnect_loop(&backend, "c1", &config, &mut budget, &cancel).await;
        assert_matches!(result.map(|_| ()), Err(ReconnectError::Cancelled));
    }
}
