//! Engine Warm-up and Readiness
//!
//! Runs the evaluation instructions through the engine once before the HTTP
//! service binds, so the first real request does not pay for graph capture,
//! prefix-cache population or lazy allocation.
//!
//! ## Example
//!
//! ```rust,ignore
//! use infergate::warmup::{ModelHealth, WarmupConfig, WarmupExecutor};
//!
//! let config = WarmupConfig::new()
//!     .with_dataset_path("/app/train.json")
//!     .with_repeat(3);
//!
//! let health = ModelHealth::new();
//! WarmupExecutor::new(config).warm_up(&formatter, &engine, &health).await?;
//! assert!(health.is_ready());
//! ```

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, PoisonError, RwLock,
    },
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};

use crate::{
    dataset,
    engine::EngineHandle,
    error::{GatewayError, Result},
    prompt_cache::PromptFormatter,
};

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for engine warm-up
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmupConfig {
    /// Dataset whose instructions form the warm-up batch
    pub dataset_path: PathBuf,
    /// Times the instruction list is repeated inside the batch
    pub repeat: usize,
    /// Number of warm-up batches
    pub warmup_iterations: usize,
    /// Abort warm-up after this long
    pub timeout: Option<Duration>,
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            dataset_path: PathBuf::from("/app/train.json"),
            repeat: 3,
            warmup_iterations: 1,
            timeout: None,
        }
    }
}

impl WarmupConfig {
    /// Create a new warm-up configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the dataset path
    #[must_use]
    pub fn with_dataset_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.dataset_path = path.into();
        self
    }

    /// Set how many times the instruction list is repeated (minimum 1)
    #[must_use]
    pub fn with_repeat(mut self, repeat: usize) -> Self {
        self.repeat = repeat.max(1);
        self
    }

    /// Set number of warm-up batches (minimum 1)
    #[must_use]
    pub fn with_warmup_iterations(mut self, n: usize) -> Self {
        self.warmup_iterations = n.max(1);
        self
    }

    /// Set warm-up timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

// ============================================================================
// Status
// ============================================================================

/// Lifecycle of the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarmupStatus {
    /// Not yet started
    NotStarted,
    /// Currently warming up
    InProgress,
    /// Warm-up completed successfully
    Ready,
    /// Warm-up failed
    Failed,
    /// Warm-up timed out
    TimedOut,
}

impl WarmupStatus {
    /// Check if the service is ready
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Check if warm-up failed
    #[must_use]
    pub fn has_failed(&self) -> bool {
        matches!(self, Self::Failed | Self::TimedOut)
    }
}

/// Outcome of a warm-up run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmupResult {
    /// Final status
    pub status: WarmupStatus,
    /// Batches completed
    pub iterations_completed: usize,
    /// Prompts per batch
    pub batch_size: usize,
    /// Total warm-up duration
    pub total_duration: Duration,
    /// Latency of the first batch
    pub first_latency: Duration,
    /// Latency of the last batch
    pub last_latency: Duration,
    /// Error message if failed
    pub error: Option<String>,
}

impl WarmupResult {
    /// Create a successful result
    #[must_use]
    pub fn success(batch_size: usize, duration: Duration, latencies: &[Duration]) -> Self {
        Self {
            status: WarmupStatus::Ready,
            iterations_completed: latencies.len(),
            batch_size,
            total_duration: duration,
            first_latency: latencies.first().copied().unwrap_or(Duration::ZERO),
            last_latency: latencies.last().copied().unwrap_or(Duration::ZERO),
            error: None,
        }
    }

    /// Create a failed result
    #[must_use]
    pub fn failed(error: impl Into<String>, iterations: usize, duration: Duration) -> Self {
        Self {
            status: WarmupStatus::Failed,
            iterations_completed: iterations,
            batch_size: 0,
            total_duration: duration,
            first_latency: Duration::ZERO,
            last_latency: Duration::ZERO,
            error: Some(error.into()),
        }
    }

    /// Create a timed out result
    #[must_use]
    pub fn timed_out(iterations: usize, duration: Duration) -> Self {
        Self {
            status: WarmupStatus::TimedOut,
            error: Some("Warm-up timed out".to_string()),
            ..Self::failed("", iterations, duration)
        }
    }

    /// Prompts processed per second over the whole warm-up
    #[must_use]
    pub fn throughput(&self) -> f64 {
        let secs = self.total_duration.as_secs_f64();
        if secs > 0.0 {
            (self.batch_size * self.iterations_completed) as f64 / secs
        } else {
            0.0
        }
    }
}

// ============================================================================
// Health
// ============================================================================

/// Readiness and request counters shared with the HTTP layer
#[derive(Debug, Clone)]
pub struct ModelHealth {
    ready: Arc<AtomicBool>,
    status: Arc<RwLock<WarmupStatus>>,
    requests_served: Arc<AtomicU64>,
    requests_failed: Arc<AtomicU64>,
    started_at: Instant,
}

impl Default for ModelHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelHealth {
    /// Create new health tracker
    #[must_use]
    pub fn new() -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(false)),
            status: Arc::new(RwLock::new(WarmupStatus::NotStarted)),
            requests_served: Arc::new(AtomicU64::new(0)),
            requests_failed: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }

    /// Tracker that is already ready (demo state, tests)
    #[must_use]
    pub fn ready() -> Self {
        let health = Self::new();
        health.set_status(WarmupStatus::Ready);
        health
    }

    /// Check if the service is ready
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Get current status
    #[must_use]
    pub fn status(&self) -> WarmupStatus {
        *self.status.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set status; readiness follows it
    pub fn set_status(&self, status: WarmupStatus) {
        *self.status.write().unwrap_or_else(PoisonError::into_inner) = status;
        self.ready.store(status.is_ready(), Ordering::Release);
    }

    /// Record a successful request
    pub fn record_success(&self) {
        self.requests_served.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed request
    pub fn record_failure(&self) {
        self.requests_served.fetch_add(1, Ordering::Relaxed);
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Get total requests handled
    #[must_use]
    pub fn total_requests(&self) -> u64 {
        self.requests_served.load(Ordering::Relaxed)
    }

    /// Get failed requests
    #[must_use]
    pub fn failed_requests(&self) -> u64 {
        self.requests_failed.load(Ordering::Relaxed)
    }

    /// Get error rate
    #[must_use]
    pub fn error_rate(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            0.0
        } else {
            self.failed_requests() as f64 / total as f64
        }
    }

    /// Generate health report
    #[must_use]
    pub fn report(&self) -> HealthReport {
        HealthReport {
            ready: self.is_ready(),
            status: self.status(),
            uptime_secs: self.started_at.elapsed().as_secs_f64(),
            total_requests: self.total_requests(),
            failed_requests: self.failed_requests(),
            error_rate: self.error_rate(),
        }
    }
}

/// Health report for API responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Is the service ready
    pub ready: bool,
    /// Current lifecycle status
    pub status: WarmupStatus,
    /// Uptime in seconds
    pub uptime_secs: f64,
    /// Total requests handled
    pub total_requests: u64,
    /// Failed requests
    pub failed_requests: u64,
    /// Error rate (0.0 - 1.0)
    pub error_rate: f64,
}

// ============================================================================
// Executor
// ============================================================================

/// Executes the warm-up pass
#[derive(Debug, Clone, Default)]
pub struct WarmupExecutor {
    config: WarmupConfig,
}

impl WarmupExecutor {
    /// Create a new warm-up executor
    #[must_use]
    pub fn new(config: WarmupConfig) -> Self {
        Self { config }
    }

    /// Get configuration
    #[must_use]
    pub fn config(&self) -> &WarmupConfig {
        &self.config
    }

    /// Load the dataset and build the templated warm-up batch
    ///
    /// # Errors
    ///
    /// Missing or unreadable dataset, or a template failure
    pub fn build_prompts(&self, formatter: &PromptFormatter) -> Result<Vec<String>> {
        let records = dataset::load_records(&self.config.dataset_path)?;
        let formatted = formatter.format_all(&dataset::instructions(&records))?;
        Ok(std::iter::repeat(formatted)
            .take(self.config.repeat.max(1))
            .flatten()
            .collect())
    }

    /// Send the batch to the engine, discarding the completions
    pub async fn run(&self, engine: &EngineHandle, prompts: Vec<String>) -> WarmupResult {
        let start = Instant::now();
        let batch_size = prompts.len();
        let mut latencies = Vec::with_capacity(self.config.warmup_iterations);

        for iteration in 0..self.config.warmup_iterations.max(1) {
            let batch_start = Instant::now();
            let call = engine.generate(prompts.clone());
            let outcome = match self.config.timeout {
                Some(limit) => {
                    let remaining = limit.saturating_sub(start.elapsed());
                    match tokio::time::timeout(remaining, call).await {
                        Ok(outcome) => outcome,
                        Err(_) => return WarmupResult::timed_out(iteration, start.elapsed()),
                    }
                },
                None => call.await,
            };

            if let Err(e) = outcome {
                return WarmupResult::failed(e.to_string(), iteration, start.elapsed());
            }
            latencies.push(batch_start.elapsed());
            tracing::debug!(
                iteration,
                elapsed_ms = batch_start.elapsed().as_millis() as u64,
                "Warm-up batch complete"
            );
        }

        WarmupResult::success(batch_size, start.elapsed(), &latencies)
    }

    /// Full warm-up: build the batch, run it and update `health`
    ///
    /// # Errors
    ///
    /// Dataset, template, engine failures or timeout; all are fatal at startup
    pub async fn warm_up(
        &self,
        formatter: &PromptFormatter,
        engine: &EngineHandle,
        health: &ModelHealth,
    ) -> Result<WarmupResult> {
        health.set_status(WarmupStatus::InProgress);

        let prompts = match self.build_prompts(formatter) {
            Ok(prompts) => prompts,
            Err(e) => {
                health.set_status(WarmupStatus::Failed);
                return Err(e);
            },
        };
        tracing::info!(
            batch_size = prompts.len(),
            dataset = %self.config.dataset_path.display(),
            "Starting warm-up"
        );

        let result = self.run(engine, prompts).await;
        health.set_status(result.status);

        match result.status {
            WarmupStatus::Ready => {
                tracing::info!(
                    elapsed_secs = result.total_duration.as_secs_f64(),
                    prompts_per_sec = result.throughput(),
                    "Warm-up complete"
                );
                Ok(result)
            },
            _ => Err(GatewayError::InferenceError(format!(
                "Warm-up failed: {}",
                result.error.unwrap_or_else(|| "unknown".to_string())
            ))),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chat_template::ChatMLTemplate,
        engine::{DemoEngine, InferenceEngine, SamplingConfig},
    };
    use std::{fs, sync::Mutex};

    /// Records every batch it receives
    #[derive(Default)]
    struct RecordingEngine {
        batches: Mutex<Vec<Vec<String>>>,
    }

    impl InferenceEngine for RecordingEngine {
        fn name(&self) -> &str {
            "recording"
        }

        fn generate(&self, prompts: &[String], _sampling: &SamplingConfig) -> Result<Vec<String>> {
            self.batches
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(prompts.to_vec());
            Ok(vec![String::new(); prompts.len()])
        }
    }

    struct FailingEngine;

    impl InferenceEngine for FailingEngine {
        fn name(&self) -> &str {
            "failing"
        }

        fn generate(&self, _prompts: &[String], _sampling: &SamplingConfig) -> Result<Vec<String>> {
            Err(GatewayError::InferenceError("CUDA out of memory".to_string()))
        }
    }

    struct SlowEngine;

    impl InferenceEngine for SlowEngine {
        fn name(&self) -> &str {
            "slow"
        }

        fn generate(&self, prompts: &[String], _sampling: &SamplingConfig) -> Result<Vec<String>> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(prompts.to_vec())
        }
    }

    fn formatter() -> PromptFormatter {
        PromptFormatter::new(Box::new(ChatMLTemplate::new()), 16)
    }

    fn write_dataset(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("train.json");
        fs::write(
            &path,
            r#"[{"instruction": "a", "output": "1"}, {"bad": true}, {"instruction": "b"}]"#,
        )
        .expect("write");
        path
    }

    #[test]
    fn test_warmup_config_default_and_builder() {
        let def = WarmupConfig::default();
        assert_eq!(def.repeat, 3);
        assert_eq!(def.warmup_iterations, 1);
        assert!(def.timeout.is_none());

        let cfg = WarmupConfig::new()
            .with_dataset_path("x.json")
            .with_repeat(0)
            .with_warmup_iterations(0)
            .with_timeout(Duration::from_secs(5));
        assert_eq!(cfg.dataset_path, PathBuf::from("x.json"));
        assert_eq!(cfg.repeat, 1);
        assert_eq!(cfg.warmup_iterations, 1);
        assert_eq!(cfg.timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_warmup_status_methods() {
        assert!(WarmupStatus::Ready.is_ready());
        assert!(!WarmupStatus::InProgress.is_ready());
        assert!(WarmupStatus::Failed.has_failed());
        assert!(WarmupStatus::TimedOut.has_failed());
        assert!(!WarmupStatus::NotStarted.has_failed());
    }

    #[test]
    fn test_warmup_result_variants() {
        let ok = WarmupResult::success(
            6,
            Duration::from_secs(2),
            &[Duration::from_millis(1500), Duration::from_millis(500)],
        );
        assert_eq!(ok.iterations_completed, 2);
        assert_eq!(ok.first_latency, Duration::from_millis(1500));
        assert!((ok.throughput() - 6.0).abs() < 1e-9);

        let failed = WarmupResult::failed("oom", 0, Duration::ZERO);
        assert_eq!(failed.status, WarmupStatus::Failed);
        assert!((failed.throughput()).abs() < f64::EPSILON);

        let timed_out = WarmupResult::timed_out(1, Duration::from_secs(1));
        assert_eq!(timed_out.status, WarmupStatus::TimedOut);
        assert_eq!(timed_out.error.as_deref(), Some("Warm-up timed out"));
    }

    #[test]
    fn test_model_health_tracking() {
        let health = ModelHealth::new();
        assert!(!health.is_ready());
        assert_eq!(health.status(), WarmupStatus::NotStarted);

        health.set_status(WarmupStatus::Ready);
        assert!(health.is_ready());

        health.record_success();
        health.record_success();
        health.record_failure();
        health.record_success();
        assert_eq!(health.total_requests(), 4);
        assert_eq!(health.failed_requests(), 1);
        assert!((health.error_rate() - 0.25).abs() < f64::EPSILON);

        let report = health.report();
        assert!(report.ready);
        assert_eq!(report.status, WarmupStatus::Ready);
        assert_eq!(report.total_requests, 4);

        let json = serde_json::to_value(&report).expect("serialize");
        assert_eq!(json["status"], "ready");
    }

    #[test]
    fn test_model_health_clone_shares_state() {
        let health = ModelHealth::new();
        let clone = health.clone();
        clone.set_status(WarmupStatus::Ready);
        clone.record_failure();
        assert!(health.is_ready());
        assert_eq!(health.failed_requests(), 1);
        assert!(ModelHealth::ready().is_ready());
    }

    #[test]
    fn test_build_prompts_repeats_instructions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let executor = WarmupExecutor::new(WarmupConfig::new().with_dataset_path(write_dataset(&dir)));
        let prompts = executor.build_prompts(&formatter()).expect("build");
        // 2 valid records x 3
        assert_eq!(prompts.len(), 6);
        assert_eq!(prompts[0], prompts[2]);
        assert!(prompts[1].contains("\nb<|im_end|>"));
        assert_eq!(prompts[..2], prompts[4..]);

        let once = WarmupExecutor::new(
            WarmupConfig::new()
                .with_dataset_path(write_dataset(&dir))
                .with_repeat(1),
        );
        assert_eq!(once.build_prompts(&formatter()).expect("build").len(), 2);
    }

    #[test]
    fn test_build_prompts_missing_dataset() {
        let executor = WarmupExecutor::new(WarmupConfig::new().with_dataset_path("/nonexistent/train.json"));
        let err = executor.build_prompts(&formatter()).expect_err("missing");
        assert!(matches!(err, GatewayError::IoError { .. }));
    }

    #[tokio::test]
    async fn test_warm_up_sends_one_batch_and_marks_ready() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = Arc::new(RecordingEngine::default());
        let handle = EngineHandle::new(engine.clone(), SamplingConfig::default());
        let health = ModelHealth::new();

        let executor = WarmupExecutor::new(WarmupConfig::new().with_dataset_path(write_dataset(&dir)));
        let result = executor
            .warm_up(&formatter(), &handle, &health)
            .await
            .expect("warm up");

        assert_eq!(result.status, WarmupStatus::Ready);
        assert_eq!(result.batch_size, 6);
        assert!(health.is_ready());
        let batches = engine.batches.lock().unwrap_or_else(PoisonError::into_inner);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 6);
    }

    #[tokio::test]
    async fn test_warm_up_engine_failure_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let handle = EngineHandle::new(Arc::new(FailingEngine), SamplingConfig::default());
        let health = ModelHealth::new();
        let executor = WarmupExecutor::new(WarmupConfig::new().with_dataset_path(write_dataset(&dir)));

        let err = executor
            .warm_up(&formatter(), &handle, &health)
            .await
            .expect_err("failure");
        assert!(err.to_string().contains("out of memory"));
        assert_eq!(health.status(), WarmupStatus::Failed);
        assert!(!health.is_ready());
    }

    #[tokio::test]
    async fn test_warm_up_missing_dataset_is_fatal() {
        let handle = EngineHandle::new(Arc::new(DemoEngine::new()), SamplingConfig::default());
        let health = ModelHealth::new();
        let executor = WarmupExecutor::new(WarmupConfig::new().with_dataset_path("/nonexistent.json"));
        assert!(executor.warm_up(&formatter(), &handle, &health).await.is_err());
        assert_eq!(health.status(), WarmupStatus::Failed);
    }

    #[tokio::test]
    async fn test_run_times_out() {
        let handle = EngineHandle::new(Arc::new(SlowEngine), SamplingConfig::default());
        let executor =
            WarmupExecutor::new(WarmupConfig::new().with_timeout(Duration::from_millis(20)));
        let result = executor.run(&handle, vec!["p".to_string()]).await;
        assert_eq!(result.status, WarmupStatus::TimedOut);
    }
}
