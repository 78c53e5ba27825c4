//! Periodic liveness checks.
//!
//! A [`HealthChecker`] runs one check loop per session: check, record the
//! outcome, sleep `interval`, repeat. Crossing the failure threshold fires
//! `on_unhealthy` once per episode; the first success afterwards fires
//! `on_healthy` once.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::AUTHORIZATION;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Outcome of one check. `Ok(false)` and `Err(_)` both count as failures.
pub type LivenessResult = Result<bool, Box<dyn std::error::Error + Send + Sync>>;

/// Edge callback.
pub type HealthCallback = Arc<dyn Fn() + Send + Sync>;

/// Default number of consecutive failures before a target is unhealthy.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// A single liveness check.
#[async_trait]
pub trait LivenessCheck: Send + Sync {
    async fn check(&self) -> LivenessResult;
}

/// GETs a URL; any 2xx is healthy.
#[derive(Debug, Clone)]
pub struct HttpLivenessCheck {
    client: reqwest::Client,
    url: String,
    credential: Option<String>,
    timeout: Duration,
}

impl HttpLivenessCheck {
    pub fn new(url: impl Into<String>, credential: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            credential,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl LivenessCheck for HttpLivenessCheck {
    async fn check(&self) -> LivenessResult {
        let mut request = self.client.get(&self.url).timeout(self.timeout);
        if let Some(ref credential) = self.credential {
            request = request.header(AUTHORIZATION, format!("Bearer {}", credential));
        }
        let response = request.send().await?;
        Ok(response.status().is_success())
    }
}

#[derive(Debug, Default)]
struct CheckerState {
    consecutive_failures: u32,
    unhealthy: bool,
    task: Option<JoinHandle<()>>,
}

enum Edge {
    Unhealthy,
    Healthy,
}

impl CheckerState {
    fn record(&mut self, healthy: bool, threshold: u32) -> Option<Edge> {
        if healthy {
            self.consecutive_failures = 0;
            if self.unhealthy {
                self.unhealthy = false;
                return Some(Edge::Healthy);
            }
            return None;
        }

        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures >= threshold && !self.unhealthy {
            self.unhealthy = true;
            return Some(Edge::Unhealthy);
        }
        None
    }
}

/// Periodic checker with edge-triggered callbacks.
pub struct HealthChecker {
    name: String,
    check: Arc<dyn LivenessCheck>,
    interval: Duration,
    failure_threshold: u32,
    on_unhealthy: Option<HealthCallback>,
    on_healthy: Option<HealthCallback>,
    state: Arc<Mutex<CheckerState>>,
}

impl HealthChecker {
    /// Create a stopped checker.
    pub fn new(name: impl Into<String>, check: Arc<dyn LivenessCheck>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            check,
            interval,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            on_unhealthy: None,
            on_healthy: None,
            state: Arc::new(Mutex::new(CheckerState::default())),
        }
    }

    /// Set the failure threshold (minimum 1).
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn on_unhealthy(mut self, callback: HealthCallback) -> Self {
        self.on_unhealthy = Some(callback);
        self
    }

    pub fn on_healthy(mut self, callback: HealthCallback) -> Self {
        self.on_healthy = Some(callback);
        self
    }

    /// Start probing: once now, then every interval. No-op if running.
    ///
    /// A fresh start forgets failures from any previous run.
    pub fn start(&self) {
        let mut state = self.state.lock();
        if state.task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        state.consecutive_failures = 0;
        state.unhealthy = false;

        debug!(target_name = %self.name, interval_ms = self.interval.as_millis() as u64, "Starting health checks");

        let name = self.name.clone();
        let check = Arc::clone(&self.check);
        let interval = self.interval;
        let threshold = self.failure_threshold;
        let on_unhealthy = self.on_unhealthy.clone();
        let on_healthy = self.on_healthy.clone();
        let shared = Arc::clone(&self.state);

        state.task = Some(tokio::spawn(async move {
            loop {
                let healthy = match check.check().await {
                    Ok(healthy) => healthy,
                    Err(e) => {
                        debug!(target_name = %name, error = %e, "Health check errored");
                        false
                    }
                };

                // Callbacks run outside the lock
                let edge = shared.lock().record(healthy, threshold);
                match edge {
                    Some(Edge::Unhealthy) => {
                        warn!(target_name = %name, threshold, "Health check threshold reached");
                        if let Some(ref callback) = on_unhealthy {
                            callback();
                        }
                    }
                    Some(Edge::Healthy) => {
                        info!(target_name = %name, "Health check recovered");
                        if let Some(ref callback) = on_healthy {
                            callback();
                        }
                    }
                    None => {}
                }

                tokio::time::sleep(interval).await;
            }
        }));
    }

    /// Stop probing and cancel the pending timer. No-op if stopped.
    pub fn stop(&self) {
        if let Some(task) = self.state.lock().task.take() {
            debug!(target_name = %self.name, "Stopping health checks");
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.state
            .lock()
            .task
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }

    pub fn is_unhealthy(&self) -> bool {
        self.state.lock().unhealthy
    }
}

impl Drop for HealthChecker {
    fn drop(&mut self) {
        if let Some(task) = self.state.lock().task.take() {
            task.abort();
        }
    }
}

impl fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthChecker")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("failure_threshold", &self.failure_threshold)
            .field("running", &self.is_running())
            .finish()
    }
}
