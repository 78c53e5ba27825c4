//! Connection state machine and reconnect scheduling.
//!
//! ```text
//! disconnected -> connecting -> connected -> reconnecting -> connected
//!                                                         \-> failed
//! ```
//!
//! `mark_*` calls come from the owning session as its handshake progresses.
//! Loss signals start a reconnect plan: attempt `n` runs after
//! `min(initial_delay * 2^(n-1), max_delay)`, and `max_retries` failed
//! attempts end in the terminal `failed` state. With `max_retries` at zero a
//! loss goes straight to `failed`.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use toolhub_core::ReconnectSettings;

/// Connection state of one backend session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backoff tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectConfig {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::from(&ReconnectSettings::default())
    }
}

impl From<&ReconnectSettings> for ReconnectConfig {
    fn from(settings: &ReconnectSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            initial_delay: settings.initial_delay(),
            max_delay: settings.max_delay(),
        }
    }
}

impl ReconnectConfig {
    /// Delay before attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

/// Progress of the current reconnect sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPlan {
    /// Failed attempts so far.
    pub retry_count: u32,
    /// Delay before the pending attempt.
    pub delay: Duration,
    pub max_retries: u32,
    pub max_delay: Duration,
}

/// Re-establishes a session; `true` on success.
#[async_trait]
pub trait Reconnector: Send + Sync {
    async fn reconnect(&self) -> bool;
}

/// Notified after every state transition.
pub type StateObserver = Arc<dyn Fn(ConnectionState) + Send + Sync>;

struct MonitorState {
    connection: ConnectionState,
    plan: Option<ReconnectPlan>,
    timer: Option<JoinHandle<()>>,
    disposed: bool,
}

impl MonitorState {
    fn transition(&mut self, next: ConnectionState) -> Option<ConnectionState> {
        if self.connection == next {
            return None;
        }
        self.connection = next;
        Some(next)
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct MonitorInner {
    name: String,
    config: ReconnectConfig,
    reconnector: Arc<dyn Reconnector>,
    observer: Option<StateObserver>,
    state: Mutex<MonitorState>,
}

impl MonitorInner {
    fn notify(&self, changed: Option<ConnectionState>) {
        if let (Some(state), Some(observer)) = (changed, self.observer.as_ref()) {
            observer(state);
        }
    }

    /// Arm the timer for the next attempt of the current plan.
    fn schedule(self: &Arc<Self>, state: &mut MonitorState) {
        let Some(plan) = state.plan.as_mut() else {
            return;
        };
        let attempt = plan.retry_count + 1;
        let delay = self.config.delay_for_attempt(attempt);
        plan.delay = delay;

        debug!(session = %self.name, attempt, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");

        let weak = Arc::downgrade(self);
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            MonitorInner::attempt(weak, attempt).await;
        }));
    }

    async fn attempt(weak: Weak<Self>, attempt: u32) {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if inner.state.lock().disposed {
            return;
        }

        info!(session = %inner.name, attempt, "Attempting reconnect");
        let reconnected = inner.reconnector.reconnect().await;

        let changed = {
            let mut state = inner.state.lock();
            if state.disposed || state.connection != ConnectionState::Reconnecting {
                return;
            }

            if reconnected {
                info!(session = %inner.name, attempt, "Reconnected");
                state.plan = None;
                state.timer = None;
                state.transition(ConnectionState::Connected)
            } else {
                let exhausted = match state.plan.as_mut() {
                    Some(plan) => {
                        plan.retry_count += 1;
                        plan.retry_count >= plan.max_retries
                    }
                    None => true,
                };
                if exhausted {
                    error!(session = %inner.name, attempts = attempt, "Reconnect attempts exhausted");
                    state.plan = None;
                    state.timer = None;
                    state.transition(ConnectionState::Failed)
                } else {
                    warn!(session = %inner.name, attempt, "Reconnect attempt failed");
                    inner.schedule(&mut state);
                    None
                }
            }
        };

        inner.notify(changed);
    }
}

/// Per-session state machine with exponential-backoff reconnects.
///
/// Clones share the same machine.
#[derive(Clone)]
pub struct ConnectionMonitor {
    inner: Arc<MonitorInner>,
}

impl ConnectionMonitor {
    pub fn new(
        name: impl Into<String>,
        config: ReconnectConfig,
        reconnector: Arc<dyn Reconnector>,
        observer: Option<StateObserver>,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                name: name.into(),
                config,
                reconnector,
                observer,
                state: Mutex::new(MonitorState {
                    connection: ConnectionState::Disconnected,
                    plan: None,
                    timer: None,
                    disposed: false,
                }),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().connection
    }

    /// The reconnect sequence in progress, if any.
    pub fn plan(&self) -> Option<ReconnectPlan> {
        self.inner.state.lock().plan
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.inner.config
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.state.lock().disposed
    }

    /// The session started a handshake.
    pub fn mark_connecting(&self) {
        self.set(ConnectionState::Connecting);
    }

    /// Like [`mark_connecting`](Self::mark_connecting), but refused while a
    /// reconnect sequence owns the session. Returns whether it took effect.
    pub fn try_mark_connecting(&self) -> bool {
        let changed = {
            let mut state = self.inner.state.lock();
            if state.connection == ConnectionState::Reconnecting {
                debug!(session = %self.inner.name, "Reconnect in progress, refusing manual connect");
                return false;
            }
            if state.disposed {
                return true;
            }
            state.cancel_timer();
            state.plan = None;
            state.transition(ConnectionState::Connecting)
        };
        self.inner.notify(changed);
        true
    }

    /// The session completed a handshake outside the reconnect path.
    pub fn mark_connected(&self) {
        self.set(ConnectionState::Connected);
    }

    /// The session gave up on a connection outside the reconnect path.
    pub fn mark_disconnected(&self) {
        self.set(ConnectionState::Disconnected);
    }

    fn set(&self, next: ConnectionState) {
        let changed = {
            let mut state = self.inner.state.lock();
            if state.disposed {
                return;
            }
            state.cancel_timer();
            state.plan = None;
            state.transition(next)
        };
        if let Some(state) = changed {
            debug!(session = %self.inner.name, state = %state, "Connection state changed");
        }
        self.inner.notify(changed);
    }

    /// The transport closed or a health check gave up.
    pub fn handle_connection_lost(&self) {
        self.begin_reconnect("connection lost");
    }

    /// The transport reported an error.
    pub fn handle_error(&self, error: &dyn fmt::Display) {
        let reason = error.to_string();
        self.begin_reconnect(&reason);
    }

    fn begin_reconnect(&self, reason: &str) {
        let changed = {
            let mut state = self.inner.state.lock();
            if state.disposed {
                return;
            }
            match state.connection {
                ConnectionState::Reconnecting | ConnectionState::Failed => {
                    debug!(session = %self.inner.name, state = %state.connection, reason, "Ignoring loss signal");
                    return;
                }
                _ => {}
            }

            state.cancel_timer();
            if self.inner.config.max_retries == 0 {
                error!(session = %self.inner.name, reason, "Connection lost and reconnects are disabled");
                state.plan = None;
                state.transition(ConnectionState::Failed)
            } else {
                warn!(session = %self.inner.name, reason, "Connection lost, reconnecting");
                self.start_plan(&mut state)
            }
        };
        self.inner.notify(changed);
    }

    fn start_plan(&self, state: &mut MonitorState) -> Option<ConnectionState> {
        state.plan = Some(ReconnectPlan {
            retry_count: 0,
            delay: self.inner.config.initial_delay,
            max_retries: self.inner.config.max_retries,
            max_delay: self.inner.config.max_delay,
        });
        let changed = state.transition(ConnectionState::Reconnecting);
        self.inner.schedule(state);
        changed
    }

    /// Cancel any pending attempt and ignore everything afterwards.
    pub fn dispose(&self) {
        let mut state = self.inner.state.lock();
        if state.disposed {
            return;
        }
        debug!(session = %self.inner.name, "Disposing connection monitor");
        state.disposed = true;
        state.plan = None;
        state.cancel_timer();
    }
}

impl fmt::Debug for ConnectionMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ConnectionMonitor")
            .field("name", &self.inner.name)
            .field("state", &state.connection)
            .field("plan", &state.plan)
            .field("disposed", &state.disposed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tokio::time::Instant;

    /// Records when it was called and answers from a script (then `false`).
    struct ScriptedReconnector {
        answers: Mutex<VecDeque<bool>>,
        calls: Mutex<Vec<Instant>>,
    }

    impl ScriptedReconnector {
        fn new(answers: &[bool]) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers.iter().copied().collect()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().len()
        }

        fn gaps_ms(&self, start: Instant) -> Vec<u64> {
            let mut previous = start;
            self.calls
                .lock()
                .iter()
                .map(|at| {
                    let gap = at.duration_since(previous).as_millis() as u64;
                    previous = *at;
                    gap
                })
                .collect()
        }
    }

    #[async_trait]
    impl Reconnector for ScriptedReconnector {
        async fn reconnect(&self) -> bool {
            self.calls.lock().push(Instant::now());
            self.answers.lock().pop_front().unwrap_or(false)
        }
    }

    fn config(max_retries: u32) -> ReconnectConfig {
        ReconnectConfig {
            max_retries,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
        }
    }

    fn recording_observer() -> (Arc<Mutex<Vec<ConnectionState>>>, StateObserver) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handle = Arc::clone(&seen);
        (seen, Arc::new(move |state| handle.lock().push(state)))
    }

    fn connected_monitor(
        max_retries: u32,
        reconnector: Arc<ScriptedReconnector>,
        observer: Option<StateObserver>,
    ) -> ConnectionMonitor {
        let monitor = ConnectionMonitor::new("test", config(max_retries), reconnector, observer);
        monitor.mark_connecting();
        monitor.mark_connected();
        monitor
    }

    #[test]
    fn test_delay_for_attempt() {
        let config = config(10);
        let delays: Vec<u64> = (1..=7)
            .map(|n| config.delay_for_attempt(n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000, 1000]);
        assert_eq!(config.delay_for_attempt(200), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_sequence_until_failed() {
        let reconnector = ScriptedReconnector::new(&[]);
        let monitor = connected_monitor(10, reconnector.clone(), None);

        let start = Instant::now();
        monitor.handle_connection_lost();
        assert_eq!(monitor.state(), ConnectionState::Reconnecting);

        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(
            reconnector.gaps_ms(start),
            vec![100, 200, 400, 800, 1000, 1000, 1000, 1000, 1000, 1000]
        );
        assert_eq!(monitor.state(), ConnectionState::Failed);
        assert!(monitor.plan().is_none());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(reconnector.call_count(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_retry_count() {
        let reconnector = ScriptedReconnector::new(&[false, false, true]);
        let monitor = connected_monitor(10, reconnector.clone(), None);

        monitor.handle_connection_lost();
        tokio::time::sleep(Duration::from_millis(701)).await;
        assert_eq!(reconnector.call_count(), 3);
        assert_eq!(monitor.state(), ConnectionState::Connected);
        assert!(monitor.plan().is_none());

        // A new loss starts over at the initial delay
        let start = Instant::now();
        monitor.handle_connection_lost();
        assert_eq!(monitor.plan().unwrap().retry_count, 0);
        tokio::time::sleep(Duration::from_millis(101)).await;
        assert_eq!(reconnector.gaps_ms(start).last(), Some(&100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_plan_tracks_failed_attempts() {
        let reconnector = ScriptedReconnector::new(&[]);
        let monitor = connected_monitor(10, reconnector.clone(), None);

        monitor.handle_connection_lost();
        tokio::time::sleep(Duration::from_millis(301)).await;

        let plan = monitor.plan().unwrap();
        assert_eq!(plan.retry_count, 2);
        assert_eq!(plan.delay, Duration::from_millis(400));
        assert_eq!(plan.max_retries, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_cancels_pending_attempt() {
        let reconnector = ScriptedReconnector::new(&[true]);
        let (seen, observer) = recording_observer();
        let monitor = connected_monitor(10, reconnector.clone(), Some(observer));

        monitor.handle_connection_lost();
        monitor.dispose();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(reconnector.call_count(), 0);
        monitor.handle_connection_lost();
        monitor.mark_connected();
        assert_eq!(
            *seen.lock(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Reconnecting,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_loss_while_reconnecting_is_noop() {
        let reconnector = ScriptedReconnector::new(&[true]);
        let monitor = connected_monitor(10, reconnector.clone(), None);

        let start = Instant::now();
        monitor.handle_connection_lost();
        tokio::time::sleep(Duration::from_millis(50)).await;
        monitor.handle_connection_lost();
        monitor.handle_error(&"broken pipe");
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(reconnector.gaps_ms(start), vec![100]);
        assert_eq!(monitor.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_is_terminal_for_loss_signals() {
        let reconnector = ScriptedReconnector::new(&[]);
        let monitor = connected_monitor(2, reconnector.clone(), None);

        monitor.handle_error(&"reset by peer");
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(monitor.state(), ConnectionState::Failed);
        assert_eq!(reconnector.call_count(), 2);

        monitor.handle_connection_lost();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(reconnector.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_retries_fails_without_attempt() {
        let reconnector = ScriptedReconnector::new(&[true]);
        let (seen, observer) = recording_observer();
        let monitor = connected_monitor(0, reconnector.clone(), Some(observer));

        monitor.handle_connection_lost();
        assert_eq!(monitor.state(), ConnectionState::Failed);
        assert!(monitor.plan().is_none());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(reconnector.call_count(), 0);
        assert_eq!(
            *seen.lock(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Failed,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_connect_refused_while_reconnecting() {
        let reconnector = ScriptedReconnector::new(&[true]);
        let monitor = connected_monitor(5, reconnector.clone(), None);

        monitor.handle_connection_lost();
        assert!(!monitor.try_mark_connecting());
        assert_eq!(monitor.state(), ConnectionState::Reconnecting);
        assert!(monitor.plan().is_some());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(reconnector.call_count(), 1);
        assert_eq!(monitor.state(), ConnectionState::Connected);
        assert!(monitor.try_mark_connecting());
        assert_eq!(monitor.state(), ConnectionState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_sees_each_transition_once() {
        let reconnector = ScriptedReconnector::new(&[true]);
        let (seen, observer) = recording_observer();
        let monitor = connected_monitor(10, reconnector, Some(observer));

        monitor.mark_connected();
        monitor.handle_connection_lost();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(
            *seen.lock(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Reconnecting,
                ConnectionState::Connected,
            ]
        );
    }

    #[test]
    fn test_state_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&ConnectionState::Reconnecting).unwrap(), "\"reconnecting\"");
        assert_eq!(ConnectionState::Failed.to_string(), "failed");
    }
}
