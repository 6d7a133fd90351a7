//! Reconnect controller
//!
//! Drives `Idle -> Scanning -> Connecting -> Streaming -> Backoff -> Scanning`
//! until a stop is requested or the retry budget runs out. Each connection
//! gets a fresh [`Session`]; the previous one is fully disconnected first.

use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::bluetooth::{
    DiscoveredDevice, FilterCriteria, ScanConfig, Scanner, Session, SessionHandle, SessionOptions,
    Transport,
};
use crate::error::NusError;
use crate::framing::LogLine;
use crate::lifecycle::ShutdownSignal;

/// Timing and budget of the reconnect loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// First backoff delay
    pub initial_backoff: Duration,
    /// Ceiling for the doubled backoff
    pub max_backoff: Duration,
    /// A connection live this long forgives accumulated backoff
    pub stability_window: Duration,
    /// Failed attempts allowed in a row; `None` retries forever
    pub max_retries: Option<u32>,
    /// Scan window and candidate selection
    pub scan: ScanConfig,
    /// Deadline for connect plus subscribe
    pub connect_timeout: Duration,
    /// Whether to reconnect at all after the first session ends
    pub reconnect: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(15),
            stability_window: Duration::from_secs(60),
            max_retries: None,
            scan: ScanConfig::default(),
            connect_timeout: Duration::from_secs(10),
            reconnect: true,
        }
    }
}

impl ReconnectPolicy {
    /// Set the initial backoff and its ceiling
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Set the stability window
    pub fn with_stability_window(mut self, window: Duration) -> Self {
        self.stability_window = window;
        self
    }

    /// Set the retry budget
    pub fn with_max_retries(mut self, max_retries: Option<u32>) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set scan behaviour
    pub fn with_scan(mut self, scan: ScanConfig) -> Self {
        self.scan = scan;
        self
    }

    /// Set the connect deadline
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Enable or disable reconnecting
    pub fn with_reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }
}

/// Backoff bookkeeping of the reconnect loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    /// Failed attempts since the last successful connect
    pub attempt_count: u32,
    /// Delay to use for the next backoff
    pub current_backoff: Duration,
    /// When the current connection came up
    pub last_stable_connected_at: Option<Instant>,
    initial_backoff: Duration,
}

impl RetryState {
    /// Fresh state starting at `initial_backoff`
    pub fn new(initial_backoff: Duration) -> Self {
        Self {
            attempt_count: 0,
            current_backoff: initial_backoff,
            last_stable_connected_at: None,
            initial_backoff,
        }
    }

    /// Record a successful connection
    pub fn on_connected(&mut self, now: Instant) {
        self.attempt_count = 0;
        self.last_stable_connected_at = Some(now);
    }

    /// Record the end of a connection.
    ///
    /// Returns true when the connection outlived `stability_window` and the
    /// backoff was reset.
    pub fn on_disconnected(&mut self, now: Instant, stability_window: Duration) -> bool {
        let stable = self
            .last_stable_connected_at
            .take()
            .map(|since| now.saturating_duration_since(since) >= stability_window)
            .unwrap_or(false);
        if stable {
            self.reset();
        }
        stable
    }

    /// Consume one backoff: returns the delay to wait, doubles the next one
    /// up to `max_backoff` and counts the attempt.
    pub fn next_backoff(&mut self, max_backoff: Duration) -> Duration {
        let delay = self.current_backoff.min(max_backoff);
        self.current_backoff = delay.saturating_mul(2).min(max_backoff);
        self.attempt_count = self.attempt_count.saturating_add(1);
        delay
    }

    /// Back to zero attempts and the initial backoff
    pub fn reset(&mut self) {
        self.attempt_count = 0;
        self.current_backoff = self.initial_backoff;
    }
}

/// Where the reconnect loop currently is
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    /// Not started
    #[default]
    Idle,
    /// Looking for the device
    Scanning,
    /// Connecting and subscribing
    Connecting,
    /// Lines are flowing
    Streaming,
    /// Waiting before the next attempt
    Backoff,
    /// Finished for good
    Terminated,
}

/// Snapshot of the reconnect loop, observable while it runs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconnectStatus {
    /// Current state
    pub state: ControllerState,
    /// Address of the last connected device
    pub bound_address: Option<String>,
    /// Failed attempts since the last successful connect
    pub attempt_count: u32,
    /// Delay of the next backoff
    pub current_backoff: Duration,
    /// Successful connections so far
    pub sessions: u32,
}

/// Output of [`ReconnectController::stream`]
#[derive(Debug)]
pub enum StreamEvent {
    /// A session is up; `handle` allows writes until it ends
    Connected {
        /// The connected device
        device: DiscoveredDevice,
        /// Write handle for this session
        handle: SessionHandle,
    },
    /// A decoded line
    Line(LogLine),
    /// The session ended
    Disconnected {
        /// Address of the lost device
        address: String,
    },
    /// A scan or connect attempt failed and will be retried
    AttemptFailed {
        /// The transient failure
        error: NusError,
    },
    /// Waiting `delay` before attempt number `attempt`
    Reconnecting {
        /// Attempt number since the last successful connect, starting at 1
        attempt: u32,
        /// Backoff delay
        delay: Duration,
    },
}

/// Keeps a session alive across link loss
pub struct ReconnectController {
    transport: Arc<dyn Transport>,
    criteria: FilterCriteria,
    policy: ReconnectPolicy,
    session_options: SessionOptions,
    shutdown: ShutdownSignal,
    bound_address: Option<String>,
    status: watch::Sender<ReconnectStatus>,
}

impl ReconnectController {
    /// Create a controller looking for devices matching `criteria`
    pub fn new(transport: Arc<dyn Transport>, criteria: FilterCriteria, policy: ReconnectPolicy) -> Self {
        let (status, _) = watch::channel(ReconnectStatus {
            current_backoff: policy.initial_backoff,
            ..ReconnectStatus::default()
        });
        Self {
            transport,
            criteria,
            policy,
            session_options: SessionOptions::default(),
            shutdown: ShutdownSignal::never(),
            bound_address: None,
            status,
        }
    }

    /// Set options for every session
    pub fn with_session_options(mut self, options: SessionOptions) -> Self {
        self.session_options = options;
        self
    }

    /// Observe `shutdown` at every suspension point
    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Current state
    pub fn state(&self) -> ControllerState {
        self.status.borrow().state
    }

    /// Current status snapshot
    pub fn status(&self) -> ReconnectStatus {
        self.status.borrow().clone()
    }

    /// Receiver following status changes from other tasks
    pub fn watch_status(&self) -> watch::Receiver<ReconnectStatus> {
        self.status.subscribe()
    }

    /// Address of the last connected device
    pub fn bound_address(&self) -> Option<&str> {
        self.bound_address.as_deref()
    }

    /// Run the reconnect loop as a lazy stream.
    ///
    /// Transient failures appear as [`StreamEvent::AttemptFailed`] and never
    /// end the stream. It ends with `Err(MaxRetriesExceeded)` when the retry
    /// budget is exhausted, with `Err` for a non-transient failure, or
    /// without an error when a stop is requested or reconnecting is disabled.
    pub fn stream(&mut self) -> impl Stream<Item = Result<StreamEvent, NusError>> + '_ {
        async_stream::stream! {
            let scanner = Scanner::new(self.transport.clone()).with_shutdown(self.shutdown.clone());
            let mut retry = RetryState::new(self.policy.initial_backoff);
            self.publish(&retry, None);

            loop {
                if self.shutdown.is_cancelled() {
                    break;
                }

                let criteria = self.criteria.clone().with_early_match(
                    self.bound_address
                        .clone()
                        .or_else(|| self.criteria.early_match_address.clone()),
                );

                match self.establish(&scanner, &criteria).await {
                    Ok((device, mut session)) => {
                        retry.on_connected(Instant::now());
                        self.bound_address = Some(device.address.clone());
                        self.status.send_modify(|s| s.sessions += 1);
                        self.publish(&retry, Some(ControllerState::Streaming));

                        if let Some(handle) = session.handle() {
                            yield Ok(StreamEvent::Connected { device: device.clone(), handle });
                        }
                        {
                            let lines = session.iter_lines();
                            futures::pin_mut!(lines);
                            while let Some(line) = lines.next().await {
                                yield Ok(StreamEvent::Line(line));
                            }
                        }
                        session.disconnect().await;

                        if self.shutdown.is_cancelled() {
                            break;
                        }
                        info!("Disconnected from {}", device.address);
                        yield Ok(StreamEvent::Disconnected { address: device.address.clone() });

                        if retry.on_disconnected(Instant::now(), self.policy.stability_window) {
                            debug!("Connection was stable; backoff reset");
                        }
                        if !self.policy.reconnect {
                            debug!("Reconnect disabled; stopping after the first session");
                            break;
                        }
                    }
                    Err(NusError::Cancelled) => break,
                    Err(e) if e.is_transient() && self.policy.reconnect => {
                        warn!("Connection attempt failed: {}", e);
                        yield Ok(StreamEvent::AttemptFailed { error: e });
                    }
                    Err(e) => {
                        self.publish(&retry, Some(ControllerState::Terminated));
                        yield Err(e);
                        return;
                    }
                }

                let attempt = retry.attempt_count + 1;
                if let Some(max) = self.policy.max_retries {
                    if attempt > max {
                        warn!("Giving up after {} failed reconnect attempts", max);
                        self.publish(&retry, Some(ControllerState::Terminated));
                        yield Err(NusError::MaxRetriesExceeded { attempts: max });
                        return;
                    }
                }

                let delay = retry.next_backoff(self.policy.max_backoff);
                self.publish(&retry, Some(ControllerState::Backoff));
                info!("Reconnecting in {:.1}s (attempt {})", delay.as_secs_f64(), attempt);
                yield Ok(StreamEvent::Reconnecting { attempt, delay });

                if self.shutdown.sleep(delay).await.is_err() {
                    break;
                }
            }

            self.publish(&retry, Some(ControllerState::Terminated));
        }
    }

    /// Scan for the device and connect a fresh session
    async fn establish(
        &self,
        scanner: &Scanner,
        criteria: &FilterCriteria,
    ) -> Result<(DiscoveredDevice, Session), NusError> {
        self.status.send_modify(|s| s.state = ControllerState::Scanning);
        let device = scanner.find_device(criteria, &self.policy.scan).await?;

        self.status.send_modify(|s| s.state = ControllerState::Connecting);
        let mut session = Session::new(self.transport.clone())
            .with_options(self.session_options)
            .with_shutdown(self.shutdown.clone());
        session.connect(&device, self.policy.connect_timeout).await?;
        Ok((device, session))
    }

    fn publish(&self, retry: &RetryState, state: Option<ControllerState>) {
        let bound = self.bound_address.clone();
        self.status.send_modify(|s| {
            if let Some(state) = state {
                s.state = state;
            }
            s.bound_address = bound;
            s.attempt_count = retry.attempt_count;
            s.current_backoff = retry.current_backoff;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_sequence_is_capped() {
        let mut retry = RetryState::new(Duration::from_secs(1));
        let delays: Vec<u64> = (0..7)
            .map(|_| retry.next_backoff(Duration::from_secs(15)).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 15, 15, 15]);
        assert_eq!(retry.attempt_count, 7);
    }

    #[test]
    fn test_default_backoff_starts_at_half_second() {
        let policy = ReconnectPolicy::default();
        let mut retry = RetryState::new(policy.initial_backoff);
        assert_eq!(retry.next_backoff(policy.max_backoff), Duration::from_millis(500));
        assert_eq!(retry.next_backoff(policy.max_backoff), Duration::from_secs(1));
    }

    #[test]
    fn test_connect_resets_attempts_but_not_backoff() {
        let mut retry = RetryState::new(Duration::from_secs(1));
        retry.next_backoff(Duration::from_secs(15));
        retry.next_backoff(Duration::from_secs(15));
        retry.on_connected(Instant::now());

        assert_eq!(retry.attempt_count, 0);
        assert_eq!(retry.current_backoff, Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stable_connection_resets_backoff() {
        let window = Duration::from_secs(60);
        let mut retry = RetryState::new(Duration::from_secs(1));
        for _ in 0..4 {
            retry.next_backoff(Duration::from_secs(15));
        }
        retry.on_connected(Instant::now());
        tokio::time::advance(Duration::from_secs(61)).await;

        assert!(retry.on_disconnected(Instant::now(), window));
        assert_eq!(retry.attempt_count, 0);
        assert_eq!(retry.current_backoff, Duration::from_secs(1));
        assert!(retry.last_stable_connected_at.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_connection_keeps_backoff() {
        let window = Duration::from_secs(60);
        let mut retry = RetryState::new(Duration::from_secs(1));
        retry.next_backoff(Duration::from_secs(15));
        retry.next_backoff(Duration::from_secs(15));
        retry.on_connected(Instant::now());
        tokio::time::advance(Duration::from_secs(5)).await;

        assert!(!retry.on_disconnected(Instant::now(), window));
        assert_eq!(retry.current_backoff, Duration::from_secs(4));
    }

    #[test]
    fn test_policy_builders() {
        let policy = ReconnectPolicy::default()
            .with_backoff(Duration::from_secs(1), Duration::from_secs(30))
            .with_max_retries(Some(3))
            .with_reconnect(false)
            .with_connect_timeout(Duration::from_secs(4));
        assert_eq!(policy.initial_backoff, Duration::from_secs(1));
        assert_eq!(policy.max_backoff, Duration::from_secs(30));
        assert_eq!(policy.max_retries, Some(3));
        assert!(!policy.reconnect);
        assert_eq!(policy.connect_timeout, Duration::from_secs(4));
        assert_eq!(policy.stability_window, Duration::from_secs(60));
    }
}
