//! End-to-end logger: reconnect loop, rendering, log file and subscribers

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::mpsc::Receiver;
use tokio::sync::{watch, Mutex};

use crate::bluetooth::{
    sort_by_signal, DiscoveredDevice, EventBroker, EventFilter, FilterCriteria, LoggerEvent, Scanner,
    SessionHandle, SubscriberId, Transport,
};
use crate::config::LoggerSettings;
use crate::error::NusError;
use crate::framing::LogLine;
use crate::lifecycle::ShutdownSignal;
use crate::output::{LineFormatter, LogFile};
use crate::reconnect::{ControllerState, ReconnectController, ReconnectStatus, StreamEvent};

/// Rendered lines kept for [`LoggerController::tail`]
pub const TAIL_CAPACITY: usize = 1000;

/// Snapshot of the logger for status displays
#[derive(Debug, Clone, Serialize)]
pub struct LoggerStatus {
    /// Reconnect loop state
    pub state: ControllerState,
    /// Whether a session is currently streaming
    pub connected: bool,
    /// Whether a scan or connect is in flight
    pub connecting: bool,
    /// The connected or last connected device
    pub device: Option<DiscoveredDevice>,
    /// Failed attempts since the last successful connect
    pub retries: u32,
    /// Successful connections so far
    pub sessions: u32,
    /// Settings the logger runs with
    pub settings: LoggerSettings,
}

/// Why [`LoggerController::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A stop was requested
    Shutdown,
    /// Reconnecting is disabled and the session ended
    SessionEnded,
    /// The retry budget ran out
    RetriesExhausted {
        /// Failed attempts that were allowed
        attempts: u32,
    },
}

/// Outcome of one logger run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Why the run ended
    pub reason: StopReason,
    /// Successful connections
    pub sessions: u32,
    /// Lines rendered
    pub lines: u64,
}

#[derive(Default)]
struct SharedState {
    broker: EventBroker,
    tail: VecDeque<String>,
    device: Option<DiscoveredDevice>,
    connected: bool,
    status: Option<watch::Receiver<ReconnectStatus>>,
}

/// Streams device lines to stdout, a log file and in-process subscribers
pub struct LoggerController {
    transport: Arc<dyn Transport>,
    settings: LoggerSettings,
    formatter: LineFormatter,
    shutdown: ShutdownSignal,
    echo: bool,
    state: Mutex<SharedState>,
}

impl LoggerController {
    /// Create a controller; settings are validated here
    pub fn new(transport: Arc<dyn Transport>, settings: LoggerSettings) -> Result<Self, NusError> {
        settings.validate()?;
        Ok(Self {
            transport,
            formatter: settings.formatter(),
            settings,
            shutdown: ShutdownSignal::never(),
            echo: true,
            state: Mutex::new(SharedState::default()),
        })
    }

    /// Observe `shutdown` at every suspension point
    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Print rendered lines to stdout (on by default)
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Settings in use
    pub fn settings(&self) -> &LoggerSettings {
        &self.settings
    }

    /// Subscribe to logger events
    pub async fn subscribe(&self, filter: EventFilter) -> (SubscriberId, Receiver<LoggerEvent>) {
        self.state.lock().await.broker.subscribe(filter)
    }

    /// Stop delivering events to `id`
    pub async fn unsubscribe(&self, id: SubscriberId) {
        self.state.lock().await.broker.unsubscribe(id);
    }

    /// Up to `limit` most recent rendered lines, oldest first
    pub async fn tail(&self, limit: usize) -> Vec<String> {
        let state = self.state.lock().await;
        let skip = state.tail.len().saturating_sub(limit);
        state.tail.iter().skip(skip).cloned().collect()
    }

    /// Current status
    pub async fn status(&self) -> LoggerStatus {
        let state = self.state.lock().await;
        let reconnect = state
            .status
            .as_ref()
            .map(|rx| rx.borrow().clone())
            .unwrap_or_default();
        LoggerStatus {
            state: reconnect.state,
            connected: state.connected,
            connecting: matches!(reconnect.state, ControllerState::Scanning | ControllerState::Connecting),
            device: state.device.clone(),
            retries: reconnect.attempt_count,
            sessions: reconnect.sessions,
            settings: self.settings.clone(),
        }
    }

    /// Batch scan without a service requirement, strongest signal first
    pub async fn scan(&self, name: &str, timeout: Option<Duration>) -> Result<Vec<DiscoveredDevice>, NusError> {
        let scanner = Scanner::new(self.transport.clone()).with_shutdown(self.shutdown.clone());
        let mut devices = scanner
            .scan(
                &FilterCriteria::new(name.trim()),
                timeout.unwrap_or_else(|| self.settings.scan_timeout()),
            )
            .await?;
        sort_by_signal(&mut devices);
        Ok(devices)
    }

    /// Run until a stop is requested, the retry budget is exhausted or, with
    /// reconnecting disabled, the first session ends.
    ///
    /// Non-transient failures (missing adapter or permission, IO errors on
    /// the log file) are returned as errors.
    pub async fn run(&self) -> Result<RunSummary, NusError> {
        let mut logfile = match &self.settings.logfile {
            Some(path) => {
                let file = LogFile::open(path)?;
                info!("Logging to {}", path.display());
                Some(file)
            }
            None => None,
        };

        let mut reconnect = ReconnectController::new(
            self.transport.clone(),
            self.settings.filter_criteria(),
            self.settings.reconnect_policy(),
        )
        .with_session_options(self.settings.session_options())
        .with_shutdown(self.shutdown.clone());
        self.state.lock().await.status = Some(reconnect.watch_status());

        let mut lines: u64 = 0;
        let mut failure = None;
        let mut reason = if self.settings.reconnect {
            StopReason::Shutdown
        } else {
            StopReason::SessionEnded
        };

        {
            let events = reconnect.stream();
            futures::pin_mut!(events);
            while let Some(event) = events.next().await {
                match event {
                    Ok(StreamEvent::Connected { device, handle }) => {
                        self.on_connected(&device, &handle).await;
                    }
                    Ok(StreamEvent::Line(line)) => {
                        lines += 1;
                        self.emit(&line, logfile.as_mut()).await;
                    }
                    Ok(StreamEvent::Disconnected { address }) => {
                        warn!("Disconnected from {}", address);
                        let mut state = self.state.lock().await;
                        state.connected = false;
                        state.broker.publish(&LoggerEvent::Disconnected { address });
                    }
                    Ok(StreamEvent::AttemptFailed { error }) => {
                        warn!("BLE error: {}", error);
                        if let Some(hint) = error.hint() {
                            warn!("Hint: {}", hint);
                        }
                        self.state
                            .lock()
                            .await
                            .broker
                            .publish(&LoggerEvent::Error(error.to_string()));
                    }
                    Ok(StreamEvent::Reconnecting { attempt, delay }) => {
                        self.state
                            .lock()
                            .await
                            .broker
                            .publish(&LoggerEvent::Reconnecting { attempt, delay });
                    }
                    Err(NusError::MaxRetriesExceeded { attempts }) => {
                        error!("Max retries reached, exiting.");
                        reason = StopReason::RetriesExhausted { attempts };
                    }
                    Err(e) => {
                        error!("{}", e);
                        if let Some(hint) = e.hint() {
                            error!("Hint: {}", hint);
                        }
                        failure = Some(e);
                    }
                }
            }
        }

        if self.shutdown.is_cancelled() {
            reason = StopReason::Shutdown;
        }
        let sessions = reconnect.status().sessions;
        self.close(logfile.as_mut()).await;

        match failure {
            Some(e) => Err(e),
            None => {
                debug!("Logger stopped: {:?} after {} session(s)", reason, sessions);
                Ok(RunSummary {
                    reason,
                    sessions,
                    lines,
                })
            }
        }
    }

    async fn on_connected(&self, device: &DiscoveredDevice, handle: &SessionHandle) {
        let rssi = device
            .rssi
            .map(|r| format!("{}dBm", r))
            .unwrap_or_else(|| "?".to_string());
        info!("Connected to {} ({}) RSSI={}", device.display_name(), device.address, rssi);

        {
            let mut state = self.state.lock().await;
            state.device = Some(device.clone());
            state.connected = true;
            state.broker.publish(&LoggerEvent::Connected {
                address: device.address.clone(),
                name: device.display_name().to_string(),
            });
        }

        if self.settings.verbose {
            match handle.describe_services().await {
                Ok(dump) => info!("Services:\n{}", dump.trim_end()),
                Err(e) => warn!("Could not list services: {}", e),
            }
        }

        if let Some(text) = &self.settings.send {
            let mut payload = text.clone().into_bytes();
            payload.push(b'\n');
            if let Err(e) = handle.write(&payload).await {
                warn!("{}", e);
                self.state
                    .lock()
                    .await
                    .broker
                    .publish(&LoggerEvent::Error(e.to_string()));
            }
        }
    }

    async fn emit(&self, line: &LogLine, logfile: Option<&mut LogFile>) {
        let rendered = self.formatter.render(line);
        if self.echo {
            println!("{}", rendered);
        }
        if let Some(file) = logfile {
            if let Err(e) = file.append(&rendered) {
                warn!("Failed to write {}: {}", file.path().display(), e);
            }
        }
        if rendered.is_empty() {
            return;
        }

        let mut state = self.state.lock().await;
        state.tail.push_back(rendered.clone());
        while state.tail.len() > TAIL_CAPACITY {
            state.tail.pop_front();
        }
        state.broker.publish(&LoggerEvent::Line(rendered));
    }

    async fn close(&self, logfile: Option<&mut LogFile>) {
        if let Some(file) = logfile {
            if let Err(e) = file.flush() {
                warn!("Failed to flush {}: {}", file.path().display(), e);
            }
        }
        let mut state = self.state.lock().await;
        state.connected = false;
        state.broker.shutdown();
    }
}
