//! One NUS connection
//!
//! A [`Session`] represents exactly one link's lifetime:
//! `Disconnected -> Connecting -> Connected -> Disconnected`. Link loss is
//! terminal for the instance; reconnecting is the job of
//! [`crate::reconnect::ReconnectController`], which builds a fresh session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use log::{debug, info, warn};
use tokio::time::timeout;

use crate::bluetooth::filter::FilterCriteria;
use crate::bluetooth::scanner::{DiscoveredDevice, Scanner};
use crate::bluetooth::transport::{Link, LinkEvent, LinkEventStream, Transport};
use crate::error::NusError;
use crate::framing::{FramerOptions, LineFramer, LogLine};
use crate::lifecycle::ShutdownSignal;

/// Upper bound on cleanup after an abandoned connect
const RELEASE_TIMEOUT: Duration = Duration::from_secs(2);

/// Connection state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No link, either not yet connected or already finished
    Disconnected,
    /// Connect or subscribe in flight
    Connecting,
    /// Notifications are flowing
    Connected,
}

/// Options for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// What each framed line carries
    pub framer: FramerOptions,
    /// Emit the unterminated tail as a final line when the link ends
    pub flush_tail_on_disconnect: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            framer: FramerOptions::default(),
            flush_tail_on_disconnect: true,
        }
    }
}

/// Cloneable handle to a live link, used for write-back while lines stream
#[derive(Clone)]
pub struct SessionHandle {
    address: String,
    link: Arc<dyn Link>,
    connected: Arc<AtomicBool>,
}

impl SessionHandle {
    /// Bound device address
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Whether the owning session is still connected
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Write bytes to the RX characteristic
    pub async fn write(&self, data: &[u8]) -> Result<(), NusError> {
        if !self.is_connected() {
            return Err(NusError::Write("not connected".into()));
        }
        self.link.write(data).await.map_err(|e| match e {
            NusError::Write(msg) => NusError::Write(msg),
            other => NusError::Write(other.to_string()),
        })
    }

    /// Multi-line dump of the peripheral's services
    pub async fn describe_services(&self) -> Result<String, NusError> {
        if !self.is_connected() {
            return Err(NusError::NotConnected);
        }
        self.link.describe_services().await
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("address", &self.address)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// A single NUS connection and its decoded line stream
pub struct Session {
    transport: Arc<dyn Transport>,
    options: SessionOptions,
    shutdown: ShutdownSignal,
    state: SessionState,
    device: Option<DiscoveredDevice>,
    link: Option<Arc<dyn Link>>,
    events: Option<LinkEventStream>,
    connected: Arc<AtomicBool>,
    /// Set once a connection attempt has been made; sessions are single-use
    used: bool,
}

impl Session {
    /// Create a disconnected session
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            options: SessionOptions::default(),
            shutdown: ShutdownSignal::never(),
            state: SessionState::Disconnected,
            device: None,
            link: None,
            events: None,
            connected: Arc::new(AtomicBool::new(false)),
            used: false,
        }
    }

    /// Set session options
    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    /// Observe `shutdown` while connecting and streaming
    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The device this session is bound to
    pub fn device(&self) -> Option<&DiscoveredDevice> {
        self.device.as_ref()
    }

    /// Handle for writes while the line stream is being consumed
    pub fn handle(&self) -> Option<SessionHandle> {
        let link = self.link.clone()?;
        Some(SessionHandle {
            address: link.address(),
            link,
            connected: self.connected.clone(),
        })
    }

    /// Connect to `device`, discover NUS and subscribe to notifications.
    ///
    /// `connect_timeout` is a hard deadline covering the whole sequence.
    pub async fn connect(
        &mut self,
        device: &DiscoveredDevice,
        connect_timeout: Duration,
    ) -> Result<(), NusError> {
        if self.used {
            return Err(NusError::InvalidArgument(
                "session already used; create a new session to reconnect".into(),
            ));
        }
        self.used = true;
        self.state = SessionState::Connecting;
        self.device = Some(device.clone());
        debug!("Connecting to {} ({})", device.display_name(), device.address);

        let transport = self.transport.clone();
        let address = device.address.clone();
        let establish = async move {
            let link: Arc<dyn Link> = Arc::from(transport.connect(&address).await?);
            match link.subscribe().await {
                Ok(events) => Ok((link, events)),
                Err(e) => {
                    if let Err(de) = link.disconnect().await {
                        debug!("Disconnect after failed subscribe: {}", de);
                    }
                    Err(e)
                }
            }
        };

        let outcome = match self.shutdown.run(timeout(connect_timeout, establish)).await {
            Ok(Ok(result)) => result,
            Ok(Err(_elapsed)) => Err(NusError::Connection(format!(
                "timed out after {:?}",
                connect_timeout
            ))),
            Err(cancelled) => Err(cancelled),
        };

        match outcome {
            Ok((link, events)) => {
                self.link = Some(link);
                self.events = Some(events);
                self.connected.store(true, Ordering::SeqCst);
                self.state = SessionState::Connected;
                info!("Connected to {} ({})", device.display_name(), device.address);
                Ok(())
            }
            Err(e) => {
                // The abandoned connect future may have left a half-open link.
                if let Err(de) = self.release_abandoned(&device.address).await {
                    debug!("Release after failed connect: {}", de);
                }
                self.state = SessionState::Disconnected;
                Err(e)
            }
        }
    }

    /// Scan with `criteria`, let `select` choose among the candidates, then connect.
    ///
    /// Returns the chosen device. `select` returning `None` yields a
    /// [`NusError::ScanTimeout`] so callers can present their own menus
    /// without losing the scan results.
    pub async fn connect_discovered<F>(
        &mut self,
        scanner: &Scanner,
        criteria: &FilterCriteria,
        scan_timeout: Duration,
        connect_timeout: Duration,
        select: F,
    ) -> Result<DiscoveredDevice, NusError>
    where
        F: FnOnce(&[DiscoveredDevice]) -> Option<DiscoveredDevice>,
    {
        let candidates = scanner.scan(criteria, scan_timeout).await?;
        let device = select(&candidates).ok_or(NusError::ScanTimeout {
            timeout: scan_timeout,
        })?;
        self.connect(&device, connect_timeout).await?;
        Ok(device)
    }

    /// Lazy sequence of decoded lines.
    ///
    /// Suspends between notifications and ends when the link drops or a stop
    /// is requested. The sequence can be taken only once; later calls yield
    /// nothing.
    pub fn iter_lines(&mut self) -> impl Stream<Item = LogLine> + '_ {
        let events = self.events.take();
        let mut framer = LineFramer::new(self.options.framer);
        let flush_tail = self.options.flush_tail_on_disconnect;

        async_stream::stream! {
            let Some(mut events) = events else {
                return;
            };
            loop {
                let event = tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => {
                        debug!("Stop requested while streaming");
                        break;
                    }
                    event = events.next() => event,
                };
                match event {
                    Some(LinkEvent::Notification(chunk)) => {
                        for line in framer.feed(&chunk) {
                            yield line;
                        }
                    }
                    Some(LinkEvent::Disconnected) | None => {
                        warn!("Link lost");
                        self.mark_lost();
                        break;
                    }
                }
            }
            if flush_tail {
                if let Some(tail) = framer.flush() {
                    yield tail;
                }
            } else if framer.pending() > 0 {
                debug!("Discarding {} unterminated bytes", framer.pending());
            }
        }
    }

    /// Write bytes to the RX characteristic
    pub async fn write(&self, data: &[u8]) -> Result<(), NusError> {
        if self.state != SessionState::Connected {
            return Err(NusError::Write("not connected".into()));
        }
        match self.handle() {
            Some(handle) => handle.write(data).await,
            None => Err(NusError::Write("not connected".into())),
        }
    }

    /// Release the link. Idempotent and safe from any state.
    pub async fn disconnect(&mut self) {
        self.events = None;
        self.connected.store(false, Ordering::SeqCst);
        if let Some(link) = self.link.take() {
            debug!("Disconnecting from {}", link.address());
            if let Err(e) = link.disconnect().await {
                debug!("Disconnect reported an error (ignored): {}", e);
            }
        }
        self.state = SessionState::Disconnected;
    }

    fn mark_lost(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
        self.state = SessionState::Disconnected;
    }

    /// Best-effort teardown of a link we never got a handle for
    async fn release_abandoned(&self, address: &str) -> Result<(), NusError> {
        match timeout(RELEASE_TIMEOUT, self.transport.cancel_connect(address)).await {
            Ok(result) => result,
            Err(_) => Ok(()),
        }
    }
}
