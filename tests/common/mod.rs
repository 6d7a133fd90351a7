//! Shared test doubles: a scripted in-memory transport and mockall mocks
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use mockall::mock;

use nus_logger::bluetooth::{AdvertisementStream, Link, LinkEvent, LinkEventStream, Transport};
use nus_logger::{DiscoveredDevice, NusError, NUS_SERVICE_UUID};

/// How a simulated link ends after its scripted chunks
#[derive(Debug, Clone)]
pub enum LinkEnd {
    /// Report link loss right after the last chunk
    Drop,
    /// Stay connected forever
    Open,
    /// Report link loss after this long
    DropAfter(Duration),
}

/// What happens on one connect call
#[derive(Debug, Clone)]
pub enum ConnectPlan {
    /// Connect, deliver `chunks`, then end as described
    Stream { chunks: Vec<Vec<u8>>, end: LinkEnd },
    /// Connect fails
    Refuse(String),
    /// Connect works but the NUS service is missing
    NoService,
    /// Connect never completes
    Hang,
}

impl ConnectPlan {
    /// Deliver text chunks then drop the link
    pub fn chunks(chunks: &[&str]) -> Self {
        Self::Stream {
            chunks: chunks.iter().map(|c| c.as_bytes().to_vec()).collect(),
            end: LinkEnd::Drop,
        }
    }

    /// Deliver text chunks then keep the link open
    pub fn chunks_then_open(chunks: &[&str]) -> Self {
        Self::Stream {
            chunks: chunks.iter().map(|c| c.as_bytes().to_vec()).collect(),
            end: LinkEnd::Open,
        }
    }

    /// Stay connected for `duration` without data
    pub fn live_for(duration: Duration) -> Self {
        Self::Stream {
            chunks: Vec::new(),
            end: LinkEnd::DropAfter(duration),
        }
    }
}

/// Observable state of the simulated stack
#[derive(Debug, Default)]
pub struct SimState {
    pub adverts: Vec<DiscoveredDevice>,
    pub plans: VecDeque<ConnectPlan>,
    pub default_plan: Option<ConnectPlan>,
    pub discovery_starts: usize,
    pub discovery_stops: usize,
    pub connects: Vec<String>,
    pub cancels: Vec<String>,
    pub disconnects: usize,
    pub writes: Vec<Vec<u8>>,
    pub live_links: usize,
    pub max_live_links: usize,
}

/// Scripted transport standing in for a Bluetooth stack
#[derive(Clone, Default)]
pub struct SimTransport {
    state: Arc<Mutex<SimState>>,
}

impl SimTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advertise `device` on every scan
    pub fn advertising(self, device: DiscoveredDevice) -> Self {
        self.state().adverts.push(device);
        self
    }

    /// Queue the outcome of the next connect call
    pub fn with_plan(self, plan: ConnectPlan) -> Self {
        self.state().plans.push_back(plan);
        self
    }

    /// Outcome once the queued plans are used up
    pub fn with_default_plan(self, plan: ConnectPlan) -> Self {
        self.state().default_plan = Some(plan);
        self
    }

    pub fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap()
    }

    pub fn into_transport(self) -> Arc<dyn Transport> {
        Arc::new(self)
    }
}

#[async_trait]
impl Transport for SimTransport {
    async fn start_discovery(&self) -> Result<AdvertisementStream, NusError> {
        let adverts = {
            let mut state = self.state();
            state.discovery_starts += 1;
            state.adverts.clone()
        };
        Ok(stream::iter(adverts).chain(stream::pending()).boxed())
    }

    async fn stop_discovery(&self) -> Result<(), NusError> {
        self.state().discovery_stops += 1;
        Ok(())
    }

    async fn connect(&self, address: &str) -> Result<Box<dyn Link>, NusError> {
        let plan = {
            let mut state = self.state();
            state.connects.push(address.to_string());
            state
                .plans
                .pop_front()
                .or_else(|| state.default_plan.clone())
                .unwrap_or_else(|| ConnectPlan::Refuse("no plan".into()))
        };
        match plan {
            ConnectPlan::Refuse(msg) => Err(NusError::Connection(msg)),
            ConnectPlan::Hang => futures::future::pending().await,
            plan => {
                {
                    let mut state = self.state();
                    state.live_links += 1;
                    state.max_live_links = state.max_live_links.max(state.live_links);
                }
                Ok(Box::new(SimLink {
                    address: address.to_string(),
                    plan: Mutex::new(Some(plan)),
                    state: self.state.clone(),
                    connected: AtomicBool::new(false),
                    released: AtomicBool::new(false),
                }))
            }
        }
    }

    async fn cancel_connect(&self, address: &str) -> Result<(), NusError> {
        self.state().cancels.push(address.to_string());
        Ok(())
    }
}

/// Link produced by [`SimTransport`]
pub struct SimLink {
    address: String,
    plan: Mutex<Option<ConnectPlan>>,
    state: Arc<Mutex<SimState>>,
    connected: AtomicBool,
    released: AtomicBool,
}

#[async_trait]
impl Link for SimLink {
    fn address(&self) -> String {
        self.address.clone()
    }

    async fn subscribe(&self) -> Result<LinkEventStream, NusError> {
        let plan = self.plan.lock().unwrap().take();
        match plan {
            Some(ConnectPlan::Stream { chunks, end }) => {
                self.connected.store(true, Ordering::SeqCst);
                let head = stream::iter(chunks.into_iter().map(LinkEvent::Notification));
                let tail: LinkEventStream = match end {
                    LinkEnd::Drop => stream::once(async { LinkEvent::Disconnected }).boxed(),
                    LinkEnd::Open => stream::pending().boxed(),
                    LinkEnd::DropAfter(after) => stream::once(async move {
                        tokio::time::sleep(after).await;
                        LinkEvent::Disconnected
                    })
                    .boxed(),
                };
                Ok(head.chain(tail).boxed())
            }
            Some(ConnectPlan::NoService) => Err(NusError::ServiceNotFound("NUS service UUID not found on device".into())),
            _ => Err(NusError::NotConnected),
        }
    }

    async fn write(&self, data: &[u8]) -> Result<(), NusError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(NusError::Write("not connected".into()));
        }
        self.state.lock().unwrap().writes.push(data.to_vec());
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), NusError> {
        self.connected.store(false, Ordering::SeqCst);
        if !self.released.swap(true, Ordering::SeqCst) {
            let mut state = self.state.lock().unwrap();
            state.disconnects += 1;
            state.live_links -= 1;
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn describe_services(&self) -> Result<String, NusError> {
        Ok(format!("Service {}\n  Char 6e400003-b5a3-f393-e0a9-e50e24dcca9e [NOTIFY]\n", NUS_SERVICE_UUID))
    }
}

mock! {
    pub Transport {}

    #[async_trait]
    impl Transport for Transport {
        async fn start_discovery(&self) -> Result<AdvertisementStream, NusError>;
        async fn stop_discovery(&self) -> Result<(), NusError>;
        async fn connect(&self, address: &str) -> Result<Box<dyn Link>, NusError>;
        async fn cancel_connect(&self, address: &str) -> Result<(), NusError>;
    }
}

/// The device from the end-to-end scenarios
pub fn nrf_log() -> DiscoveredDevice {
    DiscoveredDevice::new("AA:BB", Some("nrf-log"))
        .with_service(NUS_SERVICE_UUID)
        .with_rssi(Some(-55))
}

/// Advertisement stream that yields `devices` then stays open
pub fn advert_stream(devices: Vec<DiscoveredDevice>) -> AdvertisementStream {
    stream::iter(devices).chain(stream::pending()).boxed()
}
