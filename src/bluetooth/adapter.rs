use std::fmt;
use std::fmt::Write as _;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use crate::bluetooth::scanner::DiscoveredDevice;
use crate::bluetooth::transport::{AdvertisementStream, Link, LinkEvent, LinkEventStream, Transport};
use crate::bluetooth::{NUS_RX_CHAR_UUID, NUS_SERVICE_UUID, NUS_TX_CHAR_UUID};
use crate::error::NusError;

/// Information about a Bluetooth adapter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdapterInfo {
    /// Adapter index
    pub index: usize,
    /// Adapter name or identifier reported by the platform
    pub name: String,
    /// Whether this is the default adapter
    pub is_default: bool,
}

impl fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{}{}",
            self.name,
            self.index,
            if self.is_default { " (default)" } else { "" }
        )
    }
}

/// Get a name for the adapter, falling back to its index
async fn adapter_name(adapter: &Adapter, index: usize) -> String {
    match adapter.adapter_info().await {
        Ok(info) => info,
        Err(_) => format!("BluetoothAdapter{}", index),
    }
}

/// List the adapters of the platform stack
pub async fn list_adapters() -> Result<Vec<AdapterInfo>, NusError> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    let mut infos = Vec::with_capacity(adapters.len());
    for (index, adapter) in adapters.iter().enumerate() {
        infos.push(AdapterInfo {
            index,
            name: adapter_name(adapter, index).await,
            // First adapter is considered default
            is_default: index == 0,
        });
    }
    Ok(infos)
}

/// Pick an adapter by index or by case-insensitive substring of its name
async fn select_adapter(adapters: Vec<Adapter>, hint: Option<&str>) -> Result<(Adapter, AdapterInfo), NusError> {
    if adapters.is_empty() {
        return Err(NusError::NoAdapter);
    }

    let hint = hint.map(str::trim).filter(|h| !h.is_empty());
    let wanted_index = hint.and_then(|h| h.parse::<usize>().ok());
    let wanted_name = hint.map(str::to_lowercase);

    for (index, adapter) in adapters.into_iter().enumerate() {
        let name = adapter_name(&adapter, index).await;
        let chosen = match (wanted_index, &wanted_name) {
            (Some(i), _) => i == index,
            (None, Some(sub)) => name.to_lowercase().contains(sub),
            (None, None) => true,
        };
        if chosen {
            let info = AdapterInfo {
                index,
                name,
                is_default: index == 0,
            };
            return Ok((adapter, info));
        }
    }

    Err(NusError::InvalidArgument(format!(
        "adapter '{}' not found",
        hint.unwrap_or_default()
    )))
}

/// Build a device record from what the stack currently knows about `id`
async fn device_record(adapter: &Adapter, id: &PeripheralId) -> Option<DiscoveredDevice> {
    let peripheral = adapter.peripheral(id).await.ok()?;
    let properties = peripheral.properties().await.ok()??;
    let mut services: std::collections::BTreeSet<uuid::Uuid> =
        properties.services.iter().copied().collect();
    // Scan-response service data counts as advertised too
    services.extend(properties.service_data.keys().copied());
    Some(DiscoveredDevice {
        address: properties.address.to_string(),
        name: properties.local_name,
        services,
        rssi: properties.rssi,
    })
}

async fn find_peripheral(adapter: &Adapter, address: &str) -> Result<Option<Peripheral>, NusError> {
    for peripheral in adapter.peripherals().await? {
        if peripheral.address().to_string().eq_ignore_ascii_case(address) {
            return Ok(Some(peripheral));
        }
    }
    Ok(None)
}

/// [`Transport`] backed by a btleplug adapter
#[derive(Clone)]
pub struct BtleTransport {
    adapter: Adapter,
    info: AdapterInfo,
}

impl BtleTransport {
    /// Open the platform stack and select an adapter.
    ///
    /// `adapter_hint` is an adapter index or a substring of its name; `None`
    /// selects the first adapter.
    pub async fn new(adapter_hint: Option<&str>) -> Result<Self, NusError> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let (adapter, info) = select_adapter(adapters, adapter_hint).await?;
        info!("Using Bluetooth adapter {}", info);
        Ok(Self { adapter, info })
    }
}

#[async_trait]
impl Transport for BtleTransport {
    async fn start_discovery(&self) -> Result<AdvertisementStream, NusError> {
        let mut events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;
        debug!("Discovery started on {}", self.info);

        let adapter = self.adapter.clone();
        let reports = async_stream::stream! {
            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ServicesAdvertisement { id, .. }
                    | CentralEvent::ServiceDataAdvertisement { id, .. } => id,
                    _ => continue,
                };
                if let Some(device) = device_record(&adapter, &id).await {
                    yield device;
                }
            }
        };
        Ok(reports.boxed())
    }

    async fn stop_discovery(&self) -> Result<(), NusError> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, address: &str) -> Result<Box<dyn Link>, NusError> {
        let peripheral = find_peripheral(&self.adapter, address)
            .await?
            .ok_or_else(|| NusError::Connection(format!("device {} is not known to the adapter", address)))?;
        peripheral.connect().await?;
        debug!("Transport connected to {}", address);
        Ok(Box::new(BtleLink::new(self.adapter.clone(), peripheral)))
    }

    async fn cancel_connect(&self, address: &str) -> Result<(), NusError> {
        if let Some(peripheral) = find_peripheral(&self.adapter, address).await? {
            if peripheral.is_connected().await.unwrap_or(false) {
                debug!("Dropping half-open link to {}", address);
                peripheral.disconnect().await?;
            }
        }
        Ok(())
    }
}

/// One btleplug connection exposing the NUS characteristics
pub struct BtleLink {
    adapter: Adapter,
    peripheral: Peripheral,
    tx: Mutex<Option<Characteristic>>,
    rx: Mutex<Option<Characteristic>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl BtleLink {
    fn new(adapter: Adapter, peripheral: Peripheral) -> Self {
        Self {
            adapter,
            peripheral,
            tx: Mutex::new(None),
            rx: Mutex::new(None),
            watcher: Mutex::new(None),
        }
    }

    /// Locate the TX and RX characteristics of the NUS service
    fn nus_characteristics(&self) -> Result<(Characteristic, Characteristic), NusError> {
        let service = self
            .peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == NUS_SERVICE_UUID)
            .ok_or_else(|| NusError::ServiceNotFound("NUS service UUID not found on device".into()))?;

        let tx = service.characteristics.iter().find(|c| c.uuid == NUS_TX_CHAR_UUID).cloned();
        let rx = service.characteristics.iter().find(|c| c.uuid == NUS_RX_CHAR_UUID).cloned();
        match (tx, rx) {
            (Some(tx), Some(rx)) => Ok((tx, rx)),
            _ => Err(NusError::ServiceNotFound("NUS TX/RX characteristics missing".into())),
        }
    }
}

#[async_trait]
impl Link for BtleLink {
    fn address(&self) -> String {
        self.peripheral.address().to_string()
    }

    async fn subscribe(&self) -> Result<LinkEventStream, NusError> {
        self.peripheral.discover_services().await?;
        let (tx_char, rx_char) = self.nus_characteristics()?;

        // Listen for link loss before notifications start flowing
        let mut central_events = self.adapter.events().await?;
        self.peripheral.subscribe(&tx_char).await?;
        let mut notifications = self.peripheral.notifications().await?;

        let id = self.peripheral.id();
        let (sender, receiver) = mpsc::channel(1);
        let watcher = tokio::spawn(async move {
            loop {
                tokio::select! {
                    notification = notifications.next() => match notification {
                        Some(n) if n.uuid == NUS_TX_CHAR_UUID => {
                            if sender.send(LinkEvent::Notification(n.value)).await.is_err() {
                                break;
                            }
                        }
                        Some(_) => continue,
                        None => {
                            let _ = sender.send(LinkEvent::Disconnected).await;
                            break;
                        }
                    },
                    event = central_events.next() => match event {
                        Some(CentralEvent::DeviceDisconnected(gone)) if gone == id => {
                            debug!("Device disconnected event");
                            let _ = sender.send(LinkEvent::Disconnected).await;
                            break;
                        }
                        Some(_) => continue,
                        None => {
                            let _ = sender.send(LinkEvent::Disconnected).await;
                            break;
                        }
                    },
                }
            }
        });

        *self.tx.lock().await = Some(tx_char);
        *self.rx.lock().await = Some(rx_char);
        if let Some(previous) = self.watcher.lock().await.replace(watcher) {
            previous.abort();
        }
        Ok(ReceiverStream::new(receiver).boxed())
    }

    async fn write(&self, data: &[u8]) -> Result<(), NusError> {
        let rx = self.rx.lock().await.clone().ok_or(NusError::NotConnected)?;
        self.peripheral
            .write(&rx, data, WriteType::WithoutResponse)
            .await
            .map_err(|e| NusError::Write(e.to_string()))
    }

    async fn disconnect(&self) -> Result<(), NusError> {
        if let Some(watcher) = self.watcher.lock().await.take() {
            watcher.abort();
        }
        if !self.peripheral.is_connected().await.unwrap_or(false) {
            return Ok(());
        }
        if let Some(tx) = self.tx.lock().await.take() {
            // Services may already be gone while the link tears down
            if let Err(e) = self.peripheral.unsubscribe(&tx).await {
                debug!("Unsubscribe failed during disconnect: {}", e);
            }
        }
        self.rx.lock().await.take();
        if let Err(e) = self.peripheral.disconnect().await {
            warn!("Disconnect from {} failed: {}", self.address(), e);
            return Err(e.into());
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn describe_services(&self) -> Result<String, NusError> {
        let mut dump = String::new();
        for service in self.peripheral.services() {
            let _ = writeln!(dump, "Service {}", service.uuid);
            for characteristic in &service.characteristics {
                let _ = writeln!(
                    dump,
                    "  Char {} [{:?}]",
                    characteristic.uuid, characteristic.properties
                );
            }
        }
        Ok(dump)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_info_display() {
        let info = AdapterInfo {
            index: 0,
            name: "hci0".to_string(),
            is_default: true,
        };
        assert_eq!(info.to_string(), "hci0#0 (default)");

        let info = AdapterInfo {
            index: 1,
            name: "hci1".to_string(),
            is_default: false,
        };
        assert_eq!(info.to_string(), "hci1#1");
    }

    #[tokio::test]
    async fn test_select_adapter_requires_one() {
        let result = select_adapter(Vec::new(), Some("hci0")).await;
        assert!(matches!(result, Err(NusError::NoAdapter)));
    }
}
