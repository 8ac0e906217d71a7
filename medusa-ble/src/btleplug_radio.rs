//! [`BleRadio`] over btleplug
//!
//! btleplug has no pairing API: BlueZ, CoreBluetooth and WinRT pair on the
//! first encrypted GATT access, so `pair` reports unsupported and the
//! secure-channel read is what actually triggers bonding.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::radio::{
    BleRadio, BondState, CharacteristicProps, ConnectionEvent, DeviceHandle, GattCharacteristic,
    GattService, PairingAgent, PairingStatus, ProtectionLevel, RadioError, WriteKind,
};

impl From<btleplug::Error> for RadioError {
    fn from(e: btleplug::Error) -> Self {
        match e {
            btleplug::Error::NotConnected => RadioError::new("peripheral not connected"),
            btleplug::Error::DeviceNotFound => RadioError::new("device not found"),
            btleplug::Error::PermissionDenied => RadioError::new("bluetooth access denied"),
            btleplug::Error::TimedOut(after) => RadioError::timed_out("bluetooth operation", after),
            other => RadioError::new(other.to_string()),
        }
    }
}

pub struct BtleplugRadio {
    adapter: Adapter,
    /// Peripherals seen by a scan, keyed by address
    peripherals: Mutex<HashMap<String, Peripheral>>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl BtleplugRadio {
    /// Open the first Bluetooth adapter
    pub async fn new() -> Result<Self, RadioError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RadioError::new("no Bluetooth adapter found"))?;
        info!(adapter = %adapter.adapter_info().await.unwrap_or_default(), "using adapter");

        let (events, _) = broadcast::channel(32);
        let stream = adapter.events().await?;
        tokio::spawn(forward_events(adapter.clone(), stream, events.clone()));

        Ok(Self { adapter, peripherals: Mutex::new(HashMap::new()), events })
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, Peripheral>> {
        self.peripherals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn peripheral(&self, device: &DeviceHandle) -> Result<Peripheral, RadioError> {
        if let Some(p) = self.cache().get(&device.id).cloned() {
            return Ok(p);
        }
        for p in self.adapter.peripherals().await? {
            if p.address().to_string() == device.id {
                self.cache().insert(device.id.clone(), p.clone());
                return Ok(p);
            }
        }
        Err(RadioError::new(format!("device not found: {}", device.id)))
    }

    async fn characteristic(
        &self,
        device: &DeviceHandle,
        service: Uuid,
        uuid: Uuid,
    ) -> Result<(Peripheral, btleplug::api::Characteristic), RadioError> {
        let peripheral = self.peripheral(device).await?;
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid && c.service_uuid == service)
            .ok_or_else(|| RadioError::new(format!("characteristic {uuid} unknown, discover services first")))?;
        Ok((peripheral, characteristic))
    }
}

fn props(flags: CharPropFlags) -> CharacteristicProps {
    CharacteristicProps {
        read: flags.contains(CharPropFlags::READ),
        write: flags.contains(CharPropFlags::WRITE),
        write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: flags.contains(CharPropFlags::NOTIFY),
    }
}

async fn forward_events(
    adapter: Adapter,
    mut stream: impl Stream<Item = CentralEvent> + Unpin,
    events: broadcast::Sender<ConnectionEvent>,
) {
    while let Some(event) = stream.next().await {
        let (id, connected) = match event {
            CentralEvent::DeviceConnected(id) => (id, true),
            CentralEvent::DeviceDisconnected(id) => (id, false),
            _ => continue,
        };
        let address = match adapter.peripheral(&id).await {
            Ok(p) => p.address().to_string(),
            Err(e) => {
                debug!(error = %e, "link event for unknown peripheral");
                continue;
            }
        };
        let event = if connected {
            ConnectionEvent::Connected(address)
        } else {
            ConnectionEvent::Disconnected(address)
        };
        let _ = events.send(event);
    }
    debug!("adapter event stream ended");
}

#[async_trait::async_trait]
impl BleRadio for BtleplugRadio {
    fn supports_explicit_pairing(&self) -> bool {
        false
    }

    #[instrument(skip(self))]
    async fn scan(&self, duration: Duration) -> Result<Vec<DeviceHandle>, RadioError> {
        self.adapter.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(duration).await;

        let peripherals = self.adapter.peripherals().await?;
        let mut devices = Vec::new();
        for peripheral in peripherals {
            if let Some(props) = peripheral.properties().await? {
                let name = props.local_name.unwrap_or_else(|| "Unknown".to_string());
                let id = peripheral.address().to_string();
                let rssi = props.rssi.map(i32::from);
                self.cache().insert(id.clone(), peripheral);
                devices.push(DeviceHandle { id, name, rssi });
            }
        }

        self.adapter.stop_scan().await?;
        debug!(found = devices.len(), "scan finished");
        Ok(devices)
    }

    async fn pair(
        &self,
        _device: &DeviceHandle,
        _protection: ProtectionLevel,
        _agent: Arc<dyn PairingAgent>,
    ) -> Result<PairingStatus, RadioError> {
        Err(RadioError::unsupported("explicit pairing"))
    }

    async fn unpair(&self, _device: &DeviceHandle) -> Result<(), RadioError> {
        Err(RadioError::unsupported("unpair"))
    }

    async fn bond_state(&self, _device: &DeviceHandle) -> Result<BondState, RadioError> {
        Ok(BondState::Indeterminate)
    }

    async fn connect(&self, device: &DeviceHandle) -> Result<(), RadioError> {
        let peripheral = self.peripheral(device).await?;
        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }
        Ok(())
    }

    async fn disconnect(&self, device: &DeviceHandle) -> Result<(), RadioError> {
        let peripheral = self.peripheral(device).await?;
        if peripheral.is_connected().await? {
            peripheral.disconnect().await?;
        }
        Ok(())
    }

    async fn discover_services(&self, device: &DeviceHandle) -> Result<Vec<GattService>, RadioError> {
        let peripheral = self.peripheral(device).await?;
        peripheral.discover_services().await?;
        Ok(peripheral
            .services()
            .into_iter()
            .map(|s| GattService {
                uuid: s.uuid,
                characteristics: s
                    .characteristics
                    .into_iter()
                    .map(|c| GattCharacteristic { uuid: c.uuid, properties: props(c.properties) })
                    .collect(),
            })
            .collect())
    }

    async fn read(
        &self,
        device: &DeviceHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, RadioError> {
        let (peripheral, c) = self.characteristic(device, service, characteristic).await?;
        Ok(peripheral.read(&c).await?)
    }

    async fn write(
        &self,
        device: &DeviceHandle,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
        kind: WriteKind,
    ) -> Result<(), RadioError> {
        let (peripheral, c) = self.characteristic(device, service, characteristic).await?;
        let write_type = match kind {
            WriteKind::WithResponse => WriteType::WithResponse,
            WriteKind::WithoutResponse => WriteType::WithoutResponse,
        };
        Ok(peripheral.write(&c, value, write_type).await?)
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }
}
