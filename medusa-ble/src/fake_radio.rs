//! Scripted in-memory radio for tests and demos
//!
//! Behaves like a single conforming sensor: pairs with a passkey, exposes
//! the provisioning service and answers status reads from a script.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use uuid::Uuid;

use medusa_proto::ble::status;

use crate::gatt;
use crate::radio::{
    BleRadio, BondState, CeremonyReply, ConnectionEvent, DeviceHandle, GattService, PairingAgent,
    PairingCeremony, PairingStatus, ProtectionLevel, RadioError, WriteKind,
};

/// A write the fake accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedWrite {
    pub device: String,
    pub characteristic: Uuid,
    pub value: Vec<u8>,
    pub kind: WriteKind,
}

struct State {
    explicit_pairing: bool,
    devices: Vec<DeviceHandle>,
    ceremony: PairingCeremony,
    expected_pin: Option<String>,
    pair_status: Option<PairingStatus>,
    protections: Vec<ProtectionLevel>,
    bonded: HashSet<String>,
    connected: HashSet<String>,
    connect_error: Option<RadioError>,
    services: Vec<GattService>,
    status_script: VecDeque<Result<Vec<u8>, RadioError>>,
    last_status: Vec<u8>,
    read_delay: Duration,
    reads: usize,
    write_failures: HashMap<Uuid, VecDeque<RadioError>>,
    writes: Vec<RecordedWrite>,
}

pub struct FakeRadio {
    state: Mutex<State>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Default for FakeRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRadio {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            state: Mutex::new(State {
                explicit_pairing: true,
                devices: Vec::new(),
                ceremony: PairingCeremony::ProvidePin,
                expected_pin: None,
                pair_status: None,
                protections: Vec::new(),
                bonded: HashSet::new(),
                connected: HashSet::new(),
                connect_error: None,
                services: vec![gatt::provisioning_service()],
                status_script: VecDeque::new(),
                last_status: vec![status::IDLE],
                read_delay: Duration::ZERO,
                reads: 0,
                write_failures: HashMap::new(),
                writes: Vec::new(),
            }),
            events,
        }
    }

    pub fn with_device(self, device: DeviceHandle) -> Self {
        self.state().devices.push(device);
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_explicit_pairing(&self, explicit: bool) {
        self.state().explicit_pairing = explicit;
    }

    pub fn set_ceremony(&self, ceremony: PairingCeremony) {
        self.state().ceremony = ceremony;
    }

    /// Passkey the device displays; any PIN is accepted when unset
    pub fn set_expected_pin(&self, pin: &str) {
        self.state().expected_pin = Some(pin.to_string());
    }

    /// Skip the ceremony and answer `pair` with this status
    pub fn set_pair_status(&self, status: Option<PairingStatus>) {
        self.state().pair_status = status;
    }

    pub fn set_bonded(&self, device_id: &str, bonded: bool) {
        let mut state = self.state();
        if bonded {
            state.bonded.insert(device_id.to_string());
        } else {
            state.bonded.remove(device_id);
        }
    }

    pub fn is_bonded(&self, device_id: &str) -> bool {
        self.state().bonded.contains(device_id)
    }

    pub fn is_connected(&self, device_id: &str) -> bool {
        self.state().connected.contains(device_id)
    }

    pub fn set_connect_error(&self, error: Option<RadioError>) {
        self.state().connect_error = error;
    }

    pub fn set_services(&self, services: Vec<GattService>) {
        self.state().services = services;
    }

    /// Queue a status byte; the last value read repeats once the script runs dry
    pub fn push_status(&self, byte: u8) {
        self.state().status_script.push_back(Ok(vec![byte]));
    }

    pub fn push_status_value(&self, value: Vec<u8>) {
        self.state().status_script.push_back(Ok(value));
    }

    pub fn push_read_error(&self, error: RadioError) {
        self.state().status_script.push_back(Err(error));
    }

    pub fn set_read_delay(&self, delay: Duration) {
        self.state().read_delay = delay;
    }

    pub fn read_count(&self) -> usize {
        self.state().reads
    }

    /// Fail the next write to `characteristic` with `error`
    pub fn fail_next_write(&self, characteristic: Uuid, error: RadioError) {
        self.state()
            .write_failures
            .entry(characteristic)
            .or_default()
            .push_back(error);
    }

    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.state().writes.clone()
    }

    /// Protection levels `pair` was called with, in order
    pub fn protections(&self) -> Vec<ProtectionLevel> {
        self.state().protections.clone()
    }

    /// Simulate the device walking out of range
    pub fn drop_link(&self, device_id: &str) {
        if self.state().connected.remove(device_id) {
            let _ = self.events.send(ConnectionEvent::Disconnected(device_id.to_string()));
        }
    }

    /// Simulate the device forgetting its bond (factory reset, reflash)
    pub fn forget_bond(&self, device_id: &str) {
        self.state().bonded.remove(device_id);
    }

    fn require_connected(&self, device: &DeviceHandle) -> Result<(), RadioError> {
        if self.is_connected(&device.id) {
            Ok(())
        } else {
            Err(RadioError::new("peripheral not connected"))
        }
    }
}

#[async_trait::async_trait]
impl BleRadio for FakeRadio {
    fn supports_explicit_pairing(&self) -> bool {
        self.state().explicit_pairing
    }

    async fn scan(&self, _duration: Duration) -> Result<Vec<DeviceHandle>, RadioError> {
        Ok(self.state().devices.clone())
    }

    async fn pair(
        &self,
        device: &DeviceHandle,
        protection: ProtectionLevel,
        agent: Arc<dyn PairingAgent>,
    ) -> Result<PairingStatus, RadioError> {
        let (ceremony, expected_pin, forced) = {
            let mut state = self.state();
            if !state.explicit_pairing {
                return Err(RadioError::unsupported("explicit pairing"));
            }
            state.protections.push(protection);
            if state.bonded.contains(&device.id) {
                return Ok(PairingStatus::AlreadyPaired);
            }
            (state.ceremony.clone(), state.expected_pin.clone(), state.pair_status)
        };
        if let Some(status) = forced {
            if status.is_success() {
                self.state().bonded.insert(device.id.clone());
            }
            return Ok(status);
        }

        let reply = agent.on_ceremony(ceremony.clone()).await;
        let status = match (ceremony, reply) {
            (_, CeremonyReply::Reject) => PairingStatus::RejectedByHandler,
            (PairingCeremony::ProvidePin, CeremonyReply::Pin(pin)) => {
                if expected_pin.is_none_or(|expected| expected == pin) {
                    PairingStatus::Paired
                } else {
                    PairingStatus::AuthenticationFailure
                }
            }
            (PairingCeremony::ProvidePin, CeremonyReply::Accept) => {
                PairingStatus::InvalidCeremonyData
            }
            (_, _) => PairingStatus::Paired,
        };
        if status.is_success() {
            self.state().bonded.insert(device.id.clone());
        }
        Ok(status)
    }

    async fn unpair(&self, device: &DeviceHandle) -> Result<(), RadioError> {
        let mut state = self.state();
        if !state.explicit_pairing {
            return Err(RadioError::unsupported("unpair"));
        }
        state.bonded.remove(&device.id);
        Ok(())
    }

    async fn bond_state(&self, device: &DeviceHandle) -> Result<BondState, RadioError> {
        let state = self.state();
        Ok(if !state.explicit_pairing {
            BondState::Indeterminate
        } else if state.bonded.contains(&device.id) {
            BondState::Paired
        } else {
            BondState::NotPaired
        })
    }

    async fn connect(&self, device: &DeviceHandle) -> Result<(), RadioError> {
        {
            let mut state = self.state();
            if let Some(error) = state.connect_error.clone() {
                return Err(error);
            }
            state.connected.insert(device.id.clone());
        }
        let _ = self.events.send(ConnectionEvent::Connected(device.id.clone()));
        Ok(())
    }

    async fn disconnect(&self, device: &DeviceHandle) -> Result<(), RadioError> {
        self.drop_link(&device.id);
        Ok(())
    }

    async fn discover_services(&self, device: &DeviceHandle) -> Result<Vec<GattService>, RadioError> {
        self.require_connected(device)?;
        Ok(self.state().services.clone())
    }

    async fn read(
        &self,
        device: &DeviceHandle,
        _service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, RadioError> {
        let delay = self.state().read_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.require_connected(device)?;
        if characteristic != gatt::STATUS {
            return Err(RadioError::new("read not permitted"));
        }

        let mut state = self.state();
        state.reads += 1;
        if !state.explicit_pairing {
            state.bonded.insert(device.id.clone());
        } else if !state.bonded.contains(&device.id) {
            return Err(RadioError::new("GATT error: Insufficient Authentication"));
        }
        match state.status_script.pop_front() {
            Some(Ok(value)) => {
                state.last_status = value.clone();
                Ok(value)
            }
            Some(Err(error)) => Err(error),
            None => Ok(state.last_status.clone()),
        }
    }

    async fn write(
        &self,
        device: &DeviceHandle,
        _service: Uuid,
        characteristic: Uuid,
        value: &[u8],
        kind: WriteKind,
    ) -> Result<(), RadioError> {
        self.require_connected(device)?;
        let mut state = self.state();
        if let Some(error) = state
            .write_failures
            .get_mut(&characteristic)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        if state.explicit_pairing && !state.bonded.contains(&device.id) {
            return Err(RadioError::new("GATT error: Insufficient Authentication"));
        }
        state.writes.push(RecordedWrite {
            device: device.id.clone(),
            characteristic,
            value: value.to_vec(),
            kind,
        });
        Ok(())
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }
}
