//! Capability interface over the platform Bluetooth LE stack
//!
//! Everything above this module talks to the radio only through
//! [`BleRadio`]. Implementations convert platform UUIDs, addresses and
//! error values into the types here once, at this boundary.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, oneshot};
use uuid::Uuid;

/// A discovered BLE peripheral
///
/// Identity is the platform address/id string; name and RSSI are what the
/// advertisement said when it was seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    pub id: String,
    pub name: String,
    pub rssi: Option<i32>,
}

impl DeviceHandle {
    pub fn new(id: impl Into<String>, name: impl Into<String>, rssi: Option<i32>) -> Self {
        Self { id: id.into(), name: name.into(), rssi }
    }

    /// Same peripheral, regardless of when the advertisement was seen
    pub fn same_device(&self, other: &DeviceHandle) -> bool {
        self.id == other.id
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// Link state pushed by the platform on its own event thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected(String),
    Disconnected(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharacteristicProps {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub properties: CharacteristicProps,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    WithResponse,
    WithoutResponse,
}

/// Link protection requested from the pairing primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionLevel {
    /// Encrypted link, unauthenticated keys allowed (Just Works)
    Encryption,
    /// Encrypted link with MITM-protected keys (passkey or numeric comparison)
    EncryptionAndAuthentication,
}

impl ProtectionLevel {
    pub fn for_mitm(require_mitm: bool) -> Self {
        if require_mitm {
            ProtectionLevel::EncryptionAndAuthentication
        } else {
            ProtectionLevel::Encryption
        }
    }
}

/// What the platform asks for in the middle of a pairing ceremony
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingCeremony {
    /// The remote device shows a passkey; a human must type it in
    ProvidePin,
    /// The platform generated a passkey that must be shown to the human
    DisplayPin(String),
    /// Both sides show a code; the human confirms they match
    ConfirmPinMatch(String),
    /// Just Works: no human interaction, no MITM protection
    ConfirmOnly,
}

/// Answer handed back to the platform continuation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CeremonyReply {
    Pin(String),
    Accept,
    Reject,
}

/// Receiver side of the platform's deferral
///
/// The radio calls this from inside `pair` whenever the OS raises a
/// pairing request, and completes the platform continuation with the
/// returned reply.
#[async_trait::async_trait]
pub trait PairingAgent: Send + Sync {
    async fn on_ceremony(&self, ceremony: PairingCeremony) -> CeremonyReply;
}

/// Bridge for platforms whose pairing callback is a blocking OS-thread
/// callback without a deferral object.
///
/// The ceremony is answered on the tokio runtime; the platform worker
/// thread waits on the returned receiver with `blocking_recv`, never the
/// UI/event thread.
pub fn spawn_ceremony(
    runtime: &tokio::runtime::Handle,
    agent: Arc<dyn PairingAgent>,
    ceremony: PairingCeremony,
) -> oneshot::Receiver<CeremonyReply> {
    let (tx, rx) = oneshot::channel();
    runtime.spawn(async move {
        let reply = agent.on_ceremony(ceremony).await;
        let _ = tx.send(reply);
    });
    rx
}

/// Result of the platform pairing primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingStatus {
    Paired,
    AlreadyPaired,
    NotReadyToPair,
    NotPaired,
    AuthenticationTimeout,
    AuthenticationNotAllowed,
    AuthenticationFailure,
    NoSupportedProfiles,
    ProtectionLevelCouldNotBeMet,
    AccessDenied,
    InvalidCeremonyData,
    Canceled,
    OperationAlreadyInProgress,
    RequiredHandlerNotRegistered,
    RejectedByHandler,
    RemoteDeviceHasAssociation,
    Failed(i32),
}

impl PairingStatus {
    pub fn is_success(self) -> bool {
        matches!(self, PairingStatus::Paired | PairingStatus::AlreadyPaired)
    }
}

impl fmt::Display for PairingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PairingStatus::Paired => f.write_str("paired successfully"),
            PairingStatus::AlreadyPaired => f.write_str("already paired"),
            PairingStatus::NotReadyToPair => f.write_str("device not ready to pair"),
            PairingStatus::NotPaired => f.write_str("pairing rejected or failed"),
            PairingStatus::AuthenticationTimeout => f.write_str("authentication timeout"),
            PairingStatus::AuthenticationNotAllowed => f.write_str("authentication not allowed"),
            PairingStatus::AuthenticationFailure => f.write_str("authentication failure, incorrect PIN?"),
            PairingStatus::NoSupportedProfiles => f.write_str("no supported profiles"),
            PairingStatus::ProtectionLevelCouldNotBeMet => {
                f.write_str("protection level could not be met")
            }
            PairingStatus::AccessDenied => f.write_str("access denied"),
            PairingStatus::InvalidCeremonyData => {
                f.write_str("invalid ceremony data, PIN required but not provided")
            }
            PairingStatus::Canceled => f.write_str("pairing canceled"),
            PairingStatus::OperationAlreadyInProgress => f.write_str("operation already in progress"),
            PairingStatus::RequiredHandlerNotRegistered => {
                f.write_str("required pairing handler not registered")
            }
            PairingStatus::RejectedByHandler => f.write_str("rejected by handler"),
            PairingStatus::RemoteDeviceHasAssociation => {
                f.write_str("remote device has an existing association")
            }
            PairingStatus::Failed(code) => write!(f, "failed with status {code}"),
        }
    }
}

/// Bonding record state as far as the platform will tell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BondState {
    Paired,
    NotPaired,
    /// Only an authenticated GATT access reveals the truth
    Indeterminate,
}

/// Typed part of a platform error, when the platform gives one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// ATT protocol error byte (Bluetooth Core Vol 3, Part F, 3.4.1.1)
    Att(u8),
    /// HCI disconnect/status reason byte
    Hci(u8),
    /// Platform-specific integer status (e.g. GattCommunicationStatus)
    Platform(i32),
}

/// Error from the platform stack: usually an untyped message, sometimes a code
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct RadioError {
    pub code: Option<ErrorCode>,
    pub message: String,
}

impl RadioError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { code: None, message: message.into() }
    }

    pub fn with_code(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code: Some(code), message: message.into() }
    }

    pub fn timed_out(operation: &str, after: Duration) -> Self {
        Self::new(format!("{operation} timed out after {}ms", after.as_millis()))
    }

    pub fn unsupported(what: &str) -> Self {
        Self::new(format!("{what} is not supported by this platform"))
    }
}

/// The platform Bluetooth LE stack, narrowed to what provisioning needs
#[async_trait::async_trait]
pub trait BleRadio: Send + Sync {
    /// Whether `pair`/`unpair`/`bond_state` drive a real OS pairing API.
    /// Stacks that pair implicitly on first encrypted access return false.
    fn supports_explicit_pairing(&self) -> bool;

    async fn scan(&self, duration: Duration) -> Result<Vec<DeviceHandle>, RadioError>;

    /// Run the OS pairing ceremony, consulting `agent` for every request
    async fn pair(
        &self,
        device: &DeviceHandle,
        protection: ProtectionLevel,
        agent: Arc<dyn PairingAgent>,
    ) -> Result<PairingStatus, RadioError>;

    async fn unpair(&self, device: &DeviceHandle) -> Result<(), RadioError>;

    async fn bond_state(&self, device: &DeviceHandle) -> Result<BondState, RadioError>;

    async fn connect(&self, device: &DeviceHandle) -> Result<(), RadioError>;

    async fn disconnect(&self, device: &DeviceHandle) -> Result<(), RadioError>;

    async fn discover_services(&self, device: &DeviceHandle) -> Result<Vec<GattService>, RadioError>;

    async fn read(
        &self,
        device: &DeviceHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, RadioError>;

    async fn write(
        &self,
        device: &DeviceHandle,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
        kind: WriteKind,
    ) -> Result<(), RadioError>;

    /// A fresh subscription to link state changes for every peripheral
    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent>;
}
