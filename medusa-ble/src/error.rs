//! Error taxonomy of the provisioning core
//!
//! Each public operation has its own error type so the UI can tell "re-enter
//! PIN" apart from "move closer to the device".

use std::time::Duration;

use medusa_proto::ProvisioningStatus;

use crate::classify::{FailureClass, classify};
use crate::gatt::Characteristic;
use crate::radio::{PairingStatus, RadioError};

#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    #[error("pairing rejected: {0}")]
    Rejected(PairingStatus),
    #[error("pairing authentication failed: {0}")]
    AuthenticationFailed(PairingStatus),
    #[error("timed out waiting for the pairing PIN")]
    Timeout,
    #[error("a pairing operation is already in progress")]
    AlreadyInProgress,
    #[error("pairing was cancelled")]
    Cancelled,
    #[error("explicit pairing is not supported on this platform")]
    PlatformUnsupported,
    #[error("device is connected, pairing must happen before connect")]
    ConnectionOpen,
    #[error("{operation} failed: {source}")]
    Radio {
        operation: &'static str,
        source: RadioError,
    },
}

impl PairingError {
    pub fn failure_class(&self) -> Option<FailureClass> {
        match self {
            PairingError::Rejected(_)
            | PairingError::AuthenticationFailed(_)
            | PairingError::Timeout => Some(FailureClass::Authentication),
            PairingError::Radio { source, .. } => Some(classify(source)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PinSubmissionError {
    #[error("no PIN request is outstanding")]
    NoPendingRequest,
    #[error("a PIN was already submitted for this request")]
    AlreadySubmitted,
    #[error("PIN is empty")]
    Empty,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("device is not paired, pair before connecting")]
    NotPaired,
    #[error("pairing is still in progress")]
    PairingInProgress,
    #[error("another device is connected, disconnect it first")]
    OtherDeviceConnected,
    #[error("device unreachable: {0}")]
    Unreachable(RadioError),
    #[error("connect timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
}

impl ConnectError {
    pub fn failure_class(&self) -> Option<FailureClass> {
        match self {
            ConnectError::NotPaired => Some(FailureClass::Authentication),
            ConnectError::Unreachable(_) | ConnectError::Timeout(_) => Some(FailureClass::Connection),
            ConnectError::PairingInProgress | ConnectError::OtherDeviceConnected => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("no live connection, connect before discovering services")]
    NotConnected,
    #[error("provisioning service not found, device is not in provisioning mode")]
    ServiceNotFound,
    #[error("provisioning service is missing the {0} characteristic")]
    CharacteristicMissing(Characteristic),
    #[error("service discovery failed: {0}")]
    Radio(RadioError),
}

impl DiscoveryError {
    pub fn failure_class(&self) -> Option<FailureClass> {
        match self {
            DiscoveryError::NotConnected => Some(FailureClass::Connection),
            DiscoveryError::Radio(source) => Some(classify(source)),
            DiscoveryError::ServiceNotFound | DiscoveryError::CharacteristicMissing(_) => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    #[error("no service handles for this connection, discover services first")]
    DiscoveryRequired,
    #[error("secure channel check failed, pairing required: {0}")]
    AuthenticationRequired(RadioError),
    #[error("connection lost during secure channel check: {0}")]
    ConnectionLost(RadioError),
    #[error("secure channel check failed: {0}")]
    Failed(RadioError),
}

impl VerificationError {
    pub fn failure_class(&self) -> Option<FailureClass> {
        match self {
            VerificationError::AuthenticationRequired(_) => Some(FailureClass::Authentication),
            VerificationError::ConnectionLost(_) => Some(FailureClass::Connection),
            VerificationError::Failed(_) => Some(FailureClass::Transient),
            VerificationError::DiscoveryRequired => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProvisioningError {
    #[error("service handles are stale, rediscover services after reconnecting")]
    StaleHandles,
    #[error("invalid credentials: {0}")]
    InvalidCredentials(&'static str),
    #[error("writing {target} failed ({class:?}): {source}")]
    WriteFailed {
        target: Characteristic,
        class: FailureClass,
        source: RadioError,
    },
    #[error("writing {target} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        target: Characteristic,
        attempts: u32,
        source: RadioError,
    },
}

impl ProvisioningError {
    pub fn failure_class(&self) -> Option<FailureClass> {
        match self {
            ProvisioningError::WriteFailed { class, .. } => Some(*class),
            ProvisioningError::RetriesExhausted { .. } => Some(FailureClass::Transient),
            ProvisioningError::StaleHandles => Some(FailureClass::Connection),
            ProvisioningError::InvalidCredentials(_) => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("device reported {0}")]
    Reported(ProvisioningStatus),
    #[error("device disconnected while waiting for provisioning status")]
    Disconnected,
    #[error("pairing lost while reading status: {0}")]
    PairingLost(RadioError),
    #[error("timed out waiting for provisioning status (last: {})", display_last(.0))]
    Timeout(Option<ProvisioningStatus>),
    #[error("service handles are stale, rediscover services after reconnecting")]
    StaleHandles,
}

fn display_last(status: &Option<ProvisioningStatus>) -> String {
    match status {
        Some(status) => status.to_string(),
        None => "none".to_string(),
    }
}

impl MonitorError {
    pub fn failure_class(&self) -> Option<FailureClass> {
        match self {
            MonitorError::PairingLost(_) => Some(FailureClass::Authentication),
            MonitorError::Disconnected | MonitorError::StaleHandles => Some(FailureClass::Connection),
            MonitorError::Reported(_) | MonitorError::Timeout(_) => None,
        }
    }
}
