//! Medusa provisioning protocol - GATT constants and status/control codecs

pub mod ble;

use std::fmt;

/// Command written to the control characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlCommand {
    Connect,
    Clear,
    FactoryReset,
}

impl ControlCommand {
    pub fn to_byte(self) -> u8 {
        match self {
            ControlCommand::Connect => ble::control::CONNECT,
            ControlCommand::Clear => ble::control::CLEAR,
            ControlCommand::FactoryReset => ble::control::FACTORY_RESET,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            ble::control::CONNECT => Some(ControlCommand::Connect),
            ble::control::CLEAR => Some(ControlCommand::Clear),
            ble::control::FACTORY_RESET => Some(ControlCommand::FactoryReset),
            _ => None,
        }
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ControlCommand::Connect => "connect",
            ControlCommand::Clear => "clear",
            ControlCommand::FactoryReset => "factory-reset",
        })
    }
}

/// Provisioning state reported by the device's status characteristic
///
/// Any byte outside the documented set decodes to `Unknown` and is treated
/// as a progress state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProvisioningStatus {
    Idle,
    Pairing,
    Ready,
    Connecting,
    Authenticating,
    ObtainingIp,
    Success,
    FailPairing,
    FailAuth,
    FailNetwork,
    FailInternal,
    Unknown(u8),
}

impl ProvisioningStatus {
    pub fn from_byte(byte: u8) -> Self {
        use ble::status::*;
        match byte {
            IDLE => Self::Idle,
            PAIRING => Self::Pairing,
            READY => Self::Ready,
            CONNECTING => Self::Connecting,
            AUTHENTICATING => Self::Authenticating,
            OBTAINING_IP => Self::ObtainingIp,
            SUCCESS => Self::Success,
            FAIL_PAIRING => Self::FailPairing,
            FAIL_AUTH => Self::FailAuth,
            FAIL_NETWORK => Self::FailNetwork,
            FAIL_INTERNAL => Self::FailInternal,
            other => Self::Unknown(other),
        }
    }

    pub fn to_byte(self) -> u8 {
        use ble::status::*;
        match self {
            Self::Idle => IDLE,
            Self::Pairing => PAIRING,
            Self::Ready => READY,
            Self::Connecting => CONNECTING,
            Self::Authenticating => AUTHENTICATING,
            Self::ObtainingIp => OBTAINING_IP,
            Self::Success => SUCCESS,
            Self::FailPairing => FAIL_PAIRING,
            Self::FailAuth => FAIL_AUTH,
            Self::FailNetwork => FAIL_NETWORK,
            Self::FailInternal => FAIL_INTERNAL,
            Self::Unknown(byte) => byte,
        }
    }

    /// Decode the first byte of a status read; an empty value has no status
    pub fn from_value(value: &[u8]) -> Option<Self> {
        value.first().copied().map(Self::from_byte)
    }

    pub fn is_failure(self) -> bool {
        matches!(
            self,
            Self::FailPairing | Self::FailAuth | Self::FailNetwork | Self::FailInternal
        )
    }

    /// Success and every failure are terminal; nothing follows them
    pub fn is_terminal(self) -> bool {
        self == Self::Success || self.is_failure()
    }
}

impl fmt::Display for ProvisioningStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Pairing => f.write_str("pairing"),
            Self::Ready => f.write_str("ready"),
            Self::Connecting => f.write_str("connecting to WiFi"),
            Self::Authenticating => f.write_str("authenticating with access point"),
            Self::ObtainingIp => f.write_str("obtaining IP address"),
            Self::Success => f.write_str("connected"),
            Self::FailPairing => f.write_str("failed: pairing"),
            Self::FailAuth => f.write_str("failed: WiFi authentication (wrong password?)"),
            Self::FailNetwork => f.write_str("failed: network unreachable"),
            Self::FailInternal => f.write_str("failed: internal device error"),
            Self::Unknown(byte) => write!(f, "unknown status 0x{byte:02x}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documented_status_bytes() {
        let expected = [
            (0x01, ProvisioningStatus::Idle),
            (0x02, ProvisioningStatus::Pairing),
            (0x03, ProvisioningStatus::Ready),
            (0x04, ProvisioningStatus::Connecting),
            (0x05, ProvisioningStatus::Authenticating),
            (0x06, ProvisioningStatus::ObtainingIp),
            (0x07, ProvisioningStatus::Success),
            (0xF0, ProvisioningStatus::FailPairing),
            (0xF1, ProvisioningStatus::FailAuth),
            (0xF2, ProvisioningStatus::FailNetwork),
            (0xFF, ProvisioningStatus::FailInternal),
        ];
        for (byte, status) in expected {
            assert_eq!(ProvisioningStatus::from_byte(byte), status);
            assert_eq!(status.to_byte(), byte);
        }
    }

    #[test]
    fn unknown_byte_is_not_terminal() {
        let status = ProvisioningStatus::from_byte(0x08);
        assert_eq!(status, ProvisioningStatus::Unknown(0x08));
        assert!(!status.is_terminal());
        assert_eq!(status.to_string(), "unknown status 0x08");
    }

    #[test]
    fn terminal_states() {
        assert!(ProvisioningStatus::Success.is_terminal());
        assert!(!ProvisioningStatus::Success.is_failure());
        assert!(ProvisioningStatus::FailNetwork.is_terminal());
        assert!(!ProvisioningStatus::ObtainingIp.is_terminal());
    }

    #[test]
    fn empty_status_value() {
        assert_eq!(ProvisioningStatus::from_value(&[]), None);
        assert_eq!(
            ProvisioningStatus::from_value(&[0x07, 0x00]),
            Some(ProvisioningStatus::Success)
        );
    }

    #[test]
    fn control_bytes() {
        assert_eq!(ControlCommand::Connect.to_byte(), 0x01);
        assert_eq!(ControlCommand::Clear.to_byte(), 0x02);
        assert_eq!(ControlCommand::FactoryReset.to_byte(), 0x03);
        assert_eq!(ControlCommand::from_byte(0x04), None);
    }
}
