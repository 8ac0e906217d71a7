//! Failure classification shared by pairing, provisioning and monitoring
//!
//! Platform stacks mostly hand back untyped strings, so recognition is by
//! code first and by message substring second. Every call site goes
//! through [`classify`]; nothing else sniffs error text.

use crate::radio::{ErrorCode, RadioError};

/// Root cause of a failed radio operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// The link is no longer authenticated: bond lost, wrong PIN,
    /// insufficient authentication/encryption. Retrying cannot help.
    Authentication,
    /// The link is gone or unusable: tear it down, reconnect, rediscover.
    Connection,
    /// Anything else; eligible for bounded retry at the call site.
    Transient,
}

impl FailureClass {
    /// One-line hint the UI can show next to the error
    pub fn remediation(self) -> &'static str {
        match self {
            FailureClass::Authentication => "re-enter the PIN shown on the device and pair again",
            FailureClass::Connection => "move closer to the device and reconnect",
            FailureClass::Transient => "try again",
        }
    }
}

// ATT: insufficient authentication, insufficient authorization,
// insufficient encryption key size, insufficient encryption
const ATT_AUTHENTICATION: [u8; 4] = [0x05, 0x08, 0x0C, 0x0F];

// HCI: authentication failure, PIN or key missing, pairing not allowed,
// insufficient security
const HCI_AUTHENTICATION: [u8; 4] = [0x05, 0x06, 0x18, 0x2F];

// HCI: connection timeout, remote user terminated, remote low resources,
// remote power off, local host terminated, LMP/LL response timeout,
// failed to establish
const HCI_CONNECTION: [u8; 7] = [0x08, 0x13, 0x14, 0x15, 0x16, 0x22, 0x3E];

const AUTHENTICATION_PATTERNS: &[&str] = &[
    "insufficient authentication",
    "insufficient encryption",
    "insufficient authorization",
    "not authorized",
    "notauthorized",
    "unauthorized",
    "authentication",
    "not paired",
    "bond",
    "pairing",
    "access denied",
    "pin or key missing",
];

const CONNECTION_PATTERNS: &[&str] = &[
    "disconnect",
    "not connected",
    "connection",
    "timed out",
    "timeout",
    "unreachable",
    "cancel",
    "link loss",
    "link lost",
    "device not found",
    "no longer available",
    "object has been closed",
];

/// Map a raw platform error onto one of the three failure classes
pub fn classify(error: &RadioError) -> FailureClass {
    match error.code {
        Some(ErrorCode::Att(code)) if ATT_AUTHENTICATION.contains(&code) => {
            return FailureClass::Authentication;
        }
        Some(ErrorCode::Hci(code)) if HCI_AUTHENTICATION.contains(&code) => {
            return FailureClass::Authentication;
        }
        Some(ErrorCode::Hci(code)) if HCI_CONNECTION.contains(&code) => {
            return FailureClass::Connection;
        }
        _ => {}
    }

    let message = error.message.to_lowercase();
    if AUTHENTICATION_PATTERNS.iter().any(|p| message.contains(p)) {
        FailureClass::Authentication
    } else if CONNECTION_PATTERNS.iter().any(|p| message.contains(p)) {
        FailureClass::Connection
    } else {
        FailureClass::Transient
    }
}
