//! Medusa BLE provisioning core
//!
//! Pairs with a Medusa sensor, writes WiFi credentials over the provisioning
//! GATT service and watches the device join the network.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use medusa_ble::{PairingCoordinator, ProvisioningClient, ProvisioningConfig, StatusMonitor};
//!
//! let radio = Arc::new(medusa_ble::BtleplugRadio::new().await?);
//! let config = ProvisioningConfig::default();
//! let coordinator = PairingCoordinator::new(radio, config.clone());
//!
//! coordinator.pair(&device, config.require_mitm, config.pin_timeout()).await?;
//! let client = ProvisioningClient::new(coordinator.clone());
//! let conn = client.connect(&device).await?;
//! let handles = client.discover_services(&conn).await?;
//! client.verify_secure_channel(&conn).await?;
//! client.write_credentials(&conn, &handles, "MyWifi", "secret123").await?;
//!
//! let status = StatusMonitor::new(coordinator)
//!     .monitor(&conn, &handles, config.status_timeout(), config.poll_interval())
//!     .await?;
//! ```

pub mod classify;
pub mod config;
pub mod error;
pub mod fake_radio;
pub mod gatt;
pub mod monitor;
pub mod pairing;
pub mod provisioning;
pub mod radio;
pub mod session;

#[cfg(feature = "btleplug")]
pub mod btleplug_radio;

#[cfg(feature = "btleplug")]
pub use btleplug_radio::BtleplugRadio;
pub use classify::{FailureClass, classify};
pub use config::{ConfigError, ProvisioningConfig};
pub use error::{
    ConnectError, DiscoveryError, MonitorError, PairingError, PinSubmissionError,
    ProvisioningError, VerificationError,
};
pub use gatt::{Characteristic, ServiceHandles};
pub use medusa_proto::{ControlCommand, ProvisioningStatus};
pub use monitor::StatusMonitor;
pub use pairing::{PairingCoordinator, SessionEvent};
pub use provisioning::{ProvisioningClient, validate_credentials};
pub use radio::{BleRadio, BondState, DeviceHandle, PairingStatus, RadioError};
pub use session::{ConnectionHandle, ConnectionState, PairingPhase, PairingSession};
