//! Status polling after the connect command

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use medusa_proto::ProvisioningStatus;

use crate::classify::{FailureClass, classify};
use crate::error::MonitorError;
use crate::gatt::{Characteristic, ServiceHandles};
use crate::pairing::PairingCoordinator;
use crate::radio::RadioError;
use crate::session::ConnectionHandle;

/// Read-only observer of the status characteristic
///
/// Never writes to the device. Statuses it sees and the consequences of
/// failed reads are reported back to the coordinator.
#[derive(Clone)]
pub struct StatusMonitor {
    coordinator: PairingCoordinator,
}

impl StatusMonitor {
    pub fn new(coordinator: PairingCoordinator) -> Self {
        Self { coordinator }
    }

    /// Poll until the device reports a terminal status or `timeout` passes
    ///
    /// A link drop, `disconnect` or `unpair` ends the wait early.
    #[instrument(skip(self, conn, handles), fields(device = %conn.device().id, epoch = conn.epoch()))]
    pub async fn monitor(
        &self,
        conn: &ConnectionHandle,
        handles: &ServiceHandles,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<ProvisioningStatus, MonitorError> {
        let deadline = Instant::now() + timeout;
        let status = handles.get(Characteristic::Status).clone();
        let mut cancel = self.coordinator.cancellation();
        let mut last = None;

        loop {
            if !self.coordinator.is_connection_current(conn) {
                return Err(MonitorError::Disconnected);
            }
            if handles.epoch() != conn.epoch() || !self.coordinator.are_handles_current(handles) {
                return Err(MonitorError::StaleHandles);
            }

            let read = tokio::select! {
                read = self.coordinator.radio().read(conn.device(), status.service, status.uuid) => read,
                _ = self.coordinator.link_lost(conn) => return Err(MonitorError::Disconnected),
                _ = cancel.changed() => return Err(self.cancelled(conn)),
                _ = tokio::time::sleep_until(deadline) => return Err(MonitorError::Timeout(last)),
            };

            match read {
                Ok(value) => match ProvisioningStatus::from_value(&value) {
                    Some(s) => {
                        self.coordinator.record_status(conn, s);
                        if s == ProvisioningStatus::Success {
                            info!("device joined the network");
                            return Ok(s);
                        }
                        if s.is_failure() {
                            warn!(status = %s, "device reported failure");
                            return Err(MonitorError::Reported(s));
                        }
                        if let ProvisioningStatus::Unknown(byte) = s {
                            warn!(byte, "unknown status byte, still waiting");
                        } else if last != Some(s) {
                            info!(status = %s, "progress");
                        }
                        last = Some(s);
                    }
                    None => warn!("empty status value"),
                },
                Err(e) => match classify(&e) {
                    FailureClass::Authentication => {
                        self.coordinator.mark_authentication_lost(conn);
                        return Err(MonitorError::PairingLost(e));
                    }
                    FailureClass::Connection => {
                        debug!(error = %e, "status read lost the link");
                        self.coordinator.tear_down(conn).await;
                        return Err(MonitorError::Disconnected);
                    }
                    FailureClass::Transient => warn!(error = %e, "status read failed, still polling"),
                },
            }

            let next_poll = (Instant::now() + poll_interval).min(deadline);
            tokio::select! {
                _ = tokio::time::sleep_until(next_poll) => {}
                _ = self.coordinator.link_lost(conn) => return Err(MonitorError::Disconnected),
                _ = cancel.changed() => return Err(self.cancelled(conn)),
            }
            if Instant::now() >= deadline {
                return Err(MonitorError::Timeout(last));
            }
        }
    }

    fn cancelled(&self, conn: &ConnectionHandle) -> MonitorError {
        if self.coordinator.is_connection_current(conn) {
            MonitorError::PairingLost(RadioError::new("unpaired while waiting for status"))
        } else {
            MonitorError::Disconnected
        }
    }
}
