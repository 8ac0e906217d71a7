//! GATT provisioning client
//!
//! Connects to a paired sensor, resolves the provisioning service and writes
//! credentials in protocol order. Every characteristic access doubles as a
//! check that the bond is still good.

use tracing::{debug, info, instrument, warn};

use medusa_proto::{ControlCommand, ProvisioningStatus};

use crate::classify::{FailureClass, classify};
use crate::error::{ConnectError, DiscoveryError, ProvisioningError, VerificationError};
use crate::gatt::{self, Characteristic, CharacteristicRef, Resolution, ServiceHandles};
use crate::pairing::PairingCoordinator;
use crate::radio::{DeviceHandle, RadioError};
use crate::session::ConnectionHandle;

const MAX_SSID_LEN: usize = 32;
const MIN_PSK_LEN: usize = 8;
const MAX_PSK_LEN: usize = 64;

/// Check WiFi credentials before anything goes over the air
///
/// An empty PSK selects an open network. A 64-character PSK is a raw hex
/// key rather than a passphrase.
pub fn validate_credentials(ssid: &str, psk: &str) -> Result<(), ProvisioningError> {
    if ssid.is_empty() {
        return Err(ProvisioningError::InvalidCredentials("SSID is empty"));
    }
    if ssid.len() > MAX_SSID_LEN {
        return Err(ProvisioningError::InvalidCredentials("SSID is longer than 32 bytes"));
    }
    if !psk.is_empty() && psk.len() < MIN_PSK_LEN {
        return Err(ProvisioningError::InvalidCredentials("passphrase is shorter than 8 bytes"));
    }
    if psk.len() > MAX_PSK_LEN {
        return Err(ProvisioningError::InvalidCredentials("passphrase is longer than 64 bytes"));
    }
    if psk.len() == MAX_PSK_LEN && !psk.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ProvisioningError::InvalidCredentials(
            "a 64 character key must be hexadecimal",
        ));
    }
    Ok(())
}

#[derive(Clone)]
pub struct ProvisioningClient {
    coordinator: PairingCoordinator,
}

impl ProvisioningClient {
    pub fn new(coordinator: PairingCoordinator) -> Self {
        Self { coordinator }
    }

    pub fn coordinator(&self) -> &PairingCoordinator {
        &self.coordinator
    }

    /// Open the GATT connection
    ///
    /// Requires a finished pairing on platforms with explicit pairing.
    #[instrument(skip(self, device), fields(device = %device.id))]
    pub async fn connect(&self, device: &DeviceHandle) -> Result<ConnectionHandle, ConnectError> {
        self.coordinator.begin_connecting(device)?;

        let timeout = self.coordinator.config().connect_timeout();
        let result = match tokio::time::timeout(timeout, self.coordinator.radio().connect(device)).await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ConnectError::Unreachable(e)),
            Err(_) => Err(ConnectError::Timeout(timeout)),
        };
        if let Err(e) = result {
            warn!(error = %e, "connect failed");
            self.coordinator.tear_down_device(device).await;
            return Err(e);
        }

        let conn = self.coordinator.mark_connected(device).ok_or_else(|| {
            ConnectError::Unreachable(RadioError::new("session closed while connecting"))
        })?;
        info!(epoch = conn.epoch(), "connected");
        Ok(conn)
    }

    /// Resolve the provisioning service on this connection
    #[instrument(skip(self, conn), fields(device = %conn.device().id, epoch = conn.epoch()))]
    pub async fn discover_services(
        &self,
        conn: &ConnectionHandle,
    ) -> Result<ServiceHandles, DiscoveryError> {
        if !self.coordinator.is_connection_current(conn) {
            return Err(DiscoveryError::NotConnected);
        }

        let timeout = self.coordinator.config().gatt_timeout();
        let services = match tokio::time::timeout(
            timeout,
            self.coordinator.radio().discover_services(conn.device()),
        )
        .await
        {
            Ok(Ok(services)) => services,
            Ok(Err(e)) => {
                self.on_link_error(conn, &e).await;
                return Err(DiscoveryError::Radio(e));
            }
            Err(_) => {
                let e = RadioError::timed_out("service discovery", timeout);
                self.on_link_error(conn, &e).await;
                return Err(DiscoveryError::Radio(e));
            }
        };
        debug!(count = services.len(), "services discovered");

        let handles = gatt::resolve(&services, conn.epoch()).map_err(|r| match r {
            Resolution::ServiceNotFound => DiscoveryError::ServiceNotFound,
            Resolution::CharacteristicMissing(which) => DiscoveryError::CharacteristicMissing(which),
        })?;
        if !self.coordinator.install_handles(handles.clone()) {
            return Err(DiscoveryError::NotConnected);
        }
        info!("provisioning service resolved");
        Ok(handles)
    }

    /// Read the status characteristic to prove the link is encrypted
    ///
    /// Needed again after every reconnect.
    #[instrument(skip(self, conn), fields(device = %conn.device().id, epoch = conn.epoch()))]
    pub async fn verify_secure_channel(&self, conn: &ConnectionHandle) -> Result<(), VerificationError> {
        let handles = self
            .coordinator
            .handles_for(conn)
            .ok_or(VerificationError::DiscoveryRequired)?;
        let status = handles.get(Characteristic::Status);
        let attempts = self.attempts();

        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match self.read(conn, status).await {
                Ok(value) => {
                    self.coordinator.mark_secure_channel_verified(conn);
                    if let Some(status) = ProvisioningStatus::from_value(&value) {
                        self.coordinator.record_status(conn, status);
                    }
                    info!("secure channel verified");
                    return Ok(());
                }
                Err(e) => e,
            };
            match self.on_link_error(conn, &error).await {
                FailureClass::Authentication => {
                    return Err(VerificationError::AuthenticationRequired(error));
                }
                FailureClass::Connection => return Err(VerificationError::ConnectionLost(error)),
                FailureClass::Transient if attempt < attempts => {
                    warn!(attempt, error = %error, "status read failed, retrying");
                    if !self.backoff(conn).await {
                        return Err(VerificationError::ConnectionLost(error));
                    }
                }
                FailureClass::Transient => return Err(VerificationError::Failed(error)),
            }
        }
    }

    /// Write SSID, PSK and the connect command, strictly in that order
    #[instrument(skip_all, fields(device = %conn.device().id, epoch = conn.epoch()))]
    pub async fn write_credentials(
        &self,
        conn: &ConnectionHandle,
        handles: &ServiceHandles,
        ssid: &str,
        psk: &str,
    ) -> Result<(), ProvisioningError> {
        validate_credentials(ssid, psk)?;
        self.ensure_current(conn, handles)?;
        info!(ssid_len = ssid.len(), psk_len = psk.len(), "sending WiFi credentials");

        self.write_with_retry(conn, handles, Characteristic::Ssid, ssid.as_bytes())
            .await?;
        self.settle().await;
        self.write_with_retry(conn, handles, Characteristic::Psk, psk.as_bytes())
            .await?;
        self.settle().await;
        self.write_with_retry(
            conn,
            handles,
            Characteristic::Control,
            &[ControlCommand::Connect.to_byte()],
        )
        .await?;

        info!("credentials sent");
        Ok(())
    }

    #[instrument(skip(self, conn, handles), fields(device = %conn.device().id, epoch = conn.epoch()))]
    pub async fn send_control(
        &self,
        conn: &ConnectionHandle,
        handles: &ServiceHandles,
        command: ControlCommand,
    ) -> Result<(), ProvisioningError> {
        self.ensure_current(conn, handles)?;
        self.write_with_retry(conn, handles, Characteristic::Control, &[command.to_byte()])
            .await?;
        info!(%command, "control command sent");
        Ok(())
    }

    fn attempts(&self) -> u32 {
        self.coordinator.config().write_retries.max(1)
    }

    fn ensure_current(
        &self,
        conn: &ConnectionHandle,
        handles: &ServiceHandles,
    ) -> Result<(), ProvisioningError> {
        if handles.epoch() == conn.epoch()
            && self.coordinator.is_connection_current(conn)
            && self.coordinator.are_handles_current(handles)
        {
            Ok(())
        } else {
            Err(ProvisioningError::StaleHandles)
        }
    }

    async fn settle(&self) {
        tokio::time::sleep(self.coordinator.config().settle_delay()).await;
    }

    /// Sleep before a retry; false if the link dropped meanwhile
    async fn backoff(&self, conn: &ConnectionHandle) -> bool {
        let delay = self.coordinator.config().retry_backoff();
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.coordinator.link_lost(conn) => false,
        }
    }

    async fn read(&self, conn: &ConnectionHandle, c: &CharacteristicRef) -> Result<Vec<u8>, RadioError> {
        let timeout = self.coordinator.config().gatt_timeout();
        tokio::time::timeout(
            timeout,
            self.coordinator.radio().read(conn.device(), c.service, c.uuid),
        )
        .await
        .unwrap_or_else(|_| Err(RadioError::timed_out("read", timeout)))
    }

    async fn write(
        &self,
        conn: &ConnectionHandle,
        c: &CharacteristicRef,
        value: &[u8],
    ) -> Result<(), RadioError> {
        let timeout = self.coordinator.config().gatt_timeout();
        tokio::time::timeout(
            timeout,
            self.coordinator
                .radio()
                .write(conn.device(), c.service, c.uuid, value, c.write_kind()),
        )
        .await
        .unwrap_or_else(|_| Err(RadioError::timed_out("write", timeout)))
    }

    async fn write_with_retry(
        &self,
        conn: &ConnectionHandle,
        handles: &ServiceHandles,
        target: Characteristic,
        value: &[u8],
    ) -> Result<(), ProvisioningError> {
        let c = handles.get(target);
        let attempts = self.attempts();

        let mut attempt = 0;
        loop {
            attempt += 1;
            self.ensure_current(conn, handles)?;
            let error = match self.write(conn, c, value).await {
                Ok(()) => {
                    debug!(%target, attempt, len = value.len(), "write acknowledged");
                    return Ok(());
                }
                Err(e) => e,
            };
            match self.on_link_error(conn, &error).await {
                FailureClass::Transient if attempt < attempts => {
                    warn!(%target, attempt, error = %error, "write failed, retrying");
                    if !self.backoff(conn).await {
                        return Err(ProvisioningError::StaleHandles);
                    }
                }
                FailureClass::Transient => {
                    warn!(%target, attempts, error = %error, "write retries exhausted");
                    return Err(ProvisioningError::RetriesExhausted { target, attempts, source: error });
                }
                class => {
                    warn!(%target, ?class, error = %error, "write failed");
                    return Err(ProvisioningError::WriteFailed { target, class, source: error });
                }
            }
        }
    }

    /// Classify and apply the session consequences of a failed access
    async fn on_link_error(&self, conn: &ConnectionHandle, error: &RadioError) -> FailureClass {
        let class = classify(error);
        match class {
            FailureClass::Authentication => self.coordinator.mark_authentication_lost(conn),
            FailureClass::Connection => {
                warn!(error = %error, "link unusable, tearing down");
                self.coordinator.tear_down(conn).await;
            }
            FailureClass::Transient => {}
        }
        class
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_rules() {
        assert!(validate_credentials("MyWifi", "secret123").is_ok());
        assert!(validate_credentials("OpenCafe", "").is_ok());
        assert!(validate_credentials(&"s".repeat(32), &"p".repeat(63)).is_ok());
        assert!(validate_credentials("hex", &"a1".repeat(32)).is_ok());

        for (ssid, psk) in [
            ("", "secret123"),
            (&*"s".repeat(33), "secret123"),
            ("MyWifi", "short"),
            ("MyWifi", &*"p".repeat(65)),
            ("MyWifi", &*"z".repeat(64)),
        ] {
            assert!(
                matches!(
                    validate_credentials(ssid, psk),
                    Err(ProvisioningError::InvalidCredentials(_))
                ),
                "{ssid:?} / {psk:?}"
            );
        }
    }
}
