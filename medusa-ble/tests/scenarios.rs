//! End-to-end flows against the scripted radio

use std::sync::Arc;
use std::time::{Duration, Instant};

use medusa_ble::fake_radio::FakeRadio;
use medusa_ble::gatt;
use medusa_ble::{
    BondState, Characteristic, ConnectError, ConnectionHandle, ConnectionState, ControlCommand,
    DeviceHandle, DiscoveryError, FailureClass, MonitorError, PairingCoordinator, PairingError,
    ProvisioningClient, ProvisioningConfig, ProvisioningError, ProvisioningStatus, RadioError,
    ServiceHandles, SessionEvent, StatusMonitor, VerificationError,
};
use medusa_proto::ble::status;

const PIN: &str = "482913";
const POLL: Duration = Duration::from_millis(5);

fn device() -> DeviceHandle {
    DeviceHandle::new("D4:61:2E:00:10:7A", "Medusa-7A", Some(-55))
}

fn fast_config() -> ProvisioningConfig {
    ProvisioningConfig {
        settle_delay_ms: 5,
        retry_backoff_ms: 5,
        connect_timeout_ms: 1_000,
        gatt_timeout_ms: 1_000,
        ..Default::default()
    }
}

struct Rig {
    radio: Arc<FakeRadio>,
    coordinator: PairingCoordinator,
    client: ProvisioningClient,
    monitor: StatusMonitor,
}

impl Rig {
    fn new() -> Self {
        let radio = Arc::new(FakeRadio::new().with_device(device()));
        radio.set_expected_pin(PIN);
        let coordinator = PairingCoordinator::new(radio.clone(), fast_config());
        Self {
            client: ProvisioningClient::new(coordinator.clone()),
            monitor: StatusMonitor::new(coordinator.clone()),
            radio,
            coordinator,
        }
    }

    /// Pair the way a human would: wait for the prompt, type the PIN
    async fn pair(&self) -> Result<(), PairingError> {
        let mut events = self.coordinator.events();
        let pairing = tokio::spawn({
            let c = self.coordinator.clone();
            async move { c.pair(&device(), true, Duration::from_secs(5)).await }
        });
        loop {
            match events.recv().await.unwrap() {
                SessionEvent::PinRequested => break,
                _ => continue,
            }
        }
        self.coordinator.submit_pin(PIN.to_string()).unwrap();
        pairing.await.unwrap()
    }

    async fn connected(&self) -> (ConnectionHandle, ServiceHandles) {
        self.pair().await.unwrap();
        let conn = self.client.connect(&device()).await.unwrap();
        let handles = self.client.discover_services(&conn).await.unwrap();
        self.client.verify_secure_channel(&conn).await.unwrap();
        (conn, handles)
    }

    async fn monitor(
        &self,
        conn: &ConnectionHandle,
        handles: &ServiceHandles,
        timeout: Duration,
    ) -> Result<ProvisioningStatus, MonitorError> {
        self.monitor.monitor(conn, handles, timeout, POLL).await
    }
}

fn status_events(events: &mut tokio::sync::broadcast::Receiver<SessionEvent>) -> Vec<ProvisioningStatus> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::Status(s) = event {
            out.push(s);
        }
    }
    out
}

#[tokio::test]
async fn happy_path() {
    let rig = Rig::new();
    let mut events = rig.coordinator.events();

    rig.pair().await.unwrap();
    assert!(rig.coordinator.session().unwrap().paired());

    let conn = rig.client.connect(&device()).await.unwrap();
    let handles = rig.client.discover_services(&conn).await.unwrap();
    for which in Characteristic::ALL {
        assert_eq!(handles.get(which).uuid, which.uuid());
    }
    rig.client.verify_secure_channel(&conn).await.unwrap();

    rig.client
        .write_credentials(&conn, &handles, "MyWifi", "secret123")
        .await
        .unwrap();
    let writes = rig.radio.writes();
    assert_eq!(writes.len(), 3);
    assert_eq!(writes[0].characteristic, gatt::WIFI_SSID);
    assert_eq!(writes[0].value, b"MyWifi");
    assert_eq!(writes[1].characteristic, gatt::WIFI_PSK);
    assert_eq!(writes[1].value, b"secret123");
    assert_eq!(writes[2].characteristic, gatt::CONTROL);
    assert_eq!(writes[2].value, [ControlCommand::Connect.to_byte()]);

    rig.client
        .send_control(&conn, &handles, ControlCommand::Connect)
        .await
        .unwrap();
    assert_eq!(rig.radio.writes().len(), 4);

    for byte in [
        status::READY,
        status::CONNECTING,
        status::AUTHENTICATING,
        status::OBTAINING_IP,
        status::SUCCESS,
    ] {
        rig.radio.push_status(byte);
    }
    let started = Instant::now();
    let result = rig.monitor(&conn, &handles, Duration::from_secs(30)).await;
    assert_eq!(result.unwrap(), ProvisioningStatus::Success);
    assert!(started.elapsed() < Duration::from_secs(2));

    assert_eq!(
        status_events(&mut events),
        [
            ProvisioningStatus::Idle,
            ProvisioningStatus::Ready,
            ProvisioningStatus::Connecting,
            ProvisioningStatus::Authenticating,
            ProvisioningStatus::ObtainingIp,
            ProvisioningStatus::Success,
        ]
    );
    assert_eq!(
        rig.coordinator.session().unwrap().last_status(),
        Some(ProvisioningStatus::Success)
    );
}

#[tokio::test]
async fn auth_lost_on_first_write_stops_the_flow() {
    let rig = Rig::new();
    let (conn, handles) = rig.connected().await;

    // device forgot the bond after pairing reported success
    rig.radio.forget_bond(&device().id);

    let err = rig
        .client
        .write_credentials(&conn, &handles, "MyWifi", "secret123")
        .await
        .unwrap_err();
    match err {
        ProvisioningError::WriteFailed { target, class, .. } => {
            assert_eq!(target, Characteristic::Ssid);
            assert_eq!(class, FailureClass::Authentication);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(rig.radio.writes().is_empty(), "PSK must not be attempted");
    assert!(!rig.coordinator.session().unwrap().paired());
}

#[tokio::test]
async fn reported_failure_returns_immediately() {
    let rig = Rig::new();
    let (conn, handles) = rig.connected().await;
    let reads_before = rig.radio.read_count();

    rig.radio.push_status(status::CONNECTING);
    rig.radio.push_status(status::FAIL_AUTH);
    rig.radio.push_status(status::SUCCESS);

    let err = rig
        .monitor(&conn, &handles, Duration::from_secs(30))
        .await
        .unwrap_err();
    assert!(matches!(err, MonitorError::Reported(ProvisioningStatus::FailAuth)));
    assert_eq!(rig.radio.read_count() - reads_before, 2);
}

#[tokio::test]
async fn disconnect_during_monitor() {
    let rig = Rig::new();
    let (conn, handles) = rig.connected().await;
    rig.radio.push_status(status::CONNECTING);
    rig.radio.set_read_delay(Duration::from_millis(20));

    let radio = rig.radio.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        radio.drop_link(&device().id);
    });

    let started = Instant::now();
    let err = rig
        .monitor(&conn, &handles, Duration::from_secs(30))
        .await
        .unwrap_err();
    assert!(matches!(err, MonitorError::Disconnected), "{err:?}");
    assert!(started.elapsed() < Duration::from_secs(1));

    let session = rig.coordinator.session().unwrap();
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);
    assert!(session.service_handles().is_none());
    assert!(!session.paired());
    assert!(session.is_consistent());
}

#[tokio::test]
async fn unknown_status_keeps_polling() {
    let rig = Rig::new();
    let (conn, handles) = rig.connected().await;
    let reads_before = rig.radio.read_count();

    rig.radio.push_status(0x08);
    rig.radio.push_status(status::SUCCESS);
    let result = rig.monitor(&conn, &handles, Duration::from_secs(30)).await;
    assert_eq!(result.unwrap(), ProvisioningStatus::Success);
    assert_eq!(rig.radio.read_count() - reads_before, 2);
}

#[tokio::test]
async fn transient_status_read_error_keeps_polling() {
    let rig = Rig::new();
    let (conn, handles) = rig.connected().await;
    let reads_before = rig.radio.read_count();

    rig.radio.push_read_error(RadioError::new("GATT error 0x0e: unlikely error"));
    rig.radio.push_status(status::SUCCESS);
    let result = rig.monitor(&conn, &handles, Duration::from_secs(30)).await;
    assert_eq!(result.unwrap(), ProvisioningStatus::Success);
    assert_eq!(rig.radio.read_count() - reads_before, 2);
    assert!(rig.coordinator.session().unwrap().paired());
}

#[tokio::test]
async fn auth_error_during_monitor_drops_pairing() {
    let rig = Rig::new();
    let (conn, handles) = rig.connected().await;

    rig.radio
        .push_read_error(RadioError::new("GATT error: Insufficient Authentication"));
    let err = rig
        .monitor(&conn, &handles, Duration::from_secs(30))
        .await
        .unwrap_err();
    assert!(matches!(err, MonitorError::PairingLost(_)), "{err:?}");
    assert!(!rig.coordinator.session().unwrap().paired());
}

#[tokio::test]
async fn connection_error_during_monitor_tears_down_the_link() {
    let rig = Rig::new();
    let (conn, handles) = rig.connected().await;

    rig.radio.push_read_error(RadioError::new("Device disconnected"));
    let err = rig
        .monitor(&conn, &handles, Duration::from_secs(30))
        .await
        .unwrap_err();
    assert!(matches!(err, MonitorError::Disconnected), "{err:?}");

    let session = rig.coordinator.session().unwrap();
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);
    assert!(session.service_handles().is_none());
    assert!(!rig.radio.is_connected(&device().id));

    let writes_before = rig.radio.writes().len();
    let err = rig
        .client
        .send_control(&conn, &handles, ControlCommand::Clear)
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisioningError::StaleHandles), "{err:?}");
    assert_eq!(rig.radio.writes().len(), writes_before);
}

#[tokio::test]
async fn monitor_timeout_carries_last_status() {
    let rig = Rig::new();
    let (conn, handles) = rig.connected().await;
    rig.radio.push_status(0x08);

    let started = Instant::now();
    let err = rig
        .monitor(&conn, &handles, Duration::from_millis(60))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MonitorError::Timeout(Some(ProvisioningStatus::Unknown(0x08)))
    ));
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[tokio::test]
async fn explicit_disconnect_cancels_monitor() {
    let rig = Rig::new();
    let (conn, handles) = rig.connected().await;
    rig.radio.push_status(status::CONNECTING);

    let coordinator = rig.coordinator.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        coordinator.disconnect().await.unwrap();
    });

    let err = rig
        .monitor(&conn, &handles, Duration::from_secs(30))
        .await
        .unwrap_err();
    assert!(matches!(err, MonitorError::Disconnected));
    assert!(rig.coordinator.session().is_none());
}

#[tokio::test]
async fn unpair_cancels_monitor() {
    let rig = Rig::new();
    let (conn, handles) = rig.connected().await;
    rig.radio.push_status(status::CONNECTING);

    let coordinator = rig.coordinator.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        coordinator.unpair(&device()).await.unwrap();
    });

    let err = rig
        .monitor(&conn, &handles, Duration::from_secs(30))
        .await
        .unwrap_err();
    assert!(matches!(err, MonitorError::PairingLost(_)));
    assert!(!rig.coordinator.session().unwrap().paired());
}

#[tokio::test]
async fn connect_requires_pairing() {
    let rig = Rig::new();
    let err = rig.client.connect(&device()).await.unwrap_err();
    assert!(matches!(err, ConnectError::NotPaired));
    assert!(!rig.radio.is_connected(&device().id));
}

#[tokio::test]
async fn discovery_on_a_closed_connection_fails_fast() {
    let rig = Rig::new();
    rig.pair().await.unwrap();
    let conn = rig.client.connect(&device()).await.unwrap();
    rig.coordinator.disconnect().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(1), rig.client.discover_services(&conn))
        .await
        .expect("discovery must not hang");
    assert!(matches!(result, Err(DiscoveryError::NotConnected)));
}

#[tokio::test]
async fn missing_service_is_reported() {
    let rig = Rig::new();
    rig.radio.set_services(vec![]);
    rig.pair().await.unwrap();
    let conn = rig.client.connect(&device()).await.unwrap();

    let err = rig.client.discover_services(&conn).await.unwrap_err();
    assert!(matches!(err, DiscoveryError::ServiceNotFound));
    assert!(matches!(
        rig.client.verify_secure_channel(&conn).await,
        Err(VerificationError::DiscoveryRequired)
    ));
}

#[tokio::test]
async fn unreachable_device_leaves_session_disconnected() {
    let rig = Rig::new();
    rig.pair().await.unwrap();
    rig.radio.set_connect_error(Some(RadioError::new("device unreachable")));

    let err = rig.client.connect(&device()).await.unwrap_err();
    assert!(matches!(err, ConnectError::Unreachable(_)));
    assert_eq!(err.failure_class(), Some(FailureClass::Connection));
    assert_eq!(
        rig.coordinator.session().unwrap().connection_state(),
        ConnectionState::Disconnected
    );
}

#[tokio::test]
async fn transient_write_failure_is_retried() {
    let rig = Rig::new();
    let (conn, handles) = rig.connected().await;
    rig.radio
        .fail_next_write(gatt::WIFI_PSK, RadioError::new("GATT error 0x0e: unlikely error"));

    rig.client
        .write_credentials(&conn, &handles, "MyWifi", "secret123")
        .await
        .unwrap();
    assert_eq!(rig.radio.writes().len(), 3);
}

#[tokio::test]
async fn retries_are_bounded() {
    let rig = Rig::new();
    let (conn, handles) = rig.connected().await;
    for _ in 0..3 {
        rig.radio
            .fail_next_write(gatt::CONTROL, RadioError::new("GATT error 0x0e: unlikely error"));
    }

    let err = rig
        .client
        .send_control(&conn, &handles, ControlCommand::Clear)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ProvisioningError::RetriesExhausted { target: Characteristic::Control, attempts: 3, .. }
    ));
    assert!(rig.radio.writes().is_empty());
}

#[tokio::test]
async fn link_loss_mid_write_requires_rediscovery() {
    let rig = Rig::new();
    let (conn, handles) = rig.connected().await;
    rig.radio
        .fail_next_write(gatt::WIFI_PSK, RadioError::new("Device disconnected"));

    let err = rig
        .client
        .write_credentials(&conn, &handles, "MyWifi", "secret123")
        .await
        .unwrap_err();
    assert_eq!(err.failure_class(), Some(FailureClass::Connection));
    assert!(matches!(
        err,
        ProvisioningError::WriteFailed { target: Characteristic::Psk, .. }
    ));
    let session = rig.coordinator.session().unwrap();
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);
    assert!(session.service_handles().is_none());

    // the old handles are dead even after a reconnect
    assert!(matches!(
        rig.client
            .send_control(&conn, &handles, ControlCommand::Connect)
            .await,
        Err(ProvisioningError::StaleHandles)
    ));
    assert!(matches!(
        rig.client.connect(&device()).await,
        Err(ConnectError::NotPaired)
    ));
    // the OS bond survived, so re-pairing needs no PIN
    rig.coordinator
        .pair(&device(), true, Duration::from_secs(1))
        .await
        .unwrap();
    let fresh = rig.client.connect(&device()).await.unwrap();
    assert_ne!(fresh.epoch(), conn.epoch());
    assert!(matches!(
        rig.client
            .send_control(&fresh, &handles, ControlCommand::Connect)
            .await,
        Err(ProvisioningError::StaleHandles)
    ));

    let handles = rig.client.discover_services(&fresh).await.unwrap();
    rig.client.verify_secure_channel(&fresh).await.unwrap();
    rig.client
        .write_credentials(&fresh, &handles, "MyWifi", "secret123")
        .await
        .unwrap();
    assert!(rig.coordinator.session().unwrap().is_consistent());
}

#[tokio::test]
async fn verification_detects_lost_bond() {
    let rig = Rig::new();
    rig.pair().await.unwrap();
    let conn = rig.client.connect(&device()).await.unwrap();
    rig.client.discover_services(&conn).await.unwrap();
    rig.radio.forget_bond(&device().id);

    let err = rig.client.verify_secure_channel(&conn).await.unwrap_err();
    assert!(matches!(err, VerificationError::AuthenticationRequired(_)));
    assert!(!rig.coordinator.session().unwrap().paired());
}

#[tokio::test]
async fn invalid_credentials_never_reach_the_device() {
    let rig = Rig::new();
    let (conn, handles) = rig.connected().await;

    let err = rig
        .client
        .write_credentials(&conn, &handles, "MyWifi", "short")
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisioningError::InvalidCredentials(_)));
    assert!(rig.radio.writes().is_empty());
}

#[tokio::test]
async fn implicit_pairing_platform_verifies_on_first_read() {
    let rig = Rig::new();
    rig.radio.set_explicit_pairing(false);

    let err = rig
        .coordinator
        .pair(&device(), true, Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, PairingError::PlatformUnsupported));
    assert_eq!(
        rig.coordinator.is_paired(&device()).await.unwrap(),
        BondState::Indeterminate
    );

    let conn = rig.client.connect(&device()).await.unwrap();
    let handles = rig.client.discover_services(&conn).await.unwrap();
    rig.client.verify_secure_channel(&conn).await.unwrap();
    assert_eq!(
        rig.coordinator.is_paired(&device()).await.unwrap(),
        BondState::Paired
    );
    rig.client
        .write_credentials(&conn, &handles, "MyWifi", "secret123")
        .await
        .unwrap();
}
