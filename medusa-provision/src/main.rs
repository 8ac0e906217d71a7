//! BLE provisioning tool for Medusa sensors
//!
//! Pairs with a sensor, sends WiFi credentials over BLE and waits for the
//! sensor to join the network.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::broadcast::error::RecvError;
use tracing::{Level, debug, warn};
use tracing_subscriber::EnvFilter;

use medusa_ble::{
    BleRadio, BtleplugRadio, ConnectError, ConnectionHandle, ControlCommand, DeviceHandle,
    DiscoveryError, FailureClass, MonitorError, PairingCoordinator, PairingError, PairingStatus,
    PinSubmissionError, ProvisioningClient, ProvisioningConfig, ProvisioningError, ServiceHandles,
    SessionEvent, StatusMonitor, VerificationError, validate_credentials,
};

#[derive(Parser)]
#[command(name = "medusa-provision")]
#[command(about = "BLE provisioning tool for Medusa sensors")]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Seconds to wait for the PIN (overrides provision.json)
    #[arg(long, global = true)]
    pin_timeout: Option<u64>,
    /// Seconds to wait for the sensor to join the network
    #[arg(long, global = true)]
    status_timeout: Option<u64>,
    /// Allow unauthenticated (Just Works) pairing
    #[arg(long, global = true)]
    allow_just_works: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for Medusa sensors
    Scan {
        /// Scan duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Pair with a sensor and send it WiFi credentials
    Provision {
        /// Device name or address to connect to
        #[arg(short, long)]
        device: Option<String>,
        /// WiFi credentials file (SSID on line 1, password on line 2)
        #[arg(short, long, default_value = "wifi_credentials.txt")]
        file: String,
    },
    /// Read the provisioning status of a sensor
    Status {
        #[arg(short, long)]
        device: Option<String>,
    },
    /// Remove the bond with a sensor
    Unpair {
        #[arg(short, long)]
        device: Option<String>,
    },
    /// Send a control command
    Control {
        #[arg(short, long)]
        device: Option<String>,
        #[arg(value_enum)]
        command: ControlArg,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ControlArg {
    /// Forget the SSID and password sent so far
    Clear,
    /// Wipe stored credentials and bonds, then reboot
    FactoryReset,
}

impl From<ControlArg> for ControlCommand {
    fn from(arg: ControlArg) -> Self {
        match arg {
            ControlArg::Clear => ControlCommand::Clear,
            ControlArg::FactoryReset => ControlCommand::FactoryReset,
        }
    }
}

/// A failed step, with the class the UI picks a hint from
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
struct Failure {
    class: Option<FailureClass>,
    /// Whether dropping the bond and pairing again may help
    repairable: bool,
    error: Box<dyn std::error::Error + Send + Sync>,
}

macro_rules! classified {
    ($($ty:ty),* $(,)?) => {
        $(impl From<$ty> for Failure {
            fn from(e: $ty) -> Self {
                let class = e.failure_class();
                Failure {
                    class,
                    repairable: class == Some(FailureClass::Authentication),
                    error: Box::new(e),
                }
            }
        })*
    };
}

classified!(
    PairingError,
    ConnectError,
    DiscoveryError,
    VerificationError,
    ProvisioningError,
    MonitorError,
);

impl From<String> for Failure {
    fn from(message: String) -> Self {
        Failure { class: None, repairable: false, error: message.into() }
    }
}

/// A PIN timeout or a declined code will not go away by pairing again
fn pairing_failure(e: PairingError) -> Failure {
    let repairable = !matches!(
        e,
        PairingError::Timeout | PairingError::Rejected(PairingStatus::RejectedByHandler)
    );
    let mut failure = Failure::from(e);
    failure.repairable &= repairable;
    failure
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = ProvisioningConfig::load_or_create(&medusa_home()?.join("provision.json"))?;
    if let Some(secs) = cli.pin_timeout {
        config.pin_timeout_ms = secs * 1000;
    }
    if let Some(secs) = cli.status_timeout {
        config.status_timeout_ms = secs * 1000;
    }
    if cli.allow_just_works {
        config.require_mitm = false;
    }
    let radio: Arc<dyn BleRadio> = Arc::new(BtleplugRadio::new().await?);

    let result = match cli.command {
        Commands::Scan { duration } => scan_devices(&radio, duration).await,
        Commands::Provision { device, file } => {
            let (ssid, password) = read_wifi_credentials(&file)?;
            validate_credentials(&ssid, &password)?;
            let device = find_device(&radio, device).await?;
            provision_device(radio, config, &device, &ssid, &password).await
        }
        Commands::Status { device } => {
            let device = find_device(&radio, device).await?;
            device_status(radio, config, &device).await
        }
        Commands::Unpair { device } => {
            let device = find_device(&radio, device).await?;
            unpair_device(radio, config, &device).await
        }
        Commands::Control { device, command } => {
            let device = find_device(&radio, device).await?;
            control_device(radio, config, &device, command.into()).await
        }
    };

    if let Err(failure) = &result {
        if let Some(class) = failure.class {
            eprintln!("hint: {}", class.remediation());
        }
    }
    result.map_err(Into::into)
}

fn init_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
}

/// MEDUSA_HOME, or ~/.medusa
fn medusa_home() -> Result<PathBuf, String> {
    if let Ok(home) = std::env::var("MEDUSA_HOME") {
        return Ok(PathBuf::from(home));
    }
    dirs::home_dir()
        .map(|home| home.join(".medusa"))
        .ok_or_else(|| "no home directory, set MEDUSA_HOME".to_string())
}

fn read_wifi_credentials(file: &str) -> Result<(String, String), Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(file)?;
    let mut lines = content.lines();
    let ssid = lines.next().ok_or("Missing SSID in credentials file")?.trim().to_string();
    // a missing second line means an open network
    let password = lines.next().unwrap_or_default().trim().to_string();
    Ok((ssid, password))
}

fn is_medusa(device: &DeviceHandle) -> bool {
    device.name.starts_with("Medusa") || device.name.contains("[Medusa")
}

async fn scan_devices(radio: &Arc<dyn BleRadio>, duration: u64) -> Result<(), Failure> {
    println!("Scanning for Medusa sensors ({} seconds)...", duration);
    let devices = radio
        .scan(Duration::from_secs(duration))
        .await
        .map_err(|e| e.to_string())?;

    println!("\nFound {} devices:", devices.len());
    for device in devices {
        let rssi = device
            .rssi
            .map(|r| format!("{} dBm", r))
            .unwrap_or_else(|| "N/A".to_string());
        let marker = if is_medusa(&device) { " [MEDUSA]" } else { "" };
        println!("  {} ({}) RSSI: {}{}", device.name, device.id, rssi, marker);
    }
    Ok(())
}

async fn find_device(
    radio: &Arc<dyn BleRadio>,
    target: Option<String>,
) -> Result<DeviceHandle, Failure> {
    println!("Scanning for Medusa sensors...");
    let devices = radio
        .scan(Duration::from_secs(5))
        .await
        .map_err(|e| e.to_string())?;

    let found = devices.into_iter().find(|d| match &target {
        Some(t) => d.name.contains(t.as_str()) || d.id.contains(t.as_str()),
        None => is_medusa(d),
    });
    match found {
        Some(device) => {
            println!("Found device: {}", device);
            Ok(device)
        }
        None => Err("No Medusa sensor found".to_string().into()),
    }
}

fn prompt(question: &str) -> io::Result<String> {
    print!("{question}");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

/// Answer pairing prompts from the terminal and echo progress
async fn answer_prompts(coordinator: PairingCoordinator) {
    let mut events = coordinator.events();
    loop {
        match events.recv().await {
            Ok(SessionEvent::PinRequested) => {
                answer_pin_request(&coordinator, || prompt("Enter the PIN shown on the device: ")).await;
            }
            Ok(SessionEvent::PinDisplayed(pin)) => println!("Enter this PIN on the device: {pin}"),
            Ok(SessionEvent::ConfirmationRequested(pin)) => {
                let question = format!("Does the device show {pin}? [y/N] ");
                let answer = tokio::task::spawn_blocking(move || prompt(&question)).await;
                let accept = matches!(answer, Ok(Ok(a)) if a.eq_ignore_ascii_case("y"));
                if let Err(e) = coordinator.confirm_pin_match(accept) {
                    warn!(error = %e, "confirmation not accepted");
                }
            }
            Ok(SessionEvent::Status(status)) => println!("  status: {status}"),
            Ok(SessionEvent::ConnectionChanged(state)) => debug!(?state, "connection"),
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        }
    }
}

/// Ask for the PIN until one is accepted or the request goes away
async fn answer_pin_request<F>(coordinator: &PairingCoordinator, ask: F)
where
    F: Fn() -> io::Result<String> + Clone + Send + 'static,
{
    while coordinator.pin_request_pending() {
        match tokio::task::spawn_blocking(ask.clone()).await {
            Ok(Ok(pin)) => match coordinator.submit_pin(pin) {
                Ok(()) => break,
                Err(PinSubmissionError::Empty) => println!("The PIN cannot be empty."),
                Err(e) => {
                    warn!(error = %e, "PIN not accepted");
                    break;
                }
            },
            Ok(Err(e)) => {
                warn!(error = %e, "could not read PIN");
                break;
            }
            Err(e) => {
                warn!(error = %e, "PIN prompt panicked");
                break;
            }
        }
    }
}

/// Pair, connect, discover and verify: everything before the first write
async fn open_session(
    coordinator: &PairingCoordinator,
    device: &DeviceHandle,
) -> Result<(ProvisioningClient, ConnectionHandle, ServiceHandles), Failure> {
    let config = coordinator.config();
    println!("Pairing...");
    match coordinator.pair(device, config.require_mitm, config.pin_timeout()).await {
        Ok(()) => println!("Paired!"),
        // the OS pairs on the first encrypted read below
        Err(PairingError::PlatformUnsupported) => debug!("platform pairs implicitly"),
        Err(e) => return Err(pairing_failure(e)),
    }

    let client = ProvisioningClient::new(coordinator.clone());
    println!("Connecting...");
    let conn = client.connect(device).await?;
    println!("Connected!");

    println!("Discovering services...");
    let handles = client.discover_services(&conn).await?;
    client.verify_secure_channel(&conn).await?;
    Ok((client, conn, handles))
}

/// Run `flow`; after one authentication failure, drop the bond and retry
async fn with_repair<T, F, Fut>(
    coordinator: &PairingCoordinator,
    device: &DeviceHandle,
    flow: F,
) -> Result<T, Failure>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, Failure>>,
{
    let mut repaired = false;
    loop {
        match flow().await {
            Err(failure) if failure.repairable && !repaired => {
                warn!(error = %failure, "bond looks stale, pairing again");
                repaired = true;
                let _ = coordinator.disconnect().await;
                match coordinator.unpair(device).await {
                    Ok(()) | Err(PairingError::PlatformUnsupported) => {}
                    Err(e) => return Err(e.into()),
                }
                tokio::time::sleep(coordinator.config().bond_settle()).await;
            }
            result => return result,
        }
    }
}

async fn provision_device(
    radio: Arc<dyn BleRadio>,
    config: ProvisioningConfig,
    device: &DeviceHandle,
    ssid: &str,
    password: &str,
) -> Result<(), Failure> {
    let coordinator = PairingCoordinator::new(radio, config);
    let prompts = tokio::spawn(answer_prompts(coordinator.clone()));

    let result = with_repair(&coordinator, device, || async {
        let (client, conn, handles) = open_session(&coordinator, device).await?;

        println!("Sending WiFi credentials...");
        println!("  SSID: {} characters", ssid.chars().count());
        client.write_credentials(&conn, &handles, ssid, password).await?;

        println!("Waiting for the device to join the network...");
        let config = coordinator.config();
        let status = StatusMonitor::new(coordinator.clone())
            .monitor(&conn, &handles, config.status_timeout(), config.poll_interval())
            .await?;
        Ok::<_, Failure>(status)
    })
    .await;

    let _ = coordinator.disconnect().await;
    prompts.abort();

    let status = result?;
    println!("Device is on the network ({status}).");
    Ok(())
}

async fn device_status(
    radio: Arc<dyn BleRadio>,
    config: ProvisioningConfig,
    device: &DeviceHandle,
) -> Result<(), Failure> {
    let coordinator = PairingCoordinator::new(radio, config);
    let prompts = tokio::spawn(answer_prompts(coordinator.clone()));

    let result = with_repair(&coordinator, device, || async {
        open_session(&coordinator, device).await.map(|_| ())
    })
    .await;
    let status = coordinator.session().and_then(|s| s.last_status());

    let _ = coordinator.disconnect().await;
    prompts.abort();
    result?;

    match status {
        Some(status) => println!("Status: {status}"),
        None => println!("Status: empty"),
    }
    Ok(())
}

async fn unpair_device(
    radio: Arc<dyn BleRadio>,
    config: ProvisioningConfig,
    device: &DeviceHandle,
) -> Result<(), Failure> {
    let coordinator = PairingCoordinator::new(radio, config);
    match coordinator.unpair(device).await {
        Ok(()) => println!("Unpaired."),
        Err(PairingError::PlatformUnsupported) => {
            println!("This platform manages bonds itself; remove the device in the system Bluetooth settings.");
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

async fn control_device(
    radio: Arc<dyn BleRadio>,
    config: ProvisioningConfig,
    device: &DeviceHandle,
    command: ControlCommand,
) -> Result<(), Failure> {
    let coordinator = PairingCoordinator::new(radio, config);
    let prompts = tokio::spawn(answer_prompts(coordinator.clone()));

    let result = with_repair(&coordinator, device, || async {
        let (client, conn, handles) = open_session(&coordinator, device).await?;
        println!("Sending {command} command...");
        client.send_control(&conn, &handles, command).await?;
        Ok::<_, Failure>(())
    })
    .await;

    // a factory reset reboots the device, so the link may already be gone
    let _ = coordinator.disconnect().await;
    prompts.abort();
    result?;

    println!("Command sent!");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use medusa_ble::fake_radio::FakeRadio;

    fn device() -> DeviceHandle {
        DeviceHandle::new("D4:61:2E:00:10:7A", "Medusa-7A", Some(-55))
    }

    #[test]
    fn pin_timeout_and_declined_code_are_not_repaired() {
        assert!(!pairing_failure(PairingError::Timeout).repairable);
        assert!(!pairing_failure(PairingError::Rejected(PairingStatus::RejectedByHandler)).repairable);
        assert!(pairing_failure(PairingError::AuthenticationFailed(PairingStatus::AuthenticationFailure)).repairable);
        assert!(!pairing_failure(PairingError::AlreadyInProgress).repairable);
    }

    #[tokio::test]
    async fn empty_pin_is_asked_again() {
        let radio = Arc::new(FakeRadio::new().with_device(device()));
        radio.set_expected_pin("482913");
        let coordinator = PairingCoordinator::new(radio, ProvisioningConfig::default());
        let mut events = coordinator.events();

        let pairing = tokio::spawn({
            let c = coordinator.clone();
            async move { c.pair(&device(), true, Duration::from_secs(5)).await }
        });
        while !matches!(events.recv().await, Ok(SessionEvent::PinRequested)) {}

        let asked = Arc::new(AtomicUsize::new(0));
        let answers = asked.clone();
        answer_pin_request(&coordinator, move || {
            let pin = if answers.fetch_add(1, Ordering::SeqCst) == 0 { "" } else { "482913" };
            Ok(pin.to_string())
        })
        .await;

        assert_eq!(asked.load(Ordering::SeqCst), 2);
        pairing.await.unwrap().unwrap();
    }
}
