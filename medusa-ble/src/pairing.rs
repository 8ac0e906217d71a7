//! Pairing coordinator
//!
//! Owns the one [`PairingSession`], drives the OS pairing ceremony through
//! [`BleRadio::pair`] and parks the PIN request until a human answers it via
//! [`PairingCoordinator::submit_pin`]. Nothing else mutates the session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, error, info, instrument, warn};

use medusa_proto::ProvisioningStatus;

use crate::config::ProvisioningConfig;
use crate::error::{ConnectError, PairingError, PinSubmissionError};
use crate::gatt::ServiceHandles;
use crate::radio::{
    BleRadio, BondState, CeremonyReply, ConnectionEvent, DeviceHandle, PairingAgent,
    PairingCeremony, PairingStatus, ProtectionLevel, RadioError,
};
use crate::session::{ConnectionHandle, ConnectionState, PairingSession};

const EVENT_CAPACITY: usize = 32;

/// Prompts and progress for whoever drives the UI
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Type the PIN shown on the device, then call `submit_pin`
    PinRequested,
    /// Show this PIN; the device asks the user to type it
    PinDisplayed(String),
    /// Confirm both sides show this code, then call `confirm_pin_match`
    ConfirmationRequested(String),
    ConnectionChanged(ConnectionState),
    Status(ProvisioningStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PromptKind {
    Pin,
    Confirmation,
}

#[derive(Debug)]
enum PromptReply {
    Pin(String),
    Confirm(bool),
}

/// The single outstanding request for human input
///
/// `reply` is taken on the first answer, so a second answer is distinguishable
/// from no request at all.
struct PendingPrompt {
    kind: PromptKind,
    reply: Option<oneshot::Sender<PromptReply>>,
}

/// Why the agent ended a ceremony early; overrides the platform status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Abort {
    Timeout,
    Cancelled,
    PromptBusy,
    MitmUnavailable,
}

impl From<Abort> for PairingError {
    fn from(abort: Abort) -> Self {
        match abort {
            Abort::Timeout => PairingError::Timeout,
            Abort::Cancelled => PairingError::Cancelled,
            Abort::PromptBusy => PairingError::Rejected(PairingStatus::RejectedByHandler),
            Abort::MitmUnavailable => {
                PairingError::Rejected(PairingStatus::ProtectionLevelCouldNotBeMet)
            }
        }
    }
}

struct Inner {
    radio: Arc<dyn BleRadio>,
    config: ProvisioningConfig,
    session: watch::Sender<Option<PairingSession>>,
    prompt: Mutex<Option<PendingPrompt>>,
    pairing_slot: AtomicBool,
    /// Bumped by `unpair` and `disconnect` to abandon in-flight waits
    cancel: watch::Sender<u64>,
    next_epoch: AtomicU64,
    events: broadcast::Sender<SessionEvent>,
    /// Disconnects we issued whose link event has not arrived yet
    own_disconnects: Mutex<HashMap<String, u32>>,
}

impl Inner {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Apply `f` to the session if it belongs to `device_id`
    fn update_device<R>(
        &self,
        device_id: &str,
        f: impl FnOnce(&mut PairingSession) -> R,
    ) -> Option<R> {
        let mut out = None;
        self.session.send_if_modified(|slot| match slot {
            Some(session) if session.device().id == device_id => {
                out = Some(f(session));
                true
            }
            _ => false,
        });
        out
    }

    fn register_prompt(&self, kind: PromptKind) -> Option<oneshot::Receiver<PromptReply>> {
        let mut prompt = self.prompt.lock().unwrap_or_else(PoisonError::into_inner);
        if prompt.is_some() {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        *prompt = Some(PendingPrompt { kind, reply: Some(tx) });
        Some(rx)
    }

    fn clear_prompt(&self) {
        self.prompt.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    fn prompt_pending(&self, kind: PromptKind) -> bool {
        let prompt = self.prompt.lock().unwrap_or_else(PoisonError::into_inner);
        prompt
            .as_ref()
            .is_some_and(|p| p.kind == kind && p.reply.is_some())
    }

    fn deliver(&self, kind: PromptKind, reply: PromptReply) -> Result<(), PinSubmissionError> {
        let mut prompt = self.prompt.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(pending) = prompt.as_mut().filter(|p| p.kind == kind) else {
            return Err(PinSubmissionError::NoPendingRequest);
        };
        if pending.reply.is_none() {
            return Err(PinSubmissionError::AlreadySubmitted);
        }
        if matches!(&reply, PromptReply::Pin(pin) if pin.is_empty()) {
            return Err(PinSubmissionError::Empty);
        }
        let Some(tx) = pending.reply.take() else {
            return Err(PinSubmissionError::AlreadySubmitted);
        };
        // receiver gone means the wait already timed out or was cancelled
        tx.send(reply).map_err(|_| PinSubmissionError::NoPendingRequest)
    }

    fn cancel_waits(&self) {
        self.cancel.send_modify(|generation| *generation = generation.wrapping_add(1));
        self.clear_prompt();
    }

    async fn radio_disconnect(&self, device: &DeviceHandle) -> Result<(), RadioError> {
        *self
            .own_disconnects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(device.id.clone())
            .or_default() += 1;
        self.radio.disconnect(device).await
    }

    /// Consume one expected link event for a disconnect we issued
    fn expected_drop(&self, device_id: &str) -> bool {
        let mut own = self.own_disconnects.lock().unwrap_or_else(PoisonError::into_inner);
        match own.get_mut(device_id) {
            Some(pending) if *pending > 1 => {
                *pending -= 1;
                true
            }
            Some(_) => {
                own.remove(device_id);
                true
            }
            None => false,
        }
    }

    /// Events are ordered, so anything still expected before a fresh
    /// connect will never arrive
    fn link_up(&self, device_id: &str) {
        self.own_disconnects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(device_id);
    }

    fn link_dropped(&self, device_id: &str) {
        if self.update_device(device_id, PairingSession::mark_disconnected) == Some(true) {
            info!(device = device_id, "link dropped, handles invalidated and pairing reset");
            self.emit(SessionEvent::ConnectionChanged(ConnectionState::Disconnected));
        }
    }
}

/// Releases the pairing slot and unwinds an unfinished attempt
///
/// Dropping the `pair` future mid-ceremony lands here too.
struct PairingSlot<'a> {
    inner: &'a Inner,
    device_id: String,
}

impl<'a> PairingSlot<'a> {
    fn acquire(inner: &'a Inner, device_id: &str) -> Option<Self> {
        inner
            .pairing_slot
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { inner, device_id: device_id.to_string() })
    }
}

impl Drop for PairingSlot<'_> {
    fn drop(&mut self) {
        self.inner.clear_prompt();
        self.inner.update_device(&self.device_id, |s| {
            if s.pairing_in_progress() {
                s.reset_pairing();
            }
        });
        self.inner.pairing_slot.store(false, Ordering::Release);
    }
}

/// Answers ceremony requests on behalf of one `pair` call
struct CeremonyAgent {
    inner: Arc<Inner>,
    device_id: String,
    require_mitm: bool,
    pin_timeout: Duration,
    abort: Mutex<Option<Abort>>,
}

impl CeremonyAgent {
    fn abort(&self, reason: Abort) -> CeremonyReply {
        self.abort.lock().unwrap_or_else(PoisonError::into_inner).get_or_insert(reason);
        CeremonyReply::Reject
    }

    fn abort_reason(&self) -> Option<Abort> {
        *self.abort.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_awaiting_pin(&self, awaiting: bool) {
        self.inner
            .update_device(&self.device_id, |s| s.set_awaiting_pin(awaiting));
    }

    async fn await_prompt(&self, kind: PromptKind, event: SessionEvent) -> CeremonyReply {
        let Some(rx) = self.inner.register_prompt(kind) else {
            error!("a pairing prompt is already outstanding, rejecting the new request");
            return self.abort(Abort::PromptBusy);
        };
        if kind == PromptKind::Pin {
            self.set_awaiting_pin(true);
        }
        self.inner.emit(event);

        let reply = tokio::time::timeout(self.pin_timeout, rx).await;
        self.inner.clear_prompt();
        self.set_awaiting_pin(false);

        match reply {
            Ok(Ok(PromptReply::Pin(pin))) => {
                debug!(pin_len = pin.len(), "PIN submitted");
                CeremonyReply::Pin(pin)
            }
            Ok(Ok(PromptReply::Confirm(true))) => CeremonyReply::Accept,
            Ok(Ok(PromptReply::Confirm(false))) => {
                info!("user rejected the pairing code");
                CeremonyReply::Reject
            }
            Ok(Err(_)) => self.abort(Abort::Cancelled),
            Err(_) => {
                warn!(timeout_ms = self.pin_timeout.as_millis() as u64, "no PIN entered in time");
                self.abort(Abort::Timeout)
            }
        }
    }
}

#[async_trait::async_trait]
impl PairingAgent for CeremonyAgent {
    async fn on_ceremony(&self, ceremony: PairingCeremony) -> CeremonyReply {
        match ceremony {
            PairingCeremony::ProvidePin => {
                info!("device requests PIN entry");
                self.await_prompt(PromptKind::Pin, SessionEvent::PinRequested).await
            }
            PairingCeremony::DisplayPin(pin) => {
                info!(pin_len = pin.len(), "showing pairing PIN");
                self.inner.emit(SessionEvent::PinDisplayed(pin));
                CeremonyReply::Accept
            }
            PairingCeremony::ConfirmPinMatch(pin) => {
                self.await_prompt(
                    PromptKind::Confirmation,
                    SessionEvent::ConfirmationRequested(pin),
                )
                .await
            }
            PairingCeremony::ConfirmOnly if self.require_mitm => {
                warn!("device offered unauthenticated pairing but MITM protection is required");
                self.abort(Abort::MitmUnavailable)
            }
            PairingCeremony::ConfirmOnly => CeremonyReply::Accept,
        }
    }
}

fn pairing_outcome(result: Result<PairingStatus, RadioError>) -> Result<(), PairingError> {
    let status = result.map_err(|source| PairingError::Radio { operation: "pair", source })?;
    match status {
        s if s.is_success() => Ok(()),
        PairingStatus::AuthenticationTimeout => Err(PairingError::Timeout),
        PairingStatus::Canceled => Err(PairingError::Cancelled),
        PairingStatus::OperationAlreadyInProgress => {
            warn!("platform reports a stale pairing operation, unpair and retry");
            Err(PairingError::AlreadyInProgress)
        }
        PairingStatus::RequiredHandlerNotRegistered => Err(PairingError::PlatformUnsupported),
        s @ (PairingStatus::AuthenticationFailure
        | PairingStatus::InvalidCeremonyData
        | PairingStatus::ProtectionLevelCouldNotBeMet) => Err(PairingError::AuthenticationFailed(s)),
        s => Err(PairingError::Rejected(s)),
    }
}

/// Single owner of the pairing session
///
/// Cheap to clone; every clone drives the same session.
#[derive(Clone)]
pub struct PairingCoordinator {
    inner: Arc<Inner>,
}

impl PairingCoordinator {
    /// Must be called inside a tokio runtime: spawns the link event watcher
    pub fn new(radio: Arc<dyn BleRadio>, config: ProvisioningConfig) -> Self {
        let (session, _) = watch::channel(None);
        let (cancel, _) = watch::channel(0);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let link_events = radio.connection_events();
        let inner = Arc::new(Inner {
            radio,
            config,
            session,
            prompt: Mutex::new(None),
            pairing_slot: AtomicBool::new(false),
            cancel,
            next_epoch: AtomicU64::new(0),
            events,
            own_disconnects: Mutex::new(HashMap::new()),
        });
        tokio::spawn(watch_links(Arc::downgrade(&inner), link_events));
        Self { inner }
    }

    pub fn config(&self) -> &ProvisioningConfig {
        &self.inner.config
    }

    /// Snapshot of the current session
    pub fn session(&self) -> Option<PairingSession> {
        self.inner.session.borrow().clone()
    }

    /// Watch every session change
    pub fn subscribe(&self) -> watch::Receiver<Option<PairingSession>> {
        self.inner.session.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Whether a PIN request is waiting for `submit_pin`
    pub fn pin_request_pending(&self) -> bool {
        self.inner.prompt_pending(PromptKind::Pin)
    }

    /// Bond with `device` via the OS pairing primitive
    ///
    /// Must run before `connect`. A PIN request from the device parks here
    /// for at most `pin_timeout`, waiting on `submit_pin`.
    #[instrument(skip(self, device), fields(device = %device.id))]
    pub async fn pair(
        &self,
        device: &DeviceHandle,
        require_mitm: bool,
        pin_timeout: Duration,
    ) -> Result<(), PairingError> {
        let _slot = PairingSlot::acquire(&self.inner, &device.id)
            .ok_or(PairingError::AlreadyInProgress)?;
        // subscribed before any await so an unpair/disconnect from here on is seen
        let mut cancel = self.inner.cancel.subscribe();

        self.begin_pairing(device)?;

        if !self.inner.radio.supports_explicit_pairing() {
            self.inner.update_device(&device.id, PairingSession::reset_pairing);
            info!("platform pairs implicitly on first encrypted access");
            return Err(PairingError::PlatformUnsupported);
        }

        let agent = Arc::new(CeremonyAgent {
            inner: self.inner.clone(),
            device_id: device.id.clone(),
            require_mitm,
            pin_timeout,
            abort: Mutex::new(None),
        });
        let protection = ProtectionLevel::for_mitm(require_mitm);
        info!(?protection, "pairing");

        let attempt = async {
            if self.inner.config.clear_stale_bond {
                self.clear_stale_bond(device).await;
            }
            self.inner.radio.pair(device, protection, agent.clone()).await
        };
        let result = tokio::select! {
            result = attempt => Some(result),
            _ = cancel.changed() => None,
        };

        let outcome = match (result, agent.abort_reason()) {
            (None, _) => Err(PairingError::Cancelled),
            (Some(_), Some(abort)) => Err(abort.into()),
            (Some(result), None) => pairing_outcome(result),
        };

        match &outcome {
            Ok(()) => {
                self.inner.update_device(&device.id, PairingSession::mark_paired);
                info!("paired");
            }
            Err(e) => {
                self.inner.update_device(&device.id, PairingSession::reset_pairing);
                warn!(error = %e, "pairing failed");
            }
        }
        outcome
    }

    fn begin_pairing(&self, device: &DeviceHandle) -> Result<(), PairingError> {
        let mut result = Ok(());
        self.inner.session.send_if_modified(|slot| {
            if let Some(session) = slot.as_ref() {
                if session.connection_state() != ConnectionState::Disconnected {
                    result = Err(PairingError::ConnectionOpen);
                    return false;
                }
            }
            match slot {
                Some(session) if session.device().same_device(device) => session.begin_pairing(),
                _ => {
                    let mut session = PairingSession::new(device.clone());
                    session.begin_pairing();
                    *slot = Some(session);
                }
            }
            true
        });
        result
    }

    async fn clear_stale_bond(&self, device: &DeviceHandle) {
        match self.inner.radio.bond_state(device).await {
            Ok(BondState::NotPaired) => return,
            Ok(_) => {}
            Err(e) => debug!(error = %e, "bond state unknown, unpairing anyway"),
        }
        match self.inner.radio.unpair(device).await {
            Ok(()) => {
                info!("removed stale bond");
                tokio::time::sleep(self.inner.config.bond_settle()).await;
            }
            Err(e) => warn!(error = %e, "could not remove stale bond"),
        }
    }

    /// Answer an outstanding PIN request
    ///
    /// Accepted at most once per request; the PIN is trimmed first.
    pub fn submit_pin(&self, pin: String) -> Result<(), PinSubmissionError> {
        let pin = pin.trim().to_string();
        let result = self.inner.deliver(PromptKind::Pin, PromptReply::Pin(pin));
        match &result {
            Ok(()) => debug!("PIN delivered to pairing ceremony"),
            Err(e) => debug!(error = %e, "PIN not accepted"),
        }
        result
    }

    /// Answer an outstanding numeric comparison request
    pub fn confirm_pin_match(&self, accept: bool) -> Result<(), PinSubmissionError> {
        self.inner
            .deliver(PromptKind::Confirmation, PromptReply::Confirm(accept))
    }

    /// Remove the bond; succeeds if there was none
    ///
    /// Abandons any in-flight pairing or PIN wait for this device.
    #[instrument(skip(self, device), fields(device = %device.id))]
    pub async fn unpair(&self, device: &DeviceHandle) -> Result<(), PairingError> {
        let ours = self
            .inner
            .session
            .borrow()
            .as_ref()
            .is_none_or(|s| s.device().same_device(device));
        if ours {
            self.inner.cancel_waits();
        }

        let result = self.remove_bond(device).await;
        self.inner.update_device(&device.id, |s| {
            if s.paired() || s.pairing_in_progress() {
                s.reset_pairing();
            }
        });
        match &result {
            Ok(()) => info!("unpaired"),
            Err(e) => warn!(error = %e, "unpair failed"),
        }
        result
    }

    async fn remove_bond(&self, device: &DeviceHandle) -> Result<(), PairingError> {
        if !self.inner.radio.supports_explicit_pairing() {
            return Err(PairingError::PlatformUnsupported);
        }
        match self.inner.radio.bond_state(device).await {
            Ok(BondState::NotPaired) => return Ok(()),
            Ok(_) => {}
            Err(e) => debug!(error = %e, "bond state unknown, unpairing anyway"),
        }
        self.inner
            .radio
            .unpair(device)
            .await
            .map_err(|source| PairingError::Radio { operation: "unpair", source })
    }

    /// Read-only bond query
    ///
    /// On implicit-pairing platforms only a verified secure channel proves a
    /// bond, so this answers `Paired` after verification and `Indeterminate`
    /// otherwise.
    pub async fn is_paired(&self, device: &DeviceHandle) -> Result<BondState, PairingError> {
        if !self.inner.radio.supports_explicit_pairing() {
            let verified = self
                .inner
                .session
                .borrow()
                .as_ref()
                .is_some_and(|s| s.device().same_device(device) && s.paired());
            return Ok(if verified { BondState::Paired } else { BondState::Indeterminate });
        }
        self.inner
            .radio
            .bond_state(device)
            .await
            .map_err(|source| PairingError::Radio { operation: "bond state", source })
    }

    /// Tear down the link and destroy the session
    ///
    /// Session state is gone even when the radio reports an error.
    pub async fn disconnect(&self) -> Result<(), RadioError> {
        self.inner.cancel_waits();
        let Some(session) = self.inner.session.send_replace(None) else {
            return Ok(());
        };
        let device = session.device();
        info!(device = %device.id, "disconnecting and closing session");
        if session.connection_state() == ConnectionState::Disconnected {
            return Ok(());
        }
        self.inner
            .emit(SessionEvent::ConnectionChanged(ConnectionState::Disconnected));
        self.inner.radio_disconnect(device).await
    }

    pub(crate) fn radio(&self) -> &Arc<dyn BleRadio> {
        &self.inner.radio
    }

    /// Check connect preconditions and move to `Connecting`
    pub(crate) fn begin_connecting(&self, device: &DeviceHandle) -> Result<(), ConnectError> {
        let explicit = self.inner.radio.supports_explicit_pairing();
        let mut result = Ok(());
        self.inner.session.send_if_modified(|slot| match slot {
            Some(session) if session.device().same_device(device) => {
                if session.pairing_in_progress() {
                    result = Err(ConnectError::PairingInProgress);
                    return false;
                }
                if explicit && !session.paired() {
                    result = Err(ConnectError::NotPaired);
                    return false;
                }
                session.begin_connecting();
                true
            }
            Some(session) if session.connection_state() != ConnectionState::Disconnected => {
                result = Err(ConnectError::OtherDeviceConnected);
                false
            }
            _ if explicit => {
                result = Err(ConnectError::NotPaired);
                false
            }
            _ => {
                let mut session = PairingSession::new(device.clone());
                session.begin_connecting();
                *slot = Some(session);
                true
            }
        });
        if result.is_ok() {
            self.inner
                .emit(SessionEvent::ConnectionChanged(ConnectionState::Connecting));
        }
        result
    }

    /// Record the live link; `None` if the session went away meanwhile
    pub(crate) fn mark_connected(&self, device: &DeviceHandle) -> Option<ConnectionHandle> {
        let epoch = self.inner.next_epoch.fetch_add(1, Ordering::Relaxed) + 1;
        let conn = self.inner.update_device(&device.id, |s| {
            (s.connection_state() == ConnectionState::Connecting).then(|| s.mark_connected(epoch))
        })??;
        self.inner
            .emit(SessionEvent::ConnectionChanged(ConnectionState::Connected));
        Some(conn)
    }

    /// Drop the link for `device`: session first, then the radio
    pub(crate) async fn tear_down_device(&self, device: &DeviceHandle) {
        self.inner.link_dropped(&device.id);
        if let Err(e) = self.inner.radio_disconnect(device).await {
            debug!(device = %device.id, error = %e, "disconnect after link failure");
        }
    }

    /// Tear down `conn` unless a newer connection already replaced it
    pub(crate) async fn tear_down(&self, conn: &ConnectionHandle) {
        if self.is_connection_current(conn) {
            self.tear_down_device(conn.device()).await;
        }
    }

    pub(crate) fn install_handles(&self, handles: ServiceHandles) -> bool {
        let mut installed = false;
        self.inner.session.send_if_modified(|slot| {
            installed = slot.as_mut().is_some_and(|s| s.install_handles(handles));
            installed
        });
        installed
    }

    pub(crate) fn is_connection_current(&self, conn: &ConnectionHandle) -> bool {
        self.inner
            .session
            .borrow()
            .as_ref()
            .is_some_and(|s| s.is_connection_current(conn))
    }

    pub(crate) fn are_handles_current(&self, handles: &ServiceHandles) -> bool {
        self.inner
            .session
            .borrow()
            .as_ref()
            .is_some_and(|s| s.are_handles_current(handles))
    }

    pub(crate) fn handles_for(&self, conn: &ConnectionHandle) -> Option<ServiceHandles> {
        let session = self.inner.session.borrow();
        let session = session.as_ref().filter(|s| s.is_connection_current(conn))?;
        session.service_handles().cloned()
    }

    /// An authenticated read succeeded on this link
    pub(crate) fn mark_secure_channel_verified(&self, conn: &ConnectionHandle) {
        self.inner.update_device(&conn.device().id, |s| {
            if s.is_connection_current(conn) && !s.paired() {
                s.mark_paired();
            }
        });
    }

    /// The device no longer accepts our keys; handles stay until the link drops
    pub(crate) fn mark_authentication_lost(&self, conn: &ConnectionHandle) {
        let reset = self.inner.update_device(&conn.device().id, |s| {
            let was_paired = s.paired();
            s.reset_pairing();
            was_paired
        });
        if reset == Some(true) {
            warn!(device = %conn.device().id, "authentication lost, pairing required");
        }
    }

    pub(crate) fn record_status(&self, conn: &ConnectionHandle, status: ProvisioningStatus) {
        let recorded = self.inner.update_device(&conn.device().id, |s| {
            let changed = s.last_status() != Some(status);
            s.record_status(status);
            changed
        });
        if recorded == Some(true) {
            self.inner.emit(SessionEvent::Status(status));
        }
    }

    /// Changes whenever `unpair` or `disconnect` abandons in-flight waits
    pub(crate) fn cancellation(&self) -> watch::Receiver<u64> {
        self.inner.cancel.subscribe()
    }

    /// Resolves once `conn` stops being the live connection
    pub(crate) async fn link_lost(&self, conn: &ConnectionHandle) {
        let mut rx = self.inner.session.subscribe();
        let _ = rx
            .wait_for(|s| !s.as_ref().is_some_and(|s| s.is_connection_current(conn)))
            .await;
    }
}

async fn watch_links(inner: Weak<Inner>, mut events: broadcast::Receiver<ConnectionEvent>) {
    loop {
        let event = events.recv().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match event {
            Ok(ConnectionEvent::Disconnected(id)) if inner.expected_drop(&id) => {
                debug!(device = %id, "link closed by us");
            }
            Ok(ConnectionEvent::Disconnected(id)) => inner.link_dropped(&id),
            Ok(ConnectionEvent::Connected(id)) => {
                inner.link_up(&id);
                debug!(device = %id, "link up");
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                // a missed disconnect would leave stale handles behind
                warn!(skipped, "missed link events, assuming the link dropped");
                inner
                    .own_disconnects
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clear();
                let device = inner.session.borrow().as_ref().map(|s| s.device().id.clone());
                if let Some(id) = device {
                    inner.link_dropped(&id);
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
