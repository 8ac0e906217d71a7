//! The single pairing + provisioning session

use medusa_proto::ProvisioningStatus;

use crate::gatt::ServiceHandles;
use crate::radio::DeviceHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingPhase {
    Unpaired,
    InProgress { awaiting_pin: bool },
    Paired,
}

/// Proof of one particular GATT connection
///
/// Every connect produces a new epoch; handles and connection handles from
/// an older epoch are rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHandle {
    device: DeviceHandle,
    epoch: u64,
}

impl ConnectionHandle {
    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

/// Mutable context of the in-progress (or finished) attempt
///
/// Only the pairing coordinator mutates it. Invariant: `service_handles`
/// is set only while connected, and dropping to `Disconnected` clears both
/// the handles and the paired flag.
#[derive(Debug, Clone)]
pub struct PairingSession {
    device: DeviceHandle,
    connection_state: ConnectionState,
    pairing: PairingPhase,
    service_handles: Option<ServiceHandles>,
    last_status: Option<ProvisioningStatus>,
    epoch: u64,
}

impl PairingSession {
    pub(crate) fn new(device: DeviceHandle) -> Self {
        Self {
            device,
            connection_state: ConnectionState::Disconnected,
            pairing: PairingPhase::Unpaired,
            service_handles: None,
            last_status: None,
            epoch: 0,
        }
    }

    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    pub fn pairing_phase(&self) -> PairingPhase {
        self.pairing
    }

    pub fn paired(&self) -> bool {
        self.pairing == PairingPhase::Paired
    }

    pub fn pairing_in_progress(&self) -> bool {
        matches!(self.pairing, PairingPhase::InProgress { .. })
    }

    pub fn service_handles(&self) -> Option<&ServiceHandles> {
        self.service_handles.as_ref()
    }

    pub fn last_status(&self) -> Option<ProvisioningStatus> {
        self.last_status
    }

    pub fn is_connection_current(&self, conn: &ConnectionHandle) -> bool {
        self.connection_state == ConnectionState::Connected
            && self.epoch == conn.epoch
            && self.device.same_device(&conn.device)
    }

    /// Handles from this connection's discovery pass, still installed
    pub fn are_handles_current(&self, handles: &ServiceHandles) -> bool {
        self.connection_state == ConnectionState::Connected
            && self.service_handles.as_ref() == Some(handles)
    }

    /// Handles only ever belong to the live connection
    pub fn is_consistent(&self) -> bool {
        match &self.service_handles {
            Some(h) => self.connection_state == ConnectionState::Connected && h.epoch() == self.epoch,
            None => true,
        }
    }

    pub(crate) fn begin_pairing(&mut self) {
        self.pairing = PairingPhase::InProgress { awaiting_pin: false };
    }

    pub(crate) fn set_awaiting_pin(&mut self, awaiting_pin: bool) {
        if let PairingPhase::InProgress { .. } = self.pairing {
            self.pairing = PairingPhase::InProgress { awaiting_pin };
        }
    }

    pub(crate) fn mark_paired(&mut self) {
        self.pairing = PairingPhase::Paired;
    }

    pub(crate) fn reset_pairing(&mut self) {
        self.pairing = PairingPhase::Unpaired;
    }

    pub(crate) fn begin_connecting(&mut self) {
        self.connection_state = ConnectionState::Connecting;
        self.service_handles = None;
    }

    pub(crate) fn mark_connected(&mut self, epoch: u64) -> ConnectionHandle {
        self.connection_state = ConnectionState::Connected;
        self.epoch = epoch;
        self.service_handles = None;
        ConnectionHandle { device: self.device.clone(), epoch }
    }

    /// Install freshly discovered handles; refused if the connection they
    /// were discovered on is gone
    pub(crate) fn install_handles(&mut self, handles: ServiceHandles) -> bool {
        if self.connection_state != ConnectionState::Connected || handles.epoch() != self.epoch {
            return false;
        }
        self.service_handles = Some(handles);
        true
    }

    /// Returns whether this was a transition
    pub(crate) fn mark_disconnected(&mut self) -> bool {
        if self.connection_state == ConnectionState::Disconnected {
            return false;
        }
        self.connection_state = ConnectionState::Disconnected;
        self.service_handles = None;
        if self.pairing == PairingPhase::Paired {
            self.pairing = PairingPhase::Unpaired;
        }
        true
    }

    pub(crate) fn record_status(&mut self, status: ProvisioningStatus) {
        self.last_status = Some(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt;
    use proptest::prelude::*;

    fn session() -> PairingSession {
        PairingSession::new(DeviceHandle::new("AA:BB:CC:DD:EE:FF", "Medusa-01", Some(-50)))
    }

    fn handles(epoch: u64) -> ServiceHandles {
        gatt::resolve(&[gatt::provisioning_service()], epoch).unwrap()
    }

    #[test]
    fn disconnect_clears_handles_and_pairing() {
        let mut s = session();
        s.begin_pairing();
        s.mark_paired();
        s.begin_connecting();
        let conn = s.mark_connected(1);
        assert!(s.install_handles(handles(1)));
        assert!(s.paired());
        assert!(s.is_connection_current(&conn));

        assert!(s.mark_disconnected());
        assert_eq!(s.connection_state(), ConnectionState::Disconnected);
        assert!(s.service_handles().is_none());
        assert!(!s.paired());
        assert!(!s.is_connection_current(&conn));
        assert!(!s.mark_disconnected());
    }

    #[test]
    fn pairing_while_disconnected_survives_a_repeated_disconnect() {
        let mut s = session();
        s.begin_pairing();
        s.mark_paired();
        assert!(!s.mark_disconnected());
        assert!(s.paired());
    }

    #[test]
    fn stale_handles_are_refused() {
        let mut s = session();
        s.begin_connecting();
        s.mark_connected(2);
        assert!(!s.install_handles(handles(1)));
        assert!(s.service_handles().is_none());
        assert!(s.install_handles(handles(2)));
        assert!(s.are_handles_current(&handles(2)));

        s.mark_disconnected();
        s.begin_connecting();
        s.mark_connected(3);
        assert!(!s.are_handles_current(&handles(2)));
    }

    #[test]
    fn disconnect_while_unpaired_keeps_pairing_in_progress() {
        let mut s = session();
        s.begin_pairing();
        s.begin_connecting();
        s.mark_disconnected();
        assert!(s.pairing_in_progress());
    }

    #[test]
    fn awaiting_pin_only_during_pairing() {
        let mut s = session();
        s.set_awaiting_pin(true);
        assert_eq!(s.pairing_phase(), PairingPhase::Unpaired);
        s.begin_pairing();
        s.set_awaiting_pin(true);
        assert_eq!(s.pairing_phase(), PairingPhase::InProgress { awaiting_pin: true });
    }

    #[derive(Debug, Clone)]
    enum Op {
        Pair,
        Unpair,
        Connecting,
        Connected,
        Discovered { stale: bool },
        Disconnected,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Pair),
            Just(Op::Unpair),
            Just(Op::Connecting),
            Just(Op::Connected),
            any::<bool>().prop_map(|stale| Op::Discovered { stale }),
            Just(Op::Disconnected),
        ]
    }

    proptest! {
        #[test]
        fn handles_exist_only_while_connected(ops in proptest::collection::vec(op(), 0..64)) {
            let mut s = session();
            let mut epoch = 0;
            for op in ops {
                match op {
                    Op::Pair => s.mark_paired(),
                    Op::Unpair => s.reset_pairing(),
                    Op::Connecting => s.begin_connecting(),
                    Op::Connected => {
                        epoch += 1;
                        s.mark_connected(epoch);
                    }
                    Op::Discovered { stale } => {
                        let e = if stale { epoch.wrapping_sub(1) } else { epoch };
                        s.install_handles(handles(e));
                    }
                    Op::Disconnected => {
                        if s.mark_disconnected() {
                            prop_assert!(!s.paired());
                        }
                        prop_assert!(s.service_handles().is_none());
                    }
                }
                prop_assert!(s.is_consistent());
                if s.service_handles().is_some() {
                    prop_assert_eq!(s.connection_state(), ConnectionState::Connected);
                }
            }
        }
    }
}
