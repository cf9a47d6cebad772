//! Ball Device
//!
//! One holding point for balls (trough, outhole, plunger lane, playfield).
//!
//! # Ownership
//!
//! A device owns its `ball_count` exclusively. Only three things change it:
//! 1. Its own switch events ([`BallDevice::handle_switch`])
//! 2. Its own confirmed transfers ([`BallDevice::complete_eject`])
//! 3. The BallController's reconciliation path (captures, boot scan)
//!
//! The TransferCoordinator drives the state machine but never touches the
//! count directly.

use std::collections::VecDeque;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::mechanism::{Mechanism, MechanismKind};
use super::state::DeviceState;
use crate::core_types::{DeviceId, RequestId, SwitchId};
use crate::driver::{EjectCoil, SwitchRule};
use crate::transfer::{EjectRequirement, Transfer, TransferError, TransferId};

/// Default confirmation window
pub const DEFAULT_EJECT_TIMEOUT_MS: u64 = 10_000;

/// What a switch transition meant for this device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchOutcome {
    /// Count went up by one; the caller attributes the ball
    BallEntered,
    /// Confirm-only switch fired; may confirm an inbound transfer
    ConfirmSignal,
    /// Exit switch released during our own eject (advisory)
    BallLeft,
    /// Exit switch re-activated during our own eject: the ball fell back
    BallReturned,
    /// Late exit release after the transfer was already confirmed
    ExitConsumed,
    /// A ball vanished with no transfer; these requirements lost their ball
    BallMissing { dropped: Vec<EjectRequirement> },
    /// A ball was sensed but the device is already at capacity
    CapacityExceeded,
    Ignored,
}

/// Query view of a device for the presentation layer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    pub id: DeviceId,
    pub ball_count: u32,
    pub capacity: Option<u32>,
    pub state: DeviceState,
    pub jammed: bool,
    pub pending_transfer: Option<TransferId>,
    pub attempt_count: Option<u32>,
    pub queued_ejects: usize,
}

#[derive(Debug, Clone)]
pub struct BallDevice {
    id: DeviceId,
    ball_count: u32,
    /// None = unbounded (playfield)
    capacity: Option<u32>,
    mechanisms: Vec<Mechanism>,
    eject_targets: Vec<DeviceId>,
    eject_coil: Option<EjectCoil>,
    hardware_rule: Option<SwitchRule>,
    eject_timeout_ms: u64,
    /// Home device: keep balls until requested
    hold_balls: bool,
    captures_from: Option<DeviceId>,
    state: DeviceState,
    pending: Option<Transfer>,
    requirements: VecDeque<EjectRequirement>,
    /// Exit releases still owed by already-confirmed transfers
    awaiting_exit: u32,
    jammed: bool,
}

impl BallDevice {
    pub fn new(id: impl Into<DeviceId>, capacity: Option<u32>) -> Self {
        Self {
            id: id.into(),
            ball_count: 0,
            capacity,
            mechanisms: Vec::new(),
            eject_targets: Vec::new(),
            eject_coil: None,
            hardware_rule: None,
            eject_timeout_ms: DEFAULT_EJECT_TIMEOUT_MS,
            hold_balls: false,
            captures_from: None,
            state: DeviceState::Idle,
            pending: None,
            requirements: VecDeque::new(),
            awaiting_exit: 0,
            jammed: false,
        }
    }

    // ============================================================
    // BUILDER
    // ============================================================

    pub fn with_mechanism(mut self, switch: impl Into<SwitchId>, kind: MechanismKind) -> Self {
        self.mechanisms.push(Mechanism::new(switch, kind));
        self
    }

    pub fn with_targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<DeviceId>,
    {
        self.eject_targets = targets.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_coil(mut self, coil: EjectCoil) -> Self {
        self.eject_coil = Some(coil);
        self
    }

    pub fn with_hardware_rule(mut self, rule: SwitchRule) -> Self {
        self.hardware_rule = Some(rule);
        self
    }

    pub fn with_timeout(mut self, eject_timeout_ms: u64) -> Self {
        self.eject_timeout_ms = eject_timeout_ms;
        self
    }

    pub fn with_balls(mut self, balls: u32) -> Self {
        self.ball_count = match self.capacity {
            Some(cap) => balls.min(cap),
            None => balls,
        };
        self
    }

    pub fn holding_balls(mut self) -> Self {
        self.hold_balls = true;
        self
    }

    pub fn capturing_from(mut self, device: impl Into<DeviceId>) -> Self {
        self.captures_from = Some(device.into());
        self
    }

    // ============================================================
    // QUERIES
    // ============================================================

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn ball_count(&self) -> u32 {
        self.ball_count
    }

    pub fn capacity(&self) -> Option<u32> {
        self.capacity
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn mechanisms(&self) -> &[Mechanism] {
        &self.mechanisms
    }

    pub fn eject_targets(&self) -> &[DeviceId] {
        &self.eject_targets
    }

    pub fn eject_coil(&self) -> Option<&EjectCoil> {
        self.eject_coil.as_ref()
    }

    pub fn hardware_rule(&self) -> Option<&SwitchRule> {
        self.hardware_rule.as_ref()
    }

    pub fn eject_timeout_ms(&self) -> u64 {
        self.eject_timeout_ms
    }

    pub fn holds_balls(&self) -> bool {
        self.hold_balls
    }

    pub fn captures_from(&self) -> Option<&DeviceId> {
        self.captures_from.as_ref()
    }

    pub fn pending_transfer(&self) -> Option<&Transfer> {
        self.pending.as_ref()
    }

    pub(crate) fn pending_transfer_mut(&mut self) -> Option<&mut Transfer> {
        self.pending.as_mut()
    }

    pub fn is_jammed(&self) -> bool {
        self.jammed
    }

    pub fn next_requirement(&self) -> Option<&EjectRequirement> {
        self.requirements.front()
    }

    pub fn queued_ejects(&self) -> usize {
        self.requirements.len()
    }

    #[inline]
    pub fn can_eject(&self) -> bool {
        !self.eject_targets.is_empty()
    }

    /// Whether any switch can sense a ball arriving here
    #[inline]
    pub fn has_mechanisms(&self) -> bool {
        !self.mechanisms.is_empty()
    }

    /// Whether a switch reports balls leaving (settled count switch)
    #[inline]
    pub fn senses_exit(&self) -> bool {
        self.mechanisms.iter().any(|m| m.kind.senses_exit())
    }

    /// Balls already spoken for: queued ejects plus the one in flight
    #[inline]
    pub fn committed(&self) -> u32 {
        self.requirements.len() as u32 + u32::from(self.pending.is_some())
    }

    /// Balls available to satisfy a new request
    pub fn surplus(&self) -> u32 {
        if !self.can_eject() {
            return 0;
        }
        self.ball_count.saturating_sub(self.committed())
    }

    /// Slots physically taken: counted balls plus confirmed balls whose exit
    /// switch has not opened yet
    #[inline]
    pub fn occupied(&self) -> u32 {
        self.ball_count + self.awaiting_exit
    }

    /// Free slots given `inbound` balls already on their way; None = unbounded
    pub fn free_capacity(&self, inbound: u32) -> Option<u32> {
        self.capacity
            .map(|cap| cap.saturating_sub(self.occupied() + inbound))
    }

    #[inline]
    fn is_full(&self) -> bool {
        self.capacity.is_some_and(|cap| self.occupied() >= cap)
    }

    /// Pending transfer a ball sensed downstream may belong to.
    ///
    /// A player-released ball still resting on this device's exit switch has
    /// not left yet.
    pub fn armed_transfer(&self) -> Option<&Transfer> {
        self.pending.as_ref().filter(|t| {
            t.is_armed() && (t.exit_seen || !t.is_mechanical() || !self.senses_exit())
        })
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            id: self.id.clone(),
            ball_count: self.ball_count,
            capacity: self.capacity,
            state: self.state,
            jammed: self.jammed,
            pending_transfer: self.pending.as_ref().map(|t| t.id),
            attempt_count: self.pending.as_ref().map(|t| t.attempt_count),
            queued_ejects: self.requirements.len(),
        }
    }

    // ============================================================
    // SWITCH EVENTS
    // ============================================================

    /// Apply one debounced switch transition of one of this device's mechanisms
    pub fn handle_switch(&mut self, kind: MechanismKind, active: bool) -> SwitchOutcome {
        if self.jammed {
            info!(device = %self.id, "Switch activity on jammed device, jam cleared");
            self.jammed = false;
        }

        match (kind, active) {
            (MechanismKind::Confirm, true) => SwitchOutcome::ConfirmSignal,
            (MechanismKind::Confirm, false) | (MechanismKind::Entry, false) => {
                SwitchOutcome::Ignored
            }
            (MechanismKind::Entry, true) => self.ball_sensed(),
            (MechanismKind::Count, true) => {
                if let Some(transfer) = self.pending.as_mut()
                    && transfer.exit_seen
                {
                    transfer.exit_seen = false;
                    debug!(device = %self.id, transfer_id = %transfer.id, "Ball fell back");
                    return SwitchOutcome::BallReturned;
                }
                self.ball_sensed()
            }
            (MechanismKind::Count, false) => {
                if let Some(transfer) = self.pending.as_mut()
                    && !transfer.exit_seen
                {
                    transfer.exit_seen = true;
                    return SwitchOutcome::BallLeft;
                }
                if self.awaiting_exit > 0 {
                    self.awaiting_exit -= 1;
                    return SwitchOutcome::ExitConsumed;
                }
                // the ball of an active transfer must stay counted until confirmed
                let floor = u32::from(self.pending.is_some());
                if self.ball_count > floor {
                    self.ball_count -= 1;
                    warn!(
                        device = %self.id,
                        ball_count = self.ball_count,
                        "Ball left without a transfer"
                    );
                    let dropped = self.trim_requirements();
                    return SwitchOutcome::BallMissing { dropped };
                }
                SwitchOutcome::Ignored
            }
        }
    }

    fn ball_sensed(&mut self) -> SwitchOutcome {
        if self.is_full() {
            warn!(
                device = %self.id,
                ball_count = self.ball_count,
                "Ball sensed in full device"
            );
            return SwitchOutcome::CapacityExceeded;
        }
        self.ball_count += 1;
        debug!(device = %self.id, ball_count = self.ball_count, "Ball entered");
        SwitchOutcome::BallEntered
    }

    /// Drop queued ejects that no longer have a ball behind them
    fn trim_requirements(&mut self) -> Vec<EjectRequirement> {
        let mut dropped = Vec::new();
        while self.committed() > self.ball_count {
            match self.requirements.pop_back() {
                Some(req) => dropped.push(req),
                None => break,
            }
        }
        dropped
    }

    // ============================================================
    // EJECT LIFECYCLE (driven by TransferCoordinator)
    // ============================================================

    pub fn add_requirement(&mut self, requirement: EjectRequirement) {
        self.requirements.push_back(requirement);
    }

    /// Queue unrouted ejects so a non-home device frees every ball it holds
    pub fn ensure_auto_eject(&mut self) -> u32 {
        if self.hold_balls || !self.can_eject() || self.jammed {
            return 0;
        }
        let mut added = 0;
        while self.committed() < self.ball_count {
            self.requirements.push_back(EjectRequirement::unrouted());
            added += 1;
        }
        added
    }

    /// IDLE → EJECTING with the head requirement turned into `transfer`
    pub fn begin_eject(&mut self, transfer: Transfer) -> Result<(), TransferError> {
        if self.pending.is_some() {
            return Err(TransferError::AlreadyEjecting(self.id.clone()));
        }
        if !self.can_eject() {
            return Err(TransferError::NoEjectTargets(self.id.clone()));
        }
        self.requirements.pop_front();
        self.pending = Some(transfer);
        self.state = DeviceState::Ejecting;
        Ok(())
    }

    /// IDLE → WAITING_FOR_TARGET. Returns true when the state changed.
    pub fn wait_for_target(&mut self) -> bool {
        if self.state == DeviceState::Idle {
            self.state = DeviceState::WaitingForTarget;
            return true;
        }
        false
    }

    /// EJECTING → IDLE on confirmation. The only place the count drops for a
    /// transfer.
    pub fn complete_eject(&mut self, transfer_id: TransferId) -> Option<Transfer> {
        if self.pending.as_ref().map(|t| t.id) != Some(transfer_id) {
            return None;
        }
        let mut transfer = self.pending.take()?;
        self.ball_count = self.ball_count.saturating_sub(1);
        if self.senses_exit() && !transfer.exit_seen {
            self.awaiting_exit += 1;
        }
        transfer.confirmed = true;
        self.state = DeviceState::Idle;
        Some(transfer)
    }

    /// EJECTING → IDLE (fault). Count unchanged; the device is marked jammed
    /// and its queued ejects are handed back.
    pub fn abandon_eject(
        &mut self,
        transfer_id: TransferId,
    ) -> Option<(Transfer, Vec<EjectRequirement>)> {
        if self.pending.as_ref().map(|t| t.id) != Some(transfer_id) {
            return None;
        }
        let transfer = self.pending.take()?;
        self.state = DeviceState::Idle;
        self.jammed = true;
        let queued = self.requirements.drain(..).collect();
        Some((transfer, queued))
    }

    /// Operator reset after a jam
    pub fn clear_jam(&mut self) -> bool {
        std::mem::replace(&mut self.jammed, false)
    }

    // ============================================================
    // RECONCILIATION (driven by BallController / Machine)
    // ============================================================

    /// Count a ball confirmed by a confirm-only switch, an unsensed
    /// end-of-chain arrival, or the boot scan
    pub fn admit_ball(&mut self) -> bool {
        if self.is_full() {
            return false;
        }
        self.ball_count += 1;
        true
    }

    /// A ball drained out of this device into another one
    pub fn remove_captured(&mut self) -> bool {
        if self.ball_count > self.committed() {
            self.ball_count -= 1;
            return true;
        }
        false
    }

    /// Attach `request` to the in-flight unclaimed transfer, if any
    pub fn claim_pending(&mut self, destination: &DeviceId, request: RequestId) -> bool {
        match self.pending.as_mut() {
            Some(transfer) if transfer.request.is_none() => {
                transfer.request = Some(request);
                transfer.destination = Some(destination.clone());
                true
            }
            _ => false,
        }
    }

    /// Attach `request` to the first unclaimed queued eject, if any
    pub fn claim_queued(&mut self, destination: &DeviceId, request: RequestId) -> bool {
        match self.requirements.iter_mut().find(|r| !r.is_claimed()) {
            Some(req) => {
                req.request = Some(request);
                req.destination = Some(destination.clone());
                true
            }
            None => false,
        }
    }

    pub fn has_unclaimed_pending(&self) -> bool {
        self.pending.as_ref().is_some_and(|t| t.request.is_none())
    }

    pub fn has_unclaimed_queued(&self) -> bool {
        self.requirements.iter().any(|r| !r.is_claimed())
    }

    /// Remove every trace of a cancelled request.
    ///
    /// Queued ejects for it are withdrawn; an in-flight transfer keeps moving
    /// but loses its claim. Returns the number of withdrawn ejects.
    pub fn withdraw_request(&mut self, request: RequestId) -> usize {
        let before = self.requirements.len();
        self.requirements.retain(|r| r.request != Some(request));
        if let Some(transfer) = self.pending.as_mut()
            && transfer.request == Some(request)
        {
            transfer.detach_request();
        }
        let withdrawn = before - self.requirements.len();
        if withdrawn > 0 && self.pending.is_none() && self.requirements.is_empty() {
            self.state = DeviceState::Idle;
        }
        withdrawn
    }

    /// WAITING_FOR_TARGET with nothing left to eject falls back to IDLE
    pub(crate) fn settle_idle(&mut self) {
        if self.state == DeviceState::WaitingForTarget && self.requirements.is_empty() {
            self.state = DeviceState::Idle;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::PulseSettings;
    use crate::transfer::AttemptAction;

    fn trough() -> BallDevice {
        BallDevice::new("trough", Some(3))
            .with_mechanism("trough_entry", MechanismKind::Entry)
            .with_targets(["plunger"])
            .with_coil(EjectCoil::pulse("trough", PulseSettings::new(20, 1.0)))
            .holding_balls()
            .with_balls(3)
    }

    fn outhole() -> BallDevice {
        BallDevice::new("outhole", Some(1))
            .with_mechanism("outhole", MechanismKind::Count)
            .with_targets(["trough"])
            .with_coil(EjectCoil::pulse("outhole", PulseSettings::new(20, 1.0)))
            .capturing_from("playfield")
    }

    fn start(device: &mut BallDevice, target: &str) -> TransferId {
        let req = device.next_requirement().cloned().unwrap_or_else(EjectRequirement::unrouted);
        let transfer = Transfer::new(device.id().clone(), target, &req, 0);
        let id = transfer.id;
        device.begin_eject(transfer).unwrap();
        id
    }

    #[test]
    fn test_entry_switch_counts_activations_only() {
        let mut device = BallDevice::new("trough", Some(3))
            .with_mechanism("trough_entry", MechanismKind::Entry);

        assert_eq!(device.handle_switch(MechanismKind::Entry, true), SwitchOutcome::BallEntered);
        assert_eq!(device.handle_switch(MechanismKind::Entry, false), SwitchOutcome::Ignored);
        assert_eq!(device.ball_count(), 1);
    }

    #[test]
    fn test_full_device_rejects_sensed_ball() {
        let mut device = trough();
        assert_eq!(
            device.handle_switch(MechanismKind::Entry, true),
            SwitchOutcome::CapacityExceeded
        );
        assert_eq!(device.ball_count(), 3);
    }

    #[test]
    fn test_no_decrement_until_confirmed() {
        let mut device = trough();
        device.add_requirement(EjectRequirement::unrouted());
        let id = start(&mut device, "plunger");

        assert_eq!(device.state(), DeviceState::Ejecting);
        assert_eq!(device.ball_count(), 3);

        let transfer = device.complete_eject(id).unwrap();
        assert!(transfer.confirmed);
        assert_eq!(device.ball_count(), 2);
        assert_eq!(device.state(), DeviceState::Idle);

        // second confirmation of the same transfer has no effect
        assert!(device.complete_eject(id).is_none());
        assert_eq!(device.ball_count(), 2);
    }

    #[test]
    fn test_at_most_one_transfer() {
        let mut device = trough();
        start(&mut device, "plunger");

        let second = Transfer::new("trough", "plunger", &EjectRequirement::unrouted(), 5);
        assert_eq!(
            device.begin_eject(second),
            Err(TransferError::AlreadyEjecting("trough".into()))
        );
    }

    #[test]
    fn test_exit_switch_is_advisory() {
        let mut device = outhole();
        device.handle_switch(MechanismKind::Count, true);
        device.ensure_auto_eject();
        let id = start(&mut device, "trough");

        assert_eq!(device.handle_switch(MechanismKind::Count, false), SwitchOutcome::BallLeft);
        assert_eq!(device.ball_count(), 1);
        assert!(device.pending_transfer().unwrap().exit_seen);

        // ball rolls back onto the switch
        assert_eq!(device.handle_switch(MechanismKind::Count, true), SwitchOutcome::BallReturned);
        assert!(!device.pending_transfer().unwrap().exit_seen);
        assert_eq!(device.ball_count(), 1);

        device.complete_eject(id).unwrap();
        assert_eq!(device.ball_count(), 0);
    }

    #[test]
    fn test_late_exit_release_consumed_after_confirmation() {
        let mut device = outhole();
        device.handle_switch(MechanismKind::Count, true);
        let id = start(&mut device, "trough");

        // target confirmed before the outhole switch released
        device.complete_eject(id).unwrap();
        assert_eq!(device.ball_count(), 0);
        // the closed switch still holds the slot
        assert_eq!(device.free_capacity(0), Some(0));
        assert_eq!(
            device.handle_switch(MechanismKind::Count, true),
            SwitchOutcome::CapacityExceeded
        );

        assert_eq!(
            device.handle_switch(MechanismKind::Count, false),
            SwitchOutcome::ExitConsumed
        );
        assert_eq!(device.ball_count(), 0);
        assert_eq!(device.free_capacity(0), Some(1));
    }

    #[test]
    fn test_player_released_ball_armed_only_after_exit() {
        let mut plunger = BallDevice::new("plunger", Some(1))
            .with_mechanism("plunger", MechanismKind::Count)
            .with_targets(["playfield"]);
        plunger.handle_switch(MechanismKind::Count, true);
        start(&mut plunger, "playfield");
        plunger
            .pending_transfer_mut()
            .unwrap()
            .record(AttemptAction::Mechanical, 0);
        assert!(plunger.armed_transfer().is_none());

        assert_eq!(
            plunger.handle_switch(MechanismKind::Count, false),
            SwitchOutcome::BallLeft
        );
        assert!(plunger.armed_transfer().is_some());

        // rolled back onto the switch
        assert_eq!(
            plunger.handle_switch(MechanismKind::Count, true),
            SwitchOutcome::BallReturned
        );
        assert!(plunger.armed_transfer().is_none());
    }

    #[test]
    fn test_release_without_transfer_is_missing_ball() {
        let mut device = outhole();
        device.handle_switch(MechanismKind::Count, true);
        device.ensure_auto_eject();
        assert_eq!(device.queued_ejects(), 1);

        let outcome = device.handle_switch(MechanismKind::Count, false);
        assert_eq!(
            outcome,
            SwitchOutcome::BallMissing {
                dropped: vec![EjectRequirement::unrouted()]
            }
        );
        assert_eq!(device.ball_count(), 0);
        assert_eq!(device.queued_ejects(), 0);
    }

    #[test]
    fn test_abandon_marks_jammed_and_keeps_count() {
        let mut device = trough();
        device.add_requirement(EjectRequirement::routed("playfield", 1));
        device.add_requirement(EjectRequirement::routed("playfield", 2));
        let id = start(&mut device, "plunger");

        let (transfer, queued) = device.abandon_eject(id).unwrap();
        assert_eq!(transfer.request, Some(1));
        assert_eq!(queued, vec![EjectRequirement::routed("playfield", 2)]);
        assert_eq!(device.ball_count(), 3);
        assert_eq!(device.state(), DeviceState::Idle);
        assert!(device.is_jammed());

        // a late confirmation cannot resurrect it
        assert!(device.complete_eject(id).is_none());
        assert_eq!(device.ball_count(), 3);
    }

    #[test]
    fn test_switch_activity_clears_jam() {
        let mut device = outhole();
        device.handle_switch(MechanismKind::Count, true);
        let id = start(&mut device, "trough");
        device.abandon_eject(id).unwrap();
        assert!(device.is_jammed());
        assert_eq!(device.ensure_auto_eject(), 0);

        device.handle_switch(MechanismKind::Count, false);
        assert!(!device.is_jammed());
    }

    #[test]
    fn test_auto_eject_only_for_non_home_devices() {
        let mut home = trough();
        assert_eq!(home.ensure_auto_eject(), 0);
        assert_eq!(home.surplus(), 3);

        let mut drain = outhole();
        drain.handle_switch(MechanismKind::Count, true);
        assert_eq!(drain.ensure_auto_eject(), 1);
        assert_eq!(drain.ensure_auto_eject(), 0);
        assert_eq!(drain.surplus(), 0);
    }

    #[test]
    fn test_free_capacity_counts_inbound() {
        let device = trough().with_balls(2);
        assert_eq!(device.free_capacity(0), Some(1));
        assert_eq!(device.free_capacity(1), Some(0));

        let playfield = BallDevice::new("playfield", None);
        assert_eq!(playfield.free_capacity(10), None);
    }

    #[test]
    fn test_claim_and_withdraw_request() {
        let mut device = trough();
        device.add_requirement(EjectRequirement::unrouted());
        assert!(device.claim_queued(&"playfield".to_string(), 9));
        assert!(!device.has_unclaimed_queued());

        assert_eq!(device.withdraw_request(9), 1);
        assert_eq!(device.queued_ejects(), 0);
    }

    #[test]
    fn test_withdraw_detaches_in_flight_transfer() {
        let mut device = trough();
        device.add_requirement(EjectRequirement::routed("playfield", 4));
        start(&mut device, "plunger");

        assert_eq!(device.withdraw_request(4), 0);
        let transfer = device.pending_transfer().unwrap();
        assert_eq!(transfer.request, None);
        assert_eq!(device.state(), DeviceState::Ejecting);
    }

    #[test]
    fn test_capture_leaves_committed_balls() {
        let mut playfield = BallDevice::new("playfield", None)
            .with_mechanism("playfield", MechanismKind::Confirm)
            .with_balls(1);
        assert!(playfield.remove_captured());
        assert!(!playfield.remove_captured());
        assert_eq!(playfield.ball_count(), 0);
    }

    #[test]
    fn test_snapshot() {
        let mut device = trough();
        device.add_requirement(EjectRequirement::unrouted());
        start(&mut device, "plunger");

        let snap = device.snapshot();
        assert_eq!(snap.id, "trough");
        assert_eq!(snap.ball_count, 3);
        assert_eq!(snap.state, DeviceState::Ejecting);
        assert_eq!(snap.attempt_count, Some(0));
        assert_eq!(snap.queued_ejects, 0);
    }
}
