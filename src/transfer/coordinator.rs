//! Transfer Coordinator
//!
//! Drives the eject / confirm / retry protocol. This is the central component
//! that moves devices between IDLE, WAITING_FOR_TARGET and EJECTING.
//!
//! The coordinator reads across device boundaries (downstream capacity) but
//! never writes another device's `ball_count`: sources only lose a ball in
//! [`BallDevice::complete_eject`], targets only gain one from their own
//! switches.

use tracing::{debug, error, info, warn};

use super::error::TransferError;
use super::types::{AttemptAction, EjectRequirement, Transfer, TransferId};
use crate::core_types::{CoilId, DeviceId, Timestamp};
use crate::device::BallDevice;
use crate::driver::{
    CoilAction, DriverError, DriverSet, EjectCoil, RuleChange, SwitchRule, SwitchRuleRegistry,
};
use crate::events::{ConfigFault, EventSink, JamFault, TransportEvent};
use crate::timer::{TimerKind, TimerQueue};
use crate::topology::MachineTopology;

/// Default retry bound
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Abandoned transfer handed to the BallController
#[derive(Debug, Clone)]
pub struct JamReport {
    pub fault: JamFault,
    pub transfer: Transfer,
    /// Ejects that were queued behind the jammed transfer
    pub queued: Vec<EjectRequirement>,
}

impl JamReport {
    /// Every requirement the jam took out of service, in-flight one first
    pub fn requirements(&self) -> impl Iterator<Item = EjectRequirement> + '_ {
        std::iter::once(self.transfer.requirement()).chain(self.queued.iter().cloned())
    }
}

/// Result of handling one timer
#[derive(Debug)]
pub enum TimerOutcome {
    /// Transfer already confirmed, abandoned or in a newer window
    Stale,
    /// Re-pulsed, deferred or window extended
    Progressed,
    Jammed(JamReport),
}

pub struct TransferCoordinator {
    max_attempts: u32,
    drivers: DriverSet,
    rules: SwitchRuleRegistry,
}

impl TransferCoordinator {
    pub fn new(max_attempts: u32, drivers: DriverSet) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            drivers,
            rules: SwitchRuleRegistry::new(),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn rules(&self) -> &SwitchRuleRegistry {
        &self.rules
    }

    pub fn has_driver(&self, coil: &str) -> bool {
        self.drivers.contains_key(coil)
    }

    // ============================================================
    // TARGET SELECTION
    // ============================================================

    /// First target in chain order with room that can still carry the ball
    /// toward its destination
    pub fn select_target(
        &self,
        topology: &MachineTopology,
        device: &BallDevice,
        requirement: &EjectRequirement,
    ) -> Option<DeviceId> {
        device
            .eject_targets()
            .iter()
            .filter(|target| match &requirement.destination {
                Some(destination) => topology.reaches(target, destination),
                None => true,
            })
            .find(|target| topology.has_room(target))
            .cloned()
    }

    /// Start a transfer for every device that has work and a free target.
    ///
    /// `activated` is the switch that closed in this step, if any.
    pub fn evaluate_all(
        &self,
        topology: &mut MachineTopology,
        activated: Option<&str>,
        now: Timestamp,
        timers: &mut TimerQueue,
        events: &EventSink,
    ) {
        let ids = topology.ids().to_vec();
        for id in &ids {
            self.evaluate(topology, id, activated, now, timers, events);
        }
    }

    /// IDLE / WAITING_FOR_TARGET → EJECTING when a target has room,
    /// IDLE → WAITING_FOR_TARGET when none has
    pub fn evaluate(
        &self,
        topology: &mut MachineTopology,
        device_id: &str,
        activated: Option<&str>,
        now: Timestamp,
        timers: &mut TimerQueue,
        events: &EventSink,
    ) {
        let Some(device) = topology.device(device_id) else {
            return;
        };
        if device.pending_transfer().is_some() || device.is_jammed() {
            return;
        }
        let Some(requirement) = device.next_requirement().cloned() else {
            if let Some(device) = topology.device_mut(device_id) {
                device.settle_idle();
            }
            return;
        };

        match self.select_target(topology, device, &requirement) {
            Some(target) => {
                let started = self.start_transfer(
                    topology,
                    device_id,
                    &target,
                    &requirement,
                    activated,
                    now,
                    timers,
                    events,
                );
                if let Err(e) = started {
                    error!(
                        device = device_id,
                        error = %e,
                        code = e.code(),
                        "Failed to start transfer"
                    );
                }
            }
            None => {
                let changed = topology
                    .device_mut(device_id)
                    .is_some_and(BallDevice::wait_for_target);
                if changed {
                    info!(device = device_id, "Every eject target full, waiting");
                    events.publish(TransportEvent::WaitingForTarget {
                        device: device_id.to_string(),
                        at: now,
                    });
                }
            }
        }
    }

    /// Create a transfer and fire its first attempt
    #[allow(clippy::too_many_arguments)]
    pub fn start_transfer(
        &self,
        topology: &mut MachineTopology,
        source: &str,
        target: &str,
        requirement: &EjectRequirement,
        activated: Option<&str>,
        now: Timestamp,
        timers: &mut TimerQueue,
        events: &EventSink,
    ) -> Result<TransferId, TransferError> {
        let device = topology
            .device_mut(source)
            .ok_or_else(|| TransferError::UnknownDevice(source.to_string()))?;
        let transfer = Transfer::new(source, target, requirement, now);
        let transfer_id = transfer.id;
        device.begin_eject(transfer)?;

        info!(
            transfer_id = %transfer_id,
            source,
            target,
            request = ?requirement.request,
            "Transfer started"
        );
        events.publish(TransportEvent::TransferStarted {
            transfer_id,
            source: source.to_string(),
            target: target.to_string(),
            request: requirement.request,
            at: now,
        });

        self.fire(topology, source, activated, now, timers);
        Ok(transfer_id)
    }

    // ============================================================
    // ATTEMPTS
    // ============================================================

    /// Issue the physical action for the current attempt of `device_id`'s
    /// transfer and open its confirmation window.
    ///
    /// A hardware rule only stands in for the pulse when its switch is the
    /// one that just closed.
    fn fire(
        &self,
        topology: &mut MachineTopology,
        device_id: &str,
        activated: Option<&str>,
        now: Timestamp,
        timers: &mut TimerQueue,
    ) {
        let Some(device) = topology.device_mut(device_id) else {
            return;
        };
        let rule_fires = match (device.eject_coil(), activated) {
            (Some(coil), Some(switch)) => {
                device.mechanisms().iter().any(|m| m.switch == switch)
                    && self.rules.fires_on(&coil.coil, switch)
            }
            _ => false,
        };
        let coil = device.eject_coil().cloned();
        let timeout_ms = device.eject_timeout_ms();
        let Some(transfer) = device.pending_transfer_mut() else {
            return;
        };

        let action = match &coil {
            None => AttemptAction::Mechanical,
            // hardware fired on the switch that brought the ball in
            Some(_) if rule_fires && transfer.attempt_count == 0 => AttemptAction::HardwareRule,
            Some(coil) => match self.activate(coil, now) {
                Ok(action) => action,
                Err(DriverError::Recycling { ready_at }) => {
                    debug!(
                        transfer_id = %transfer.id,
                        coil = %coil.coil,
                        ready_at,
                        "Coil recycling, attempt deferred"
                    );
                    transfer.record(AttemptAction::RecycleDeferred, now);
                    timers.schedule(
                        ready_at,
                        TimerKind::PulseReady {
                            device: device_id.to_string(),
                            transfer: transfer.id,
                            attempt: transfer.attempt_count,
                        },
                    );
                    return;
                }
                Err(e) => {
                    warn!(
                        transfer_id = %transfer.id,
                        coil = %coil.coil,
                        error = %e,
                        code = e.code(),
                        "Driver refused eject"
                    );
                    AttemptAction::DriverRejected
                }
            },
        };
        transfer.record(action, now);
        debug!(
            transfer_id = %transfer.id,
            attempt = transfer.attempt_count,
            action = ?action,
            "Eject attempt"
        );

        // a mechanical eject has no window until the ball is seen leaving
        if action != AttemptAction::Mechanical || transfer.exit_seen {
            let window = transfer.open_window(now);
            timers.schedule(
                now + timeout_ms,
                TimerKind::EjectTimeout {
                    device: device_id.to_string(),
                    transfer: transfer.id,
                    window,
                },
            );
        }
    }

    fn activate(&self, coil: &EjectCoil, now: Timestamp) -> Result<AttemptAction, DriverError> {
        let driver = self
            .drivers
            .get(&coil.coil)
            .ok_or_else(|| DriverError::Unavailable(coil.coil.clone()))?;
        match coil.action {
            CoilAction::Pulse(settings) => driver.pulse(settings, now).map(|()| AttemptAction::Pulsed),
            CoilAction::Hold { pulse, hold } => {
                driver.enable(pulse, hold, now).map(|()| AttemptAction::Enabled)
            }
        }
    }

    /// End a hold-mode activation
    fn release(&self, coil: Option<&EjectCoil>, now: Timestamp) {
        let Some(coil) = coil.filter(|c| c.is_hold()) else {
            return;
        };
        if let Some(driver) = self.drivers.get(&coil.coil)
            && let Err(e) = driver.disable(now)
        {
            warn!(coil = %coil.coil, error = %e, "Failed to disable coil");
        }
    }

    /// Handle a due timer. Timers for retired transfers or superseded windows
    /// are stale and do nothing.
    pub fn on_timer(
        &self,
        topology: &mut MachineTopology,
        timer: TimerKind,
        now: Timestamp,
        timers: &mut TimerQueue,
    ) -> TimerOutcome {
        match timer {
            TimerKind::PulseReady {
                device,
                transfer,
                attempt,
            } => {
                let live = topology
                    .device(&device)
                    .and_then(BallDevice::pending_transfer)
                    .is_some_and(|t| t.id == transfer && t.attempt_count == attempt);
                if !live {
                    return TimerOutcome::Stale;
                }
                self.fire(topology, &device, None, now, timers);
                TimerOutcome::Progressed
            }
            TimerKind::EjectTimeout {
                device,
                transfer,
                window,
            } => self.on_eject_timeout(topology, &device, transfer, window, now, timers),
        }
    }

    fn on_eject_timeout(
        &self,
        topology: &mut MachineTopology,
        device_id: &str,
        transfer_id: TransferId,
        window: u32,
        now: Timestamp,
        timers: &mut TimerQueue,
    ) -> TimerOutcome {
        let Some(device) = topology.device_mut(device_id) else {
            return TimerOutcome::Stale;
        };
        let coil = device.eject_coil().cloned();
        let timeout_ms = device.eject_timeout_ms();
        let Some(transfer) = device.pending_transfer_mut() else {
            return TimerOutcome::Stale;
        };
        if transfer.id != transfer_id || transfer.window_seq != window {
            return TimerOutcome::Stale;
        }

        if !transfer.exit_seen {
            self.release(coil.as_ref(), now);
        }
        transfer.attempt_count += 1;

        if transfer.attempt_count >= self.max_attempts {
            let Some((transfer, queued)) = device.abandon_eject(transfer_id) else {
                return TimerOutcome::Stale;
            };
            info!(
                transfer_id = %transfer.id,
                source = %transfer.source,
                target = %transfer.target,
                attempts = transfer.attempt_count,
                "Retries exhausted, transfer abandoned"
            );
            let fault = JamFault {
                transfer_id: transfer.id,
                source: transfer.source.clone(),
                target: transfer.target.clone(),
                attempts: transfer.history.clone(),
                raised_at: now,
            };
            return TimerOutcome::Jammed(JamReport {
                fault,
                transfer,
                queued,
            });
        }

        // ball visibly gone or player-operated: wait longer, never re-fire
        if transfer.exit_seen || coil.is_none() {
            transfer.record(AttemptAction::Awaited, now);
            let window = transfer.open_window(now);
            debug!(
                transfer_id = %transfer.id,
                attempt = transfer.attempt_count,
                "Confirmation window extended"
            );
            timers.schedule(
                now + timeout_ms,
                TimerKind::EjectTimeout {
                    device: device_id.to_string(),
                    transfer: transfer_id,
                    window,
                },
            );
            return TimerOutcome::Progressed;
        }

        debug!(
            transfer_id = %transfer.id,
            attempt = transfer.attempt_count,
            "No confirmation, retrying eject"
        );
        self.fire(topology, device_id, None, now, timers);
        TimerOutcome::Progressed
    }

    // ============================================================
    // CONFIRMATION
    // ============================================================

    /// Source exit switch released during its own eject.
    ///
    /// Advisory for confirmation except when the target has no switch at
    /// all; then this is the confirmation and the ball is admitted there.
    pub fn on_exit_seen(
        &self,
        topology: &mut MachineTopology,
        device_id: &str,
        now: Timestamp,
        timers: &mut TimerQueue,
        events: &EventSink,
    ) -> Option<Transfer> {
        let device = topology.device_mut(device_id)?;
        let coil = device.eject_coil().cloned();
        let timeout_ms = device.eject_timeout_ms();
        let transfer = device.pending_transfer_mut()?;
        let transfer_id = transfer.id;
        let target = transfer.target.clone();

        if coil.is_none() {
            let window = transfer.open_window(now);
            timers.schedule(
                now + timeout_ms,
                TimerKind::EjectTimeout {
                    device: device_id.to_string(),
                    transfer: transfer_id,
                    window,
                },
            );
        }
        self.release(coil.as_ref(), now);

        let unsensed = topology
            .device(&target)
            .is_some_and(|d| !d.has_mechanisms());
        if !unsensed {
            return None;
        }
        let transfer = self.complete(topology, device_id, transfer_id, now, events)?;
        if let Some(target) = topology.device_mut(&target)
            && !target.admit_ball()
        {
            warn!(device = %target.id(), "Unsensed target already full");
        }
        Some(transfer)
    }

    /// A ball registered in `target`: confirm the earliest armed transfer
    /// heading there, if any
    pub fn confirm_inbound(
        &self,
        topology: &mut MachineTopology,
        target: &str,
        now: Timestamp,
        events: &EventSink,
    ) -> Option<Transfer> {
        let (source, transfer_id) = topology.find_inbound(target)?;
        self.complete(topology, &source, transfer_id, now, events)
    }

    fn complete(
        &self,
        topology: &mut MachineTopology,
        source: &str,
        transfer_id: TransferId,
        now: Timestamp,
        events: &EventSink,
    ) -> Option<Transfer> {
        let device = topology.device_mut(source)?;
        let coil = device.eject_coil().cloned();
        let transfer = device.complete_eject(transfer_id)?;
        if !transfer.exit_seen {
            self.release(coil.as_ref(), now);
        }

        let attempts = transfer.physical_attempts() as u32;
        info!(
            transfer_id = %transfer.id,
            source = %transfer.source,
            target = %transfer.target,
            attempts,
            "Transfer confirmed"
        );
        events.publish(TransportEvent::TransferConfirmed {
            transfer_id: transfer.id,
            source: transfer.source.clone(),
            target: transfer.target.clone(),
            attempts,
            at: now,
        });
        Some(transfer)
    }

    // ============================================================
    // OPERATOR / CONFIGURATION
    // ============================================================

    /// Reset a jammed device so it ejects again
    pub fn clear_jam(
        &self,
        topology: &mut MachineTopology,
        device_id: &str,
    ) -> Result<(), TransferError> {
        let device = topology
            .device_mut(device_id)
            .ok_or_else(|| TransferError::UnknownDevice(device_id.to_string()))?;
        if !device.clear_jam() {
            return Err(TransferError::NotJammed(device_id.to_string()));
        }
        info!(device = device_id, "Jam cleared by operator");
        Ok(())
    }

    /// Install a hardware switch rule on `coil`.
    ///
    /// A different rule already on the coil is rejected and stays in effect.
    pub fn install_rule(&mut self, coil: &str, rule: SwitchRule) -> Result<RuleChange, ConfigFault> {
        let change = self.rules.install(coil, rule.clone())?;
        if change == RuleChange::Unchanged {
            debug!(coil, "Identical switch rule already installed");
            return Ok(change);
        }

        let result = match self.drivers.get(coil) {
            Some(driver) => driver.set_switch_rule(&rule),
            None => Err(DriverError::Unavailable(coil.to_string())),
        };
        match result {
            Ok(()) => {
                info!(coil, switch = %rule.switch, recycle = rule.recycle, "Switch rule installed");
                Ok(RuleChange::Installed)
            }
            Err(e) => {
                warn!(coil, error = %e, code = e.code(), "Driver refused switch rule");
                self.rules.remove(coil);
                Ok(RuleChange::Rejected)
            }
        }
    }

    pub fn remove_rule(&mut self, coil: &str) -> Option<SwitchRule> {
        let removed = self.rules.remove(coil)?;
        if let Some(driver) = self.drivers.get(coil)
            && let Err(e) = driver.remove_switch_rule()
        {
            warn!(coil, error = %e, "Failed to remove switch rule");
        }
        info!(coil, "Switch rule removed");
        Some(removed)
    }

    /// Coils of the configured topology that have no driver
    pub fn missing_drivers(&self, topology: &MachineTopology) -> Vec<CoilId> {
        topology
            .devices()
            .filter_map(BallDevice::eject_coil)
            .map(|c| c.coil.clone())
            .filter(|coil| !self.has_driver(coil))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::device::{DeviceState, MechanismKind};
    use crate::driver::{DriverCapability, HoldSettings, MockDriver, PulseSettings};
    use crate::events::EVENT_QUEUE_CAPACITY;

    struct Harness {
        topology: MachineTopology,
        coordinator: TransferCoordinator,
        timers: TimerQueue,
        events: EventSink,
        trough_coil: Arc<MockDriver>,
    }

    impl Harness {
        fn new(max_attempts: u32) -> Self {
            let trough_coil = Arc::new(MockDriver::new("trough"));
            let mut drivers = DriverSet::default();
            drivers.insert(
                "trough".into(),
                trough_coil.clone() as Arc<dyn DriverCapability>,
            );

            let mut topology = MachineTopology::new();
            topology.insert(
                BallDevice::new("trough", Some(3))
                    .with_mechanism("trough_entry", MechanismKind::Entry)
                    .with_targets(["plunger"])
                    .with_coil(EjectCoil::pulse("trough", PulseSettings::new(20, 1.0)))
                    .with_timeout(1_000)
                    .holding_balls()
                    .with_balls(3),
            );
            topology.insert(
                BallDevice::new("plunger", Some(1))
                    .with_mechanism("plunger", MechanismKind::Count)
                    .with_targets(["playfield"])
                    .with_timeout(1_000),
            );
            topology.insert(
                BallDevice::new("playfield", None)
                    .with_mechanism("playfield", MechanismKind::Confirm),
            );

            Self {
                topology,
                coordinator: TransferCoordinator::new(max_attempts, drivers),
                timers: TimerQueue::new(),
                events: EventSink::new(EVENT_QUEUE_CAPACITY),
                trough_coil,
            }
        }

        fn request_eject(&mut self, device: &str, now: Timestamp) {
            self.topology
                .device_mut(device)
                .unwrap()
                .add_requirement(EjectRequirement::unrouted());
            self.coordinator.evaluate(
                &mut self.topology,
                device,
                None,
                now,
                &mut self.timers,
                &self.events,
            );
        }

        /// Eject started by the activation of `switch`
        fn eject_on_switch(&mut self, device: &str, switch: &str, now: Timestamp) {
            self.topology
                .device_mut(device)
                .unwrap()
                .add_requirement(EjectRequirement::unrouted());
            self.coordinator.evaluate(
                &mut self.topology,
                device,
                Some(switch),
                now,
                &mut self.timers,
                &self.events,
            );
        }

        fn run_timers(&mut self, now: Timestamp) -> Vec<TimerOutcome> {
            let mut outcomes = Vec::new();
            while let Some((_, timer)) = self.timers.pop_due(now) {
                outcomes.push(self.coordinator.on_timer(
                    &mut self.topology,
                    timer,
                    now,
                    &mut self.timers,
                ));
            }
            outcomes
        }

        fn device(&self, id: &str) -> &BallDevice {
            self.topology.device(id).unwrap()
        }
    }

    #[test]
    fn test_eject_pulses_and_waits() {
        let mut h = Harness::new(3);
        h.request_eject("trough", 0);

        assert_eq!(h.device("trough").state(), DeviceState::Ejecting);
        assert_eq!(h.trough_coil.pulse_count(), 1);
        assert_eq!(h.timers.next_deadline(), Some(1_000));
        assert_eq!(h.device("trough").ball_count(), 3);
    }

    #[test]
    fn test_full_target_waits_without_pulse() {
        let mut h = Harness::new(3);
        h.topology.device_mut("plunger").unwrap().admit_ball();
        h.request_eject("trough", 0);

        assert_eq!(h.device("trough").state(), DeviceState::WaitingForTarget);
        assert_eq!(h.trough_coil.pulse_count(), 0);
        assert!(h.timers.is_empty());
        assert!(h.events.drain().iter().any(|e| matches!(
            e,
            TransportEvent::WaitingForTarget { device, .. } if device == "trough"
        )));
    }

    #[test]
    fn test_timeout_retries_then_confirms_once() {
        let mut h = Harness::new(3);
        h.request_eject("trough", 0);

        let outcomes = h.run_timers(1_000);
        assert!(matches!(outcomes[..], [TimerOutcome::Progressed]));
        assert_eq!(h.trough_coil.pulse_count(), 2);
        assert_eq!(
            h.device("trough").pending_transfer().unwrap().attempt_count,
            1
        );

        h.topology.device_mut("plunger").unwrap().admit_ball();
        let confirmed = h
            .coordinator
            .confirm_inbound(&mut h.topology, "plunger", 1_200, &h.events)
            .unwrap();
        assert!(confirmed.confirmed);
        assert_eq!(h.device("trough").ball_count(), 2);
        assert_eq!(h.device("trough").state(), DeviceState::Idle);

        // the second window's timer is now stale
        assert!(matches!(h.run_timers(2_000)[..], [TimerOutcome::Stale]));
        assert_eq!(h.device("trough").ball_count(), 2);
    }

    #[test]
    fn test_exhausted_retries_jam_once() {
        let mut h = Harness::new(2);
        h.request_eject("trough", 0);

        assert!(matches!(h.run_timers(1_000)[..], [TimerOutcome::Progressed]));
        let outcomes = h.run_timers(2_000);
        let [TimerOutcome::Jammed(report)] = &outcomes[..] else {
            panic!("expected a jam, got {outcomes:?}");
        };
        assert_eq!(report.fault.source, "trough");
        assert_eq!(report.fault.target, "plunger");
        assert_eq!(report.transfer.attempt_count, 2);
        assert_eq!(report.transfer.physical_attempts(), 2);

        assert_eq!(h.trough_coil.pulse_count(), 2);
        assert_eq!(h.device("trough").state(), DeviceState::Idle);
        assert!(h.device("trough").is_jammed());
        assert_eq!(h.device("trough").ball_count(), 3);
        assert!(h.timers.is_empty());

        // late confirmation: nothing inbound any more
        assert!(
            h.coordinator
                .confirm_inbound(&mut h.topology, "plunger", 2_100, &h.events)
                .is_none()
        );
    }

    #[test]
    fn test_recycle_defers_attempt() {
        let mut h = Harness::new(3);
        h.trough_coil.set_recycling_until(Some(50));
        h.request_eject("trough", 0);

        assert_eq!(h.trough_coil.pulse_count(), 0);
        assert_eq!(h.timers.next_deadline(), Some(50));
        let transfer = h.device("trough").pending_transfer().unwrap();
        assert!(!transfer.is_armed());
        assert_eq!(transfer.history[0].action, AttemptAction::RecycleDeferred);

        h.run_timers(50);
        assert_eq!(h.trough_coil.pulse_count(), 1);
        assert_eq!(h.timers.next_deadline(), Some(1_050));
    }

    #[test]
    fn test_rejected_pulse_still_counts_toward_jam() {
        let mut h = Harness::new(1);
        h.trough_coil.set_reject(true);
        h.request_eject("trough", 0);

        let transfer = h.device("trough").pending_transfer().unwrap();
        assert_eq!(transfer.history[0].action, AttemptAction::DriverRejected);
        assert!(matches!(h.run_timers(1_000)[..], [TimerOutcome::Jammed(_)]));
    }

    #[test]
    fn test_mechanical_eject_waits_for_exit() {
        let mut h = Harness::new(2);
        h.topology.device_mut("plunger").unwrap().admit_ball();
        h.request_eject("plunger", 0);

        let transfer = h.device("plunger").pending_transfer().unwrap();
        assert_eq!(transfer.history[0].action, AttemptAction::Mechanical);
        assert!(h.timers.is_empty());

        // player pulls the plunger at t=30s
        h.topology
            .device_mut("plunger")
            .unwrap()
            .handle_switch(MechanismKind::Count, false);
        assert!(
            h.coordinator
                .on_exit_seen(&mut h.topology, "plunger", 30_000, &mut h.timers, &h.events)
                .is_none()
        );
        assert_eq!(h.timers.next_deadline(), Some(31_000));

        h.coordinator
            .confirm_inbound(&mut h.topology, "playfield", 30_500, &h.events)
            .unwrap();
        assert_eq!(h.device("plunger").ball_count(), 0);
    }

    #[test]
    fn test_hardware_rule_replaces_first_pulse_only() {
        let mut h = Harness::new(3);
        let rule = SwitchRule {
            switch: "trough_entry".into(),
            pulse: PulseSettings::new(20, 1.0),
            hold: None,
            recycle: true,
        };
        assert_eq!(
            h.coordinator.install_rule("trough", rule.clone()),
            Ok(RuleChange::Installed)
        );
        assert_eq!(h.trough_coil.rule_count(), 1);
        assert_eq!(
            h.coordinator.install_rule("trough", rule.clone()),
            Ok(RuleChange::Unchanged)
        );
        assert_eq!(h.trough_coil.rule_count(), 1);

        h.eject_on_switch("trough", "trough_entry", 0);
        assert_eq!(h.trough_coil.pulse_count(), 0);
        let transfer = h.device("trough").pending_transfer().unwrap();
        assert_eq!(transfer.history[0].action, AttemptAction::HardwareRule);

        h.run_timers(1_000);
        assert_eq!(h.trough_coil.pulse_count(), 1);

        let conflicting = SwitchRule {
            recycle: false,
            ..rule.clone()
        };
        let fault = h.coordinator.install_rule("trough", conflicting).unwrap_err();
        assert_eq!(fault.existing, rule);
        assert_eq!(h.coordinator.rules().rule_for("trough"), Some(&rule));
    }

    #[test]
    fn test_hardware_rule_not_credited_for_later_eject() {
        let mut h = Harness::new(1);
        let rule = SwitchRule {
            switch: "trough_entry".into(),
            pulse: PulseSettings::new(20, 1.0),
            hold: None,
            recycle: true,
        };
        h.coordinator.install_rule("trough", rule).unwrap();

        // eject started by freed capacity, not by the rule's switch
        h.request_eject("trough", 900);
        assert_eq!(h.trough_coil.pulse_count(), 1);
        let transfer = h.device("trough").pending_transfer().unwrap();
        assert_eq!(transfer.history[0].action, AttemptAction::Pulsed);

        // another device's switch does not count either
        h.topology.device_mut("plunger").unwrap().admit_ball();
        h.eject_on_switch("plunger", "trough_entry", 950);
        let transfer = h.device("plunger").pending_transfer().unwrap();
        assert_eq!(transfer.history[0].action, AttemptAction::Mechanical);
    }

    #[test]
    fn test_hold_mode_enables_then_disables_on_confirm() {
        let coil = Arc::new(MockDriver::new("diverter"));
        let mut drivers = DriverSet::default();
        drivers.insert("diverter".into(), coil.clone() as Arc<dyn DriverCapability>);

        let mut topology = MachineTopology::new();
        topology.insert(
            BallDevice::new("lock", Some(2))
                .with_mechanism("lock", MechanismKind::Count)
                .with_targets(["playfield"])
                .with_coil(EjectCoil::hold(
                    "diverter",
                    PulseSettings::new(30, 1.0),
                    HoldSettings::new(0.25),
                ))
                .with_balls(1),
        );
        topology.insert(
            BallDevice::new("playfield", None).with_mechanism("playfield", MechanismKind::Confirm),
        );
        let coordinator = TransferCoordinator::new(3, drivers);
        let mut timers = TimerQueue::new();
        let events = EventSink::new(16);

        topology
            .device_mut("lock")
            .unwrap()
            .add_requirement(EjectRequirement::unrouted());
        coordinator.evaluate(&mut topology, "lock", None, 0, &mut timers, &events);
        assert_eq!(coil.enable_count(), 1);

        coordinator
            .confirm_inbound(&mut topology, "playfield", 200, &events)
            .unwrap();
        assert_eq!(coil.disable_count(), 1);
        assert_eq!(topology.device("lock").unwrap().ball_count(), 0);
    }

    #[test]
    fn test_unsensed_target_confirms_on_exit() {
        let mut h = Harness::new(3);
        h.topology.insert(
            BallDevice::new("kicker", Some(1))
                .with_mechanism("kicker", MechanismKind::Count)
                .with_targets(["drain_bucket"])
                .with_balls(1),
        );
        h.topology.insert(BallDevice::new("drain_bucket", None));
        h.request_eject("kicker", 0);

        h.topology
            .device_mut("kicker")
            .unwrap()
            .handle_switch(MechanismKind::Count, false);
        let transfer = h
            .coordinator
            .on_exit_seen(&mut h.topology, "kicker", 500, &mut h.timers, &h.events)
            .unwrap();
        assert_eq!(transfer.target, "drain_bucket");
        assert_eq!(h.device("kicker").ball_count(), 0);
        assert_eq!(h.device("drain_bucket").ball_count(), 1);
    }

    #[test]
    fn test_clear_jam() {
        let mut h = Harness::new(1);
        assert_eq!(
            h.coordinator.clear_jam(&mut h.topology, "trough"),
            Err(TransferError::NotJammed("trough".into()))
        );
        h.request_eject("trough", 0);
        h.run_timers(1_000);
        assert!(h.coordinator.clear_jam(&mut h.topology, "trough").is_ok());
        assert!(!h.device("trough").is_jammed());
    }
}
