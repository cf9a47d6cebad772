//! Machine
//!
//! The single logical timeline. Switch events and timer expirations are
//! processed one at a time in timestamp order; after each one the machine
//! settles: drain devices queue their balls, the controller dispatches
//! requests, and the coordinator starts whatever transfers now have room.
//!
//! Nothing here blocks. Waiting for capacity or confirmation is just state.

use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::ball_controller::{BallController, BallRequest, ControllerError};
use crate::config::{ConfigError, MachineConfig};
use crate::core_types::{CoilId, DeviceId, RequestId, SwitchId, Timestamp};
use crate::device::{BallDevice, DeviceSnapshot, MechanismKind, SwitchOutcome};
use crate::driver::{DriverSet, RuleChange, SwitchRule};
use crate::events::{ConfigFault, EventSink, Fault};
use crate::switch_feed::SwitchEvent;
use crate::timer::TimerQueue;
use crate::topology::MachineTopology;
use crate::transfer::{TimerOutcome, Transfer, TransferCoordinator, TransferError};

/// Query view of the whole machine
#[derive(Debug, Clone, Serialize)]
pub struct MachineSnapshot {
    pub now: Timestamp,
    pub total_known_balls: u32,
    pub lost_balls: u32,
    pub devices: Vec<DeviceSnapshot>,
    pub requests: Vec<BallRequest>,
}

pub struct Machine {
    topology: MachineTopology,
    coordinator: TransferCoordinator,
    controller: BallController,
    timers: TimerQueue,
    events: EventSink,
    now: Timestamp,
    balls_installed: Option<u32>,
}

impl Machine {
    /// Build the machine from validated configuration.
    ///
    /// Configured hardware rules are installed here; a conflict between them
    /// is fatal.
    pub fn new(
        config: &MachineConfig,
        drivers: DriverSet,
        events: EventSink,
    ) -> Result<Self, ConfigError> {
        let topology = MachineTopology::from_config(config)?;
        let mut coordinator = TransferCoordinator::new(config.transfer.max_attempts, drivers);

        if let Some(coil) = coordinator.missing_drivers(&topology).into_iter().next() {
            return Err(ConfigError::MissingDriver(coil));
        }

        let rules: Vec<(CoilId, SwitchRule)> = topology
            .devices()
            .filter_map(|d| Some((d.eject_coil()?.coil.clone(), d.hardware_rule()?.clone())))
            .collect();
        for (coil, rule) in rules {
            match coordinator.install_rule(&coil, rule) {
                Ok(RuleChange::Rejected) => {
                    warn!(coil = %coil, "Driver refused configured switch rule");
                }
                Ok(_) => {}
                Err(fault) => return Err(ConfigError::ConflictingRule(fault.coil)),
            }
        }

        Ok(Self {
            topology,
            coordinator,
            controller: BallController::new(events.clone()),
            timers: TimerQueue::new(),
            events,
            now: 0,
            balls_installed: config.balls_installed,
        })
    }

    /// Scan switches that are active at power-on, derive the ledger, and start
    /// moving balls
    pub fn boot(&mut self, active_switches: &[SwitchId], now: Timestamp) {
        self.now = self.now.max(now);
        for switch in active_switches {
            let Some((device_id, kind)) = self.lookup(switch) else {
                warn!(switch = %switch, "Unknown switch active at boot");
                continue;
            };
            // only settled switches say a ball is resting there
            if kind != MechanismKind::Count {
                continue;
            }
            if let Some(device) = self.topology.device_mut(&device_id)
                && !device.admit_ball()
            {
                warn!(device = %device_id, "Boot scan found more balls than capacity");
            }
        }

        self.controller
            .boot(&self.topology, self.balls_installed, self.now);
        for device in self.topology.devices() {
            info!(
                device = %device.id(),
                ball_count = device.ball_count(),
                "Device booted"
            );
        }
        self.settle();
    }

    fn lookup(&self, switch: &str) -> Option<(DeviceId, MechanismKind)> {
        self.topology
            .lookup_switch(switch)
            .map(|(id, kind)| (id.clone(), kind))
    }

    // ============================================================
    // TIMELINE
    // ============================================================

    /// Fire every timer due at or before `now`, in deadline order
    pub fn advance_time(&mut self, now: Timestamp) {
        while let Some((deadline, timer)) = self.timers.pop_due(now) {
            self.now = self.now.max(deadline);
            let outcome =
                self.coordinator
                    .on_timer(&mut self.topology, timer, self.now, &mut self.timers);
            if let TimerOutcome::Jammed(report) = outcome {
                self.controller.on_jam(&report);
            }
            self.settle();
        }
        self.now = self.now.max(now);
    }

    /// Apply one debounced switch transition
    pub fn process_switch(&mut self, event: &SwitchEvent) {
        self.advance_time(event.timestamp);
        let now = self.now;

        let Some((device_id, kind)) = self.lookup(&event.switch) else {
            trace!(switch = %event.switch, "Switch not attached to a ball device");
            return;
        };
        let Some(device) = self.topology.device_mut(&device_id) else {
            return;
        };
        let outcome = device.handle_switch(kind, event.active);
        debug!(
            switch = %event.switch,
            active = event.active,
            device = %device_id,
            outcome = ?outcome,
            "Switch"
        );

        match outcome {
            SwitchOutcome::BallEntered => {
                match self
                    .coordinator
                    .confirm_inbound(&mut self.topology, &device_id, now, &self.events)
                {
                    Some(transfer) => self.on_confirmed(transfer),
                    None => self.on_unexpected_arrival(&device_id),
                }
            }
            SwitchOutcome::ConfirmSignal => {
                if let Some(transfer) =
                    self.coordinator
                        .confirm_inbound(&mut self.topology, &device_id, now, &self.events)
                {
                    self.admit(&device_id);
                    self.on_confirmed(transfer);
                }
            }
            SwitchOutcome::BallLeft => {
                if let Some(transfer) = self.coordinator.on_exit_seen(
                    &mut self.topology,
                    &device_id,
                    now,
                    &mut self.timers,
                    &self.events,
                ) {
                    self.on_confirmed(transfer);
                }
            }
            SwitchOutcome::BallMissing { dropped } => {
                self.controller
                    .on_ball_missing(&self.topology, &device_id, &dropped, now);
            }
            SwitchOutcome::CapacityExceeded => {
                self.controller
                    .on_capacity_exceeded(&self.topology, &device_id, now);
            }
            SwitchOutcome::BallReturned | SwitchOutcome::ExitConsumed | SwitchOutcome::Ignored => {}
        }

        let activated = event.active.then_some(event.switch.as_str());
        self.settle_after(activated);
    }

    fn admit(&mut self, device_id: &str) {
        if let Some(device) = self.topology.device_mut(device_id)
            && !device.admit_ball()
        {
            warn!(device = device_id, "Confirmed ball into full device");
        }
    }

    fn on_confirmed(&mut self, transfer: Transfer) {
        if let Some(requirement) = self.controller.on_transfer_confirmed(&transfer, self.now)
            && let Some(target) = self.topology.device_mut(&transfer.target)
        {
            target.add_requirement(requirement);
        }
    }

    fn on_unexpected_arrival(&mut self, device_id: &str) {
        // a ball that skipped the source's confirm switch on its way down
        // still completes that transfer before being captured
        let source = self
            .topology
            .device(device_id)
            .and_then(BallDevice::captures_from)
            .cloned();
        if let Some(source) = source
            && let Some(transfer) =
                self.coordinator
                    .confirm_inbound(&mut self.topology, &source, self.now, &self.events)
        {
            self.admit(&source);
            self.on_confirmed(transfer);
        }
        self.controller
            .on_unexpected_arrival(&mut self.topology, device_id, self.now);
    }

    /// Bring every device to rest given the current counts
    fn settle(&mut self) {
        self.settle_after(None);
    }

    /// Settle right after `activated` closed; only ejects started now may
    /// credit a hardware rule on that switch
    fn settle_after(&mut self, activated: Option<&str>) {
        let ids = self.topology.ids().to_vec();
        for id in &ids {
            if let Some(device) = self.topology.device_mut(id) {
                device.ensure_auto_eject();
            }
        }
        self.controller.service_requests(&mut self.topology);
        self.coordinator.evaluate_all(
            &mut self.topology,
            activated,
            self.now,
            &mut self.timers,
            &self.events,
        );
    }

    // ============================================================
    // COMMANDS
    // ============================================================

    pub fn request_balls(
        &mut self,
        consumer: &str,
        destination: &str,
        balls: u32,
    ) -> Result<RequestId, ControllerError> {
        let id = self
            .controller
            .request_balls(&self.topology, consumer, destination, balls, self.now)?;
        self.settle();
        Ok(id)
    }

    pub fn cancel_request(&mut self, consumer: &str, id: RequestId) -> Result<(), ControllerError> {
        self.controller
            .cancel_request(&mut self.topology, consumer, id)?;
        self.settle();
        Ok(())
    }

    pub fn clear_jam(&mut self, device: &str) -> Result<(), TransferError> {
        self.coordinator.clear_jam(&mut self.topology, device)?;
        self.settle();
        Ok(())
    }

    pub fn reconcile_ledger(&mut self) -> u32 {
        self.controller.reconcile_ledger(&self.topology)
    }

    /// Install a runtime switch rule. A conflicting rule is reported to the
    /// caller and published as a configuration fault; the prior rule stays.
    pub fn set_switch_rule(&mut self, coil: &str, rule: SwitchRule) -> Result<RuleChange, ConfigFault> {
        self.coordinator.install_rule(coil, rule).inspect_err(|fault| {
            self.controller
                .record_fault(Fault::Configuration(fault.clone()));
        })
    }

    pub fn remove_switch_rule(&mut self, coil: &str) -> Option<SwitchRule> {
        self.coordinator.remove_rule(coil)
    }

    // ============================================================
    // QUERIES
    // ============================================================

    pub fn snapshot(&self) -> MachineSnapshot {
        MachineSnapshot {
            now: self.now,
            total_known_balls: self.controller.total_known_balls(),
            lost_balls: self.controller.lost_balls(),
            devices: self.topology.snapshot(),
            requests: self.controller.requests().cloned().collect(),
        }
    }

    pub fn device(&self, id: &str) -> Option<&BallDevice> {
        self.topology.device(id)
    }

    pub fn topology(&self) -> &MachineTopology {
        &self.topology
    }

    pub fn controller(&self) -> &BallController {
        &self.controller
    }

    pub fn coordinator(&self) -> &TransferCoordinator {
        &self.coordinator
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    pub fn faults(&self) -> &[Fault] {
        self.controller.faults()
    }

    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.timers.next_deadline()
    }

    pub fn now(&self) -> Timestamp {
        self.now
    }

    /// Σ ball_count + lost_balls == total_known_balls
    pub fn ledger_balanced(&self) -> bool {
        self.controller.ledger_balanced(&self.topology)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::device::DeviceState;
    use crate::driver::{DriverCapability, MockDriver, PulseSettings};
    use crate::events::TransportEvent;

    const MACHINE: &str = r#"
transfer:
  max_attempts: 3
  eject_timeout_ms: 1000
coils:
  - id: trough
    pulse_ms: 20
  - id: outhole
    pulse_ms: 20
devices:
  - id: trough
    capacity: 3
    hold_balls: true
    initial_balls: 3
    mechanisms:
      - { switch: trough_entry, kind: entry }
    eject_targets: [plunger]
    coil: trough
  - id: outhole
    capacity: 1
    mechanisms:
      - { switch: outhole, kind: count }
    eject_targets: [trough]
    coil: outhole
    captures_from: playfield
  - id: plunger
    capacity: 1
    mechanisms:
      - { switch: plunger, kind: count }
    eject_targets: [playfield]
  - id: playfield
    mechanisms:
      - { switch: playfield, kind: confirm }
"#;

    struct Rig {
        machine: Machine,
        trough: Arc<MockDriver>,
        outhole: Arc<MockDriver>,
    }

    fn rig() -> Rig {
        let config = MachineConfig::from_yaml(MACHINE).unwrap();
        let trough = Arc::new(MockDriver::new("trough"));
        let outhole = Arc::new(MockDriver::new("outhole"));
        let mut drivers = DriverSet::default();
        drivers.insert("trough".into(), trough.clone() as Arc<dyn DriverCapability>);
        drivers.insert("outhole".into(), outhole.clone() as Arc<dyn DriverCapability>);
        let machine = Machine::new(&config, drivers, EventSink::new(256)).unwrap();
        Rig {
            machine,
            trough,
            outhole,
        }
    }

    fn switch(machine: &mut Machine, name: &str, active: bool, at: Timestamp) {
        machine.process_switch(&SwitchEvent::new(name, active, at));
    }

    #[test]
    fn test_missing_driver_is_fatal() {
        let config = MachineConfig::from_yaml(MACHINE).unwrap();
        let err = Machine::new(&config, DriverSet::default(), EventSink::default())
            .err()
            .unwrap();
        assert_eq!(err.code(), "MISSING_DRIVER");
    }

    #[test]
    fn test_boot_counts_settled_switches() {
        let mut rig = rig();
        rig.machine.boot(&["outhole".into(), "trough_entry".into()], 0);

        assert_eq!(rig.machine.device("outhole").unwrap().ball_count(), 1);
        assert_eq!(rig.machine.controller().total_known_balls(), 4);
        // trough full: the drain ball waits
        assert_eq!(
            rig.machine.device("outhole").unwrap().state(),
            DeviceState::WaitingForTarget
        );
        assert_eq!(rig.outhole.pulse_count(), 0);
    }

    #[test]
    fn test_game_start_ball_reaches_playfield() {
        let mut rig = rig();
        let m = &mut rig.machine;
        m.boot(&[], 0);

        let id = m.request_balls("game", "playfield", 1).unwrap();
        assert_eq!(rig.trough.pulse_count(), 1);

        switch(m, "plunger", true, 100);
        assert_eq!(m.device("trough").unwrap().ball_count(), 2);
        assert_eq!(m.device("plunger").unwrap().ball_count(), 1);
        // plunger is mechanical: ejecting, waiting for the player
        assert_eq!(m.device("plunger").unwrap().state(), DeviceState::Ejecting);
        assert!(m.controller().request(id).is_some());

        switch(m, "plunger", false, 5_000);
        switch(m, "playfield", true, 5_300);
        assert_eq!(m.device("plunger").unwrap().ball_count(), 0);
        assert_eq!(m.device("playfield").unwrap().ball_count(), 1);
        assert!(m.controller().request(id).is_none());
        assert!(m.ledger_balanced());
        assert!(m.faults().is_empty());
    }

    #[test]
    fn test_drain_returns_ball_to_trough() {
        let mut rig = rig();
        let m = &mut rig.machine;
        m.boot(&[], 0);
        m.request_balls("game", "playfield", 1).unwrap();
        switch(m, "plunger", true, 100);
        switch(m, "plunger", false, 1_000);
        switch(m, "playfield", true, 1_200);

        // ball drains
        switch(m, "outhole", true, 20_000);
        assert_eq!(m.device("playfield").unwrap().ball_count(), 0);
        assert_eq!(m.device("outhole").unwrap().ball_count(), 1);
        assert_eq!(rig.outhole.pulse_count(), 1);

        switch(m, "trough_entry", true, 20_300);
        assert_eq!(m.device("outhole").unwrap().ball_count(), 0);
        assert_eq!(m.device("trough").unwrap().ball_count(), 3);
        switch(m, "outhole", false, 20_350);
        assert_eq!(m.device("outhole").unwrap().ball_count(), 0);

        assert!(m.ledger_balanced());
        assert!(m.faults().is_empty());
        assert!(m.events().drain().iter().any(|e| matches!(
            e,
            TransportEvent::BallCaptured { from, into, .. } if from == "playfield" && into == "outhole"
        )));
    }

    #[test]
    fn test_jam_redispatches_from_other_supplier() {
        let mut rig = rig();
        let m = &mut rig.machine;
        // ball in outhole, trough can take it after the first eject
        m.boot(&["outhole".into()], 0);
        m.request_balls("game", "plunger", 1).unwrap();

        // trough pulses three times without reaching the plunger
        m.advance_time(1_000);
        m.advance_time(2_000);
        assert_eq!(rig.trough.pulse_count(), 3);
        m.advance_time(3_000);

        assert!(m.device("trough").unwrap().is_jammed());
        assert_eq!(m.device("trough").unwrap().ball_count(), 3);
        let jams = m.faults().iter().filter(|f| f.is_jam()).count();
        assert_eq!(jams, 1);
        assert!(m.ledger_balanced());

        m.clear_jam("trough").unwrap();
        assert_eq!(rig.trough.pulse_count(), 4);
    }

    #[test]
    fn test_runtime_rule_conflict_is_recoverable() {
        let mut rig = rig();
        let m = &mut rig.machine;
        let rule = SwitchRule {
            switch: "plunger".into(),
            pulse: PulseSettings::new(20, 1.0),
            hold: None,
            recycle: true,
        };
        assert_eq!(m.set_switch_rule("trough", rule.clone()), Ok(RuleChange::Installed));

        let conflicting = SwitchRule {
            recycle: false,
            ..rule.clone()
        };
        assert!(m.set_switch_rule("trough", conflicting).is_err());
        assert_eq!(m.faults().last().unwrap().code(), "CONFLICTING_SWITCH_RULE");
        assert_eq!(m.coordinator().rules().rule_for("trough"), Some(&rule));

        assert_eq!(m.remove_switch_rule("trough"), Some(rule));
    }

    #[test]
    fn test_snapshot_serializes() {
        let mut rig = rig();
        rig.machine.boot(&[], 0);
        let snapshot = rig.machine.snapshot();
        assert_eq!(snapshot.devices.len(), 4);
        assert_eq!(snapshot.total_known_balls, 3);

        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"state\":\"IDLE\""));
    }
}
