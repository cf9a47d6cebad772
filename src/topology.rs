//! Machine Topology
//!
//! Owned map from device id to [`BallDevice`], plus the switch index and the
//! eject graph queries the coordinator and controller need. Passed explicitly
//! into every component instead of living in a global registry.

use std::collections::VecDeque;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::config::{ConfigError, EjectMode, MachineConfig};
use crate::core_types::{DeviceId, SwitchId};
use crate::device::{BallDevice, DeviceSnapshot, MechanismKind};
use crate::driver::{EjectCoil, HoldSettings, PulseSettings, SwitchRule};
use crate::transfer::TransferId;

#[derive(Debug, Default)]
pub struct MachineTopology {
    devices: FxHashMap<DeviceId, BallDevice>,
    /// Configuration order; evaluation and snapshots follow it
    order: Vec<DeviceId>,
    switches: FxHashMap<SwitchId, (DeviceId, MechanismKind)>,
}

impl MachineTopology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every device from validated configuration
    pub fn from_config(config: &MachineConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut topology = Self::new();
        for dc in &config.devices {
            let mut device = BallDevice::new(dc.id.clone(), dc.capacity)
                .with_targets(dc.eject_targets.iter().cloned())
                .with_timeout(
                    dc.eject_timeout_ms
                        .unwrap_or(config.transfer.eject_timeout_ms),
                )
                .with_balls(dc.initial_balls);
            for mechanism in &dc.mechanisms {
                device = device.with_mechanism(mechanism.switch.clone(), mechanism.kind);
            }
            if dc.hold_balls {
                device = device.holding_balls();
            }
            if let Some(source) = &dc.captures_from {
                device = device.capturing_from(source.clone());
            }

            if let Some(coil_id) = &dc.coil {
                let coil = config
                    .coil(coil_id)
                    .ok_or_else(|| ConfigError::UnknownCoil {
                        device: dc.id.clone(),
                        coil: coil_id.clone(),
                    })?;
                let pulse = PulseSettings::new(coil.pulse_ms, coil.pulse_power);
                let eject_coil = match (dc.eject_mode, coil.hold_power) {
                    (EjectMode::Hold, Some(power)) => {
                        EjectCoil::hold(coil_id.clone(), pulse, HoldSettings::new(power))
                    }
                    _ => EjectCoil::pulse(coil_id.clone(), pulse),
                };
                device = device.with_coil(eject_coil);

                if let Some(rule) = &dc.hardware_rule {
                    device = device.with_hardware_rule(SwitchRule {
                        switch: rule.switch.clone(),
                        pulse,
                        hold: None,
                        recycle: rule.recycle,
                    });
                }
            }

            topology.insert(device);
        }
        Ok(topology)
    }

    /// Add a device; later insertions with the same id replace earlier ones
    pub fn insert(&mut self, device: BallDevice) {
        let id = device.id().clone();
        for mechanism in device.mechanisms() {
            self.switches
                .insert(mechanism.switch.clone(), (id.clone(), mechanism.kind));
        }
        if !self.devices.contains_key(&id) {
            self.order.push(id.clone());
        }
        self.devices.insert(id, device);
    }

    pub fn device(&self, id: &str) -> Option<&BallDevice> {
        self.devices.get(id)
    }

    pub fn device_mut(&mut self, id: &str) -> Option<&mut BallDevice> {
        self.devices.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.devices.contains_key(id)
    }

    /// Device ids in configuration order
    pub fn ids(&self) -> &[DeviceId] {
        &self.order
    }

    /// Devices in configuration order
    pub fn devices(&self) -> impl Iterator<Item = &BallDevice> {
        self.order.iter().filter_map(|id| self.devices.get(id))
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Which device and mechanism a switch belongs to
    pub fn lookup_switch(&self, switch: &str) -> Option<(&DeviceId, MechanismKind)> {
        self.switches.get(switch).map(|(id, kind)| (id, *kind))
    }

    pub fn snapshot(&self) -> Vec<DeviceSnapshot> {
        self.devices().map(BallDevice::snapshot).collect()
    }

    // ============================================================
    // CROSS-DEVICE READS
    // ============================================================

    /// Transfers currently heading into `target`
    pub fn inbound_count(&self, target: &str) -> u32 {
        self.devices
            .values()
            .filter_map(BallDevice::pending_transfer)
            .filter(|t| t.target == target)
            .count() as u32
    }

    /// Room left in `target` once inbound transfers land; None = unbounded
    pub fn free_capacity(&self, target: &str) -> Option<u32> {
        self.devices
            .get(target)
            .and_then(|d| d.free_capacity(self.inbound_count(target)))
    }

    /// Whether `target` can take one more ball right now
    pub fn has_room(&self, target: &str) -> bool {
        self.devices.contains_key(target) && self.free_capacity(target) != Some(0)
    }

    /// Whether a ball in `from` can reach `to` through eject targets
    pub fn reaches(&self, from: &str, to: &str) -> bool {
        if from == to {
            return true;
        }
        let mut seen: FxHashSet<&str> = FxHashSet::default();
        let mut queue: VecDeque<&str> = VecDeque::from([from]);
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current) {
                continue;
            }
            let Some(device) = self.devices.get(current) else {
                continue;
            };
            for next in device.eject_targets() {
                if next == to {
                    return true;
                }
                queue.push_back(next);
            }
        }
        false
    }

    /// Devices that can deliver into `destination`, nearest first
    ///
    /// Breadth-first over reversed eject edges; ties keep configuration order.
    pub fn suppliers_for(&self, destination: &str) -> Vec<DeviceId> {
        let mut result = Vec::new();
        let mut seen: FxHashSet<&str> = FxHashSet::default();
        seen.insert(destination);
        let mut frontier = vec![destination];

        while !frontier.is_empty() {
            let mut next_frontier = Vec::new();
            for id in &self.order {
                if seen.contains(id.as_str()) {
                    continue;
                }
                let feeds_frontier = self
                    .devices
                    .get(id)
                    .is_some_and(|d| d.eject_targets().iter().any(|t| frontier.contains(&t.as_str())));
                if feeds_frontier {
                    seen.insert(id);
                    result.push(id.clone());
                    next_frontier.push(id.as_str());
                }
            }
            frontier = next_frontier;
        }
        result
    }

    /// Earliest armed transfer heading into `target`
    pub fn find_inbound(&self, target: &str) -> Option<(DeviceId, TransferId)> {
        self.devices()
            .filter_map(BallDevice::armed_transfer)
            .filter(|t| t.target == target)
            .min_by_key(|t| (t.started_at, t.id.inner()))
            .map(|t| (t.source.clone(), t.id))
    }

    /// Σ ball_count over all devices
    pub fn total_balls(&self) -> u32 {
        self.devices.values().map(BallDevice::ball_count).sum()
    }

    /// Active transfers machine-wide
    pub fn in_flight(&self) -> usize {
        self.devices
            .values()
            .filter(|d| d.pending_transfer().is_some())
            .count()
    }
}
