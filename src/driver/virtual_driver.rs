//! Virtual Drivers
//!
//! Software driver variants selected by configuration:
//! - [`VirtualDriver`]: behaves like a real driver board. Enforces the
//!   recycle window and tracks the applied configuration, skipping no-op
//!   reconfigurations.
//! - [`LoggingDriver`]: accepts every command and logs it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use super::settings::{DriverConfigState, HoldSettings, PulseSettings, SwitchRule};
use super::{DriverCapability, DriverError};
use crate::core_types::Timestamp;

/// Pulse settings applied when a rule is removed and nothing else is known
const FALLBACK_PULSE: PulseSettings = PulseSettings {
    duration_ms: 10,
    power: 1.0,
};

#[derive(Debug, Default)]
struct CoilState {
    /// Earliest time the next activation is accepted
    ready_at: Timestamp,
    enabled: Option<PulseSettings>,
    rule: Option<SwitchRule>,
    config: Option<DriverConfigState>,
}

/// Driver board stand-in with recycle enforcement
pub struct VirtualDriver {
    name: String,
    recycle_factor: u32,
    state: Mutex<CoilState>,
    pulse_count: AtomicUsize,
    enable_count: AtomicUsize,
    reconfigure_count: AtomicUsize,
}

impl VirtualDriver {
    pub fn new(name: impl Into<String>, recycle_factor: u32) -> Self {
        Self {
            name: name.into(),
            recycle_factor,
            state: Mutex::new(CoilState::default()),
            pulse_count: AtomicUsize::new(0),
            enable_count: AtomicUsize::new(0),
            reconfigure_count: AtomicUsize::new(0),
        }
    }

    pub fn pulse_count(&self) -> usize {
        self.pulse_count.load(Ordering::SeqCst)
    }

    pub fn enable_count(&self) -> usize {
        self.enable_count.load(Ordering::SeqCst)
    }

    /// Number of configuration writes that actually changed something
    pub fn reconfigure_count(&self) -> usize {
        self.reconfigure_count.load(Ordering::SeqCst)
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().enabled.is_some()
    }

    pub fn rule(&self) -> Option<SwitchRule> {
        self.lock().rule.clone()
    }

    fn lock(&self) -> MutexGuard<'_, CoilState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_recycle(&self, state: &CoilState, now: Timestamp) -> Result<(), DriverError> {
        if now < state.ready_at {
            debug!(
                coil = %self.name,
                now,
                ready_at = state.ready_at,
                "Activation refused during recycle window"
            );
            return Err(DriverError::Recycling {
                ready_at: state.ready_at,
            });
        }
        Ok(())
    }

    /// Write a configuration unless it equals the current one
    fn reconfigure(&self, state: &mut CoilState, next: DriverConfigState) -> bool {
        if state.config == Some(next) {
            return false;
        }
        state.config = Some(next);
        self.reconfigure_count.fetch_add(1, Ordering::SeqCst);
        debug!(coil = %self.name, config = ?next, "Driver reconfigured");
        true
    }

    /// Restore the rule configuration after a manual activation
    fn apply_rule(&self, state: &mut CoilState) {
        if let Some(rule) = state.rule.clone() {
            self.reconfigure(
                state,
                DriverConfigState {
                    pulse: rule.pulse,
                    hold: rule.hold,
                    recycle: rule.recycle,
                    has_rule: true,
                },
            );
        }
    }
}

impl DriverCapability for VirtualDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn pulse(&self, settings: PulseSettings, now: Timestamp) -> Result<(), DriverError> {
        let mut state = self.lock();
        self.check_recycle(&state, now)?;

        let has_rule = state.rule.is_some();
        self.reconfigure(
            &mut state,
            DriverConfigState {
                pulse: settings,
                hold: None,
                recycle: false,
                has_rule,
            },
        );
        state.ready_at =
            now + settings.duration_ms as u64 + settings.minimum_off_ms(self.recycle_factor);
        self.pulse_count.fetch_add(1, Ordering::SeqCst);
        debug!(coil = %self.name, duration_ms = settings.duration_ms, "Pulsing coil");

        self.apply_rule(&mut state);
        Ok(())
    }

    fn enable(
        &self,
        pulse: PulseSettings,
        hold: HoldSettings,
        now: Timestamp,
    ) -> Result<(), DriverError> {
        let mut state = self.lock();
        self.check_recycle(&state, now)?;

        let has_rule = state.rule.is_some();
        self.reconfigure(
            &mut state,
            DriverConfigState {
                pulse,
                hold: Some(hold),
                recycle: false,
                has_rule,
            },
        );
        state.enabled = Some(pulse);
        self.enable_count.fetch_add(1, Ordering::SeqCst);
        debug!(coil = %self.name, "Enabling coil");
        Ok(())
    }

    fn disable(&self, now: Timestamp) -> Result<(), DriverError> {
        let mut state = self.lock();
        if let Some(pulse) = state.enabled.take() {
            state.ready_at = now + pulse.minimum_off_ms(self.recycle_factor);
            debug!(coil = %self.name, "Disabling coil");
            self.apply_rule(&mut state);
        }
        Ok(())
    }

    fn set_switch_rule(&self, rule: &SwitchRule) -> Result<(), DriverError> {
        let mut state = self.lock();
        if let Some(existing) = &state.rule
            && existing != rule
        {
            return Err(DriverError::ConflictingRule(self.name.clone()));
        }
        state.rule = Some(rule.clone());
        self.apply_rule(&mut state);
        Ok(())
    }

    fn remove_switch_rule(&self) -> Result<(), DriverError> {
        let mut state = self.lock();
        if let Some(rule) = state.rule.take() {
            self.reconfigure(
                &mut state,
                DriverConfigState {
                    pulse: rule.pulse,
                    hold: None,
                    recycle: true,
                    has_rule: false,
                },
            );
        } else if state.config.is_none() {
            self.reconfigure(
                &mut state,
                DriverConfigState {
                    pulse: FALLBACK_PULSE,
                    hold: None,
                    recycle: true,
                    has_rule: false,
                },
            );
        }
        Ok(())
    }
}

/// Accept-everything driver that only logs
pub struct LoggingDriver {
    name: String,
}

impl LoggingDriver {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl DriverCapability for LoggingDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn pulse(&self, settings: PulseSettings, now: Timestamp) -> Result<(), DriverError> {
        info!(
            coil = %self.name,
            duration_ms = settings.duration_ms,
            power = settings.power,
            now,
            "pulse"
        );
        Ok(())
    }

    fn enable(
        &self,
        pulse: PulseSettings,
        hold: HoldSettings,
        now: Timestamp,
    ) -> Result<(), DriverError> {
        info!(
            coil = %self.name,
            duration_ms = pulse.duration_ms,
            hold_power = hold.power,
            now,
            "enable"
        );
        Ok(())
    }

    fn disable(&self, now: Timestamp) -> Result<(), DriverError> {
        info!(coil = %self.name, now, "disable");
        Ok(())
    }

    fn set_switch_rule(&self, rule: &SwitchRule) -> Result<(), DriverError> {
        info!(coil = %self.name, switch = %rule.switch, recycle = rule.recycle, "set_switch_rule");
        Ok(())
    }

    fn remove_switch_rule(&self) -> Result<(), DriverError> {
        info!(coil = %self.name, "remove_switch_rule");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pulse() -> PulseSettings {
        PulseSettings::new(20, 1.0)
    }

    #[test]
    fn test_recycle_window_enforced() {
        let driver = VirtualDriver::new("trough", 2);
        driver.pulse(pulse(), 0).unwrap();

        // 20ms on + 40ms off
        assert_eq!(
            driver.pulse(pulse(), 30),
            Err(DriverError::Recycling { ready_at: 60 })
        );
        assert!(driver.pulse(pulse(), 60).is_ok());
        assert_eq!(driver.pulse_count(), 2);
    }

    #[test]
    fn test_zero_factor_only_waits_for_pulse_end() {
        let driver = VirtualDriver::new("trough", 0);
        driver.pulse(pulse(), 0).unwrap();
        assert!(driver.pulse(pulse(), 19).is_err());
        assert!(driver.pulse(pulse(), 20).is_ok());
    }

    #[test]
    fn test_identical_reconfiguration_skipped() {
        let driver = VirtualDriver::new("trough", 0);
        driver.pulse(pulse(), 0).unwrap();
        driver.pulse(pulse(), 100).unwrap();
        assert_eq!(driver.reconfigure_count(), 1);

        driver.pulse(PulseSettings::new(30, 1.0), 200).unwrap();
        assert_eq!(driver.reconfigure_count(), 2);
    }

    #[test]
    fn test_rule_restored_after_pulse() {
        let driver = VirtualDriver::new("launch", 0);
        let rule = SwitchRule {
            switch: "plunger_lane".into(),
            pulse: PulseSettings::new(15, 1.0),
            hold: None,
            recycle: true,
        };
        driver.set_switch_rule(&rule).unwrap();
        let after_rule = driver.reconfigure_count();

        // manual pulse writes its own config, then the rule config again
        driver.pulse(pulse(), 0).unwrap();
        assert_eq!(driver.reconfigure_count(), after_rule + 2);
        assert_eq!(driver.rule(), Some(rule));
    }

    #[test]
    fn test_conflicting_rule_rejected() {
        let driver = VirtualDriver::new("launch", 0);
        let rule = SwitchRule {
            switch: "plunger_lane".into(),
            pulse: PulseSettings::new(15, 1.0),
            hold: None,
            recycle: true,
        };
        driver.set_switch_rule(&rule).unwrap();
        assert!(driver.set_switch_rule(&rule).is_ok());

        let other = SwitchRule {
            recycle: false,
            ..rule.clone()
        };
        assert_eq!(
            driver.set_switch_rule(&other),
            Err(DriverError::ConflictingRule("launch".into()))
        );
        assert_eq!(driver.rule(), Some(rule));
    }

    #[test]
    fn test_enable_disable_starts_recycle() {
        let driver = VirtualDriver::new("diverter", 2);
        driver.enable(pulse(), HoldSettings::new(0.25), 0).unwrap();
        assert!(driver.is_enabled());

        driver.disable(500).unwrap();
        assert!(!driver.is_enabled());
        assert!(driver.pulse(pulse(), 520).is_err());
        assert!(driver.pulse(pulse(), 540).is_ok());
    }
}
