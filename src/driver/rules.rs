//! Switch Rule Registry
//!
//! Tracks which coils have a hardware switch rule installed so the core never
//! issues a redundant software pulse for a physical event the hardware
//! already handled, and rejects conflicting rules for the same coil.

use rustc_hash::FxHashMap;

use super::settings::SwitchRule;
use crate::core_types::CoilId;
use crate::events::ConfigFault;

/// Result of an install request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleChange {
    /// New rule stored; the driver must be told
    Installed,
    /// Identical rule already present; nothing to do
    Unchanged,
    /// Driver refused the rule; nothing installed
    Rejected,
}

#[derive(Debug, Default)]
pub struct SwitchRuleRegistry {
    rules: FxHashMap<CoilId, SwitchRule>,
}

impl SwitchRuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a rule for `coil`.
    ///
    /// A different rule already on the coil is a configuration fault and the
    /// existing rule stays in effect.
    pub fn install(&mut self, coil: &str, rule: SwitchRule) -> Result<RuleChange, ConfigFault> {
        match self.rules.get(coil) {
            Some(existing) if *existing == rule => Ok(RuleChange::Unchanged),
            Some(existing) => Err(ConfigFault {
                coil: coil.to_string(),
                existing: existing.clone(),
                requested: rule,
            }),
            None => {
                self.rules.insert(coil.to_string(), rule);
                Ok(RuleChange::Installed)
            }
        }
    }

    pub fn remove(&mut self, coil: &str) -> Option<SwitchRule> {
        self.rules.remove(coil)
    }

    pub fn rule_for(&self, coil: &str) -> Option<&SwitchRule> {
        self.rules.get(coil)
    }

    /// Whether `coil` fires autonomously when `switch` activates
    pub fn fires_on(&self, coil: &str, switch: &str) -> bool {
        self.rules.get(coil).is_some_and(|r| r.switch == switch)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
