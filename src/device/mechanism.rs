//! Ball-sensing mechanisms attached to a device

use serde::{Deserialize, Serialize};

use crate::core_types::SwitchId;

/// How a switch relates to the balls in its device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MechanismKind {
    /// Momentary switch at the entrance: each activation is one new ball
    Entry,
    /// Settled switch: active while a ball rests on it
    Count,
    /// Confirms inbound transfers only (playfield switches)
    Confirm,
}

impl MechanismKind {
    /// Whether deactivation of this switch means a ball left the device
    #[inline]
    pub fn senses_exit(&self) -> bool {
        matches!(self, MechanismKind::Count)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mechanism {
    pub switch: SwitchId,
    pub kind: MechanismKind,
}

impl Mechanism {
    pub fn new(switch: impl Into<SwitchId>, kind: MechanismKind) -> Self {
        Self {
            switch: switch.into(),
            kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_count_senses_exit() {
        assert!(MechanismKind::Count.senses_exit());
        assert!(!MechanismKind::Entry.senses_exit());
        assert!(!MechanismKind::Confirm.senses_exit());
    }

    #[test]
    fn test_deserialize_from_yaml() {
        let m: Mechanism = serde_yaml::from_str("switch: trough_entry\nkind: entry\n").unwrap();
        assert_eq!(m, Mechanism::new("trough_entry", MechanismKind::Entry));
    }
}
