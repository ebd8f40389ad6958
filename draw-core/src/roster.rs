use serde::{Deserialize, Serialize};

use crate::{Gift, Participant};

pub const DEFAULT_ROSTER_SIZE: u32 = 45;

/// Import/export format of the admin editor.
///
/// Match flags may be present in a file but are never trusted; committing a
/// document always starts a fresh event.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RosterDocument {
    #[serde(default, alias = "people")]
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub gifts: Vec<Gift>,
}

/// Placeholder roster used when nothing has been stored yet.
pub fn default_roster(size: u32) -> RosterDocument {
    RosterDocument {
        participants: (1..=size)
            .map(|i| Participant::new(i, format!("Employee {i}")))
            .collect(),
        gifts: (1..=size)
            .map(|i| Gift::new(i, i, format!("Mystery Gift #{i} - a surprise awaits!")))
            .collect(),
    }
}

/// Deterministic celebratory line used whenever a generated one is missing.
pub fn fallback_message(participant_name: &str, gift_number: u32) -> String {
    format!("Congratulations {participant_name}! Gift #{gift_number} is yours!")
}
