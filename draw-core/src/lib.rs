use serde::{Deserialize, Serialize};
use thiserror::Error;

mod machine;
mod record;
mod roster;
mod selector;
mod store;

pub use machine::{DrawMachine, MessageRequest, Round, RoundTicket, Session};
pub use record::{RecordError, SessionRecord, RECORD_VERSION};
pub use roster::{default_roster, fallback_message, RosterDocument, DEFAULT_ROSTER_SIZE};
pub use selector::pick_uniform;
pub use store::EntityStore;

pub type ParticipantId = u32;
pub type GiftId = u32;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Participant {
    pub id: ParticipantId,
    pub name: String,
    #[serde(default, alias = "photoUrl", skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
    #[serde(default, alias = "hasDrawn")]
    pub has_drawn: bool,
}

impl Participant {
    pub fn new(id: ParticipantId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            photo_url: None,
            has_drawn: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Gift {
    pub id: GiftId,
    /// Label shown on the gift table; not required to match `id`.
    pub number: u32,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "photoUrl", skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
    #[serde(default)]
    pub revealed: bool,
    #[serde(default, alias = "ownerId")]
    pub owner_id: Option<ParticipantId>,
}

impl Gift {
    pub fn new(id: GiftId, number: u32, description: impl Into<String>) -> Self {
        Self {
            id,
            number,
            description: description.into(),
            photo_url: None,
            revealed: false,
            owner_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    Idle,
    SelectingParticipant,
    ParticipantAnnounced,
    AwaitingGiftChoice,
    GiftRevealed,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DrawError {
    #[error("candidate pool is empty")]
    EmptyPool,
    #[error("no participants left to draw")]
    NothingToDraw,
    #[error("cannot match participant {participant} with gift {gift}")]
    InvalidMatch {
        participant: ParticipantId,
        gift: GiftId,
    },
    #[error("action not allowed while {0:?}")]
    WrongStage(Stage),
    #[error("no active participant")]
    NoActiveParticipant,
    #[error("no active gift")]
    NoActiveGift,
    #[error("gift {0} is not available")]
    GiftUnavailable(GiftId),
    #[error("round {0} has been superseded")]
    StaleRound(u64),
    #[error("duplicate participant id {0}")]
    DuplicateParticipant(ParticipantId),
    #[error("duplicate gift id {0}")]
    DuplicateGift(GiftId),
}
