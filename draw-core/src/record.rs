use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::machine::Session;
use crate::roster::fallback_message;
use crate::store::EntityStore;
use crate::{Gift, GiftId, Participant, ParticipantId, Stage};

pub const RECORD_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("malformed session record: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("session record version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u64, supported: u32 },
}

/// Persisted form of a [`Session`].
///
/// Stored records are never trusted as-is: [`SessionRecord::into_session`]
/// repairs the matching and the stage before anything is resumed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionRecord {
    #[serde(default)]
    pub version: u32,
    /// Unix time in milliseconds when the record was captured.
    #[serde(default)]
    pub saved_at: u64,
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub gifts: Vec<Gift>,
    #[serde(default)]
    pub stage: Stage,
    #[serde(default)]
    pub active_participant_id: Option<ParticipantId>,
    #[serde(default)]
    pub active_gift_id: Option<GiftId>,
    #[serde(default)]
    pub pending_message: String,
}

/// Shape written by the browser-only version of the drawing tool.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyRecord {
    #[serde(default)]
    people: Vec<Participant>,
    #[serde(default)]
    gifts: Vec<Gift>,
    #[serde(default)]
    saved_stage: Option<String>,
    #[serde(default)]
    saved_current_person_id: Option<ParticipantId>,
    #[serde(default)]
    saved_current_gift_id: Option<GiftId>,
    #[serde(default)]
    saved_ai_message: Option<String>,
}

impl From<LegacyRecord> for SessionRecord {
    fn from(legacy: LegacyRecord) -> Self {
        let stage = match legacy.saved_stage.as_deref() {
            Some("SELECTING_PERSON") => Stage::SelectingParticipant,
            Some("PERSON_ANNOUNCEMENT") => Stage::ParticipantAnnounced,
            Some("PERSON_SELECTED") => Stage::AwaitingGiftChoice,
            Some("GIFT_REVEALED") => Stage::GiftRevealed,
            _ => Stage::Idle,
        };
        SessionRecord {
            version: RECORD_VERSION,
            saved_at: 0,
            participants: legacy.people,
            gifts: legacy.gifts,
            stage,
            active_participant_id: legacy.saved_current_person_id,
            active_gift_id: legacy.saved_current_gift_id,
            pending_message: legacy.saved_ai_message.unwrap_or_default(),
        }
    }
}

impl SessionRecord {
    pub fn capture(session: &Session) -> Self {
        let saved_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            version: RECORD_VERSION,
            saved_at,
            participants: session.store.participants().to_vec(),
            gifts: session.store.gifts().to_vec(),
            stage: session.stage,
            active_participant_id: session.active_participant_id,
            active_gift_id: session.active_gift_id,
            pending_message: session.pending_message.clone(),
        }
    }

    /// Parses any known record version and migrates it to the current one.
    pub fn from_json(bytes: &[u8]) -> Result<Self, RecordError> {
        let value: Value = serde_json::from_slice(bytes)?;
        let version = value.get("version").and_then(Value::as_u64);

        let mut record = match version {
            Some(found) if found > u64::from(RECORD_VERSION) => {
                return Err(RecordError::UnsupportedVersion {
                    found,
                    supported: RECORD_VERSION,
                })
            }
            None if value.get("people").is_some() => {
                info!("migrating legacy session record");
                SessionRecord::from(serde_json::from_value::<LegacyRecord>(value)?)
            }
            _ => serde_json::from_value::<SessionRecord>(value)?,
        };
        record.version = RECORD_VERSION;
        Ok(record)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, RecordError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Rebuilds a consistent session from whatever was stored.
    pub fn into_session(self) -> Session {
        let mut seen = HashSet::new();
        let mut participants: Vec<Participant> = self
            .participants
            .into_iter()
            .filter(|p| {
                let fresh = seen.insert(p.id);
                if !fresh {
                    warn!(participant = p.id, "dropping duplicate participant");
                }
                fresh
            })
            .collect();

        seen.clear();
        let mut gifts: Vec<Gift> = self
            .gifts
            .into_iter()
            .filter(|g| {
                let fresh = seen.insert(g.id);
                if !fresh {
                    warn!(gift = g.id, "dropping duplicate gift");
                }
                fresh
            })
            .collect();

        let known: HashSet<ParticipantId> = participants.iter().map(|p| p.id).collect();
        let mut owners = HashSet::new();
        for gift in &mut gifts {
            if let Some(owner) = gift.owner_id {
                if !known.contains(&owner) || !owners.insert(owner) {
                    warn!(gift = gift.id, owner, "clearing inconsistent gift owner");
                    gift.owner_id = None;
                }
            }
            gift.revealed = gift.owner_id.is_some();
        }
        for participant in &mut participants {
            let drawn = owners.contains(&participant.id);
            if participant.has_drawn != drawn {
                warn!(participant = participant.id, drawn, "repairing drawn flag");
            }
            participant.has_drawn = drawn;
        }

        let mut session = Session::new(EntityStore::from_parts(participants, gifts));
        session.stage = self.stage;
        session.active_participant_id = self.active_participant_id;
        session.active_gift_id = self.active_gift_id;
        session.pending_message = self.pending_message;
        normalize_stage(&mut session);
        session
    }
}

fn normalize_stage(session: &mut Session) {
    let participant_free = session.active_participant().is_some_and(|p| !p.has_drawn);
    let gift_free = session.active_gift().is_some_and(|g| g.owner_id.is_none());
    let gifts_left = !session.store.remaining_gifts().is_empty();

    let stage = match session.stage {
        stage @ (Stage::ParticipantAnnounced | Stage::AwaitingGiftChoice)
            if participant_free && gifts_left =>
        {
            stage
        }
        Stage::GiftRevealed if participant_free && gift_free => Stage::GiftRevealed,
        Stage::GiftRevealed if participant_free && gifts_left => Stage::AwaitingGiftChoice,
        _ => Stage::Idle,
    };
    if stage != session.stage {
        info!(from = ?session.stage, to = ?stage, "normalized resumed stage");
    }
    session.stage = stage;

    match stage {
        Stage::Idle | Stage::SelectingParticipant => session.clear_round(),
        Stage::ParticipantAnnounced | Stage::AwaitingGiftChoice => {
            session.active_gift_id = None;
            session.pending_message.clear();
        }
        Stage::GiftRevealed => {
            if session.pending_message.trim().is_empty() {
                // The provider call was in flight when the record was written.
                let fallback = match (session.active_participant(), session.active_gift()) {
                    (Some(p), Some(g)) => fallback_message(&p.name, g.number),
                    _ => return,
                };
                session.pending_message = fallback;
            }
        }
    }
}
