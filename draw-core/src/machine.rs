use rand::Rng;
use serde::Serialize;
use tracing::{debug, info};

use crate::roster::fallback_message;
use crate::selector::pick_uniform;
use crate::store::EntityStore;
use crate::{DrawError, Gift, GiftId, Participant, ParticipantId, Stage};

/// Identifies the round (and roster epoch) an asynchronous continuation was
/// issued for. Any continuation carrying an older value is ignored.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Round(u64);

impl Round {
    pub fn value(self) -> u64 {
        self.0
    }

    fn next(self) -> Self {
        Round(self.0.wrapping_add(1))
    }
}

/// Returned by [`DrawMachine::start_draw`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundTicket {
    pub round: Round,
    /// False when the outcome is already decided (a single participant left).
    pub animate: bool,
}

/// Everything the message provider needs for one reveal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRequest {
    pub round: Round,
    pub participant_name: String,
    pub gift_number: u32,
    pub gift_description: String,
}

/// The unit of persistence: entities plus the in-flight stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Session {
    pub(crate) store: EntityStore,
    pub(crate) stage: Stage,
    pub(crate) active_participant_id: Option<ParticipantId>,
    pub(crate) active_gift_id: Option<GiftId>,
    pub(crate) pending_message: String,
}

impl Session {
    pub fn new(store: EntityStore) -> Self {
        Self {
            store,
            ..Self::default()
        }
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn active_participant_id(&self) -> Option<ParticipantId> {
        self.active_participant_id
    }

    pub fn active_gift_id(&self) -> Option<GiftId> {
        self.active_gift_id
    }

    pub fn active_participant(&self) -> Option<&Participant> {
        self.active_participant_id.and_then(|id| self.store.participant(id))
    }

    pub fn active_gift(&self) -> Option<&Gift> {
        self.active_gift_id.and_then(|id| self.store.gift(id))
    }

    pub fn pending_message(&self) -> &str {
        &self.pending_message
    }

    pub fn is_finished(&self) -> bool {
        self.store.is_complete()
    }

    pub(crate) fn clear_round(&mut self) {
        self.active_participant_id = None;
        self.active_gift_id = None;
        self.pending_message.clear();
    }
}

/// Owns the session and drives it through the stages of a round.
///
/// All methods leave the session untouched when they return an error.
#[derive(Debug, Clone, Default)]
pub struct DrawMachine {
    session: Session,
    round: Round,
    highlighted: Option<ParticipantId>,
}

impl DrawMachine {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            round: Round::default(),
            highlighted: None,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn stage(&self) -> Stage {
        self.session.stage
    }

    pub fn round(&self) -> Round {
        self.round
    }

    /// Participant currently flashing in the roulette, if one is running.
    pub fn highlighted(&self) -> Option<ParticipantId> {
        self.highlighted
    }

    pub fn is_finished(&self) -> bool {
        self.session.is_finished()
    }

    pub fn start_draw(&mut self) -> Result<RoundTicket, DrawError> {
        self.expect_stage(Stage::Idle)?;
        let remaining = self.session.store.remaining_participants().len();
        // A participant drawn with no gift left could never be matched.
        if remaining == 0 || self.session.store.remaining_gifts().is_empty() {
            return Err(DrawError::NothingToDraw);
        }

        self.session.clear_round();
        self.session.stage = Stage::SelectingParticipant;
        self.highlighted = None;
        self.round = self.round.next();
        info!(round = self.round.0, remaining, "draw started");

        Ok(RoundTicket {
            round: self.round,
            animate: remaining > 1,
        })
    }

    /// One cosmetic roulette frame. The pick is only displayed.
    pub fn roulette_tick<R>(
        &mut self,
        round: Round,
        rng: &mut R,
    ) -> Result<ParticipantId, DrawError>
    where
        R: Rng + ?Sized,
    {
        self.expect_round(round)?;
        self.expect_stage(Stage::SelectingParticipant)?;

        let remaining = self.session.store.remaining_participants();
        let id = pick_uniform(&remaining, rng)?.id;
        self.highlighted = Some(id);
        Ok(id)
    }

    /// The authoritative pick that ends the roulette.
    pub fn finish_selection<R>(
        &mut self,
        round: Round,
        rng: &mut R,
    ) -> Result<ParticipantId, DrawError>
    where
        R: Rng + ?Sized,
    {
        self.expect_round(round)?;
        self.expect_stage(Stage::SelectingParticipant)?;

        let remaining = self.session.store.remaining_participants();
        let id = pick_uniform(&remaining, rng)?.id;

        self.session.active_participant_id = Some(id);
        self.session.stage = Stage::ParticipantAnnounced;
        self.highlighted = Some(id);
        info!(round = round.0, participant = id, "participant announced");
        Ok(id)
    }

    pub fn proceed_to_gift(&mut self) -> Result<(), DrawError> {
        self.expect_stage(Stage::ParticipantAnnounced)?;
        self.session.stage = Stage::AwaitingGiftChoice;
        Ok(())
    }

    pub fn select_gift(&mut self, gift_id: GiftId) -> Result<MessageRequest, DrawError> {
        self.expect_stage(Stage::AwaitingGiftChoice)?;
        let participant = self
            .session
            .active_participant()
            .filter(|p| !p.has_drawn)
            .ok_or(DrawError::NoActiveParticipant)?;
        let gift = self
            .session
            .store
            .gift(gift_id)
            .filter(|g| g.owner_id.is_none())
            .ok_or(DrawError::GiftUnavailable(gift_id))?;

        let participant_id = participant.id;
        let request = MessageRequest {
            round: self.round,
            participant_name: participant.name.clone(),
            gift_number: gift.number,
            gift_description: gift.description.clone(),
        };

        self.session.active_gift_id = Some(gift_id);
        self.session.pending_message.clear();
        self.session.stage = Stage::GiftRevealed;
        info!(
            round = self.round.0,
            participant = participant_id,
            gift = gift_id,
            "gift revealed"
        );
        Ok(request)
    }

    /// Picks the gift on behalf of the active participant.
    pub fn auto_select_gift<R>(&mut self, rng: &mut R) -> Result<MessageRequest, DrawError>
    where
        R: Rng + ?Sized,
    {
        self.expect_stage(Stage::AwaitingGiftChoice)?;
        let remaining = self.session.store.remaining_gifts();
        let gift_id = pick_uniform(&remaining, rng)?.id;
        self.select_gift(gift_id)
    }

    pub fn apply_message(
        &mut self,
        round: Round,
        text: impl Into<String>,
    ) -> Result<(), DrawError> {
        self.expect_round(round)?;
        self.expect_stage(Stage::GiftRevealed)?;

        let mut text = text.into();
        if text.trim().is_empty() {
            text = match (self.session.active_participant(), self.session.active_gift()) {
                (Some(p), Some(g)) => fallback_message(&p.name, g.number),
                _ => return Err(DrawError::NoActiveGift),
            };
        }
        self.session.pending_message = text;
        Ok(())
    }

    pub fn confirm_match(&mut self) -> Result<(ParticipantId, GiftId), DrawError> {
        self.expect_stage(Stage::GiftRevealed)?;
        let participant = self
            .session
            .active_participant_id
            .ok_or(DrawError::NoActiveParticipant)?;
        let gift = self.session.active_gift_id.ok_or(DrawError::NoActiveGift)?;

        self.session.store.confirm_match(participant, gift)?;
        self.session.clear_round();
        self.session.stage = Stage::Idle;
        self.highlighted = None;
        self.round = self.round.next();
        info!(participant, gift, "match confirmed");
        Ok((participant, gift))
    }

    /// Installs a new roster, discarding any round in progress.
    pub fn admin_commit(
        &mut self,
        participants: Vec<Participant>,
        gifts: Vec<Gift>,
    ) -> Result<(), DrawError> {
        self.session.store.replace_all(participants, gifts)?;
        self.abandon_round();
        info!(
            participants = self.session.store.participants().len(),
            gifts = self.session.store.gifts().len(),
            "roster committed"
        );
        Ok(())
    }

    /// Clears every match but keeps the roster.
    pub fn reset(&mut self) {
        self.session.store.reset_matches();
        self.abandon_round();
        info!("all matches reset");
    }

    fn abandon_round(&mut self) {
        if self.session.stage != Stage::Idle {
            debug!(round = self.round.0, stage = ?self.session.stage, "round abandoned");
        }
        self.session.clear_round();
        self.session.stage = Stage::Idle;
        self.highlighted = None;
        self.round = self.round.next();
    }

    fn expect_stage(&self, stage: Stage) -> Result<(), DrawError> {
        if self.session.stage == stage {
            Ok(())
        } else {
            Err(DrawError::WrongStage(self.session.stage))
        }
    }

    fn expect_round(&self, round: Round) -> Result<(), DrawError> {
        if round == self.round {
            Ok(())
        } else {
            Err(DrawError::StaleRound(round.0))
        }
    }
}
