use std::collections::HashSet;

use serde::Serialize;

use crate::{DrawError, Gift, GiftId, Participant, ParticipantId};

/// Participants and gifts together with their assignment state.
///
/// The only ways to change assignment state are [`EntityStore::confirm_match`]
/// and [`EntityStore::replace_all`], so the drawn participants and the owned
/// gifts always form a strict one-to-one matching.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EntityStore {
    participants: Vec<Participant>,
    gifts: Vec<Gift>,
}

impl EntityStore {
    /// Build a store for a fresh event. Match flags on the input are ignored.
    pub fn new(participants: Vec<Participant>, gifts: Vec<Gift>) -> Result<Self, DrawError> {
        let mut store = Self::default();
        store.replace_all(participants, gifts)?;
        Ok(store)
    }

    /// Trusts the flags as given. Callers must have repaired the matching first.
    pub(crate) fn from_parts(participants: Vec<Participant>, gifts: Vec<Gift>) -> Self {
        Self {
            participants,
            gifts,
        }
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn gifts(&self) -> &[Gift] {
        &self.gifts
    }

    pub fn participant(&self, id: ParticipantId) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == id)
    }

    pub fn gift(&self, id: GiftId) -> Option<&Gift> {
        self.gifts.iter().find(|g| g.id == id)
    }

    pub fn remaining_participants(&self) -> Vec<&Participant> {
        self.participants.iter().filter(|p| !p.has_drawn).collect()
    }

    pub fn remaining_gifts(&self) -> Vec<&Gift> {
        self.gifts.iter().filter(|g| g.owner_id.is_none()).collect()
    }

    pub fn is_complete(&self) -> bool {
        self.participants.iter().all(|p| p.has_drawn)
            && self.gifts.iter().all(|g| g.owner_id.is_some())
    }

    pub fn confirm_match(
        &mut self,
        participant_id: ParticipantId,
        gift_id: GiftId,
    ) -> Result<(), DrawError> {
        let invalid = DrawError::InvalidMatch {
            participant: participant_id,
            gift: gift_id,
        };

        let participant_index = self
            .participants
            .iter()
            .position(|p| p.id == participant_id && !p.has_drawn)
            .ok_or_else(|| invalid.clone())?;
        let gift_index = self
            .gifts
            .iter()
            .position(|g| g.id == gift_id && g.owner_id.is_none())
            .ok_or(invalid)?;

        // Both indices are validated, so the two writes cannot diverge.
        self.participants[participant_index].has_drawn = true;
        let gift = &mut self.gifts[gift_index];
        gift.owner_id = Some(participant_id);
        gift.revealed = true;
        Ok(())
    }

    pub fn replace_all(
        &mut self,
        participants: Vec<Participant>,
        gifts: Vec<Gift>,
    ) -> Result<(), DrawError> {
        let mut seen = HashSet::new();
        for participant in &participants {
            if !seen.insert(participant.id) {
                return Err(DrawError::DuplicateParticipant(participant.id));
            }
        }
        seen.clear();
        for gift in &gifts {
            if !seen.insert(gift.id) {
                return Err(DrawError::DuplicateGift(gift.id));
            }
        }

        self.participants = participants
            .into_iter()
            .map(|p| Participant {
                has_drawn: false,
                ..p
            })
            .collect();
        self.gifts = gifts
            .into_iter()
            .map(|g| Gift {
                revealed: false,
                owner_id: None,
                ..g
            })
            .collect();
        Ok(())
    }

    /// Clears every match while keeping the roster.
    pub fn reset_matches(&mut self) {
        for participant in &mut self.participants {
            participant.has_drawn = false;
        }
        for gift in &mut self.gifts {
            gift.revealed = false;
            gift.owner_id = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster(n: u32) -> EntityStore {
        let participants = (1..=n).map(|i| Participant::new(i, format!("p{i}"))).collect();
        let gifts = (1..=n).map(|i| Gift::new(i, i, format!("gift-{i}"))).collect();
        EntityStore::new(participants, gifts).unwrap()
    }

    #[test]
    fn confirm_match_marks_both_sides() {
        let mut store = roster(3);
        store.confirm_match(2, 3).unwrap();

        assert!(store.participant(2).unwrap().has_drawn);
        let gift = store.gift(3).unwrap();
        assert_eq!(gift.owner_id, Some(2));
        assert!(gift.revealed);

        let remaining: Vec<_> = store.remaining_participants().iter().map(|p| p.id).collect();
        assert_eq!(remaining, vec![1, 3]);
        let remaining: Vec<_> = store.remaining_gifts().iter().map(|g| g.id).collect();
        assert_eq!(remaining, vec![1, 2]);
    }

    #[test]
    fn confirm_match_twice_is_rejected_without_changes() {
        let mut store = roster(2);
        store.confirm_match(1, 1).unwrap();
        let before = store.clone();

        let err = store.confirm_match(1, 1).unwrap_err();
        assert_eq!(
            err,
            DrawError::InvalidMatch {
                participant: 1,
                gift: 1
            }
        );
        assert_eq!(store, before);
    }

    #[test]
    fn confirm_match_is_atomic_when_one_side_is_taken() {
        let mut store = roster(2);
        store.confirm_match(1, 1).unwrap();

        // Participant 2 is free, gift 1 is not: nothing may change.
        assert!(store.confirm_match(2, 1).is_err());
        assert!(!store.participant(2).unwrap().has_drawn);

        // Unknown ids are rejected too.
        assert!(store.confirm_match(9, 2).is_err());
        assert!(store.confirm_match(2, 9).is_err());
        assert_eq!(store.gift(2).unwrap().owner_id, None);
    }

    #[test]
    fn replace_all_ignores_incoming_flags() {
        let mut store = roster(1);
        let participants = vec![Participant {
            has_drawn: true,
            ..Participant::new(7, "alice")
        }];
        let gifts = vec![Gift {
            revealed: true,
            owner_id: Some(7),
            ..Gift::new(4, 12, "socks")
        }];

        store.replace_all(participants, gifts).unwrap();

        assert!(!store.participant(7).unwrap().has_drawn);
        let gift = store.gift(4).unwrap();
        assert_eq!(gift.owner_id, None);
        assert!(!gift.revealed);
        assert_eq!(gift.number, 12);
    }

    #[test]
    fn replace_all_rejects_duplicates_and_keeps_old_roster() {
        let mut store = roster(2);
        let before = store.clone();

        let err = store
            .replace_all(vec![Participant::new(1, "a"), Participant::new(1, "b")], vec![])
            .unwrap_err();
        assert_eq!(err, DrawError::DuplicateParticipant(1));

        let err = store
            .replace_all(vec![], vec![Gift::new(3, 1, "x"), Gift::new(3, 2, "y")])
            .unwrap_err();
        assert_eq!(err, DrawError::DuplicateGift(3));

        assert_eq!(store, before);
    }

    #[test]
    fn complete_once_every_pair_is_matched() {
        let mut store = roster(2);
        assert!(!store.is_complete());
        store.confirm_match(1, 2).unwrap();
        store.confirm_match(2, 1).unwrap();
        assert!(store.is_complete());

        store.reset_matches();
        assert_eq!(store.remaining_participants().len(), 2);
        assert_eq!(store.remaining_gifts().len(), 2);
    }
}
