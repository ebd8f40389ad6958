// Async driver around `DrawMachine`.
//
// The engine is the only owner of the session. Operator commands, roulette
// frames and late provider replies all go through the same mutex, and every
// continuation spawned for a round carries that round's token so it turns
// into a no-op once the round is over.

use std::sync::Arc;
use std::time::Duration;

use draw_core::{
    DrawError, DrawMachine, Gift, GiftId, MessageRequest, Participant, ParticipantId, Round,
    RosterDocument, Session, SessionRecord, Stage,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::{DrawConfig, MessagePolicy};
use crate::message::{resolve_message, MessageProvider};
use crate::persist::{PersistError, SaveQueue, StorageStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub roulette_frames: u64,
    pub tick: Duration,
    pub message_policy: MessagePolicy,
    pub message_timeout: Duration,
    pub seed: Option<u64>,
}

impl From<&DrawConfig> for EngineSettings {
    fn from(config: &DrawConfig) -> Self {
        Self {
            roulette_frames: config.roulette_frames(),
            tick: config.tick(),
            message_policy: config.message_policy,
            message_timeout: config.message_timeout(),
            seed: config.seed,
        }
    }
}

/// Operator actions, as sent by the projector UI.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DrawCommand {
    StartDraw,
    ProceedToGift,
    SelectGift { gift_id: GiftId },
    AutoSelectGift,
    ConfirmMatch,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionView {
    pub participants: Vec<Participant>,
    pub gifts: Vec<Gift>,
    pub stage: Stage,
    pub active_participant_id: Option<ParticipantId>,
    pub active_gift_id: Option<GiftId>,
    pub pending_message: String,
    pub message_loading: bool,
    pub highlighted_participant_id: Option<ParticipantId>,
    pub remaining_participants: usize,
    pub remaining_gifts: usize,
    pub finished: bool,
    pub storage_warning: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    State(SessionView),
    Highlight {
        round: u64,
        participant_id: ParticipantId,
    },
    StorageWarning {
        message: String,
    },
    StorageRecovered,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Draw(#[from] DrawError),
    #[error(transparent)]
    Persist(#[from] PersistError),
}

struct Table {
    machine: DrawMachine,
    rng: ChaCha8Rng,
    roulette: Option<JoinHandle<()>>,
}

struct Inner {
    table: Mutex<Table>,
    events: broadcast::Sender<ServerMessage>,
    provider: Arc<dyn MessageProvider>,
    saves: SaveQueue,
    settings: EngineSettings,
}

#[derive(Clone)]
pub struct DrawEngine {
    inner: Arc<Inner>,
}

impl DrawEngine {
    pub fn new(
        session: Session,
        provider: Arc<dyn MessageProvider>,
        saves: SaveQueue,
        settings: EngineSettings,
    ) -> Self {
        let rng = settings
            .seed
            .map(ChaCha8Rng::seed_from_u64)
            .unwrap_or_else(ChaCha8Rng::from_entropy);
        let (events, _) = broadcast::channel(64);
        spawn_status_forwarder(saves.subscribe_status(), events.clone());

        Self {
            inner: Arc::new(Inner {
                table: Mutex::new(Table {
                    machine: DrawMachine::new(session),
                    rng,
                    roulette: None,
                }),
                events,
                provider,
                saves,
                settings,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerMessage> {
        self.inner.events.subscribe()
    }

    pub async fn view(&self) -> SessionView {
        let table = self.inner.table.lock().await;
        self.build_view(&table.machine)
    }

    pub async fn export(&self) -> RosterDocument {
        let table = self.inner.table.lock().await;
        let store = table.machine.session().store();
        RosterDocument {
            participants: store.participants().to_vec(),
            gifts: store.gifts().to_vec(),
        }
    }

    /// Waits for the pending save, if any.
    pub async fn flush(&self) -> Result<(), PersistError> {
        self.inner.saves.flush().await
    }

    /// Runs one operator command. Guard violations leave the session as it was.
    pub async fn dispatch(&self, command: DrawCommand) -> Result<SessionView, DrawError> {
        let result = match command {
            DrawCommand::StartDraw => self.start_draw().await,
            DrawCommand::ProceedToGift => self.proceed_to_gift().await,
            DrawCommand::SelectGift { gift_id } => self.select_gift(Some(gift_id)).await,
            DrawCommand::AutoSelectGift => self.select_gift(None).await,
            DrawCommand::ConfirmMatch => self.confirm_match().await,
        };
        match result {
            Ok(()) => Ok(self.view().await),
            Err(e) => {
                if e == DrawError::EmptyPool {
                    error!(?command, "selector called with an empty pool");
                } else {
                    warn!(?command, "command rejected: {e}");
                }
                Err(e)
            }
        }
    }

    /// Installs a new roster and waits for it to be stored. The roster stays
    /// active in memory even when storage fails.
    pub async fn admin_commit(&self, roster: RosterDocument) -> Result<SessionView, EngineError> {
        {
            let mut table = self.inner.table.lock().await;
            table.machine.admin_commit(roster.participants, roster.gifts)?;
            cancel_roulette(&mut table);
            self.publish(&table);
        }
        self.inner.saves.flush().await?;
        Ok(self.view().await)
    }

    /// Clears every match, keeping the roster.
    pub async fn reset(&self) -> Result<SessionView, EngineError> {
        {
            let mut table = self.inner.table.lock().await;
            table.machine.reset();
            cancel_roulette(&mut table);
            self.publish(&table);
        }
        self.inner.saves.flush().await?;
        Ok(self.view().await)
    }

    async fn start_draw(&self) -> Result<(), DrawError> {
        let mut table = self.inner.table.lock().await;
        let ticket = table.machine.start_draw()?;

        if ticket.animate && self.inner.settings.roulette_frames > 0 {
            let handle = tokio::spawn(self.clone().run_roulette(ticket.round));
            if let Some(previous) = table.roulette.replace(handle) {
                previous.abort();
            }
        } else {
            let Table { machine, rng, .. } = &mut *table;
            machine.finish_selection(ticket.round, rng)?;
        }
        self.publish(&table);
        Ok(())
    }

    async fn run_roulette(self, round: Round) {
        let mut ticker = tokio::time::interval(self.inner.settings.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        for _ in 0..self.inner.settings.roulette_frames {
            ticker.tick().await;
            if !self.roulette_frame(round).await {
                return;
            }
        }
        self.finish_roulette(round).await;
    }

    async fn roulette_frame(&self, round: Round) -> bool {
        let mut table = self.inner.table.lock().await;
        let Table { machine, rng, .. } = &mut *table;
        match machine.roulette_tick(round, rng) {
            Ok(participant_id) => {
                let _ = self.inner.events.send(ServerMessage::Highlight {
                    round: round.value(),
                    participant_id,
                });
                true
            }
            Err(e) => {
                debug!(round = round.value(), "roulette stopped: {e}");
                false
            }
        }
    }

    async fn finish_roulette(&self, round: Round) {
        let mut table = self.inner.table.lock().await;
        let result = {
            let Table { machine, rng, .. } = &mut *table;
            machine.finish_selection(round, rng)
        };
        match result {
            Ok(_) => {
                table.roulette = None;
                self.publish(&table);
            }
            Err(DrawError::EmptyPool) => {
                error!(round = round.value(), "roulette finished with an empty pool")
            }
            Err(e) => debug!(round = round.value(), "discarding roulette result: {e}"),
        }
    }

    async fn proceed_to_gift(&self) -> Result<(), DrawError> {
        let mut table = self.inner.table.lock().await;
        table.machine.proceed_to_gift()?;
        self.publish(&table);
        Ok(())
    }

    async fn select_gift(&self, gift_id: Option<GiftId>) -> Result<(), DrawError> {
        let mut table = self.inner.table.lock().await;
        let request = {
            let Table { machine, rng, .. } = &mut *table;
            match gift_id {
                Some(id) => machine.select_gift(id)?,
                None => machine.auto_select_gift(rng)?,
            }
        };

        match self.inner.settings.message_policy {
            MessagePolicy::Blocking => {
                let text = resolve_message(
                    self.inner.provider.as_ref(),
                    &request,
                    self.inner.settings.message_timeout,
                )
                .await;
                table.machine.apply_message(request.round, text)?;
                self.publish(&table);
            }
            MessagePolicy::FireAndForget => {
                self.publish(&table);
                drop(table);
                let engine = self.clone();
                tokio::spawn(async move { engine.deliver_message(request).await });
            }
        }
        Ok(())
    }

    async fn deliver_message(&self, request: MessageRequest) {
        let text = resolve_message(
            self.inner.provider.as_ref(),
            &request,
            self.inner.settings.message_timeout,
        )
        .await;

        let mut table = self.inner.table.lock().await;
        match table.machine.apply_message(request.round, text) {
            Ok(()) => self.publish(&table),
            Err(e) => debug!(round = request.round.value(), "discarding message: {e}"),
        }
    }

    async fn confirm_match(&self) -> Result<(), DrawError> {
        let mut table = self.inner.table.lock().await;
        let (participant, gift) = table.machine.confirm_match()?;
        if table.machine.is_finished() {
            info!(participant, gift, "last match confirmed, event complete");
        }
        self.publish(&table);
        Ok(())
    }

    /// Schedules a save and pushes the new state to every screen.
    fn publish(&self, table: &Table) {
        self.inner
            .saves
            .schedule(SessionRecord::capture(table.machine.session()));
        let _ = self
            .inner
            .events
            .send(ServerMessage::State(self.build_view(&table.machine)));
    }

    fn build_view(&self, machine: &DrawMachine) -> SessionView {
        let session = machine.session();
        let store = session.store();
        let storage_warning = match self.inner.saves.status() {
            StorageStatus::Healthy => None,
            StorageStatus::Exhausted(message) => Some(message),
        };
        SessionView {
            participants: store.participants().to_vec(),
            gifts: store.gifts().to_vec(),
            stage: session.stage(),
            active_participant_id: session.active_participant_id(),
            active_gift_id: session.active_gift_id(),
            pending_message: session.pending_message().to_string(),
            message_loading: session.stage() == Stage::GiftRevealed
                && session.pending_message().is_empty(),
            highlighted_participant_id: machine.highlighted(),
            remaining_participants: store.remaining_participants().len(),
            remaining_gifts: store.remaining_gifts().len(),
            finished: session.is_finished(),
            storage_warning,
        }
    }
}

fn cancel_roulette(table: &mut Table) {
    if let Some(handle) = table.roulette.take() {
        handle.abort();
        debug!("roulette task cancelled");
    }
}

fn spawn_status_forwarder(
    mut status: watch::Receiver<StorageStatus>,
    events: broadcast::Sender<ServerMessage>,
) {
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let message = match status.borrow_and_update().clone() {
                StorageStatus::Healthy => {
                    info!("storage writes recovered");
                    ServerMessage::StorageRecovered
                }
                StorageStatus::Exhausted(message) => ServerMessage::StorageWarning { message },
            };
            let _ = events.send(message);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::tests::BrokenProvider;
    use crate::message::TemplateProvider;
    use crate::persist::tests::MemoryStore;
    use crate::persist::TieredStore;
    use draw_core::{default_roster, fallback_message, EntityStore};

    fn settings(policy: MessagePolicy) -> EngineSettings {
        EngineSettings {
            roulette_frames: 10,
            tick: Duration::from_millis(80),
            message_policy: policy,
            message_timeout: Duration::from_secs(5),
            seed: Some(11),
        }
    }

    fn engine_with(
        size: u32,
        settings: EngineSettings,
        provider: Arc<dyn MessageProvider>,
        memory: &MemoryStore,
    ) -> DrawEngine {
        let roster = default_roster(size);
        let session = Session::new(EntityStore::new(roster.participants, roster.gifts).unwrap());
        let store = Arc::new(TieredStore::new(vec![Box::new(memory.clone())]));
        let (saves, _) = SaveQueue::spawn(store, Duration::from_millis(300));
        DrawEngine::new(session, provider, saves, settings)
    }

    fn engine(size: u32) -> (DrawEngine, MemoryStore) {
        let memory = MemoryStore::default();
        let provider = Arc::new(TemplateProvider::new(Duration::from_millis(600), Some(3)));
        let engine = engine_with(size, settings(MessagePolicy::FireAndForget), provider, &memory);
        (engine, memory)
    }

    /// Drives a round up to `AwaitingGiftChoice`, letting the roulette finish.
    async fn announce(engine: &DrawEngine) -> ParticipantId {
        engine.dispatch(DrawCommand::StartDraw).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        let view = engine.dispatch(DrawCommand::ProceedToGift).await.unwrap();
        assert_eq!(view.stage, Stage::AwaitingGiftChoice);
        view.active_participant_id.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn roulette_highlights_then_announces() {
        let (engine, _) = engine(4);
        let mut events = engine.subscribe();

        let view = engine.dispatch(DrawCommand::StartDraw).await.unwrap();
        assert_eq!(view.stage, Stage::SelectingParticipant);
        assert_eq!(view.active_participant_id, None);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let view = engine.view().await;
        assert_eq!(view.stage, Stage::ParticipantAnnounced);
        let chosen = view.active_participant_id.unwrap();
        assert!((1..=4).contains(&chosen));

        let mut highlights = 0;
        while let Ok(event) = events.try_recv() {
            if let ServerMessage::Highlight { participant_id, .. } = event {
                assert!((1..=4).contains(&participant_id));
                highlights += 1;
            }
        }
        assert_eq!(highlights, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn single_participant_is_announced_immediately() {
        let (engine, _) = engine(1);
        let view = engine.dispatch(DrawCommand::StartDraw).await.unwrap();
        assert_eq!(view.stage, Stage::ParticipantAnnounced);
        assert_eq!(view.active_participant_id, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn whole_event_completes() {
        let (engine, _) = engine(3);
        for _ in 0..3 {
            announce(&engine).await;
            engine.dispatch(DrawCommand::AutoSelectGift).await.unwrap();
            engine.dispatch(DrawCommand::ConfirmMatch).await.unwrap();
        }
        let view = engine.view().await;
        assert!(view.finished);
        assert_eq!(view.remaining_participants, 0);
        assert_eq!(view.remaining_gifts, 0);
        assert_eq!(
            engine.dispatch(DrawCommand::StartDraw).await,
            Err(DrawError::NothingToDraw)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn short_gift_pool_stops_without_stranding_a_participant() {
        let (engine, _) = engine(3);
        let mut roster = default_roster(3);
        roster.gifts.truncate(1);
        engine.admin_commit(roster).await.unwrap();

        announce(&engine).await;
        engine.dispatch(DrawCommand::AutoSelectGift).await.unwrap();
        engine.dispatch(DrawCommand::ConfirmMatch).await.unwrap();

        assert_eq!(
            engine.dispatch(DrawCommand::StartDraw).await,
            Err(DrawError::NothingToDraw)
        );
        tokio::time::sleep(Duration::from_secs(3)).await;
        let view = engine.view().await;
        assert_eq!(view.stage, Stage::Idle);
        assert_eq!(view.active_participant_id, None);
        assert_eq!(view.remaining_participants, 2);
        assert_eq!(view.remaining_gifts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn message_arrives_after_reveal() {
        let (engine, _) = engine(2);
        let participant = announce(&engine).await;

        let view = engine.dispatch(DrawCommand::SelectGift { gift_id: 2 }).await.unwrap();
        assert_eq!(view.stage, Stage::GiftRevealed);
        assert_eq!(view.active_gift_id, Some(2));
        assert!(view.message_loading);

        tokio::time::sleep(Duration::from_secs(1)).await;
        let view = engine.view().await;
        assert!(!view.message_loading);
        assert!(view.pending_message.contains(&format!("Employee {participant}")));
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_policy_reveals_with_message() {
        let memory = MemoryStore::default();
        let provider = Arc::new(TemplateProvider::new(Duration::from_millis(600), Some(3)));
        let engine = engine_with(2, settings(MessagePolicy::Blocking), provider, &memory);
        announce(&engine).await;

        let view = engine.dispatch(DrawCommand::SelectGift { gift_id: 1 }).await.unwrap();
        assert_eq!(view.stage, Stage::GiftRevealed);
        assert!(!view.pending_message.is_empty());
        assert!(!view.message_loading);
    }

    #[tokio::test(start_paused = true)]
    async fn provider_failure_uses_fallback() {
        let memory = MemoryStore::default();
        let engine = engine_with(
            1,
            settings(MessagePolicy::FireAndForget),
            Arc::new(BrokenProvider),
            &memory,
        );
        engine.dispatch(DrawCommand::StartDraw).await.unwrap();
        engine.dispatch(DrawCommand::ProceedToGift).await.unwrap();
        engine.dispatch(DrawCommand::SelectGift { gift_id: 1 }).await.unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(engine.view().await.pending_message, fallback_message("Employee 1", 1));
    }

    #[tokio::test(start_paused = true)]
    async fn late_message_is_not_applied_to_next_round() {
        let (engine, _) = engine(3);
        announce(&engine).await;
        engine.dispatch(DrawCommand::SelectGift { gift_id: 1 }).await.unwrap();
        // Confirm before the provider answers.
        engine.dispatch(DrawCommand::ConfirmMatch).await.unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        let view = engine.view().await;
        assert_eq!(view.stage, Stage::Idle);
        assert_eq!(view.pending_message, "");
    }

    #[tokio::test(start_paused = true)]
    async fn stale_gift_click_is_rejected() {
        let (engine, _) = engine(3);
        announce(&engine).await;
        engine.dispatch(DrawCommand::SelectGift { gift_id: 1 }).await.unwrap();
        engine.dispatch(DrawCommand::ConfirmMatch).await.unwrap();

        announce(&engine).await;
        assert_eq!(
            engine.dispatch(DrawCommand::SelectGift { gift_id: 1 }).await,
            Err(DrawError::GiftUnavailable(1))
        );
        engine.dispatch(DrawCommand::SelectGift { gift_id: 2 }).await.unwrap();
        assert!(engine.dispatch(DrawCommand::SelectGift { gift_id: 3 }).await.is_err());
        assert_eq!(engine.view().await.active_gift_id, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn admin_commit_cancels_running_roulette() {
        let (engine, _) = engine(3);
        engine.dispatch(DrawCommand::StartDraw).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let roster = default_roster(5);
        let view = engine.admin_commit(roster).await.unwrap();
        assert_eq!(view.stage, Stage::Idle);
        assert_eq!(view.participants.len(), 5);

        tokio::time::sleep(Duration::from_secs(5)).await;
        let view = engine.view().await;
        assert_eq!(view.stage, Stage::Idle);
        assert_eq!(view.active_participant_id, None);
    }

    #[tokio::test(start_paused = true)]
    async fn admin_commit_while_choosing_gift_discards_round() {
        let (engine, memory) = engine(3);
        announce(&engine).await;

        let mut roster = default_roster(2);
        roster.gifts[0].owner_id = Some(1);
        let view = engine.admin_commit(roster).await.unwrap();

        assert_eq!(view.stage, Stage::Idle);
        assert_eq!(view.active_participant_id, None);
        assert_eq!(view.active_gift_id, None);
        assert_eq!(view.remaining_gifts, 2);
        // The commit is on disk before the call returns.
        assert_eq!(memory.last().unwrap().participants.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn storage_failure_is_surfaced_but_play_continues() {
        let (engine, memory) = engine(2);
        memory.set_failing(true);
        let mut events = engine.subscribe();

        announce(&engine).await;
        let before = engine.view().await;
        assert!(matches!(engine.flush().await, Err(PersistError::StorageExhausted(_))));

        let view = engine.view().await;
        assert!(view.storage_warning.is_some());
        assert_eq!(view.stage, before.stage);
        assert_eq!(view.active_participant_id, before.active_participant_id);

        tokio::time::sleep(Duration::from_millis(10)).await;
        let mut warned = false;
        while let Ok(event) = events.try_recv() {
            warned |= matches!(event, ServerMessage::StorageWarning { .. });
        }
        assert!(warned);

        // Still playable in memory.
        engine.dispatch(DrawCommand::AutoSelectGift).await.unwrap();
        engine.dispatch(DrawCommand::ConfirmMatch).await.unwrap();
        assert_eq!(engine.view().await.remaining_participants, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_clears_matches() {
        let (engine, _) = engine(2);
        announce(&engine).await;
        engine.dispatch(DrawCommand::AutoSelectGift).await.unwrap();
        engine.dispatch(DrawCommand::ConfirmMatch).await.unwrap();

        let view = engine.reset().await.unwrap();
        assert_eq!(view.remaining_participants, 2);
        assert_eq!(view.remaining_gifts, 2);
        assert_eq!(view.stage, Stage::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn changes_are_persisted_after_debounce() {
        let (engine, memory) = engine(2);
        announce(&engine).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        let last = memory.last().unwrap();
        assert_eq!(last.stage, Stage::AwaitingGiftChoice);
        assert!(last.active_participant_id.is_some());
    }

    #[test]
    fn commands_use_tagged_json() {
        let command: DrawCommand =
            serde_json::from_str(r#"{"action":"select_gift","gift_id":4}"#).unwrap();
        assert_eq!(command, DrawCommand::SelectGift { gift_id: 4 });
        let command: DrawCommand = serde_json::from_str(r#"{"action":"start_draw"}"#).unwrap();
        assert_eq!(command, DrawCommand::StartDraw);
    }
}
