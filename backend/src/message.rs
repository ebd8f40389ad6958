// Celebratory reveal messages.
//
// The engine only depends on `MessageProvider`; whatever a provider does
// (templates, a remote text generator) may fail, and `resolve_message` turns
// every failure into the deterministic fallback line.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use draw_core::{fallback_message, MessageRequest};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("message provider failed: {0}")]
    Failed(String),
    #[error("message provider returned no text")]
    Empty,
    #[error("message provider timed out after {0:?}")]
    TimedOut(Duration),
}

#[async_trait]
pub trait MessageProvider: Send + Sync {
    async fn generate(
        &self,
        participant_name: &str,
        gift_number: u32,
        gift_description: &str,
    ) -> Result<String, ProviderError>;
}

const TEMPLATES: &[&str] = &[
    "Congratulations {name}! Gift #{number} is all yours!",
    "{name} unwraps Gift #{number}. Enjoy! 🎁",
    "Merry Christmas, {name}! Gift #{number} goes home with you! 🎄",
    "Ho ho ho! {name} picked Gift #{number}! 🎅",
    "Look at that: Gift #{number} belongs to {name} now!",
    "{name}'s lucky number tonight is #{number}! ✨",
    "A fine choice, {name}. Gift #{number} is waiting for you!",
    "Gift #{number} has found its new home with {name}!",
];

/// Offline provider filling one of a fixed set of templates.
pub struct TemplateProvider {
    delay: Duration,
    rng: Mutex<ChaCha8Rng>,
}

impl TemplateProvider {
    pub fn new(delay: Duration, seed: Option<u64>) -> Self {
        let rng = seed
            .map(ChaCha8Rng::seed_from_u64)
            .unwrap_or_else(ChaCha8Rng::from_entropy);
        Self {
            delay,
            rng: Mutex::new(rng),
        }
    }

    fn pick_template(&self) -> Result<&'static str, ProviderError> {
        let mut rng = self
            .rng
            .lock()
            .map_err(|_| ProviderError::Failed("template rng poisoned".to_string()))?;
        TEMPLATES.choose(&mut *rng).copied().ok_or(ProviderError::Empty)
    }
}

#[async_trait]
impl MessageProvider for TemplateProvider {
    async fn generate(
        &self,
        participant_name: &str,
        gift_number: u32,
        _gift_description: &str,
    ) -> Result<String, ProviderError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let template = self.pick_template()?;
        Ok(template
            .replace("{name}", participant_name)
            .replace("{number}", &gift_number.to_string()))
    }
}

/// Runs the provider for one reveal. Never fails.
pub async fn resolve_message(
    provider: &dyn MessageProvider,
    request: &MessageRequest,
    timeout: Duration,
) -> String {
    let call = provider.generate(
        &request.participant_name,
        request.gift_number,
        &request.gift_description,
    );
    let outcome = match tokio::time::timeout(timeout, call).await {
        Ok(Ok(text)) if !text.trim().is_empty() => Ok(text),
        Ok(Ok(_)) => Err(ProviderError::Empty),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(ProviderError::TimedOut(timeout)),
    };

    match outcome {
        Ok(text) => {
            debug!(round = request.round.value(), "message generated");
            text
        }
        Err(e) => {
            warn!(round = request.round.value(), "{e}; using fallback message");
            fallback_message(&request.participant_name, request.gift_number)
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use draw_core::{DrawMachine, EntityStore, Gift, Participant, Session};

    /// Provider that always fails, for exercising the fallback path.
    pub(crate) struct BrokenProvider;

    #[async_trait]
    impl MessageProvider for BrokenProvider {
        async fn generate(&self, _: &str, _: u32, _: &str) -> Result<String, ProviderError> {
            Err(ProviderError::Failed("service unavailable".into()))
        }
    }

    struct SlowProvider;

    #[async_trait]
    impl MessageProvider for SlowProvider {
        async fn generate(&self, _: &str, _: u32, _: &str) -> Result<String, ProviderError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok("too late".into())
        }
    }

    fn request() -> MessageRequest {
        let store = EntityStore::new(
            vec![Participant::new(1, "Ana")],
            vec![Gift::new(1, 7, "mug")],
        )
        .unwrap();
        let mut machine = DrawMachine::new(Session::new(store));
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let ticket = machine.start_draw().unwrap();
        machine.finish_selection(ticket.round, &mut rng).unwrap();
        machine.proceed_to_gift().unwrap();
        machine.select_gift(1).unwrap()
    }

    #[tokio::test]
    async fn template_embeds_name_and_number() {
        let provider = TemplateProvider::new(Duration::ZERO, Some(1));
        for _ in 0..20 {
            let text = provider.generate("Ana", 7, "mug").await.unwrap();
            assert!(text.contains("Ana"), "{text}");
            assert!(text.contains("#7"), "{text}");
        }
    }

    #[tokio::test]
    async fn failure_maps_to_fallback() {
        let text = resolve_message(&BrokenProvider, &request(), Duration::from_secs(1)).await;
        assert_eq!(text, fallback_message("Ana", 7));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_maps_to_fallback() {
        let text = resolve_message(&SlowProvider, &request(), Duration::from_millis(500)).await;
        assert_eq!(text, fallback_message("Ana", 7));
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_template_still_resolves() {
        let provider = TemplateProvider::new(Duration::from_millis(600), Some(9));
        let text = resolve_message(&provider, &request(), Duration::from_secs(5)).await;
        assert!(text.contains("Ana"));
    }
}
