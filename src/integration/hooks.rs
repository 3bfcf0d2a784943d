//! Orchestrator event hooks
//!
//! External collaborators (a voice gateway, a UI, tests) observe the
//! conversation through [`EventHooks`]. [`ChannelEventHooks`] turns the hooks
//! into a stream of serializable [`OrchestratorEvent`]s.

use crate::messages::{ConversationTurn, SpeakerId, SpeechSession};
use crate::speech::audio_manager::SpeechOutcome;
use async_trait::async_trait;
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

/// Callbacks for the whole turn and speech lifecycle
///
/// All methods default to no-ops. Errors and panics are logged and never
/// interrupt the conversation.
#[async_trait]
pub trait EventHooks: Send + Sync {
    async fn on_turn_start(&self, _turn: &ConversationTurn) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_turn_block(&self, _turn: &ConversationTurn, _block: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_turn_complete(&self, _turn: &ConversationTurn) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_speech_start(&self, _session: &SpeechSession) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_speech_end(
        &self,
        _session: &SpeechSession,
        _outcome: &SpeechOutcome,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct NoopEventHooks;

impl EventHooks for NoopEventHooks {}

/// Events published by [`ChannelEventHooks`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    TurnStarted {
        turn_id: Uuid,
        speaker_id: SpeakerId,
        display_name: String,
        text: String,
    },

    TurnBlock {
        turn_id: Uuid,
        text: String,
    },

    TurnCompleted {
        turn_id: Uuid,
    },

    SpeechStarted {
        session_id: Uuid,
        turn_id: Option<Uuid>,
        speaker_id: SpeakerId,
    },

    SpeechEnded {
        session_id: Uuid,
        turn_id: Option<Uuid>,
        outcome: SpeechOutcome,
    },
}

/// Hooks publishing every callback on a crossbeam channel
#[derive(Clone)]
pub struct ChannelEventHooks {
    tx: Sender<OrchestratorEvent>,
}

/// Create hooks and the receiver for their events
pub fn event_channel() -> (ChannelEventHooks, Receiver<OrchestratorEvent>) {
    let (tx, rx) = unbounded();
    (ChannelEventHooks { tx }, rx)
}

impl ChannelEventHooks {
    fn publish(&self, event: OrchestratorEvent) {
        if self.tx.send(event).is_err() {
            debug!("Event receiver dropped");
        }
    }
}

#[async_trait]
impl EventHooks for ChannelEventHooks {
    async fn on_turn_start(&self, turn: &ConversationTurn) -> anyhow::Result<()> {
        self.publish(OrchestratorEvent::TurnStarted {
            turn_id: turn.id,
            speaker_id: turn.speaker_id.clone(),
            display_name: turn.display_name.clone(),
            text: turn.utterance_text.clone(),
        });
        Ok(())
    }

    async fn on_turn_block(&self, turn: &ConversationTurn, block: &str) -> anyhow::Result<()> {
        self.publish(OrchestratorEvent::TurnBlock {
            turn_id: turn.id,
            text: block.to_string(),
        });
        Ok(())
    }

    async fn on_turn_complete(&self, turn: &ConversationTurn) -> anyhow::Result<()> {
        self.publish(OrchestratorEvent::TurnCompleted { turn_id: turn.id });
        Ok(())
    }

    async fn on_speech_start(&self, session: &SpeechSession) -> anyhow::Result<()> {
        self.publish(OrchestratorEvent::SpeechStarted {
            session_id: session.id,
            turn_id: session.turn_id,
            speaker_id: session.speaker_id.clone(),
        });
        Ok(())
    }

    async fn on_speech_end(
        &self,
        session: &SpeechSession,
        outcome: &SpeechOutcome,
    ) -> anyhow::Result<()> {
        self.publish(OrchestratorEvent::SpeechEnded {
            session_id: session.id,
            turn_id: session.turn_id,
            outcome: outcome.clone(),
        });
        Ok(())
    }
}
