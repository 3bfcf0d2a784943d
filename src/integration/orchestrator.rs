//! Orchestrator for the turn-taking voice agent
//!
//! Connects all components: Capture -> Bridge -> Conversation -> Engine ->
//! Audio manager -> Playback. Barge-in speech captured while the agent talks
//! is replayed into the conversation once the speech ends.

use crate::audio::playback::PlaybackDevice;
use crate::integration::config::{BargeInAction, ColloquyConfig};
use crate::integration::hooks::{EventHooks, NoopEventHooks};
use crate::llm::conversation::{
    ConversationManager, ConversationStatus, ConversationWorker, TurnHooks,
};
use crate::llm::engine::GenerationEngine;
use crate::messages::{
    ConversationTurn, FragmentEvent, PendingUtterance, SpeakerId, SpeechSession,
};
use crate::speech::audio_manager::{AudioManager, SpeechHooks, SpeechOutcome};
use crate::speech::synthesis::SynthesisEngine;
use crate::utils::bridge::{FragmentBridge, FragmentSubmitter};
use crate::utils::hooks::guard_hook;
use crate::{ColloquyError, Result};
use async_trait::async_trait;
use futures::channel::mpsc as block_channel;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Cloneable capture entrypoint, safe to use from any thread
#[derive(Clone)]
pub struct CaptureSink {
    submitter: FragmentSubmitter,
}

impl CaptureSink {
    /// Hand a recognized fragment to the orchestrator
    ///
    /// Whitespace-only text is ignored.
    pub fn capture(
        &self,
        speaker_id: impl Into<SpeakerId>,
        display_name: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<()> {
        let event = FragmentEvent::new(speaker_id, display_name, text);
        if event.is_blank() {
            return Ok(());
        }
        self.submitter.submit(event)
    }
}

/// Point-in-time view of the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorStatus {
    pub speaking: bool,
    pub has_playback_device: bool,
    /// Speakers with barge-in speech waiting for the agent to finish
    pub pending_barge_in: usize,
    pub queued_fragments: usize,
    pub dropped_fragments: u64,
    pub conversation: ConversationStatus,
}

/// Main orchestrator that coordinates all components
pub struct Orchestrator {
    config: ColloquyConfig,
    bridge: Arc<FragmentBridge>,
    conversation: ConversationManager,
    worker: Mutex<Option<ConversationWorker>>,
    audio: Arc<AudioManager>,
    hooks: Arc<dyn EventHooks>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    fn new(
        config: ColloquyConfig,
        generation: Arc<dyn GenerationEngine>,
        synthesis: Arc<dyn SynthesisEngine>,
        hooks: Arc<dyn EventHooks>,
        device: Option<Arc<dyn PlaybackDevice>>,
    ) -> Result<Self> {
        config.validate()?;

        let bridge = Arc::new(FragmentBridge::new(config.bridge.clone()));
        let (conversation, worker) =
            ConversationManager::new(config.conversation.clone(), generation);

        let audio = Arc::new(AudioManager::new(
            config.audio.clone(),
            config.chunker.clone(),
            synthesis,
        ));
        audio.set_hooks(Arc::new(SpeechRouter {
            conversation: conversation.clone(),
            hooks: hooks.clone(),
        }));
        if let Some(device) = device {
            audio.set_playback_device(device);
        }

        Ok(Self {
            config,
            bridge,
            conversation,
            worker: Mutex::new(Some(worker)),
            audio,
            hooks,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    /// Start the fragment pump and the conversation worker
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        tokio::runtime::Handle::try_current()
            .map_err(|e| ColloquyError::ChannelError(format!("No async runtime: {}", e)))?;

        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ColloquyError::ChannelError(
                "Orchestrator already started".into(),
            ));
        }

        let worker = self
            .worker
            .lock()
            .take()
            .ok_or_else(|| ColloquyError::ChannelError("Conversation worker missing".into()))?;

        let router = Arc::new(TurnRouter {
            audio: self.audio.clone(),
            hooks: self.hooks.clone(),
            active: Mutex::new(None),
        });
        let worker_task = worker.start(router);

        let pump_task = tokio::spawn(pump(
            self.bridge.clone(),
            self.audio.clone(),
            self.conversation.clone(),
            self.config.barge_in,
        ));

        self.tasks.lock().extend([pump_task, worker_task]);
        info!("Orchestrator started (barge-in: {:?})", self.config.barge_in);
        Ok(())
    }

    /// Handle for the capture thread
    pub fn capture_sink(&self) -> CaptureSink {
        CaptureSink {
            submitter: self.bridge.submitter(),
        }
    }

    /// Capture a fragment from the current thread
    pub fn capture(
        &self,
        speaker_id: impl Into<SpeakerId>,
        display_name: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<()> {
        self.capture_sink().capture(speaker_id, display_name, text)
    }

    pub fn set_playback_device(&self, device: Arc<dyn PlaybackDevice>) {
        self.audio.set_playback_device(device);
    }

    pub fn clear_playback_device(&self) {
        self.audio.clear_playback_device();
    }

    /// Interrupt the agent; `false` if it was not speaking
    pub async fn stop_speaking(&self) -> bool {
        self.audio.interrupt().await
    }

    /// Finalize a speaker's utterance without waiting for silence
    pub fn flush_speaker(&self, speaker_id: impl Into<SpeakerId>) -> Result<()> {
        self.conversation.flush(speaker_id)
    }

    pub fn is_speaking(&self) -> bool {
        self.audio.is_speaking()
    }

    pub fn config(&self) -> &ColloquyConfig {
        &self.config
    }

    pub fn status(&self) -> OrchestratorStatus {
        OrchestratorStatus {
            speaking: self.audio.is_speaking(),
            has_playback_device: self.audio.has_playback_device(),
            pending_barge_in: self.audio.pending_count(),
            queued_fragments: self.bridge.len(),
            dropped_fragments: self.bridge.dropped_count(),
            conversation: self.conversation.status(),
        }
    }

    /// Stop accepting fragments, silence the agent and wait for every task
    pub async fn shutdown(&self) {
        info!("Shutting down orchestrator");

        self.bridge.close();
        self.conversation.shutdown();
        self.audio.interrupt().await;

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Orchestrator task ended abnormally: {}", e);
            }
        }

        info!("Orchestrator stopped");
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        // Lets detached tasks wind down when shutdown was never awaited
        self.bridge.close();
        self.conversation.shutdown();
    }
}

/// Forward fragments from the bridge to the audio manager or the conversation
async fn pump(
    bridge: Arc<FragmentBridge>,
    audio: Arc<AudioManager>,
    conversation: ConversationManager,
    barge_in: BargeInAction,
) {
    debug!("Fragment pump started");

    bridge
        .drain_async(|event| {
            let audio = audio.clone();
            let conversation = conversation.clone();
            async move { route_fragment(event, &audio, &conversation, barge_in).await }
        })
        .await;

    debug!("Fragment pump stopped");
}

async fn route_fragment(
    event: FragmentEvent,
    audio: &AudioManager,
    conversation: &ConversationManager,
    barge_in: BargeInAction,
) {
    if event.is_blank() {
        return;
    }

    if audio.capture_if_speaking(&event.speaker_id, &event.display_name, &event.text) {
        if barge_in == BargeInAction::Interrupt {
            info!("{} barged in, interrupting", event.display_name);
            audio.interrupt().await;
        }
        return;
    }

    if let Err(e) = conversation.add_fragment(event.speaker_id, event.display_name, &event.text) {
        warn!("Dropping fragment: {}", e);
    }
}

/// Speech driven by the turn currently being processed
struct ActiveSpeech {
    turn_id: Uuid,
    blocks: block_channel::UnboundedSender<String>,
    task: JoinHandle<SpeechOutcome>,
}

/// Routes generated blocks into speech as soon as they arrive
struct TurnRouter {
    audio: Arc<AudioManager>,
    hooks: Arc<dyn EventHooks>,
    active: Mutex<Option<ActiveSpeech>>,
}

#[async_trait]
impl TurnHooks for TurnRouter {
    async fn on_turn_start(&self, turn: &ConversationTurn) -> anyhow::Result<()> {
        guard_hook("on_turn_start", self.hooks.on_turn_start(turn)).await;
        Ok(())
    }

    async fn on_turn_block(&self, turn: &ConversationTurn, block: &str) -> anyhow::Result<()> {
        {
            let mut active = self.active.lock();
            let speech = active.get_or_insert_with(|| {
                let (tx, rx) = block_channel::unbounded();
                let audio = self.audio.clone();
                let session = SpeechSession::for_turn(turn);
                ActiveSpeech {
                    turn_id: turn.id,
                    blocks: tx,
                    task: tokio::spawn(async move { audio.speak(rx.boxed(), session).await }),
                }
            });

            if speech.blocks.unbounded_send(block.to_string()).is_err() {
                debug!("Speech for turn {} already ended, dropping block", speech.turn_id);
            }
        }

        guard_hook("on_turn_block", self.hooks.on_turn_block(turn, block)).await;
        Ok(())
    }

    async fn on_turn_complete(&self, turn: &ConversationTurn) -> anyhow::Result<()> {
        let active = self.active.lock().take();

        if let Some(speech) = active {
            // Closing the block stream lets the chunker flush its remainder
            drop(speech.blocks);
            match speech.task.await {
                Ok(outcome) => debug!("Turn {} speech ended: {:?}", turn.id, outcome),
                Err(e) => warn!("Speech task for turn {} failed: {}", turn.id, e),
            }
        }

        guard_hook("on_turn_complete", self.hooks.on_turn_complete(turn)).await;
        Ok(())
    }
}

/// Forwards speech events and replays barge-in speech when the agent stops
struct SpeechRouter {
    conversation: ConversationManager,
    hooks: Arc<dyn EventHooks>,
}

#[async_trait]
impl SpeechHooks for SpeechRouter {
    fn on_pending_drained(&self, pending: Vec<PendingUtterance>) {
        for pending in pending {
            info!("Replaying barge-in from {}: {}", pending.display_name, pending.text);
            if let Err(e) = self.conversation.submit_utterance(
                pending.speaker_id,
                pending.display_name,
                &pending.text,
            ) {
                warn!("Lost barge-in speech: {}", e);
            }
        }
    }

    async fn on_speech_start(&self, session: &SpeechSession) -> anyhow::Result<()> {
        guard_hook("on_speech_start", self.hooks.on_speech_start(session)).await;
        Ok(())
    }

    async fn on_speech_end(
        &self,
        session: &SpeechSession,
        outcome: &SpeechOutcome,
    ) -> anyhow::Result<()> {
        guard_hook("on_speech_end", self.hooks.on_speech_end(session, outcome)).await;
        Ok(())
    }
}

/// Builder for creating an orchestrator
pub struct OrchestratorBuilder {
    config: ColloquyConfig,
    generation: Option<Arc<dyn GenerationEngine>>,
    synthesis: Option<Arc<dyn SynthesisEngine>>,
    hooks: Option<Arc<dyn EventHooks>>,
    device: Option<Arc<dyn PlaybackDevice>>,
}

impl OrchestratorBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            config: ColloquyConfig::default(),
            generation: None,
            synthesis: None,
            hooks: None,
            device: None,
        }
    }

    /// Set the complete configuration
    pub fn with_config(mut self, config: ColloquyConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_generation_engine(mut self, engine: Arc<dyn GenerationEngine>) -> Self {
        self.generation = Some(engine);
        self
    }

    pub fn with_synthesis_engine(mut self, engine: Arc<dyn SynthesisEngine>) -> Self {
        self.synthesis = Some(engine);
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn EventHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Attach a playback device up front; it can also be set later
    pub fn with_playback_device(mut self, device: Arc<dyn PlaybackDevice>) -> Self {
        self.device = Some(device);
        self
    }

    /// Build the orchestrator
    pub fn build(self) -> Result<Orchestrator> {
        let generation = self
            .generation
            .ok_or_else(|| ColloquyError::ConfigError("A generation engine is required".into()))?;
        let synthesis = self
            .synthesis
            .ok_or_else(|| ColloquyError::ConfigError("A synthesis engine is required".into()))?;
        let hooks = self.hooks.unwrap_or_else(|| Arc::new(NoopEventHooks));

        Orchestrator::new(self.config, generation, synthesis, hooks, self.device)
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
