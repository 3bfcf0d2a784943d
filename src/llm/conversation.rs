//! Conversation manager: utterance debouncing and sequential turn processing
//!
//! Fragments are posted as commands to a worker task that alone owns the
//! per-speaker buffers and their silence timers, so any thread may call the
//! public methods. Finalized turns go to a second task that processes them
//! strictly one at a time.

use crate::llm::engine::GenerationEngine;
use crate::messages::{ConversationTurn, SpeakerId};
use crate::utils::hooks::guard_hook;
use crate::utils::perf::{LatencyStats, Stopwatch, TurnLatency};
use crate::{ColloquyError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Spoken when every configured fallback list is empty
pub const DEFAULT_FALLBACK: &str = "Sorry, I couldn't come up with an answer. Could you repeat that?";

/// Configuration for the conversation manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// Silence after a speaker's last fragment before the utterance is final
    pub silence_timeout_ms: u64,

    /// Prompt sent to the engine; `{name}` and `{text}` are substituted
    pub prompt_template: String,

    /// Replies used, in rotation, when generation fails or returns nothing
    pub fallback_responses: Vec<String>,

    /// Upper bound on one generation call
    pub generation_timeout_ms: u64,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            silence_timeout_ms: 2000,
            prompt_template: "{name} said: {text}".to_string(),
            fallback_responses: vec![
                "Sorry, I didn't catch that. Could you say it again?".to_string(),
                "I'm having trouble answering right now. Please try again.".to_string(),
                "Give me a moment, something went wrong on my side.".to_string(),
            ],
            generation_timeout_ms: 30_000,
        }
    }
}

impl ConversationConfig {
    pub fn with_silence_timeout_ms(mut self, ms: u64) -> Self {
        self.silence_timeout_ms = ms;
        self
    }

    pub fn with_prompt_template(mut self, template: impl Into<String>) -> Self {
        self.prompt_template = template.into();
        self
    }

    pub fn with_fallback_responses(mut self, responses: Vec<String>) -> Self {
        self.fallback_responses = responses;
        self
    }

    pub fn with_generation_timeout_ms(mut self, ms: u64) -> Self {
        self.generation_timeout_ms = ms;
        self
    }

    pub fn silence_timeout(&self) -> Duration {
        Duration::from_millis(self.silence_timeout_ms)
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_millis(self.generation_timeout_ms)
    }

    /// Render the prompt for one utterance
    pub fn build_prompt(&self, display_name: &str, text: &str) -> String {
        self.prompt_template
            .replace("{name}", display_name)
            .replace("{text}", text)
    }
}

/// Callbacks fired by the turn processor
///
/// Every invocation is isolated: an error or panic is logged and the turn
/// continues.
#[async_trait]
pub trait TurnHooks: Send + Sync {
    async fn on_turn_start(&self, _turn: &ConversationTurn) -> anyhow::Result<()> {
        Ok(())
    }

    /// One non-empty response block, in generation order
    async fn on_turn_block(&self, _turn: &ConversationTurn, _block: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// The response is fully delivered; the next turn starts after this returns
    async fn on_turn_complete(&self, _turn: &ConversationTurn) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Hooks that do nothing
pub struct NoopTurnHooks;

impl TurnHooks for NoopTurnHooks {}

/// Commands accepted by the conversation worker
#[derive(Debug, Clone)]
pub enum ConversationCommand {
    AddFragment {
        speaker_id: SpeakerId,
        display_name: String,
        text: String,
    },

    /// Posted by a silence timer; ignored unless `generation` is still current
    Finalize { speaker_id: SpeakerId, generation: u64 },

    /// Finalize one speaker now, or every speaker when `None`
    Flush { speaker_id: Option<SpeakerId> },

    /// Append to the speaker's buffer and finalize immediately
    SubmitUtterance {
        speaker_id: SpeakerId,
        display_name: String,
        text: String,
    },

    Shutdown,
}

/// Point-in-time view of the conversation worker
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationStatus {
    /// Speakers with fragments still waiting for silence
    pub buffered_speakers: usize,
    /// Finalized turns not yet picked up by the processor
    pub queued_turns: usize,
    pub processing: bool,
    pub completed_turns: u64,
    pub fallback_turns: u64,
    /// User-facing description of the latest failed generation
    pub last_error: Option<String>,
    pub latency: LatencyStats,
}

#[derive(Default)]
struct SharedStatus {
    buffered: AtomicUsize,
    queued: AtomicUsize,
    processing: AtomicBool,
    completed: AtomicU64,
    fallbacks: AtomicU64,
    shutting_down: AtomicBool,
    last_error: Mutex<Option<String>>,
    latency: Mutex<TurnLatency>,
}

/// Cloneable front end of the conversation worker
#[derive(Clone)]
pub struct ConversationManager {
    command_tx: mpsc::UnboundedSender<ConversationCommand>,
    status: Arc<SharedStatus>,
}

impl ConversationManager {
    /// Create the manager and its (not yet started) worker
    pub fn new(
        config: ConversationConfig,
        engine: Arc<dyn GenerationEngine>,
    ) -> (Self, ConversationWorker) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let status = Arc::new(SharedStatus::default());

        let worker = ConversationWorker {
            config,
            engine,
            command_rx,
            timer_tx: command_tx.downgrade(),
            status: status.clone(),
        };

        (Self { command_tx, status }, worker)
    }

    /// Append a recognized fragment to the speaker's pending utterance
    ///
    /// Whitespace-only text is ignored.
    pub fn add_fragment(
        &self,
        speaker_id: impl Into<SpeakerId>,
        display_name: impl Into<String>,
        text: &str,
    ) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }

        self.send(ConversationCommand::AddFragment {
            speaker_id: speaker_id.into(),
            display_name: display_name.into(),
            text: text.to_string(),
        })
    }

    /// Finalize a speaker's utterance without waiting for silence
    pub fn flush(&self, speaker_id: impl Into<SpeakerId>) -> Result<()> {
        self.send(ConversationCommand::Flush {
            speaker_id: Some(speaker_id.into()),
        })
    }

    /// Finalize every buffered utterance
    pub fn flush_all(&self) -> Result<()> {
        self.send(ConversationCommand::Flush { speaker_id: None })
    }

    /// Queue a complete utterance, skipping the silence wait
    ///
    /// Any fragments already buffered for the speaker come first.
    pub fn submit_utterance(
        &self,
        speaker_id: impl Into<SpeakerId>,
        display_name: impl Into<String>,
        text: &str,
    ) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }

        self.send(ConversationCommand::SubmitUtterance {
            speaker_id: speaker_id.into(),
            display_name: display_name.into(),
            text: text.to_string(),
        })
    }

    /// Cancel timers and stop at the next turn boundary
    pub fn shutdown(&self) {
        self.status.shutting_down.store(true, Ordering::Release);
        // The worker may already be gone
        let _ = self.command_tx.send(ConversationCommand::Shutdown);
    }

    pub fn status(&self) -> ConversationStatus {
        ConversationStatus {
            buffered_speakers: self.status.buffered.load(Ordering::Relaxed),
            queued_turns: self.status.queued.load(Ordering::Relaxed),
            processing: self.status.processing.load(Ordering::Relaxed),
            completed_turns: self.status.completed.load(Ordering::Relaxed),
            fallback_turns: self.status.fallbacks.load(Ordering::Relaxed),
            last_error: self.status.last_error.lock().clone(),
            latency: self.status.latency.lock().snapshot(),
        }
    }

    fn send(&self, command: ConversationCommand) -> Result<()> {
        self.command_tx
            .send(command)
            .map_err(|_| ColloquyError::ChannelError("conversation worker stopped".into()))
    }
}

/// Worker owning buffers, timers and the turn processor
pub struct ConversationWorker {
    config: ConversationConfig,
    engine: Arc<dyn GenerationEngine>,
    command_rx: mpsc::UnboundedReceiver<ConversationCommand>,
    /// Weak so that dropping every manager ends the worker
    timer_tx: mpsc::WeakUnboundedSender<ConversationCommand>,
    status: Arc<SharedStatus>,
}

impl ConversationWorker {
    /// Spawn the worker on the current runtime
    ///
    /// The returned handle completes once both the command loop and the turn
    /// processor have stopped.
    pub fn start(self, hooks: Arc<dyn TurnHooks>) -> JoinHandle<()> {
        let (turn_tx, turn_rx) = mpsc::unbounded_channel();

        let processor = TurnProcessor {
            config: self.config.clone(),
            engine: self.engine,
            hooks,
            status: self.status.clone(),
            fallback_index: 0,
        };
        let processor = tokio::spawn(processor.run(turn_rx));

        let actor = UtteranceActor {
            silence_timeout: self.config.silence_timeout(),
            command_rx: self.command_rx,
            timer_tx: self.timer_tx,
            turn_tx,
            status: self.status,
            buffers: HashMap::new(),
            next_generation: 0,
            next_order: 0,
        };

        tokio::spawn(async move {
            actor.run().await;
            let _ = processor.await;
            info!("Conversation worker stopped");
        })
    }
}

/// Fragments of one speaker awaiting silence
struct UtteranceBuffer {
    display_name: String,
    fragments: Vec<String>,
    generation: u64,
    /// Creation order, for flush-all ordering
    order: u64,
    timer: Option<JoinHandle<()>>,
}

struct UtteranceActor {
    silence_timeout: Duration,
    command_rx: mpsc::UnboundedReceiver<ConversationCommand>,
    timer_tx: mpsc::WeakUnboundedSender<ConversationCommand>,
    turn_tx: mpsc::UnboundedSender<ConversationTurn>,
    status: Arc<SharedStatus>,
    buffers: HashMap<SpeakerId, UtteranceBuffer>,
    next_generation: u64,
    next_order: u64,
}

impl UtteranceActor {
    async fn run(mut self) {
        debug!("Conversation command loop started");

        while let Some(command) = self.command_rx.recv().await {
            match command {
                ConversationCommand::AddFragment {
                    speaker_id,
                    display_name,
                    text,
                } => {
                    debug!("Fragment from {}: {}", speaker_id, text);
                    self.append(&speaker_id, display_name, text);
                    self.arm_timer(&speaker_id);
                }

                ConversationCommand::Finalize {
                    speaker_id,
                    generation,
                } => {
                    let current = self
                        .buffers
                        .get(&speaker_id)
                        .map(|buffer| buffer.generation == generation)
                        .unwrap_or(false);

                    if current {
                        self.finalize(&speaker_id);
                    } else {
                        debug!("Ignoring stale silence timer for {}", speaker_id);
                    }
                }

                ConversationCommand::Flush {
                    speaker_id: Some(speaker_id),
                } => self.finalize(&speaker_id),

                ConversationCommand::Flush { speaker_id: None } => {
                    let mut speakers: Vec<(u64, SpeakerId)> = self
                        .buffers
                        .iter()
                        .map(|(id, buffer)| (buffer.order, id.clone()))
                        .collect();
                    speakers.sort();
                    for (_, speaker_id) in speakers {
                        self.finalize(&speaker_id);
                    }
                }

                ConversationCommand::SubmitUtterance {
                    speaker_id,
                    display_name,
                    text,
                } => {
                    self.append(&speaker_id, display_name, text);
                    self.finalize(&speaker_id);
                }

                ConversationCommand::Shutdown => {
                    info!("Conversation worker shutting down");
                    break;
                }
            }

            self.status.buffered.store(self.buffers.len(), Ordering::Relaxed);
        }

        for buffer in self.buffers.values_mut() {
            if let Some(timer) = buffer.timer.take() {
                timer.abort();
            }
        }
        if !self.buffers.is_empty() {
            debug!("Discarding {} unfinished utterances", self.buffers.len());
        }
        self.status.buffered.store(0, Ordering::Relaxed);
    }

    fn append(&mut self, speaker_id: &SpeakerId, display_name: String, text: String) {
        let order = self.next_order;
        let buffer = self
            .buffers
            .entry(speaker_id.clone())
            .or_insert_with(|| UtteranceBuffer {
                display_name: display_name.clone(),
                fragments: Vec::new(),
                generation: 0,
                order,
                timer: None,
            });

        if buffer.order == order {
            self.next_order += 1;
        }
        buffer.display_name = display_name;
        buffer.fragments.push(text);
    }

    /// Replace the speaker's silence timer
    fn arm_timer(&mut self, speaker_id: &SpeakerId) {
        self.next_generation += 1;
        let generation = self.next_generation;

        let Some(buffer) = self.buffers.get_mut(speaker_id) else {
            return;
        };

        if let Some(previous) = buffer.timer.take() {
            previous.abort();
        }
        buffer.generation = generation;

        let timer_tx = self.timer_tx.clone();
        let speaker_id = speaker_id.clone();
        let silence = self.silence_timeout;

        buffer.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(silence).await;
            if let Some(tx) = timer_tx.upgrade() {
                let _ = tx.send(ConversationCommand::Finalize {
                    speaker_id,
                    generation,
                });
            }
        }));
    }

    fn finalize(&mut self, speaker_id: &SpeakerId) {
        let Some(mut buffer) = self.buffers.remove(speaker_id) else {
            return;
        };

        if let Some(timer) = buffer.timer.take() {
            timer.abort();
        }

        let text = buffer.fragments.join(" ");
        if text.is_empty() {
            return;
        }

        let turn = ConversationTurn::new(speaker_id.clone(), buffer.display_name, text);
        info!(
            "Utterance finalized for {} ({}): {}",
            turn.display_name, turn.speaker_id, turn.utterance_text
        );

        self.status.queued.fetch_add(1, Ordering::Relaxed);
        if self.turn_tx.send(turn).is_err() {
            self.status.queued.fetch_sub(1, Ordering::Relaxed);
            warn!("Turn processor stopped, dropping utterance from {}", speaker_id);
        }
    }
}

/// Single consumer of finalized turns
struct TurnProcessor {
    config: ConversationConfig,
    engine: Arc<dyn GenerationEngine>,
    hooks: Arc<dyn TurnHooks>,
    status: Arc<SharedStatus>,
    fallback_index: usize,
}

impl TurnProcessor {
    async fn run(mut self, mut turn_rx: mpsc::UnboundedReceiver<ConversationTurn>) {
        debug!("Turn processor started");

        while let Some(turn) = turn_rx.recv().await {
            self.status.queued.fetch_sub(1, Ordering::Relaxed);

            if self.status.shutting_down.load(Ordering::Acquire) {
                debug!("Shutting down, skipping turn {}", turn.id);
                break;
            }

            self.status.processing.store(true, Ordering::Relaxed);
            self.process(&turn).await;
            self.status.processing.store(false, Ordering::Relaxed);
            self.status.completed.fetch_add(1, Ordering::Relaxed);
        }

        debug!("Turn processor stopped");
    }

    async fn process(&mut self, turn: &ConversationTurn) {
        let stopwatch = Stopwatch::start();
        info!("Starting turn {} for {}", turn.id, turn.display_name);

        guard_hook("on_turn_start", self.hooks.on_turn_start(turn)).await;

        let prompt = self
            .config
            .build_prompt(&turn.display_name, &turn.utterance_text);

        let limit = self.config.generation_timeout();
        let generation = tokio::time::timeout(limit, self.stream_blocks(turn, &prompt, stopwatch))
            .await
            .unwrap_or_else(|_| {
                Err(ColloquyError::Timeout(format!(
                    "generation exceeded {}ms",
                    limit.as_millis()
                )))
            });

        let failure = match generation {
            Ok(0) => Some(ColloquyError::GenerationError("empty response".into())),
            Ok(blocks) => {
                debug!("Turn {} streamed {} blocks", turn.id, blocks);
                None
            }
            Err(e) => Some(e),
        };

        if let Some(e) = failure {
            if e.is_recoverable() {
                warn!("Generation failed for turn {}: {}", turn.id, e);
            } else {
                error!("Generation failed for turn {}: {}", turn.id, e);
            }
            *self.status.last_error.lock() = Some(e.user_message());

            let fallback = self.next_fallback();
            self.status.fallbacks.fetch_add(1, Ordering::Relaxed);
            guard_hook("on_turn_block", self.hooks.on_turn_block(turn, &fallback)).await;
        }

        guard_hook("on_turn_complete", self.hooks.on_turn_complete(turn)).await;

        self.status.latency.lock().record_total(stopwatch.elapsed());
        info!("Turn {} complete in {}ms", turn.id, stopwatch.elapsed_ms());
    }

    /// Forward every non-empty block, returning how many were delivered
    async fn stream_blocks(
        &self,
        turn: &ConversationTurn,
        prompt: &str,
        stopwatch: Stopwatch,
    ) -> Result<usize> {
        let mut blocks = self.engine.stream(prompt).await?;
        let mut delivered = 0;

        while let Some(block) = blocks.next().await {
            let block = block?;
            if block.trim().is_empty() {
                continue;
            }

            if delivered == 0 {
                self.status
                    .latency
                    .lock()
                    .record_first_block(stopwatch.elapsed());
            }
            delivered += 1;

            guard_hook("on_turn_block", self.hooks.on_turn_block(turn, &block)).await;
        }

        Ok(delivered)
    }

    fn next_fallback(&mut self) -> String {
        let responses = &self.config.fallback_responses;
        if responses.is_empty() {
            return DEFAULT_FALLBACK.to_string();
        }

        let response = responses[self.fallback_index % responses.len()].clone();
        self.fallback_index = self.fallback_index.wrapping_add(1);
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream::{self, BoxStream};

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
        complete_delay: Duration,
    }

    impl Recorder {
        fn with_complete_delay(delay: Duration) -> Self {
            Self {
                complete_delay: delay,
                ..Default::default()
            }
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().clone()
        }

        fn turns(&self) -> Vec<String> {
            self.events()
                .into_iter()
                .filter_map(|e| e.strip_prefix("start:").map(str::to_string))
                .collect()
        }
    }

    #[async_trait]
    impl TurnHooks for Recorder {
        async fn on_turn_start(&self, turn: &ConversationTurn) -> anyhow::Result<()> {
            self.events.lock().push(format!("start:{}", turn.utterance_text));
            Ok(())
        }

        async fn on_turn_block(&self, _turn: &ConversationTurn, block: &str) -> anyhow::Result<()> {
            self.events.lock().push(format!("block:{}", block));
            Ok(())
        }

        async fn on_turn_complete(&self, turn: &ConversationTurn) -> anyhow::Result<()> {
            if !self.complete_delay.is_zero() {
                tokio::time::sleep(self.complete_delay).await;
            }
            self.events.lock().push(format!("complete:{}", turn.utterance_text));
            Ok(())
        }
    }

    struct ScriptedEngine(Vec<&'static str>);

    #[async_trait]
    impl GenerationEngine for ScriptedEngine {
        async fn stream(&self, _prompt: &str) -> Result<BoxStream<'static, Result<String>>> {
            let blocks: Vec<Result<String>> = self.0.iter().map(|b| Ok(b.to_string())).collect();
            Ok(stream::iter(blocks).boxed())
        }
    }

    struct FailingEngine;

    #[async_trait]
    impl GenerationEngine for FailingEngine {
        async fn stream(&self, _prompt: &str) -> Result<BoxStream<'static, Result<String>>> {
            Err(ColloquyError::GenerationError("model unavailable".into()))
        }
    }

    struct StallingEngine;

    #[async_trait]
    impl GenerationEngine for StallingEngine {
        async fn stream(&self, _prompt: &str) -> Result<BoxStream<'static, Result<String>>> {
            Ok(stream::pending().boxed())
        }
    }

    fn start(
        config: ConversationConfig,
        engine: impl GenerationEngine + 'static,
        recorder: Arc<Recorder>,
    ) -> (ConversationManager, JoinHandle<()>) {
        let (manager, worker) = ConversationManager::new(config, Arc::new(engine));
        let handle = worker.start(recorder);
        (manager, handle)
    }

    fn sleep_ms(ms: u64) -> tokio::time::Sleep {
        tokio::time::sleep(Duration::from_millis(ms))
    }

    #[tokio::test(start_paused = true)]
    async fn test_fragments_within_window_make_one_turn() {
        let recorder = Arc::new(Recorder::default());
        let (manager, _handle) =
            start(ConversationConfig::default(), ScriptedEngine(vec!["Hi!"]), recorder.clone());

        manager.add_fragment("a", "Alice", "Hello").unwrap();
        sleep_ms(100).await;
        manager.add_fragment("a", "Alice", " world ").unwrap();
        sleep_ms(1500).await;
        assert!(recorder.events().is_empty());

        sleep_ms(1000).await;
        assert_eq!(
            recorder.events(),
            vec!["start:Hello world", "block:Hi!", "complete:Hello world"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_rearmed_many_times_yields_one_turn() {
        let recorder = Arc::new(Recorder::default());
        let (manager, _handle) =
            start(ConversationConfig::default(), ScriptedEngine(vec!["ok"]), recorder.clone());

        let mut expected = Vec::new();
        for i in 0..1000 {
            let word = format!("w{}", i);
            manager.add_fragment("a", "Alice", &word).unwrap();
            expected.push(word);
            sleep_ms(10).await;
        }
        assert!(recorder.events().is_empty());
        assert_eq!(manager.status().buffered_speakers, 1);

        sleep_ms(2100).await;
        assert_eq!(recorder.turns(), vec![expected.join(" ")]);
        assert_eq!(manager.status().buffered_speakers, 0);
        assert_eq!(manager.status().completed_turns, 1);

        // Replaced timers are aborted, not left sleeping
        let alive = tokio::runtime::Handle::current().metrics().num_alive_tasks();
        assert!(alive < 5, "{} tasks still alive", alive);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_silence_finalizes_immediately() {
        let recorder = Arc::new(Recorder::default());
        let config = ConversationConfig::default().with_silence_timeout_ms(0);
        let (manager, _handle) = start(config, ScriptedEngine(vec!["ok"]), recorder.clone());

        manager.add_fragment("a", "Alice", "quick").unwrap();
        sleep_ms(1).await;

        assert_eq!(recorder.turns(), vec!["quick"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gap_longer_than_window_splits_turns() {
        let recorder = Arc::new(Recorder::default());
        let (manager, _handle) =
            start(ConversationConfig::default(), ScriptedEngine(vec!["ok"]), recorder.clone());

        manager.add_fragment("a", "Alice", "one").unwrap();
        sleep_ms(2500).await;
        manager.add_fragment("a", "Alice", "two").unwrap();
        sleep_ms(2500).await;

        assert_eq!(recorder.turns(), vec!["one", "two"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_whitespace_fragment_ignored() {
        let recorder = Arc::new(Recorder::default());
        let (manager, _handle) =
            start(ConversationConfig::default(), ScriptedEngine(vec!["ok"]), recorder.clone());

        manager.add_fragment("a", "Alice", "   ").unwrap();
        sleep_ms(5000).await;

        assert!(recorder.events().is_empty());
        assert_eq!(manager.status().completed_turns, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_engine_yields_single_fallback() {
        let recorder = Arc::new(Recorder::default());
        let config = ConversationConfig::default().with_fallback_responses(vec!["fallback".into()]);
        let (manager, _handle) = start(config, FailingEngine, recorder.clone());

        manager.submit_utterance("a", "Alice", "are you there").unwrap();
        sleep_ms(100).await;

        assert_eq!(
            recorder.events(),
            vec!["start:are you there", "block:fallback", "complete:are you there"]
        );
        assert_eq!(manager.status().fallback_turns, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blank_response_uses_fallback() {
        let recorder = Arc::new(Recorder::default());
        let config = ConversationConfig::default().with_fallback_responses(vec!["fallback".into()]);
        let (manager, _handle) = start(config, ScriptedEngine(vec!["  ", "\n"]), recorder.clone());

        manager.submit_utterance("a", "Alice", "hello").unwrap();
        sleep_ms(100).await;

        assert_eq!(
            recorder.events(),
            vec!["start:hello", "block:fallback", "complete:hello"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_generation_timeout_uses_fallback() {
        let recorder = Arc::new(Recorder::default());
        let config = ConversationConfig::default()
            .with_generation_timeout_ms(1000)
            .with_fallback_responses(vec!["too slow".into()]);
        let (manager, _handle) = start(config, StallingEngine, recorder.clone());

        manager.submit_utterance("a", "Alice", "hello").unwrap();
        sleep_ms(500).await;
        assert_eq!(recorder.events(), vec!["start:hello"]);

        sleep_ms(1000).await;
        assert_eq!(
            recorder.events(),
            vec!["start:hello", "block:too slow", "complete:hello"]
        );
        assert_eq!(
            manager.status().last_error,
            Some(ColloquyError::Timeout(String::new()).user_message())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallbacks_rotate() {
        let recorder = Arc::new(Recorder::default());
        let config = ConversationConfig::default()
            .with_fallback_responses(vec!["first".into(), "second".into()]);
        let (manager, _handle) = start(config, FailingEngine, recorder.clone());

        for text in ["a", "b", "c"] {
            manager.submit_utterance("x", "X", text).unwrap();
        }
        sleep_ms(100).await;

        let blocks: Vec<String> = recorder
            .events()
            .into_iter()
            .filter(|e| e.starts_with("block:"))
            .collect();
        assert_eq!(blocks, vec!["block:first", "block:second", "block:first"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_turns_never_overlap() {
        let recorder = Arc::new(Recorder::with_complete_delay(Duration::from_millis(500)));
        let (manager, _handle) =
            start(ConversationConfig::default(), ScriptedEngine(vec!["ok"]), recorder.clone());

        manager.add_fragment("a", "Alice", "first").unwrap();
        manager.add_fragment("b", "Bob", "second").unwrap();
        manager.flush_all().unwrap();

        sleep_ms(100).await;
        let status = manager.status();
        assert!(status.processing);
        assert_eq!(status.queued_turns, 1);

        sleep_ms(2000).await;
        assert_eq!(
            recorder.events(),
            vec![
                "start:first",
                "block:ok",
                "complete:first",
                "start:second",
                "block:ok",
                "complete:second",
            ]
        );
        assert_eq!(manager.status().completed_turns, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_utterance_keeps_speaker_order() {
        let recorder = Arc::new(Recorder::default());
        let (manager, _handle) =
            start(ConversationConfig::default(), ScriptedEngine(vec!["ok"]), recorder.clone());

        manager.add_fragment("a", "Alice", "first part").unwrap();
        manager.submit_utterance("a", "Alice", "second part").unwrap();
        sleep_ms(100).await;
        assert_eq!(recorder.turns(), vec!["first part second part"]);

        // The aborted silence timer must not produce another turn
        sleep_ms(5000).await;
        assert_eq!(recorder.turns().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prompt_template() {
        let config = ConversationConfig::default().with_prompt_template("User {name} said: {text}");
        assert_eq!(config.build_prompt("Ana", "hola"), "User Ana said: hola");
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_worker() {
        let recorder = Arc::new(Recorder::default());
        let (manager, handle) =
            start(ConversationConfig::default(), ScriptedEngine(vec!["ok"]), recorder.clone());

        manager.add_fragment("a", "Alice", "never finished").unwrap();
        sleep_ms(10).await;
        manager.shutdown();
        handle.await.unwrap();

        assert!(manager.add_fragment("a", "Alice", "late").is_err());
        sleep_ms(5000).await;
        assert!(recorder.events().is_empty());
    }
}
