//! Integration tests for the Colloquy orchestrator
//!
//! These tests drive the full capture -> conversation -> speech pipeline with
//! scripted engines and the simulated playback device.

use async_trait::async_trait;
use colloquy::audio::SimulatedPlayback;
use colloquy::integration::{event_channel, BargeInAction};
use colloquy::llm::GenerationEngine;
use colloquy::speech::{SpeechOutcome, ToneSynthesizer};
use colloquy::{ColloquyConfig, ColloquyError, Orchestrator, OrchestratorEvent};
use crossbeam_channel::Receiver;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use std::time::Duration;

const REPLY: &[&str] = &["Sure", " thing", ",", " here", " is", " my", " answer", "."];

/// Streams a fixed reply, optionally pausing before every block
struct ScriptedEngine {
    blocks: Vec<&'static str>,
    delay: Duration,
}

impl ScriptedEngine {
    fn new(blocks: &[&'static str]) -> Self {
        Self {
            blocks: blocks.to_vec(),
            delay: Duration::ZERO,
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl GenerationEngine for ScriptedEngine {
    async fn stream(
        &self,
        _prompt: &str,
    ) -> colloquy::Result<BoxStream<'static, colloquy::Result<String>>> {
        let blocks: Vec<String> = self.blocks.iter().map(|b| b.to_string()).collect();
        let delay = self.delay;

        Ok(stream::iter(blocks)
            .then(move |block| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(block)
            })
            .boxed())
    }
}

struct FailingEngine;

#[async_trait]
impl GenerationEngine for FailingEngine {
    async fn stream(
        &self,
        _prompt: &str,
    ) -> colloquy::Result<BoxStream<'static, colloquy::Result<String>>> {
        Err(ColloquyError::GenerationError("backend offline".into()))
    }
}

struct Harness {
    orchestrator: Orchestrator,
    device: SimulatedPlayback,
    events: Receiver<OrchestratorEvent>,
    seen: Vec<OrchestratorEvent>,
}

impl Harness {
    fn new(config: ColloquyConfig, engine: impl GenerationEngine + 'static) -> Self {
        Self::with_device(config, engine, Some(SimulatedPlayback::new()))
    }

    fn with_device(
        config: ColloquyConfig,
        engine: impl GenerationEngine + 'static,
        device: Option<SimulatedPlayback>,
    ) -> Self {
        let (hooks, events) = event_channel();
        let mut builder = Orchestrator::builder()
            .with_config(config)
            .with_generation_engine(Arc::new(engine))
            .with_synthesis_engine(Arc::new(ToneSynthesizer::default()))
            .with_hooks(Arc::new(hooks));

        if let Some(device) = &device {
            builder = builder.with_playback_device(Arc::new(device.clone()));
        }

        let orchestrator = builder.build().unwrap();
        orchestrator.start().unwrap();

        Self {
            orchestrator,
            device: device.unwrap_or_default(),
            events,
            seen: Vec::new(),
        }
    }

    fn events(&mut self) -> &[OrchestratorEvent] {
        self.seen.extend(self.events.try_iter());
        &self.seen
    }

    fn turn_texts(&mut self) -> Vec<String> {
        self.events()
            .iter()
            .filter_map(|e| match e {
                OrchestratorEvent::TurnStarted { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    fn blocks(&mut self) -> Vec<String> {
        self.events()
            .iter()
            .filter_map(|e| match e {
                OrchestratorEvent::TurnBlock { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    fn speech_outcomes(&mut self) -> Vec<SpeechOutcome> {
        self.events()
            .iter()
            .filter_map(|e| match e {
                OrchestratorEvent::SpeechEnded { outcome, .. } => Some(outcome.clone()),
                _ => None,
            })
            .collect()
    }

    fn position(&mut self, pred: impl Fn(&OrchestratorEvent) -> bool) -> Option<usize> {
        self.events().iter().position(pred)
    }
}

fn sleep_ms(ms: u64) -> tokio::time::Sleep {
    tokio::time::sleep(Duration::from_millis(ms))
}

fn is_turn_started(text: &'static str) -> impl Fn(&OrchestratorEvent) -> bool {
    move |e: &OrchestratorEvent| matches!(e, OrchestratorEvent::TurnStarted { text: t, .. } if t == text)
}

/// Fragments from one speaker inside the silence window form a single turn
#[tokio::test(start_paused = true)]
async fn test_fragments_form_one_turn() {
    let mut h = Harness::new(ColloquyConfig::default(), ScriptedEngine::new(REPLY));

    h.orchestrator.capture("1", "Alice", "Hello").unwrap();
    sleep_ms(100).await;
    h.orchestrator.capture("1", "Alice", "world").unwrap();
    sleep_ms(5000).await;

    assert_eq!(h.turn_texts(), vec!["Hello world"]);
    assert_eq!(h.device.played_texts(), vec!["Sure thing, here is my answer."]);
    assert_eq!(h.speech_outcomes(), vec![SpeechOutcome::Completed]);

    h.orchestrator.shutdown().await;
}

/// A speaker talking over the agent is heard once the agent finishes
#[tokio::test(start_paused = true)]
async fn test_barge_in_is_buffered_until_speech_ends() {
    let mut h = Harness::new(ColloquyConfig::default(), ScriptedEngine::new(REPLY));

    h.orchestrator.capture("1", "Alice", "Hello").unwrap();
    sleep_ms(2100).await;
    assert!(h.orchestrator.is_speaking());

    h.orchestrator.capture("2", "Bob", "wait for me").unwrap();
    sleep_ms(100).await;
    assert!(h.orchestrator.is_speaking());
    assert_eq!(h.orchestrator.status().pending_barge_in, 1);
    assert_eq!(h.turn_texts(), vec!["Hello"]);

    sleep_ms(3000).await;
    assert_eq!(h.turn_texts(), vec!["Hello", "wait for me"]);
    assert_eq!(h.orchestrator.status().pending_barge_in, 0);

    let first_speech_end = h
        .position(|e| matches!(e, OrchestratorEvent::SpeechEnded { .. }))
        .unwrap();
    let first_complete = h
        .position(|e| matches!(e, OrchestratorEvent::TurnCompleted { .. }))
        .unwrap();
    let bob_start = h.position(is_turn_started("wait for me")).unwrap();
    assert!(first_speech_end < first_complete);
    assert!(first_complete < bob_start);

    assert_eq!(
        h.speech_outcomes(),
        vec![SpeechOutcome::Completed, SpeechOutcome::Completed]
    );

    h.orchestrator.shutdown().await;
}

/// With the interrupt barge-in action the agent stops talking at once
#[tokio::test(start_paused = true)]
async fn test_barge_in_interrupt_action() {
    let config = ColloquyConfig::default().with_barge_in(BargeInAction::Interrupt);
    let mut h = Harness::new(config, ScriptedEngine::new(REPLY));

    h.orchestrator.capture("1", "Alice", "Hello").unwrap();
    sleep_ms(2100).await;
    assert!(h.orchestrator.is_speaking());

    h.orchestrator.capture("2", "Bob", "stop please").unwrap();
    sleep_ms(50).await;

    assert_eq!(h.speech_outcomes().first(), Some(&SpeechOutcome::Interrupted));

    sleep_ms(3000).await;
    assert_eq!(h.turn_texts(), vec!["Hello", "stop please"]);

    h.orchestrator.shutdown().await;
}

/// A failing engine still produces exactly one spoken fallback
#[tokio::test(start_paused = true)]
async fn test_failing_engine_speaks_fallback() {
    let config = ColloquyConfig::default()
        .with_fallback_responses(vec!["Sorry, please try again.".into()]);
    let mut h = Harness::new(config, FailingEngine);

    h.orchestrator.capture("1", "Alice", "Are you there?").unwrap();
    sleep_ms(5000).await;

    assert_eq!(h.blocks(), vec!["Sorry, please try again."]);
    assert_eq!(h.device.played_texts(), vec!["Sorry, please try again."]);
    assert!(h
        .position(|e| matches!(e, OrchestratorEvent::TurnCompleted { .. }))
        .is_some());
    assert_eq!(h.orchestrator.status().conversation.fallback_turns, 1);

    h.orchestrator.shutdown().await;
}

/// Interrupting mid-turn discards the rest of that turn's blocks
#[tokio::test(start_paused = true)]
async fn test_stop_speaking_discards_later_blocks() {
    let engine = ScriptedEngine::new(&["First sentence here.", " Second sentence here."])
        .with_delay(Duration::from_millis(500));
    let mut h = Harness::new(ColloquyConfig::default(), engine);

    h.orchestrator.capture("1", "Alice", "Tell me two things").unwrap();
    sleep_ms(2700).await;
    assert!(h.orchestrator.is_speaking());

    assert!(h.orchestrator.stop_speaking().await);
    assert!(!h.orchestrator.is_speaking());

    sleep_ms(2000).await;
    assert_eq!(h.device.played_texts(), vec!["First sentence here."]);
    assert_eq!(h.speech_outcomes(), vec![SpeechOutcome::Interrupted]);
    assert!(h
        .position(|e| matches!(e, OrchestratorEvent::TurnCompleted { .. }))
        .is_some());

    assert!(!h.orchestrator.stop_speaking().await);

    h.orchestrator.shutdown().await;
}

/// Without a device turns still complete; attaching one later restores speech
#[tokio::test(start_paused = true)]
async fn test_playback_device_attached_later() {
    let mut h = Harness::with_device(ColloquyConfig::default(), ScriptedEngine::new(REPLY), None);

    h.orchestrator.capture("1", "Alice", "Anyone?").unwrap();
    sleep_ms(3000).await;
    assert_eq!(h.turn_texts(), vec!["Anyone?"]);
    assert!(h.speech_outcomes().is_empty());
    assert!(h
        .position(|e| matches!(e, OrchestratorEvent::TurnCompleted { .. }))
        .is_some());

    let device = SimulatedPlayback::new();
    h.orchestrator.set_playback_device(Arc::new(device.clone()));

    h.orchestrator.capture("1", "Alice", "Now?").unwrap();
    sleep_ms(5000).await;
    assert_eq!(device.played_texts(), vec!["Sure thing, here is my answer."]);

    h.orchestrator.shutdown().await;
}

/// Explicit flush skips the silence wait
#[tokio::test(start_paused = true)]
async fn test_flush_speaker() {
    let mut h = Harness::new(ColloquyConfig::default(), ScriptedEngine::new(REPLY));

    h.orchestrator.capture("1", "Alice", "Quick question").unwrap();
    sleep_ms(50).await;
    h.orchestrator.flush_speaker("1").unwrap();
    sleep_ms(50).await;

    assert_eq!(h.turn_texts(), vec!["Quick question"]);

    h.orchestrator.shutdown().await;
}

/// Fragments submitted from a foreign thread reach the conversation in order
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_capture_from_foreign_thread() {
    let config = ColloquyConfig::default().with_silence_timeout_ms(150);
    let mut h = Harness::with_device(
        config,
        ScriptedEngine::new(&["Got it."]),
        Some(SimulatedPlayback::with_pacing(0.0)),
    );

    let sink = h.orchestrator.capture_sink();
    let producer = std::thread::spawn(move || {
        sink.capture("1", "Alice", "alpha").unwrap();
        std::thread::sleep(Duration::from_millis(10));
        sink.capture("2", "Bob", "gamma").unwrap();
        std::thread::sleep(Duration::from_millis(10));
        sink.capture("1", "Alice", "beta").unwrap();
    });
    producer.join().unwrap();

    let mut completed = 0;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        completed = h
            .events()
            .iter()
            .filter(|e| matches!(e, OrchestratorEvent::TurnCompleted { .. }))
            .count();
        if completed == 2 {
            break;
        }
    }
    assert_eq!(completed, 2);

    let mut turns = h.turn_texts();
    turns.sort();
    assert_eq!(turns, vec!["alpha beta", "gamma"]);

    h.orchestrator.shutdown().await;
}

/// Speech from a speaker who barged in keeps its order across the end of
/// the agent's speech
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_barge_in_order_survives_speech_end() {
    let config = ColloquyConfig::default().with_silence_timeout_ms(100);
    let mut h = Harness::with_device(
        config,
        ScriptedEngine::new(REPLY),
        Some(SimulatedPlayback::with_pacing(0.2)),
    );

    h.orchestrator.capture("1", "Alice", "Hello").unwrap();
    for _ in 0..1000 {
        if h.orchestrator.is_speaking() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert!(h.orchestrator.is_speaking());

    h.orchestrator.capture("2", "Bob", "part1").unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.orchestrator.status().pending_barge_in, 1);

    while h.orchestrator.is_speaking() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    h.orchestrator.capture("2", "Bob", "part2").unwrap();

    let mut turns = Vec::new();
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        turns = h.turn_texts();
        if turns.iter().any(|t| t.contains("part2")) {
            break;
        }
    }

    let joined = turns.join(" ");
    assert!(turns.first().map(String::as_str) == Some("Hello"));
    assert!(joined.contains("part1"));
    assert!(joined.find("part1") < joined.find("part2"));

    h.orchestrator.shutdown().await;
}
