//! Colloquy demo
//!
//! Runs a scripted two-person conversation against the reference engines: a
//! capture thread feeds recognized fragments (including a barge-in while the
//! agent talks), the echo engine answers and the simulated device records the
//! spoken audio to a WAV file.

use anyhow::{Context, Result};
use colloquy::audio::SimulatedPlayback;
use colloquy::integration::event_channel;
use colloquy::llm::EchoEngine;
use colloquy::speech::ToneSynthesizer;
use colloquy::{CaptureSink, ColloquyConfig, Orchestrator};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// (delay before fragment ms, speaker id, display name, text)
const SCRIPT: &[(u64, &str, &str, &str)] = &[
    (0, "1001", "Alice", "Hello"),
    (150, "1001", "Alice", "there,"),
    (200, "1001", "Alice", "how is the weather today?"),
    (3200, "1002", "Bob", "Sorry to interrupt,"),
    (150, "1002", "Bob", "can I ask something too?"),
];

const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "colloquy=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Colloquy demo");

    let config = match std::env::var("COLLOQUY_CONFIG") {
        Ok(path) => ColloquyConfig::load(&path)
            .with_context(|| format!("loading configuration from {}", path))?,
        Err(_) => ColloquyConfig::default(),
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building the runtime")?;

    runtime.block_on(run(config))
}

async fn run(config: ColloquyConfig) -> Result<()> {
    let device = SimulatedPlayback::new();
    let (hooks, events) = event_channel();

    let orchestrator = Orchestrator::builder()
        .with_config(config)
        .with_generation_engine(Arc::new(EchoEngine::new()))
        .with_synthesis_engine(Arc::new(ToneSynthesizer::default()))
        .with_hooks(Arc::new(hooks))
        .with_playback_device(Arc::new(device.clone()))
        .build()?;
    orchestrator.start()?;

    let logger = std::thread::spawn(move || {
        for event in events.iter() {
            match serde_json::to_string(&event) {
                Ok(json) => info!("event: {}", json),
                Err(e) => warn!("Unserializable event: {}", e),
            }
        }
    });

    let sink = orchestrator.capture_sink();
    let capture = std::thread::spawn(move || play_script(sink));

    let started = Instant::now();
    loop {
        tokio::time::sleep(Duration::from_millis(200)).await;

        let status = orchestrator.status();
        let idle = capture.is_finished()
            && !status.speaking
            && status.queued_fragments == 0
            && status.pending_barge_in == 0
            && status.conversation.buffered_speakers == 0
            && status.conversation.queued_turns == 0
            && !status.conversation.processing;

        if idle {
            break;
        }
        if started.elapsed() > IDLE_TIMEOUT {
            warn!("Conversation did not settle, shutting down anyway");
            break;
        }
    }

    let status = orchestrator.status();
    info!("Final status: {}", serde_json::to_string(&status)?);
    info!("Latency: {}", status.conversation.latency.summary());

    orchestrator.shutdown().await;
    drop(orchestrator);

    if capture.join().is_err() {
        warn!("Capture thread panicked");
    }
    if logger.join().is_err() {
        warn!("Event logger panicked");
    }

    let wav_path = std::env::var("COLLOQUY_WAV")
        .unwrap_or_else(|_| std::env::temp_dir().join("colloquy-demo.wav").display().to_string());
    device.write_wav(&wav_path)?;
    info!(
        "Spoke {} chunks, audio written to {}",
        device.played_texts().len(),
        wav_path
    );

    Ok(())
}

/// Stand-in for a speech recognizer calling back on its own thread
fn play_script(sink: CaptureSink) {
    for &(delay_ms, speaker_id, name, text) in SCRIPT {
        std::thread::sleep(Duration::from_millis(delay_ms));
        info!("[{}] {}", name, text);
        if let Err(e) = sink.capture(speaker_id, name, text) {
            warn!("Capture failed: {}", e);
            return;
        }
    }
}
