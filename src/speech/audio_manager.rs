//! Audio manager: the single owner of "is the agent speaking"
//!
//! Drives chunker, synthesis and playback for one speech session at a time,
//! buffers speech captured while the agent talks and interrupts playback on
//! demand. State transitions `Idle -> Speaking -> Idle` always go through a
//! drop guard, so a speak that errors, is interrupted or is dropped still ends
//! with `is_speaking == false` and an `on_speech_end` notification.
//!
//! Barge-in speech is handed to [`SpeechHooks::on_pending_drained`] in the
//! same critical section that clears `is_speaking`, so a fragment that finds
//! the agent idle is always routed after the drained speech.

use crate::audio::playback::{AudioSource, PlaybackDevice};
use crate::messages::{PendingUtterance, SpeakerId, SpeechSession};
use crate::speech::chunker::{ChunkerConfig, SmartTextChunker};
use crate::speech::synthesis::SynthesisEngine;
use crate::utils::hooks::{guard_hook, guard_sync_hook};
use crate::Result;
use async_trait::async_trait;
use futures::future::{AbortHandle, Abortable};
use futures::stream::{BoxStream, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// How often playback completion is checked
    pub playback_poll_ms: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            playback_poll_ms: 100,
        }
    }
}

/// How a speech session ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum SpeechOutcome {
    /// All audio was played
    Completed,
    /// Stopped by `interrupt`, a newer speak or a dropped future
    Interrupted,
    /// Synthesis or playback failed
    Failed(String),
    /// No playback device attached; nothing was spoken
    NoDevice,
}

/// Speech lifecycle callbacks
///
/// Implementations must not call back into [`AudioManager::speak`] or
/// [`AudioManager::interrupt`]; both wait for the hook to return.
#[async_trait]
pub trait SpeechHooks: Send + Sync {
    /// Barge-in speech buffered during the session that just ended
    ///
    /// Called with the speaking state locked: it must not block or touch the
    /// [`AudioManager`]. The default discards the speech.
    fn on_pending_drained(&self, pending: Vec<PendingUtterance>) {
        warn!("Discarding barge-in speech from {} speakers", pending.len());
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

#[derive(Default)]
struct SpeakingState {
    speaking: bool,
    /// Barge-in speech, one entry per speaker in first-capture order
    pending: Vec<PendingUtterance>,
    in_flight: Option<InFlight>,
    /// Speaks waiting for the previous one to tear down
    starting: usize,
    /// Bumped by `interrupt` to cancel every waiting speak
    cancel_epoch: u64,
}

struct InFlight {
    abort: AbortHandle,
    session_id: Uuid,
}

pub struct AudioManager {
    config: AudioConfig,
    chunker: ChunkerConfig,
    synthesis: Arc<dyn SynthesisEngine>,
    state: Arc<Mutex<SpeakingState>>,
    device: RwLock<Option<Arc<dyn PlaybackDevice>>>,
    hooks: RwLock<Option<Arc<dyn SpeechHooks>>>,
    /// Held for the whole of a speak, teardown included
    speak_lock: tokio::sync::Mutex<()>,
}

impl AudioManager {
    pub fn new(
        config: AudioConfig,
        chunker: ChunkerConfig,
        synthesis: Arc<dyn SynthesisEngine>,
    ) -> Self {
        Self {
            config,
            chunker,
            synthesis,
            state: Arc::new(Mutex::new(SpeakingState::default())),
            device: RwLock::new(None),
            hooks: RwLock::new(None),
            speak_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn set_hooks(&self, hooks: Arc<dyn SpeechHooks>) {
        *self.hooks.write() = Some(hooks);
    }

    /// Attach the output, e.g. once a voice connection is established
    pub fn set_playback_device(&self, device: Arc<dyn PlaybackDevice>) {
        info!("Playback device attached");
        *self.device.write() = Some(device);
    }

    /// Detach the output, stopping anything it is playing
    pub fn clear_playback_device(&self) {
        let device = self.device.write().take();
        if let Some(in_flight) = self.state.lock().in_flight.take() {
            in_flight.abort.abort();
        }
        if let Some(device) = device {
            device.stop();
            info!("Playback device detached");
        }
    }

    pub fn has_playback_device(&self) -> bool {
        self.device.read().is_some()
    }

    pub fn is_speaking(&self) -> bool {
        self.state.lock().speaking
    }

    /// Speakers with buffered barge-in speech
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Speak a stream of text blocks
    ///
    /// Any speech already in progress is stopped and fully torn down first.
    /// Returns once playback finished or was interrupted.
    pub async fn speak(
        &self,
        blocks: BoxStream<'static, String>,
        session: SpeechSession,
    ) -> SpeechOutcome {
        let Some(device) = self.device.read().clone() else {
            warn!(
                "No playback device, not speaking response for {}",
                session.display_name
            );
            return SpeechOutcome::NoDevice;
        };

        let start = PendingStart::register(&self.state);

        // Waits until the prior speak has run its cleanup
        let _speaking = self.speak_lock.lock().await;

        if device.is_playing() {
            device.stop();
        }

        let (abort, registration) = AbortHandle::new_pair();
        let in_flight = InFlight {
            abort,
            session_id: session.id,
        };
        if !start.begin(in_flight) {
            info!("Speech session {} cancelled before it started", session.id);
            return SpeechOutcome::Interrupted;
        }

        let hooks = self.hooks.read().clone();
        let guard = SpeakingGuard {
            state: self.state.clone(),
            device: device.clone(),
            hooks: hooks.clone(),
            session: session.clone(),
            armed: true,
        };

        info!(
            "Speech session {} started for {}",
            session.id, session.display_name
        );
        if let Some(hooks) = &hooks {
            guard_hook("on_speech_start", hooks.on_speech_start(&session)).await;
        }

        let outcome = match Abortable::new(self.play(blocks, device), registration).await {
            Ok(Ok(())) => SpeechOutcome::Completed,
            Ok(Err(e)) => {
                warn!("Speech session {} failed: {}", session.id, e);
                SpeechOutcome::Failed(e.to_string())
            }
            Err(_) => SpeechOutcome::Interrupted,
        };

        guard.finish(&outcome).await;
        outcome
    }

    async fn play(
        &self,
        blocks: BoxStream<'static, String>,
        device: Arc<dyn PlaybackDevice>,
    ) -> Result<()> {
        let chunks = SmartTextChunker::new(self.chunker.clone())
            .into_stream(blocks)
            .boxed();
        let source = AudioSource::new(self.synthesis.stream_from_blocks(chunks));
        let failure = source.error_slot();

        device.play(source)?;

        let poll = Duration::from_millis(self.config.playback_poll_ms.max(1));
        while device.is_playing() {
            tokio::time::sleep(poll).await;
        }

        let error = failure.lock().take();
        match error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Buffer a fragment if the agent is currently speaking
    ///
    /// Returns `false` (and buffers nothing) when the agent is idle.
    pub fn capture_if_speaking(
        &self,
        speaker_id: &SpeakerId,
        display_name: &str,
        text: &str,
    ) -> bool {
        let mut state = self.state.lock();
        if !state.speaking {
            return false;
        }

        let text = text.trim();
        if text.is_empty() {
            return true;
        }

        match state.pending.iter_mut().find(|p| &p.speaker_id == speaker_id) {
            Some(pending) => {
                pending.text.push(' ');
                pending.text.push_str(text);
            }
            None => state.pending.push(PendingUtterance {
                speaker_id: speaker_id.clone(),
                display_name: display_name.to_string(),
                text: text.to_string(),
            }),
        }

        debug!("Buffered barge-in from {}: {}", display_name, text);
        true
    }

    /// Take every buffered utterance, one per speaker in first-capture order
    pub fn drain_pending(&self) -> Vec<PendingUtterance> {
        std::mem::take(&mut self.state.lock().pending)
    }

    /// Stop the current speech immediately
    ///
    /// Speaks still waiting to start are cancelled as well. Returns `false`
    /// without side effects when nothing is playing. Otherwise returns once
    /// the interrupted speak has finished its cleanup.
    pub async fn interrupt(&self) -> bool {
        let device = self.device.read().clone();
        let playing = device.as_ref().map(|d| d.is_playing()).unwrap_or(false);
        let (in_flight, starting) = {
            let mut state = self.state.lock();
            let starting = state.starting > 0;
            if starting {
                state.cancel_epoch += 1;
            }
            (state.in_flight.take(), starting)
        };

        if in_flight.is_none() && !playing && !starting {
            return false;
        }

        info!("Interrupting speech");
        if let Some(in_flight) = in_flight {
            in_flight.abort.abort();
        }
        if let Some(device) = device {
            device.stop();
        }

        drop(self.speak_lock.lock().await);
        true
    }
}

/// A speak queued behind the previous one
///
/// Counted in [`SpeakingState::starting`] until it begins or is dropped, so
/// `interrupt` can cancel it before any audio plays.
struct PendingStart {
    state: Arc<Mutex<SpeakingState>>,
    epoch: u64,
    waiting: bool,
}

impl PendingStart {
    /// Register a new speak and abort the one in flight
    fn register(state: &Arc<Mutex<SpeakingState>>) -> Self {
        let mut guard = state.lock();
        guard.starting += 1;
        if let Some(prior) = guard.in_flight.take() {
            debug!("Cancelling speech session {}", prior.session_id);
            prior.abort.abort();
        }

        Self {
            state: state.clone(),
            epoch: guard.cancel_epoch,
            waiting: true,
        }
    }

    /// Enter `Speaking`, unless an interrupt arrived while waiting
    fn begin(mut self, in_flight: InFlight) -> bool {
        self.waiting = false;
        let mut state = self.state.lock();
        state.starting -= 1;

        if state.cancel_epoch != self.epoch {
            return false;
        }
        state.in_flight = Some(in_flight);
        state.speaking = true;
        true
    }
}

impl Drop for PendingStart {
    fn drop(&mut self) {
        if self.waiting {
            self.state.lock().starting -= 1;
        }
    }
}

/// Returns the manager to idle on every exit path of a speak
struct SpeakingGuard {
    state: Arc<Mutex<SpeakingState>>,
    device: Arc<dyn PlaybackDevice>,
    hooks: Option<Arc<dyn SpeechHooks>>,
    session: SpeechSession,
    armed: bool,
}

impl SpeakingGuard {
    fn release(&self) {
        {
            let mut state = self.state.lock();
            state.speaking = false;
            if state
                .in_flight
                .as_ref()
                .map(|f| f.session_id == self.session.id)
                .unwrap_or(false)
            {
                state.in_flight = None;
            }

            let drained = std::mem::take(&mut state.pending);
            if !drained.is_empty() {
                match &self.hooks {
                    Some(hooks) => {
                        guard_sync_hook("on_pending_drained", || {
                            hooks.on_pending_drained(drained)
                        });
                    }
                    None => warn!(
                        "No speech hooks, discarding barge-in from {} speakers",
                        drained.len()
                    ),
                }
            }
        }

        if self.device.is_playing() {
            self.device.stop();
        }
    }

    async fn finish(mut self, outcome: &SpeechOutcome) {
        self.armed = false;
        self.release();
        info!("Speech session {} ended: {:?}", self.session.id, outcome);

        if let Some(hooks) = &self.hooks {
            guard_hook("on_speech_end", hooks.on_speech_end(&self.session, outcome)).await;
        }
    }
}

impl Drop for SpeakingGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        warn!("Speech session {} dropped mid-playback", self.session.id);
        self.release();

        let Some(hooks) = self.hooks.clone() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let session = self.session.clone();
                runtime.spawn(async move {
                    guard_hook(
                        "on_speech_end",
                        hooks.on_speech_end(&session, &SpeechOutcome::Interrupted),
                    )
                    .await;
                });
            }
            Err(_) => warn!("No runtime, skipping on_speech_end for dropped session"),
        }
    }
}
