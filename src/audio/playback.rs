//! Playback device seam and an in-memory simulated device

use crate::audio::wav::write_wav;
use crate::speech::synthesis::{AudioChunk, DEFAULT_SAMPLE_RATE};
use crate::{ColloquyError, Result};
use futures::stream::{BoxStream, Stream, StreamExt};
use parking_lot::Mutex;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Audio handed to a playback device
///
/// Yields chunks until the synthesis stream ends or fails. A failure ends the
/// source early and is kept for the caller to inspect afterwards.
pub struct AudioSource {
    inner: BoxStream<'static, Result<AudioChunk>>,
    error: Arc<Mutex<Option<ColloquyError>>>,
    finished: bool,
}

impl AudioSource {
    pub fn new(inner: BoxStream<'static, Result<AudioChunk>>) -> Self {
        Self {
            inner,
            error: Arc::new(Mutex::new(None)),
            finished: false,
        }
    }

    /// Source over already synthesized chunks
    pub fn from_chunks(chunks: Vec<AudioChunk>) -> Self {
        Self::new(futures::stream::iter(chunks.into_iter().map(Ok)).boxed())
    }

    /// Shared slot receiving the error that ended this source, if any
    pub fn error_slot(&self) -> Arc<Mutex<Option<ColloquyError>>> {
        self.error.clone()
    }
}

impl Stream for AudioSource {
    type Item = AudioChunk;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(chunk)),
            Poll::Ready(Some(Err(e))) => {
                warn!("Audio source failed: {}", e);
                *this.error.lock() = Some(e);
                this.finished = true;
                Poll::Ready(None)
            }
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// An audio output owned by the audio manager
///
/// `play` starts playback without waiting for it; `is_playing` stays true
/// until the source is exhausted and played out, or `stop` is called.
pub trait PlaybackDevice: Send + Sync {
    fn play(&self, source: AudioSource) -> Result<()>;

    /// Stop immediately, discarding queued audio
    fn stop(&self);

    fn is_playing(&self) -> bool;
}

struct SimulatedInner {
    playing: AtomicBool,
    session: AtomicU64,
    sample_rate: AtomicU32,
    pacing: f32,
    task: Mutex<Option<JoinHandle<()>>>,
    recorded: Mutex<Vec<f32>>,
    played: Mutex<Vec<String>>,
    stops: AtomicU64,
}

/// Playback device that paces audio in real time without touching hardware
///
/// Everything played is recorded and can be exported as a WAV file.
#[derive(Clone)]
pub struct SimulatedPlayback {
    inner: Arc<SimulatedInner>,
}

impl Default for SimulatedPlayback {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedPlayback {
    /// Device playing at real-time speed
    pub fn new() -> Self {
        Self::with_pacing(1.0)
    }

    /// Device playing at `pacing` times the audio duration; 0 plays instantly
    pub fn with_pacing(pacing: f32) -> Self {
        Self {
            inner: Arc::new(SimulatedInner {
                playing: AtomicBool::new(false),
                session: AtomicU64::new(0),
                sample_rate: AtomicU32::new(DEFAULT_SAMPLE_RATE),
                pacing: pacing.max(0.0),
                task: Mutex::new(None),
                recorded: Mutex::new(Vec::new()),
                played: Mutex::new(Vec::new()),
                stops: AtomicU64::new(0),
            }),
        }
    }

    /// Text of every chunk that started playing, in order
    pub fn played_texts(&self) -> Vec<String> {
        self.inner.played.lock().clone()
    }

    pub fn recorded_samples(&self) -> Vec<f32> {
        self.inner.recorded.lock().clone()
    }

    /// Sample rate of the most recent chunk
    pub fn sample_rate(&self) -> u32 {
        self.inner.sample_rate.load(Ordering::Relaxed)
    }

    /// Number of times `stop` was called
    pub fn stop_count(&self) -> u64 {
        self.inner.stops.load(Ordering::Relaxed)
    }

    /// Export everything played so far
    pub fn write_wav<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let samples = self.recorded_samples();
        write_wav(path, &samples, self.sample_rate())
    }

    fn abort_task(&self) {
        if let Some(task) = self.inner.task.lock().take() {
            task.abort();
        }
    }
}

impl PlaybackDevice for SimulatedPlayback {
    fn play(&self, mut source: AudioSource) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ColloquyError::PlaybackError(format!("No runtime for playback: {}", e)))?;

        self.abort_task();
        let session = self.inner.session.fetch_add(1, Ordering::AcqRel) + 1;
        self.inner.playing.store(true, Ordering::Release);

        let inner = self.inner.clone();
        let task = runtime.spawn(async move {
            while let Some(chunk) = source.next().await {
                debug!("Simulated playback: {} ({}ms)", chunk.text, chunk.duration_ms());
                inner.sample_rate.store(chunk.sample_rate, Ordering::Relaxed);
                inner.played.lock().push(chunk.text.clone());
                inner.recorded.lock().extend_from_slice(&chunk.samples);

                if inner.pacing > 0.0 {
                    let secs = chunk.duration_secs() * inner.pacing;
                    tokio::time::sleep(Duration::from_secs_f32(secs)).await;
                }
            }

            if inner.session.load(Ordering::Acquire) == session {
                inner.playing.store(false, Ordering::Release);
            }
        });

        *self.inner.task.lock() = Some(task);
        Ok(())
    }

    fn stop(&self) {
        self.inner.stops.fetch_add(1, Ordering::Relaxed);
        self.inner.session.fetch_add(1, Ordering::AcqRel);
        self.abort_task();
        if self.inner.playing.swap(false, Ordering::AcqRel) {
            info!("Simulated playback stopped");
        }
    }

    fn is_playing(&self) -> bool {
        self.inner.playing.load(Ordering::Acquire)
    }
}
