use crate::audio::playback::{AudioSource, PlaybackDevice};
use crate::audio::resampler::OutputResampler;
use crate::{ColloquyError, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::bounded;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

#[derive(Default)]
struct OutputShared {
    buffer: Mutex<VecDeque<f32>>,
    /// A source is still being fed into the buffer
    feeding: AtomicBool,
    playing: AtomicBool,
    session: AtomicU64,
}

/// Playback on the default output device
///
/// The cpal stream is not `Send`, so it lives on a dedicated thread for the
/// lifetime of the device; `play` only feeds a shared sample buffer.
pub struct CpalPlayback {
    shared: Arc<OutputShared>,
    sample_rate: u32,
    channels: u16,
    feeder: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: crossbeam_channel::Sender<()>,
}

impl CpalPlayback {
    /// Open the default output device
    pub fn new() -> Result<Self> {
        let shared = Arc::new(OutputShared::default());
        let (ready_tx, ready_rx) = bounded::<Result<(u32, u16)>>(1);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);

        let stream_shared = shared.clone();
        std::thread::Builder::new()
            .name("colloquy-output".into())
            .spawn(move || match build_stream(stream_shared) {
                Ok((stream, rate, channels)) => {
                    let _ = ready_tx.send(Ok((rate, channels)));
                    let _ = shutdown_rx.recv();
                    drop(stream);
                    debug!("Output stream closed");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| ColloquyError::AudioDeviceError(format!("Failed to spawn output thread: {}", e)))?;

        let (sample_rate, channels) = ready_rx
            .recv()
            .map_err(|_| ColloquyError::AudioDeviceError("Output thread exited".into()))??;

        Ok(Self {
            shared,
            sample_rate,
            channels,
            feeder: Mutex::new(None),
            shutdown_tx,
        })
    }

    /// Get the sample rate of the output device
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Get the number of channels
    pub fn channels(&self) -> u16 {
        self.channels
    }

    fn abort_feeder(&self) {
        if let Some(feeder) = self.feeder.lock().take() {
            feeder.abort();
        }
    }
}

fn build_stream(shared: Arc<OutputShared>) -> Result<(cpal::Stream, u32, u16)> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| ColloquyError::AudioDeviceError("No output device available".into()))?;

    info!(
        "Using output device: {}",
        device.name().unwrap_or_else(|_| "Unknown".to_string())
    );

    let config: cpal::StreamConfig = device
        .default_output_config()
        .map_err(|e| ColloquyError::AudioDeviceError(format!("Failed to get output config: {}", e)))?
        .into();

    let channels = config.channels as usize;
    let err_fn = |err| {
        error!("Audio output stream error: {}", err);
    };

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mut buffer = shared.buffer.lock();

                for frame in data.chunks_mut(channels) {
                    let sample = buffer.pop_front().unwrap_or(0.0);
                    frame.fill(sample);
                }

                if buffer.is_empty() && !shared.feeding.load(Ordering::Acquire) {
                    shared.playing.store(false, Ordering::Release);
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| ColloquyError::AudioDeviceError(format!("Failed to build output stream: {}", e)))?;

    stream
        .play()
        .map_err(|e| ColloquyError::AudioDeviceError(format!("Failed to start output stream: {}", e)))?;

    Ok((stream, config.sample_rate.0, config.channels))
}

/// Convert a chunk to the device rate, reusing the session's resampler
fn to_output_rate(
    resampler: &mut Option<OutputResampler>,
    samples: &[f32],
    from: u32,
    to: u32,
) -> Result<Vec<f32>> {
    if from == to {
        return Ok(samples.to_vec());
    }

    if !resampler.as_ref().map(|r| r.converts(from, to)).unwrap_or(false) {
        *resampler = Some(OutputResampler::new(from, to)?);
    }
    match resampler.as_mut() {
        Some(resampler) => resampler.process(samples),
        None => Ok(samples.to_vec()),
    }
}

impl PlaybackDevice for CpalPlayback {
    fn play(&self, mut source: AudioSource) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ColloquyError::PlaybackError(format!("No runtime for playback: {}", e)))?;

        self.stop();
        let session = self.shared.session.load(Ordering::Acquire);
        self.shared.feeding.store(true, Ordering::Release);
        self.shared.playing.store(true, Ordering::Release);

        let shared = self.shared.clone();
        let output_rate = self.sample_rate;
        let feeder = runtime.spawn(async move {
            let mut resampler: Option<OutputResampler> = None;

            while let Some(chunk) = source.next().await {
                let converted = to_output_rate(
                    &mut resampler,
                    &chunk.samples,
                    chunk.sample_rate,
                    output_rate,
                );
                let samples = match converted {
                    Ok(samples) => samples,
                    Err(e) => {
                        error!("Dropping rest of playback: {}", e);
                        break;
                    }
                };
                if shared.session.load(Ordering::Acquire) != session {
                    return;
                }
                shared.buffer.lock().extend(samples);
            }
            shared.feeding.store(false, Ordering::Release);
        });

        *self.feeder.lock() = Some(feeder);
        Ok(())
    }

    fn stop(&self) {
        self.shared.session.fetch_add(1, Ordering::AcqRel);
        self.abort_feeder();
        self.shared.feeding.store(false, Ordering::Release);
        self.shared.buffer.lock().clear();
        if self.shared.playing.swap(false, Ordering::AcqRel) {
            info!("Stopped audio playback");
        }
    }

    fn is_playing(&self) -> bool {
        self.shared.playing.load(Ordering::Acquire)
    }
}

impl Drop for CpalPlayback {
    fn drop(&mut self) {
        self.stop();
        let _ = self.shutdown_tx.send(());
    }
}
