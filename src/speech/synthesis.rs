//! Speech synthesis seam and a tone-based reference synthesizer

use crate::Result;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;
use tracing::debug;

/// Default sample rate for synthesized audio
pub const DEFAULT_SAMPLE_RATE: u32 = 22050;

/// One unit of synthesized mono audio
#[derive(Clone, Debug, PartialEq)]
pub struct AudioChunk {
    /// Audio samples (f32, mono)
    pub samples: Vec<f32>,

    pub sample_rate: u32,

    /// Text this audio speaks
    pub text: String,
}

impl AudioChunk {
    pub fn new(samples: Vec<f32>, sample_rate: u32, text: impl Into<String>) -> Self {
        Self {
            samples,
            sample_rate,
            text: text.into(),
        }
    }

    /// Get the duration of this audio in seconds
    pub fn duration_secs(&self) -> f32 {
        self.samples.len() as f32 / self.sample_rate as f32
    }

    /// Get the duration of this audio in milliseconds
    pub fn duration_ms(&self) -> u64 {
        (self.samples.len() as u64 * 1000) / self.sample_rate.max(1) as u64
    }
}

/// A text-to-speech backend
///
/// Receives speakable chunks as they are produced and yields audio in the
/// same order. An `Err` item ends the speech cycle.
pub trait SynthesisEngine: Send + Sync {
    fn stream_from_blocks(
        &self,
        blocks: BoxStream<'static, String>,
    ) -> BoxStream<'static, Result<AudioChunk>>;
}

/// Configuration for [`ToneSynthesizer`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToneConfig {
    pub sample_rate: u32,
    pub frequency_hz: f32,
    pub amplitude: f32,
    /// Audio length produced per character of text
    pub ms_per_char: u32,
}

impl Default for ToneConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            frequency_hz: 220.0,
            amplitude: 0.2,
            ms_per_char: 40,
        }
    }
}

/// Reference synthesizer rendering each chunk as a sine tone
///
/// The tone lasts proportionally to the text length, which is enough to drive
/// realistic playback timing without a voice model.
#[derive(Clone, Debug, Default)]
pub struct ToneSynthesizer {
    config: ToneConfig,
}

impl ToneSynthesizer {
    pub fn new(config: ToneConfig) -> Self {
        Self { config }
    }

    /// Render one chunk of text
    pub fn synthesize(&self, text: &str) -> AudioChunk {
        let text = normalize_text_for_speech(text);
        let rate = self.config.sample_rate;
        let duration_ms = text.chars().count() as u64 * self.config.ms_per_char as u64;
        let len = (duration_ms * rate as u64 / 1000) as usize;
        let step = 2.0 * PI * self.config.frequency_hz / rate as f32;

        let samples = (0..len)
            .map(|i| (i as f32 * step).sin() * self.config.amplitude)
            .collect();

        AudioChunk::new(samples, rate, text)
    }
}

impl SynthesisEngine for ToneSynthesizer {
    fn stream_from_blocks(
        &self,
        blocks: BoxStream<'static, String>,
    ) -> BoxStream<'static, Result<AudioChunk>> {
        let synth = self.clone();

        blocks
            .filter(|text| futures::future::ready(!text.trim().is_empty()))
            .map(move |text| {
                let chunk = synth.synthesize(&text);
                debug!("Synthesized {}ms for: {}", chunk.duration_ms(), chunk.text);
                Ok(chunk)
            })
            .boxed()
    }
}

/// Expand abbreviations a synthesizer would otherwise spell out
pub fn normalize_text_for_speech(text: &str) -> String {
    let abbreviations = [
        ("Mr.", "Mister"),
        ("Mrs.", "Misses"),
        ("Ms.", "Miss"),
        ("Dr.", "Doctor"),
        ("Prof.", "Professor"),
        ("Sr.", "Señor"),
        ("Sra.", "Señora"),
        ("vs.", "versus"),
        ("etc.", "etcetera"),
        ("e.g.", "for example"),
        ("i.e.", "that is"),
    ];

    text.split_whitespace()
        .map(|word| {
            abbreviations
                .iter()
                .find(|(abbr, _)| *abbr == word)
                .map(|(_, full)| *full)
                .unwrap_or(word)
        })
        .collect::<Vec<_>>()
        .join(" ")
}
