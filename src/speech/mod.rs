//! Speaking: text chunking, synthesis and the audio manager
//!
//! This module provides:
//! - Smart chunking of streamed text into speakable pieces
//! - The synthesis engine seam with a tone-based reference synthesizer
//! - The audio manager owning playback and barge-in buffering

pub mod audio_manager;
pub mod chunker;
pub mod synthesis;

pub use audio_manager::{AudioConfig, AudioManager, SpeechHooks, SpeechOutcome};
pub use chunker::{chunk_all, ChunkerConfig, FragmentClass, SmartTextChunker};
pub use synthesis::{AudioChunk, SynthesisEngine, ToneConfig, ToneSynthesizer};
