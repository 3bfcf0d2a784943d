//! Colloquy - turn-taking orchestrator for real-time voice conversation agents
//!
//! Accumulates recognized speech fragments into utterances, drives a streaming
//! text-generation engine one turn at a time, speaks the response incrementally
//! and buffers barge-in speech while the agent is talking.

pub mod audio;
pub mod integration;
pub mod llm;
pub mod messages;
pub mod speech;
pub mod utils;

pub use integration::{
    CaptureSink, ColloquyConfig, EventHooks, Orchestrator, OrchestratorBuilder,
    OrchestratorEvent, OrchestratorStatus,
};
pub use messages::{ConversationTurn, FragmentEvent, SpeakerId, SpeechSession};

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum ColloquyError {
    #[error("Generation error: {0}")]
    GenerationError(String),

    #[error("Synthesis error: {0}")]
    SynthesisError(String),

    #[error("Playback error: {0}")]
    PlaybackError(String),

    #[error("Audio device error: {0}")]
    AudioDeviceError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("IO error: {0}")]
    IOError(String),

    #[error("Timed out: {0}")]
    Timeout(String),
}

impl From<std::io::Error> for ColloquyError {
    fn from(e: std::io::Error) -> Self {
        ColloquyError::IOError(e.to_string())
    }
}

impl ColloquyError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            // Engine hiccups are retried on the next turn
            ColloquyError::GenerationError(_) => true,
            ColloquyError::SynthesisError(_) => true,
            ColloquyError::PlaybackError(_) => true,
            ColloquyError::Timeout(_) => true,
            // Hardware/device errors may require user intervention
            ColloquyError::AudioDeviceError(_) => false,
            ColloquyError::ConfigError(_) => false,
            ColloquyError::ChannelError(_) => false,
            ColloquyError::IOError(_) => false,
        }
    }

    /// Get a user-friendly description
    pub fn user_message(&self) -> String {
        match self {
            ColloquyError::GenerationError(_) => {
                "Response generation failed. A fallback reply was used.".to_string()
            }
            ColloquyError::SynthesisError(_) => {
                "Speech synthesis failed for this response.".to_string()
            }
            ColloquyError::PlaybackError(_) => {
                "Audio playback failed. Please check the voice connection.".to_string()
            }
            ColloquyError::AudioDeviceError(_) => {
                "Audio device error. Please check your speakers.".to_string()
            }
            ColloquyError::ConfigError(_) => {
                "Configuration error. Please check settings.".to_string()
            }
            ColloquyError::ChannelError(_) => {
                "Internal communication error. Please restart the agent.".to_string()
            }
            ColloquyError::IOError(_) => "File system error occurred.".to_string(),
            ColloquyError::Timeout(_) => {
                "An operation took too long and was abandoned.".to_string()
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, ColloquyError>;
