//! Configuration for the orchestrator
//!
//! Provides centralized configuration for all components. Every field has a
//! default, so a TOML file only needs the values it changes.

use crate::llm::conversation::ConversationConfig;
use crate::speech::audio_manager::AudioConfig;
use crate::speech::chunker::{ChunkerConfig, MIN_EMIT_CHARS};
use crate::utils::bridge::BridgeConfig;
use crate::{ColloquyError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// What a fragment captured during agent speech does besides being buffered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BargeInAction {
    /// Keep talking; the fragment is replayed once speech ends
    #[default]
    Buffer,
    /// Stop talking immediately
    Interrupt,
}

/// Configuration for the complete orchestrator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColloquyConfig {
    pub conversation: ConversationConfig,
    pub chunker: ChunkerConfig,
    pub audio: AudioConfig,
    pub bridge: BridgeConfig,
    pub barge_in: BargeInAction,
}

impl ColloquyConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ColloquyError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let config = Self::from_toml(&contents)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|e| ColloquyError::ConfigError(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_silence_timeout_ms(mut self, ms: u64) -> Self {
        self.conversation.silence_timeout_ms = ms;
        self
    }

    pub fn with_fallback_responses(mut self, responses: Vec<String>) -> Self {
        self.conversation.fallback_responses = responses;
        self
    }

    pub fn with_chunker(mut self, chunker: ChunkerConfig) -> Self {
        self.chunker = chunker;
        self
    }

    pub fn with_bridge(mut self, bridge: BridgeConfig) -> Self {
        self.bridge = bridge;
        self
    }

    pub fn with_barge_in(mut self, action: BargeInAction) -> Self {
        self.barge_in = action;
        self
    }

    /// Validate the configuration
    ///
    /// A zero `silence_timeout_ms` is allowed and finalizes every fragment as
    /// its own utterance.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(ColloquyError::ConfigError(msg));

        if self.conversation.generation_timeout_ms == 0 {
            return invalid("generation_timeout_ms must be greater than zero".into());
        }
        if !self.conversation.prompt_template.contains("{text}") {
            return invalid("prompt_template must contain {text}".into());
        }

        let chunker = &self.chunker;
        if chunker.min_chunk_size < MIN_EMIT_CHARS || chunker.min_sentence_size < MIN_EMIT_CHARS {
            return invalid(format!("chunk minimums must be at least {}", MIN_EMIT_CHARS));
        }
        if chunker.max_chunk_size < chunker.min_chunk_size.max(chunker.min_sentence_size) {
            return invalid(format!(
                "max_chunk_size ({}) must not be below the chunk minimums",
                chunker.max_chunk_size
            ));
        }

        if self.bridge.capacity == 0 {
            return invalid("bridge capacity must be greater than zero".into());
        }
        if self.audio.playback_poll_ms == 0 {
            return invalid("playback_poll_ms must be greater than zero".into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::bridge::OverflowPolicy;

    #[test]
    fn test_default_config() {
        let config = ColloquyConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.conversation.silence_timeout_ms, 2000);
        assert_eq!(config.chunker.min_chunk_size, 30);
        assert_eq!(config.chunker.max_chunk_size, 200);
        assert_eq!(config.bridge.capacity, 256);
        assert_eq!(config.audio.playback_poll_ms, 100);
        assert_eq!(config.barge_in, BargeInAction::Buffer);
    }

    #[test]
    fn test_partial_toml() {
        let config = ColloquyConfig::from_toml(
            r#"
            barge_in = "interrupt"

            [conversation]
            silence_timeout_ms = 4500
            fallback_responses = ["Perdona, no te entendí."]

            [bridge]
            overflow = "block"
            "#,
        )
        .unwrap();

        assert_eq!(config.barge_in, BargeInAction::Interrupt);
        assert_eq!(config.conversation.silence_timeout_ms, 4500);
        assert_eq!(config.conversation.generation_timeout_ms, 30_000);
        assert_eq!(config.bridge.overflow, OverflowPolicy::Block);
        assert_eq!(config.chunker, ChunkerConfig::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = ColloquyConfig::default();
        config.conversation.generation_timeout_ms = 0;
        assert!(matches!(config.validate(), Err(ColloquyError::ConfigError(_))));

        let config = ColloquyConfig::default()
            .with_chunker(ChunkerConfig::default().with_max_chunk_size(20));
        assert!(config.validate().is_err());

        assert!(ColloquyConfig::from_toml("barge_in = \"shout\"").is_err());
    }

    #[test]
    fn test_zero_silence_timeout_allowed() {
        let config = ColloquyConfig::default().with_silence_timeout_ms(0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_missing_file() {
        let result = ColloquyConfig::load("/nonexistent/colloquy.toml");
        assert!(matches!(result, Err(ColloquyError::ConfigError(_))));
    }
}
