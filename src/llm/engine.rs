//! Streaming text-generation engine seam
//!
//! The orchestrator never talks to a model directly. Anything that can turn a
//! prompt into a stream of text blocks implements [`GenerationEngine`].

use crate::Result;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::time::Duration;
use tracing::debug;

/// A text-generation backend producing its answer incrementally
#[async_trait]
pub trait GenerationEngine: Send + Sync {
    /// Start generating a response for `prompt`
    ///
    /// The returned stream yields text blocks in order. An `Err` item aborts
    /// the response.
    async fn stream(&self, prompt: &str) -> Result<BoxStream<'static, Result<String>>>;
}

/// Reference engine that repeats the prompt back word by word
#[derive(Debug, Clone)]
pub struct EchoEngine {
    prefix: String,
    word_delay: Duration,
}

impl Default for EchoEngine {
    fn default() -> Self {
        Self {
            prefix: "I heard:".to_string(),
            word_delay: Duration::from_millis(20),
        }
    }
}

impl EchoEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Text spoken before the echoed prompt
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Pause between streamed words, imitating token latency
    pub fn with_word_delay(mut self, delay: Duration) -> Self {
        self.word_delay = delay;
        self
    }

    fn reply_words(&self, prompt: &str) -> Vec<String> {
        let reply = format!("{} {}", self.prefix, prompt.trim());
        reply
            .split_whitespace()
            .enumerate()
            .map(|(i, word)| if i == 0 { word.to_string() } else { format!(" {}", word) })
            .collect()
    }
}

#[async_trait]
impl GenerationEngine for EchoEngine {
    async fn stream(&self, prompt: &str) -> Result<BoxStream<'static, Result<String>>> {
        let words = self.reply_words(prompt);
        let delay = self.word_delay;
        debug!("Echo engine streaming {} words", words.len());

        let stream = async_stream::stream! {
            for word in words {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                yield Ok(word);
            }
        };

        Ok(stream.boxed())
    }
}
