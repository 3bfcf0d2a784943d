//! Smart text chunker for streaming speech synthesis
//!
//! A generation engine streams its answer as many small fragments. Sending each
//! fragment to the synthesizer separately produces clipped, unnatural speech,
//! so this module groups fragments into chunks that end at plausible break
//! points (sentence ends, complete phrases) before they are synthesized.

use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Chunks shorter than this are never emitted before the stream ends
pub const MIN_EMIT_CHARS: usize = 5;

/// Final remainders shorter than this are discarded
pub const MIN_FINAL_CHARS: usize = 3;

/// A word-boundary break needs a final word at least this long
const MIN_LAST_WORD_CHARS: usize = 4;

const STRONG_TERMINATORS: [char; 3] = ['.', '!', '?'];
const WEAK_TERMINATORS: [char; 3] = [',', ';', ':'];

/// Words after which a sentence almost always continues (English and Spanish)
const CONTINUATION_WORDS: &[&str] = &[
    "y", "o", "pero", "sin", "con", "de", "en", "a", "por", "para", "que", "como", "cuando",
    "donde", "mientras", "aunque", "si", "and", "or", "but", "with", "without", "of", "in", "at",
    "by", "for", "from", "to", "that", "which", "when", "where", "while", "although", "if",
    "because",
];

/// Configuration for the chunker
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerConfig {
    /// Minimum length before a complete phrase is emitted at a word boundary
    pub min_chunk_size: usize,

    /// Minimum length before a buffer ending a sentence is emitted
    pub min_sentence_size: usize,

    /// Buffers longer than this are force-split
    pub max_chunk_size: usize,

    /// How far back from the limit a forced split looks for a sentence end
    pub split_lookback: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            min_chunk_size: 30,
            min_sentence_size: 10,
            max_chunk_size: 200,
            split_lookback: 50,
        }
    }
}

impl ChunkerConfig {
    /// Set the minimum chunk size; the sentence minimum never exceeds it
    pub fn with_min_chunk_size(mut self, size: usize) -> Self {
        self.min_chunk_size = size;
        self.min_sentence_size = self.min_sentence_size.min(size);
        self
    }

    /// Set the sentence minimum
    pub fn with_min_sentence_size(mut self, size: usize) -> Self {
        self.min_sentence_size = size;
        self
    }

    /// Set the hard maximum
    pub fn with_max_chunk_size(mut self, size: usize) -> Self {
        self.max_chunk_size = size;
        self
    }

    /// Set the forced-split lookback window
    pub fn with_split_lookback(mut self, lookback: usize) -> Self {
        self.split_lookback = lookback;
        self
    }

    /// Clamp thresholds so no early chunk can fall under the emit floor
    fn normalized(mut self) -> Self {
        self.min_chunk_size = self.min_chunk_size.max(MIN_EMIT_CHARS);
        self.min_sentence_size = self.min_sentence_size.max(MIN_EMIT_CHARS);
        self.max_chunk_size = self.max_chunk_size.max(MIN_EMIT_CHARS * 2);
        self
    }
}

/// Classification of an incoming fragment
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FragmentClass {
    /// Only spaces or line breaks
    Whitespace,
    /// Only sentence punctuation
    Punctuation,
    /// Up to 15 characters
    Short,
    /// Up to 50 characters
    Medium,
    /// More than 50 characters
    Long,
}

/// Classify a fragment by its trimmed content
pub fn classify(fragment: &str) -> FragmentClass {
    let trimmed = fragment.trim();
    if trimmed.is_empty() {
        return FragmentClass::Whitespace;
    }

    if trimmed
        .chars()
        .all(|c| c.is_whitespace() || STRONG_TERMINATORS.contains(&c) || WEAK_TERMINATORS.contains(&c))
    {
        return FragmentClass::Punctuation;
    }

    match char_len(trimmed) {
        0..=15 => FragmentClass::Short,
        16..=50 => FragmentClass::Medium,
        _ => FragmentClass::Long,
    }
}

/// Streaming chunker for one text-to-speech operation
///
/// Feed fragments with [`push`](Self::push) and collect the remainder with
/// [`finish`](Self::finish) once the stream is exhausted.
#[derive(Clone, Debug)]
pub struct SmartTextChunker {
    config: ChunkerConfig,

    /// Accumulated, whitespace-normalized text
    buffer: String,

    /// The buffer was judged complete at a word boundary; the next fragment
    /// decides whether it is emitted or extended with trailing punctuation
    boundary_pending: bool,
}

impl Default for SmartTextChunker {
    fn default() -> Self {
        Self::new(ChunkerConfig::default())
    }
}

impl SmartTextChunker {
    /// Create a new chunker
    pub fn new(config: ChunkerConfig) -> Self {
        Self {
            config: config.normalized(),
            buffer: String::new(),
            boundary_pending: false,
        }
    }

    /// Feed a fragment and return any chunks that became ready
    pub fn push(&mut self, fragment: &str) -> Vec<String> {
        let class = classify(fragment);
        let mut ready = Vec::new();

        if class == FragmentClass::Whitespace {
            return ready;
        }

        debug!("Chunker fragment ({:?}): {:?}", class, fragment);

        if self.boundary_pending {
            self.boundary_pending = false;
            if class != FragmentClass::Punctuation {
                ready.push(self.take_buffer());
            }
        }

        self.append(fragment, class);
        self.evaluate(&mut ready);

        for chunk in &ready {
            debug!("Chunk ready ({} chars): {}", char_len(chunk), chunk);
        }

        ready
    }

    /// Flush the remainder at end of stream
    ///
    /// Remainders under three characters are dropped rather than synthesized.
    pub fn finish(&mut self) -> Option<String> {
        self.boundary_pending = false;
        let rest = self.take_buffer();

        if char_len(&rest) >= MIN_FINAL_CHARS {
            Some(rest)
        } else {
            if !rest.is_empty() {
                debug!("Discarding short final fragment: {:?}", rest);
            }
            None
        }
    }

    /// Current buffered text
    pub fn buffered(&self) -> &str {
        &self.buffer
    }

    /// Turn a stream of fragments into a stream of chunks
    pub fn into_stream<S>(mut self, blocks: S) -> impl Stream<Item = String> + Send + 'static
    where
        S: Stream<Item = String> + Send + 'static,
    {
        async_stream::stream! {
            let mut blocks = Box::pin(blocks);
            while let Some(block) = blocks.next().await {
                for chunk in self.push(&block) {
                    yield chunk;
                }
            }
            if let Some(chunk) = self.finish() {
                yield chunk;
            }
        }
    }

    fn append(&mut self, fragment: &str, class: FragmentClass) {
        let normalized = fragment.split_whitespace().collect::<Vec<_>>().join(" ");

        if class != FragmentClass::Punctuation && !self.buffer.is_empty() {
            self.buffer.push(' ');
        }
        self.buffer.push_str(&normalized);
    }

    fn evaluate(&mut self, ready: &mut Vec<String>) {
        while char_len(&self.buffer) > self.config.max_chunk_size {
            match self.force_split() {
                Some(chunk) => ready.push(chunk),
                None => break,
            }
        }

        let len = char_len(self.buffer.trim());

        if len >= self.config.min_sentence_size && ends_with_strong(&self.buffer) {
            ready.push(self.take_buffer());
            return;
        }

        if len >= self.config.min_chunk_size && is_complete_phrase(&self.buffer) {
            self.boundary_pending = true;
        }
    }

    /// Split an over-long buffer, preferring sentence ends, then word
    /// boundaries, then the midpoint
    fn force_split(&mut self) -> Option<String> {
        let max = self.config.max_chunk_size;
        let window: Vec<(usize, char)> = self.buffer.char_indices().take(max + 1).collect();

        let head = window.len().min(max);
        let lower = head.saturating_sub(self.config.split_lookback);
        for &(idx, c) in window[lower..head].iter().rev() {
            if STRONG_TERMINATORS.contains(&c) {
                let cut = idx + c.len_utf8();
                if char_len(self.buffer[..cut].trim()) >= MIN_EMIT_CHARS {
                    debug!("Forced split at sentence end");
                    return Some(self.split_at(cut));
                }
            }
        }

        for &(idx, c) in window.iter().rev() {
            if c.is_whitespace() && char_len(self.buffer[..idx].trim()) >= MIN_EMIT_CHARS {
                debug!("Forced split at word boundary");
                return Some(self.split_at(idx));
            }
        }

        let mid = window.get(max / 2).map(|&(idx, _)| idx)?;
        if char_len(self.buffer[..mid].trim()) >= MIN_EMIT_CHARS {
            debug!("Forced split at midpoint");
            return Some(self.split_at(mid));
        }

        debug!("Forced split would leave a tiny fragment, keeping buffer");
        None
    }

    fn split_at(&mut self, cut: usize) -> String {
        let chunk = self.buffer[..cut].trim().to_string();
        self.buffer = self.buffer[cut..].trim_start().to_string();
        chunk
    }

    fn take_buffer(&mut self) -> String {
        let chunk = self.buffer.trim().to_string();
        self.buffer.clear();
        chunk
    }
}

/// Chunk a complete fragment sequence
///
/// Useful for testing or when the whole response is already available.
pub fn chunk_all<I, S>(config: ChunkerConfig, fragments: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut chunker = SmartTextChunker::new(config);
    let mut chunks = Vec::new();

    for fragment in fragments {
        chunks.extend(chunker.push(fragment.as_ref()));
    }
    chunks.extend(chunker.finish());

    chunks
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

fn ends_with_strong(text: &str) -> bool {
    text.trim_end().ends_with(&STRONG_TERMINATORS[..])
}

/// Word-boundary completeness: a long enough final word that is neither
/// followed by weak punctuation nor a continuation word
fn is_complete_phrase(text: &str) -> bool {
    let text = text.trim();

    if text.ends_with(&WEAK_TERMINATORS[..]) {
        return false;
    }

    let last_word = text.rsplit(char::is_whitespace).next().unwrap_or(text);
    if char_len(last_word) < MIN_LAST_WORD_CHARS {
        return false;
    }

    let bare: String = last_word
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect::<String>()
        .to_lowercase();

    !CONTINUATION_WORDS.contains(&bare.as_str())
}
