//! Turn handling: utterance debouncing and the generation engine seam

pub mod conversation;
pub mod engine;

pub use conversation::{
    ConversationCommand, ConversationConfig, ConversationManager, ConversationStatus,
    ConversationWorker, NoopTurnHooks, TurnHooks,
};
pub use engine::{EchoEngine, GenerationEngine};
