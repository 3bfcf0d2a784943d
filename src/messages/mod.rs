pub mod types;

pub use types::{ConversationTurn, FragmentEvent, PendingUtterance, SpeakerId, SpeechSession};
