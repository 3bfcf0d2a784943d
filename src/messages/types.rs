use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable identifier of a human participant
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SpeakerId(String);

impl SpeakerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SpeakerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SpeakerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for SpeakerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<u64> for SpeakerId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

/// One partial recognition result delivered by the capture source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FragmentEvent {
    pub speaker_id: SpeakerId,
    pub display_name: String,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

impl FragmentEvent {
    pub fn new(
        speaker_id: impl Into<SpeakerId>,
        display_name: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            speaker_id: speaker_id.into(),
            display_name: display_name.into(),
            text: text.into(),
            received_at: Utc::now(),
        }
    }

    /// Whether the recognizer produced nothing worth keeping
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// A finalized utterance waiting for a generated response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub id: Uuid,
    pub speaker_id: SpeakerId,
    pub display_name: String,
    pub utterance_text: String,
    pub created_at: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn new(
        speaker_id: SpeakerId,
        display_name: impl Into<String>,
        utterance_text: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            speaker_id,
            display_name: display_name.into(),
            utterance_text: utterance_text.into(),
            created_at: Utc::now(),
        }
    }
}

/// One playback cycle of a generated response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeechSession {
    pub id: Uuid,
    /// Turn this speech answers, if it was produced by the turn processor
    pub turn_id: Option<Uuid>,
    pub speaker_id: SpeakerId,
    pub display_name: String,
    pub started_at: DateTime<Utc>,
}

impl SpeechSession {
    pub fn new(speaker_id: SpeakerId, display_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            turn_id: None,
            speaker_id,
            display_name: display_name.into(),
            started_at: Utc::now(),
        }
    }

    /// Session answering the given turn
    pub fn for_turn(turn: &ConversationTurn) -> Self {
        Self {
            turn_id: Some(turn.id),
            ..Self::new(turn.speaker_id.clone(), turn.display_name.clone())
        }
    }
}

/// Speech captured from one speaker while the agent was talking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingUtterance {
    pub speaker_id: SpeakerId,
    pub display_name: String,
    pub text: String,
}
