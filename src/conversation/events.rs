//! Events published by the orchestrator

use super::state::ConversationState;
use crate::engine::Engine;
use uuid::Uuid;

/// Something observable happened in the conversation loop
#[derive(Clone, Debug, PartialEq)]
pub enum ConversationEvent {
    /// The derived state changed
    StateChanged(ConversationState),

    /// Conversation switched on or off
    Toggled { active: bool },

    /// Both model loads settled
    Initialized {
        transcription_loaded: bool,
        generation_loaded: bool,
    },

    /// A transcript was accepted and a turn began
    TurnStarted { turn_id: Uuid, transcript: String },

    /// A generated sentence was handed to synthesis
    SentenceQueued {
        turn_id: Uuid,
        index: usize,
        text: String,
    },

    /// A sentence arrived after the conversation was switched off
    SentenceDropped { turn_id: Uuid, text: String },

    /// A turn ended
    TurnFinished {
        turn_id: Uuid,
        response: Option<String>,
        resumed_capture: bool,
    },

    /// An engine reported an error
    EngineError { engine: Engine, message: String },
}

impl ConversationEvent {
    /// Turn this event belongs to, if any
    pub fn turn_id(&self) -> Option<Uuid> {
        match self {
            ConversationEvent::TurnStarted { turn_id, .. }
            | ConversationEvent::SentenceQueued { turn_id, .. }
            | ConversationEvent::SentenceDropped { turn_id, .. }
            | ConversationEvent::TurnFinished { turn_id, .. } => Some(*turn_id),
            _ => None,
        }
    }
}
