//! Derived conversation state
//!
//! The state shown to the user is never stored. It is recomputed from the
//! flags the engines and the orchestrator publish, using a fixed precedence
//! so that any combination of simultaneously raised flags maps to exactly
//! one state.

use std::fmt;

/// What the assistant is doing right now
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConversationState {
    /// Conversation switched off
    #[default]
    Idle,
    /// Conversation on, capture not running
    Ready,
    /// Capturing the user's speech
    Listening,
    /// A turn is running but neither generating nor speaking
    Processing,
    /// The model is generating a reply
    Thinking,
    /// Speech is audible
    Speaking,
    /// A model is loading
    Loading,
}

/// Colours for the state indicator
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatePalette {
    pub primary: &'static str,
    pub secondary: &'static str,
    pub glow: &'static str,
}

impl ConversationState {
    /// Every state, lowest precedence first
    pub const ALL: [ConversationState; 7] = [
        ConversationState::Idle,
        ConversationState::Ready,
        ConversationState::Listening,
        ConversationState::Processing,
        ConversationState::Thinking,
        ConversationState::Speaking,
        ConversationState::Loading,
    ];

    /// Short label for the indicator
    pub fn label(&self) -> &'static str {
        match self {
            ConversationState::Idle => "Standby",
            ConversationState::Ready => "Awaiting Signal",
            ConversationState::Listening => "Echo Active",
            ConversationState::Processing => "Processing",
            ConversationState::Thinking => "Cortex Active",
            ConversationState::Speaking => "Ava Active",
            ConversationState::Loading => "Initializing",
        }
    }

    pub fn palette(&self) -> StatePalette {
        let (primary, secondary, glow) = match self {
            ConversationState::Idle | ConversationState::Loading => {
                ("#6366f1", "#818cf8", "rgba(99, 102, 241, 0.3)")
            }
            ConversationState::Ready => ("#22d3ee", "#67e8f9", "rgba(34, 211, 238, 0.3)"),
            ConversationState::Listening => ("#22c55e", "#4ade80", "rgba(34, 197, 94, 0.4)"),
            ConversationState::Processing => ("#f59e0b", "#fbbf24", "rgba(245, 158, 11, 0.3)"),
            ConversationState::Thinking => ("#a855f7", "#c084fc", "rgba(168, 85, 247, 0.4)"),
            ConversationState::Speaking => ("#ec4899", "#f472b6", "rgba(236, 72, 153, 0.4)"),
        };
        StatePalette {
            primary,
            secondary,
            glow,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationState::Idle => "idle",
            ConversationState::Ready => "ready",
            ConversationState::Listening => "listening",
            ConversationState::Processing => "processing",
            ConversationState::Thinking => "thinking",
            ConversationState::Speaking => "speaking",
            ConversationState::Loading => "loading",
        }
    }
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of every flag the state is derived from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StateInputs {
    /// Either model is loading
    pub model_loading: bool,
    pub speaking: bool,
    pub generating: bool,
    pub processing: bool,
    pub listening: bool,
    pub conversation_active: bool,
}

impl StateInputs {
    /// Apply the precedence: loading, speaking, thinking, processing,
    /// listening, ready, idle
    pub fn derive(&self) -> ConversationState {
        if self.model_loading {
            ConversationState::Loading
        } else if self.speaking {
            ConversationState::Speaking
        } else if self.generating {
            ConversationState::Thinking
        } else if self.processing {
            ConversationState::Processing
        } else if self.listening {
            ConversationState::Listening
        } else if self.conversation_active {
            ConversationState::Ready
        } else {
            ConversationState::Idle
        }
    }
}
