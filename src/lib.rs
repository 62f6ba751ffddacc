//! Voxloop - turn-taking conversation core for a local voice assistant
//!
//! The crate sequences four independently asynchronous engines
//! (transcription, generation, synthesis, visualization) into one
//! non-overlapping conversational loop: listen, think, speak, listen again.

pub mod conversation;
pub mod engine;
pub mod llm;
pub mod speech;
pub mod utils;

use thiserror::Error;

pub use conversation::{
    ConversationConfig, ConversationEvent, ConversationOrchestrator, ConversationState,
    GreetingPolicy, OrchestratorBuilder, TurnOutcome,
};
pub use engine::{Engine, GenerationEngine, SynthesisEngine, TranscriptionEngine, Visualizer};
pub use utils::{Signal, SharedStats, TurnStats};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VoiceError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Model load error: {0}")]
    ModelLoad(String),

    #[error("Unsupported environment: {0}")]
    UnsupportedEnvironment(String),

    #[error("Transcription error: {0}")]
    Transcription(String),

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("Synthesis error: {0}")]
    Synthesis(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for VoiceError {
    fn from(e: std::io::Error) -> Self {
        VoiceError::Io(e.to_string())
    }
}

impl VoiceError {
    /// Check if this error is recoverable without user intervention
    pub fn is_recoverable(&self) -> bool {
        match self {
            // Needs the user to grant access and reload
            VoiceError::PermissionDenied(_) => false,
            // A failed load stays failed for the session
            VoiceError::ModelLoad(_) => false,
            VoiceError::UnsupportedEnvironment(_) => false,
            // Per-turn failures; the next turn may succeed
            VoiceError::Transcription(_) => true,
            VoiceError::Generation(_) => true,
            VoiceError::Synthesis(_) => true,
            VoiceError::Config(_) => false,
            VoiceError::Channel(_) => false,
            VoiceError::Io(_) => false,
        }
    }

    /// Human-readable message for the engine's error signal
    ///
    /// Permission and environment errors carry their own wording because the
    /// user has to act on them; the rest are prefixed by category.
    pub fn user_message(&self) -> String {
        match self {
            VoiceError::PermissionDenied(msg) | VoiceError::UnsupportedEnvironment(msg) => {
                msg.clone()
            }
            VoiceError::ModelLoad(msg) => format!("Failed to load model: {}", msg),
            VoiceError::Transcription(msg) => format!("Speech recognition failed: {}", msg),
            VoiceError::Generation(msg) => format!("Failed to generate response: {}", msg),
            VoiceError::Synthesis(msg) => format!("Speech error: {}", msg),
            VoiceError::Config(_) => "Configuration error. Please check settings.".to_string(),
            VoiceError::Channel(_) => {
                "Internal communication error. Please restart the application.".to_string()
            }
            VoiceError::Io(_) => "File system error occurred.".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, VoiceError>;
