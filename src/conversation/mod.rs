//! The conversation loop
//!
//! This module provides:
//! - The derived conversation state and its presentation
//! - Configuration, including the greeting policy
//! - Events published while the loop runs
//! - The orchestrator that sequences the engines turn by turn

pub mod config;
pub mod events;
pub mod orchestrator;
pub mod state;

pub use config::{AppConfig, ConversationConfig, GreetingPolicy, DEFAULT_GREETING};
pub use events::ConversationEvent;
pub use orchestrator::{
    ConversationOrchestrator, ConversationSignals, ModelStatus, OrchestratorBuilder, SkipReason,
    TurnOutcome,
};
pub use state::{ConversationState, StateInputs, StatePalette};
