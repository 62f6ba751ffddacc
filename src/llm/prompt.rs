//! Chat prompt formatting
//!
//! Small instruction-tuned models expect their own turn markers. The default
//! template follows the Gemma chat format: the system instruction is folded
//! into the user turn and the prompt ends with an open model turn.

use serde::Deserialize;

/// Marker that ends a turn in the chat template
pub const END_OF_TURN: &str = "<end_of_turn>";

/// Marker that starts a turn in the chat template
pub const START_OF_TURN: &str = "<start_of_turn>";

/// Default instruction prepended to every user message
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are Ava. Reply in 1-2 short sentences only.";

/// Sampling parameters for a single generation
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    /// Maximum number of tokens to predict
    pub n_predict: u32,

    /// Sampling temperature
    pub temperature: f32,

    /// Top-k sampling cutoff
    pub top_k: u32,

    /// Nucleus sampling cutoff
    pub top_p: f32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            n_predict: 64,
            temperature: 0.7,
            top_k: 40,
            top_p: 0.9,
        }
    }
}

/// Format a single user message as a chat prompt
pub fn format_chat_prompt(system_prompt: &str, user_message: &str) -> String {
    format!(
        "{START_OF_TURN}user\n{system_prompt}\n\n{user_message}{END_OF_TURN}\n{START_OF_TURN}model\n"
    )
}
