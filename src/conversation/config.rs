//! Configuration for the conversation loop
//!
//! Loaded from TOML. Every field has a default, so an empty file is a valid
//! configuration.

use crate::engine::sim::SimSettings;
use crate::utils::perf::DEFAULT_STATS_WINDOW;
use crate::{Result, VoiceError};
use serde::Deserialize;
use std::path::Path;

/// Greeting spoken by default
pub const DEFAULT_GREETING: &str =
    "Hi, I'm Ava, your AI assistant. Press the button below to start talking to me.";

/// When the assistant introduces itself
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GreetingPolicy {
    /// Never greet
    None,
    /// Greet once both models have finished loading
    #[default]
    OnInitialize,
    /// Greet the first time the conversation is switched on
    OnFirstActivation,
}

/// Configuration for the conversation orchestrator
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// When to greet
    pub greeting: GreetingPolicy,

    /// What to say when greeting
    pub greeting_text: String,

    /// Number of recent turns the latency averages cover
    pub stats_window: usize,

    /// Capacity of the event broadcast channel
    pub event_buffer: usize,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            greeting: GreetingPolicy::default(),
            greeting_text: DEFAULT_GREETING.to_string(),
            stats_window: DEFAULT_STATS_WINDOW,
            event_buffer: 100,
        }
    }
}

impl ConversationConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| VoiceError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_greeting(mut self, policy: GreetingPolicy) -> Self {
        self.greeting = policy;
        self
    }

    pub fn with_greeting_text(mut self, text: impl Into<String>) -> Self {
        self.greeting_text = text.into();
        self
    }

    /// Disable the greeting entirely
    pub fn without_greeting(self) -> Self {
        self.with_greeting(GreetingPolicy::None)
    }

    pub fn with_stats_window(mut self, window: usize) -> Self {
        self.stats_window = window;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.stats_window == 0 {
            return Err(VoiceError::Config(
                "stats_window must be at least 1".to_string(),
            ));
        }
        if self.event_buffer == 0 {
            return Err(VoiceError::Config(
                "event_buffer must be at least 1".to_string(),
            ));
        }
        if self.greeting != GreetingPolicy::None && self.greeting_text.trim().is_empty() {
            return Err(VoiceError::Config(
                "greeting_text is required unless greeting = \"none\"".to_string(),
            ));
        }
        Ok(())
    }
}

/// Top-level configuration file for the demo binary
///
/// ```toml
/// [conversation]
/// greeting = "on_first_activation"
///
/// [engines.generation]
/// token_ms = 20
/// ```
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub conversation: ConversationConfig,
    pub engines: SimSettings,
}

impl AppConfig {
    /// Load and validate a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            VoiceError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| VoiceError::Config(format!("Failed to parse config: {}", e)))?;
        config.conversation.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ConversationConfig::default();
        assert_eq!(config.greeting, GreetingPolicy::OnInitialize);
        assert_eq!(config.greeting_text, DEFAULT_GREETING);
        assert_eq!(config.stats_window, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = ConversationConfig::from_toml_str("").unwrap();
        assert_eq!(config.event_buffer, 100);
    }

    #[test]
    fn test_parse_greeting_policy() {
        let config = ConversationConfig::from_toml_str(
            r#"
            greeting = "on_first_activation"
            greeting_text = "Hello."
            stats_window = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.greeting, GreetingPolicy::OnFirstActivation);
        assert_eq!(config.greeting_text, "Hello.");
        assert_eq!(config.stats_window, 5);
    }

    #[test]
    fn test_validation_rejects_zero_window() {
        let err = ConversationConfig::default()
            .with_stats_window(0)
            .validate()
            .unwrap_err();
        assert!(matches!(err, VoiceError::Config(_)));
    }

    #[test]
    fn test_blank_greeting_needs_policy_none() {
        let config = ConversationConfig::default().with_greeting_text("  ");
        assert!(config.validate().is_err());
        assert!(config.without_greeting().validate().is_ok());
    }

    #[test]
    fn test_unknown_policy_is_rejected() {
        assert!(ConversationConfig::from_toml_str("greeting = \"sometimes\"").is_err());
    }

    #[test]
    fn test_app_config_sections() {
        let config = AppConfig::from_toml_str(
            r#"
            [conversation]
            greeting = "none"

            [engines.generation]
            token_ms = 5

            [engines.synthesis]
            supported = false
            "#,
        )
        .unwrap();
        assert_eq!(config.conversation.greeting, GreetingPolicy::None);
        assert_eq!(config.engines.generation.token_ms, 5);
        assert!(!config.engines.synthesis.supported);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = AppConfig::load("/nonexistent/voxloop.toml").unwrap_err();
        assert!(matches!(err, VoiceError::Config(_)));
    }
}
