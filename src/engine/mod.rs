//! Interfaces of the engines the conversation core drives
//!
//! The orchestrator never looks inside an engine. It only calls the methods
//! below and observes the signals the engines publish. Engines are shared as
//! `Arc<dyn …>` so hosts can swap in real implementations, and tests can
//! substitute recording fakes.

pub mod sim;

use crate::utils::Signal;
use crate::Result;
use async_trait::async_trait;
use std::fmt;

/// Number of frequency bins published by a visualizer
pub const FREQUENCY_BINS: usize = 64;

/// Which engine a status or error belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Engine {
    Transcription,
    Generation,
    Synthesis,
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Engine::Transcription => write!(f, "transcription"),
            Engine::Generation => write!(f, "generation"),
            Engine::Synthesis => write!(f, "synthesis"),
        }
    }
}

/// Receives each completed sentence while a reply is being generated
pub type SentenceSink<'a> = &'a mut (dyn FnMut(String) + Send);

/// Speech-to-text capture
#[async_trait]
pub trait TranscriptionEngine: Send + Sync {
    /// Ask the host for microphone access ahead of the first capture
    async fn request_permission(&self) -> Result<()> {
        Ok(())
    }

    /// Load the recognition model, reporting progress in percent
    async fn load(&self, progress: &Signal<u8>) -> Result<()>;

    /// Begin capturing and recognizing speech
    async fn start(&self) -> Result<()>;

    /// Stop capturing; idempotent
    fn stop(&self);

    /// Reset the transcript to empty
    fn clear(&self);

    /// Most recent finalized utterance, updated whenever one is recognized
    fn transcript(&self) -> &Signal<String>;
}

/// Language-model reply generation
#[async_trait]
pub trait GenerationEngine: Send + Sync {
    /// Load the model, reporting progress in percent
    async fn load(&self, progress: &Signal<u8>) -> Result<()>;

    /// Generate a reply to `prompt`
    ///
    /// `on_sentence` is called with each completed sentence, in order, while
    /// generation is still running. Returns the full cleaned reply.
    async fn generate_streaming(&self, prompt: &str, on_sentence: SentenceSink<'_>)
        -> Result<String>;
}

/// Text-to-speech playback
#[async_trait]
pub trait SynthesisEngine: Send + Sync {
    /// Whether speech output exists at all on this host
    fn is_supported(&self) -> bool;

    /// Queue a sentence behind whatever is already queued; never blocks
    fn queue_sentence(&self, text: &str);

    /// Resolve once every queued utterance has finished
    async fn wait_for_queue(&self);

    /// Cancel the queue, speak `text` immediately and wait for it
    async fn speak(&self, text: &str) -> Result<()>;

    /// Hard-cancel everything queued or playing
    fn stop(&self);

    /// True while speech is audible
    fn speaking(&self) -> &Signal<bool>;

    /// Most recent playback failure
    fn error(&self) -> &Signal<Option<String>>;
}

/// Frequency-domain display feed
///
/// Purely cosmetic: nothing here may influence turn-taking.
#[async_trait]
pub trait Visualizer: Send + Sync {
    /// Start analysing the microphone; failures are swallowed
    async fn start(&self);

    fn stop(&self);

    /// Animate a synthetic waveform while the assistant is speaking
    fn simulate_speaking(&self);

    fn stop_simulation(&self);

    /// Current frequency bins, `FREQUENCY_BINS` bytes
    fn frequency_data(&self) -> &Signal<Vec<u8>>;
}
