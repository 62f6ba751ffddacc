//! Speech output support for synthesis engines
//!
//! This module provides:
//! - The utterance queue discipline (ordering, speaking flag, drain waiter)
//! - Voice selection with fallbacks

pub mod queue;
pub mod voice;

pub use queue::{Utterance, UtteranceError, UtteranceQueue, PLAYBACK_NOT_ALLOWED};
pub use voice::{select_voice, Voice};
