//! Generation helpers: prompt formatting and sentence streaming
//!
//! Generation engines use these to turn a transcript into a prompt and a
//! token stream into speakable sentences.

pub mod prompt;
pub mod sentence;

pub use prompt::{format_chat_prompt, GenerationParams, DEFAULT_SYSTEM_PROMPT, END_OF_TURN};
pub use sentence::{clean_response, SentenceSegment, SentenceSplitter};
