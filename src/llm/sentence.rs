//! Sentence segmentation for streamed model output
//!
//! Generated text arrives a few characters at a time. Speech sounds best
//! when synthesized a sentence at a time, so this splitter buffers streamed
//! text and releases a segment whenever a boundary appears, letting
//! synthesis of the first sentence start while later ones are still being
//! generated.
//!
//! A boundary is one of `.`, `!`, `?` or `,` followed by whitespace or by the
//! end of the buffered text.

use crate::llm::prompt::END_OF_TURN;

/// Punctuation that may end a segment
const BOUNDARY_CHARS: [char; 4] = ['.', '!', '?', ','];

/// A segment of generated text ready for synthesis
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentenceSegment {
    /// Trimmed segment text, never empty
    pub text: String,

    /// Sequential index of this segment in the response
    pub index: usize,
}

/// Streaming splitter for generated text
#[derive(Clone, Debug, Default)]
pub struct SentenceSplitter {
    /// Text received but not yet emitted
    buffer: String,

    /// Cumulative text already consumed via `push_cumulative`
    consumed: String,

    /// Index of the next emitted segment
    next_index: usize,
}

impl SentenceSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the full cleaned response generated so far
    ///
    /// Only the part beyond what was previously fed is buffered. If the new
    /// text is not an extension of the old (the model rewrote its tail), the
    /// overlap is kept and nothing is re-emitted.
    pub fn push_cumulative(&mut self, text: &str) -> Vec<SentenceSegment> {
        let delta = if text.len() > self.consumed.len() && text.is_char_boundary(self.consumed.len())
        {
            &text[self.consumed.len()..]
        } else {
            ""
        };
        self.buffer.push_str(delta);
        self.consumed = text.to_string();
        self.drain_complete()
    }

    /// Flush whatever remains once generation is complete
    pub fn finish(&mut self) -> Option<SentenceSegment> {
        let rest = std::mem::take(&mut self.buffer);
        self.emit(&rest)
    }

    /// Number of segments emitted so far
    pub fn emitted(&self) -> usize {
        self.next_index
    }

    fn drain_complete(&mut self) -> Vec<SentenceSegment> {
        let mut segments = Vec::new();
        while let Some(end) = find_boundary(&self.buffer) {
            let head: String = self.buffer.drain(..end).collect();
            if let Some(segment) = self.emit(&head) {
                segments.push(segment);
            }
        }
        segments
    }

    fn emit(&mut self, raw: &str) -> Option<SentenceSegment> {
        let text = raw.trim();
        if text.is_empty() {
            return None;
        }
        let segment = SentenceSegment {
            text: text.to_string(),
            index: self.next_index,
        };
        self.next_index += 1;
        Some(segment)
    }
}

/// Byte offset just past the first boundary in `text`, including the single
/// whitespace character that follows it
fn find_boundary(text: &str) -> Option<usize> {
    let mut chars = text.char_indices().peekable();
    while let Some((idx, c)) = chars.next() {
        if !BOUNDARY_CHARS.contains(&c) {
            continue;
        }
        let after = idx + c.len_utf8();
        match chars.peek() {
            None => return Some(after),
            Some(&(_, next)) if next.is_whitespace() => return Some(after + next.len_utf8()),
            _ => {}
        }
    }
    None
}

/// Strip the end-of-turn marker (and anything after it) and trim
pub fn clean_response(text: &str) -> String {
    let text = match text.find(END_OF_TURN) {
        Some(pos) => &text[..pos],
        None => text,
    };
    text.trim().to_string()
}
