//! Voice selection
//!
//! Hosts list voices asynchronously and the list can change while the
//! assistant runs, so the choice is re-validated before every utterance.

use serde::{Deserialize, Serialize};

/// A synthesis voice offered by the host
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voice {
    /// Display name, unique per host
    pub name: String,

    /// BCP 47 language tag, e.g. `en-GB`
    pub lang: String,
}

impl Voice {
    pub fn new(name: impl Into<String>, lang: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            lang: lang.into(),
        }
    }

    fn name_contains(&self, needle: &str) -> bool {
        self.name.to_lowercase().contains(needle)
    }
}

/// Pick the voice to speak with
///
/// The preferred voice wins while it is still offered. Otherwise English
/// voices are tried in a fixed order before falling back to the first voice.
pub fn select_voice<'a>(voices: &'a [Voice], preferred: Option<&str>) -> Option<&'a Voice> {
    if let Some(name) = preferred {
        if let Some(found) = voices.iter().find(|v| v.name == name) {
            return Some(found);
        }
    }

    let rules: [fn(&Voice) -> bool; 6] = [
        |v: &Voice| v.lang == "en-US" && v.name_contains("google us english"),
        |v: &Voice| v.lang == "en-GB" && v.name_contains("female"),
        |v: &Voice| v.lang == "en-US" && v.name_contains("female"),
        |v: &Voice| v.lang == "en-AU" && v.name_contains("female"),
        |v: &Voice| v.lang == "en-AU",
        |v: &Voice| v.lang.starts_with("en"),
    ];

    rules
        .iter()
        .find_map(|rule| voices.iter().find(|v| rule(v)))
        .or_else(|| voices.first())
}
