//! Dialogue scripts: ordered speaker-tagged utterances and the parser that
//! reads them from `Speaker N: text` lines.

use regex::Regex;
use std::collections::BTreeSet;
use tracing::{debug, warn};

use crate::config::MAX_SPEAKERS;
use crate::{ColloquyError, Result};

/// Map typographic punctuation to ASCII so tokenization stays stable.
pub fn normalize_text(text: &str) -> String {
    text.replace(['\u{2019}', '\u{2018}'], "'")
        .replace(['\u{201C}', '\u{201D}'], "\"")
        .replace('\u{2014}', "--")
        .replace('\u{2013}', "-")
        .replace('\u{2026}', "...")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    pub speaker_id: u8,
    pub text: String,
    /// Index within the script.
    pub position: usize,
}

/// Ordered utterances; fixed once a session has started from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    utterances: Vec<Utterance>,
}

impl Script {
    pub fn new<S: Into<String>>(lines: impl IntoIterator<Item = (u8, S)>) -> Result<Self> {
        let utterances: Vec<Utterance> = lines
            .into_iter()
            .enumerate()
            .map(|(position, (speaker_id, text))| Utterance {
                speaker_id,
                text: text.into(),
                position,
            })
            .collect();

        if utterances.is_empty() {
            return Err(ColloquyError::ProcessingError(
                "Script has no utterances".to_string(),
            ));
        }
        if let Some(bad) = utterances
            .iter()
            .find(|u| u.speaker_id == 0 || u.speaker_id as usize > MAX_SPEAKERS)
        {
            return Err(ColloquyError::ConfigError(format!(
                "Utterance {} has speaker {}, expected 1..={}",
                bad.position, bad.speaker_id, MAX_SPEAKERS
            )));
        }
        Ok(Self { utterances })
    }

    /// One utterance by one speaker.
    pub fn single(speaker_id: u8, text: impl Into<String>) -> Result<Self> {
        Self::new([(speaker_id, text.into())])
    }

    pub fn utterances(&self) -> &[Utterance] {
        &self.utterances
    }

    pub fn get(&self, position: usize) -> Option<&Utterance> {
        self.utterances.get(position)
    }

    pub fn len(&self) -> usize {
        self.utterances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.utterances.is_empty()
    }

    /// Distinct speaker ids, ascending.
    pub fn speakers(&self) -> BTreeSet<u8> {
        self.utterances.iter().map(|u| u.speaker_id).collect()
    }
}

/// Raw dialogue text → [`Script`].
pub trait ScriptParser {
    fn parse(&self, input: &str) -> Result<Script>;
}

/// Reads `Speaker N: text` lines.
///
/// Lines without a speaker tag continue the previous utterance. Scripts that
/// number speakers from 0 are shifted to start at 1.
pub struct SpeakerLineParser {
    pattern: Regex,
}

impl SpeakerLineParser {
    pub fn new() -> Result<Self> {
        let pattern = Regex::new(r"^Speaker\s+(\d+)\s*:\s*(.*)$")
            .map_err(|e| ColloquyError::ProcessingError(format!("Regex error: {}", e)))?;
        Ok(Self { pattern })
    }
}

impl ScriptParser for SpeakerLineParser {
    fn parse(&self, input: &str) -> Result<Script> {
        let input = normalize_text(input);
        let mut lines: Vec<(usize, String)> = Vec::new();

        for line in input.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if let Some(captures) = self.pattern.captures(line) {
                let id: usize = captures[1].parse().map_err(|e| {
                    ColloquyError::ProcessingError(format!("Invalid speaker ID in '{}': {}", line, e))
                })?;
                lines.push((id, captures[2].trim().to_string()));
            } else if let Some((_, text)) = lines.last_mut() {
                text.push(' ');
                text.push_str(line);
            } else {
                warn!("Could not parse line: '{}'", line);
            }
        }

        if lines.is_empty() {
            return Err(ColloquyError::ProcessingError(
                "No valid speaker lines found in script".to_string(),
            ));
        }

        let shift = usize::from(lines.iter().any(|(id, _)| *id == 0));
        if shift == 1 {
            debug!("Speaker ids start at 0, shifting to 1-based");
        }

        let tagged = lines
            .into_iter()
            .map(|(id, text)| {
                let id = id + shift;
                u8::try_from(id).map(|id| (id, text)).map_err(|_| {
                    ColloquyError::ConfigError(format!("Speaker id {} out of range", id))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Script::new(tagged)
    }
}
