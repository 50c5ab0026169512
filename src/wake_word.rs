//! Wake word gate
//!
//! Passes through only utterances that contain a trigger token, with every
//! trigger removed from the payload.

use crate::asr::Utterance;
use std::fmt;
use tracing::debug;

/// Payload of a wake-word utterance. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command(String);

impl Command {
    /// `None` when nothing but whitespace is left
    pub fn new(text: impl Into<String>) -> Option<Self> {
        let text = normalize_spaces(&text.into());
        if text.is_empty() {
            None
        } else {
            Some(Self(text))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of passing an utterance through the gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Command(Command),
    /// Wake word present but nothing else was said
    Empty,
    NoWakeWord,
}

#[derive(Debug, Clone)]
pub struct WakeWordGate {
    triggers: Vec<String>,
}

impl WakeWordGate {
    pub fn new<I, S>(triggers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut triggers: Vec<String> = triggers
            .into_iter()
            .map(|t| normalize_spaces(&t.as_ref().to_lowercase()))
            .filter(|t| !t.is_empty())
            .collect();
        // Longest first, so stripping does not depend on configuration order
        triggers.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        triggers.dedup();
        Self { triggers }
    }

    pub fn triggers(&self) -> &[String] {
        &self.triggers
    }

    /// Check whether any trigger occurs in `text`
    pub fn detect(&self, text: &str) -> bool {
        let text = normalize_spaces(&text.to_lowercase());
        self.contains_trigger(&text)
    }

    fn contains_trigger(&self, text: &str) -> bool {
        self.triggers.iter().any(|t| text.contains(t.as_str()))
    }

    /// Remove every trigger occurrence, including ones exposed by an earlier removal
    pub fn strip(&self, text: &str) -> String {
        let mut result = normalize_spaces(&text.to_lowercase());
        while self.contains_trigger(&result) {
            for trigger in &self.triggers {
                result = result.replace(trigger.as_str(), " ");
            }
            result = normalize_spaces(&result);
        }
        result
    }

    pub fn check(&self, utterance: &Utterance) -> GateDecision {
        if !self.detect(&utterance.text) {
            return GateDecision::NoWakeWord;
        }
        match Command::new(self.strip(&utterance.text)) {
            Some(command) => {
                debug!("🎯 Wake word detected, command: '{}'", command);
                GateDecision::Command(command)
            }
            None => {
                debug!("🎯 Wake word without a command, ignoring");
                GateDecision::Empty
            }
        }
    }
}

fn normalize_spaces(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
