//! Active detection labels
//!
//! Written by the command channel, read by every stream client once per
//! capture cycle. Last writer wins; a cycle already in flight keeps the
//! snapshot it started with.

use std::sync::{Arc, RwLock};

/// Prompt used until the first `set_prompt`
pub const DEFAULT_PROMPT: &str = "a person, a car, a dog, a cat, a bottle";

/// Split a comma-separated prompt into trimmed, non-empty labels
pub fn parse_prompt(text: &str) -> Vec<String> {
    text.split(',')
        .map(str::trim)
        .filter(|label| !label.is_empty())
        .map(String::from)
        .collect()
}

/// Shared, mutable label set
#[derive(Debug, Clone)]
pub struct SharedLabels {
    inner: Arc<RwLock<Vec<String>>>,
}

impl SharedLabels {
    pub fn new(labels: Vec<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(labels)),
        }
    }

    /// Build from a comma-separated prompt
    pub fn from_prompt(text: &str) -> Self {
        Self::new(parse_prompt(text))
    }

    /// Copy of the current labels
    pub fn snapshot(&self) -> Vec<String> {
        match self.inner.read() {
            Ok(labels) => labels.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the labels from a prompt
    ///
    /// A prompt with no usable labels is rejected and leaves the current set
    /// in place. Returns the labels now active.
    pub fn set_prompt(&self, text: &str) -> Result<Vec<String>, &'static str> {
        let labels = parse_prompt(text);
        if labels.is_empty() {
            return Err("No prompt provided");
        }

        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = labels.clone();
        Ok(labels)
    }
}

impl Default for SharedLabels {
    fn default() -> Self {
        Self::from_prompt(DEFAULT_PROMPT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_prompt_trims() {
        assert_eq!(parse_prompt("a box, a person"), vec!["a box", "a person"]);
        assert_eq!(parse_prompt(" cup ,, ,bowl,"), vec!["cup", "bowl"]);
        assert!(parse_prompt(" , ").is_empty());
    }

    #[test]
    fn test_default_labels() {
        let labels = SharedLabels::default().snapshot();

        assert_eq!(labels.len(), 5);
        assert_eq!(labels[0], "a person");
        assert_eq!(labels[4], "a bottle");
    }

    #[test]
    fn test_set_prompt_visible_to_clones() {
        let labels = SharedLabels::default();
        let reader = labels.clone();

        labels.set_prompt("a box, a person").unwrap();
        assert_eq!(reader.snapshot(), vec!["a box", "a person"]);
    }

    #[test]
    fn test_blank_prompt_rejected() {
        let labels = SharedLabels::from_prompt("a cup");

        assert!(labels.set_prompt("  ").is_err());
        assert_eq!(labels.snapshot(), vec!["a cup"]);
    }
}
