//! Literal find/replace applied to outgoing text.

use crate::rules::Replacement;

/// Ordered replacement list.
#[derive(Debug, Clone, Default)]
pub struct TextTransform {
    steps: Vec<Replacement>,
}

impl TextTransform {
    /// Empty `find` strings are dropped.
    pub fn new(steps: &[Replacement]) -> Self {
        Self {
            steps: steps.iter().filter(|r| !r.find.is_empty()).cloned().collect(),
        }
    }

    pub fn apply(&self, text: &str) -> String {
        self.steps
            .iter()
            .fold(text.to_string(), |acc, step| acc.replace(&step.find, &step.replace))
    }
}
