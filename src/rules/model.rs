//! Rule snapshot data model.
//!
//! These types are edited by the admin tooling and read by the dispatch
//! core. The only fields the core writes are the `resolved_*` ids.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// A chat reference as written by an operator: a numeric id or a
/// public `@username`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatRef {
    Id(i64),
    Name(String),
}

impl ChatRef {
    /// Numeric id if the reference needs no lookup.
    pub fn as_numeric(&self) -> Option<i64> {
        match self {
            Self::Id(id) => Some(*id),
            Self::Name(name) => name.trim().parse().ok(),
        }
    }
}

impl fmt::Display for ChatRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Name(name) => f.write_str(name),
        }
    }
}

/// A monitored source channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRule {
    pub identifier: ChatRef,
    /// Overrides the global "forward new messages only" setting.
    #[serde(default)]
    pub forward_new_only: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_id: Option<i64>,
}

impl SourceRule {
    pub fn new(identifier: ChatRef) -> Self {
        Self {
            identifier,
            forward_new_only: None,
            resolved_id: None,
        }
    }
}

/// An ordered routing rule. First match wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRule {
    pub name: String,
    /// Every keyword must appear (case-insensitive substring).
    #[serde(default)]
    pub all_keywords: Vec<String>,
    /// At least one of these, or a media predicate, must match.
    #[serde(default)]
    pub any_keywords: Vec<String>,
    /// Mime-type substrings, e.g. `video/` or `zip`.
    #[serde(default)]
    pub file_types: Vec<String>,
    /// Filename globs, `*` as wildcard.
    #[serde(default)]
    pub file_name_patterns: Vec<String>,
    #[serde(alias = "target_identifier")]
    pub target: ChatRef,
    #[serde(default)]
    pub topic_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_target_id: Option<i64>,
}

fn default_true() -> bool {
    true
}

fn default_min_length() -> usize {
    5
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WhitelistConfig {
    #[serde(default, alias = "enable")]
    pub enabled: bool,
    #[serde(default)]
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlacklistConfig {
    #[serde(default = "default_true", alias = "enable")]
    pub enabled: bool,
    #[serde(default, alias = "keywords")]
    pub keywords_substring: Vec<String>,
    /// Matched on word boundaries only.
    #[serde(default)]
    pub keywords_word: Vec<String>,
    /// Regular expressions, matched case-insensitively.
    #[serde(default)]
    pub patterns: Vec<String>,
    /// Substrings of an attached document's filename.
    #[serde(default)]
    pub file_name_keywords: Vec<String>,
}

impl Default for BlacklistConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            keywords_substring: Vec::new(),
            keywords_word: Vec::new(),
            patterns: Vec::new(),
            file_name_keywords: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentQualityConfig {
    #[serde(default = "default_true", alias = "enable")]
    pub enabled: bool,
    #[serde(default)]
    pub meaningless_words: Vec<String>,
    #[serde(default = "default_min_length")]
    pub min_meaningful_length: usize,
}

impl Default for ContentQualityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            meaningless_words: Vec::new(),
            min_meaningful_length: default_min_length(),
        }
    }
}

/// One literal find/replace step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replacement {
    pub find: String,
    #[serde(default)]
    pub replace: String,
}

/// Everything the operator configures, as one immutable value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSnapshot {
    #[serde(default)]
    pub sources: Vec<SourceRule>,
    #[serde(default, alias = "distribution_rules")]
    pub routing_rules: Vec<RoutingRule>,
    #[serde(default)]
    pub whitelist: WhitelistConfig,
    #[serde(default, alias = "ad_filter")]
    pub blacklist: BlacklistConfig,
    #[serde(default)]
    pub content_filter: ContentQualityConfig,
    /// Applied in order before sending.
    #[serde(default)]
    pub replacements: Vec<Replacement>,
    #[serde(default)]
    pub default_target: Option<ChatRef>,
    #[serde(default)]
    pub default_topic_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_default_target_id: Option<i64>,
}

impl RuleSnapshot {
    /// Parse a snapshot from JSON text.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Load a snapshot from a JSON rules file.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = tokio::fs::read_to_string(path).await?;
        Self::from_json(&raw).map_err(|e| ConfigError::RulesParse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Resolved ids of every monitored source.
    pub fn source_ids(&self) -> Vec<i64> {
        self.sources.iter().filter_map(|s| s.resolved_id).collect()
    }

    /// The source rule owning a resolved chat id.
    pub fn source(&self, chat_id: i64) -> Option<&SourceRule> {
        self.sources
            .iter()
            .find(|s| s.resolved_id == Some(chat_id))
    }

    /// Clear every resolved id (a freshly edited snapshot).
    pub fn clear_resolved(&mut self) {
        for source in &mut self.sources {
            source.resolved_id = None;
        }
        for rule in &mut self.routing_rules {
            rule.resolved_target_id = None;
        }
        self.resolved_default_target_id = None;
    }
}
