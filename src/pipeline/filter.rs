//! Filter chain: whitelist → blacklist → content quality.
//!
//! Precedence is fixed. An enabled whitelist is the sole arbiter: a
//! message passing it skips every later check, one missing it is rejected.
//! Patterns are compiled once per rule snapshot.

use regex::{Regex, RegexBuilder};
use tracing::{debug, warn};

use crate::pipeline::types::Media;
use crate::rules::{BlacklistConfig, ContentQualityConfig, RuleSnapshot, WhitelistConfig};

/// Why a message was rejected. Rendered as `kind:token`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterReason {
    WhitelistMiss,
    BlacklistKeyword(String),
    BlacklistWord(String),
    BlacklistFileName(String),
    BlacklistPattern(String),
    Empty,
    Meaningless,
    TooShort { length: usize, min: usize },
}

impl std::fmt::Display for FilterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WhitelistMiss => f.write_str("whitelist:miss"),
            Self::BlacklistKeyword(kw) => write!(f, "blacklist:{kw}"),
            Self::BlacklistWord(kw) => write!(f, "blacklist-word:{kw}"),
            Self::BlacklistFileName(kw) => write!(f, "blacklist-file:{kw}"),
            Self::BlacklistPattern(p) => write!(f, "blacklist-pattern:{p}"),
            Self::Empty => f.write_str("content:empty"),
            Self::Meaningless => f.write_str("content:meaningless"),
            Self::TooShort { length, min } => write!(f, "content:too-short({length}<{min})"),
        }
    }
}

/// A whole-word keyword with its boundary-anchored regex.
#[derive(Debug, Clone)]
struct WordRule {
    keyword: String,
    regex: Regex,
}

#[derive(Debug, Clone, Default)]
struct CompiledBlacklist {
    enabled: bool,
    /// Lowercased.
    keywords: Vec<String>,
    words: Vec<WordRule>,
    /// Lowercased.
    file_name_keywords: Vec<String>,
    patterns: Vec<Regex>,
}

/// Compiled filter chain for one rule snapshot.
#[derive(Debug, Clone, Default)]
pub struct FilterChain {
    whitelist_enabled: bool,
    /// Lowercased.
    whitelist: Vec<String>,
    blacklist: CompiledBlacklist,
    content: ContentQualityConfig,
    /// Lowercased, trimmed.
    meaningless: Vec<String>,
}

fn lowered(items: &[String]) -> Vec<String> {
    items
        .iter()
        .map(|s| s.to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn case_insensitive(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern).case_insensitive(true).build()
}

impl FilterChain {
    /// Compile the filter settings of a snapshot.
    ///
    /// Invalid regular expressions are logged and skipped.
    pub fn new(
        whitelist: &WhitelistConfig,
        blacklist: &BlacklistConfig,
        content: &ContentQualityConfig,
    ) -> Self {
        let words = blacklist
            .keywords_word
            .iter()
            .filter(|kw| !kw.trim().is_empty())
            .filter_map(|kw| {
                match case_insensitive(&format!(r"\b{}\b", regex::escape(kw.trim()))) {
                    Ok(regex) => Some(WordRule {
                        keyword: kw.trim().to_string(),
                        regex,
                    }),
                    Err(e) => {
                        warn!(keyword = %kw, error = %e, "Invalid whole-word keyword, skipping");
                        None
                    }
                }
            })
            .collect();

        let patterns = blacklist
            .patterns
            .iter()
            .filter_map(|p| match case_insensitive(p) {
                Ok(regex) => Some(regex),
                Err(e) => {
                    warn!(pattern = %p, error = %e, "Invalid blacklist pattern, skipping");
                    None
                }
            })
            .collect();

        Self {
            whitelist_enabled: whitelist.enabled,
            whitelist: lowered(&whitelist.keywords),
            blacklist: CompiledBlacklist {
                enabled: blacklist.enabled,
                keywords: lowered(&blacklist.keywords_substring),
                words,
                file_name_keywords: lowered(&blacklist.file_name_keywords),
                patterns,
            },
            content: content.clone(),
            meaningless: content
                .meaningless_words
                .iter()
                .map(|w| w.trim().to_lowercase())
                .collect(),
        }
    }

    pub fn from_snapshot(snapshot: &RuleSnapshot) -> Self {
        Self::new(&snapshot.whitelist, &snapshot.blacklist, &snapshot.content_filter)
    }

    /// Classify a message. `None` means accept.
    pub fn classify(&self, text: &str, media: &Media) -> Option<FilterReason> {
        let text_lower = text.to_lowercase();

        if self.whitelist_enabled {
            return if self.whitelist.iter().any(|kw| text_lower.contains(kw.as_str())) {
                debug!("Whitelist hit, accepting");
                None
            } else {
                Some(FilterReason::WhitelistMiss)
            };
        }

        if self.blacklist.enabled {
            if let Some(reason) = self.check_blacklist(text, &text_lower, media) {
                return Some(reason);
            }
        }

        if self.content.enabled {
            return self.check_content(text, media);
        }

        None
    }

    fn check_blacklist(&self, text: &str, text_lower: &str, media: &Media) -> Option<FilterReason> {
        let list = &self.blacklist;

        if let Some(kw) = list.keywords.iter().find(|kw| text_lower.contains(kw.as_str())) {
            return Some(FilterReason::BlacklistKeyword(kw.clone()));
        }

        if let Some(rule) = list.words.iter().find(|w| w.regex.is_match(text)) {
            return Some(FilterReason::BlacklistWord(rule.keyword.clone()));
        }

        if let Some(file_name) = media.file_name() {
            let name_lower = file_name.to_lowercase();
            if let Some(kw) = list
                .file_name_keywords
                .iter()
                .find(|kw| name_lower.contains(kw.as_str()))
            {
                return Some(FilterReason::BlacklistFileName(kw.clone()));
            }
        }

        list.patterns
            .iter()
            .find(|p| p.is_match(text))
            .map(|p| FilterReason::BlacklistPattern(p.as_str().to_string()))
    }

    fn check_content(&self, text: &str, media: &Media) -> Option<FilterReason> {
        let trimmed = text.trim();

        if trimmed.is_empty() && media.is_none() {
            return Some(FilterReason::Empty);
        }

        let normalized = trimmed.to_lowercase();
        if !normalized.is_empty() && self.meaningless.iter().any(|w| *w == normalized) {
            return Some(FilterReason::Meaningless);
        }

        let length = trimmed.chars().count();
        if media.is_none() && length < self.content.min_meaningful_length {
            return Some(FilterReason::TooShort {
                length,
                min: self.content.min_meaningful_length,
            });
        }

        None
    }
}
