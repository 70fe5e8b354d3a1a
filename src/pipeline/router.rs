//! Rule-based destination selection.

use regex::{Regex, RegexBuilder};
use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::pipeline::types::Media;
use crate::rules::{RoutingRule, RuleSnapshot};

/// Where a message goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub destination: i64,
    pub topic_id: Option<i64>,
}

/// A routing rule with its filename globs compiled.
#[derive(Debug, Clone)]
struct CompiledRule {
    name: String,
    /// Lowercased.
    all_keywords: Vec<String>,
    /// Lowercased.
    any_keywords: Vec<String>,
    /// Lowercased.
    file_types: Vec<String>,
    file_name_globs: Vec<Regex>,
    /// Whether the any/media group was configured at all. Stays true even
    /// if every glob failed to compile, so such a rule cannot silently
    /// degrade to an all-only rule.
    has_any_group: bool,
    target: String,
    resolved_target: Option<i64>,
    topic_id: Option<i64>,
}

/// Translate a filename glob into an anchored, case-insensitive regex.
pub fn glob_to_regex(glob: &str) -> Result<Regex, regex::Error> {
    let body = regex::escape(glob).replace(r"\*", ".*");
    RegexBuilder::new(&format!("^{body}$"))
        .case_insensitive(true)
        .build()
}

fn lowered(items: &[String]) -> Vec<String> {
    items
        .iter()
        .map(|s| s.to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

impl CompiledRule {
    fn new(rule: &RoutingRule) -> Self {
        let file_name_globs = rule
            .file_name_patterns
            .iter()
            .filter_map(|glob| match glob_to_regex(glob) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(rule = %rule.name, pattern = %glob, error = %e, "Invalid filename pattern");
                    None
                }
            })
            .collect();

        let any_keywords = lowered(&rule.any_keywords);
        let file_types = lowered(&rule.file_types);
        let has_any_group = !any_keywords.is_empty()
            || !file_types.is_empty()
            || rule.file_name_patterns.iter().any(|p| !p.is_empty());

        Self {
            name: rule.name.clone(),
            all_keywords: lowered(&rule.all_keywords),
            any_keywords,
            file_types,
            file_name_globs,
            has_any_group,
            target: rule.target.to_string(),
            resolved_target: rule.resolved_target_id,
            topic_id: rule.topic_id,
        }
    }

    fn matches(&self, text_lower: &str, media: &Media) -> bool {
        let has_all_group = !self.all_keywords.is_empty();

        if !has_all_group && !self.has_any_group {
            return false;
        }

        if has_all_group
            && !self
                .all_keywords
                .iter()
                .all(|kw| text_lower.contains(kw.as_str()))
        {
            return false;
        }

        if !self.has_any_group {
            return true;
        }

        self.any_group_matches(text_lower, media)
    }

    fn any_group_matches(&self, text_lower: &str, media: &Media) -> bool {
        if self
            .any_keywords
            .iter()
            .any(|kw| text_lower.contains(kw.as_str()))
        {
            return true;
        }

        if let Some(mime) = media.mime_type() {
            let mime = mime.to_lowercase();
            if self.file_types.iter().any(|ft| mime.contains(ft.as_str())) {
                return true;
            }
        }

        media
            .file_name()
            .is_some_and(|name| self.file_name_globs.iter().any(|re| re.is_match(name)))
    }
}

/// Ordered rule evaluation with a default fallback.
#[derive(Debug, Clone, Default)]
pub struct Router {
    rules: Vec<CompiledRule>,
    default_target: Option<String>,
    default_resolved: Option<i64>,
    default_topic: Option<i64>,
}

impl Router {
    pub fn from_snapshot(snapshot: &RuleSnapshot) -> Self {
        Self {
            rules: snapshot.routing_rules.iter().map(CompiledRule::new).collect(),
            default_target: snapshot.default_target.as_ref().map(ToString::to_string),
            default_resolved: snapshot.resolved_default_target_id,
            default_topic: snapshot.default_topic_id,
        }
    }

    /// Pick the destination for a message.
    ///
    /// The first matching rule with a resolved destination wins. Matching
    /// rules whose destination never resolved are skipped. Without a match
    /// the default is used; an unresolved default is an error.
    pub fn route(&self, text: &str, media: &Media) -> Result<Route, PipelineError> {
        let text_lower = text.to_lowercase();

        for rule in &self.rules {
            if !rule.matches(&text_lower, media) {
                continue;
            }
            match rule.resolved_target {
                Some(destination) => {
                    debug!(rule = %rule.name, destination, "Routing rule matched");
                    return Ok(Route {
                        destination,
                        topic_id: rule.topic_id,
                    });
                }
                None => {
                    warn!(
                        rule = %rule.name,
                        target = %rule.target,
                        "Routing rule matched but its destination is unresolved, skipping"
                    );
                }
            }
        }

        match self.default_resolved {
            Some(destination) => {
                debug!(destination, "No routing rule matched, using default");
                Ok(Route {
                    destination,
                    topic_id: self.default_topic,
                })
            }
            None => Err(PipelineError::UnresolvedTarget(format!(
                "default destination {} is unresolved",
                self.default_target.as_deref().unwrap_or("(not configured)")
            ))),
        }
    }
}
