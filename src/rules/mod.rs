//! Rule snapshots and their lock-free holder.
//!
//! A snapshot is never edited in place. Reloading builds a new one,
//! resolves its chat references, compiles it, and swaps it in whole.

pub mod model;

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::{info, warn};

use crate::error::PlatformError;
use crate::pipeline::filter::FilterChain;
use crate::pipeline::router::Router;
use crate::pipeline::transform::TextTransform;
use crate::platform::PlatformClient;

pub use model::{
    BlacklistConfig, ChatRef, ContentQualityConfig, Replacement, RoutingRule, RuleSnapshot,
    SourceRule, WhitelistConfig,
};

/// A snapshot together with everything compiled from it.
#[derive(Debug)]
pub struct ActiveRules {
    pub snapshot: Arc<RuleSnapshot>,
    pub filters: FilterChain,
    pub router: Router,
    pub transform: TextTransform,
}

impl ActiveRules {
    pub fn compile(snapshot: RuleSnapshot) -> Self {
        Self {
            filters: FilterChain::from_snapshot(&snapshot),
            router: Router::from_snapshot(&snapshot),
            transform: TextTransform::new(&snapshot.replacements),
            snapshot: Arc::new(snapshot),
        }
    }
}

/// Outcome of one resolution pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolutionReport {
    pub resolved: usize,
    /// References that could not be resolved, as written.
    pub unresolved: Vec<String>,
}

impl ResolutionReport {
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }
}

/// Holder of the active rule snapshot.
pub struct RuleStore {
    active: ArcSwap<ActiveRules>,
}

impl RuleStore {
    /// Wrap a snapshot as-is, without resolving anything.
    pub fn new(snapshot: RuleSnapshot) -> Self {
        Self {
            active: ArcSwap::from_pointee(ActiveRules::compile(snapshot)),
        }
    }

    /// Current snapshot.
    pub fn current(&self) -> Arc<RuleSnapshot> {
        Arc::clone(&self.active.load().snapshot)
    }

    /// Current snapshot with its compiled filters, router and transform.
    pub fn active(&self) -> Arc<ActiveRules> {
        self.active.load_full()
    }

    /// Replace the snapshot. Every reference is resolved first; the swap
    /// happens only afterwards, so readers never see a half-resolved value.
    pub async fn reload(
        &self,
        mut snapshot: RuleSnapshot,
        client: &dyn PlatformClient,
    ) -> ResolutionReport {
        snapshot.clear_resolved();
        let report = resolve_snapshot(&mut snapshot, client).await;
        self.active.store(Arc::new(ActiveRules::compile(snapshot)));
        info!(
            resolved = report.resolved,
            unresolved = report.unresolved.len(),
            "Rule snapshot reloaded"
        );
        report
    }

    /// Re-resolve the current snapshot and swap in the resolved copy.
    pub async fn resolve_targets(&self, client: &dyn PlatformClient) -> ResolutionReport {
        let mut snapshot = (*self.current()).clone();
        let report = resolve_snapshot(&mut snapshot, client).await;
        self.active.store(Arc::new(ActiveRules::compile(snapshot)));
        info!(
            resolved = report.resolved,
            unresolved = report.unresolved.len(),
            "Rule targets re-resolved"
        );
        report
    }
}

/// Per-pass lookup cache; a reference shared by several rules is
/// resolved once.
struct Resolver<'a> {
    client: &'a dyn PlatformClient,
    cache: HashMap<ChatRef, Option<i64>>,
    report: ResolutionReport,
}

impl Resolver<'_> {
    /// Look `chat` up. A failed lookup keeps `previous`, so an id that
    /// once worked survives a transient error.
    async fn resolve(&mut self, chat: &ChatRef, previous: Option<i64>, role: &str) -> Option<i64> {
        let looked_up = match self.cache.get(chat) {
            Some(cached) => *cached,
            None => {
                let id = match self.client.resolve_chat(chat).await {
                    Ok(id) => Some(id),
                    Err(e) => {
                        log_unresolved(chat, role, previous, &e);
                        None
                    }
                };
                self.cache.insert(chat.clone(), id);
                id
            }
        };

        let id = looked_up.or(previous);
        match id {
            Some(_) => self.report.resolved += 1,
            None => self.report.unresolved.push(chat.to_string()),
        }
        id
    }
}

fn log_unresolved(chat: &ChatRef, role: &str, previous: Option<i64>, error: &PlatformError) {
    match previous {
        Some(id) => warn!(chat = %chat, role, kept = id, error = %error, "Lookup failed, keeping previous id"),
        None => warn!(chat = %chat, role, error = %error, "Could not resolve chat reference"),
    }
}

async fn resolve_snapshot(
    snapshot: &mut RuleSnapshot,
    client: &dyn PlatformClient,
) -> ResolutionReport {
    let mut resolver = Resolver {
        client,
        cache: HashMap::new(),
        report: ResolutionReport::default(),
    };

    for source in &mut snapshot.sources {
        source.resolved_id = resolver
            .resolve(&source.identifier, source.resolved_id, "source")
            .await;
    }
    for rule in &mut snapshot.routing_rules {
        rule.resolved_target_id = resolver
            .resolve(&rule.target, rule.resolved_target_id, "rule target")
            .await;
    }
    if let Some(target) = &snapshot.default_target {
        snapshot.resolved_default_target_id = resolver
            .resolve(target, snapshot.resolved_default_target_id, "default target")
            .await;
    }

    resolver.report
}
