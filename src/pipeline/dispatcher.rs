//! Dispatcher: drives one dispatch unit from receipt to a terminal state.
//!
//! Flow:
//! 1. Source check and restart guard (units at or below progress are skipped)
//! 2. Filter chain → may short-circuit
//! 3. Dedup check → may short-circuit
//! 4. Route → transform → send
//! 5. Record fingerprints
//!
//! Whatever happens after step 1, progress for the source advances to the
//! unit's highest message id before `process` returns.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::error::PipelineError;
use crate::pipeline::types::{
    DEFAULT_TEXT_HASH_MIN_LEN, DispatchEvent, DispatchOutcome, DispatchUnit, Fingerprint,
    ForwardMode, PendingSend,
};
use crate::rules::{ActiveRules, RuleStore};
use crate::session::SendEngine;
use crate::store::{DedupStore, ProgressStore};

/// Event channel capacity.
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Dispatch behaviour switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSettings {
    pub mode: ForwardMode,
    pub dedup_enabled: bool,
    /// Text shorter than this (in characters) is not fingerprinted by content.
    pub text_hash_min_len: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            mode: ForwardMode::Relay,
            dedup_enabled: true,
            text_hash_min_len: DEFAULT_TEXT_HASH_MIN_LEN,
        }
    }
}

pub struct Dispatcher {
    rules: Arc<RuleStore>,
    sender: SendEngine,
    dedup: Arc<dyn DedupStore>,
    progress: Arc<dyn ProgressStore>,
    settings: DispatchSettings,
    events: broadcast::Sender<DispatchEvent>,
}

impl Dispatcher {
    pub fn new(
        rules: Arc<RuleStore>,
        sender: SendEngine,
        dedup: Arc<dyn DedupStore>,
        progress: Arc<dyn ProgressStore>,
        settings: DispatchSettings,
    ) -> Self {
        let (events, _rx) = broadcast::channel(DEFAULT_EVENT_CAPACITY);
        Self {
            rules,
            sender,
            dedup,
            progress,
            settings,
            events,
        }
    }

    /// Subscribe to dispatch outcomes.
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.events.subscribe()
    }

    pub fn rules(&self) -> &Arc<RuleStore> {
        &self.rules
    }

    pub fn progress(&self) -> &Arc<dyn ProgressStore> {
        &self.progress
    }

    pub fn sender(&self) -> &SendEngine {
        &self.sender
    }

    pub fn settings(&self) -> DispatchSettings {
        self.settings
    }

    /// Process one unit. Never fails; failures become
    /// [`DispatchOutcome::Failed`].
    pub async fn process(&self, unit: &DispatchUnit) -> DispatchOutcome {
        let source = unit.chat_id();
        let last_id = unit.last_id();
        let active = self.rules.active();

        if active.snapshot.source(source).is_none() {
            debug!(source, message_id = last_id, "Ignoring message from unmonitored chat");
            return DispatchOutcome::Ignored {
                reason: "not a source".into(),
            };
        }

        match self.progress.get(source).await {
            Ok(done) if last_id <= done => {
                debug!(source, message_id = last_id, progress = done, "Already handled, skipping");
                let outcome = DispatchOutcome::Ignored {
                    reason: format!("already handled (progress {done})"),
                };
                self.publish(source, last_id, &outcome);
                return outcome;
            }
            Ok(_) => {}
            Err(e) => warn!(source, error = %e, "Progress lookup failed, processing anyway"),
        }

        let outcome = self.run(unit, &active).await;

        if let Err(e) = self.progress.set(source, last_id).await {
            error!(source, message_id = last_id, error = %e, "Failed to record progress");
        }
        self.publish(source, last_id, &outcome);
        outcome
    }

    async fn run(&self, unit: &DispatchUnit, active: &ActiveRules) -> DispatchOutcome {
        let source = unit.chat_id();
        let rep = unit.representative();
        info!(
            stage = "received",
            source,
            message_id = rep.id,
            parts = unit.messages().len(),
            "Message received"
        );

        if let Some(reason) = active.filters.classify(&rep.text, &rep.media) {
            info!(stage = "filtered", source, message_id = rep.id, reason = %reason, "Message filtered");
            return DispatchOutcome::Filtered {
                reason: reason.to_string(),
            };
        }

        let fingerprint = Fingerprint::of(rep, self.settings.text_hash_min_len);
        if self.settings.dedup_enabled && self.is_duplicate(&fingerprint).await {
            info!(stage = "duplicate", source, message_id = rep.id, fingerprint = %fingerprint, "Duplicate content");
            return DispatchOutcome::Duplicate { fingerprint };
        }

        let route = match active.router.route(&rep.text, &rep.media) {
            Ok(route) => route,
            Err(e) => {
                error!(
                    stage = "send_failed",
                    class = "malformed_target",
                    source,
                    message_id = rep.id,
                    error = %e,
                    "No usable destination"
                );
                return DispatchOutcome::Failed {
                    error: e.to_string(),
                };
            }
        };
        info!(
            stage = "routed",
            source,
            message_id = rep.id,
            destination = route.destination,
            topic_id = route.topic_id,
            "Message routed"
        );

        let text = active.transform.apply(&rep.text);
        let pending = PendingSend::from_unit(unit, route.destination, route.topic_id, text);

        match self.sender.send(&pending, self.settings.mode).await {
            Ok(delivery) => {
                info!(
                    stage = "sent",
                    source,
                    message_id = rep.id,
                    destination = route.destination,
                    topic_id = delivery.topic_id,
                    account = %delivery.account,
                    "Message delivered"
                );
                if self.settings.dedup_enabled {
                    self.record(unit).await;
                }
                DispatchOutcome::Sent {
                    destination: route.destination,
                    topic_id: delivery.topic_id,
                    account: delivery.account,
                }
            }
            Err(e) => {
                let class = match &e {
                    PipelineError::SendFailed { source: err, .. } => err.class().label(),
                    PipelineError::Session(_) => "no_account",
                    _ => "unknown",
                };
                error!(
                    stage = "send_failed",
                    class,
                    source,
                    message_id = rep.id,
                    destination = route.destination,
                    error = %e,
                    "Send failed"
                );
                DispatchOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    /// A store error counts as a duplicate.
    async fn is_duplicate(&self, fingerprint: &Fingerprint) -> bool {
        match self.dedup.contains(fingerprint.as_str()).await {
            Ok(found) => found,
            Err(e) => {
                error!(fingerprint = %fingerprint, error = %e, "Dedup lookup failed, treating as duplicate");
                true
            }
        }
    }

    async fn record(&self, unit: &DispatchUnit) {
        for message in unit.messages() {
            let fingerprint = Fingerprint::of(message, self.settings.text_hash_min_len);
            if let Err(e) = self.dedup.add(fingerprint.as_str()).await {
                error!(fingerprint = %fingerprint, error = %e, "Failed to record fingerprint");
            }
        }
    }

    fn publish(&self, source_chat: i64, message_id: i64, outcome: &DispatchOutcome) {
        // Ok if nobody is listening.
        let _ = self.events.send(DispatchEvent {
            source_chat,
            message_id,
            outcome: outcome.clone(),
            at: Utc::now(),
        });
    }
}
