//! Cold-start replay of messages published while the relay was down.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{FailureClass, PipelineError};
use crate::pipeline::dispatcher::Dispatcher;
use crate::pipeline::types::{DispatchUnit, InboundMessage};
use crate::session::SessionPool;

/// Messages requested per history call.
pub const HISTORY_PAGE_SIZE: usize = 100;

/// Totals from one scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub sources_scanned: usize,
    pub sources_skipped: usize,
    pub units: usize,
    pub failed_sources: Vec<i64>,
    /// Shutdown was requested before the scan finished.
    pub interrupted: bool,
}

pub struct HistoryScanner {
    dispatcher: Arc<Dispatcher>,
    pool: Arc<SessionPool>,
    /// Global default, overridable per source.
    forward_new_only: bool,
    shutdown: CancellationToken,
}

impl HistoryScanner {
    pub fn new(dispatcher: Arc<Dispatcher>, pool: Arc<SessionPool>, forward_new_only: bool) -> Self {
        Self {
            dispatcher,
            pool,
            forward_new_only,
            shutdown: CancellationToken::new(),
        }
    }

    /// Stop between units once `token` is cancelled.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Replay every eligible source. A failing source is logged and the
    /// scan moves on.
    pub async fn scan(&self) -> ScanReport {
        let snapshot = self.dispatcher.rules().current();
        let mut report = ScanReport::default();

        for source in &snapshot.sources {
            if self.shutdown.is_cancelled() {
                report.interrupted = true;
                break;
            }
            let Some(chat_id) = source.resolved_id else {
                warn!(source = %source.identifier, "Skipping history for unresolved source");
                report.sources_skipped += 1;
                continue;
            };
            if source.forward_new_only.unwrap_or(self.forward_new_only) {
                debug!(source = chat_id, "New messages only, skipping history");
                report.sources_skipped += 1;
                continue;
            }

            match self.scan_source(chat_id).await {
                Ok(units) => {
                    report.sources_scanned += 1;
                    report.units += units;
                    if self.shutdown.is_cancelled() {
                        report.interrupted = true;
                        break;
                    }
                }
                Err(e) => {
                    warn!(source = chat_id, error = %e, "History scan failed for source");
                    report.failed_sources.push(chat_id);
                }
            }
        }

        info!(
            scanned = report.sources_scanned,
            skipped = report.sources_skipped,
            failed = report.failed_sources.len(),
            units = report.units,
            interrupted = report.interrupted,
            "History scan complete"
        );
        report
    }

    async fn scan_source(&self, chat_id: i64) -> Result<usize, PipelineError> {
        let mut after = self.dispatcher.progress().get(chat_id).await?;
        let mut carry: Vec<InboundMessage> = Vec::new();
        let mut dispatched = 0;

        info!(source = chat_id, after, "Scanning history");

        loop {
            if self.shutdown.is_cancelled() {
                return Ok(dispatched);
            }
            let client = self.pool.acquire().await?;
            let page = match client.fetch_history(chat_id, after, HISTORY_PAGE_SIZE).await {
                Ok(page) => page,
                Err(source) => {
                    // Only account-wide conditions reach the pool. Its bars
                    // are per send destination, and a source is not one.
                    if matches!(source.class(), FailureClass::RateLimit | FailureClass::Unauthorized) {
                        self.pool
                            .report_failure(client.account_id(), chat_id, &source)
                            .await;
                    }
                    return Err(PipelineError::History {
                        source_id: chat_id,
                        source,
                    });
                }
            };

            let full_page = page.len() >= HISTORY_PAGE_SIZE;
            let Some(max_id) = page.iter().map(|m| m.id).max() else {
                break;
            };
            after = max_id;

            carry.extend(page);
            let mut units = group_units(std::mem::take(&mut carry));

            // An album may continue on the next page.
            if full_page && units.last().is_some_and(from_album) {
                if let Some(tail) = units.pop() {
                    carry = tail.messages().to_vec();
                }
            }

            for unit in &units {
                if self.shutdown.is_cancelled() {
                    return Ok(dispatched);
                }
                self.dispatcher.process(unit).await;
                dispatched += 1;
            }

            if !full_page {
                break;
            }
        }

        if let Some(unit) = DispatchUnit::album(carry) {
            self.dispatcher.process(&unit).await;
            dispatched += 1;
        }

        Ok(dispatched)
    }
}

/// Group ascending history into units. Consecutive messages sharing a
/// grouped id form one album.
pub fn group_units(messages: Vec<InboundMessage>) -> Vec<DispatchUnit> {
    let mut units = Vec::new();
    let mut current: Vec<InboundMessage> = Vec::new();

    for message in messages {
        let continues = match (current.last(), &message.grouped_id) {
            (Some(prev), Some(group)) => prev.grouped_id.as_ref() == Some(group),
            _ => false,
        };
        if !continues {
            units.extend(DispatchUnit::album(std::mem::take(&mut current)));
        }
        current.push(message);
    }
    units.extend(DispatchUnit::album(current));
    units
}

/// Whether the unit came from an album, even a one-part one.
fn from_album(unit: &DispatchUnit) -> bool {
    unit.messages().iter().any(|m| m.grouped_id.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::clock::ManualClock;
    use crate::error::PlatformError;
    use crate::pipeline::dispatcher::DispatchSettings;
    use crate::platform::PlatformClient;
    use crate::rules::{RuleSnapshot, RuleStore};
    use crate::session::SendEngine;
    use crate::store::{LibSqlBackend, ProgressStore};
    use crate::testing::MockClient;

    const SRC: i64 = -100;

    fn snapshot(forward_new_only: Option<bool>) -> RuleSnapshot {
        let mut snap = RuleSnapshot::from_json(
            r#"{
                "sources": [{"identifier": -100, "resolved_id": -100}],
                "content_filter": {"enabled": false},
                "default_target": -200,
                "resolved_default_target_id": -200
            }"#,
        )
        .unwrap();
        snap.sources[0].forward_new_only = forward_new_only;
        snap
    }

    async fn scanner(
        client: MockClient,
        snap: RuleSnapshot,
        global_new_only: bool,
    ) -> (HistoryScanner, Arc<MockClient>, Arc<LibSqlBackend>) {
        let client = Arc::new(client);
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let pool = Arc::new(
            SessionPool::new(vec![client.clone() as Arc<dyn PlatformClient>], clock).unwrap(),
        );
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(RuleStore::new(snap)),
            SendEngine::new(pool.clone()),
            db.clone(),
            db.clone(),
            DispatchSettings::default(),
        ));
        (
            HistoryScanner::new(dispatcher, pool, global_new_only),
            client,
            db,
        )
    }

    fn history(ids: std::ops::RangeInclusive<i64>) -> Vec<InboundMessage> {
        ids.map(|id| InboundMessage::text(SRC, id, format!("post number {id}")))
            .collect()
    }

    #[test]
    fn groups_consecutive_album_parts() {
        let msgs = vec![
            InboundMessage::text(SRC, 1, "solo"),
            InboundMessage::text(SRC, 2, "").with_grouped_id("g"),
            InboundMessage::text(SRC, 3, "").with_grouped_id("g"),
            InboundMessage::text(SRC, 4, "").with_grouped_id("h"),
            InboundMessage::text(SRC, 5, "tail"),
        ];
        let units = group_units(msgs);
        let ids: Vec<Vec<i64>> = units.iter().map(DispatchUnit::message_ids).collect();
        assert_eq!(ids, vec![vec![1], vec![2, 3], vec![4], vec![5]]);
    }

    #[tokio::test]
    async fn replays_after_progress() {
        let client = MockClient::new("a1").with_history(SRC, history(1..=5));
        let (scanner, client, db) = scanner(client, snapshot(Some(false)), true).await;
        db.set(SRC, 2).await.unwrap();

        let report = scanner.scan().await;
        assert_eq!(report.units, 3);
        assert_eq!(report.sources_scanned, 1);

        let sent: Vec<i64> = client.sent().iter().map(|(p, _)| p.source_message_ids[0]).collect();
        assert_eq!(sent, vec![3, 4, 5]);
        assert_eq!(ProgressStore::get(&*db, SRC).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn pages_through_long_history() {
        let client = MockClient::new("a1").with_history(SRC, history(1..=250));
        let (scanner, client, db) = scanner(client, snapshot(None), false).await;

        let report = scanner.scan().await;
        assert_eq!(report.units, 250);
        assert_eq!(client.sent().len(), 250);
        assert_eq!(ProgressStore::get(&*db, SRC).await.unwrap(), 250);
    }

    #[tokio::test]
    async fn album_across_page_boundary_stays_whole() {
        let mut msgs = history(1..=98);
        msgs.push(InboundMessage::text(SRC, 99, "album").with_grouped_id("g"));
        msgs.push(InboundMessage::text(SRC, 100, "").with_grouped_id("g"));
        msgs.push(InboundMessage::text(SRC, 101, "").with_grouped_id("g"));
        let client = MockClient::new("a1").with_history(SRC, msgs);
        let (scanner, client, _db) = scanner(client, snapshot(None), false).await;

        let report = scanner.scan().await;
        assert_eq!(report.units, 99);
        let last = client.sent().last().cloned().unwrap();
        assert_eq!(last.0.source_message_ids, vec![99, 100, 101]);
        assert!(last.0.grouped);
    }

    #[tokio::test]
    async fn forward_new_only_skips_source() {
        let client = MockClient::new("a1").with_history(SRC, history(1..=5));
        let (scanner, client, _db) = scanner(client, snapshot(None), true).await;
        let report = scanner.scan().await;
        assert_eq!(report.sources_skipped, 1);
        assert!(client.sent().is_empty());
    }

    #[tokio::test]
    async fn per_source_override_beats_global() {
        let client = MockClient::new("a1").with_history(SRC, history(1..=5));
        let (scanner, client, _db) = scanner(client, snapshot(Some(true)), false).await;
        scanner.scan().await;
        assert!(client.sent().is_empty());
    }

    #[tokio::test]
    async fn unsupported_history_is_reported_not_fatal() {
        let client = MockClient::new("a1")
            .with_history_error(PlatformError::Unsupported("no history".into()));
        let (scanner, _client, _db) = scanner(client, snapshot(Some(false)), true).await;
        let report = scanner.scan().await;
        assert_eq!(report.failed_sources, vec![SRC]);
        assert_eq!(report.units, 0);
    }

    #[tokio::test]
    async fn cancelled_scan_sends_nothing() {
        let client = MockClient::new("a1").with_history(SRC, history(1..=5));
        let (scanner, client, db) = scanner(client, snapshot(Some(false)), false).await;
        let token = CancellationToken::new();
        token.cancel();

        let report = scanner.with_shutdown(token).scan().await;
        assert!(report.interrupted);
        assert_eq!(report.units, 0);
        assert!(client.sent().is_empty());
        assert_eq!(ProgressStore::get(&*db, SRC).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn forbidden_history_read_does_not_bar_the_account() {
        let client = MockClient::new("a1").with_history_error(PlatformError::Forbidden {
            chat: SRC.to_string(),
            reason: "bot is not a member of the channel".into(),
        });
        let (scanner, _client, _db) = scanner(client, snapshot(Some(false)), false).await;

        let report = scanner.scan().await;
        assert_eq!(report.failed_sources, vec![SRC]);

        let status = scanner.pool.status().await;
        assert!(status[0].alive);
        assert!(status[0].barred_destinations.is_empty());
    }
}
