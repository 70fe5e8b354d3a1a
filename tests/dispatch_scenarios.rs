//! End-to-end dispatch scenarios through the public API.
//!
//! Each test wires a real `Dispatcher` over libSQL storage and a pool of
//! scripted accounts, then drives units through it and checks what
//! reached the platform and what was persisted.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use tg_relay::clock::{Clock, ManualClock};
use tg_relay::error::PlatformError;
use tg_relay::pipeline::types::{
    DispatchOutcome, DispatchUnit, Fingerprint, ForwardMode, InboundMessage, PendingSend,
    DEFAULT_TEXT_HASH_MIN_LEN,
};
use tg_relay::pipeline::{DispatchSettings, Dispatcher};
use tg_relay::platform::PlatformClient;
use tg_relay::rules::{ChatRef, RuleSnapshot, RuleStore};
use tg_relay::session::{SendEngine, SessionPool};
use tg_relay::store::{DedupStore, LibSqlBackend, ProgressStore};

const SOURCE: i64 = -1001;
const DEFAULT_DEST: i64 = -2002;
const NEWS_DEST: i64 = -3003;

/// Account whose send results are scripted up front.
struct ScriptedAccount {
    id: String,
    chats: HashMap<String, i64>,
    script: Mutex<VecDeque<Result<(), PlatformError>>>,
    delivered: Mutex<Vec<PendingSend>>,
}

impl ScriptedAccount {
    fn new(id: &str) -> Self {
        let chats = [
            ("@source".to_string(), SOURCE),
            ("@default".to_string(), DEFAULT_DEST),
            ("@news".to_string(), NEWS_DEST),
        ]
        .into_iter()
        .collect();
        Self {
            id: id.to_string(),
            chats,
            script: Mutex::new(VecDeque::new()),
            delivered: Mutex::new(Vec::new()),
        }
    }

    fn failing_first_with(self, err: PlatformError) -> Self {
        self.script.lock().unwrap().push_back(Err(err));
        self
    }

    fn delivered(&self) -> Vec<PendingSend> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl PlatformClient for ScriptedAccount {
    fn account_id(&self) -> &str {
        &self.id
    }

    async fn send(&self, request: &PendingSend, _mode: ForwardMode) -> Result<(), PlatformError> {
        let next = self.script.lock().unwrap().pop_front().unwrap_or(Ok(()));
        if next.is_ok() {
            self.delivered.lock().unwrap().push(request.clone());
        }
        next
    }

    async fn resolve_chat(&self, chat: &ChatRef) -> Result<i64, PlatformError> {
        if let Some(id) = chat.as_numeric() {
            return Ok(id);
        }
        self.chats
            .get(&chat.to_string())
            .copied()
            .ok_or_else(|| PlatformError::InvalidTarget {
                chat: chat.to_string(),
                reason: "chat not found".into(),
            })
    }

    async fn fetch_history(
        &self,
        _chat_id: i64,
        _after_id: i64,
        _limit: usize,
    ) -> Result<Vec<InboundMessage>, PlatformError> {
        Ok(Vec::new())
    }
}

const RULES: &str = r#"{
    "sources": [{"identifier": "@source"}],
    "distribution_rules": [
        {"name": "news", "any_keywords": ["breaking"], "target_identifier": "@news", "topic_id": 12}
    ],
    "ad_filter": {"keywords_substring": ["spam"]},
    "content_filter": {"enabled": true, "meaningless_words": ["ok"], "min_meaningful_length": 3},
    "default_target": "@default"
}"#;

struct Relay {
    dispatcher: Dispatcher,
    pool: Arc<SessionPool>,
    clock: Arc<ManualClock>,
    db: Arc<LibSqlBackend>,
}

async fn relay(accounts: Vec<Arc<ScriptedAccount>>, rules: &str, db: LibSqlBackend) -> Relay {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap(),
    ));
    let clients: Vec<Arc<dyn PlatformClient>> = accounts
        .iter()
        .map(|a| Arc::clone(a) as Arc<dyn PlatformClient>)
        .collect();
    let pool = Arc::new(SessionPool::new(clients, clock.clone()).unwrap());

    let store = Arc::new(RuleStore::new(RuleSnapshot::default()));
    let report = store
        .reload(
            RuleSnapshot::from_json(rules).unwrap(),
            accounts[0].as_ref(),
        )
        .await;
    assert!(report.is_complete(), "unresolved: {:?}", report.unresolved);

    let db = Arc::new(db);
    let dispatcher = Dispatcher::new(
        store,
        SendEngine::new(pool.clone()),
        db.clone(),
        db.clone(),
        DispatchSettings::default(),
    );
    Relay {
        dispatcher,
        pool,
        clock,
        db,
    }
}

async fn memory_relay(accounts: Vec<Arc<ScriptedAccount>>) -> Relay {
    relay(accounts, RULES, LibSqlBackend::new_memory().await.unwrap()).await
}

fn post(id: i64, text: &str) -> DispatchUnit {
    DispatchUnit::single(InboundMessage::text(SOURCE, id, text))
}

#[tokio::test]
async fn blacklisted_post_is_dropped_but_progress_moves() {
    let a1 = Arc::new(ScriptedAccount::new("a1"));
    let r = memory_relay(vec![a1.clone()]).await;

    let outcome = r.dispatcher.process(&post(40, "buy spam now")).await;

    assert_eq!(
        outcome,
        DispatchOutcome::Filtered {
            reason: "blacklist:spam".into()
        }
    );
    assert!(a1.delivered().is_empty());
    assert_eq!(ProgressStore::get(&*r.db, SOURCE).await.unwrap(), 40);
}

#[tokio::test]
async fn plain_post_reaches_default_and_is_fingerprinted() {
    let a1 = Arc::new(ScriptedAccount::new("a1"));
    let r = memory_relay(vec![a1.clone()]).await;
    let unit = post(41, "hello world");

    let outcome = r.dispatcher.process(&unit).await;

    assert_eq!(
        outcome,
        DispatchOutcome::Sent {
            destination: DEFAULT_DEST,
            topic_id: None,
            account: "a1".into()
        }
    );
    let fp = Fingerprint::of(&unit.messages()[0], DEFAULT_TEXT_HASH_MIN_LEN);
    assert!(r.db.contains(fp.as_str()).await.unwrap());
}

#[tokio::test]
async fn keyword_rule_routes_into_topic() {
    let a1 = Arc::new(ScriptedAccount::new("a1"));
    let r = memory_relay(vec![a1.clone()]).await;

    r.dispatcher.process(&post(42, "BREAKING: markets open")).await;

    let delivered = a1.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].destination, NEWS_DEST);
    assert_eq!(delivered[0].topic_id, Some(12));
}

#[tokio::test]
async fn rejected_topic_falls_back_to_plain_send() {
    let a1 = Arc::new(
        ScriptedAccount::new("a1").failing_first_with(PlatformError::ThreadIncompatible {
            chat: NEWS_DEST.to_string(),
            topic_id: 12,
            reason: "message thread not found".into(),
        }),
    );
    let r = memory_relay(vec![a1.clone()]).await;

    let outcome = r.dispatcher.process(&post(43, "breaking story")).await;

    assert_eq!(
        outcome,
        DispatchOutcome::Sent {
            destination: NEWS_DEST,
            topic_id: None,
            account: "a1".into()
        }
    );
    assert_eq!(a1.delivered()[0].topic_id, None);
}

#[tokio::test]
async fn rate_limited_account_rests_while_the_other_sends() {
    let a1 = Arc::new(ScriptedAccount::new("a1").failing_first_with(PlatformError::RateLimited {
        wait: Duration::from_secs(30),
    }));
    let a2 = Arc::new(ScriptedAccount::new("a2"));
    let r = memory_relay(vec![a1.clone(), a2.clone()]).await;

    let first = r.dispatcher.process(&post(1, "first update")).await;
    assert!(matches!(first, DispatchOutcome::Failed { .. }));
    assert_eq!(ProgressStore::get(&*r.db, SOURCE).await.unwrap(), 1);

    let cooling = r.pool.status().await;
    let expected = r.clock.now() + chrono::Duration::seconds(35);
    assert_eq!(cooling[0].cooling_until, Some(expected));
    assert_eq!(cooling[1].cooling_until, None);

    for id in 2..=3 {
        let outcome = r.dispatcher.process(&post(id, &format!("update {id}"))).await;
        assert!(
            matches!(outcome, DispatchOutcome::Sent { ref account, .. } if account == "a2"),
            "unit {id}: {outcome:?}"
        );
    }
    assert!(a1.delivered().is_empty());

    r.clock.advance(Duration::from_secs(36));
    r.dispatcher.process(&post(4, "update four")).await;
    assert_eq!(a1.delivered().len(), 1);
}

#[tokio::test]
async fn same_long_text_from_two_posts_is_sent_once() {
    let a1 = Arc::new(ScriptedAccount::new("a1"));
    let r = memory_relay(vec![a1.clone()]).await;
    let text = "The quarterly report is out now with all the numbers you asked for.";

    r.dispatcher.process(&post(10, text)).await;
    let again = r.dispatcher.process(&post(11, text)).await;

    assert!(matches!(again, DispatchOutcome::Duplicate { .. }));
    assert_eq!(a1.delivered().len(), 1);
    assert_eq!(ProgressStore::get(&*r.db, SOURCE).await.unwrap(), 11);
}

#[tokio::test]
async fn whitelist_overrides_blacklist_and_quality() {
    let rules = r#"{
        "sources": [{"identifier": "@source"}],
        "whitelist": {"enable": true, "keywords": ["release"]},
        "ad_filter": {"keywords_substring": ["spam"]},
        "content_filter": {"meaningless_words": ["ok"]},
        "default_target": "@default"
    }"#;
    let a1 = Arc::new(ScriptedAccount::new("a1"));
    let r = relay(vec![a1.clone()], rules, LibSqlBackend::new_memory().await.unwrap()).await;

    let kept = r.dispatcher.process(&post(1, "release notes, no spam inside")).await;
    assert!(matches!(kept, DispatchOutcome::Sent { .. }));

    let dropped = r.dispatcher.process(&post(2, "regular announcement")).await;
    assert_eq!(
        dropped,
        DispatchOutcome::Filtered {
            reason: "whitelist:miss".into()
        }
    );
    assert_eq!(a1.delivered().len(), 1);
}

#[tokio::test]
async fn restart_does_not_resend_handled_posts() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("relay.db");

    let a1 = Arc::new(ScriptedAccount::new("a1"));
    {
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        let r = relay(vec![a1.clone()], RULES, db).await;
        r.dispatcher.process(&post(7, "before restart")).await;
    }

    let db = LibSqlBackend::new_local(&path).await.unwrap();
    let r = relay(vec![a1.clone()], RULES, db).await;
    let outcome = r.dispatcher.process(&post(7, "before restart")).await;

    assert!(matches!(outcome, DispatchOutcome::Ignored { .. }));
    assert_eq!(a1.delivered().len(), 1);
}
