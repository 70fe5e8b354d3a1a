//! Scriptable in-memory platform client for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::error::PlatformError;
use crate::pipeline::types::{ForwardMode, InboundMessage, PendingSend};
use crate::platform::PlatformClient;
use crate::rules::ChatRef;

pub struct MockClient {
    id: String,
    chats: HashMap<String, i64>,
    send_results: Mutex<VecDeque<Result<(), PlatformError>>>,
    sent: Mutex<Vec<(PendingSend, ForwardMode)>>,
    history: HashMap<i64, Vec<InboundMessage>>,
    history_error: Option<PlatformError>,
    resolve_error: Mutex<Option<PlatformError>>,
    resolve_calls: AtomicUsize,
}

impl MockClient {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            chats: HashMap::new(),
            send_results: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            history: HashMap::new(),
            history_error: None,
            resolve_error: Mutex::new(None),
            resolve_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_chat(mut self, name: &str, id: i64) -> Self {
        self.chats.insert(name.to_string(), id);
        self
    }

    /// Queue send results; once drained, sends succeed.
    pub fn with_send_results(self, results: Vec<Result<(), PlatformError>>) -> Self {
        self.send_results.lock().unwrap().extend(results);
        self
    }

    pub fn with_history(mut self, chat_id: i64, messages: Vec<InboundMessage>) -> Self {
        self.history.insert(chat_id, messages);
        self
    }

    pub fn with_history_error(mut self, error: PlatformError) -> Self {
        self.history_error = Some(error);
        self
    }

    pub fn sent(&self) -> Vec<(PendingSend, ForwardMode)> {
        self.sent.lock().unwrap().clone()
    }

    /// Fail every later non-numeric lookup with `error`.
    pub fn fail_resolves_with(&self, error: PlatformError) {
        *self.resolve_error.lock().unwrap() = Some(error);
    }

    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlatformClient for MockClient {
    fn account_id(&self) -> &str {
        &self.id
    }

    async fn send(&self, request: &PendingSend, mode: ForwardMode) -> Result<(), PlatformError> {
        let result = self.send_results.lock().unwrap().pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            self.sent.lock().unwrap().push((request.clone(), mode));
        }
        result
    }

    async fn resolve_chat(&self, chat: &ChatRef) -> Result<i64, PlatformError> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(id) = chat.as_numeric() {
            return Ok(id);
        }
        if let Some(e) = self.resolve_error.lock().unwrap().clone() {
            return Err(e);
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
        chat_id: i64,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<InboundMessage>, PlatformError> {
        if let Some(e) = &self.history_error {
            return Err(e.clone());
        }
        Ok(self
            .history
            .get(&chat_id)
            .map(|all| {
                all.iter()
                    .filter(|m| m.id > after_id)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
