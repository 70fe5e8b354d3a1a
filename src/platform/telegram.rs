//! Telegram Bot API client: one bot token per account.
//!
//! Sends with `forwardMessage(s)` (relay) or `send*` with copied file ids
//! (republish), resolves `@username` references with `getChat`, and
//! long-polls `getUpdates` for `channel_post` updates. The Bot API offers
//! no channel history, so `fetch_history` reports `Unsupported`.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::error::PlatformError;
use crate::pipeline::types::{
    DispatchUnit, FileKind, ForwardMode, InboundMessage, Media, PendingSend,
};
use crate::platform::album::AlbumAssembler;
use crate::platform::{InboundFeed, PlatformClient, UnitStream};
use crate::rules::ChatRef;

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

/// Maximum caption length for media messages.
const TELEGRAM_MAX_CAPTION_LENGTH: usize = 1024;

/// Long-poll timeout when nothing is buffered.
const POLL_TIMEOUT_SECS: u64 = 30;

/// Short poll used while an album is waiting to settle.
const POLL_TIMEOUT_PENDING_SECS: u64 = 1;

const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(5);

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Telegram Bot API account.
pub struct TelegramClient {
    account_id: String,
    bot_token: SecretString,
    api_base: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

impl TelegramClient {
    pub fn new(bot_token: SecretString) -> Self {
        let account_id = account_id_from_token(bot_token.expose_secret());
        Self {
            account_id,
            bot_token,
            api_base: DEFAULT_API_BASE.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Point the client at a self-hosted Bot API server.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.api_base,
            self.bot_token.expose_secret()
        )
    }

    /// Call a Bot API method and map failures onto [`PlatformError`].
    ///
    /// `chat` and `topic_id` only feed error classification.
    async fn call(
        &self,
        method: &str,
        body: &Value,
        chat: &str,
        topic_id: Option<i64>,
    ) -> Result<Value, PlatformError> {
        let resp = self
            .client
            .post(self.api_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| PlatformError::Http(e.without_url().to_string()))?;

        let status = resp.status();
        let parsed: ApiResponse = resp
            .json()
            .await
            .map_err(|e| PlatformError::Other(format!("{method} returned {status}: {e}")))?;

        if parsed.ok {
            return Ok(parsed.result.unwrap_or(Value::Null));
        }

        let code = parsed
            .error_code
            .unwrap_or_else(|| i64::from(status.as_u16()));
        let description = parsed.description.unwrap_or_default();
        let retry_after = parsed.parameters.and_then(|p| p.retry_after);
        Err(classify_api_error(chat, topic_id, code, &description, retry_after))
    }

    async fn send_text(
        &self,
        chat_id: i64,
        topic_id: Option<i64>,
        text: &str,
    ) -> Result<(), PlatformError> {
        for chunk in split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH) {
            let mut body = json!({ "chat_id": chat_id, "text": chunk });
            set_topic(&mut body, topic_id);
            self.call("sendMessage", &body, &chat_id.to_string(), topic_id)
                .await?;
        }
        Ok(())
    }

    async fn relay(&self, request: &PendingSend) -> Result<(), PlatformError> {
        let chat = request.destination.to_string();
        let (method, mut body) = match request.source_message_ids.as_slice() {
            [single] => (
                "forwardMessage",
                json!({
                    "chat_id": request.destination,
                    "from_chat_id": request.source_chat,
                    "message_id": single,
                }),
            ),
            ids => (
                "forwardMessages",
                json!({
                    "chat_id": request.destination,
                    "from_chat_id": request.source_chat,
                    "message_ids": ids,
                }),
            ),
        };
        set_topic(&mut body, request.topic_id);
        self.call(method, &body, &chat, request.topic_id).await?;
        Ok(())
    }

    async fn republish(&self, request: &PendingSend) -> Result<(), PlatformError> {
        let chat = request.destination.to_string();
        let files: Vec<(&'static str, &str)> = request.media.iter().filter_map(input_file).collect();

        if files.is_empty() {
            return self
                .send_text(request.destination, request.topic_id, &request.text)
                .await;
        }

        let fits_caption = request.text.chars().count() <= TELEGRAM_MAX_CAPTION_LENGTH;
        let caption = if fits_caption { request.text.as_str() } else { "" };

        let groupable = files.iter().all(|(kind, _)| GROUPABLE_KINDS.contains(kind));
        if request.grouped && files.len() > 1 && groupable {
            let media: Vec<Value> = files
                .iter()
                .enumerate()
                .map(|(i, (kind, file_ref))| {
                    let mut item = json!({ "type": kind, "media": file_ref });
                    if i == 0 && !caption.is_empty() {
                        item["caption"] = Value::String(caption.to_string());
                    }
                    item
                })
                .collect();
            let mut body = json!({ "chat_id": request.destination, "media": media });
            set_topic(&mut body, request.topic_id);
            self.call("sendMediaGroup", &body, &chat, request.topic_id)
                .await?;
        } else {
            for (i, (kind, file_ref)) in files.iter().enumerate() {
                let mut body = json!({ "chat_id": request.destination });
                body[*kind] = json!(file_ref);
                if i == 0 && !caption.is_empty() {
                    body["caption"] = Value::String(caption.to_string());
                }
                set_topic(&mut body, request.topic_id);
                self.call(send_method(kind), &body, &chat, request.topic_id)
                    .await?;
            }
        }

        if !fits_caption {
            self.send_text(request.destination, request.topic_id, &request.text)
                .await?;
        }
        Ok(())
    }
}

/// `InputMedia` types accepted by `sendMediaGroup`.
const GROUPABLE_KINDS: [&str; 4] = ["photo", "video", "audio", "document"];

/// Bot API input kind and file id of a re-sendable attachment.
fn input_file(media: &Media) -> Option<(&'static str, &str)> {
    match media {
        Media::Photo { file_ref, .. } => Some(("photo", file_ref.as_str())),
        Media::Document {
            file_ref, file_kind, ..
        } => {
            let kind = match file_kind {
                FileKind::Document => "document",
                FileKind::Video => "video",
                FileKind::Audio => "audio",
                FileKind::Animation => "animation",
                FileKind::Voice => "voice",
            };
            Some((kind, file_ref.as_str()))
        }
        Media::WebPage { .. } | Media::None => None,
    }
}

fn send_method(kind: &str) -> &'static str {
    match kind {
        "photo" => "sendPhoto",
        "video" => "sendVideo",
        "audio" => "sendAudio",
        "animation" => "sendAnimation",
        "voice" => "sendVoice",
        _ => "sendDocument",
    }
}

fn set_topic(body: &mut Value, topic_id: Option<i64>) {
    if let Some(topic) = topic_id {
        body["message_thread_id"] = json!(topic);
    }
}

#[async_trait]
impl PlatformClient for TelegramClient {
    fn account_id(&self) -> &str {
        &self.account_id
    }

    async fn send(&self, request: &PendingSend, mode: ForwardMode) -> Result<(), PlatformError> {
        match mode {
            ForwardMode::Relay => self.relay(request).await,
            ForwardMode::Republish => self.republish(request).await,
        }
    }

    async fn resolve_chat(&self, chat: &ChatRef) -> Result<i64, PlatformError> {
        if let Some(id) = chat.as_numeric() {
            return Ok(id);
        }

        let name = chat.to_string();
        let handle = if name.starts_with('@') {
            name.clone()
        } else {
            format!("@{name}")
        };
        let result = self
            .call("getChat", &json!({ "chat_id": handle }), &name, None)
            .await?;
        result
            .get("id")
            .and_then(Value::as_i64)
            .ok_or_else(|| PlatformError::InvalidTarget {
                chat: name,
                reason: "getChat returned no id".into(),
            })
    }

    async fn fetch_history(
        &self,
        _chat_id: i64,
        _after_id: i64,
        _limit: usize,
    ) -> Result<Vec<InboundMessage>, PlatformError> {
        Err(PlatformError::Unsupported(
            "the Bot API cannot read channel history".into(),
        ))
    }
}

// ── Inbound updates ─────────────────────────────────────────────────

#[async_trait]
impl InboundFeed for TelegramClient {
    async fn start(&self) -> Result<UnitStream, PlatformError> {
        info!(account = %self.account_id, "Telegram feed listening for channel posts");

        let feed = UpdateFeed {
            client: self.client.clone(),
            url: self.api_url("getUpdates"),
            account: self.account_id.clone(),
            seen_through: None,
            albums: AlbumAssembler::default(),
            held: Vec::new(),
            ready: VecDeque::new(),
        };
        let stream = futures::stream::unfold(feed, |mut feed| async move {
            let unit = feed.next_unit().await;
            Some((unit, feed))
        });

        Ok(Box::pin(stream))
    }
}

/// Pull-driven `getUpdates` reader.
///
/// Telegram drops every update below the `offset` sent with a poll, so
/// the offset only moves past updates whose units have all been handed
/// out. Polling happens only when the consumer asks for the next unit,
/// which means every earlier unit has been dispatched. Album parts still
/// buffered hold the offset back and are redelivered after a restart.
struct UpdateFeed {
    client: reqwest::Client,
    url: String,
    account: String,
    /// Highest update id parsed so far.
    seen_through: Option<i64>,
    albums: AlbumAssembler,
    /// `(grouped id, update id)` of album parts not yet emitted.
    held: Vec<(String, i64)>,
    ready: VecDeque<DispatchUnit>,
}

impl UpdateFeed {
    async fn next_unit(&mut self) -> DispatchUnit {
        loop {
            if let Some(unit) = self.ready.pop_front() {
                return unit;
            }
            self.poll_once().await;
        }
    }

    /// First update id that has not been fully handed out.
    fn ack_offset(&self) -> i64 {
        self.held
            .iter()
            .map(|(_, update_id)| *update_id)
            .min()
            .or(self.seen_through.map(|id| id + 1))
            .unwrap_or(0)
    }

    async fn poll_once(&mut self) {
        let timeout = if self.albums.has_pending() {
            POLL_TIMEOUT_PENDING_SECS
        } else {
            POLL_TIMEOUT_SECS
        };
        let body = json!({
            "offset": self.ack_offset(),
            "timeout": timeout,
            "allowed_updates": ["channel_post"]
        });

        match poll_updates(&self.client, &self.url, &body).await {
            Ok(updates) => {
                for update in &updates {
                    self.accept(update);
                }
            }
            Err(e) => {
                warn!(account = %self.account, "Telegram poll error: {e}");
                tokio::time::sleep(POLL_ERROR_BACKOFF).await;
            }
        }

        let due = self.albums.flush_due(Utc::now());
        self.emit(due);
    }

    fn accept(&mut self, update: &Value) {
        let Some(update_id) = update.get("update_id").and_then(Value::as_i64) else {
            return;
        };
        // Redelivered while an album held the offset back.
        if self.seen_through.is_some_and(|seen| update_id <= seen) {
            return;
        }
        self.seen_through = Some(update_id);

        let Some(post) = update.get("channel_post") else {
            return;
        };
        let Some(message) = parse_channel_post(post) else {
            debug!(update_id, "Skipping channel post without chat or id");
            return;
        };
        if let Some(group) = &message.grouped_id {
            self.held.push((group.clone(), update_id));
        }
        let ready = self.albums.push(message, Utc::now());
        self.emit(ready);
    }

    fn emit(&mut self, units: Vec<DispatchUnit>) {
        for unit in units {
            if let Some(group) = unit.messages().first().and_then(|m| m.grouped_id.as_deref()) {
                self.held.retain(|(held, _)| held != group);
            }
            self.ready.push_back(unit);
        }
    }
}

async fn poll_updates(
    client: &reqwest::Client,
    url: &str,
    body: &Value,
) -> Result<Vec<Value>, PlatformError> {
    let resp = client
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(|e| PlatformError::Http(e.without_url().to_string()))?;
    let data: ApiResponse = resp
        .json()
        .await
        .map_err(|e| PlatformError::Other(e.to_string()))?;
    if !data.ok {
        return Err(PlatformError::Other(
            data.description.unwrap_or_else(|| "getUpdates failed".into()),
        ));
    }
    Ok(data
        .result
        .and_then(|r| r.as_array().cloned())
        .unwrap_or_default())
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Account id derived from the bot id part of a token (`<id>:<secret>`),
/// so logs never carry the secret.
fn account_id_from_token(token: &str) -> String {
    match token.split_once(':') {
        Some((id, _)) if !id.is_empty() => format!("bot{id}"),
        _ => "bot-unknown".to_string(),
    }
}

/// Map a Bot API error onto the relay's error taxonomy.
fn classify_api_error(
    chat: &str,
    topic_id: Option<i64>,
    code: i64,
    description: &str,
    retry_after: Option<u64>,
) -> PlatformError {
    let lower = description.to_lowercase();
    let chat = chat.to_string();
    let reason = description.to_string();

    match code {
        429 => PlatformError::RateLimited {
            wait: Duration::from_secs(retry_after.unwrap_or(5)),
        },
        401 => PlatformError::Unauthorized(reason),
        403 if lower.contains("kicked") || lower.contains("banned") => {
            PlatformError::Banned { chat, reason }
        }
        403 => PlatformError::Forbidden { chat, reason },
        400 if topic_id.is_some() && (lower.contains("thread") || lower.contains("topic")) => {
            PlatformError::ThreadIncompatible {
                chat,
                topic_id: topic_id.unwrap_or_default(),
                reason,
            }
        }
        400 if lower.contains("chat not found")
            || lower.contains("peer_id_invalid")
            || lower.contains("chat_id is empty") =>
        {
            PlatformError::InvalidTarget { chat, reason }
        }
        400 if lower.contains("not enough rights") || lower.contains("chat_write_forbidden") => {
            PlatformError::Forbidden { chat, reason }
        }
        _ => PlatformError::Other(format!("{code}: {description}")),
    }
}

/// Convert a Bot API `Message` object from a channel post.
fn parse_channel_post(post: &Value) -> Option<InboundMessage> {
    let chat_id = post.get("chat")?.get("id")?.as_i64()?;
    let id = post.get("message_id")?.as_i64()?;
    let date = post
        .get("date")
        .and_then(Value::as_i64)
        .and_then(|ts| DateTime::from_timestamp(ts, 0))
        .unwrap_or_else(Utc::now);

    let text = post
        .get("text")
        .or_else(|| post.get("caption"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let grouped_id = post
        .get("media_group_id")
        .and_then(Value::as_str)
        .map(String::from);

    Some(InboundMessage {
        chat_id,
        id,
        text,
        media: parse_media(post),
        grouped_id,
        date,
    })
}

fn parse_media(post: &Value) -> Media {
    let str_field = |v: &Value, key: &str| v.get(key).and_then(Value::as_str).map(String::from);

    // Photo sizes are ascending; the last one is the original.
    if let Some(photo) = post
        .get("photo")
        .and_then(Value::as_array)
        .and_then(|sizes| sizes.last())
    {
        if let (Some(id), Some(file_ref)) = (
            str_field(photo, "file_unique_id"),
            str_field(photo, "file_id"),
        ) {
            return Media::Photo {
                id,
                size: photo.get("file_size").and_then(Value::as_u64),
                file_ref,
            };
        }
    }

    // Animations also carry a `document` field, so it is checked last.
    let kinds = [
        ("animation", FileKind::Animation),
        ("video", FileKind::Video),
        ("audio", FileKind::Audio),
        ("voice", FileKind::Voice),
        ("document", FileKind::Document),
    ];
    for (key, file_kind) in kinds {
        let Some(doc) = post.get(key) else {
            continue;
        };
        if let (Some(id), Some(file_ref)) =
            (str_field(doc, "file_unique_id"), str_field(doc, "file_id"))
        {
            return Media::Document {
                id,
                size: doc.get("file_size").and_then(Value::as_u64).unwrap_or(0),
                mime_type: str_field(doc, "mime_type"),
                file_name: str_field(doc, "file_name"),
                file_ref,
                file_kind,
            };
        }
    }

    if let Some(url) = post
        .get("link_preview_options")
        .and_then(|o| o.get("url"))
        .and_then(Value::as_str)
    {
        return Media::WebPage { url: url.to_string() };
    }

    Media::None
}

/// Split a message into chunks that fit Telegram's character limit.
/// Tries to split on newlines, then spaces, then hard-cuts on a char
/// boundary.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let mut boundary = max_len;
        while boundary > 0 && !remaining.is_char_boundary(boundary) {
            boundary -= 1;
        }
        let chunk = &remaining[..boundary];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .unwrap_or(boundary);

        // Don't split at position 0 (infinite loop guard)
        let split_at = if split_at == 0 { boundary } else { split_at };

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

// ── Tests ───────────────────────────────────────────────────────────
