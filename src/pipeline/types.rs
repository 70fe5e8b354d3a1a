//! Shared types for the dispatch pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ── Inbound message ─────────────────────────────────────────────────

/// Attached media, distinguished by kind.
///
/// `id` is the platform's stable identity for the file (used for dedup).
/// `file_ref` is the handle a client needs to re-send the file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Media {
    #[default]
    None,
    Photo {
        id: String,
        size: Option<u64>,
        file_ref: String,
    },
    Document {
        id: String,
        size: u64,
        mime_type: Option<String>,
        file_name: Option<String>,
        file_ref: String,
        #[serde(default)]
        file_kind: FileKind,
    },
    WebPage {
        url: String,
    },
}

/// How a platform presents a non-photo file. Republishing must send it
/// back as the same kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    #[default]
    Document,
    Video,
    Audio,
    Animation,
    Voice,
}

impl Media {
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Filename of an attached document, if any.
    pub fn file_name(&self) -> Option<&str> {
        match self {
            Self::Document { file_name, .. } => file_name.as_deref(),
            _ => None,
        }
    }

    /// Mime type of the attachment, if known. Photos are always JPEG.
    pub fn mime_type(&self) -> Option<&str> {
        match self {
            Self::Photo { .. } => Some("image/jpeg"),
            Self::Document { mime_type, .. } => mime_type.as_deref(),
            _ => None,
        }
    }
}

/// A message observed in a monitored source chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Numeric id of the source chat.
    pub chat_id: i64,
    /// Platform message id, increasing within one chat.
    pub id: i64,
    /// Text or media caption (empty when absent).
    pub text: String,
    pub media: Media,
    /// Album identifier shared by messages published together.
    pub grouped_id: Option<String>,
    pub date: DateTime<Utc>,
}

impl InboundMessage {
    pub fn text(chat_id: i64, id: i64, text: impl Into<String>) -> Self {
        Self {
            chat_id,
            id,
            text: text.into(),
            media: Media::None,
            grouped_id: None,
            date: Utc::now(),
        }
    }

    pub fn with_media(mut self, media: Media) -> Self {
        self.media = media;
        self
    }

    pub fn with_grouped_id(mut self, grouped_id: impl Into<String>) -> Self {
        self.grouped_id = Some(grouped_id.into());
        self
    }
}

// ── Dispatch unit ───────────────────────────────────────────────────

/// One logical unit of work: a single message or a whole album.
///
/// Never empty; all members share one chat.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchUnit {
    messages: Vec<InboundMessage>,
}

impl DispatchUnit {
    pub fn single(message: InboundMessage) -> Self {
        Self {
            messages: vec![message],
        }
    }

    /// Build an album unit. Returns `None` for an empty list.
    pub fn album(mut messages: Vec<InboundMessage>) -> Option<Self> {
        if messages.is_empty() {
            return None;
        }
        messages.sort_by_key(|m| m.id);
        Some(Self { messages })
    }

    pub fn messages(&self) -> &[InboundMessage] {
        &self.messages
    }

    pub fn chat_id(&self) -> i64 {
        self.messages[0].chat_id
    }

    pub fn is_grouped(&self) -> bool {
        self.messages.len() > 1
    }

    /// The sub-message whose content drives filter/dedup/route decisions:
    /// the first one with text, else the first one.
    pub fn representative(&self) -> &InboundMessage {
        self.messages
            .iter()
            .find(|m| !m.text.trim().is_empty())
            .unwrap_or(&self.messages[0])
    }

    /// Highest message id in the unit (the progress mark after handling it).
    pub fn last_id(&self) -> i64 {
        self.messages.iter().map(|m| m.id).max().unwrap_or_default()
    }

    pub fn message_ids(&self) -> Vec<i64> {
        self.messages.iter().map(|m| m.id).collect()
    }

    pub fn media(&self) -> Vec<Media> {
        self.messages
            .iter()
            .filter(|m| !m.media.is_none())
            .map(|m| m.media.clone())
            .collect()
    }
}

// ── Fingerprint ─────────────────────────────────────────────────────

/// Default minimum text length (in characters) before text is hashed.
pub const DEFAULT_TEXT_HASH_MIN_LEN: usize = 50;

/// Dedup key derived from a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Derive the key: photo id, else document id + size, else a hash of
    /// long-enough text, else the message's own chat/id pair.
    pub fn of(message: &InboundMessage, text_min_len: usize) -> Self {
        match &message.media {
            Media::Photo { id, .. } => return Self(format!("photo:{id}")),
            Media::Document { id, size, .. } => return Self(format!("doc:{id}:{size}")),
            Media::WebPage { .. } | Media::None => {}
        }

        if message.text.chars().count() > text_min_len {
            let digest = Sha256::digest(message.text.as_bytes());
            return Self(format!("text:{}", hex::encode(digest)));
        }

        Self(format!("id:{}:{}", message.chat_id, message.id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Sending ─────────────────────────────────────────────────────────

/// How content reaches the destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardMode {
    /// Forward the original message(s), keeping attribution.
    #[default]
    Relay,
    /// Post new content built from the transformed text and copied media.
    Republish,
}

impl FromStr for ForwardMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "relay" | "forward" => Ok(Self::Relay),
            "republish" | "copy" => Ok(Self::Republish),
            other => Err(format!("unknown forward mode '{other}' (expected relay or republish)")),
        }
    }
}

impl fmt::Display for ForwardMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Relay => f.write_str("relay"),
            Self::Republish => f.write_str("republish"),
        }
    }
}

/// Everything needed for one send attempt. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingSend {
    pub destination: i64,
    pub topic_id: Option<i64>,
    /// Transformed text.
    pub text: String,
    pub media: Vec<Media>,
    pub grouped: bool,
    pub source_chat: i64,
    pub source_message_ids: Vec<i64>,
}

impl PendingSend {
    pub fn from_unit(unit: &DispatchUnit, destination: i64, topic_id: Option<i64>, text: String) -> Self {
        Self {
            destination,
            topic_id,
            text,
            media: unit.media(),
            grouped: unit.is_grouped(),
            source_chat: unit.chat_id(),
            source_message_ids: unit.message_ids(),
        }
    }

    /// Same send without the sub-thread.
    pub fn without_topic(&self) -> Self {
        Self {
            topic_id: None,
            ..self.clone()
        }
    }
}

// ── Outcome ─────────────────────────────────────────────────────────

/// Terminal state reached by one dispatch unit.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Chat is not a configured source, or the unit was already handled.
    Ignored { reason: String },
    /// Rejected by the filter chain.
    Filtered { reason: String },
    /// Fingerprint already recorded.
    Duplicate { fingerprint: Fingerprint },
    /// Delivered and recorded.
    Sent {
        destination: i64,
        topic_id: Option<i64>,
        account: String,
    },
    /// Routing or sending failed; progress still advanced.
    Failed { error: String },
}

impl DispatchOutcome {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ignored { .. } => "ignored",
            Self::Filtered { .. } => "filtered",
            Self::Duplicate { .. } => "duplicate",
            Self::Sent { .. } => "sent",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Dispatch result published to the event feed.
#[derive(Debug, Clone)]
pub struct DispatchEvent {
    pub source_chat: i64,
    pub message_id: i64,
    pub outcome: DispatchOutcome,
    pub at: DateTime<Utc>,
}
