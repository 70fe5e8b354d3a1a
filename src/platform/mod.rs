//! Platform client abstraction.
//!
//! The dispatch core never speaks the platform protocol itself. A client
//! is one authenticated account that can send, resolve chat references,
//! and (optionally) read channel history. Inbound updates arrive through
//! [`InboundFeed`].

pub mod album;
pub mod telegram;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::PlatformError;
use crate::pipeline::types::{DispatchUnit, ForwardMode, InboundMessage, PendingSend};
use crate::rules::ChatRef;

pub use telegram::TelegramClient;

/// Stream of inbound dispatch units (single messages or assembled albums).
pub type UnitStream = Pin<Box<dyn Stream<Item = DispatchUnit> + Send>>;

/// One authenticated account.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Stable account identifier for logs and cooldown bookkeeping.
    fn account_id(&self) -> &str;

    /// Deliver one pending send in the given mode.
    async fn send(&self, request: &PendingSend, mode: ForwardMode) -> Result<(), PlatformError>;

    /// Resolve an operator-supplied chat reference to a numeric id.
    async fn resolve_chat(&self, chat: &ChatRef) -> Result<i64, PlatformError>;

    /// Messages of `chat_id` with id strictly greater than `after_id`,
    /// ascending, at most `limit`.
    async fn fetch_history(
        &self,
        chat_id: i64,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<InboundMessage>, PlatformError>;
}

/// Source of live inbound updates.
#[async_trait]
pub trait InboundFeed: Send + Sync {
    async fn start(&self) -> Result<UnitStream, PlatformError>;
}
