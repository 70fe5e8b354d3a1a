//! Album assembly for platforms that deliver grouped media one part at a
//! time.
//!
//! Parts sharing a grouped id are held until the group has been quiet for
//! the settle window, or until the same chat publishes something else.
//! Flushing on the next message from the same chat keeps per-source order.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::pipeline::types::{DispatchUnit, InboundMessage};

/// Default quiet period before a pending album is considered complete.
pub const DEFAULT_ALBUM_SETTLE: Duration = Duration::from_millis(1500);

#[derive(Debug)]
struct PendingAlbum {
    chat_id: i64,
    grouped_id: String,
    messages: Vec<InboundMessage>,
    last_seen: DateTime<Utc>,
}

impl PendingAlbum {
    fn into_unit(self) -> Option<DispatchUnit> {
        DispatchUnit::album(self.messages)
    }
}

#[derive(Debug)]
pub struct AlbumAssembler {
    pending: Vec<PendingAlbum>,
    settle: chrono::Duration,
}

impl AlbumAssembler {
    pub fn new(settle: Duration) -> Self {
        Self {
            pending: Vec::new(),
            settle: chrono::Duration::from_std(settle).unwrap_or(chrono::Duration::seconds(1)),
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Feed one message. Returns the units that became ready, in order.
    pub fn push(&mut self, message: InboundMessage, now: DateTime<Utc>) -> Vec<DispatchUnit> {
        let mut ready = Vec::new();

        // Anything else pending for this chat is complete now.
        let mut i = 0;
        while i < self.pending.len() {
            let p = &self.pending[i];
            let same_group = message.grouped_id.as_deref() == Some(p.grouped_id.as_str());
            if p.chat_id == message.chat_id && !same_group {
                ready.extend(self.pending.remove(i).into_unit());
            } else {
                i += 1;
            }
        }

        match message.grouped_id.clone() {
            None => ready.push(DispatchUnit::single(message)),
            Some(grouped_id) => {
                if let Some(p) = self
                    .pending
                    .iter_mut()
                    .find(|p| p.chat_id == message.chat_id && p.grouped_id == grouped_id)
                {
                    p.messages.push(message);
                    p.last_seen = now;
                } else {
                    self.pending.push(PendingAlbum {
                        chat_id: message.chat_id,
                        grouped_id,
                        messages: vec![message],
                        last_seen: now,
                    });
                }
            }
        }

        ready
    }

    /// Emit albums that have been quiet for the settle window.
    pub fn flush_due(&mut self, now: DateTime<Utc>) -> Vec<DispatchUnit> {
        let settle = self.settle;
        let (due, keep): (Vec<_>, Vec<_>) = self
            .pending
            .drain(..)
            .partition(|p| now - p.last_seen >= settle);
        self.pending = keep;
        due.into_iter().filter_map(PendingAlbum::into_unit).collect()
    }
}

impl Default for AlbumAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_ALBUM_SETTLE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(chat: i64, id: i64, group: &str) -> InboundMessage {
        InboundMessage::text(chat, id, "").with_grouped_id(group)
    }

    #[test]
    fn single_message_passes_through() {
        let mut asm = AlbumAssembler::default();
        let out = asm.push(InboundMessage::text(-1, 1, "hi"), Utc::now());
        assert_eq!(out.len(), 1);
        assert!(!asm.has_pending());
    }

    #[test]
    fn album_waits_for_settle_window() {
        let mut asm = AlbumAssembler::new(Duration::from_secs(2));
        let t0 = Utc::now();
        assert!(asm.push(part(-1, 10, "g"), t0).is_empty());
        assert!(asm.push(part(-1, 11, "g"), t0).is_empty());

        assert!(asm.flush_due(t0 + chrono::Duration::seconds(1)).is_empty());
        let out = asm.flush_due(t0 + chrono::Duration::seconds(2));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].message_ids(), vec![10, 11]);
    }

    #[test]
    fn next_message_in_same_chat_flushes_album_first() {
        let mut asm = AlbumAssembler::default();
        let now = Utc::now();
        asm.push(part(-1, 10, "g"), now);
        asm.push(part(-1, 11, "g"), now);
        let out = asm.push(InboundMessage::text(-1, 12, "after"), now);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].message_ids(), vec![10, 11]);
        assert_eq!(out[1].message_ids(), vec![12]);
    }

    #[test]
    fn other_chat_does_not_flush() {
        let mut asm = AlbumAssembler::default();
        let now = Utc::now();
        asm.push(part(-1, 10, "g"), now);
        let out = asm.push(InboundMessage::text(-2, 5, "elsewhere"), now);
        assert_eq!(out.len(), 1);
        assert!(asm.has_pending());
        assert_eq!(asm.flush_due(now + chrono::Duration::seconds(2)).len(), 1);
    }

    #[test]
    fn new_group_flushes_previous_group() {
        let mut asm = AlbumAssembler::default();
        let now = Utc::now();
        asm.push(part(-1, 10, "a"), now);
        let out = asm.push(part(-1, 11, "b"), now);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].message_ids(), vec![10]);
    }
}
