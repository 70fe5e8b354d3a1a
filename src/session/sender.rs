//! Bounded send: one account, one attempt, plus a single retry without the
//! sub-thread when the destination rejects it.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{PipelineError, PlatformError};
use crate::pipeline::types::{ForwardMode, PendingSend};
use crate::session::pool::SessionPool;

/// What a successful send actually did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub account: String,
    /// `None` when the sub-thread was dropped on retry.
    pub topic_id: Option<i64>,
}

pub struct SendEngine {
    pool: Arc<SessionPool>,
}

impl SendEngine {
    pub fn new(pool: Arc<SessionPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    /// Deliver `pending` through one pooled account.
    ///
    /// Failures are reported to the pool and returned; nothing is retried
    /// beyond the sub-thread fallback.
    pub async fn send(&self, pending: &PendingSend, mode: ForwardMode) -> Result<Delivery, PipelineError> {
        let client = self.pool.acquire_for(pending.destination).await?;
        let account = client.account_id().to_string();

        let mut topic_id = pending.topic_id;
        let result = match client.send(pending, mode).await {
            Err(PlatformError::ThreadIncompatible { topic_id: rejected, reason, .. })
                if pending.topic_id.is_some() =>
            {
                warn!(
                    account = %account,
                    destination = pending.destination,
                    topic_id = rejected,
                    reason = %reason,
                    "Destination rejected sub-thread, retrying without it"
                );
                topic_id = None;
                client.send(&pending.without_topic(), mode).await
            }
            other => other,
        };

        match result {
            Ok(()) => {
                info!(
                    account = %account,
                    destination = pending.destination,
                    messages = pending.source_message_ids.len(),
                    mode = %mode,
                    "Sent"
                );
                Ok(Delivery { account, topic_id })
            }
            Err(err) => {
                self.pool
                    .report_failure(&account, pending.destination, &err)
                    .await;
                Err(PipelineError::SendFailed {
                    destination: pending.destination,
                    source: err,
                })
            }
        }
    }
}
