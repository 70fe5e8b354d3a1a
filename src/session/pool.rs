//! Rotating account pool with per-account rate-limit cooldowns.
//!
//! Accounts are handed out round-robin starting after the last one
//! returned. A rate-limited account sits out until its cooldown ends. A
//! permission failure bars one (account, destination) pair for the life of
//! the pool. Rejected credentials retire the account entirely.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::{FailureClass, PlatformError, SessionError};
use crate::platform::PlatformClient;

/// Extra wait added on top of the server-reported rate-limit delay.
pub const DEFAULT_RATE_LIMIT_BUFFER: Duration = Duration::from_secs(5);

/// Floor for the all-accounts-cooling wait.
const MIN_POOL_WAIT: Duration = Duration::from_secs(1);

struct AccountSlot {
    client: Arc<dyn PlatformClient>,
    alive: bool,
    retry_at: DateTime<Utc>,
    /// Destinations this account may not post to.
    barred: BTreeSet<i64>,
}

impl AccountSlot {
    fn id(&self) -> &str {
        self.client.account_id()
    }

    fn serves(&self, destination: Option<i64>) -> bool {
        self.alive && destination.is_none_or(|d| !self.barred.contains(&d))
    }
}

struct PoolState {
    accounts: Vec<AccountSlot>,
    /// Index where the next scan starts.
    next: usize,
}

enum Scan {
    Ready(Arc<dyn PlatformClient>),
    Wait(Duration),
}

/// Point-in-time view of one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountStatus {
    pub id: String,
    pub alive: bool,
    /// Set while the account is rate limited.
    pub cooling_until: Option<DateTime<Utc>>,
    pub barred_destinations: Vec<i64>,
}

pub struct SessionPool {
    state: Mutex<PoolState>,
    clock: Arc<dyn Clock>,
    rate_limit_buffer: Duration,
}

impl SessionPool {
    pub fn new(
        clients: Vec<Arc<dyn PlatformClient>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SessionError> {
        if clients.is_empty() {
            return Err(SessionError::Empty);
        }
        let now = clock.now();
        let accounts = clients
            .into_iter()
            .map(|client| AccountSlot {
                client,
                alive: true,
                retry_at: now,
                barred: BTreeSet::new(),
            })
            .collect();

        Ok(Self {
            state: Mutex::new(PoolState { accounts, next: 0 }),
            clock,
            rate_limit_buffer: DEFAULT_RATE_LIMIT_BUFFER,
        })
    }

    pub fn with_rate_limit_buffer(mut self, buffer: Duration) -> Self {
        self.rate_limit_buffer = buffer;
        self
    }

    /// Any client, for lookups that are not tied to a destination.
    pub async fn any_client(&self) -> Result<Arc<dyn PlatformClient>, SessionError> {
        let state = self.state.lock().await;
        state
            .accounts
            .iter()
            .find(|a| a.alive)
            .map(|a| Arc::clone(&a.client))
            .ok_or(SessionError::NoLiveAccounts)
    }

    /// Next usable account in rotation order, waiting out cooldowns.
    pub async fn acquire(&self) -> Result<Arc<dyn PlatformClient>, SessionError> {
        self.acquire_inner(None).await
    }

    /// Like [`acquire`](Self::acquire), skipping accounts barred from
    /// `destination`.
    pub async fn acquire_for(
        &self,
        destination: i64,
    ) -> Result<Arc<dyn PlatformClient>, SessionError> {
        self.acquire_inner(Some(destination)).await
    }

    async fn acquire_inner(
        &self,
        destination: Option<i64>,
    ) -> Result<Arc<dyn PlatformClient>, SessionError> {
        loop {
            match self.scan(destination).await? {
                Scan::Ready(client) => return Ok(client),
                Scan::Wait(wait) => {
                    warn!(
                        wait_secs = wait.as_secs_f64(),
                        destination, "All eligible accounts are cooling down, waiting"
                    );
                    self.clock.sleep(wait).await;
                }
            }
        }
    }

    async fn scan(&self, destination: Option<i64>) -> Result<Scan, SessionError> {
        let mut state = self.state.lock().await;

        if !state.accounts.iter().any(|a| a.alive) {
            return Err(SessionError::NoLiveAccounts);
        }
        if let Some(d) = destination {
            if !state.accounts.iter().any(|a| a.serves(destination)) {
                return Err(SessionError::NoAccountForDestination { destination: d });
            }
        }

        let now = self.clock.now();
        let count = state.accounts.len();
        for step in 0..count {
            let idx = (state.next + step) % count;
            let slot = &state.accounts[idx];
            if slot.serves(destination) && now >= slot.retry_at {
                let client = Arc::clone(&slot.client);
                state.next = (idx + 1) % count;
                debug!(account = %client.account_id(), "Account acquired");
                return Ok(Scan::Ready(client));
            }
        }

        let earliest = state
            .accounts
            .iter()
            .filter(|a| a.serves(destination))
            .map(|a| a.retry_at)
            .min()
            .unwrap_or(now);
        let remaining = (earliest - now).to_std().unwrap_or(Duration::ZERO);
        Ok(Scan::Wait((remaining + MIN_POOL_WAIT).max(MIN_POOL_WAIT)))
    }

    /// Record a failed send by `account` to `destination`.
    pub async fn report_failure(&self, account: &str, destination: i64, err: &PlatformError) {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        let Some(slot) = state.accounts.iter_mut().find(|a| a.id() == account) else {
            warn!(account, "Failure reported for unknown account");
            return;
        };

        match (err.class(), err) {
            (FailureClass::RateLimit, PlatformError::RateLimited { wait }) => {
                let cooldown = *wait + self.rate_limit_buffer;
                slot.retry_at = chrono::Duration::from_std(cooldown)
                    .ok()
                    .and_then(|d| now.checked_add_signed(d))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                warn!(
                    account,
                    wait_secs = wait.as_secs(),
                    retry_at = %slot.retry_at,
                    "Account rate limited"
                );

                let live = state.accounts.iter().filter(|a| a.alive);
                let all_limited = live.clone().all(|a| a.retry_at > now);
                if all_limited {
                    warn!(
                        accounts = live.count(),
                        "Every live account is rate limited"
                    );
                }
            }
            (FailureClass::Permission, _) => {
                slot.barred.insert(destination);
                error!(
                    account,
                    destination,
                    error = %err,
                    "Account cannot post to destination, barring pair"
                );
            }
            (FailureClass::Unauthorized, _) => {
                slot.alive = false;
                error!(account, error = %err, "Account credentials rejected, retiring account");
                let live = state.accounts.iter().filter(|a| a.alive).count();
                info!(live, "Live accounts remaining");
            }
            (class, _) => {
                warn!(
                    account,
                    destination,
                    class = class.label(),
                    error = %err,
                    "Platform call failed"
                );
            }
        }
    }

    pub async fn status(&self) -> Vec<AccountStatus> {
        let state = self.state.lock().await;
        let now = self.clock.now();
        state
            .accounts
            .iter()
            .map(|a| AccountStatus {
                id: a.id().to_string(),
                alive: a.alive,
                cooling_until: (a.retry_at > now).then_some(a.retry_at),
                barred_destinations: a.barred.iter().copied().collect(),
            })
            .collect()
    }
}
