use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Credits charged per second of requested video.
pub const CREDITS_PER_SECOND: i64 = 1;

/// Price of a generation request.
pub fn price_for(duration_seconds: u32) -> i64 {
    (i64::from(duration_seconds) * CREDITS_PER_SECOND).max(1)
}

/// Credit balance owned outside the pipeline.
///
/// `refund` is keyed by job: a second refund for the same job is a no-op
/// that returns `Ok(false)`.
#[async_trait]
pub trait CreditLedger: Send + Sync {
    async fn charge(&self, owner: Uuid, amount: i64) -> Result<(), CreditError>;

    /// Returns whether credits were actually returned by this call.
    async fn refund(&self, owner: Uuid, amount: i64, job_id: Uuid) -> Result<bool, CreditError>;

    async fn balance(&self, owner: Uuid) -> Result<i64, CreditError>;
}

#[derive(Debug, thiserror::Error)]
pub enum CreditError {
    #[error("Insufficient credits: {required} required, {available} available")]
    InsufficientCredits { required: i64, available: i64 },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Default)]
struct LedgerState {
    balances: HashMap<Uuid, i64>,
    refunded_jobs: HashSet<Uuid>,
}

/// Process-local ledger for tests and development.
#[derive(Default)]
pub struct InMemoryCreditLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryCreditLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn deposit(&self, owner: Uuid, amount: i64) {
        *self.state.lock().await.balances.entry(owner).or_default() += amount;
    }

    pub async fn refund_count(&self) -> usize {
        self.state.lock().await.refunded_jobs.len()
    }
}

#[async_trait]
impl CreditLedger for InMemoryCreditLedger {
    async fn charge(&self, owner: Uuid, amount: i64) -> Result<(), CreditError> {
        let mut state = self.state.lock().await;
        let balance = state.balances.entry(owner).or_default();
        if *balance < amount {
            return Err(CreditError::InsufficientCredits {
                required: amount,
                available: *balance,
            });
        }
        *balance -= amount;
        Ok(())
    }

    async fn refund(&self, owner: Uuid, amount: i64, job_id: Uuid) -> Result<bool, CreditError> {
        let mut state = self.state.lock().await;
        if !state.refunded_jobs.insert(job_id) {
            return Ok(false);
        }
        *state.balances.entry(owner).or_default() += amount;
        Ok(true)
    }

    async fn balance(&self, owner: Uuid) -> Result<i64, CreditError> {
        Ok(self
            .state
            .lock()
            .await
            .balances
            .get(&owner)
            .copied()
            .unwrap_or(0))
    }
}
