use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::services::credits::{CreditError, CreditLedger};

/// Ledger over the `user_credits` balance table.
#[derive(Clone)]
pub struct PgCreditLedger {
    pool: PgPool,
}

impl PgCreditLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CreditLedger for PgCreditLedger {
    async fn charge(&self, owner: Uuid, amount: i64) -> Result<(), CreditError> {
        let result = sqlx::query(
            r#"
            UPDATE user_credits
            SET balance = balance - $2, updated_at = NOW()
            WHERE owner_id = $1 AND balance >= $2
            "#,
        )
        .bind(owner)
        .bind(amount)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let available = self.balance(owner).await?;
            return Err(CreditError::InsufficientCredits {
                required: amount,
                available,
            });
        }
        Ok(())
    }

    async fn refund(&self, owner: Uuid, amount: i64, job_id: Uuid) -> Result<bool, CreditError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO credit_refunds (job_id, owner_id, amount)
            VALUES ($1, $2, $3)
            ON CONFLICT (job_id) DO NOTHING
            "#,
        )
        .bind(job_id)
        .bind(owner)
        .bind(amount)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO user_credits (owner_id, balance)
            VALUES ($1, $2)
            ON CONFLICT (owner_id)
            DO UPDATE SET balance = user_credits.balance + EXCLUDED.balance, updated_at = NOW()
            "#,
        )
        .bind(owner)
        .bind(amount)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn balance(&self, owner: Uuid) -> Result<i64, CreditError> {
        let balance: Option<i64> =
            sqlx::query_scalar("SELECT balance FROM user_credits WHERE owner_id = $1")
                .bind(owner)
                .fetch_optional(&self.pool)
                .await?;
        Ok(balance.unwrap_or(0))
    }
}
