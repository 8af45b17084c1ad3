use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::db::store::{JobStore, StoreError};
use crate::models::job::{GenerationParams, JobStatus, VideoJob};

const JOB_COLUMNS: &str = r#"
    id, owner_id, template_id, prompt, params, status, progress_percent,
    provider_name, provider_job_id, result_url, result_thumbnail_url,
    duration_seconds, error_message, credits_charged, credits_refunded,
    claimed_by, claim_expires_at, version, created_at, started_at,
    completed_at, updated_at
"#;

/// PostgreSQL-backed job store.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, job: &VideoJob) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO video_jobs (
                id, owner_id, template_id, prompt, params, status, progress_percent,
                credits_charged, credits_refunded, version, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(job.id)
        .bind(job.owner_id)
        .bind(job.template_id)
        .bind(&job.prompt)
        .bind(Json(&job.params))
        .bind(job.status.as_ref())
        .bind(i16::from(job.progress_percent))
        .bind(job.credits_charged)
        .bind(job.credits_refunded)
        .bind(job.version)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Duplicate(job.id));
        }
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<VideoJob, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM video_jobs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => job_from_row(&row),
            None => Err(StoreError::NotFound(id)),
        }
    }

    async fn update(&self, job: &VideoJob) -> Result<VideoJob, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE video_jobs
            SET status = $1,
                progress_percent = $2,
                provider_name = $3,
                provider_job_id = $4,
                result_url = $5,
                result_thumbnail_url = $6,
                duration_seconds = $7,
                error_message = $8,
                credits_refunded = $9,
                claimed_by = $10,
                claim_expires_at = $11,
                started_at = $12,
                completed_at = $13,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $14 AND version = $15
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job.status.as_ref())
        .bind(i16::from(job.progress_percent))
        .bind(&job.provider_name)
        .bind(&job.provider_job_id)
        .bind(&job.result_url)
        .bind(&job.result_thumbnail_url)
        .bind(job.duration_seconds.map(|d| d as i32))
        .bind(&job.error_message)
        .bind(job.credits_refunded)
        .bind(&job.claimed_by)
        .bind(job.claim_expires_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.id)
        .bind(job.version)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return job_from_row(&row);
        }

        // Distinguish a lost race from a missing record.
        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM video_jobs WHERE id = $1)")
            .bind(job.id)
            .fetch_one(&self.pool)
            .await?;

        if exists {
            Err(StoreError::Conflict {
                job_id: job.id,
                expected: job.version,
            })
        } else {
            Err(StoreError::NotFound(job.id))
        }
    }

    async fn list_by_status(
        &self,
        status: Option<JobStatus>,
        owner: Option<Uuid>,
    ) -> Result<Vec<VideoJob>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM video_jobs
            WHERE ($1::text IS NULL OR status = $1) AND ($2::uuid IS NULL OR owner_id = $2)
            ORDER BY created_at ASC
            "#
        ))
        .bind(status.map(|s| s.as_ref().to_string()))
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn job_from_row(row: &PgRow) -> Result<VideoJob, StoreError> {
    let id: Uuid = row.try_get("id")?;
    let corrupt = |reason: String| StoreError::Corrupt { job_id: id, reason };

    let status_str: String = row.try_get("status")?;
    let status: JobStatus = status_str
        .parse()
        .map_err(|_| corrupt(format!("unknown status {status_str:?}")))?;

    let progress: i16 = row.try_get("progress_percent")?;
    let progress_percent =
        u8::try_from(progress).map_err(|_| corrupt(format!("progress {progress} out of range")))?;

    let duration: Option<i32> = row.try_get("duration_seconds")?;
    let duration_seconds = duration
        .map(u32::try_from)
        .transpose()
        .map_err(|_| corrupt("negative duration".to_string()))?;

    let Json(params): Json<GenerationParams> = row.try_get("params")?;

    Ok(VideoJob {
        id,
        owner_id: row.try_get("owner_id")?,
        template_id: row.try_get("template_id")?,
        prompt: row.try_get("prompt")?,
        params,
        status,
        progress_percent,
        provider_name: row.try_get("provider_name")?,
        provider_job_id: row.try_get("provider_job_id")?,
        result_url: row.try_get("result_url")?,
        result_thumbnail_url: row.try_get("result_thumbnail_url")?,
        duration_seconds,
        error_message: row.try_get("error_message")?,
        credits_charged: row.try_get("credits_charged")?,
        credits_refunded: row.try_get("credits_refunded")?,
        claimed_by: row.try_get("claimed_by")?,
        claim_expires_at: row.try_get("claim_expires_at")?,
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
