use deadpool_postgres::PoolError;
use thiserror::Error;
use tokio_postgres::Error as PgError;
use tracing::{info, instrument};

use crate::db::{DbPoolError, PgPool};

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("failed to get postgres connection: {0}")]
    Pool(#[from] PoolError),
    #[error("failed to run migration: {0}")]
    Postgres(#[from] PgError),
    #[error("failed to build pool: {0}")]
    PoolBuild(#[from] DbPoolError),
}

struct Migration {
    id: i32,
    description: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        id: 1,
        description: "charts, documents and processing queue",
        sql: r#"
CREATE SCHEMA IF NOT EXISTS cc;

CREATE TABLE IF NOT EXISTS cc.charts (
    id BIGSERIAL PRIMARY KEY,
    session_id TEXT NOT NULL UNIQUE,
    chart_number TEXT NOT NULL UNIQUE,
    patient_name TEXT,
    facility TEXT,
    specialty TEXT,
    provider TEXT,
    encounter_date DATE,
    document_count INTEGER NOT NULL DEFAULT 0,
    ai_status TEXT NOT NULL DEFAULT 'queued'
        CHECK (ai_status IN ('queued', 'processing', 'ready', 'retry_pending', 'failed', 'submitted')),
    review_status TEXT NOT NULL DEFAULT 'pending'
        CHECK (review_status IN ('pending', 'in_review', 'submitted', 'rejected')),
    ai_codes JSONB,
    original_ai_codes JSONB,
    user_modifications JSONB,
    final_codes JSONB,
    sla JSONB,
    last_error TEXT,
    last_error_at TIMESTAMPTZ,
    retry_count INTEGER NOT NULL DEFAULT 0,
    processing_started_at TIMESTAMPTZ,
    processing_completed_at TIMESTAMPTZ,
    submitted_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_charts_ai_status ON cc.charts(ai_status);
CREATE INDEX IF NOT EXISTS idx_charts_review_status ON cc.charts(review_status);

CREATE TABLE IF NOT EXISTS cc.documents (
    id BIGSERIAL PRIMARY KEY,
    chart_id BIGINT NOT NULL REFERENCES cc.charts(id) ON DELETE CASCADE,
    file_name TEXT NOT NULL,
    mime_type TEXT NOT NULL,
    file_size BIGINT NOT NULL DEFAULT 0,
    blob_key TEXT NOT NULL,
    blob_url TEXT NOT NULL,
    blob_bucket TEXT NOT NULL,
    ocr_status TEXT NOT NULL DEFAULT 'pending'
        CHECK (ocr_status IN ('pending', 'completed', 'failed')),
    ocr_text TEXT,
    ocr_ms INTEGER,
    ai_summary TEXT,
    transaction_id TEXT,
    transaction_label TEXT,
    is_group_member BOOLEAN NOT NULL DEFAULT FALSE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_documents_chart ON cc.documents(chart_id);
CREATE INDEX IF NOT EXISTS idx_documents_transaction ON cc.documents(transaction_id)
    WHERE transaction_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS cc.processing_queue (
    id BIGSERIAL PRIMARY KEY,
    job_id UUID NOT NULL UNIQUE,
    chart_id BIGINT NOT NULL,
    chart_number TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'processing', 'completed', 'failed')),
    job_data JSONB NOT NULL DEFAULT '{}'::jsonb,
    worker_id TEXT,
    locked_at TIMESTAMPTZ,
    started_at TIMESTAMPTZ,
    completed_at TIMESTAMPTZ,
    attempts INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0 AND attempts <= 100),
    max_attempts INTEGER NOT NULL DEFAULT 3,
    error_message TEXT,
    retry_after TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_queue_status ON cc.processing_queue(status);
CREATE INDEX IF NOT EXISTS idx_queue_chart_number ON cc.processing_queue(chart_number);
CREATE INDEX IF NOT EXISTS idx_queue_created_at ON cc.processing_queue(created_at);
CREATE INDEX IF NOT EXISTS idx_queue_retry_after ON cc.processing_queue(retry_after)
    WHERE retry_after IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_queue_claimable
    ON cc.processing_queue(status, created_at, id)
    WHERE status IN ('pending', 'failed');
"#,
    },
    Migration {
        id: 2,
        description: "completed_at index for queue retention sweeps",
        sql: r#"
CREATE INDEX IF NOT EXISTS idx_queue_completed_at ON cc.processing_queue(completed_at)
    WHERE status = 'completed';
"#,
    },
];

#[instrument(skip(pool))]
pub async fn run_migrations(pool: &PgPool) -> Result<(), MigrationError> {
    let mut client = pool.get().await?;
    client
        .batch_execute(
            "CREATE SCHEMA IF NOT EXISTS cc;
             CREATE TABLE IF NOT EXISTS cc.schema_migrations (
                id INTEGER PRIMARY KEY,
                description TEXT NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
             );",
        )
        .await?;

    for migration in MIGRATIONS {
        let already_applied: bool = client
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM cc.schema_migrations WHERE id = $1)",
                &[&migration.id],
            )
            .await?
            .get(0);

        if already_applied {
            continue;
        }

        let tx = client.transaction().await?;
        tx.batch_execute(migration.sql).await?;
        tx.execute(
            "INSERT INTO cc.schema_migrations (id, description) VALUES ($1, $2)",
            &[&migration.id, &migration.description],
        )
        .await?;
        tx.commit().await?;

        info!(
            id = migration.id,
            description = migration.description,
            "applied migration"
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migration_ids_are_unique_and_ordered() {
        let mut last = 0;
        for migration in MIGRATIONS {
            assert!(migration.id > last, "ids must strictly increase");
            last = migration.id;
        }
    }
}
