//! Schema bootstrap.
//!
//! Idempotent DDL, executed lazily on first session open per
//! [`crate::Storage`] instance (guarded by the instance's bootstrap mutex).
//! The `taskforge_source` table is the constant one-row source feeding the
//! lock manager's conditional insert.

use sqlx::PgPool;

use taskforge_core::{StorageError, StorageResult};

const DDL: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS taskforge_source (
        id integer PRIMARY KEY CHECK (id = 1)
    )",
    "INSERT INTO taskforge_source (id) VALUES (1) ON CONFLICT (id) DO NOTHING",
    "CREATE TABLE IF NOT EXISTS taskforge_job (
        id bigserial PRIMARY KEY,
        invocation_data text NOT NULL,
        arguments text NOT NULL,
        created_at timestamptz NOT NULL DEFAULT now(),
        expire_at timestamptz,
        state_name text,
        state_reason text,
        state_data text
    )",
    "CREATE INDEX IF NOT EXISTS ix_taskforge_job_expire_at
        ON taskforge_job (expire_at) WHERE expire_at IS NOT NULL",
    "CREATE TABLE IF NOT EXISTS taskforge_job_parameter (
        id bigserial PRIMARY KEY,
        job_id bigint NOT NULL REFERENCES taskforge_job (id) ON DELETE CASCADE,
        name text NOT NULL,
        \"value\" text,
        UNIQUE (job_id, name)
    )",
    "CREATE TABLE IF NOT EXISTS taskforge_job_state (
        id bigserial PRIMARY KEY,
        job_id bigint NOT NULL REFERENCES taskforge_job (id) ON DELETE CASCADE,
        name text NOT NULL,
        reason text,
        data text,
        created_at timestamptz NOT NULL DEFAULT now()
    )",
    "CREATE INDEX IF NOT EXISTS ix_taskforge_job_state_job_id
        ON taskforge_job_state (job_id)",
    "CREATE TABLE IF NOT EXISTS taskforge_job_queue (
        id bigserial PRIMARY KEY,
        job_id bigint NOT NULL REFERENCES taskforge_job (id) ON DELETE CASCADE,
        queue text NOT NULL,
        fetched_at timestamptz
    )",
    "CREATE INDEX IF NOT EXISTS ix_taskforge_job_queue_claim
        ON taskforge_job_queue (queue, id)",
    "CREATE TABLE IF NOT EXISTS taskforge_lock (
        id bigserial PRIMARY KEY,
        resource text NOT NULL UNIQUE,
        acquired_at timestamptz NOT NULL,
        expire_at_epoch bigint NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS taskforge_hash (
        id bigserial PRIMARY KEY,
        \"key\" text NOT NULL,
        field text NOT NULL,
        \"value\" text,
        expire_at timestamptz,
        UNIQUE (\"key\", field)
    )",
    "CREATE TABLE IF NOT EXISTS taskforge_list (
        id bigserial PRIMARY KEY,
        \"key\" text NOT NULL,
        \"value\" text,
        expire_at timestamptz
    )",
    "CREATE INDEX IF NOT EXISTS ix_taskforge_list_key ON taskforge_list (\"key\")",
    "CREATE TABLE IF NOT EXISTS taskforge_set (
        id bigserial PRIMARY KEY,
        \"key\" text NOT NULL,
        \"value\" text NOT NULL,
        score double precision NOT NULL DEFAULT 0,
        expire_at timestamptz,
        UNIQUE (\"key\", \"value\")
    )",
    "CREATE TABLE IF NOT EXISTS taskforge_counter (
        id bigserial PRIMARY KEY,
        \"key\" text NOT NULL,
        \"value\" bigint NOT NULL,
        expire_at timestamptz
    )",
    "CREATE INDEX IF NOT EXISTS ix_taskforge_counter_key ON taskforge_counter (\"key\")",
    "CREATE TABLE IF NOT EXISTS taskforge_aggregated_counter (
        id bigserial PRIMARY KEY,
        \"key\" text NOT NULL UNIQUE,
        \"value\" bigint NOT NULL,
        expire_at timestamptz
    )",
    "CREATE TABLE IF NOT EXISTS taskforge_server (
        id text PRIMARY KEY,
        data text NOT NULL,
        last_heartbeat timestamptz NOT NULL
    )",
];

/// Create every table and index, tolerating pre-existing objects.
pub(crate) async fn create_all(pool: &PgPool) -> StorageResult<()> {
    for statement in DDL {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| StorageError::SchemaBootstrap(format!("{e}")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_statement_is_idempotent() {
        for statement in DDL {
            let idempotent = statement.contains("IF NOT EXISTS")
                || statement.contains("ON CONFLICT (id) DO NOTHING");
            assert!(idempotent, "non-idempotent bootstrap statement: {statement}");
        }
    }

    #[test]
    fn source_table_is_created_before_first_use() {
        let source_pos = DDL
            .iter()
            .position(|s| s.contains("taskforge_source ("))
            .unwrap();
        assert_eq!(source_pos, 0);
    }
}
