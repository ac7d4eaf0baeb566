//! Schema bootstrap.
//!
//! `init_schema` is idempotent and run by both binaries at startup. Cascade
//! deletes flow from `cg_repositories` down through datasets, models, jobs,
//! metrics, commit details and XAI results.

use crate::error::Result;
use crate::pool::DbPool;

const TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS cg_repositories (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        git_url TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cg_bot_patterns (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        repository_id INTEGER REFERENCES cg_repositories(id) ON DELETE CASCADE,
        pattern TEXT NOT NULL,
        pattern_type TEXT NOT NULL,
        is_exclusion INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cg_datasets (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        repository_id INTEGER NOT NULL REFERENCES cg_repositories(id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        status_message TEXT,
        storage_uri TEXT,
        background_sample_uri TEXT,
        num_rows INTEGER,
        config TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cg_models (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        version INTEGER NOT NULL,
        model_type TEXT NOT NULL,
        artifact_uri TEXT,
        dataset_id INTEGER REFERENCES cg_datasets(id) ON DELETE CASCADE,
        training_job_id INTEGER,
        hp_search_job_id INTEGER,
        hyperparameters TEXT NOT NULL DEFAULT '{}',
        performance_metrics TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE(name, version)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cg_jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        kind TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        status_message TEXT,
        broker_task_id TEXT,
        config TEXT NOT NULL DEFAULT '{}',
        dataset_id INTEGER REFERENCES cg_datasets(id) ON DELETE CASCADE,
        model_id INTEGER REFERENCES cg_models(id) ON DELETE CASCADE,
        input_reference TEXT,
        prediction_result TEXT,
        study_name TEXT,
        best_trial_id INTEGER,
        best_params TEXT,
        best_value REAL,
        inference_job_id INTEGER REFERENCES cg_jobs(id) ON DELETE CASCADE,
        repository_id INTEGER REFERENCES cg_repositories(id) ON DELETE CASCADE,
        dispatched_at TEXT,
        started_at TEXT,
        completed_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cg_xai_results (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        inference_job_id INTEGER NOT NULL REFERENCES cg_jobs(id) ON DELETE CASCADE,
        xai_type TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        status_message TEXT,
        broker_task_id TEXT,
        result TEXT,
        started_at TEXT,
        completed_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE(inference_job_id, xai_type)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cg_commit_metrics (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        repository_id INTEGER NOT NULL REFERENCES cg_repositories(id) ON DELETE CASCADE,
        commit_hash TEXT NOT NULL,
        parent_hashes TEXT,
        author_name TEXT,
        author_date_ts INTEGER,
        is_merge INTEGER NOT NULL DEFAULT 0,
        files_churned INTEGER,
        la REAL, ld REAL, ns REAL, nd REAL, nf REAL,
        entropy REAL, ndev REAL, age REAL, nuc REAL,
        exp REAL, rexp REAL, sexp REAL,
        is_buggy INTEGER,
        UNIQUE(repository_id, commit_hash)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cg_ck_metrics (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        repository_id INTEGER NOT NULL REFERENCES cg_repositories(id) ON DELETE CASCADE,
        commit_hash TEXT NOT NULL,
        file_path TEXT NOT NULL,
        class_name TEXT NOT NULL DEFAULT '',
        cbo REAL, wmc REAL, dit REAL, rfc REAL, lcom REAL, loc REAL,
        UNIQUE(repository_id, commit_hash, file_path, class_name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cg_commit_details (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        repository_id INTEGER NOT NULL REFERENCES cg_repositories(id) ON DELETE CASCADE,
        commit_hash TEXT NOT NULL,
        message TEXT,
        author_name TEXT,
        author_email TEXT,
        committed_at TEXT,
        ingestion_status TEXT NOT NULL DEFAULT 'not_ingested',
        status_message TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE(repository_id, commit_hash)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cg_commit_file_diffs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        commit_detail_id INTEGER NOT NULL REFERENCES cg_commit_details(id) ON DELETE CASCADE,
        file_path TEXT NOT NULL,
        change_type TEXT,
        lines_added INTEGER NOT NULL DEFAULT 0,
        lines_deleted INTEGER NOT NULL DEFAULT 0,
        diff_text TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cg_cleaning_rule_defs (
        name TEXT PRIMARY KEY,
        display_name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        parameter_schema TEXT NOT NULL DEFAULT '[]',
        is_implemented INTEGER NOT NULL DEFAULT 1,
        last_updated_by TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cg_feature_selection_defs (
        name TEXT PRIMARY KEY,
        display_name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        parameter_schema TEXT NOT NULL DEFAULT '[]',
        is_implemented INTEGER NOT NULL DEFAULT 1,
        last_updated_by TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cg_model_type_defs (
        name TEXT PRIMARY KEY,
        display_name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        parameter_schema TEXT NOT NULL DEFAULT '[]',
        is_implemented INTEGER NOT NULL DEFAULT 1,
        last_updated_by TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_jobs_status_kind ON cg_jobs(status, kind)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_task ON cg_jobs(broker_task_id)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_study ON cg_jobs(study_name)",
    "CREATE INDEX IF NOT EXISTS idx_xai_inference ON cg_xai_results(inference_job_id)",
    "CREATE INDEX IF NOT EXISTS idx_ck_commit ON cg_ck_metrics(repository_id, commit_hash)",
    "CREATE INDEX IF NOT EXISTS idx_cm_commit ON cg_commit_metrics(repository_id, commit_hash)",
];

/// Create all tables and indexes if they do not exist yet.
pub async fn init_schema(pool: &DbPool) -> Result<()> {
    for ddl in TABLES {
        sqlx::query(ddl).execute(pool).await?;
    }
    for ddl in INDEXES {
        sqlx::query(ddl).execute(pool).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{create_pool, DbConfig};

    #[tokio::test]
    async fn test_init_schema_idempotent() {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        init_schema(&pool).await.unwrap();
        init_schema(&pool).await.unwrap();

        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name LIKE 'cg_%'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert!(count >= 12);
    }
}
