//! Commit-level and class-level metric repositories.
//!
//! Both tables are bulk-upsertable on their composite unique keys; the
//! ingestion handler feeds them and the dataset pipeline streams them back
//! out in fixed-size batches.

use codegauge_protocol::ConfigMap;
use tracing::debug;

use crate::error::Result;
use crate::models::{CkMetricRow, CommitMetricRow};
use crate::pool::DbPool;

#[derive(Clone)]
pub struct MetricRepository {
    pool: DbPool,
}

/// Upsert payload for one commit-level metric row.
#[derive(Debug, Clone, Default)]
pub struct CommitMetricUpsert {
    pub commit_hash: String,
    pub parent_hashes: Option<String>,
    pub author_name: Option<String>,
    pub author_date_ts: Option<i64>,
    pub is_merge: bool,
    pub files_churned: Option<i64>,
    pub values: ConfigMap,
    pub is_buggy: Option<bool>,
}

/// Upsert payload for one class-level metric row.
#[derive(Debug, Clone, Default)]
pub struct CkMetricUpsert {
    pub commit_hash: String,
    pub file_path: String,
    pub class_name: String,
    pub cbo: Option<f64>,
    pub wmc: Option<f64>,
    pub dit: Option<f64>,
    pub rfc: Option<f64>,
    pub lcom: Option<f64>,
    pub loc: Option<f64>,
}

fn metric_f64(values: &ConfigMap, key: &str) -> Option<f64> {
    values.get(key).and_then(|v| v.as_f64())
}

impl MetricRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Bulk upsert commit metrics in one transaction, keyed on
    /// `(repository_id, commit_hash)`.
    pub async fn upsert_commit_metrics(
        &self,
        repository_id: i64,
        rows: &[CommitMetricUpsert],
    ) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO cg_commit_metrics
                    (repository_id, commit_hash, parent_hashes, author_name, author_date_ts,
                     is_merge, files_churned, la, ld, ns, nd, nf, entropy, ndev, age, nuc,
                     exp, rexp, sexp, is_buggy)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(repository_id, commit_hash) DO UPDATE SET
                    parent_hashes = excluded.parent_hashes,
                    author_name = excluded.author_name,
                    author_date_ts = excluded.author_date_ts,
                    is_merge = excluded.is_merge,
                    files_churned = excluded.files_churned,
                    la = excluded.la, ld = excluded.ld, ns = excluded.ns,
                    nd = excluded.nd, nf = excluded.nf, entropy = excluded.entropy,
                    ndev = excluded.ndev, age = excluded.age, nuc = excluded.nuc,
                    exp = excluded.exp, rexp = excluded.rexp, sexp = excluded.sexp,
                    is_buggy = COALESCE(excluded.is_buggy, cg_commit_metrics.is_buggy)
                "#,
            )
            .bind(repository_id)
            .bind(&row.commit_hash)
            .bind(&row.parent_hashes)
            .bind(&row.author_name)
            .bind(row.author_date_ts)
            .bind(row.is_merge)
            .bind(row.files_churned)
            .bind(metric_f64(&row.values, "la"))
            .bind(metric_f64(&row.values, "ld"))
            .bind(metric_f64(&row.values, "ns"))
            .bind(metric_f64(&row.values, "nd"))
            .bind(metric_f64(&row.values, "nf"))
            .bind(metric_f64(&row.values, "entropy"))
            .bind(metric_f64(&row.values, "ndev"))
            .bind(metric_f64(&row.values, "age"))
            .bind(metric_f64(&row.values, "nuc"))
            .bind(metric_f64(&row.values, "exp"))
            .bind(metric_f64(&row.values, "rexp"))
            .bind(metric_f64(&row.values, "sexp"))
            .bind(row.is_buggy)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!(
            "Upserted {} commit metric rows for repository {}",
            rows.len(),
            repository_id
        );
        Ok(rows.len())
    }

    /// Bulk upsert class metrics, keyed on
    /// `(repository_id, commit_hash, file_path, class_name)`.
    pub async fn upsert_ck_metrics(
        &self,
        repository_id: i64,
        rows: &[CkMetricUpsert],
    ) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO cg_ck_metrics
                    (repository_id, commit_hash, file_path, class_name, cbo, wmc, dit, rfc, lcom, loc)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(repository_id, commit_hash, file_path, class_name) DO UPDATE SET
                    cbo = excluded.cbo, wmc = excluded.wmc, dit = excluded.dit,
                    rfc = excluded.rfc, lcom = excluded.lcom, loc = excluded.loc
                "#,
            )
            .bind(repository_id)
            .bind(&row.commit_hash)
            .bind(&row.file_path)
            .bind(&row.class_name)
            .bind(row.cbo)
            .bind(row.wmc)
            .bind(row.dit)
            .bind(row.rfc)
            .bind(row.lcom)
            .bind(row.loc)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!(
            "Upserted {} class metric rows for repository {}",
            rows.len(),
            repository_id
        );
        Ok(rows.len())
    }

    /// Total labeled commit rows for a repository (batch planning).
    pub async fn count_labeled_commits(&self, repository_id: i64) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM cg_commit_metrics WHERE repository_id = ? AND is_buggy IS NOT NULL",
        )
        .bind(repository_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Stream one batch of labeled commit metrics, ordered by id for stable
    /// pagination.
    pub async fn fetch_commit_batch(
        &self,
        repository_id: i64,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<CommitMetricRow>> {
        let rows = sqlx::query_as::<_, CommitMetricRow>(
            r#"
            SELECT * FROM cg_commit_metrics
            WHERE repository_id = ? AND is_buggy IS NOT NULL
            ORDER BY id ASC LIMIT ? OFFSET ?
            "#,
        )
        .bind(repository_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Class metrics for one commit.
    pub async fn ck_metrics_for_commit(
        &self,
        repository_id: i64,
        commit_hash: &str,
    ) -> Result<Vec<CkMetricRow>> {
        let rows = sqlx::query_as::<_, CkMetricRow>(
            "SELECT * FROM cg_ck_metrics WHERE repository_id = ? AND commit_hash = ?",
        )
        .bind(repository_id)
        .bind(commit_hash)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Commit metric for a single commit, if ingested.
    pub async fn commit_metric(
        &self,
        repository_id: i64,
        commit_hash: &str,
    ) -> Result<Option<CommitMetricRow>> {
        let row = sqlx::query_as::<_, CommitMetricRow>(
            "SELECT * FROM cg_commit_metrics WHERE repository_id = ? AND commit_hash = ?",
        )
        .bind(repository_id)
        .bind(commit_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}
