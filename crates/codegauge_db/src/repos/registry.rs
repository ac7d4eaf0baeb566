//! Capability registry repository.
//!
//! Three parallel tables with the same shape; a worker owns the rows it last
//! wrote. A sync upserts the discovered set and down-flags this worker's
//! vanished rows in one transaction; rows owned by other workers are never
//! touched.

use chrono::Utc;
use codegauge_protocol::CapabilityDescriptor;
use std::collections::HashSet;
use tracing::info;

use crate::error::Result;
use crate::models::CapabilityRow;
use crate::pool::DbPool;

/// Which registry table to operate on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryKind {
    CleaningRules,
    FeatureSelection,
    ModelTypes,
}

impl RegistryKind {
    pub const ALL: &'static [RegistryKind] = &[
        RegistryKind::CleaningRules,
        RegistryKind::FeatureSelection,
        RegistryKind::ModelTypes,
    ];

    fn table(&self) -> &'static str {
        match self {
            RegistryKind::CleaningRules => "cg_cleaning_rule_defs",
            RegistryKind::FeatureSelection => "cg_feature_selection_defs",
            RegistryKind::ModelTypes => "cg_model_type_defs",
        }
    }
}

#[derive(Clone)]
pub struct RegistryRepository {
    pool: DbPool,
}

impl RegistryRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Synchronise one registry with a worker's discovery set.
    ///
    /// An empty set is legal: the worker no longer implements anything and
    /// its previously-owned rows are all down-flagged.
    pub async fn sync(
        &self,
        kind: RegistryKind,
        worker_id: &str,
        descriptors: &[CapabilityDescriptor],
    ) -> Result<()> {
        let table = kind.table();
        let now = Utc::now().to_rfc3339();
        let discovered: HashSet<&str> = descriptors.iter().map(|d| d.name.as_str()).collect();

        let mut tx = self.pool.begin().await?;

        for descriptor in descriptors {
            let sql = format!(
                r#"
                INSERT INTO {} (name, display_name, description, parameter_schema,
                                is_implemented, last_updated_by, updated_at)
                VALUES (?, ?, ?, ?, 1, ?, ?)
                ON CONFLICT(name) DO UPDATE SET
                    display_name = excluded.display_name,
                    description = excluded.description,
                    parameter_schema = excluded.parameter_schema,
                    is_implemented = 1,
                    last_updated_by = excluded.last_updated_by,
                    updated_at = excluded.updated_at
                "#,
                table
            );
            sqlx::query(&sql)
                .bind(&descriptor.name)
                .bind(&descriptor.display_name)
                .bind(&descriptor.description)
                .bind(serde_json::to_string(&descriptor.parameter_schema)?)
                .bind(worker_id)
                .bind(&now)
                .execute(&mut *tx)
                .await?;
        }

        // Down-flag rows this worker owns but no longer advertises.
        let owned: Vec<String> =
            sqlx::query_scalar(&format!("SELECT name FROM {} WHERE last_updated_by = ?", table))
                .bind(worker_id)
                .fetch_all(&mut *tx)
                .await?;

        for name in owned {
            if !discovered.contains(name.as_str()) {
                let sql = format!(
                    "UPDATE {} SET is_implemented = 0, updated_at = ? \
                     WHERE name = ? AND last_updated_by = ?",
                    table
                );
                sqlx::query(&sql)
                    .bind(&now)
                    .bind(&name)
                    .bind(worker_id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        info!(
            "Synced {} descriptors into {} for worker '{}'",
            descriptors.len(),
            table,
            worker_id
        );
        Ok(())
    }

    /// Rows currently marked implemented, as surfaced to the UI.
    pub async fn list_implemented(&self, kind: RegistryKind) -> Result<Vec<CapabilityRow>> {
        let sql = format!(
            "SELECT * FROM {} WHERE is_implemented = 1 ORDER BY name ASC",
            kind.table()
        );
        let rows = sqlx::query_as::<_, CapabilityRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn get(&self, kind: RegistryKind, name: &str) -> Result<Option<CapabilityRow>> {
        let sql = format!("SELECT * FROM {} WHERE name = ?", kind.table());
        let row = sqlx::query_as::<_, CapabilityRow>(&sql)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }
}
