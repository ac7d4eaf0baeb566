//! Repository and bot-pattern repository.

use chrono::Utc;
use tracing::info;

use crate::error::{DbError, Result};
use crate::models::{BotPatternRow, BotPatternType, RepositoryRow};
use crate::pool::DbPool;

#[derive(Clone)]
pub struct RepoRepository {
    pool: DbPool,
}

/// Derive a repository name from its git URL: last path segment without
/// a `.git` suffix.
pub fn derive_repo_name(git_url: &str) -> String {
    let trimmed = git_url.trim_end_matches('/');
    let last = trimmed.rsplit('/').next().unwrap_or(trimmed);
    last.trim_end_matches(".git").to_string()
}

impl RepoRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, git_url: &str) -> Result<RepositoryRow> {
        let name = derive_repo_name(git_url);
        let now = Utc::now().to_rfc3339();

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO cg_repositories (git_url, name, created_at) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(git_url)
        .bind(&name)
        .bind(&now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                DbError::constraint(format!("repository '{}' already registered", git_url))
            }
            _ => DbError::from(e),
        })?;

        info!("Registered repository {} ({})", id, name);
        self.get_required(id).await
    }

    pub async fn get(&self, id: i64) -> Result<Option<RepositoryRow>> {
        let row = sqlx::query_as::<_, RepositoryRow>("SELECT * FROM cg_repositories WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn get_required(&self, id: i64) -> Result<RepositoryRow> {
        self.get(id)
            .await?
            .ok_or_else(|| DbError::not_found(format!("repository {}", id)))
    }

    /// Delete a repository; datasets, models, jobs, metrics and results
    /// cascade away with it.
    pub async fn delete(&self, id: i64) -> Result<bool> {
        let affected = sqlx::query("DELETE FROM cg_repositories WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected == 1)
    }

    pub async fn add_bot_pattern(
        &self,
        repository_id: Option<i64>,
        pattern: &str,
        pattern_type: BotPatternType,
        is_exclusion: bool,
    ) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO cg_bot_patterns (repository_id, pattern, pattern_type, is_exclusion)
            VALUES (?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(repository_id)
        .bind(pattern)
        .bind(pattern_type.as_str())
        .bind(is_exclusion)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// Patterns that apply to a repository: its own plus the global ones.
    pub async fn bot_patterns_for(&self, repository_id: i64) -> Result<Vec<BotPatternRow>> {
        let rows = sqlx::query_as::<_, BotPatternRow>(
            r#"
            SELECT * FROM cg_bot_patterns
            WHERE repository_id IS NULL OR repository_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(repository_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_repo_name() {
        assert_eq!(derive_repo_name("https://host/org/proj.git"), "proj");
        assert_eq!(derive_repo_name("https://host/org/proj"), "proj");
        assert_eq!(derive_repo_name("git@host:org/tool.git/"), "tool");
    }
}
