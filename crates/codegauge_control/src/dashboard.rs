//! Read-only dashboard aggregation.

use codegauge_db::{DatasetRepository, JobRepository, ModelRepository};

use crate::api::{DashboardView, JobSummary};
use crate::submit::SubmitError;

const RECENT_JOB_LIMIT: i64 = 20;

pub async fn build_dashboard(
    jobs: &JobRepository,
    datasets: &DatasetRepository,
    models: &ModelRepository,
) -> Result<DashboardView, SubmitError> {
    let jobs_by_status = jobs.counts_by_status().await?;
    let datasets_by_status = datasets.counts_by_status().await?;
    let model_count = models.count().await?;
    let recent_jobs = jobs
        .list_recent(None, RECENT_JOB_LIMIT)
        .await?
        .iter()
        .map(|row| JobSummary {
            id: row.id,
            kind: row.kind.clone(),
            status: row.status.clone(),
            created_at: row.created_at.to_rfc3339(),
        })
        .collect();

    Ok(DashboardView {
        jobs_by_status,
        datasets_by_status,
        model_count,
        recent_jobs,
    })
}
