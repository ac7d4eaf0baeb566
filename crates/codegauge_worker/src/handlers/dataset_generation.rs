//! Dataset-generation handler: a full pipeline-engine run.

use std::sync::Arc;

use codegauge_pipeline::{
    CancellationToken, Context, Dependencies, PipelineRunner, ProgressSink,
};
use codegauge_store::{background_sample_uri, dataset_uri};
use tracing::warn;

use crate::handlers::{HandlerFailure, HandlerOutcome, HandlerResult};
use crate::steps::dataset_generation_strategy;
use codegauge_db::JobRow;

pub async fn run(
    job: &JobRow,
    deps: &Dependencies,
    progress: &Arc<dyn ProgressSink>,
    cancel: &CancellationToken,
) -> HandlerResult {
    let dataset_id = job
        .dataset_id
        .ok_or_else(|| HandlerFailure::validation("job has no dataset id"))?;

    let runner = PipelineRunner::new(dataset_generation_strategy());
    let mut ctx = Context::with_channels(job.id, Arc::clone(progress), cancel.clone());
    ctx.dataset_id = Some(dataset_id);

    match runner.run(&mut ctx, deps).await {
        Ok(()) => {
            let mut message = format!(
                "Dataset {} generated ({} rows).",
                dataset_id, ctx.rows_written
            );
            if !ctx.warnings.is_empty() {
                message.push_str(&format!(" Warnings: {}.", ctx.warnings.join("; ")));
            }
            Ok(HandlerOutcome {
                message,
                receipt_result: Some(serde_json::json!({
                    "dataset_id": dataset_id,
                    "rows_written": ctx.rows_written,
                    "storage_uri": ctx.output_storage_uri,
                    "background_sample_uri": ctx.background_sample_uri,
                    "warnings": ctx.warnings,
                })),
                ..Default::default()
            })
        }
        Err(e) => {
            let failure = HandlerFailure::from(e);
            if failure.cancelled {
                // Best-effort cleanup: no partial artifacts survive a revoke,
                // and the dataset row never stays stuck in `generating`.
                let main = dataset_uri(&deps.artifact_scheme, &deps.artifact_bucket, dataset_id);
                let sample =
                    background_sample_uri(&deps.artifact_scheme, &deps.artifact_bucket, dataset_id);
                for uri in [&main, &sample] {
                    if let Err(cleanup) = deps.store.delete(uri) {
                        warn!("Cleanup of {} after revoke failed: {}", uri, cleanup);
                    }
                }
                if let Err(db_err) = deps
                    .datasets
                    .mark_failed(dataset_id, "Dataset generation revoked")
                    .await
                {
                    warn!(
                        "Failed to mark dataset {} failed after revoke: {}",
                        dataset_id, db_err
                    );
                }
            }
            Err(failure)
        }
    }
}
