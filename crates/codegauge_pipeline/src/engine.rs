//! Pipeline runner.
//!
//! Executes a strategy's steps sequentially against a shared context,
//! publishing progress around each step and checking the context's
//! cancellation token at every step boundary. On failure the runner records
//! the failed step's name in the context warnings and stops.

use tracing::{error, info};

use crate::context::Context;
use crate::deps::Dependencies;
use crate::error::{PipelineError, Result};
use crate::step::Strategy;

pub struct PipelineRunner {
    steps: Strategy,
}

impl PipelineRunner {
    pub fn new(steps: Strategy) -> Self {
        Self { steps }
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    pub async fn run(&self, ctx: &mut Context, deps: &Dependencies) -> Result<()> {
        let total = self.steps.len();
        info!("Job {}: starting pipeline with {} steps", ctx.job_id, total);

        for (i, step) in self.steps.iter().enumerate() {
            ctx.cancel.ensure_active()?;

            let name = step.name();
            let before = percent(i, total);
            ctx.progress
                .report(before, name, Some(&format!("Starting step {}/{}", i + 1, total)));
            info!("Job {}: executing step {}/{} [{}]", ctx.job_id, i + 1, total, name);

            if let Err(e) = step.run(ctx, deps).await {
                if e.is_cancelled() {
                    info!("Job {}: cancelled during step [{}]", ctx.job_id, name);
                    return Err(e);
                }
                error!("Job {}: pipeline failed at step [{}]: {}", ctx.job_id, name, e);
                ctx.warn(format!("Pipeline failed at step [{}]: {}", name, e));
                return Err(PipelineError::Step {
                    step: name.to_string(),
                    message: e.to_string(),
                });
            }

            let after = percent(i + 1, total);
            ctx.progress
                .report(after, name, Some(&format!("Completed step {}/{}", i + 1, total)));
        }

        info!("Job {}: pipeline finished successfully", ctx.job_id);
        Ok(())
    }
}

/// `round(100 * k / n)` with an empty strategy treated as complete.
fn percent(k: usize, n: usize) -> u8 {
    if n == 0 {
        return 100;
    }
    ((100.0 * k as f64 / n as f64).round() as u64).min(100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CancellationToken;
    use crate::progress::RecordingProgress;
    use crate::step::Step;
    use async_trait::async_trait;
    use codegauge_db::{create_pool, init_schema, DbConfig};
    use codegauge_store::LocalArtifactStore;
    use std::sync::Arc;

    struct NoopStep(&'static str);

    #[async_trait]
    impl Step for NoopStep {
        fn name(&self) -> &'static str {
            self.0
        }

        async fn run(&self, _ctx: &mut Context, _deps: &Dependencies) -> Result<()> {
            Ok(())
        }
    }

    struct FailingStep;

    #[async_trait]
    impl Step for FailingStep {
        fn name(&self) -> &'static str {
            "Explode"
        }

        async fn run(&self, _ctx: &mut Context, _deps: &Dependencies) -> Result<()> {
            Err(PipelineError::validation("boom"))
        }
    }

    async fn test_deps() -> (Dependencies, tempfile::TempDir) {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        init_schema(&pool).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalArtifactStore::new(dir.path()));
        (Dependencies::new(pool, store, "file", "analytics"), dir)
    }

    #[tokio::test]
    async fn test_progress_percentages_for_four_steps() {
        let (deps, _dir) = test_deps().await;
        let runner = PipelineRunner::new(vec![
            Arc::new(NoopStep("A")),
            Arc::new(NoopStep("B")),
            Arc::new(NoopStep("C")),
            Arc::new(NoopStep("D")),
        ]);
        let progress = Arc::new(RecordingProgress::new());
        let mut ctx =
            Context::with_channels(1, progress.clone(), CancellationToken::new());
        runner.run(&mut ctx, &deps).await.unwrap();

        let completed: Vec<u8> = progress
            .events()
            .iter()
            .skip(1)
            .step_by(2)
            .map(|(p, _)| *p)
            .collect();
        assert_eq!(completed, vec![25, 50, 75, 100]);
    }

    #[tokio::test]
    async fn test_failure_records_step_name() {
        let (deps, _dir) = test_deps().await;
        let runner = PipelineRunner::new(vec![
            Arc::new(NoopStep("A")),
            Arc::new(FailingStep),
            Arc::new(NoopStep("C")),
        ]);
        let mut ctx = Context::new(2);
        let err = runner.run(&mut ctx, &deps).await.unwrap_err();

        match err {
            PipelineError::Step { step, .. } => assert_eq!(step, "Explode"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(ctx.warnings.len(), 1);
        assert!(ctx.warnings[0].contains("Explode"));
    }

    #[tokio::test]
    async fn test_cancellation_stops_before_first_step() {
        let (deps, _dir) = test_deps().await;
        let runner = PipelineRunner::new(vec![Arc::new(NoopStep("A"))]);
        let mut ctx = Context::new(3);
        ctx.cancel.cancel();

        let err = runner.run(&mut ctx, &deps).await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
