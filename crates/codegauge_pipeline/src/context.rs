//! Per-run mutable shared state and the cancellation flag it carries.
//!
//! One `Context` exists per job execution. Steps mutate the context they are
//! handed and never construct a new one; the batch orchestrator derives
//! per-batch child contexts that share the resolved config, progress handle
//! and cancellation flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use codegauge_db::{BotPatternRow, DatasetConfig, DatasetRow, RepositoryRow};

use crate::frame::Frame;
use crate::progress::{NullProgress, ProgressSink};

/// Cooperative cancellation flag, owned by the context.
///
/// The worker's abort path flips the flag; the engine consults it before
/// every step and the batch orchestrator at every batch boundary, so a
/// revoke lands within one step or one batch. Handlers taking significant
/// time between boundaries call [`CancellationToken::ensure_active`]
/// themselves. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip the flag. Release ordering publishes the request to whichever
    /// boundary check reads it next.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Boundary check: error with [`crate::PipelineError::Cancelled`] once a
    /// revoke has been observed.
    pub fn ensure_active(&self) -> crate::Result<()> {
        if self.is_cancelled() {
            return Err(crate::PipelineError::Cancelled);
        }
        Ok(())
    }
}

pub struct Context {
    pub job_id: i64,
    pub dataset_id: Option<i64>,

    // Resolved entities, filled by LoadConfiguration.
    pub repository: Option<RepositoryRow>,
    pub dataset: Option<DatasetRow>,
    pub dataset_config: Option<DatasetConfig>,
    pub bot_patterns: Vec<BotPatternRow>,

    /// Current working frame. Batch sub-steps operate on the batch's frame;
    /// global steps on the concatenated one.
    pub frame: Option<Frame>,
    /// Outputs of the batch stage, consumed by the global stage.
    pub processed_batches: Vec<Frame>,
    /// Final frame selected for output.
    pub final_frame: Option<Frame>,
    /// Feature set after feature selection, when it narrowed the config.
    pub selected_features: Option<Vec<String>>,

    pub output_storage_uri: Option<String>,
    pub background_sample_uri: Option<String>,
    pub rows_written: usize,
    pub estimated_total_rows: i64,

    /// Early-exit sentinel: a step that finds nothing left to do sets this;
    /// the engine still advances and later steps honour it.
    pub early_exit: bool,

    /// Append-only warnings, surfaced on the job row at completion.
    pub warnings: Vec<String>,

    /// Task-progress channel handle; long-running steps report through it.
    pub progress: Arc<dyn ProgressSink>,
    /// Cancellation token, checked at step and batch boundaries.
    pub cancel: CancellationToken,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            job_id: 0,
            dataset_id: None,
            repository: None,
            dataset: None,
            dataset_config: None,
            bot_patterns: Vec::new(),
            frame: None,
            processed_batches: Vec::new(),
            final_frame: None,
            selected_features: None,
            output_storage_uri: None,
            background_sample_uri: None,
            rows_written: 0,
            estimated_total_rows: 0,
            early_exit: false,
            warnings: Vec::new(),
            progress: Arc::new(NullProgress),
            cancel: CancellationToken::new(),
        }
    }
}

impl Context {
    pub fn new(job_id: i64) -> Self {
        Self {
            job_id,
            ..Default::default()
        }
    }

    pub fn with_channels(
        job_id: i64,
        progress: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            job_id,
            progress,
            cancel,
            ..Default::default()
        }
    }

    /// Derive a per-batch child context over one batch frame. The child
    /// shares the resolved config; its outputs are folded back by the batch
    /// orchestrator.
    pub fn batch_child(&self, batch: Frame) -> Context {
        Context {
            job_id: self.job_id,
            dataset_id: self.dataset_id,
            repository: self.repository.clone(),
            dataset: self.dataset.clone(),
            dataset_config: self.dataset_config.clone(),
            bot_patterns: self.bot_patterns.clone(),
            frame: Some(batch),
            progress: Arc::clone(&self.progress),
            cancel: self.cancel.clone(),
            ..Default::default()
        }
    }

    pub fn config_required(&self) -> crate::Result<&DatasetConfig> {
        self.dataset_config
            .as_ref()
            .ok_or_else(|| crate::PipelineError::validation("dataset config missing in context"))
    }

    pub fn frame_required(&self) -> crate::Result<&Frame> {
        self.frame
            .as_ref()
            .ok_or_else(|| crate::PipelineError::Frame("no working frame in context".to_string()))
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PipelineError;

    #[test]
    fn test_cancellation_shared_across_clones_and_children() {
        let ctx = Context::new(1);
        let child = ctx.batch_child(Frame::new());
        assert!(ctx.cancel.ensure_active().is_ok());

        // the child's flag is the parent's flag
        child.cancel.cancel();
        assert!(ctx.cancel.is_cancelled());
        assert!(matches!(
            ctx.cancel.ensure_active(),
            Err(PipelineError::Cancelled)
        ));
    }

    #[test]
    fn test_batch_child_shares_config_not_results() {
        let mut ctx = Context::new(2);
        ctx.dataset_id = Some(7);
        ctx.rows_written = 99;
        ctx.warn("parent warning");

        let child = ctx.batch_child(Frame::new());
        assert_eq!(child.dataset_id, Some(7));
        assert_eq!(child.rows_written, 0);
        assert!(child.warnings.is_empty());
    }
}
