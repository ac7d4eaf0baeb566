//! Step contract.

use async_trait::async_trait;

use crate::context::Context;
use crate::deps::Dependencies;
use crate::error::Result;

/// One stage of a strategy.
///
/// Steps are stateless across runs; their only memory is what they write
/// into the context. A step that finds nothing left to do sets
/// `ctx.early_exit` instead of erroring; later steps honour the sentinel.
#[async_trait]
pub trait Step: Send + Sync {
    /// Human-readable name, used in progress events and failure messages.
    fn name(&self) -> &'static str;

    /// Run the step against the shared context with the run's dependency
    /// bundle. Errors abort the pipeline.
    async fn run(&self, ctx: &mut Context, deps: &Dependencies) -> Result<()>;
}

/// An ordered list of steps defining one job kind's processing.
pub type Strategy = Vec<std::sync::Arc<dyn Step>>;
