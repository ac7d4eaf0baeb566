//! Step-based pipeline engine.
//!
//! A job kind's processing is a *strategy*: an ordered list of [`Step`]s run
//! sequentially against a shared [`Context`] with a per-run [`Dependencies`]
//! bundle. The engine publishes progress around every step, checks the
//! [`CancellationToken`] at step boundaries, and records the failed step's
//! name before propagating errors to the job handler.
//!
//! Two steps in the worker are themselves orchestrators (batch streaming and
//! the global stage); their inner step lists are ordinary strategies run over
//! derived contexts via [`Context::batch_child`].

pub mod context;
pub mod deps;
pub mod engine;
pub mod error;
pub mod frame;
pub mod progress;
pub mod step;

pub use context::{CancellationToken, Context};
pub use deps::Dependencies;
pub use engine::PipelineRunner;
pub use error::{PipelineError, Result};
pub use frame::{Column, ColumnData, Frame};
pub use progress::{NullProgress, ProgressSink, RecordingProgress};
pub use step::{Step, Strategy};
