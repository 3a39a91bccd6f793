//! Incremental Recompute
//!
//! Edits to the graph are turned into preview jobs here:
//!
//! - `scheduler`: debounces invalidations and dispatches ordered jobs
//! - `worker`: the background thread that evaluates them
//! - `job`: job ids, states and the per-column cancellation registry

mod job;
mod scheduler;
mod worker;

pub use job::{Job, JobId, JobRegistry, JobState};
pub use scheduler::{FlushReport, JobSink, RecomputeScheduler};
pub use worker::{PreviewEvent, PreviewWorker};
