//! Preview Jobs
//!
//! A job recomputes one column on the preview worker. Jobs are keyed by the
//! column's identity (its name); the registry remembers the single live job
//! per identity and the state of every job it handed out.
//!
//! # Cancellation
//!
//! Cancellation is cooperative. The worker publishes a result only while
//! holding the job's state entry, and only if the job is still `Running` and
//! still the live job for its identity. `cancel` takes the same entry, so
//! once it returns the cancelled job can no longer report.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::config::Environment;
use crate::graph::CalcNode;

/// Monotonic job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

impl JobId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl From<u64> for JobId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job#{}", self.0)
    }
}

/// Queued → Running → {Completed, Cancelled, Failed}.
///
/// Queued jobs can also move straight to `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl JobState {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

/// One unit of work for the preview worker.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,

    /// Column identity; results are keyed by it.
    pub identity: String,

    /// Frozen copy of the node at flush time.
    pub node: CalcNode,

    /// Global validity at flush time (static checks, cycles, dependencies).
    pub valid: bool,

    pub env: Arc<Environment>,
}

/// Live job per identity plus the state of every job handed out.
#[derive(Debug, Default)]
pub struct JobRegistry {
    live: DashMap<String, JobId>,
    states: DashMap<JobId, JobState>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a job for `identity`, superseding the previous live one.
    pub fn register(&self, identity: &str) -> JobId {
        let id = JobId::next();
        self.states.insert(id, JobState::Queued);
        if let Some(previous) = self.live.insert(identity.to_string(), id) {
            if self.cancel(previous) {
                tracing::debug!(%identity, %previous, superseded_by = %id, "superseded preview job");
            }
        }
        id
    }

    /// Cancel a job that has not finished. Returns whether it was live.
    pub fn cancel(&self, id: JobId) -> bool {
        match self.states.get_mut(&id) {
            Some(mut state) if !state.is_finished() => {
                *state = JobState::Cancelled;
                true
            }
            _ => false,
        }
    }

    /// Cancel the live job for an identity, if there is one.
    pub fn cancel_identity(&self, identity: &str) -> Option<JobId> {
        let (_, id) = self.live.remove(identity)?;
        self.cancel(id).then_some(id)
    }

    pub fn cancel_all(&self) {
        let identities: Vec<String> = self.live.iter().map(|entry| entry.key().clone()).collect();
        for identity in identities {
            self.cancel_identity(&identity);
        }
    }

    pub fn state(&self, id: JobId) -> Option<JobState> {
        self.states.get(&id).map(|state| *state)
    }

    pub fn live_job(&self, identity: &str) -> Option<JobId> {
        self.live.get(identity).map(|id| *id)
    }

    /// Move a queued job to running. False if it was cancelled meanwhile.
    pub(crate) fn start(&self, id: JobId) -> bool {
        match self.states.get_mut(&id) {
            Some(mut state) if *state == JobState::Queued => {
                *state = JobState::Running;
                true
            }
            _ => false,
        }
    }

    /// Finish a running job, calling `publish` only if it is still live.
    ///
    /// `publish` runs while the job's state entry is held, which is what
    /// makes `cancel` linearizable with result delivery.
    pub(crate) fn finish(&self, job: &Job, outcome: JobState, publish: impl FnOnce()) -> bool {
        let Some(mut state) = self.states.get_mut(&job.id) else {
            return false;
        };
        if *state != JobState::Running {
            return false;
        }
        if self.live_job(&job.identity) != Some(job.id) {
            *state = JobState::Cancelled;
            return false;
        }

        publish();
        *state = outcome;
        self.live.remove_if(&job.identity, |_, live| *live == job.id);
        true
    }

    /// Mark a running job as cancelled without publishing.
    pub(crate) fn abandon(&self, id: JobId) {
        if let Some(mut state) = self.states.get_mut(&id) {
            if !state.is_finished() {
                *state = JobState::Cancelled;
            }
        }
    }

    /// Drop bookkeeping for finished jobs.
    pub fn prune_finished(&self) {
        self.states.retain(|_, state| !state.is_finished());
    }
}
