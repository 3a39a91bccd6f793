//! Recompute Scheduler
//!
//! The scheduler decides what to recompute and in which order.
//!
//! # Algorithm
//!
//! 1. Edits mark nodes pending and restart the debounce timer
//! 2. Once the timer expires, the pending set is flushed:
//!    - snapshot the live graph
//!    - extend the pending nodes with everything that reads them
//!    - drop every node caught in a cycle
//!    - order the rest so dependencies come first
//! 3. One job per node is dispatched in that order, superseding whatever job
//!    the node still had in flight
//!
//! Callers are expected to mark the ancestors a node had before an edit as
//! pending too, so that nodes which stopped depending on it are refreshed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexSet;

use crate::config::Environment;
use crate::error::WorkerStopped;
use crate::expr::StaticContext;
use crate::graph::{CalcNode, Cycles, DependencyGraph};

use super::job::JobId;

/// Where flushed jobs go.
pub trait JobSink {
    /// Queue a job for `identity`, superseding its previous one.
    fn submit(
        &mut self,
        identity: &str,
        node: CalcNode,
        valid: bool,
        env: Arc<Environment>,
    ) -> Result<JobId, WorkerStopped>;

    /// Cancel the live job for `identity`, if any.
    fn cancel(&mut self, identity: &str);
}

/// What a flush dispatched.
#[derive(Debug, Clone, Default)]
pub struct FlushReport {
    /// Dispatched nodes, in dispatch order.
    pub order: Vec<String>,

    /// Job ids, parallel to `order`.
    pub jobs: Vec<JobId>,

    /// Affected nodes left out because they are part of a cycle.
    pub skipped: Vec<String>,

    pub cycles: Cycles,
}

/// Debounced pending set plus the jobs currently in flight.
#[derive(Debug)]
pub struct RecomputeScheduler {
    debounce: Duration,
    pending: IndexSet<String>,
    deadline: Option<Instant>,
    computing: HashMap<String, JobId>,
}

impl RecomputeScheduler {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            pending: IndexSet::new(),
            deadline: None,
            computing: HashMap::new(),
        }
    }

    /// Mark a node pending and restart the debounce timer.
    pub fn on_invalidate(&mut self, name: &str) {
        self.on_invalidate_at(name, Instant::now());
    }

    pub fn on_invalidate_at(&mut self, name: &str, now: Instant) {
        self.pending.insert(name.to_string());
        self.deadline = Some(now + self.debounce);
    }

    pub fn on_invalidate_all<'a>(&mut self, names: impl IntoIterator<Item = &'a str>) {
        let now = Instant::now();
        for name in names {
            self.on_invalidate_at(name, now);
        }
    }

    /// Forget a node entirely, e.g. after it was removed.
    pub fn discard(&mut self, name: &str) {
        self.pending.shift_remove(name);
        self.computing.remove(name);
        if self.pending.is_empty() {
            self.deadline = None;
        }
    }

    /// Whether the debounce timer has expired with work pending.
    pub fn is_due(&self, now: Instant) -> bool {
        !self.pending.is_empty() && self.deadline.is_some_and(|deadline| now >= deadline)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_pending(&self, name: &str) -> bool {
        self.pending.contains(name)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Nothing pending and nothing in flight.
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.computing.is_empty()
    }

    pub fn pending(&self) -> impl Iterator<Item = &str> {
        self.pending.iter().map(String::as_str)
    }

    pub fn is_computing(&self, name: &str) -> bool {
        self.computing.contains_key(name)
    }

    /// The job currently in flight for `name`.
    pub fn current_job(&self, name: &str) -> Option<JobId> {
        self.computing.get(name).copied()
    }

    /// Record that `job` reported. Stale reports are ignored.
    pub fn complete(&mut self, name: &str, job: JobId) -> bool {
        if self.current_job(name) == Some(job) {
            self.computing.remove(name);
            true
        } else {
            false
        }
    }

    /// Dispatch jobs for the pending set and everything that reads it.
    pub fn flush(
        &mut self,
        graph: &DependencyGraph,
        ctx: &StaticContext,
        env: Arc<Environment>,
        sink: &mut impl JobSink,
    ) -> Result<FlushReport, WorkerStopped> {
        self.deadline = None;
        let queued = std::mem::take(&mut self.pending);
        if queued.is_empty() {
            return Ok(FlushReport::default());
        }

        let snapshot = graph.snapshot();

        let mut affected: HashSet<String> = HashSet::new();
        for name in &queued {
            if !snapshot.is_real(name) {
                continue;
            }
            affected.insert(name.clone());
            affected.extend(
                snapshot
                    .ancestor_calcs(name)
                    .into_iter()
                    .filter(|ancestor| snapshot.is_real(ancestor)),
            );
        }

        let cycles = snapshot.cycles();
        let excluded = cycles.members();
        let order = snapshot.topo_order(Some(&affected), &excluded);
        let validity = snapshot.validity(ctx);

        let mut skipped: Vec<String> = affected
            .iter()
            .filter(|name| excluded.contains(name.as_str()))
            .cloned()
            .collect();
        skipped.sort();
        for name in &skipped {
            sink.cancel(name);
            self.computing.remove(name);
        }

        let mut jobs = Vec::with_capacity(order.len());
        for name in &order {
            let Some(node) = snapshot.get(name) else {
                continue;
            };
            let valid = validity.get(name).copied().unwrap_or(false);
            let id = sink.submit(name, node.clone(), valid, env.clone())?;
            self.computing.insert(name.clone(), id);
            jobs.push(id);
        }

        tracing::debug!(
            queued = queued.len(),
            dispatched = order.len(),
            skipped = skipped.len(),
            "flushed pending calculations"
        );

        Ok(FlushReport {
            order,
            jobs,
            skipped,
            cycles,
        })
    }
}
