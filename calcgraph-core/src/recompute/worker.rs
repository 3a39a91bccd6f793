//! Preview Worker
//!
//! A single background thread that evaluates jobs in submission order.
//!
//! # Design
//! - Jobs and control messages share one FIFO channel, so forgetting a
//!   column is ordered with the jobs around it
//! - The worker owns the table of computed values; a job reads the values of
//!   its dependencies from it, which within one flush were produced by
//!   earlier jobs
//! - Every job that runs to completion publishes exactly one event; a
//!   cancelled or superseded job publishes nothing
//! - Dropping the handle detaches the thread; only [`PreviewWorker::stop`]
//!   waits for it

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::{self, Runtime};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::config::{EngineConfig, Environment};
use crate::error::{PreviewError, WorkerStopped};
use crate::expr::{bindings, Evaluator, Table, Value};
use crate::graph::CalcNode;

use super::job::{Job, JobId, JobRegistry, JobState};
use super::scheduler::JobSink;

/// Result of one completed preview job.
#[derive(Debug, Clone, PartialEq)]
pub struct PreviewEvent {
    pub identity: String,
    pub job_id: JobId,
    pub outcome: Result<Value, PreviewError>,

    /// Human readable lines, empty on success.
    pub diagnostics: Vec<String>,
}

enum Message {
    Run(Job),
    Forget(String),
    Shutdown,
}

/// Handle to the preview worker thread.
///
/// The blocking calls (`recv_timeout`, `stop`) must not be made from inside
/// an async runtime.
pub struct PreviewWorker {
    sender: UnboundedSender<Message>,
    events: Mutex<UnboundedReceiver<PreviewEvent>>,
    registry: Arc<JobRegistry>,
    handle: Mutex<Option<JoinHandle<()>>>,

    /// Drives timed waits on the event channel.
    timer: Option<Runtime>,
}

impl PreviewWorker {
    /// Start the worker thread.
    pub fn spawn(evaluator: Arc<dyn Evaluator>, config: &EngineConfig) -> std::io::Result<Self> {
        let (sender, inbox) = mpsc::unbounded_channel();
        let (event_sender, events) = mpsc::unbounded_channel();
        let registry = Arc::new(JobRegistry::new());
        let timer = runtime::Builder::new_current_thread().enable_time().build()?;

        let worker = WorkerLoop {
            evaluator,
            registry: registry.clone(),
            events: event_sender,
            values: HashMap::new(),
        };
        let handle = thread::Builder::new()
            .name(config.worker_thread_name.clone())
            .spawn(move || worker.run(inbox))?;

        Ok(Self {
            sender,
            events: Mutex::new(events),
            registry,
            handle: Mutex::new(Some(handle)),
            timer: Some(timer),
        })
    }

    /// Queue a job for `identity`, cancelling its previous live job.
    pub fn create_job(
        &self,
        identity: &str,
        node: CalcNode,
        valid: bool,
        env: Arc<Environment>,
    ) -> Result<JobId, WorkerStopped> {
        let id = self.registry.register(identity);
        let job = Job {
            id,
            identity: identity.to_string(),
            node,
            valid,
            env,
        };
        if self.sender.send(Message::Run(job)).is_err() {
            tracing::warn!(%identity, "preview worker channel closed");
            self.registry.cancel(id);
            return Err(WorkerStopped);
        }
        tracing::debug!(%identity, job = %id, "submitted preview job");
        Ok(id)
    }

    /// Cancel one job. A queued job is dropped unrun; a running one
    /// finishes but publishes nothing. False if it had already finished.
    pub fn cancel_job(&self, id: JobId) -> bool {
        let cancelled = self.registry.cancel(id);
        if cancelled {
            tracing::debug!(job = %id, "cancelled preview job");
        }
        cancelled
    }

    /// Cancel the live job for `identity`.
    pub fn cancel_identity(&self, identity: &str) -> Option<JobId> {
        let cancelled = self.registry.cancel_identity(identity);
        if let Some(id) = cancelled {
            tracing::debug!(%identity, job = %id, "cancelled preview job");
        }
        cancelled
    }

    pub fn cancel_all(&self) {
        self.registry.cancel_all();
    }

    /// Cancel pending work for a removed column and drop its stored value.
    pub fn forget_column(&self, identity: &str) -> Result<(), WorkerStopped> {
        self.cancel_identity(identity);
        self.sender
            .send(Message::Forget(identity.to_string()))
            .map_err(|_| WorkerStopped)
    }

    pub fn job_state(&self, id: JobId) -> Option<JobState> {
        self.registry.state(id)
    }

    pub fn live_job(&self, identity: &str) -> Option<JobId> {
        self.registry.live_job(identity)
    }

    pub(crate) fn prune_finished(&self) {
        self.registry.prune_finished();
    }

    /// Next published event, if one is ready.
    pub fn try_recv(&self) -> Option<PreviewEvent> {
        self.events.lock().try_recv().ok()
    }

    /// Every event published so far.
    pub fn drain_events(&self) -> Vec<PreviewEvent> {
        let mut events = self.events.lock();
        let mut drained = Vec::new();
        while let Ok(event) = events.try_recv() {
            drained.push(event);
        }
        drained
    }

    /// Block up to `timeout` for the next event.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<PreviewEvent> {
        let timer = self.timer.as_ref()?;
        let mut events = self.events.lock();
        timer.block_on(async {
            tokio::time::timeout(timeout, events.recv())
                .await
                .ok()
                .flatten()
        })
    }

    /// Cancel everything and ask the thread to exit after its current job.
    fn shutdown(&self) -> Option<JoinHandle<()>> {
        self.registry.cancel_all();
        let _ = self.sender.send(Message::Shutdown);
        self.handle.lock().take()
    }

    /// Cancel everything, stop the thread and wait for it to exit.
    pub fn stop(&self) {
        if let Some(handle) = self.shutdown() {
            if handle.join().is_err() {
                tracing::warn!("preview worker panicked");
            }
        }
    }
}

impl Drop for PreviewWorker {
    fn drop(&mut self) {
        // A stalled evaluation must not block the owner; the thread exits
        // on its own once the evaluator returns.
        if self.shutdown().is_some() {
            tracing::debug!("detached preview worker");
        }
        if let Some(timer) = self.timer.take() {
            timer.shutdown_background();
        }
    }
}

impl JobSink for PreviewWorker {
    fn submit(
        &mut self,
        identity: &str,
        node: CalcNode,
        valid: bool,
        env: Arc<Environment>,
    ) -> Result<JobId, WorkerStopped> {
        self.create_job(identity, node, valid, env)
    }

    fn cancel(&mut self, identity: &str) {
        self.cancel_identity(identity);
    }
}

struct WorkerLoop {
    evaluator: Arc<dyn Evaluator>,
    registry: Arc<JobRegistry>,
    events: UnboundedSender<PreviewEvent>,
    values: HashMap<String, Value>,
}

impl WorkerLoop {
    fn run(mut self, mut inbox: UnboundedReceiver<Message>) {
        tracing::debug!("preview worker started");
        while let Some(message) = inbox.blocking_recv() {
            match message {
                Message::Run(job) => self.process(job),
                Message::Forget(identity) => {
                    self.values.remove(&identity);
                }
                Message::Shutdown => break,
            }
        }
        tracing::debug!("preview worker stopped");
    }

    fn process(&mut self, job: Job) {
        if !self.registry.start(job.id) {
            tracing::trace!(identity = %job.identity, job = %job.id, "skipping cancelled job");
            return;
        }
        tracing::trace!(identity = %job.identity, job = %job.id, "running preview job");

        // Stale values must not feed dependents while this job is redone.
        self.values.remove(&job.identity);

        let outcome = self.compute(&job);
        if let Err(PreviewError::Evaluation(err)) = &outcome {
            if err.is_cancelled() {
                self.registry.abandon(job.id);
                return;
            }
        }

        let value = outcome.as_ref().ok().cloned();
        let state = if value.is_some() {
            JobState::Completed
        } else {
            JobState::Failed
        };
        let event = PreviewEvent {
            identity: job.identity.clone(),
            job_id: job.id,
            diagnostics: diagnostics(&job.node, &outcome),
            outcome,
        };

        let events = &self.events;
        let published = self.registry.finish(&job, state, || {
            if events.send(event).is_err() {
                tracing::warn!("preview event channel closed");
            }
        });
        if published {
            if let Some(value) = value {
                self.values.insert(job.identity, value);
            }
        }
    }

    fn compute(&self, job: &Job) -> Result<Value, PreviewError> {
        let node = &job.node;
        if node.is_empty() {
            return Err(PreviewError::Empty);
        }
        if !job.valid {
            return Err(PreviewError::Invalid);
        }

        let missing: Vec<String> = node
            .deps()
            .iter()
            .filter(|dep| !self.values.contains_key(dep.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(PreviewError::MissingDependencies {
                name: node.name().to_string(),
                missing,
            });
        }

        let results: Table = node
            .deps()
            .iter()
            .filter_map(|dep| self.values.get(dep).map(|value| (dep.clone(), value.clone())))
            .collect();
        let bindings = bindings(&job.env.globals, &job.env.input, results);
        Ok(self.evaluator.evaluate(node.expr(), &bindings)?)
    }
}

fn diagnostics(node: &CalcNode, outcome: &Result<Value, PreviewError>) -> Vec<String> {
    match outcome {
        Ok(_) => Vec::new(),
        Err(err @ PreviewError::Evaluation(_)) => {
            vec![err.to_string(), format!("  in {node}")]
        }
        Err(err) => vec![err.to_string()],
    }
}
