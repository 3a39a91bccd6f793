//! Calculation Model
//!
//! [`CalcModel`] is the façade hosts talk to. It owns the ordered list of
//! columns, keeps the dependency graph in sync with it, and drives the
//! scheduler and the preview worker.
//!
//! Columns that share a name are all flagged duplicate and none of them is
//! in the graph until the clash is resolved.
//!
//! # Example
//!
//! ```rust,ignore
//! use calcgraph_core::model::CalcModel;
//!
//! let mut model = CalcModel::with_builtin_evaluator(Environment::default())?;
//! let a = model.add("a", "1", true)?;
//! model.add("b", "res['a'] + 1", true)?;
//! model.wait_idle(Duration::from_secs(1))?;
//! assert_eq!(model.validate(), (true, String::new()));
//! ```

mod record;

pub use record::{trim_name, Attributes, CalcRecord, CalcRecords};

use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use indexmap::{IndexMap, IndexSet};
use regex::Regex;

use crate::config::{EngineConfig, Environment};
use crate::error::{GraphError, ModelError, PreviewError};
use crate::expr::{BuiltinEvaluator, Evaluator, StaticContext, Value};
use crate::graph::{CalcNode, DependencyGraph, NodeId};
use crate::recompute::{FlushReport, PreviewEvent, PreviewWorker, RecomputeScheduler};

/// One row of the model.
#[derive(Debug, Clone)]
pub struct Column {
    id: NodeId,
    node: CalcNode,
    attributes: Attributes,
    duplicate: bool,
    message: String,
    warned: bool,
    value: Option<Value>,
}

impl Column {
    fn new(node: CalcNode) -> Self {
        Self {
            id: NodeId::new(),
            node,
            attributes: Attributes::new(),
            duplicate: false,
            message: String::new(),
            warned: false,
            value: None,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        self.node.name()
    }

    pub fn expr(&self) -> &str {
        self.node.expr()
    }

    pub fn enabled(&self) -> bool {
        self.node.enabled()
    }

    pub fn node(&self) -> &CalcNode {
        &self.node
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn is_duplicate(&self) -> bool {
        self.duplicate
    }

    /// Names containing `=` cannot be saved.
    pub fn is_forbidden(&self) -> bool {
        self.name().contains('=')
    }

    /// Trailing whitespace in a name is legal but almost never intended.
    pub fn has_dangerous_name(&self) -> bool {
        self.name().ends_with(char::is_whitespace)
    }

    /// Last preview problem, `Calculating <name>: ...`, or empty.
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn warned(&self) -> bool {
        self.warned
    }

    /// Last previewed value.
    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    fn clear_preview(&mut self) {
        self.message.clear();
        self.warned = false;
        self.value = None;
    }
}

/// Notifications for the host.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    PreviewReady {
        id: NodeId,
        name: String,
        value: Option<Value>,
        diagnostics: Vec<String>,
    },
    ValidityChanged {
        id: NodeId,
        name: String,
        valid: bool,
    },
}

/// Ordered columns backed by a live dependency graph.
pub struct CalcModel {
    env: Arc<Environment>,
    ctx: StaticContext,
    builtins: Vec<&'static str>,
    columns: Vec<Column>,
    graph: DependencyGraph,
    scheduler: RecomputeScheduler,
    worker: PreviewWorker,
    validity: IndexMap<String, bool>,
    events: VecDeque<ModelEvent>,
}

impl CalcModel {
    pub fn new(
        evaluator: Arc<dyn Evaluator>,
        env: Environment,
        config: EngineConfig,
    ) -> Result<Self, ModelError> {
        let builtins = evaluator.builtins();
        let worker = PreviewWorker::spawn(evaluator, &config)?;
        Ok(Self {
            ctx: static_context(&builtins, &env),
            env: Arc::new(env),
            builtins,
            columns: Vec::new(),
            graph: DependencyGraph::new(),
            scheduler: RecomputeScheduler::new(config.debounce()),
            worker,
            validity: IndexMap::new(),
            events: VecDeque::new(),
        })
    }

    pub fn with_builtin_evaluator(env: Environment) -> Result<Self, ModelError> {
        Self::new(Arc::new(BuiltinEvaluator), env, EngineConfig::default())
    }

    pub fn environment(&self) -> &Environment {
        &self.env
    }

    /// Swap the environment and recompute everything.
    pub fn set_environment(&mut self, env: Environment) {
        self.ctx = static_context(&self.builtins, &env);
        self.env = Arc::new(env);
        self.refresh_validity();

        let names: Vec<String> = self.graph.calcs().map(|n| n.name().to_string()).collect();
        for name in &names {
            self.worker.cancel_identity(name);
        }
        self.scheduler.on_invalidate_all(names.iter().map(String::as_str));
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, id: NodeId) -> Option<&Column> {
        self.columns.iter().find(|column| column.id == id)
    }

    /// The column backing the graph node `name`.
    pub fn id_of(&self, name: &str) -> Option<NodeId> {
        self.columns
            .iter()
            .find(|column| !column.duplicate && column.name() == name)
            .map(Column::id)
    }

    fn index_of(&self, id: NodeId) -> Result<usize, ModelError> {
        self.columns
            .iter()
            .position(|column| column.id == id)
            .ok_or(ModelError::UnknownId(id))
    }

    fn ids_named(&self, name: &str, except: Option<NodeId>) -> Vec<NodeId> {
        self.columns
            .iter()
            .filter(|column| column.name() == name && Some(column.id) != except)
            .map(Column::id)
            .collect()
    }

    /// Append a column.
    pub fn add(&mut self, name: &str, expr: &str, enabled: bool) -> Result<NodeId, ModelError> {
        self.insert(self.columns.len(), name, expr, enabled)
    }

    /// Insert a column at `index` (clamped to the end).
    pub fn insert(
        &mut self,
        index: usize,
        name: &str,
        expr: &str,
        enabled: bool,
    ) -> Result<NodeId, ModelError> {
        let index = index.min(self.columns.len());
        let clashes = self.ids_named(name, None);
        let column = Column::new(CalcNode::new(name, expr, enabled));
        let id = column.id;
        let node = column.node.clone();
        self.columns.insert(index, column);

        if clashes.is_empty() {
            self.mutate(name, name, |graph| graph.add_calc(node))?;
        } else {
            for other in clashes {
                self.set_duplicate(other, true)?;
            }
            self.columns[index].duplicate = true;
        }
        tracing::debug!(%name, id = id.raw(), "added column");
        Ok(id)
    }

    pub fn remove(&mut self, id: NodeId) -> Result<(), ModelError> {
        let index = self.index_of(id)?;
        let column = self.columns.remove(index);
        let name = column.name();

        if column.duplicate {
            if let [survivor] = self.ids_named(name, None).as_slice() {
                self.set_duplicate(*survivor, false)?;
            }
        } else {
            self.mutate(name, name, |graph| graph.remove_calc(name).map(drop))?;
            self.forget(name)?;
        }
        tracing::debug!(%name, id = id.raw(), "removed column");
        Ok(())
    }

    pub fn rename(&mut self, id: NodeId, new_name: &str) -> Result<(), ModelError> {
        let index = self.index_of(id)?;
        let old = self.columns[index].name().to_string();
        if old == new_name {
            return Ok(());
        }
        let others_old = self.ids_named(&old, Some(id));
        let others_new = self.ids_named(new_name, Some(id));
        let was_duplicate = self.columns[index].duplicate;

        if !others_new.is_empty() {
            if !was_duplicate {
                self.mutate(&old, &old, |graph| graph.remove_calc(&old).map(drop))?;
                self.forget(&old)?;
            }
            let column = &mut self.columns[index];
            column.duplicate = true;
            column.node.set_name(new_name);
            column.clear_preview();
            for other in others_new {
                self.set_duplicate(other, true)?;
            }
        } else if was_duplicate {
            let column = &mut self.columns[index];
            column.duplicate = false;
            column.node.set_name(new_name);
            let node = column.node.clone();
            self.mutate(new_name, new_name, |graph| graph.add_calc(node))?;
        } else {
            self.mutate(&old, new_name, |graph| graph.rename_calc(&old, new_name))?;
            self.columns[index].node.set_name(new_name);
            self.forget(&old)?;
        }

        if let [survivor] = others_old.as_slice() {
            self.set_duplicate(*survivor, false)?;
        }
        tracing::debug!(%old, new = %new_name, "renamed column");
        Ok(())
    }

    pub fn set_expr(&mut self, id: NodeId, expr: &str) -> Result<(), ModelError> {
        let index = self.index_of(id)?;
        let column = &mut self.columns[index];
        column.node.set_expr(expr);
        if column.duplicate {
            return Ok(());
        }
        let name = column.name().to_string();
        self.mutate(&name, &name, |graph| graph.change_calc_expr(&name, expr))
    }

    pub fn set_enabled(&mut self, id: NodeId, enabled: bool) -> Result<(), ModelError> {
        let index = self.index_of(id)?;
        let column = &mut self.columns[index];
        column.node.set_enabled(enabled);
        if !column.duplicate {
            self.graph.set_enabled(column.node.name(), enabled)?;
        }
        Ok(())
    }

    pub fn set_attributes(&mut self, id: NodeId, attributes: Attributes) -> Result<(), ModelError> {
        let index = self.index_of(id)?;
        self.columns[index].attributes = attributes;
        Ok(())
    }

    /// Insert a copy right after `id`, named `<name> Copy <n>`.
    pub fn copy(&mut self, id: NodeId) -> Result<NodeId, ModelError> {
        let index = self.index_of(id)?;
        let source = &self.columns[index];
        let name = copy_name(source.name(), self.columns.iter().map(Column::name));
        let expr = source.expr().to_string();
        let enabled = source.enabled();
        let attributes = source.attributes.clone();

        let copy = self.insert(index + 1, &name, &expr, enabled)?;
        self.set_attributes(copy, attributes)?;
        Ok(copy)
    }

    /// Remove every column.
    pub fn clear(&mut self) -> Result<(), ModelError> {
        let ids: Vec<NodeId> = self.columns.iter().rev().map(Column::id).collect();
        for id in ids {
            self.remove(id)?;
        }
        Ok(())
    }

    fn set_duplicate(&mut self, id: NodeId, duplicate: bool) -> Result<(), ModelError> {
        let index = self.index_of(id)?;
        let column = &mut self.columns[index];
        if column.duplicate == duplicate {
            return Ok(());
        }
        column.duplicate = duplicate;
        let node = column.node.clone();
        let name = node.name().to_string();

        if duplicate {
            column.clear_preview();
            if self.graph.is_real(&name) {
                self.mutate(&name, &name, |graph| graph.remove_calc(&name).map(drop))?;
                self.forget(&name)?;
            }
        } else if !self.graph.is_real(&name) {
            self.mutate(&name, &name, |graph| graph.add_calc(node))?;
        }
        Ok(())
    }

    /// Apply a graph mutation and queue everything it affects.
    ///
    /// Ancestors are collected both before and after the change so that
    /// nodes which stopped reading `before` are refreshed too.
    fn mutate<T>(
        &mut self,
        before: &str,
        after: &str,
        change: impl FnOnce(&mut DependencyGraph) -> Result<T, GraphError>,
    ) -> Result<T, ModelError> {
        let mut affected: IndexSet<String> = self.graph.ancestor_calcs(before);
        let out = change(&mut self.graph)?;
        affected.insert(after.to_string());
        affected.extend(self.graph.ancestor_calcs(after));

        let affected: Vec<String> = affected
            .into_iter()
            .filter(|name| self.graph.is_real(name))
            .collect();
        for name in &affected {
            self.worker.cancel_identity(name);
            self.scheduler.on_invalidate(name);
        }
        self.refresh_validity();
        Ok(out)
    }

    fn forget(&mut self, name: &str) -> Result<(), ModelError> {
        self.worker.forget_column(name)?;
        self.scheduler.discard(name);
        Ok(())
    }

    fn refresh_validity(&mut self) {
        let current = self.graph.validity(&self.ctx);
        for (name, valid) in &current {
            if self.validity.get(name) == Some(valid) {
                continue;
            }
            if let Some(id) = self.id_of(name) {
                self.events.push_back(ModelEvent::ValidityChanged {
                    id,
                    name: name.clone(),
                    valid: *valid,
                });
            }
        }
        self.validity = current;
    }

    /// Globally valid: not a duplicate, statically valid, no cycle, and
    /// every dependency valid.
    pub fn is_valid(&self, id: NodeId) -> bool {
        self.column(id).is_some_and(|column| {
            !column.duplicate && self.validity.get(column.name()).copied().unwrap_or(false)
        })
    }

    pub fn is_pending(&self, id: NodeId) -> bool {
        self.column(id)
            .is_some_and(|column| !column.duplicate && self.scheduler.is_pending(column.name()))
    }

    pub fn is_computing(&self, id: NodeId) -> bool {
        self.column(id)
            .is_some_and(|column| !column.duplicate && self.scheduler.is_computing(column.name()))
    }

    /// Overall status: `(ok, message)`.
    ///
    /// Structural problems come first and make the model invalid. Otherwise
    /// the first preview message in dependency order is returned as a
    /// warning.
    pub fn validate(&self) -> (bool, String) {
        let cycles = self.graph.cycles();
        if !cycles.self_loops.is_empty() {
            return (
                false,
                format!(
                    "Cyclic dependencies to itself in: {}",
                    cycles.self_loops.join(", ")
                ),
            );
        }
        if !cycles.components.is_empty() {
            let groups: Vec<String> = cycles
                .components
                .iter()
                .map(|group| format!("{{{}}}", group.join(", ")))
                .collect();
            return (
                false,
                format!(
                    "Cyclic dependencies in the following groups: {}",
                    groups.join(", ")
                ),
            );
        }

        let mut invalid: Vec<&Column> = self
            .columns
            .iter()
            .filter(|c| !c.duplicate && !c.node.is_empty() && c.node.static_error(&self.ctx).is_some())
            .collect();
        invalid.sort_by(|a, b| a.name().cmp(b.name()));
        if let Some(column) = invalid.first() {
            return (false, column.node.exception(&self.ctx));
        }

        let forbidden = sorted_names(self.columns.iter().filter(|c| c.is_forbidden()));
        if !forbidden.is_empty() {
            return (
                false,
                format!("Forbidden calculation names: {}", forbidden.join(", ")),
            );
        }

        let duplicates = sorted_names(self.columns.iter().filter(|c| c.duplicate));
        if !duplicates.is_empty() {
            return (
                false,
                format!("Duplicate calculation names: {}", duplicates.join(", ")),
            );
        }

        let mut calcs: Vec<&CalcNode> = self.graph.calcs().collect();
        calcs.sort_by(|a, b| a.name().cmp(b.name()));
        for node in calcs {
            let missing: Vec<&str> = self
                .graph
                .successor_calcs(node.name())
                .into_iter()
                .filter(|dep| self.graph.get(dep).is_some_and(CalcNode::is_missing))
                .collect();
            if !missing.is_empty() {
                return (
                    false,
                    format!(
                        "Missing dependencies of {}: {}",
                        node.name(),
                        missing.join(", ")
                    ),
                );
            }
        }

        let message = self
            .graph
            .topological_sort()
            .iter()
            .filter_map(|name| self.id_of(name).and_then(|id| self.column(id)))
            .map(|column| column.message.as_str())
            .find(|message| !message.is_empty())
            .unwrap_or_default();
        (true, message.to_string())
    }

    /// Columns to evaluate for output, in dependency order.
    ///
    /// Disabled columns are included only when an enabled column reads them.
    pub fn topo_order_for_output(&self) -> Vec<NodeId> {
        self.graph
            .topological_sort()
            .iter()
            .filter(|name| self.graph.node_enabled_ancestors(name))
            .filter_map(|name| self.id_of(name))
            .collect()
    }

    /// Apply finished previews and flush if the debounce timer expired.
    pub fn tick(&mut self) -> Result<Option<FlushReport>, ModelError> {
        self.pump();
        if self.scheduler.is_due(Instant::now()) {
            return self.flush_now().map(Some);
        }
        Ok(None)
    }

    /// Flush pending work immediately, ignoring the debounce timer.
    pub fn flush_now(&mut self) -> Result<FlushReport, ModelError> {
        let report = self.scheduler.flush(
            &self.graph,
            &self.ctx,
            self.env.clone(),
            &mut self.worker,
        )?;
        for name in &report.skipped {
            if let Some(index) = self
                .columns
                .iter()
                .position(|c| !c.duplicate && c.name() == name.as_str())
            {
                self.columns[index].clear_preview();
            }
        }
        Ok(report)
    }

    /// Apply every preview event the worker has published. Returns how many
    /// were received.
    pub fn pump(&mut self) -> usize {
        let events = self.worker.drain_events();
        let received = events.len();
        for event in events {
            self.apply(event);
        }
        if received > 0 {
            self.worker.prune_finished();
        }
        received
    }

    /// Pump the worker and hand out queued notifications.
    pub fn poll_events(&mut self) -> Vec<ModelEvent> {
        self.pump();
        self.events.drain(..).collect()
    }

    /// Flush and pump until nothing is pending or in flight.
    ///
    /// Returns false if `timeout` elapsed first.
    pub fn wait_idle(&mut self, timeout: Duration) -> Result<bool, ModelError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.scheduler.has_pending() {
                self.flush_now()?;
            }
            self.pump();
            if self.scheduler.is_idle() {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            if let Some(event) = self.worker.recv_timeout(deadline - now) {
                self.apply(event);
                self.worker.prune_finished();
            }
        }
    }

    fn apply(&mut self, event: PreviewEvent) {
        if !self.scheduler.complete(&event.identity, event.job_id) {
            tracing::trace!(identity = %event.identity, job = %event.job_id, "dropping stale preview");
            return;
        }
        let Some(column) = self
            .columns
            .iter_mut()
            .find(|c| !c.duplicate && c.name() == event.identity)
        else {
            return;
        };

        column.warned = !event.diagnostics.is_empty() && !column.node.is_empty();
        column.message = match (&event.outcome, event.diagnostics.first()) {
            (Err(PreviewError::Empty | PreviewError::Invalid), _) => String::new(),
            (Err(_), Some(first)) => format!("Calculating {}: {}", column.name(), first),
            _ => String::new(),
        };
        column.value = event.outcome.ok();

        self.events.push_back(ModelEvent::PreviewReady {
            id: column.id,
            name: event.identity,
            value: column.value.clone(),
            diagnostics: event.diagnostics,
        });
    }

    /// Replace every column with the saved ones.
    pub fn load(&mut self, records: &CalcRecords) -> Result<(), ModelError> {
        let parsed = records.parse()?;
        self.clear()?;
        for (index, record) in parsed.into_iter().enumerate() {
            let id = self.add(&record.name, &record.expr, record.enabled)?;
            if let Some(attributes) = records.attributes.get(&index) {
                self.set_attributes(id, attributes.clone())?;
            }
        }
        Ok(())
    }

    pub fn save(&self) -> CalcRecords {
        let calcs = self
            .columns
            .iter()
            .map(|c| CalcRecord::new(c.name(), c.expr(), c.enabled()).to_string())
            .collect();
        let attributes = self
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.attributes.is_empty())
            .map(|(index, c)| (index, c.attributes.clone()))
            .collect();
        CalcRecords { calcs, attributes }
    }
}

fn static_context(builtins: &[&'static str], env: &Environment) -> StaticContext {
    let mut ctx = StaticContext::new(builtins.iter().copied());
    ctx.extend(env.globals.keys().cloned());
    ctx
}

fn sorted_names<'a>(columns: impl Iterator<Item = &'a Column>) -> Vec<&'a str> {
    let mut names: Vec<&str> = columns.map(Column::name).collect();
    names.sort_unstable();
    names.dedup();
    names
}

/// `<base> Copy <n>` with the smallest `n` not already taken.
fn copy_name<'a>(name: &str, existing: impl Iterator<Item = &'a str>) -> String {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(r"^(.* Copy) ([0-9]+)$").expect("copy name pattern is a valid regex"));

    let base = match pattern.captures(name) {
        Some(captures) => captures[1].to_string(),
        None => format!("{name} Copy"),
    };

    let mut taken: Vec<u64> = existing
        .filter_map(|other| pattern.captures(other))
        .filter(|captures| captures[1] == *base)
        .filter_map(|captures| captures[2].parse().ok())
        .collect();
    taken.sort_unstable();
    taken.dedup();

    let mut next = 0;
    for n in taken {
        if n != next {
            break;
        }
        next += 1;
    }
    format!("{base} {next}")
}
