//! Integration Tests for the Recompute Engine
//!
//! These tests drive the model, the graph and the preview worker together.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use proptest::prelude::*;

use calcgraph_core::config::{EngineConfig, Environment};
use calcgraph_core::error::EvalError;
use calcgraph_core::expr::{Bindings, BuiltinEvaluator, Evaluator, Table, Value};
use calcgraph_core::graph::{CalcNode, DependencyGraph, NodeKind};
use calcgraph_core::model::{CalcModel, CalcRecords, ModelEvent};

const WAIT: Duration = Duration::from_secs(5);

fn config() -> EngineConfig {
    EngineConfig {
        debounce_ms: 0,
        ..EngineConfig::default()
    }
}

fn model() -> CalcModel {
    CalcModel::new(Arc::new(BuiltinEvaluator), Environment::default(), config()).unwrap()
}

fn previews(events: &[ModelEvent], column: &str) -> Vec<Option<Value>> {
    events
        .iter()
        .filter_map(|event| match event {
            ModelEvent::PreviewReady { name, value, .. } if name == column => Some(value.clone()),
            _ => None,
        })
        .collect()
}

/// Builtin evaluator that blocks while the gate is closed.
struct GatedEvaluator {
    open: Mutex<bool>,
    opened: Condvar,
    started: AtomicUsize,
}

impl GatedEvaluator {
    fn new() -> Self {
        Self {
            open: Mutex::new(true),
            opened: Condvar::new(),
            started: AtomicUsize::new(0),
        }
    }

    fn close(&self) {
        *self.open.lock() = false;
    }

    fn open(&self) {
        *self.open.lock() = true;
        self.opened.notify_all();
    }

    fn wait_started(&self, count: usize) {
        let deadline = Instant::now() + WAIT;
        while self.started.load(Ordering::SeqCst) < count {
            assert!(Instant::now() < deadline, "evaluation never started");
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

impl Evaluator for GatedEvaluator {
    fn evaluate(&self, source: &str, bindings: &Bindings) -> Result<Value, EvalError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let mut open = self.open.lock();
        while !*open {
            self.opened.wait(&mut open);
        }
        drop(open);
        BuiltinEvaluator.evaluate(source, bindings)
    }

    fn builtins(&self) -> Vec<&'static str> {
        BuiltinEvaluator.builtins()
    }
}

#[test]
fn editing_root_recomputes_chain_in_order() {
    let mut model = model();
    let a = model.add("a", "1", true).unwrap();
    let b = model.add("b", "res['a'] + 1", true).unwrap();
    let c = model.add("c", "res['b'] + 1", true).unwrap();
    model.add("unrelated", "7", true).unwrap();
    assert!(model.wait_idle(WAIT).unwrap());
    model.poll_events();

    model.set_expr(a, "10").unwrap();
    let report = model.flush_now().unwrap();
    assert_eq!(report.order, vec!["a", "b", "c"]);

    assert!(model.wait_idle(WAIT).unwrap());
    assert_eq!(model.column(b).unwrap().value(), Some(&Value::Number(11.0)));
    assert_eq!(model.column(c).unwrap().value(), Some(&Value::Number(12.0)));

    let events = model.poll_events();
    assert!(previews(&events, "unrelated").is_empty());
}

#[test]
fn three_node_cycle_has_no_order() {
    let mut graph = DependencyGraph::new();
    graph.add_calc(CalcNode::new("x", "res['y']", true)).unwrap();
    graph.add_calc(CalcNode::new("y", "res['z']", true)).unwrap();
    graph.add_calc(CalcNode::new("z", "res['x']", true)).unwrap();

    let cycles = graph.cycles();
    assert_eq!(cycles.components, vec![vec!["x", "y", "z"]]);
    assert!(cycles.self_loops.is_empty());
    assert!(graph.topological_sort().is_empty());
}

#[test]
fn mutual_reference_is_one_cycle_and_self_reference_is_separate() {
    let mut model = model();
    model.add("a", "res['b']", true).unwrap();
    model.add("b", "res['a']", true).unwrap();

    let cycles = model.graph().cycles();
    assert_eq!(cycles.components, vec![vec!["a", "b"]]);
    assert!(cycles.self_loops.is_empty());
    assert_eq!(
        model.validate(),
        (
            false,
            "Cyclic dependencies in the following groups: {a, b}".to_string()
        )
    );

    let mut model = self::model();
    model.add("a", "res['a']", true).unwrap();
    let cycles = model.graph().cycles();
    assert_eq!(cycles.self_loops, vec!["a"]);
    assert!(cycles.components.is_empty());
    assert_eq!(
        model.validate(),
        (false, "Cyclic dependencies to itself in: a".to_string())
    );
}

#[test]
fn missing_placeholder_is_replaced_without_losing_edges() {
    let mut model = model();
    let a = model.add("a", "res['x'] * 2", true).unwrap();
    assert_eq!(model.graph().get("x").map(CalcNode::kind), Some(NodeKind::Missing));
    assert!(!model.is_valid(a));

    model.add("x", "21", true).unwrap();
    assert_eq!(model.graph().get("x").map(CalcNode::kind), Some(NodeKind::Real));
    assert_eq!(model.graph().successor_calcs("a"), vec!["x"]);
    assert!(model.is_valid(a));

    assert!(model.wait_idle(WAIT).unwrap());
    assert_eq!(model.column(a).unwrap().value(), Some(&Value::Number(42.0)));
}

#[test]
fn rename_rewires_referrers() {
    let mut model = model();
    let a = model.add("a", "1", true).unwrap();
    model.add("b", "res['a'] + 1", true).unwrap();

    // Referrers of the old name keep a placeholder.
    model.rename(a, "z").unwrap();
    assert_eq!(model.graph().get("a").map(CalcNode::kind), Some(NodeKind::Missing));
    assert!(model.graph().is_real("z"));

    // Renaming back replaces the placeholder, leaving no orphan behind.
    model.rename(a, "a").unwrap();
    assert!(model.graph().is_real("a"));
    assert!(!model.graph().contains("z"));
    assert_eq!(model.graph().predecessor_calcs("a"), vec!["b"]);
    assert_eq!(model.validate(), (true, String::new()));
}

#[test]
fn superseded_edit_reports_once() {
    let evaluator = Arc::new(GatedEvaluator::new());
    let mut model = CalcModel::new(evaluator.clone(), Environment::default(), config()).unwrap();
    let a = model.add("a", "1", true).unwrap();
    assert!(model.wait_idle(WAIT).unwrap());
    model.poll_events();
    let started = evaluator.started.load(Ordering::SeqCst);

    evaluator.close();
    model.set_expr(a, "2").unwrap();
    model.flush_now().unwrap();
    evaluator.wait_started(started + 1);

    // The first job is stuck in the evaluator when it is superseded.
    model.set_expr(a, "3").unwrap();
    model.flush_now().unwrap();
    evaluator.open();

    assert!(model.wait_idle(WAIT).unwrap());
    let events = model.poll_events();
    assert_eq!(previews(&events, "a"), vec![Some(Value::Number(3.0))]);
}

#[test]
fn removed_dependency_is_reported_as_missing() {
    let mut model = model();
    let a = model.add("a", "1", true).unwrap();
    let b = model.add("b", "res['a'] + 1", true).unwrap();
    assert!(model.wait_idle(WAIT).unwrap());

    model.remove(a).unwrap();
    assert!(model.wait_idle(WAIT).unwrap());
    assert_eq!(model.column(b).unwrap().value(), None);
    assert_eq!(
        model.validate(),
        (false, "Missing dependencies of b: a".to_string())
    );
}

#[test]
fn environment_is_bound_for_every_calculation() {
    let input: Table = [("x", Value::from(vec![1.0, 2.0, 3.0]))].into_iter().collect();
    let env = Environment::new(input).with_global("scale", Value::Number(10.0));
    let mut model = CalcModel::new(Arc::new(BuiltinEvaluator), env, config()).unwrap();

    let scaled = model.add("scaled", "arg['x'] * scale", true).unwrap();
    let total = model.add("total", "sum(res['scaled'])", true).unwrap();
    assert!(model.wait_idle(WAIT).unwrap());

    assert_eq!(
        model.column(scaled).unwrap().value(),
        Some(&Value::from(vec![10.0, 20.0, 30.0]))
    );
    assert_eq!(model.column(total).unwrap().value(), Some(&Value::Number(60.0)));
}

#[test]
fn save_then_load_round_trips() {
    let mut model = model();
    let a = model.add("a", "1", true).unwrap();
    model.add("b", "res['a'] + 1", false).unwrap();
    model.add("c", "", true).unwrap();
    model.add("d ", "res['a']\n  * 2\n", true).unwrap();
    model
        .set_attributes(a, vec![("unit".into(), serde_json::json!("kg"))])
        .unwrap();

    let saved = model.save();
    assert_eq!(
        saved.calcs,
        vec![
            "a = 1 #ENABLED:1",
            "b = res['a'] + 1 #ENABLED:0",
            "c =  #ENABLED:1",
            "d  = res['a']\n  * 2\n #ENABLED:1"
        ]
    );

    let json = saved.to_json().unwrap();
    let mut restored = self::model();
    restored.load(&CalcRecords::from_json(&json).unwrap()).unwrap();
    assert_eq!(restored.save(), saved);

    let fields = |model: &CalcModel| -> Vec<(String, String, bool)> {
        model
            .columns()
            .iter()
            .map(|c| (c.name().to_string(), c.expr().to_string(), c.enabled()))
            .collect()
    };
    assert_eq!(fields(&restored), fields(&model));
    assert_eq!(restored.columns()[3].name(), "d ");
}

#[test]
fn load_normalises_legacy_names() {
    let records = CalcRecords {
        calcs: vec!["${a} = 1".into(), "res.col(b) = res['a'] #ENABLED:0".into()],
        ..CalcRecords::default()
    };
    let mut model = model();
    model.load(&records).unwrap();

    let names: Vec<&str> = model.columns().iter().map(|c| c.name()).collect();
    assert_eq!(names, vec!["a", "b"]);
    assert!(model.columns()[0].enabled());
    assert!(!model.columns()[1].enabled());
}

#[test]
fn readding_same_calculation_keeps_graph_shape() {
    let mut graph = DependencyGraph::new();
    graph.add_calc(CalcNode::new("a", "1", true)).unwrap();
    graph.add_calc(CalcNode::new("b", "res['a'] + res['c']", true)).unwrap();
    let nodes: Vec<CalcNode> = graph.nodes().cloned().collect();
    let edges = graph.edge_count();

    assert!(graph.add_calc(CalcNode::new("b", "res['a'] + res['c']", true)).is_err());
    let removed = graph.remove_calc("b").unwrap();
    graph.add_calc(removed).unwrap();

    let mut after: Vec<CalcNode> = graph.nodes().cloned().collect();
    let mut before = nodes;
    before.sort_by(|x, y| x.name().cmp(y.name()));
    after.sort_by(|x, y| x.name().cmp(y.name()));
    assert_eq!(after, before);
    assert_eq!(graph.edge_count(), edges);
}

fn acyclic_graph() -> impl Strategy<Value = Vec<(String, Vec<usize>)>> {
    // Node i may only read nodes with a smaller index; insertion order is
    // shuffled so placeholders get exercised too.
    (1usize..24)
        .prop_flat_map(|n| {
            let deps = (0..n)
                .map(|i| proptest::collection::vec(0..i.max(1), 0..=i.min(3)))
                .collect::<Vec<_>>();
            (deps, Just((0..n).collect::<Vec<usize>>()).prop_shuffle())
        })
        .prop_map(|(deps, order)| {
            order
                .into_iter()
                .map(|i| (format!("n{i}"), deps[i].clone()))
                .collect()
        })
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 128,
        failure_persistence: None,
        .. ProptestConfig::default()
    })]

    #[test]
    fn topological_order_respects_dependencies(calcs in acyclic_graph()) {
        let mut graph = DependencyGraph::new();
        for (name, deps) in &calcs {
            let expr = if deps.is_empty() {
                "1".to_string()
            } else {
                deps.iter()
                    .map(|d| format!("res['n{d}']"))
                    .collect::<Vec<_>>()
                    .join(" + ")
            };
            graph.add_calc(CalcNode::new(name.as_str(), expr, true)).unwrap();
        }

        let order = graph.topological_sort();
        prop_assert_eq!(order.len(), calcs.len());
        let unique: HashSet<&String> = order.iter().collect();
        prop_assert_eq!(unique.len(), order.len());

        let position = |name: &str| order.iter().position(|n| n == name);
        for (name, deps) in &calcs {
            for d in deps {
                let dep = format!("n{d}");
                prop_assert!(position(&dep) < position(name));
            }
        }
    }
}
