//! End-to-end behaviour of the engine: deduplication, pruning, skip
//! propagation, live constraints, resources and the trampoline.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use flow_engine::constraints::{task_scope, GLOBAL_SCOPE};
use flow_engine::hashing::hash_call;
use flow_engine::{
    Arg, Constraint, Engine, EngineConfig, EngineError, Extensions, LazyCall, LocalBroker,
    MemoryStore, Outcome, PubSubConnector, ResultStore, RetryPolicy, Router, RunOptions,
    SolverKind, StrategyKind, TaskDef, VecEventSink, WorkflowEvent,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Task returning its first argument, counting executions
fn echo(name: &str, counter: &Arc<AtomicU32>) -> Arc<TaskDef> {
    let counter = Arc::clone(counter);
    Arc::new(TaskDef::new(name, move |args| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Outcome::Value(args.arg(0).cloned().unwrap_or(Value::Null)))
        }
    }))
}

fn sleeper(name: &str, millis: u64) -> Arc<TaskDef> {
    Arc::new(TaskDef::new(name, move |args| async move {
        tokio::time::sleep(Duration::from_millis(millis)).await;
        Ok(Outcome::Value(args.kwarg("x").cloned().unwrap_or(Value::Null)))
    }))
}

/// Sums `1..=n` through `n` tail calls
fn countdown() -> Arc<TaskDef> {
    Arc::new(
        TaskDef::new("countdown", |args| async move {
            let n = args.i64_arg(0)?;
            let acc = args.i64_arg(1)?;
            if n == 0 {
                return Ok(Outcome::value(acc));
            }
            Ok(Outcome::TailCall(args.task().apply([n - 1, acc + n])))
        })
        .with_tail_calls(["countdown"]),
    )
}

/// Result store that records the largest size it ever reached
#[derive(Default)]
struct TrackingStore {
    inner: MemoryStore,
    peak: AtomicUsize,
}

impl TrackingStore {
    async fn track(&self) -> flow_engine::Result<()> {
        let len = self.inner.len().await?;
        self.peak.fetch_max(len, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl ResultStore for TrackingStore {
    async fn has_result(&self, node_id: &str) -> flow_engine::Result<bool> {
        self.inner.has_result(node_id).await
    }

    async fn get_result(&self, node_id: &str) -> flow_engine::Result<Option<Value>> {
        self.inner.get_result(node_id).await
    }

    async fn put_result(&self, node_id: &str, value: Value) -> flow_engine::Result<()> {
        self.inner.put_result(node_id, value).await?;
        self.track().await
    }

    async fn mark_skipped(&self, node_id: &str, reason: &str) -> flow_engine::Result<()> {
        self.inner.mark_skipped(node_id, reason).await?;
        self.track().await
    }

    async fn get_skip_reason(&self, node_id: &str) -> flow_engine::Result<Option<String>> {
        self.inner.get_skip_reason(node_id).await
    }

    async fn clear(&self) -> flow_engine::Result<()> {
        self.inner.clear().await
    }

    async fn len(&self) -> flow_engine::Result<usize> {
        self.inner.len().await
    }
}

#[test]
fn test_same_shape_yields_identical_node() {
    init_logging();
    let engine = Engine::builder().build();
    let counter = Arc::new(AtomicU32::new(0));
    let f = echo("f", &counter);

    let first = engine
        .build_graph(&f.call().arg(&f.apply([1])).arg("x").build())
        .unwrap();
    let second = engine
        .build_graph(&f.call().arg(&f.apply([1])).arg("x").build())
        .unwrap();
    assert!(Arc::ptr_eq(
        first.node(first.target()).unwrap(),
        second.node(second.target()).unwrap()
    ));
    assert_eq!(engine.registry().len(), 2);
}

#[test]
fn test_template_hash_ignores_literal_values_not_arity() {
    let counter = Arc::new(AtomicU32::new(0));
    let f = echo("f", &counter);
    let none = HashMap::new();

    let one = hash_call(&f.apply([1]), &none).unwrap();
    let two = hash_call(&f.apply([2]), &none).unwrap();
    let pair = hash_call(&f.apply([1, 2]), &none).unwrap();

    assert_eq!(one.template, two.template);
    assert_ne!(one.structural, two.structural);
    assert_ne!(one.template, pair.template);
}

#[tokio::test]
async fn test_unselected_branch_is_pruned_transitively() {
    init_logging();
    let events = Arc::new(VecEventSink::new());
    let engine = Engine::builder().with_event_sink(events.clone()).build();

    let selected_runs = Arc::new(AtomicU32::new(0));
    let pruned_runs = Arc::new(AtomicU32::new(0));
    let pick = echo("pick", &Arc::new(AtomicU32::new(0)));
    let branch_a = echo("branch_a", &selected_runs);
    let feeder = echo("feeder", &pruned_runs);
    let branch_c = echo("branch_c", &pruned_runs);
    let consume = echo("consume", &Arc::new(AtomicU32::new(0)));

    let selector = pick.apply(["a"]);
    let a = branch_a.apply(["from a"]);
    let b = feeder.apply(["from b"]);
    let c = branch_c.call().arg(&b).build();
    let target = consume
        .call()
        .arg(Router::new(&selector).route("a", &a).route("c", &c))
        .build();

    let store = Arc::new(MemoryStore::new());
    let value = engine
        .run_with(&target, RunOptions::new().with_store(store.clone()))
        .await
        .unwrap();
    assert_eq!(value, json!("from a"));
    assert_eq!(selected_runs.load(Ordering::SeqCst), 1);
    assert_eq!(pruned_runs.load(Ordering::SeqCst), 0);

    let graph = engine.build_graph(&target).unwrap();
    let mut expected = HashSet::new();
    for call in [&b, &c] {
        let id = &graph.instance_map()[&call.id()];
        assert_eq!(
            store.get_skip_reason(id).await.unwrap().as_deref(),
            Some("Pruned")
        );
        expected.insert(id.clone());
    }
    let pruned: HashSet<String> = events
        .events()
        .iter()
        .filter(|e| matches!(e, WorkflowEvent::TaskSkipped { reason, .. } if reason == "Pruned"))
        .filter_map(|e| e.task_id().map(str::to_string))
        .collect();
    assert_eq!(pruned, expected);
}

#[tokio::test]
async fn test_nested_router_keeps_branch_another_consumer_needs() {
    init_logging();
    let counter = Arc::new(AtomicU32::new(0));
    let first_pick = echo("first_pick", &counter);
    let second_pick = echo("second_pick", &counter);
    let branch_a = echo("branch_a", &counter);
    let branch_b = echo("branch_b", &counter);
    let inner = echo("inner", &counter);
    let fallback = echo("fallback", &counter);
    let reuse = echo("reuse", &counter);
    let pair = Arc::new(TaskDef::new("pair", |args| async move {
        Ok(Outcome::Value(Value::Array(args.args.clone())))
    }));

    let s1 = first_pick.apply(["a"]);
    // Echoes "a", which the outer router has no route for.
    let s2 = second_pick.call().arg(&s1).build();
    let b = branch_b.apply(["B"]);
    let x = inner
        .call()
        .arg(Router::new(&s1).route("a", &branch_a.apply(["A"])).route("b", &b))
        .build();
    let target = pair
        .call()
        .arg(Router::new(&s2).route("x", &x).otherwise(&fallback.apply(["Z"])))
        .arg(&reuse.call().arg(&b).build())
        .build();

    let engine = Engine::builder().build();
    let store = Arc::new(MemoryStore::new());
    let value = engine
        .run_with(&target, RunOptions::new().with_store(store.clone()))
        .await
        .unwrap();
    assert_eq!(value, json!(["Z", "B"]));

    let graph = engine.build_graph(&target).unwrap();
    let b_id = &graph.instance_map()[&b.id()];
    let x_id = &graph.instance_map()[&x.id()];
    assert_eq!(store.get_skip_reason(b_id).await.unwrap(), None);
    assert_eq!(
        store.get_skip_reason(x_id).await.unwrap().as_deref(),
        Some("Pruned")
    );
}

#[tokio::test]
async fn test_after_orders_without_passing_data() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let recorder = |name: &'static str, millis: u64| {
        let log = Arc::clone(&log);
        Arc::new(TaskDef::new(name, move |args| {
            let log = Arc::clone(&log);
            async move {
                tokio::time::sleep(Duration::from_millis(millis)).await;
                log.lock().push(name);
                Ok(Outcome::Value(Value::from(args.args.len())))
            }
        }))
    };
    let setup = recorder("setup", 30);
    let work = recorder("work", 0);

    let target = work.apply([1]).after(&setup.apply([1]));
    let value = Engine::builder().build().run(&target).await.unwrap();
    assert_eq!(value, json!(1));
    assert_eq!(*log.lock(), vec!["setup", "work"]);
}

#[tokio::test]
async fn test_skip_propagates_through_sequence_source() {
    let counter = Arc::new(AtomicU32::new(0));
    let later_runs = Arc::new(AtomicU32::new(0));
    let flag = echo("flag", &counter);
    let setup = echo("setup", &counter);
    let later = echo("later", &later_runs);

    let gated = setup.apply([1]).run_if(&flag.apply([false]));
    let target = later.apply([2]).after(&gated);

    let engine = Engine::builder().build();
    let store = Arc::new(MemoryStore::new());
    let value = engine
        .run_with(&target, RunOptions::new().with_store(store.clone()))
        .await
        .unwrap();
    assert_eq!(value, Value::Null);
    assert_eq!(later_runs.load(Ordering::SeqCst), 0);

    let graph = engine.build_graph(&target).unwrap();
    let reason = store
        .get_skip_reason(graph.target())
        .await
        .unwrap()
        .unwrap_or_default();
    assert!(reason.starts_with("Upstream skipped"), "{reason}");
}

#[tokio::test]
async fn test_jump_selector_reaches_the_task() {
    let counter = Arc::new(AtomicU32::new(0));
    let pick = echo("pick", &counter);
    let branch = Arc::new(TaskDef::new("branch", |args| async move {
        Ok(Outcome::Value(args.jump.clone().unwrap_or(Value::Null)))
    }));

    let target = branch.apply([1]).jump_to(&pick.apply(["left"]));
    let value = Engine::builder().build().run(&target).await.unwrap();
    assert_eq!(value, json!("left"));
}

#[tokio::test]
async fn test_dynamic_resource_amount_is_enforced() {
    init_logging();
    let engine = Engine::builder().with_capacity("slots", 2).build();
    let counter = Arc::new(AtomicU32::new(0));
    let amount = echo("amount", &counter);
    let job = sleeper("job", 40);
    let pair = Arc::new(TaskDef::new("pair", |args| async move {
        Ok(Outcome::Value(Value::Array(args.args.clone())))
    }));

    let needs = amount.apply([2]);
    let target = pair
        .call()
        .arg(&job.call().kwarg("x", 1).build().with_resource("slots", &needs))
        .arg(&job.call().kwarg("x", 2).build().with_resource("slots", &needs))
        .build();
    let started = Instant::now();
    assert_eq!(engine.run(&target).await.unwrap(), json!([1, 2]));
    assert!(started.elapsed() >= Duration::from_millis(75));
    assert_eq!(engine.resources().in_use("slots"), 0);

    let bad = job
        .call()
        .kwarg("x", 3)
        .build()
        .with_resource("slots", &amount.apply(["two"]));
    assert!(matches!(
        engine.run(&bad).await,
        Err(EngineError::ExecutionFailed(_))
    ));
}

#[tokio::test]
async fn test_skipped_node_is_read_through_to_its_data_source() {
    init_logging();
    let counter = Arc::new(AtomicU32::new(0));
    let source = echo("source", &counter);
    let flag = echo("flag", &counter);
    let double = Arc::new(TaskDef::new("double", |args| async move {
        Ok(Outcome::value(args.i64_arg(0)? * 2))
    }));
    let inc = Arc::new(TaskDef::new("inc", |args| async move {
        Ok(Outcome::value(args.i64_arg(0)? + 1))
    }));

    let a = source.apply([5]);
    let b = double.call().arg(&a).build().run_if(&flag.apply([false]));
    let c = inc.call().arg(&b).build();

    let engine = Engine::builder().build();
    let store = Arc::new(MemoryStore::new());
    let value = engine
        .run_with(&c, RunOptions::new().with_store(store.clone()))
        .await
        .unwrap();
    assert_eq!(value, json!(6));

    let graph = engine.build_graph(&c).unwrap();
    let b_id = &graph.instance_map()[&b.id()];
    assert_eq!(
        store.get_skip_reason(b_id).await.unwrap().as_deref(),
        Some("Condition false")
    );
}

#[tokio::test]
async fn test_skipped_target_yields_null() {
    let counter = Arc::new(AtomicU32::new(0));
    let f = echo("f", &counter);
    let engine = Engine::builder().build();
    let value = engine
        .run(&f.apply([1]).run_if(&f.apply([0])))
        .await
        .unwrap();
    assert_eq!(value, Value::Null);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_concurrency_limit_serializes_fan_out() {
    init_logging();
    let engine = Engine::builder().build();
    engine
        .constraints()
        .update_constraint(Constraint::new(
            task_scope("sleepy"),
            "concurrency",
            json!({"limit": 1}),
        ))
        .unwrap();

    let sleepy = sleeper("sleepy", 50);
    let fan_out = sleepy
        .map()
        .over("x", Arg::List(vec![1.into(), 2.into(), 3.into(), 4.into()]))
        .build();

    let started = Instant::now();
    let value = engine.run(&fan_out).await.unwrap();
    assert_eq!(value, json!([1, 2, 3, 4]));
    assert!(started.elapsed() >= Duration::from_millis(190));
    assert_eq!(engine.resources().in_use("concurrency:task:sleepy"), 0);
}

#[tokio::test]
async fn test_faster_rate_releases_blocked_work_promptly() {
    init_logging();
    let engine = Arc::new(Engine::builder().build());
    let scope = task_scope("tick");
    engine
        .constraints()
        .update_constraint(
            Constraint::new(scope.clone(), "rate", json!({"rate": "1/s"})).with_id("tick-rate"),
        )
        .unwrap();

    let tick = sleeper("tick", 1);
    let fan_out = tick
        .map()
        .over("x", Arg::List((0..5).map(Arg::from).collect()))
        .build();

    let speed_up = {
        let engine = Arc::clone(&engine);
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            engine
                .constraints()
                .update_constraint(
                    Constraint::new(scope, "rate", json!({"rate": "100/s"})).with_id("tick-rate"),
                )
                .unwrap();
        }
    };

    let started = Instant::now();
    let (value, ()) = tokio::join!(engine.run(&fan_out), speed_up);
    assert_eq!(value.unwrap(), json!([0, 1, 2, 3, 4]));
    // Under the stale limit this would take four more seconds.
    assert!(started.elapsed() < Duration::from_millis(1000));
}

#[tokio::test]
async fn test_tail_recursion_keeps_store_bounded() {
    init_logging();
    let events = Arc::new(VecEventSink::new());
    let engine = Engine::builder()
        .with_config(EngineConfig::default().with_hot_path(false))
        .with_event_sink(events.clone())
        .build();
    let store = Arc::new(TrackingStore::default());

    let value = engine
        .run_with(
            &countdown().apply([200, 0]),
            RunOptions::new().with_store(store.clone()),
        )
        .await
        .unwrap();
    assert_eq!(value, json!(20100));
    assert!(store.peak.load(Ordering::SeqCst) <= 1);
    assert!(events
        .events()
        .iter()
        .any(|e| matches!(e, WorkflowEvent::RunCompleted { generations: 201, .. })));
}

#[tokio::test]
async fn test_hot_path_bypasses_event_bus() {
    let events = Arc::new(VecEventSink::new());
    let engine = Engine::builder().with_event_sink(events.clone()).build();

    let value = engine.run(&countdown().apply([50, 0])).await.unwrap();
    assert_eq!(value, json!(1275));
    // One node from the first generation's graph, one shared by every hot call.
    assert_eq!(engine.registry().len(), 2);
    let started = events
        .events()
        .iter()
        .filter(|e| matches!(e, WorkflowEvent::TaskStarted { .. }))
        .count();
    assert_eq!(started, 1);
}

#[tokio::test]
async fn test_generation_limit() {
    let engine = Engine::builder()
        .with_config(EngineConfig::default().with_max_generations(10))
        .build();
    let err = engine.run(&countdown().apply([100, 0])).await.unwrap_err();
    assert!(matches!(err, EngineError::GenerationLimit(10)));
}

#[tokio::test]
async fn test_retry_recovers_and_reports_attempts() {
    init_logging();
    let events = Arc::new(VecEventSink::new());
    let engine = Engine::builder().with_event_sink(events.clone()).build();
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);
    let flaky = Arc::new(TaskDef::new("flaky", move |_args| {
        let counter = Arc::clone(&counter);
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                return Err(EngineError::failed("transient"));
            }
            Ok(Outcome::value("ok"))
        }
    }));

    let call = flaky.apply([0]).with_retry(
        RetryPolicy::new(3)
            .with_delay(Duration::from_millis(5))
            .with_backoff(2.0),
    );
    assert_eq!(engine.run(&call).await.unwrap(), json!("ok"));
    let retries = events
        .events()
        .iter()
        .filter(|e| matches!(e, WorkflowEvent::TaskRetry { .. }))
        .count();
    assert_eq!(retries, 2);

    attempts.store(0, Ordering::SeqCst);
    let strict = flaky.apply([1]).with_retry(RetryPolicy::new(2));
    match engine.run(&strict).await {
        Err(EngineError::ExecutionFailure { attempts, task, .. }) => {
            assert_eq!(attempts, 2);
            assert_eq!(task, "flaky");
        }
        other => panic!("expected an execution failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_cancellation_is_distinct_from_failure() {
    let events = Arc::new(VecEventSink::new());
    let engine = Engine::builder().with_event_sink(events.clone()).build();
    let hang = sleeper("hang", 10_000);
    let cancel = CancellationToken::new();

    let trigger = {
        let cancel = cancel.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cancel.cancel();
        }
    };
    let hang_node = hang.apply([0]);
    let (result, ()) = tokio::join!(
        engine.run_with(&hang_node, RunOptions::new().with_cancel(cancel)),
        trigger
    );
    assert!(matches!(result, Err(EngineError::Cancelled)));
    assert!(matches!(
        events.events().last(),
        Some(WorkflowEvent::RunCancelled { .. })
    ));
}

#[tokio::test]
async fn test_static_resources_limit_parallel_stage() {
    init_logging();
    let events = Arc::new(VecEventSink::new());
    let engine = Engine::builder()
        .with_capacity("gpu", 1)
        .with_event_sink(events.clone())
        .build();
    let job = Arc::new(
        TaskDef::new("gpu_job", |args| async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            Ok(Outcome::Value(args.arg(0).cloned().unwrap_or(Value::Null)))
        })
        .with_resource("gpu", 1),
    );
    let pair = Arc::new(TaskDef::new("pair", |args| async move {
        Ok(Outcome::Value(Value::Array(args.args.clone())))
    }));

    let target = pair.call().arg(&job.apply([1])).arg(&job.apply([2])).build();
    let started = Instant::now();
    assert_eq!(engine.run(&target).await.unwrap(), json!([1, 2]));
    assert!(started.elapsed() >= Duration::from_millis(75));
    assert!(events
        .events()
        .iter()
        .any(|e| matches!(e, WorkflowEvent::TaskBlocked { .. })));
    assert_eq!(engine.resources().in_use("gpu"), 0);
}

#[tokio::test]
async fn test_resource_aware_solver_runs_to_completion() {
    let engine = Engine::builder()
        .with_config(
            EngineConfig::default()
                .with_solver(SolverKind::ResourceAware)
                .with_capacity("gpu", 1),
        )
        .build();
    let job = Arc::new(
        TaskDef::new("gpu_job", |args| async move {
            Ok(Outcome::value(args.i64_arg(0)? * 10))
        })
        .with_resource("gpu", 1),
    );
    let sum = Arc::new(TaskDef::new("sum", |args| async move {
        Ok(Outcome::value(args.args.iter().filter_map(Value::as_i64).sum::<i64>()))
    }));
    let target = sum
        .call()
        .arg(&job.apply([1]))
        .arg(&job.apply([2]))
        .arg(&job.apply([3]))
        .build();

    let (_, plan) = engine.plan(&target).unwrap();
    assert!(plan.len() >= 4);
    assert_eq!(engine.run(&target).await.unwrap(), json!(60));
}

#[tokio::test]
async fn test_injected_resources() {
    let mut extensions = Extensions::new();
    extensions.insert("greeting", String::from("hello"));
    let engine = Engine::builder().with_extensions(extensions).build();
    let greet = Arc::new(TaskDef::new("greet", |args| async move {
        let greeting = args
            .object::<String>("greeting")
            .ok_or_else(|| EngineError::failed("greeting missing"))?;
        let name = args.kwarg("name").and_then(Value::as_str).unwrap_or("?");
        Ok(Outcome::value(format!("{}, {}", greeting, name)))
    }));

    let ok = greet
        .call()
        .kwarg("greeting", Arg::inject("greeting"))
        .kwarg("name", "flow")
        .build();
    assert_eq!(engine.run(&ok).await.unwrap(), json!("hello, flow"));

    let missing = greet.call().kwarg("greeting", Arg::inject("absent")).build();
    assert!(matches!(
        engine.run(&missing).await,
        Err(EngineError::ResourceNotFound { .. })
    ));
}

#[tokio::test]
async fn test_vm_runs_mutual_recursion() {
    init_logging();
    let odd_slot: Arc<OnceLock<Arc<TaskDef>>> = Arc::new(OnceLock::new());
    let slot = Arc::clone(&odd_slot);
    let is_even = Arc::new(
        TaskDef::new("is_even", move |args| {
            let slot = Arc::clone(&slot);
            async move {
                let n = args.i64_arg(0)?;
                if n == 0 {
                    return Ok(Outcome::value(true));
                }
                let is_odd = slot.get().ok_or_else(|| EngineError::failed("is_odd unset"))?;
                Ok(Outcome::TailCall(is_odd.apply([n - 1])))
            }
        })
        .with_tail_calls(["is_odd"]),
    );
    let even = Arc::clone(&is_even);
    let is_odd = Arc::new(
        TaskDef::new("is_odd", move |args| {
            let even = Arc::clone(&even);
            async move {
                let n = args.i64_arg(0)?;
                if n == 0 {
                    return Ok(Outcome::value(false));
                }
                Ok(Outcome::TailCall(even.apply([n - 1])))
            }
        })
        .with_tail_calls(["is_even"]),
    );
    assert!(odd_slot.set(Arc::clone(&is_odd)).is_ok());

    let engine = Engine::builder()
        .with_config(EngineConfig::default().with_strategy(StrategyKind::Vm))
        .build();
    assert_eq!(engine.run(&is_even.apply([10])).await.unwrap(), json!(true));
    assert_eq!(engine.run(&is_even.apply([7])).await.unwrap(), json!(false));
    assert_eq!(engine.registry().len(), 2);
}

#[tokio::test]
async fn test_vm_matches_graph_on_nested_calls() {
    let add = Arc::new(TaskDef::new("add", |args| async move {
        Ok(Outcome::value(args.i64_arg(0)? + args.i64_arg(1)?))
    }));
    let inner = add.call().arg(LazyCall::param("x", Some(json!(1)))).arg(2).build();
    let target = add.call().arg(&inner).arg(&inner).build();

    for strategy in [StrategyKind::Graph, StrategyKind::Vm] {
        let engine = Engine::builder()
            .with_config(EngineConfig::default().with_strategy(strategy))
            .build();
        let value = engine
            .run_with(&target, RunOptions::new().with_param("x", 10))
            .await
            .unwrap();
        assert_eq!(value, json!(24));
    }
}

#[tokio::test]
async fn test_vm_rejects_routers() {
    let counter = Arc::new(AtomicU32::new(0));
    let f = echo("f", &counter);
    let sel = f.apply(["a"]);
    let target = f
        .call()
        .arg(Router::new(&sel).route("a", &f.apply([1])))
        .build();
    let engine = Engine::builder()
        .with_config(EngineConfig::default().with_strategy(StrategyKind::Vm))
        .build();
    assert!(matches!(
        engine.run(&target).await,
        Err(EngineError::Unsupported(_))
    ));
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_pause_and_clear_over_pubsub() {
    init_logging();
    let broker = Arc::new(LocalBroker::new());
    let engine = Engine::builder().with_connector(broker.clone()).build();
    let runs = Arc::new(AtomicU32::new(0));
    let work = echo("work", &runs);

    broker
        .publish("flow/constraints/global", br#"{"type": "pause"}"#, true)
        .await
        .unwrap();

    let resume = {
        let broker = Arc::clone(&broker);
        let runs = Arc::clone(&runs);
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(runs.load(Ordering::SeqCst), 0);
            // Malformed updates leave the pause in force.
            broker
                .publish("flow/constraints/task:work", b"{not json", false)
                .await
                .unwrap();
            broker
                .publish("flow/constraints/global", b"", true)
                .await
                .unwrap();
        }
    };

    let work_node = work.apply([7]);
    let (value, ()) = tokio::join!(engine.run(&work_node), resume);
    assert_eq!(value.unwrap(), json!(7));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(engine
        .constraints()
        .constraints()
        .iter()
        .all(|c| c.scope != GLOBAL_SCOPE));
}
