//! # Boot Pipeline Tests (v0.1)
//!
//! Covers the Compose → Validate → Wire → Initialize pipeline:
//! - at-most-once resource init, reverse-order disposal
//! - override precedence (shallowest depth wins)
//! - visibility chains and the deferred override-through-gate rule
//! - cycle detection, dry run, parallel init, lazy init

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use weft::builders::{event, hook, resource, task};
use weft::{boot, BootOptions, DependencyRef, InitMode, UnitId};

type Log = Arc<Mutex<Vec<String>>>;

fn new_log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

fn push(log: &Log, entry: impl Into<String>) {
    log.lock().push(entry.into());
}

fn id(s: &str) -> UnitId {
    UnitId::new(s).unwrap()
}

/// A resource that logs its init/dispose and yields `value`
fn traced_resource(name: &str, value: u32, log: &Log) -> Arc<weft::ResourceDef> {
    let init_log = log.clone();
    let dispose_log = log.clone();
    let name_owned = name.to_string();
    let name_for_dispose = name.to_string();
    resource(name)
        .init(move |_config, _deps| {
            let log = init_log.clone();
            let name = name_owned.clone();
            async move {
                push(&log, format!("init:{name}"));
                Ok(value)
            }
        })
        .dispose(move |_value, _config, _deps| {
            let log = dispose_log.clone();
            let name = name_for_dispose.clone();
            async move {
                push(&log, format!("dispose:{name}"));
                Ok(())
            }
        })
        .build()
        .unwrap()
}

// ════════════════════════════════════════════════════════════════════
// Init / dispose ordering
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn resource_init_runs_at_most_once_per_boot() {
    let count = Arc::new(AtomicUsize::new(0));
    let count_clone = count.clone();

    let shared = resource("shared")
        .init(move |_config, _deps| {
            let count = count_clone.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(1u32)
            }
        })
        .build()
        .unwrap();

    // Two dependents and two registration branches.
    let left = resource("left")
        .register(vec![shared.clone().into()])
        .depends_on(vec![DependencyRef::resource("shared", shared.id.clone())])
        .init(|_c, deps| async move {
            let value: Arc<u32> = deps.resource("shared")?;
            Ok(*value)
        })
        .build()
        .unwrap();
    let right = resource("right")
        .register(vec![shared.clone().into()])
        .depends_on(vec![DependencyRef::resource("shared", shared.id.clone())])
        .init(|_c, deps| async move {
            let value: Arc<u32> = deps.resource("shared")?;
            Ok(*value)
        })
        .build()
        .unwrap();

    let app = resource("app")
        .register(vec![left.into(), right.into()])
        .build()
        .unwrap();

    let runtime = boot(app, BootOptions::new()).await.unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);
    runtime.dispose().await.unwrap();
}

#[tokio::test]
async fn dispose_order_is_reverse_of_init_order() {
    let log = new_log();
    let a = traced_resource("a", 1, &log);
    let b_log = log.clone();
    let b = resource("b")
        .depends_on(vec![DependencyRef::resource("a", a.id.clone())])
        .init(move |_config, deps| {
            let log = b_log.clone();
            async move {
                let a: Arc<u32> = deps.resource("a")?;
                push(&log, "init:b");
                Ok(*a + 1)
            }
        })
        .dispose({
            let log = log.clone();
            move |_v, _c, _d| {
                let log = log.clone();
                async move {
                    push(&log, "dispose:b");
                    Ok(())
                }
            }
        })
        .build()
        .unwrap();

    let app = resource("app")
        .register(vec![a.into(), b.into()])
        .build()
        .unwrap();

    let runtime = boot(app, BootOptions::new()).await.unwrap();
    runtime.dispose().await.unwrap();

    let entries = log.lock().clone();
    assert_eq!(
        entries,
        vec!["init:a", "init:b", "dispose:b", "dispose:a"]
    );
}

#[tokio::test]
async fn second_dispose_is_terminal() {
    let app = resource("app").build().unwrap();
    let runtime = boot(app, BootOptions::new()).await.unwrap();

    runtime.dispose().await.unwrap();
    let err = runtime.dispose().await.unwrap_err();
    assert_eq!(err.kind(), "runtime.disposed");

    let err = runtime.run_task("anything", Value::Null).await.unwrap_err();
    assert_eq!(err.kind(), "runtime.disposed");
}

#[tokio::test]
async fn disposer_failures_aggregate_but_all_run() {
    let log = new_log();
    let good = traced_resource("good", 1, &log);
    let bad = resource("bad")
        .init(|_c, _d| async { Ok(0u32) })
        .dispose(|_v, _c, _d| async { anyhow::bail!("disposer exploded") })
        .build()
        .unwrap();

    let app = resource("app")
        .register(vec![good.into(), bad.into()])
        .build()
        .unwrap();
    let runtime = boot(app, BootOptions::new()).await.unwrap();

    let err = runtime.dispose().await.unwrap_err();
    assert_eq!(err.kind(), "runtime.disposeFailed");
    assert!(err.to_string().contains("disposer exploded"));
    // The failing disposer did not stop the good one.
    assert!(log.lock().iter().any(|e| e == "dispose:good"));
}

// ════════════════════════════════════════════════════════════════════
// Override precedence
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn shallowest_override_wins() {
    let svc = task("svc")
        .run_value(|_, _| Ok(json!("leaf")))
        .build()
        .unwrap();
    let mid_override = task("svc")
        .run_value(|_, _| Ok(json!("mid")))
        .build()
        .unwrap();
    let root_override = task("svc")
        .run_value(|_, _| Ok(json!("root")))
        .build()
        .unwrap();

    let leaf = resource("leaf").register(vec![svc.into()]).build().unwrap();
    let mid = resource("mid")
        .overrides(vec![mid_override.into()])
        .register(vec![leaf.into()])
        .build()
        .unwrap();
    let app = resource("app")
        .overrides(vec![root_override.into()])
        .register(vec![mid.into()])
        .build()
        .unwrap();

    let runtime = boot(app, BootOptions::new()).await.unwrap();
    let out = runtime.run_task("svc", Value::Null).await.unwrap();
    assert_eq!(out, json!("root"));
    runtime.dispose().await.unwrap();
}

// ════════════════════════════════════════════════════════════════════
// Visibility
// ════════════════════════════════════════════════════════════════════

fn hidden_task() -> Arc<weft::TaskDef> {
    task("hidden")
        .run_value(|_, _| Ok(json!("secret")))
        .build()
        .unwrap()
}

fn caller_of(target: &Arc<weft::TaskDef>) -> Arc<weft::TaskDef> {
    task("caller")
        .depends_on(vec![DependencyRef::task("target", target.id.clone())])
        .run(|_input, deps| async move {
            let target = deps.task("target")?;
            Ok(target.call(Value::Null).await?)
        })
        .build()
        .unwrap()
}

#[tokio::test]
async fn sealed_resource_blocks_outside_consumers_at_boot() {
    let hidden = hidden_task();
    let caller = caller_of(&hidden);

    let vault = resource("vault")
        .register(vec![hidden.into()])
        .exports(vec![])
        .build()
        .unwrap();
    let app = resource("app")
        .register(vec![vault.into(), caller.into()])
        .build()
        .unwrap();

    let err = boot(app, BootOptions::new()).await.unwrap_err();
    assert_eq!(err.kind(), "visibility.violation");
    let msg = err.to_string();
    assert!(msg.contains("hidden") && msg.contains("caller") && msg.contains("vault"));
}

#[tokio::test]
async fn exported_id_crosses_the_boundary() {
    let hidden = hidden_task();
    let caller = caller_of(&hidden);

    let vault = resource("vault")
        .register(vec![hidden.into()])
        .exports(vec![id("hidden")])
        .build()
        .unwrap();
    let app = resource("app")
        .register(vec![vault.into(), caller.into()])
        .build()
        .unwrap();

    let runtime = boot(app, BootOptions::new()).await.unwrap();
    let out = runtime.run_task("caller", Value::Null).await.unwrap();
    assert_eq!(out, json!("secret"));
    runtime.dispose().await.unwrap();
}

#[tokio::test]
async fn exporting_an_unregistered_id_fails_boot() {
    let app = resource("app")
        .exports(vec![id("ghost")])
        .build()
        .unwrap();
    let err = boot(app, BootOptions::new()).await.unwrap_err();
    assert_eq!(err.kind(), "visibility.violation");
}

#[tokio::test]
async fn override_through_a_gate_boots_then_fails_on_consumption() {
    let hidden = hidden_task();
    let caller = caller_of(&hidden);
    let replacement = task("hidden")
        .run_value(|_, _| Ok(json!("replaced")))
        .build()
        .unwrap();

    let vault = resource("vault")
        .register(vec![hidden.into()])
        .exports(vec![])
        .build()
        .unwrap();
    let app = resource("app")
        .overrides(vec![replacement.into()])
        .register(vec![vault.into(), caller.into()])
        .build()
        .unwrap();

    // Boot succeeds despite the gate...
    let runtime = boot(app, BootOptions::new()).await.unwrap();
    // ...and the first consumption raises the violation.
    let err = runtime.run_task("caller", Value::Null).await.unwrap_err();
    assert_eq!(err.kind(), "visibility.violation");
    runtime.dispose().await.unwrap();
}

#[tokio::test]
async fn missing_dependency_is_reported_with_both_ids() {
    let caller = task("caller")
        .depends_on(vec![DependencyRef::task("target", id("ghost"))])
        .run_value(|input, _| Ok(input))
        .build()
        .unwrap();
    let app = resource("app").register(vec![caller.into()]).build().unwrap();

    let err = boot(app, BootOptions::new()).await.unwrap_err();
    assert_eq!(err.kind(), "registration.missing");
    let msg = err.to_string();
    assert!(msg.contains("ghost") && msg.contains("caller"));
}

// ════════════════════════════════════════════════════════════════════
// Cycle detection
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn dependency_cycle_never_boots_and_names_the_chain() {
    let a = resource("cycle-a")
        .depends_on(vec![DependencyRef::resource("b", id("cycle-b"))])
        .init(|_c, _d| async { Ok(()) })
        .build()
        .unwrap();
    let b = resource("cycle-b")
        .depends_on(vec![DependencyRef::resource("a", id("cycle-a"))])
        .init(|_c, _d| async { Ok(()) })
        .build()
        .unwrap();

    let app = resource("app")
        .register(vec![a.into(), b.into()])
        .build()
        .unwrap();

    let err = boot(app, BootOptions::new()).await.unwrap_err();
    assert_eq!(err.kind(), "dependency.cycle");
    let msg = err.to_string();
    assert!(msg.contains("cycle-a") && msg.contains("cycle-b"));
}

// ════════════════════════════════════════════════════════════════════
// Modes: dry run, parallel, lazy
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn dry_run_validates_without_initializing() {
    let log = new_log();
    let a = traced_resource("a", 1, &log);
    let app = resource("app").register(vec![a.into()]).build().unwrap();

    let runtime = boot(app, BootOptions::new().dry_run(true)).await.unwrap();
    assert!(log.lock().is_empty());

    let err = runtime.resource_value("a").unwrap_err();
    assert_eq!(err.kind(), "resource.uninitialized");
}

#[tokio::test]
async fn dry_run_still_rejects_cycles() {
    let a = resource("a")
        .depends_on(vec![DependencyRef::resource("b", id("b"))])
        .build()
        .unwrap();
    let b = resource("b")
        .depends_on(vec![DependencyRef::resource("a", id("a"))])
        .build()
        .unwrap();
    let app = resource("app")
        .register(vec![a.into(), b.into()])
        .build()
        .unwrap();

    let err = boot(app, BootOptions::new().dry_run(true)).await.unwrap_err();
    assert_eq!(err.kind(), "dependency.cycle");
}

#[tokio::test]
async fn parallel_init_preserves_dependency_order() {
    let log = new_log();
    let a = traced_resource("a", 1, &log);
    let b_log = log.clone();
    let b = resource("b")
        .depends_on(vec![DependencyRef::resource("a", a.id.clone())])
        .init(move |_c, _d| {
            let log = b_log.clone();
            async move {
                push(&log, "init:b");
                Ok(2u32)
            }
        })
        .build()
        .unwrap();
    let c = traced_resource("c", 3, &log);

    let app = resource("app")
        .register(vec![b.into(), a.into(), c.into()])
        .build()
        .unwrap();

    let runtime = boot(app, BootOptions::new().init_mode(InitMode::Parallel))
        .await
        .unwrap();

    let entries = log.lock().clone();
    let pos = |name: &str| entries.iter().position(|e| e == name).unwrap();
    assert!(pos("init:a") < pos("init:b"));
    runtime.dispose().await.unwrap();
}

#[tokio::test]
async fn parallel_init_aggregates_failures_and_rolls_back() {
    let log = new_log();
    let good = traced_resource("good", 1, &log);
    let boom1 = resource("boom1")
        .depends_on(vec![DependencyRef::resource("good", id("good"))])
        .init(|_c, _d| async { anyhow::bail!("boom1 failed") as anyhow::Result<()> })
        .build()
        .unwrap();
    let boom2 = resource("boom2")
        .depends_on(vec![DependencyRef::resource("good", id("good"))])
        .init(|_c, _d| async { anyhow::bail!("boom2 failed") as anyhow::Result<()> })
        .build()
        .unwrap();

    let app = resource("app")
        .register(vec![good.into(), boom1.into(), boom2.into()])
        .build()
        .unwrap();

    let err = boot(app, BootOptions::new().init_mode(InitMode::Parallel))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "boot.initFailed");
    let msg = err.to_string();
    assert!(msg.contains("boom1 failed") && msg.contains("boom2 failed"));

    // Already-initialized resources were disposed before surfacing.
    assert!(log.lock().iter().any(|e| e == "dispose:good"));
}

#[tokio::test]
async fn sequential_init_failure_rolls_back_and_keeps_the_kind() {
    let log = new_log();
    let good = traced_resource("good", 1, &log);
    let typed = resource("typed")
        .config_schema(json!({"type": "object", "required": ["url"]}))
        .depends_on(vec![DependencyRef::resource("good", id("good"))])
        .init(|_c, _d| async { Ok(()) })
        .build()
        .unwrap();

    let app = resource("app")
        .register(vec![good.into(), typed.with(json!({}))])
        .build()
        .unwrap();

    let err = boot(app, BootOptions::new()).await.unwrap_err();
    assert_eq!(err.kind(), "resource.config");
    assert!(log.lock().iter().any(|e| e == "dispose:good"));
}

#[tokio::test]
async fn lazy_boot_initializes_on_first_access_in_dependency_order() {
    let log = new_log();
    let a = traced_resource("a", 10, &log);
    let b_log = log.clone();
    let b = resource("b")
        .depends_on(vec![DependencyRef::resource("a", a.id.clone())])
        .init(move |_c, deps| {
            let log = b_log.clone();
            async move {
                let a: Arc<u32> = deps.resource("a")?;
                push(&log, "init:b");
                Ok(*a * 2)
            }
        })
        .build()
        .unwrap();

    let app = resource("app")
        .register(vec![a.into(), b.into()])
        .build()
        .unwrap();

    let runtime = boot(app, BootOptions::new().lazy(true)).await.unwrap();
    assert!(log.lock().is_empty());

    let value = runtime.lazy_resource_value("b").await.unwrap();
    let value = value.downcast::<u32>().ok().expect("u32 resource value");
    assert_eq!(*value, 20);
    assert_eq!(log.lock().clone(), vec!["init:a", "init:b"]);

    // Eager read works once initialized lazily.
    let a_value: Arc<u32> = runtime.typed_resource_value("a").unwrap();
    assert_eq!(*a_value, 10);
    runtime.dispose().await.unwrap();
}

// ════════════════════════════════════════════════════════════════════
// System events and config binding
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn ready_fires_after_the_root_resolves() {
    let log = new_log();
    let ready_log = log.clone();
    let on_ready = hook("on-ready")
        .on_id(weft::system::ready())
        .run(move |_event, _deps| {
            let log = ready_log.clone();
            async move {
                push(&log, "ready");
                Ok(())
            }
        })
        .build()
        .unwrap();

    let app = resource("app").register(vec![on_ready.into()]).build().unwrap();
    let runtime = boot(app, BootOptions::new()).await.unwrap();

    assert_eq!(log.lock().clone(), vec!["ready"]);
    runtime.dispose().await.unwrap();
}

#[tokio::test]
async fn registration_config_reaches_init() {
    let db = resource("db")
        .config_schema(json!({
            "type": "object",
            "properties": {"url": {"type": "string"}},
            "required": ["url"],
        }))
        .init(|config, _deps| async move {
            Ok(config["url"].as_str().unwrap_or_default().to_string())
        })
        .build()
        .unwrap();

    let app = resource("app")
        .register(vec![db.with(json!({"url": "postgres://localhost/app"}))])
        .build()
        .unwrap();

    let runtime = boot(app, BootOptions::new()).await.unwrap();
    let url: Arc<String> = runtime.typed_resource_value("db").unwrap();
    assert_eq!(url.as_str(), "postgres://localhost/app");
    runtime.dispose().await.unwrap();
}

#[tokio::test]
async fn private_context_is_shared_between_init_and_dispose() {
    let seen = Arc::new(Mutex::new(Vec::<usize>::new()));
    let seen_init = seen.clone();
    let seen_dispose = seen.clone();

    let res = resource("stateful")
        .private_context(|| AtomicUsize::new(7))
        .init(move |_c, deps| {
            let seen = seen_init.clone();
            async move {
                let private: Arc<AtomicUsize> = deps.private().expect("private context");
                seen.lock().push(private.fetch_add(1, Ordering::SeqCst));
                Ok(())
            }
        })
        .dispose(move |_v, _c, deps| {
            let seen = seen_dispose.clone();
            async move {
                let private: Arc<AtomicUsize> = deps.private().expect("private context");
                seen.lock().push(private.load(Ordering::SeqCst));
                Ok(())
            }
        })
        .build()
        .unwrap();

    let app = resource("app").register(vec![res.into()]).build().unwrap();
    let runtime = boot(app, BootOptions::new()).await.unwrap();
    runtime.dispose().await.unwrap();

    // init saw 7 and bumped it; dispose saw the bump.
    assert_eq!(seen.lock().clone(), vec![7, 8]);
}

#[tokio::test]
async fn events_are_queryable_by_tag() {
    let audit = weft::builders::tag("audit").unwrap();
    let tagged = event("tagged").tag(audit.clone()).build().unwrap();
    let plain = event("plain").build().unwrap();

    let app = resource("app")
        .register(vec![tagged.into(), plain.into()])
        .build()
        .unwrap();
    let runtime = boot(app, BootOptions::new()).await.unwrap();

    let found = runtime.store().events_with_tag(&audit.id);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id.as_str(), "tagged");
    runtime.dispose().await.unwrap();
}
