//! Lifecycle state machine, dependency ordering and per-plugin
//! serialization, driven through the public manager API.

mod common;

use common::*;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_test::{assert_err, assert_ok};
use warden_plugin_host::*;

// ================================================================
// Dependency ordering
// ================================================================

#[tokio::test]
async fn start_all_loads_in_dependency_order() {
    let h = Harness::new();
    h.add(plugin("acme.extra", "1.0.0").depends_on(DependencySpec::new(
        "acme.ui",
        "^1".parse().unwrap(),
    )))
    .await;
    h.add(plugin("acme.ui", "1.2.0").depends_on(DependencySpec::new(
        "acme.core",
        ">=1.0, <2".parse().unwrap(),
    )))
    .await;
    h.add(plugin("acme.core", "1.4.0")).await;
    let mut events = h.manager.subscribe();

    let report = h.manager.start_all().await.unwrap();
    assert!(report.is_clean(), "{:?}", report.failures);
    assert_eq!(report.succeeded, vec!["acme.core", "acme.ui", "acme.extra"]);

    // Each load happens only after its dependency committed Active
    let transitions: Vec<(String, LifecycleState)> = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e.to, LifecycleState::Loaded | LifecycleState::Active))
        .map(|e| (e.plugin, e.to))
        .collect();
    assert_eq!(
        transitions,
        vec![
            ("acme.core".to_string(), LifecycleState::Loaded),
            ("acme.core".to_string(), LifecycleState::Active),
            ("acme.ui".to_string(), LifecycleState::Loaded),
            ("acme.ui".to_string(), LifecycleState::Active),
            ("acme.extra".to_string(), LifecycleState::Loaded),
            ("acme.extra".to_string(), LifecycleState::Active),
        ]
    );
}

#[tokio::test]
async fn load_waits_until_dependency_is_active() {
    let h = Harness::new();
    h.add(plugin("acme.core", "1.0.0")).await;
    h.add(plugin("acme.ui", "1.0.0").depends_on(DependencySpec::any("acme.core")))
        .await;

    for name in ["acme.core", "acme.ui"] {
        h.manager.discover(name).await.unwrap();
        h.manager.validate(name).await.unwrap();
    }

    let err = h.manager.load("acme.ui").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DependencyUnsatisfied);
    assert_eq!(h.manager.state("acme.ui").unwrap(), LifecycleState::Validated);

    h.manager.load("acme.core").await.unwrap();
    let err = h.manager.load("acme.ui").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DependencyUnsatisfied);

    h.manager.activate("acme.core").await.unwrap();
    h.manager.load("acme.ui").await.unwrap();
    assert_eq!(h.manager.state("acme.ui").unwrap(), LifecycleState::Loaded);
}

#[tokio::test]
async fn circular_dependencies_fail_both_plugins() {
    let h = Harness::new();
    h.add(plugin("acme.a", "1.0.0").depends_on(DependencySpec::any("acme.b")))
        .await;
    h.add(plugin("acme.b", "1.0.0").depends_on(DependencySpec::any("acme.a")))
        .await;
    let mut events = h.manager.subscribe();

    let report = h.manager.start_all().await.unwrap();
    assert!(report.succeeded.is_empty());
    for name in ["acme.a", "acme.b"] {
        assert_eq!(h.manager.state(name).unwrap(), LifecycleState::Failed);
        let err = report.failure(name).unwrap();
        assert_eq!(err.kind(), ErrorKind::DependencyUnsatisfied);
        assert!(err.to_string().contains("circular dependency"), "{err}");
    }
    assert!(drain(&mut events).iter().all(|e| e.to != LifecycleState::Loaded));
}

#[tokio::test]
async fn missing_dependency_fails_validation() {
    let h = Harness::new();
    h.add(plugin("acme.ui", "1.0.0").depends_on(DependencySpec::any("acme.core")))
        .await;

    h.manager.discover("acme.ui").await.unwrap();
    let err = h.manager.validate("acme.ui").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DependencyUnsatisfied);
    assert!(err.to_string().contains("acme.core"));
    assert_eq!(h.manager.state("acme.ui").unwrap(), LifecycleState::Failed);
}

#[tokio::test]
async fn unsatisfiable_version_range_fails_validation() {
    let h = Harness::new();
    h.add(plugin("acme.core", "2.1.0")).await;
    h.add(plugin("acme.ui", "1.0.0").depends_on(DependencySpec::new(
        "acme.core",
        "^1.4".parse().unwrap(),
    )))
    .await;

    h.manager.discover("acme.ui").await.unwrap();
    let err = h.manager.validate("acme.ui").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DependencyUnsatisfied);
    assert!(err.to_string().contains("requires ^1.4 but 2.1.0"), "{err}");
}

// ================================================================
// Validation
// ================================================================

#[tokio::test]
async fn structural_validation_failure_is_terminal() {
    let h = Harness::new();
    h.add(plugin("acme.loop", "1.0.0").depends_on(DependencySpec::any("acme.loop")))
        .await;

    h.manager.discover("acme.loop").await.unwrap();
    let err = h.manager.validate("acme.loop").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationFailed);
    assert_eq!(h.manager.state("acme.loop").unwrap(), LifecycleState::Failed);

    let summary = &h.manager.list()[0];
    assert!(summary.last_error.as_deref().unwrap().contains("depends on itself"));

    // A failed plugin can be rediscovered from scratch
    assert_eq!(
        h.manager.discover("acme.loop").await.unwrap(),
        LifecycleState::Discovered
    );
}

#[tokio::test]
async fn admission_policy_blocks_denylisted_plugin() {
    let engine = PolicyEngine::with_config(PolicyConfig {
        mode: PolicyMode::Denylist,
        plugin_ids: vec!["acme.banned".to_string()],
        ..PolicyConfig::default()
    });
    let h = Harness::build(permissive_config(), engine);
    h.add(plugin("acme.banned", "1.0.0")).await;
    h.add(plugin("acme.fine", "1.0.0")).await;

    let report = h.manager.start_all().await.unwrap();
    assert_eq!(report.succeeded, vec!["acme.fine"]);
    assert_eq!(
        report.failure("acme.banned").unwrap().kind(),
        ErrorKind::PolicyDenied
    );
    assert_eq!(h.manager.state("acme.banned").unwrap(), LifecycleState::Failed);
}

#[tokio::test]
async fn privileged_requests_surface_as_warnings() {
    let h = Harness::new();
    h.add(plugin("acme.net", "1.0.0").requesting([Capability::NetworkFetch]))
        .await;
    h.manager.discover("acme.net").await.unwrap();

    let report = h.manager.validate("acme.net").await.unwrap();
    assert_eq!(report.warnings.len(), 1);
    assert_eq!(h.manager.list()[0].validation_warnings, report.warnings);
}

// ================================================================
// Transitions
// ================================================================

#[tokio::test]
async fn deactivate_twice_is_a_no_op() {
    let h = Harness::new();
    h.add(plugin("acme.a", "1.0.0")).await;
    h.start("acme.a").await;
    let mut events = h.manager.subscribe();

    assert_ok!(h.manager.deactivate("acme.a").await);
    assert_ok!(h.manager.deactivate("acme.a").await);

    assert_eq!(h.manager.state("acme.a").unwrap(), LifecycleState::Deactivated);
    assert_eq!(drain(&mut events).len(), 1);
}

#[tokio::test]
async fn activation_failure_leaves_plugin_loaded() {
    let h = Harness::new();
    h.loader
        .register("acme.broken", |_| Ok(Box::new(BrokenActivate) as Box<dyn Plugin>));
    h.registry.upsert(plugin("acme.broken", "1.0.0")).await.unwrap();

    h.manager.discover("acme.broken").await.unwrap();
    h.manager.validate("acme.broken").await.unwrap();
    h.manager.load("acme.broken").await.unwrap();

    let err = h.manager.activate("acme.broken").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ActivationFailed);
    assert!(err.to_string().contains("listener port already in use"));
    assert_eq!(h.manager.state("acme.broken").unwrap(), LifecycleState::Loaded);
    assert!(!h.manager.sandbox().is_established("acme.broken"));
    assert!(!h.manager.gateway().is_open("acme.broken"));
}

#[tokio::test]
async fn loader_failure_fails_the_plugin() {
    let h = Harness::new();
    // Registered in the registry but the loader has no factory for it
    h.registry.upsert(plugin("acme.ghost", "1.0.0")).await.unwrap();

    h.manager.discover("acme.ghost").await.unwrap();
    h.manager.validate("acme.ghost").await.unwrap();
    let err = h.manager.load("acme.ghost").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LoadFailed);
    assert_eq!(h.manager.state("acme.ghost").unwrap(), LifecycleState::Failed);
}

#[tokio::test]
async fn each_load_gets_a_fresh_instance_id() {
    let h = Harness::new();
    h.add(plugin("acme.a", "1.0.0")).await;
    h.start("acme.a").await;
    let first = h.manager.list()[0].instance_id.unwrap();

    h.manager.reload("acme.a").await.unwrap();
    let second = h.manager.list()[0].instance_id.unwrap();
    assert_ne!(first, second);
}

#[tokio::test]
async fn health_check_requires_active_plugin() {
    let h = Harness::new();
    h.add(plugin("acme.a", "1.0.0")).await;
    h.manager.discover("acme.a").await.unwrap();

    let err = h.manager.health_check("acme.a").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotActive);

    h.manager.validate("acme.a").await.unwrap();
    h.manager.load("acme.a").await.unwrap();
    h.manager.activate("acme.a").await.unwrap();
    assert_eq!(h.manager.health_check("acme.a").await.unwrap(), HealthStatus::Healthy);
}

// ================================================================
// Serialization
// ================================================================

#[tokio::test]
async fn concurrent_operation_on_same_plugin_is_busy() {
    let h = Harness::new();
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    {
        let entered = entered.clone();
        let release = release.clone();
        h.loader.register("acme.slow", move |_| {
            Ok(Box::new(Gated {
                entered: entered.clone(),
                release: release.clone(),
            }) as Box<dyn Plugin>)
        });
    }
    h.registry.upsert(plugin("acme.slow", "1.0.0")).await.unwrap();
    h.add(plugin("acme.other", "1.0.0")).await;

    h.manager.discover("acme.slow").await.unwrap();
    h.manager.validate("acme.slow").await.unwrap();
    h.manager.load("acme.slow").await.unwrap();

    let manager = h.manager.clone();
    let first = tokio::spawn(async move { manager.activate("acme.slow").await });
    entered.notified().await;

    let err = assert_err!(h.manager.activate("acme.slow").await);
    assert_eq!(err.kind(), ErrorKind::Busy);
    let err = assert_err!(h.manager.reload("acme.slow").await);
    assert_eq!(err.kind(), ErrorKind::Busy);
    // No partial state while the first call is in flight
    assert_eq!(h.manager.state("acme.slow").unwrap(), LifecycleState::Loaded);

    // Other plugins are unaffected
    h.start("acme.other").await;

    release.notify_one();
    assert_ok!(first.await.unwrap());
    assert_eq!(h.manager.state("acme.slow").unwrap(), LifecycleState::Active);
}

// ================================================================
// Shutdown / removal
// ================================================================

#[tokio::test]
async fn shutdown_stops_dependents_first() {
    let h = Harness::new();
    h.add(plugin("acme.core", "1.0.0")).await;
    h.add(plugin("acme.ui", "1.0.0").depends_on(DependencySpec::any("acme.core")))
        .await;
    h.add(plugin("acme.extra", "1.0.0").depends_on(DependencySpec::any("acme.ui")))
        .await;
    h.manager.start_all().await.unwrap();
    let mut events = h.manager.subscribe();

    let report = h.manager.shutdown().await;
    assert!(report.is_clean());
    assert_eq!(report.succeeded, vec!["acme.extra", "acme.ui", "acme.core"]);

    let deactivated: Vec<String> = drain(&mut events)
        .into_iter()
        .filter(|e| e.to == LifecycleState::Deactivated)
        .map(|e| e.plugin)
        .collect();
    assert_eq!(deactivated, vec!["acme.extra", "acme.ui", "acme.core"]);
    for summary in h.manager.list() {
        assert_eq!(summary.state, LifecycleState::Unloaded);
    }
}

#[tokio::test]
async fn remove_forgets_stopped_plugin() {
    let h = Harness::new();
    h.add(plugin("acme.a", "1.0.0")).await;
    h.start("acme.a").await;

    let err = h.manager.remove("acme.a").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidTransition);

    h.manager.deactivate("acme.a").await.unwrap();
    h.manager.unload("acme.a").await.unwrap();
    h.manager.remove("acme.a").unwrap();
    assert_eq!(
        h.manager.state("acme.a").unwrap_err().kind(),
        ErrorKind::PluginNotFound
    );
}
