//! Security sandbox: one monitored scope per active plugin.
//!
//! Each scope owns:
//! - the plugin's immutable [`SecurityPolicy`]
//! - a [`ResourceMonitor`] fed by scoped calls and network authorizations
//! - a background sampling task that compares counters to the policy on
//!   every tick
//!
//! Violations are appended to a per-plugin trail that outlives scopes, and
//! are forwarded to the plugin manager as [`SandboxSignal`]s. When the
//! number of violations inside the rolling window reaches the policy's
//! threshold, the sandbox asks the manager to force the plugin to
//! `Failed`, at most once per scope. Every scope carries a generation
//! number so a request raised by a replaced scope can be told apart from
//! one raised by the current scope.

use crate::error::PluginHostError;
use crate::monitor::{MonitorSnapshot, NetworkAdmission, ResourceMonitor, ViolationKind, ViolationRecord};
use crate::policy::SecurityPolicy;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Notifications from the sandbox to the plugin manager.
#[derive(Debug, Clone, PartialEq)]
pub enum SandboxSignal {
    /// A violation was recorded. Recoverable on its own.
    Violation(ViolationRecord),
    /// The violation threshold was reached in the scope with this
    /// generation; the plugin must be failed.
    ForceFail {
        plugin: String,
        generation: u64,
        reason: String,
    },
}

/// State shared by a scope, its sampling task, and its scope handles.
#[derive(Debug)]
struct ScopeShared {
    policy: Arc<SecurityPolicy>,
    monitor: Arc<ResourceMonitor>,
    generation: u64,
    escalated: AtomicBool,
}

struct Scope {
    shared: Arc<ScopeShared>,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct ViolationLog {
    records: Vec<(Instant, ViolationRecord)>,
    /// Records before this instant do not count toward the threshold.
    epoch: Option<Instant>,
    window: Duration,
    /// Generation of the most recently established scope.
    generation: u64,
    /// Carried from scope to scope and reset on each establish.
    monitor: Option<Arc<ResourceMonitor>>,
}

impl ViolationLog {
    fn counted(&self, now: Instant) -> impl Iterator<Item = &ViolationRecord> {
        let window_start = now.checked_sub(self.window);
        let epoch = self.epoch;
        self.records
            .iter()
            .filter(move |(at, _)| {
                window_start.is_none_or(|start| *at >= start) && epoch.is_none_or(|e| *at >= e)
            })
            .map(|(_, record)| record)
    }
}

struct SandboxInner {
    scopes: RwLock<HashMap<String, Scope>>,
    violations: Mutex<HashMap<String, ViolationLog>>,
    generations: AtomicU64,
    signals: mpsc::UnboundedSender<SandboxSignal>,
}

/// Per-plugin scoped enforcement and monitoring.
#[derive(Clone)]
pub struct SecuritySandbox {
    inner: Arc<SandboxInner>,
}

impl SecuritySandbox {
    /// Creates a sandbox and the receiving end of its signal channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SandboxSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sandbox = Self {
            inner: Arc::new(SandboxInner {
                scopes: RwLock::new(HashMap::new()),
                violations: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(0),
                signals: tx,
            }),
        };
        (sandbox, rx)
    }

    /// Establishes a monitored scope for `policy.plugin()` and starts its
    /// sampling task. An existing scope for the same plugin is torn down
    /// first.
    ///
    /// With `reset_violations`, earlier violations stay in the trail but
    /// stop counting toward the threshold.
    pub async fn establish(
        &self,
        policy: Arc<SecurityPolicy>,
        reset_violations: bool,
    ) -> Arc<ResourceMonitor> {
        let plugin = policy.plugin().to_string();
        if self.is_established(&plugin) {
            self.teardown(&plugin).await;
        }

        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let monitor = {
            let mut logs = self.inner.lock_violations();
            let log = logs.entry(plugin.clone()).or_default();
            log.window = policy.violation_window();
            log.generation = generation;
            if reset_violations {
                log.epoch = Some(Instant::now());
            }
            let monitor = log
                .monitor
                .get_or_insert_with(|| Arc::new(ResourceMonitor::new(plugin.clone())));
            monitor.reset();
            Arc::clone(monitor)
        };
        let shared = Arc::new(ScopeShared {
            policy: Arc::clone(&policy),
            monitor: Arc::clone(&monitor),
            generation,
            escalated: AtomicBool::new(false),
        });

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(sampling_loop(
            Arc::downgrade(&self.inner),
            Arc::clone(&shared),
            stop_rx,
        ));

        self.inner.write_scopes().insert(
            plugin.clone(),
            Scope {
                shared,
                stop: stop_tx,
                task,
            },
        );

        info!(
            plugin = %plugin,
            granted = %policy.granted(),
            generation,
            sampling_ms = policy.sampling_interval().as_millis() as u64,
            "Sandbox scope established"
        );
        monitor
    }

    /// Stops the sampling task, waits for it to finish, and freezes the
    /// monitor. Returns the final snapshot, or `None` if no scope existed.
    pub async fn teardown(&self, plugin: &str) -> Option<MonitorSnapshot> {
        let scope = self.inner.write_scopes().remove(plugin)?;
        let _ = scope.stop.send(());
        if let Err(e) = scope.task.await {
            warn!(plugin = %plugin, "Sampling task ended abnormally: {}", e);
        }
        scope.shared.monitor.freeze();
        let snapshot = scope.shared.monitor.snapshot(&scope.shared.policy);
        debug!(plugin = %plugin, calls = snapshot.calls, "Sandbox scope torn down");
        Some(snapshot)
    }

    /// Opens an execution scope for one call into plugin code. Elapsed
    /// time is charged as CPU time and limits are re-checked when the
    /// returned handle drops.
    pub fn enter(&self, plugin: &str) -> Result<ScopeHandle, PluginHostError> {
        let shared = self.scope_shared(plugin).ok_or_else(|| PluginHostError::NotActive {
            plugin: plugin.to_string(),
        })?;
        shared.monitor.record_call();
        Ok(ScopeHandle {
            sandbox: Arc::downgrade(&self.inner),
            shared,
            started: Instant::now(),
        })
    }

    /// Authorizes one outbound network request. A disallowed destination
    /// or an exhausted request budget denies the request and records one
    /// violation.
    pub fn authorize_network(&self, plugin: &str, destination: &str) -> Result<(), PluginHostError> {
        let shared = self.scope_shared(plugin).ok_or_else(|| PluginHostError::NotActive {
            plugin: plugin.to_string(),
        })?;
        let policy = &shared.policy;

        if !policy.is_destination_allowed(destination) {
            self.inner
                .record(&shared, ViolationKind::NetworkDestination, 0, policy.allowed_destinations().len() as u64);
            return Err(PluginHostError::PermissionDenied {
                plugin: plugin.to_string(),
                capability: format!("network destination '{destination}'"),
            });
        }

        match shared
            .monitor
            .try_record_network_request(policy.max_network_requests(), policy.network_window())
        {
            NetworkAdmission::Admitted { .. } => Ok(()),
            NetworkAdmission::Exceeded { attempted, limit } => {
                self.inner.record(
                    &shared,
                    ViolationKind::NetworkRequests,
                    u64::from(attempted),
                    u64::from(limit),
                );
                Err(PluginHostError::ResourceLimitExceeded {
                    plugin: plugin.to_string(),
                    detail: format!(
                        "network request {attempted} exceeds {limit} per {}s window",
                        policy.network_window().as_secs()
                    ),
                })
            }
            NetworkAdmission::Frozen => Err(PluginHostError::NotActive {
                plugin: plugin.to_string(),
            }),
        }
    }

    /// Records a rejection the gateway issued for `plugin`. Ignored when
    /// the plugin has no scope. Returns whether a violation was recorded.
    pub fn report_rejection(&self, plugin: &str, kind: ViolationKind, observed: u64, limit: u64) -> bool {
        match self.scope_shared(plugin) {
            Some(shared) => {
                self.inner.record(&shared, kind, observed, limit);
                true
            }
            None => {
                debug!(plugin = %plugin, %kind, "Rejection reported for plugin without scope, ignoring");
                false
            }
        }
    }

    /// Records a memory estimate for `plugin`.
    pub fn record_memory(&self, plugin: &str, bytes: u64) {
        if let Some(shared) = self.scope_shared(plugin) {
            shared.monitor.record_memory(bytes);
        }
    }

    /// Runs one limit check immediately, as the sampling task does on
    /// each tick. Returns the kinds recorded.
    pub fn sample(&self, plugin: &str) -> Vec<ViolationKind> {
        match self.scope_shared(plugin) {
            Some(shared) => self.inner.sample(&shared),
            None => Vec::new(),
        }
    }

    /// The full violation trail for `plugin`, oldest first.
    pub fn violations(&self, plugin: &str) -> Vec<ViolationRecord> {
        self.inner
            .lock_violations()
            .get(plugin)
            .map(|log| log.records.iter().map(|(_, r)| r.clone()).collect())
            .unwrap_or_default()
    }

    /// Violations currently counting toward the threshold.
    pub fn violations_in_window(&self, plugin: &str) -> Vec<ViolationRecord> {
        let now = Instant::now();
        self.inner
            .lock_violations()
            .get(plugin)
            .map(|log| log.counted(now).cloned().collect())
            .unwrap_or_default()
    }

    /// Drops the violation trail of a plugin that is being forgotten.
    pub fn forget(&self, plugin: &str) {
        self.inner.lock_violations().remove(plugin);
    }

    pub fn snapshot(&self, plugin: &str) -> Option<MonitorSnapshot> {
        self.scope_shared(plugin)
            .map(|shared| shared.monitor.snapshot(&shared.policy))
    }

    pub fn monitor(&self, plugin: &str) -> Option<Arc<ResourceMonitor>> {
        self.scope_shared(plugin).map(|shared| Arc::clone(&shared.monitor))
    }

    pub fn is_established(&self, plugin: &str) -> bool {
        self.inner.read_scopes().contains_key(plugin)
    }

    /// Generation of the last scope established for `plugin`, live or
    /// torn down.
    pub fn generation(&self, plugin: &str) -> Option<u64> {
        self.inner
            .lock_violations()
            .get(plugin)
            .map(|log| log.generation)
            .filter(|generation| *generation > 0)
    }

    /// Whether the live scope of `plugin` is the one with `generation`.
    pub fn is_current(&self, plugin: &str, generation: u64) -> bool {
        self.inner.is_current(plugin, generation)
    }

    fn scope_shared(&self, plugin: &str) -> Option<Arc<ScopeShared>> {
        self.inner
            .read_scopes()
            .get(plugin)
            .map(|scope| Arc::clone(&scope.shared))
    }
}

impl SandboxInner {
    fn read_scopes(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Scope>> {
        self.scopes.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_scopes(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Scope>> {
        self.scopes.write().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_violations(&self) -> std::sync::MutexGuard<'_, HashMap<String, ViolationLog>> {
        self.violations.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_current(&self, plugin: &str, generation: u64) -> bool {
        self.read_scopes()
            .get(plugin)
            .is_some_and(|scope| scope.shared.generation == generation)
    }

    fn sample(&self, shared: &ScopeShared) -> Vec<ViolationKind> {
        if shared.monitor.is_frozen() {
            return Vec::new();
        }
        let breached = shared.monitor.check(&shared.policy);
        for kind in &breached {
            let (observed, limit) = shared.monitor.reading(*kind, &shared.policy);
            self.record(shared, *kind, observed, limit);
        }
        breached
    }

    /// Appends a violation, signals it, and escalates once the threshold
    /// is reached within the window.
    fn record(&self, shared: &ScopeShared, kind: ViolationKind, observed: u64, limit: u64) {
        let plugin = shared.policy.plugin();
        let record = ViolationRecord::new(plugin, kind, observed, limit);
        let now = Instant::now();

        let counted = {
            let mut logs = self.lock_violations();
            let log = logs.entry(plugin.to_string()).or_default();
            log.records.push((now, record.clone()));
            log.counted(now).count()
        };

        warn!(
            plugin = %plugin,
            kind = %kind,
            observed,
            limit,
            counted,
            "Sandbox violation recorded"
        );
        self.send(SandboxSignal::Violation(record));

        let threshold = shared.policy.violation_threshold() as usize;
        if counted >= threshold && !shared.escalated.swap(true, Ordering::AcqRel) {
            let reason = format!(
                "{counted} violations within {}s (threshold {threshold}), last: {kind}",
                shared.policy.violation_window().as_secs()
            );
            error!(plugin = %plugin, %reason, "Violation threshold reached, requesting forced failure");
            self.send(SandboxSignal::ForceFail {
                plugin: plugin.to_string(),
                generation: shared.generation,
                reason,
            });
        }
    }

    fn send(&self, signal: SandboxSignal) {
        if self.signals.send(signal).is_err() {
            debug!("Sandbox signal receiver dropped");
        }
    }
}

async fn sampling_loop(
    sandbox: Weak<SandboxInner>,
    shared: Arc<ScopeShared>,
    mut stop: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(shared.policy.sampling_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = &mut stop => break,
            _ = ticker.tick() => {
                let Some(inner) = sandbox.upgrade() else { break };
                inner.sample(&shared);
            }
        }
    }
}

/// An open execution scope. Dropping it charges the elapsed time to the
/// plugin's CPU counter and re-checks its limits, unless its scope has
/// been torn down or replaced in the meantime.
pub struct ScopeHandle {
    sandbox: Weak<SandboxInner>,
    shared: Arc<ScopeShared>,
    started: Instant,
}

impl ScopeHandle {
    pub fn plugin(&self) -> &str {
        self.shared.policy.plugin()
    }

    pub fn policy(&self) -> &SecurityPolicy {
        &self.shared.policy
    }

    pub fn generation(&self) -> u64 {
        self.shared.generation
    }

    pub fn record_memory(&self, bytes: u64) {
        self.shared.monitor.record_memory(bytes);
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Drop for ScopeHandle {
    fn drop(&mut self) {
        let Some(inner) = self.sandbox.upgrade() else {
            return;
        };
        if !inner.is_current(self.plugin(), self.shared.generation) {
            return;
        }
        self.shared.monitor.record_cpu(self.started.elapsed());
        inner.sample(&self.shared);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PluginSettings;
    use crate::descriptor::PluginDescriptor;
    use crate::policy::PolicyEngine;
    use semver::Version;

    fn policy(name: &str, settings: PluginSettings) -> Arc<SecurityPolicy> {
        let descriptor = PluginDescriptor::new(name, Version::new(1, 0, 0));
        Arc::new(SecurityPolicy::build(&descriptor, &settings, &PolicyEngine::default()).unwrap())
    }

    fn network_settings(limit: u32) -> PluginSettings {
        PluginSettings {
            max_network_requests_per_window: limit,
            allowed_network_destinations: ["api.example.com".to_string()].into(),
            ..PluginSettings::default()
        }
    }

    #[tokio::test]
    async fn establish_and_teardown() {
        let (sandbox, _rx) = SecuritySandbox::new();
        sandbox.establish(policy("p", PluginSettings::default()), false).await;
        assert!(sandbox.is_established("p"));

        let snapshot = sandbox.teardown("p").await.unwrap();
        assert!(snapshot.frozen);
        assert!(!sandbox.is_established("p"));
        assert!(sandbox.teardown("p").await.is_none());
    }

    #[tokio::test]
    async fn enter_requires_scope() {
        let (sandbox, _rx) = SecuritySandbox::new();
        let err = sandbox.enter("ghost").err().unwrap();
        assert_eq!(err.kind(), crate::ErrorKind::NotActive);
    }

    #[tokio::test]
    async fn scope_handle_charges_cpu_and_counts_calls() {
        let (sandbox, _rx) = SecuritySandbox::new();
        let monitor = sandbox.establish(policy("p", PluginSettings::default()), false).await;
        {
            let _scope = sandbox.enter("p").unwrap();
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(monitor.cpu_time() >= Duration::from_millis(5));
        assert_eq!(sandbox.snapshot("p").unwrap().calls, 1);
    }

    #[tokio::test]
    async fn scope_exit_records_memory_breach() {
        let (sandbox, mut rx) = SecuritySandbox::new();
        let settings = PluginSettings {
            max_memory_mb: 1,
            ..PluginSettings::default()
        };
        sandbox.establish(policy("p", settings), false).await;
        {
            let scope = sandbox.enter("p").unwrap();
            scope.record_memory(4 * 1024 * 1024);
        }

        let violations = sandbox.violations("p");
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, ViolationKind::Memory);
        assert_eq!(violations[0].observed, 4 * 1024 * 1024);
        assert!(matches!(rx.recv().await, Some(SandboxSignal::Violation(_))));
    }

    #[tokio::test]
    async fn network_budget_denies_fourth_request() {
        let (sandbox, _rx) = SecuritySandbox::new();
        sandbox.establish(policy("p", network_settings(3)), false).await;

        for _ in 0..3 {
            sandbox.authorize_network("p", "api.example.com").unwrap();
        }
        let err = sandbox.authorize_network("p", "api.example.com").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ResourceLimitExceeded);

        let violations = sandbox.violations("p");
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, ViolationKind::NetworkRequests);
        assert_eq!((violations[0].observed, violations[0].limit), (4, 3));
    }

    #[tokio::test]
    async fn disallowed_destination_is_permission_denied() {
        let (sandbox, _rx) = SecuritySandbox::new();
        sandbox.establish(policy("p", network_settings(3)), false).await;

        let err = sandbox.authorize_network("p", "evil.example.com").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::PermissionDenied);
        assert_eq!(sandbox.violations("p")[0].kind, ViolationKind::NetworkDestination);
        // Denied destinations do not consume the request budget
        assert_eq!(sandbox.monitor("p").unwrap().network_requests_in_window(), 0);
    }

    #[tokio::test]
    async fn threshold_escalates_exactly_once() {
        let (sandbox, mut rx) = SecuritySandbox::new();
        sandbox.establish(policy("p", PluginSettings::default()), false).await;

        for _ in 0..5 {
            sandbox.report_rejection("p", ViolationKind::PermissionDenied, 0, 0);
        }

        let mut force_fails = 0;
        let mut violations = 0;
        while let Ok(signal) = rx.try_recv() {
            match signal {
                SandboxSignal::Violation(_) => violations += 1,
                SandboxSignal::ForceFail { plugin, .. } => {
                    assert_eq!(plugin, "p");
                    force_fails += 1;
                }
            }
        }
        assert_eq!(violations, 5);
        assert_eq!(force_fails, 1);
    }

    #[tokio::test]
    async fn simultaneous_breaches_recorded_individually() {
        let (sandbox, mut rx) = SecuritySandbox::new();
        let settings = PluginSettings {
            max_memory_mb: 1,
            max_cpu_seconds: 0.001,
            violation_threshold: 2,
            ..PluginSettings::default()
        };
        sandbox.establish(policy("p", settings), false).await;
        sandbox.record_memory("p", 2 * 1024 * 1024);
        sandbox.monitor("p").unwrap().record_cpu(Duration::from_millis(10));

        let kinds = sandbox.sample("p");
        assert_eq!(kinds, vec![ViolationKind::Memory, ViolationKind::CpuTime]);
        assert_eq!(sandbox.violations("p").len(), 2);

        let force_fails = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|s| matches!(s, SandboxSignal::ForceFail { .. }))
            .count();
        assert_eq!(force_fails, 1);
    }

    #[tokio::test]
    async fn escalation_names_the_scope_generation() {
        let (sandbox, mut rx) = SecuritySandbox::new();
        assert_eq!(sandbox.generation("p"), None);
        sandbox.establish(policy("p", PluginSettings::default()), false).await;
        let first = sandbox.generation("p").unwrap();
        assert!(sandbox.is_current("p", first));

        for _ in 0..3 {
            sandbox.report_rejection("p", ViolationKind::PermissionDenied, 0, 0);
        }
        let escalated = std::iter::from_fn(|| rx.try_recv().ok()).find_map(|s| match s {
            SandboxSignal::ForceFail { generation, .. } => Some(generation),
            SandboxSignal::Violation(_) => None,
        });
        assert_eq!(escalated, Some(first));

        sandbox.establish(policy("p", PluginSettings::default()), true).await;
        let second = sandbox.generation("p").unwrap();
        assert!(second > first);
        assert!(!sandbox.is_current("p", first));

        // A torn down scope keeps its generation but is no longer current
        sandbox.teardown("p").await;
        assert_eq!(sandbox.generation("p"), Some(second));
        assert!(!sandbox.is_current("p", second));
    }

    #[tokio::test]
    async fn reestablish_resets_the_monitor_and_ignores_stale_handles() {
        let (sandbox, _rx) = SecuritySandbox::new();
        let first = sandbox.establish(policy("p", PluginSettings::default()), false).await;
        sandbox.record_memory("p", 512);
        let stale = sandbox.enter("p").unwrap();
        sandbox.teardown("p").await;

        let second = sandbox.establish(policy("p", PluginSettings::default()), false).await;
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!second.is_frozen());
        assert_eq!(second.memory_bytes(), 0);
        assert_eq!(sandbox.snapshot("p").unwrap().calls, 0);

        std::thread::sleep(Duration::from_millis(2));
        drop(stale);
        assert_eq!(second.cpu_time(), Duration::ZERO);
    }

    #[tokio::test]
    async fn rejection_without_scope_is_ignored() {
        let (sandbox, _rx) = SecuritySandbox::new();
        assert!(!sandbox.report_rejection("ghost", ViolationKind::NotActive, 0, 0));
        assert!(sandbox.violations("ghost").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sampling_task_detects_breach_on_tick() {
        let (sandbox, mut rx) = SecuritySandbox::new();
        let settings = PluginSettings {
            max_memory_mb: 1,
            sampling_interval_ms: 1_000,
            ..PluginSettings::default()
        };
        sandbox.establish(policy("p", settings), false).await;
        sandbox.record_memory("p", 2 * 1024 * 1024);

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        match rx.recv().await {
            Some(SandboxSignal::Violation(record)) => assert_eq!(record.kind, ViolationKind::Memory),
            other => panic!("unexpected signal: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn no_writes_after_teardown() {
        let (sandbox, _rx) = SecuritySandbox::new();
        let settings = PluginSettings {
            max_memory_mb: 1,
            sampling_interval_ms: 100,
            ..PluginSettings::default()
        };
        let monitor = sandbox.establish(policy("p", settings), false).await;
        sandbox.teardown("p").await;

        monitor.record_memory(10 * 1024 * 1024);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(monitor.memory_bytes(), 0);
        assert!(sandbox.violations("p").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn violations_outside_window_do_not_count() {
        let (sandbox, mut rx) = SecuritySandbox::new();
        let settings = PluginSettings {
            violation_window_secs: 10,
            ..PluginSettings::default()
        };
        sandbox.establish(policy("p", settings), false).await;

        sandbox.report_rejection("p", ViolationKind::RateLimited, 101, 100);
        sandbox.report_rejection("p", ViolationKind::RateLimited, 101, 100);
        tokio::time::advance(Duration::from_secs(11)).await;
        sandbox.report_rejection("p", ViolationKind::RateLimited, 101, 100);

        assert_eq!(sandbox.violations("p").len(), 3);
        assert_eq!(sandbox.violations_in_window("p").len(), 1);
        let escalated = std::iter::from_fn(|| rx.try_recv().ok())
            .any(|s| matches!(s, SandboxSignal::ForceFail { .. }));
        assert!(!escalated);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_on_establish_moves_epoch_but_keeps_trail() {
        let (sandbox, _rx) = SecuritySandbox::new();
        sandbox.establish(policy("p", PluginSettings::default()), false).await;
        sandbox.report_rejection("p", ViolationKind::Timeout, 5_000, 5_000);
        sandbox.report_rejection("p", ViolationKind::Timeout, 5_000, 5_000);
        sandbox.teardown("p").await;

        tokio::time::advance(Duration::from_millis(1)).await;
        sandbox.establish(policy("p", PluginSettings::default()), true).await;
        assert_eq!(sandbox.violations("p").len(), 2);
        assert!(sandbox.violations_in_window("p").is_empty());
    }
}
