//! Central plugin lifecycle manager.
//!
//! Owns the plugin table, drives every lifecycle transition, and wires
//! each transition to the sandbox (scope establish/teardown) and the
//! gateway (binding open/close). Operations on different plugins run in
//! parallel; operations on the same plugin are serialized by a per-plugin
//! lock and a second concurrent request is rejected with `Busy`.

use crate::config::{HostConfig, PluginSettings};
use crate::dependency::{resolve_load_order, DependencyResolution};
use crate::descriptor::PluginDescriptor;
use crate::error::PluginHostError;
use crate::gateway::ApiGateway;
use crate::lifecycle::{LifecycleEvent, LifecycleState};
use crate::monitor::{MonitorSnapshot, ViolationRecord};
use crate::permissions::CapabilitySet;
use crate::policy::{PolicyEngine, SecurityPolicy};
use crate::registry::{Loader, Registry, ValidationReport, Validator};
use crate::sandbox::{SandboxSignal, SecuritySandbox};
use semver::Version;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info, warn};
use warden_plugin_sdk::{HealthStatus, Plugin, PluginConfig, StateSnapshot};
use warden_types::InstanceId;

type Instance = Arc<Mutex<Box<dyn Plugin>>>;

const EVENT_CAPACITY: usize = 256;

/// One entry of the plugin table.
struct PluginSlot {
    /// Held for the whole of a lifecycle operation.
    ops: Mutex<()>,
    /// Committed state. Never held across an await.
    record: RwLock<PluginRecord>,
}

struct PluginRecord {
    descriptor: PluginDescriptor,
    state: LifecycleState,
    policy: Option<Arc<SecurityPolicy>>,
    instance: Option<Instance>,
    instance_id: Option<InstanceId>,
    validation: Option<ValidationReport>,
    last_metrics: Option<MonitorSnapshot>,
    last_error: Option<String>,
}

impl PluginSlot {
    fn new(descriptor: PluginDescriptor) -> Self {
        Self {
            ops: Mutex::new(()),
            record: RwLock::new(PluginRecord {
                descriptor,
                state: LifecycleState::Discovered,
                policy: None,
                instance: None,
                instance_id: None,
                validation: None,
                last_metrics: None,
                last_error: None,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, PluginRecord> {
        self.record.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, PluginRecord> {
        self.record.write().unwrap_or_else(|e| e.into_inner())
    }

    fn state(&self) -> LifecycleState {
        self.read().state
    }
}

/// Read-only view of one plugin for listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginSummary {
    pub name: String,
    pub version: Version,
    pub state: LifecycleState,
    pub granted: Option<CapabilitySet>,
    pub instance_id: Option<InstanceId>,
    pub validation_warnings: Vec<String>,
    pub last_error: Option<String>,
}

/// Outcome of a batch operation such as [`PluginManager::start_all`].
#[derive(Debug, Default)]
pub struct BatchReport {
    pub succeeded: Vec<String>,
    pub failures: Vec<(String, PluginHostError)>,
}

impl BatchReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failure(&self, plugin: &str) -> Option<&PluginHostError> {
        self.failures
            .iter()
            .find(|(name, _)| name == plugin)
            .map(|(_, err)| err)
    }
}

/// Manages the lifecycle of every plugin known to the host.
pub struct PluginManager {
    registry: Arc<dyn Registry>,
    validator: Arc<dyn Validator>,
    loader: Arc<dyn Loader>,
    policy_engine: PolicyEngine,
    config: HostConfig,
    sandbox: SecuritySandbox,
    gateway: Arc<ApiGateway>,
    plugins: RwLock<HashMap<String, Arc<PluginSlot>>>,
    events: broadcast::Sender<LifecycleEvent>,
}

impl PluginManager {
    /// Creates a manager and spawns the supervisor that acts on sandbox
    /// signals. Must be called from within a tokio runtime.
    pub fn new(
        registry: Arc<dyn Registry>,
        validator: Arc<dyn Validator>,
        loader: Arc<dyn Loader>,
        policy_engine: PolicyEngine,
        config: HostConfig,
    ) -> Arc<Self> {
        let (sandbox, signals) = SecuritySandbox::new();
        let gateway = Arc::new(ApiGateway::new(sandbox.clone()));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let manager = Arc::new(Self {
            registry,
            validator,
            loader,
            policy_engine,
            config,
            sandbox,
            gateway,
            plugins: RwLock::new(HashMap::new()),
            events,
        });
        spawn_supervisor(Arc::downgrade(&manager), signals);
        manager
    }

    // ================================================================
    // Discovery / validation
    // ================================================================

    /// Looks `name` up in the registry and adds it to the plugin table as
    /// `Discovered`. A plugin that is already tracked keeps its state,
    /// unless it is `Failed` or `Unloaded`, in which case it starts over.
    pub async fn discover(&self, name: &str) -> Result<LifecycleState, PluginHostError> {
        let descriptor = self
            .registry
            .find(name)
            .await
            .map_err(|e| PluginHostError::Provider(format!("registry lookup failed: {e:#}")))?
            .ok_or_else(|| PluginHostError::PluginNotFound(name.to_string()))?;
        self.track(descriptor)
    }

    fn track(&self, descriptor: PluginDescriptor) -> Result<LifecycleState, PluginHostError> {
        let name = descriptor.name.clone();
        let mut plugins = self.write_plugins();
        if let Some(existing) = plugins.get(&name) {
            if existing.ops.try_lock().is_err() {
                return Err(PluginHostError::Busy(name));
            }
            let state = existing.state();
            if !state.is_terminal() {
                return Ok(state);
            }
        }
        plugins.insert(name.clone(), Arc::new(PluginSlot::new(descriptor)));
        drop(plugins);
        info!(plugin = %name, "Plugin discovered");
        Ok(LifecycleState::Discovered)
    }

    /// Runs admission policy, the external validator, and the dependency
    /// check. Any failure moves the plugin to `Failed`.
    pub async fn validate(&self, name: &str) -> Result<ValidationReport, PluginHostError> {
        let slot = self.slot(name)?;
        let _op = try_lock(&slot, name)?;
        self.expect_state(&slot, name, &[LifecycleState::Discovered], LifecycleState::Validated)?;
        let descriptor = slot.read().descriptor.clone();

        if !self.policy_engine.is_plugin_allowed(name) {
            let err = PluginHostError::PolicyDenied(format!("plugin '{name}' blocked by policy"));
            return Err(self.fail_with(&slot, name, err));
        }

        let report = match self.validator.validate(&descriptor).await {
            Ok(report) => report,
            Err(e) => {
                let err = PluginHostError::ValidationFailed {
                    plugin: name.to_string(),
                    reason: e.to_string(),
                };
                return Err(self.fail_with(&slot, name, err));
            }
        };

        if let Err(reason) = self.check_dependency_graph(&descriptor).await {
            let err = PluginHostError::DependencyUnsatisfied {
                plugin: name.to_string(),
                reason,
            };
            return Err(self.fail_with(&slot, name, err));
        }

        for warning in &report.warnings {
            warn!(plugin = %name, "Validation warning: {}", warning);
        }
        slot.write().validation = Some(report.clone());
        self.transition(&slot, name, LifecycleState::Validated, "validation passed")?;
        Ok(report)
    }

    /// Resolves `descriptor`'s dependency closure against the registry.
    async fn check_dependency_graph(&self, descriptor: &PluginDescriptor) -> Result<(), String> {
        let catalog: HashMap<String, PluginDescriptor> = self
            .registry
            .list()
            .await
            .map_err(|e| format!("registry listing failed: {e:#}"))?
            .into_iter()
            .map(|d| (d.name.clone(), d))
            .collect();

        let mut closure = vec![descriptor.clone()];
        let mut seen = BTreeSet::from([descriptor.name.clone()]);
        let mut queue: VecDeque<&PluginDescriptor> = VecDeque::from([descriptor]);
        while let Some(current) = queue.pop_front() {
            for dep in &current.dependencies {
                if let Some(found) = catalog.get(&dep.name) {
                    if seen.insert(found.name.clone()) {
                        closure.push(found.clone());
                        queue.push_back(found);
                    }
                }
            }
        }

        let DependencyResolution { failures, .. } = resolve_load_order(&closure, &catalog);
        match failures.get(&descriptor.name) {
            Some(failure) => Err(failure.to_string()),
            None => Ok(()),
        }
    }

    // ================================================================
    // Load / activate / deactivate / unload
    // ================================================================

    /// Builds the security policy, imports the plugin through the loader,
    /// and runs its `load` hook. Every declared dependency must already be
    /// `Active`.
    pub async fn load(&self, name: &str) -> Result<(), PluginHostError> {
        let slot = self.slot(name)?;
        let _op = try_lock(&slot, name)?;
        self.expect_state(&slot, name, &[LifecycleState::Validated], LifecycleState::Loaded)?;
        let descriptor = slot.read().descriptor.clone();

        if let Err(err) = self.check_dependencies_active(&descriptor) {
            // Missing or failed dependencies are terminal; inactive ones are not
            if err.terminal {
                let err = PluginHostError::DependencyUnsatisfied {
                    plugin: name.to_string(),
                    reason: err.reason,
                };
                return Err(self.fail_with(&slot, name, err));
            }
            return Err(PluginHostError::DependencyUnsatisfied {
                plugin: name.to_string(),
                reason: err.reason,
            });
        }

        let settings = self.config.settings_for(name);
        let policy = match SecurityPolicy::build(&descriptor, settings, &self.policy_engine) {
            Ok(policy) => Arc::new(policy),
            Err(e) => {
                let err = PluginHostError::LoadFailed {
                    plugin: name.to_string(),
                    reason: e.to_string(),
                };
                return Err(self.fail_with(&slot, name, err));
            }
        };

        let instance = match self.instantiate(&descriptor, settings).await {
            Ok(instance) => instance,
            Err(reason) => {
                let err = PluginHostError::LoadFailed {
                    plugin: name.to_string(),
                    reason,
                };
                return Err(self.fail_with(&slot, name, err));
            }
        };

        {
            let mut record = slot.write();
            record.policy = Some(policy);
            record.instance = Some(instance);
            record.instance_id = Some(InstanceId::new());
            record.last_error = None;
        }
        self.transition(&slot, name, LifecycleState::Loaded, "plugin loaded")?;
        Ok(())
    }

    /// Imports a fresh instance and runs its `load` hook.
    async fn instantiate(
        &self,
        descriptor: &PluginDescriptor,
        settings: &PluginSettings,
    ) -> Result<Instance, String> {
        let mut plugin = self
            .loader
            .import(descriptor)
            .await
            .map_err(|e| format!("loader failed: {e:#}"))?;
        let config = PluginConfig::new(descriptor.name.clone(), descriptor.version.to_string())
            .with_settings(settings.settings.clone());
        run_hook("load", settings.hook_timeout(), plugin.load(&config)).await?;
        Ok(Arc::new(Mutex::new(plugin)))
    }

    /// Establishes the sandbox scope and runs the `activate` hook inside
    /// it. On failure the plugin stays `Loaded` and the scope is torn down.
    pub async fn activate(&self, name: &str) -> Result<(), PluginHostError> {
        let slot = self.slot(name)?;
        let _op = try_lock(&slot, name)?;
        self.expect_state(&slot, name, &[LifecycleState::Loaded], LifecycleState::Active)?;
        let (policy, instance) = self.loaded_parts(&slot, name)?;

        if let Err(reason) = self.start_instance(name, &policy, &instance, false).await {
            slot.write().last_error = Some(reason.clone());
            return Err(PluginHostError::ActivationFailed {
                plugin: name.to_string(),
                reason,
            });
        }
        self.transition(&slot, name, LifecycleState::Active, "plugin activated")?;
        Ok(())
    }

    /// Establishes a scope and runs `activate` in it, tearing the scope
    /// down again on failure.
    async fn start_instance(
        &self,
        name: &str,
        policy: &Arc<SecurityPolicy>,
        instance: &Instance,
        reset_violations: bool,
    ) -> Result<(), String> {
        self.sandbox.establish(Arc::clone(policy), reset_violations).await;
        let result = {
            let scope = self.sandbox.enter(name).map_err(|e| e.to_string());
            match scope {
                Ok(_scope) => {
                    let mut plugin = instance.lock().await;
                    run_hook("activate", self.hook_timeout(name), plugin.activate()).await
                }
                Err(e) => Err(e),
            }
        };
        if result.is_err() {
            self.sandbox.teardown(name).await;
        }
        result
    }

    /// Closes the gateway binding, runs the `deactivate` hook, and tears
    /// down the sandbox scope. Deactivating an already `Deactivated`
    /// plugin is a successful no-op.
    pub async fn deactivate(&self, name: &str) -> Result<(), PluginHostError> {
        let slot = self.slot(name)?;
        let _op = try_lock(&slot, name)?;
        if slot.state() == LifecycleState::Deactivated {
            debug!(plugin = %name, "Plugin already deactivated");
            return Ok(());
        }
        self.expect_state(&slot, name, &[LifecycleState::Active], LifecycleState::Deactivated)?;

        let instance = slot.read().instance.clone();
        self.stop_instance(&slot, name, instance.as_ref()).await;
        self.transition(&slot, name, LifecycleState::Deactivated, "plugin deactivated")?;
        Ok(())
    }

    /// Closes the binding, runs `deactivate` inside the scope, then tears
    /// the scope down and keeps its final metrics. Hook errors are logged.
    async fn stop_instance(&self, slot: &PluginSlot, name: &str, instance: Option<&Instance>) {
        self.gateway.close(name);
        match instance {
            Some(instance) => {
                let mut plugin = instance.lock().await;
                self.stop_locked(slot, name, Some(&mut *plugin)).await;
            }
            None => self.stop_locked(slot, name, None).await,
        }
    }

    /// [`Self::stop_instance`] for a caller already holding the instance.
    async fn stop_locked(&self, slot: &PluginSlot, name: &str, plugin: Option<&mut Box<dyn Plugin>>) {
        self.gateway.close(name);
        if let Some(plugin) = plugin {
            let _scope = self.sandbox.enter(name).ok();
            if let Err(reason) = run_hook("deactivate", self.hook_timeout(name), plugin.deactivate()).await {
                warn!(plugin = %name, "{}", reason);
            }
        }
        if let Some(metrics) = self.sandbox.teardown(name).await {
            slot.write().last_metrics = Some(metrics);
        }
    }

    /// Runs the `unload` hook and drops the instance.
    pub async fn unload(&self, name: &str) -> Result<(), PluginHostError> {
        let slot = self.slot(name)?;
        let _op = try_lock(&slot, name)?;
        self.expect_state(&slot, name, &[LifecycleState::Deactivated], LifecycleState::Unloaded)?;

        let instance = slot.write().instance.take();
        if let Some(instance) = instance {
            release_instance(name, &instance, self.hook_timeout(name)).await;
        }
        slot.write().policy = None;
        self.transition(&slot, name, LifecycleState::Unloaded, "plugin unloaded")?;
        Ok(())
    }

    // ================================================================
    // Hot reload
    // ================================================================

    /// Replaces the plugin with the version currently in the registry,
    /// carrying its exported state across.
    ///
    /// The new version is fully prepared (validated, loaded, state
    /// imported) before the old one is touched. The old instance stays
    /// locked from its state export until it is stopped, so nothing can
    /// change the exported state in between. If the new version then
    /// fails to activate, the old version is re-activated with its old
    /// policy and `ReloadFailed` is returned. The plugin ends `Active` if
    /// it was `Active`, `Loaded` otherwise.
    pub async fn reload(&self, name: &str) -> Result<(), PluginHostError> {
        let slot = self.slot(name)?;
        let _op = try_lock(&slot, name)?;
        let from = slot.state();
        if !from.is_reloadable() {
            return Err(PluginHostError::InvalidTransition {
                plugin: name.to_string(),
                from,
                to: LifecycleState::Loaded,
            });
        }
        let reload_failed = |reason: String| PluginHostError::ReloadFailed {
            plugin: name.to_string(),
            reason,
        };

        let descriptor = self
            .registry
            .find(name)
            .await
            .map_err(|e| reload_failed(format!("registry lookup failed: {e:#}")))?
            .ok_or_else(|| reload_failed("plugin no longer in registry".to_string()))?;

        self.check_dependents_compatible(name, &descriptor.version)
            .map_err(reload_failed)?;
        if !self.policy_engine.is_plugin_allowed(name) {
            return Err(reload_failed(format!("plugin '{name}' blocked by policy")));
        }
        let report = self
            .validator
            .validate(&descriptor)
            .await
            .map_err(|e| reload_failed(format!("validation failed: {e}")))?;
        self.check_dependencies_active(&descriptor)
            .map_err(|e| reload_failed(e.reason))?;

        let settings = self.config.settings_for(name);
        let new_policy = Arc::new(
            SecurityPolicy::build(&descriptor, settings, &self.policy_engine)
                .map_err(|e| reload_failed(e.to_string()))?,
        );
        let (old_policy, old_instance) = self.loaded_parts(&slot, name)?;

        let mut outgoing = old_instance.lock().await;
        let snapshot = run_hook("export_state", settings.hook_timeout(), outgoing.export_state())
            .await
            .map_err(reload_failed)?;

        let new_instance = self.instantiate(&descriptor, settings).await.map_err(reload_failed)?;
        let imported = {
            let mut plugin = new_instance.lock().await;
            run_hook("import_state", settings.hook_timeout(), plugin.import_state(snapshot)).await
        };
        if let Err(reason) = imported {
            drop(outgoing);
            release_instance(name, &new_instance, settings.hook_timeout()).await;
            return Err(reload_failed(reason));
        }

        if from == LifecycleState::Active {
            self.stop_locked(&slot, name, Some(&mut *outgoing)).await;
        }
        drop(outgoing);

        if from == LifecycleState::Active {
            let reset = self.config.reset_violations_on_reload;
            if let Err(reason) = self.start_instance(name, &new_policy, &new_instance, reset).await {
                release_instance(name, &new_instance, settings.hook_timeout()).await;
                return Err(self.roll_back(&slot, name, &old_policy, &old_instance, reason).await);
            }
        }

        release_instance(name, &old_instance, settings.hook_timeout()).await;
        let old_version = {
            let mut record = slot.write();
            let old_version = record.descriptor.version.clone();
            record.descriptor = descriptor;
            record.policy = Some(new_policy);
            record.instance = Some(new_instance);
            record.instance_id = Some(InstanceId::new());
            record.validation = Some(report);
            record.last_error = None;
            old_version
        };

        let new_version = slot.read().descriptor.version.clone();
        self.transition(
            &slot,
            name,
            LifecycleState::Loaded,
            format!("reloaded {old_version} -> {new_version}"),
        )?;
        if from == LifecycleState::Active {
            self.transition(&slot, name, LifecycleState::Active, "reactivated after reload")?;
        }
        Ok(())
    }

    /// Restores the previous generation after the new one failed to
    /// activate. The plugin is failed if the old one cannot come back.
    async fn roll_back(
        &self,
        slot: &PluginSlot,
        name: &str,
        old_policy: &Arc<SecurityPolicy>,
        old_instance: &Instance,
        reason: String,
    ) -> PluginHostError {
        warn!(plugin = %name, %reason, "Reload activation failed, rolling back");
        match self.start_instance(name, old_policy, old_instance, false).await {
            Ok(()) => {
                self.gateway.open(Arc::clone(old_policy));
                slot.write().last_error = Some(reason.clone());
                self.emit(LifecycleEvent::new(
                    name,
                    LifecycleState::Active,
                    LifecycleState::Active,
                    format!("reload rolled back: {reason}"),
                ));
                PluginHostError::ReloadFailed {
                    plugin: name.to_string(),
                    reason,
                }
            }
            Err(restore) => {
                let reason = format!("{reason}; previous version failed to restore: {restore}");
                error!(plugin = %name, %reason, "Reload rollback failed");
                let instance = slot.write().instance.take();
                if let Some(instance) = instance {
                    release_instance(name, &instance, self.hook_timeout(name)).await;
                }
                slot.write().last_error = Some(reason.clone());
                if let Err(e) = self.transition(slot, name, LifecycleState::Failed, reason.clone()) {
                    error!(plugin = %name, "Could not mark plugin failed: {}", e);
                }
                PluginHostError::ReloadFailed {
                    plugin: name.to_string(),
                    reason,
                }
            }
        }
    }

    /// Refuses a reload whose new version would break an active dependent.
    fn check_dependents_compatible(&self, name: &str, version: &Version) -> Result<(), String> {
        for (other, slot) in self.read_plugins().iter() {
            if other == name {
                continue;
            }
            let record = slot.read();
            if record.state != LifecycleState::Active {
                continue;
            }
            if let Some(dep) = record.descriptor.depends_on_name(name) {
                if !dep.is_satisfied_by(version) {
                    return Err(format!(
                        "active dependent '{other}' requires {name} {} but the new version is {version}",
                        dep.range
                    ));
                }
            }
        }
        Ok(())
    }

    // ================================================================
    // Batch operations
    // ================================================================

    /// Discovers every registry entry, validates the new ones, then loads
    /// and activates them in dependency order.
    pub async fn start_all(&self) -> Result<BatchReport, PluginHostError> {
        let descriptors = self
            .registry
            .list()
            .await
            .map_err(|e| PluginHostError::Provider(format!("registry listing failed: {e:#}")))?;
        let mut report = BatchReport::default();

        for descriptor in &descriptors {
            if let Err(e) = self.track(descriptor.clone()) {
                report.failures.push((descriptor.name.clone(), e));
            }
        }

        let mut validated = Vec::new();
        for descriptor in &descriptors {
            let state = self.state(&descriptor.name).ok();
            if state == Some(LifecycleState::Discovered) {
                if let Err(e) = self.validate(&descriptor.name).await {
                    report.failures.push((descriptor.name.clone(), e));
                    continue;
                }
            }
            if self.state(&descriptor.name).ok() == Some(LifecycleState::Validated) {
                validated.push(descriptor.clone());
            }
        }

        let catalog: HashMap<String, PluginDescriptor> = descriptors
            .iter()
            .map(|d| (d.name.clone(), d.clone()))
            .collect();
        let resolution = resolve_load_order(&validated, &catalog);

        for name in &resolution.order {
            let started = match self.load(name).await {
                Ok(()) => self.activate(name).await,
                Err(e) => Err(e),
            };
            match started {
                Ok(()) => report.succeeded.push(name.clone()),
                Err(e) => report.failures.push((name.clone(), e)),
            }
        }
        for name in resolution.failures.keys() {
            // load() reports the precise reason and fails the plugin if needed
            if let Err(e) = self.load(name).await {
                report.failures.push((name.clone(), e));
            }
        }

        info!(
            started = report.succeeded.len(),
            failed = report.failures.len(),
            "Plugin startup complete"
        );
        Ok(report)
    }

    /// Deactivates and unloads every plugin, dependents first.
    pub async fn shutdown(&self) -> BatchReport {
        let tracked: Vec<PluginDescriptor> = self
            .read_plugins()
            .values()
            .filter(|slot| {
                matches!(
                    slot.state(),
                    LifecycleState::Active | LifecycleState::Deactivated
                )
            })
            .map(|slot| slot.read().descriptor.clone())
            .collect();
        let catalog: HashMap<String, PluginDescriptor> = tracked
            .iter()
            .map(|d| (d.name.clone(), d.clone()))
            .collect();
        let resolution = resolve_load_order(&tracked, &catalog);
        let mut order = resolution.order;
        // Anything the resolver could not order still has to stop
        order.extend(resolution.failures.into_keys());
        order.reverse();

        let mut report = BatchReport::default();
        for name in order {
            let stopped = match self.deactivate(&name).await {
                Ok(()) => self.unload(&name).await,
                Err(e) => Err(e),
            };
            match stopped {
                Ok(()) => report.succeeded.push(name),
                Err(e) => report.failures.push((name, e)),
            }
        }
        info!(stopped = report.succeeded.len(), "Plugin host shut down");
        report
    }

    /// Forgets a plugin that is not running. Its violation trail goes too.
    pub fn remove(&self, name: &str) -> Result<(), PluginHostError> {
        let slot = self.slot(name)?;
        let _op = try_lock(&slot, name)?;
        let state = slot.state();
        if matches!(
            state,
            LifecycleState::Loaded | LifecycleState::Active | LifecycleState::Deactivated
        ) {
            return Err(PluginHostError::InvalidTransition {
                plugin: name.to_string(),
                from: state,
                to: LifecycleState::Unloaded,
            });
        }
        self.write_plugins().remove(name);
        self.sandbox.forget(name);
        info!(plugin = %name, "Plugin removed");
        Ok(())
    }

    // ================================================================
    // Forced failure
    // ================================================================

    /// Moves an `Active` or `Deactivated` plugin to `Failed` on the
    /// sandbox's request. Waits for any in-flight operation instead of
    /// returning `Busy`.
    ///
    /// A request raised by a scope that has since been replaced only
    /// applies if the violations counted now still reach the threshold.
    async fn force_fail(&self, name: &str, generation: u64, reason: &str) {
        let Ok(slot) = self.slot(name) else {
            return;
        };
        let _op = slot.ops.lock().await;
        let state = slot.state();
        if !matches!(state, LifecycleState::Active | LifecycleState::Deactivated) {
            debug!(plugin = %name, %state, "Ignoring forced failure for plugin that is not running");
            return;
        }
        if self.sandbox.generation(name) != Some(generation) {
            let threshold = slot
                .read()
                .policy
                .as_ref()
                .map(|policy| policy.violation_threshold() as usize);
            let counted = self.sandbox.violations_in_window(name).len();
            if threshold.is_none_or(|threshold| counted < threshold) {
                info!(
                    plugin = %name,
                    generation,
                    counted,
                    "Ignoring forced failure raised by a replaced scope"
                );
                return;
            }
        }

        let instance = slot.write().instance.take();
        if state == LifecycleState::Active {
            self.stop_instance(&slot, name, instance.as_ref()).await;
        }
        if let Some(instance) = instance {
            release_instance(name, &instance, self.hook_timeout(name)).await;
        }
        {
            let mut record = slot.write();
            record.policy = None;
            record.last_error = Some(reason.to_string());
        }
        match self.transition(&slot, name, LifecycleState::Failed, reason) {
            Ok(()) => error!(plugin = %name, %reason, "Plugin forced to failed state"),
            Err(e) => error!(plugin = %name, "Forced failure could not be committed: {}", e),
        }
    }

    // ================================================================
    // Queries
    // ================================================================

    /// Runs the plugin's health check inside its sandbox scope.
    pub async fn health_check(&self, name: &str) -> Result<HealthStatus, PluginHostError> {
        let slot = self.slot(name)?;
        let instance = {
            let record = slot.read();
            if record.state != LifecycleState::Active {
                return Err(PluginHostError::NotActive {
                    plugin: name.to_string(),
                });
            }
            record.instance.clone()
        };
        let instance = instance.ok_or_else(|| PluginHostError::NotActive {
            plugin: name.to_string(),
        })?;

        let scope = self.sandbox.enter(name)?;
        let plugin = instance.lock().await;
        // The instance may have been stopped while we waited for it
        if !self.sandbox.is_current(name, scope.generation()) {
            return Err(PluginHostError::NotActive {
                plugin: name.to_string(),
            });
        }
        let timeout = self.hook_timeout(name);
        match tokio::time::timeout(timeout, plugin.health_check()).await {
            Ok(status) => Ok(status),
            Err(_) => Ok(HealthStatus::Unhealthy(format!(
                "health check timed out after {}ms",
                timeout.as_millis()
            ))),
        }
    }

    /// Captures the plugin's exportable state without reloading it.
    pub async fn export_state(&self, name: &str) -> Result<StateSnapshot, PluginHostError> {
        let slot = self.slot(name)?;
        let instance = slot.read().instance.clone().ok_or_else(|| PluginHostError::NotActive {
            plugin: name.to_string(),
        })?;
        let plugin = instance.lock().await;
        run_hook("export_state", self.hook_timeout(name), plugin.export_state())
            .await
            .map_err(PluginHostError::Provider)
    }

    pub fn state(&self, name: &str) -> Result<LifecycleState, PluginHostError> {
        Ok(self.slot(name)?.state())
    }

    pub fn descriptor(&self, name: &str) -> Result<PluginDescriptor, PluginHostError> {
        Ok(self.slot(name)?.read().descriptor.clone())
    }

    pub fn policy(&self, name: &str) -> Result<Option<Arc<SecurityPolicy>>, PluginHostError> {
        Ok(self.slot(name)?.read().policy.clone())
    }

    /// Summaries of every tracked plugin, sorted by name.
    pub fn list(&self) -> Vec<PluginSummary> {
        let mut summaries: Vec<PluginSummary> = self
            .read_plugins()
            .iter()
            .map(|(name, slot)| {
                let record = slot.read();
                PluginSummary {
                    name: name.clone(),
                    version: record.descriptor.version.clone(),
                    state: record.state,
                    granted: record.policy.as_ref().map(|p| p.granted().clone()),
                    instance_id: record.instance_id,
                    validation_warnings: record
                        .validation
                        .as_ref()
                        .map(|v| v.warnings.clone())
                        .unwrap_or_default(),
                    last_error: record.last_error.clone(),
                }
            })
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    pub fn violations(&self, name: &str) -> Vec<ViolationRecord> {
        self.sandbox.violations(name)
    }

    /// Live metrics for an active plugin, or the final snapshot taken
    /// when its last scope was torn down.
    pub fn metrics(&self, name: &str) -> Option<MonitorSnapshot> {
        self.sandbox
            .snapshot(name)
            .or_else(|| self.slot(name).ok()?.read().last_metrics.clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    pub fn gateway(&self) -> Arc<ApiGateway> {
        Arc::clone(&self.gateway)
    }

    pub fn sandbox(&self) -> &SecuritySandbox {
        &self.sandbox
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn policy_engine(&self) -> &PolicyEngine {
        &self.policy_engine
    }

    // ================================================================
    // Internals
    // ================================================================

    fn slot(&self, name: &str) -> Result<Arc<PluginSlot>, PluginHostError> {
        self.read_plugins()
            .get(name)
            .cloned()
            .ok_or_else(|| PluginHostError::PluginNotFound(name.to_string()))
    }

    fn read_plugins(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<PluginSlot>>> {
        self.plugins.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_plugins(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<PluginSlot>>> {
        self.plugins.write().unwrap_or_else(|e| e.into_inner())
    }

    fn hook_timeout(&self, name: &str) -> Duration {
        self.config.settings_for(name).hook_timeout()
    }

    fn expect_state(
        &self,
        slot: &PluginSlot,
        name: &str,
        allowed: &[LifecycleState],
        to: LifecycleState,
    ) -> Result<(), PluginHostError> {
        let from = slot.state();
        if allowed.contains(&from) {
            Ok(())
        } else {
            Err(PluginHostError::InvalidTransition {
                plugin: name.to_string(),
                from,
                to,
            })
        }
    }

    fn loaded_parts(
        &self,
        slot: &PluginSlot,
        name: &str,
    ) -> Result<(Arc<SecurityPolicy>, Instance), PluginHostError> {
        let record = slot.read();
        match (&record.policy, &record.instance) {
            (Some(policy), Some(instance)) => Ok((Arc::clone(policy), Arc::clone(instance))),
            _ => Err(PluginHostError::LoadFailed {
                plugin: name.to_string(),
                reason: "plugin has no loaded instance".to_string(),
            }),
        }
    }

    /// Checks every declared dependency against committed state.
    fn check_dependencies_active(&self, descriptor: &PluginDescriptor) -> Result<(), DependencyGap> {
        let plugins = self.read_plugins();
        for dep in &descriptor.dependencies {
            let Some(slot) = plugins.get(&dep.name) else {
                return Err(DependencyGap::terminal(format!("missing dependency '{}'", dep.name)));
            };
            let record = slot.read();
            if record.state.is_terminal() {
                return Err(DependencyGap::terminal(format!(
                    "dependency '{}' is {}",
                    dep.name, record.state
                )));
            }
            if record.state != LifecycleState::Active {
                return Err(DependencyGap::pending(format!(
                    "dependency '{}' is {}, not active",
                    dep.name, record.state
                )));
            }
            if !dep.is_satisfied_by(&record.descriptor.version) {
                return Err(DependencyGap::terminal(format!(
                    "dependency '{}' requires {} but {} is active",
                    dep.name, dep.range, record.descriptor.version
                )));
            }
        }
        Ok(())
    }

    /// Commits a transition along an allowed edge and emits its event.
    /// The gateway binding is closed before the plugin leaves `Active` and
    /// opened after it enters `Active`.
    fn transition(
        &self,
        slot: &PluginSlot,
        name: &str,
        to: LifecycleState,
        reason: impl Into<String>,
    ) -> Result<(), PluginHostError> {
        let event = {
            let mut record = slot.write();
            let from = record.state;
            if !from.can_transition_to(to) {
                return Err(PluginHostError::InvalidTransition {
                    plugin: name.to_string(),
                    from,
                    to,
                });
            }
            if from == LifecycleState::Active {
                self.gateway.close(name);
            }
            record.state = to;
            if to == LifecycleState::Active {
                if let Some(policy) = &record.policy {
                    self.gateway.open(Arc::clone(policy));
                }
            }
            LifecycleEvent::new(name, from, to, reason)
        };
        info!(
            plugin = %name,
            from = %event.from,
            to = %event.to,
            reason = %event.reason,
            "Lifecycle transition"
        );
        self.emit(event);
        Ok(())
    }

    /// Fails the plugin and returns `err` for the caller.
    fn fail_with(&self, slot: &PluginSlot, name: &str, err: PluginHostError) -> PluginHostError {
        slot.write().last_error = Some(err.to_string());
        if let Err(e) = self.transition(slot, name, LifecycleState::Failed, err.to_string()) {
            warn!(plugin = %name, "Could not mark plugin failed: {}", e);
        }
        err
    }

    fn emit(&self, event: LifecycleEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }
}

/// Why a plugin's dependencies do not allow it to load right now.
struct DependencyGap {
    reason: String,
    /// The dependency can never become available without intervention.
    terminal: bool,
}

impl DependencyGap {
    fn terminal(reason: String) -> Self {
        Self {
            reason,
            terminal: true,
        }
    }

    fn pending(reason: String) -> Self {
        Self {
            reason,
            terminal: false,
        }
    }
}

fn try_lock<'a>(
    slot: &'a PluginSlot,
    name: &str,
) -> Result<tokio::sync::MutexGuard<'a, ()>, PluginHostError> {
    slot.ops
        .try_lock()
        .map_err(|_| PluginHostError::Busy(name.to_string()))
}

/// Runs one plugin hook with a deadline, flattening both failure modes
/// into a reason string.
async fn run_hook<T>(
    hook: &str,
    timeout: Duration,
    call: impl Future<Output = anyhow::Result<T>>,
) -> Result<T, String> {
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(format!("{hook} hook failed: {e:#}")),
        Err(_) => Err(format!("{hook} hook timed out after {}ms", timeout.as_millis())),
    }
}

/// Runs `unload` on an instance that is being discarded. Errors are logged.
async fn release_instance(name: &str, instance: &Instance, timeout: Duration) {
    let mut plugin = instance.lock().await;
    if let Err(reason) = run_hook("unload", timeout, plugin.unload()).await {
        warn!(plugin = %name, "{}", reason);
    }
}

fn spawn_supervisor(manager: Weak<PluginManager>, mut signals: mpsc::UnboundedReceiver<SandboxSignal>) {
    tokio::spawn(async move {
        while let Some(signal) = signals.recv().await {
            let Some(manager) = manager.upgrade() else {
                break;
            };
            match signal {
                SandboxSignal::Violation(record) => {
                    debug!(plugin = %record.plugin, kind = %record.kind, "Violation signal received");
                }
                SandboxSignal::ForceFail {
                    plugin,
                    generation,
                    reason,
                } => {
                    tokio::spawn(async move {
                        manager.force_fail(&plugin, generation, &reason).await;
                    });
                }
            }
        }
        debug!("Sandbox supervisor stopped");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{BasicValidator, InMemoryRegistry, StaticLoader};
    use async_trait::async_trait;

    struct Quiet;

    #[async_trait]
    impl Plugin for Quiet {
        async fn load(&mut self, _config: &PluginConfig) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn manager_with(descriptors: Vec<PluginDescriptor>) -> Arc<PluginManager> {
        let loader = StaticLoader::new();
        for descriptor in &descriptors {
            loader.register(descriptor.name.clone(), |_| Ok(Box::new(Quiet) as Box<dyn Plugin>));
        }
        PluginManager::new(
            Arc::new(InMemoryRegistry::with_descriptors(descriptors)),
            Arc::new(BasicValidator),
            Arc::new(loader),
            PolicyEngine::default(),
            HostConfig::default(),
        )
    }

    fn plugin(name: &str) -> PluginDescriptor {
        PluginDescriptor::new(name, Version::new(1, 0, 0))
    }

    #[tokio::test]
    async fn discover_unknown_plugin_is_not_found() {
        let manager = manager_with(vec![]);
        let err = manager.discover("acme.ghost").await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::PluginNotFound);
    }

    #[tokio::test]
    async fn discover_is_idempotent_for_tracked_plugin() {
        let manager = manager_with(vec![plugin("acme.a")]);
        manager.discover("acme.a").await.unwrap();
        manager.validate("acme.a").await.unwrap();
        assert_eq!(manager.discover("acme.a").await.unwrap(), LifecycleState::Validated);
    }

    #[tokio::test]
    async fn operations_out_of_order_are_invalid_transitions() {
        let manager = manager_with(vec![plugin("acme.a")]);
        manager.discover("acme.a").await.unwrap();

        let err = manager.activate("acme.a").await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidTransition);
        let err = manager.load("acme.a").await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidTransition);
        assert_eq!(manager.state("acme.a").unwrap(), LifecycleState::Discovered);
    }

    #[tokio::test]
    async fn full_lifecycle_emits_events() {
        let manager = manager_with(vec![plugin("acme.a")]);
        let mut events = manager.subscribe();

        manager.discover("acme.a").await.unwrap();
        manager.validate("acme.a").await.unwrap();
        manager.load("acme.a").await.unwrap();
        manager.activate("acme.a").await.unwrap();
        assert!(manager.gateway().is_open("acme.a"));
        manager.deactivate("acme.a").await.unwrap();
        assert!(!manager.gateway().is_open("acme.a"));
        manager.unload("acme.a").await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push((event.from, event.to));
        }
        use LifecycleState::*;
        assert_eq!(
            seen,
            vec![
                (Discovered, Validated),
                (Validated, Loaded),
                (Loaded, Active),
                (Active, Deactivated),
                (Deactivated, Unloaded),
            ]
        );
        assert!(manager.metrics("acme.a").unwrap().frozen);
    }

    #[tokio::test]
    async fn remove_refuses_running_plugin() {
        let manager = manager_with(vec![plugin("acme.a")]);
        manager.discover("acme.a").await.unwrap();
        manager.validate("acme.a").await.unwrap();
        manager.load("acme.a").await.unwrap();

        assert!(manager.remove("acme.a").is_err());
        manager.activate("acme.a").await.unwrap();
        manager.deactivate("acme.a").await.unwrap();
        manager.unload("acme.a").await.unwrap();
        manager.remove("acme.a").unwrap();
        assert!(manager.state("acme.a").is_err());
    }

    #[tokio::test]
    async fn list_is_sorted_and_reports_grants() {
        let manager = manager_with(vec![plugin("acme.b"), plugin("acme.a")]);
        manager.discover("acme.b").await.unwrap();
        manager.discover("acme.a").await.unwrap();

        let names: Vec<String> = manager.list().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["acme.a", "acme.b"]);
        assert!(manager.list()[0].granted.is_none());
    }
}
