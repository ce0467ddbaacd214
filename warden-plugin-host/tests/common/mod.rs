//! Shared fixtures for the plugin host integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use semver::Version;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tracing_subscriber::EnvFilter;
use warden_plugin_host::*;

pub struct Harness {
    pub manager: Arc<PluginManager>,
    pub registry: Arc<InMemoryRegistry>,
    pub loader: Arc<StaticLoader>,
}

impl Harness {
    /// Every capability approved by default so grants follow requests.
    pub fn new() -> Self {
        Self::with_config(permissive_config())
    }

    pub fn with_config(config: HostConfig) -> Self {
        Self::build(config, PolicyEngine::default())
    }

    pub fn build(config: HostConfig, engine: PolicyEngine) -> Self {
        init_tracing();
        let registry = Arc::new(InMemoryRegistry::new());
        let loader = Arc::new(StaticLoader::new());
        let manager = PluginManager::new(
            registry.clone(),
            Arc::new(BasicValidator),
            loader.clone(),
            engine,
            config,
        );
        manager
            .gateway()
            .register_provider(Capability::StatusQuery, Arc::new(EchoProvider));
        manager
            .gateway()
            .register_provider(Capability::NetworkFetch, Arc::new(EchoProvider));
        manager
            .gateway()
            .register_provider(Capability::TaskCreate, Arc::new(SlowProvider));
        Self {
            manager,
            registry,
            loader,
        }
    }

    /// Registers `descriptor` and a quiet plugin factory for it.
    pub async fn add(&self, descriptor: PluginDescriptor) {
        self.loader
            .register(descriptor.name.clone(), |_| Ok(Box::new(Quiet) as Box<dyn Plugin>));
        self.registry.upsert(descriptor).await.unwrap();
    }

    /// Discovers, validates, loads and activates one plugin.
    pub async fn start(&self, name: &str) {
        self.manager.discover(name).await.unwrap();
        self.manager.validate(name).await.unwrap();
        self.manager.load(name).await.unwrap();
        self.manager.activate(name).await.unwrap();
    }
}

/// Routes host logs to the test harness. Set `RUST_LOG` to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn permissive_config() -> HostConfig {
    HostConfig {
        defaults: PluginSettings {
            permissions: CapabilitySet::all(),
            ..PluginSettings::default()
        },
        ..HostConfig::default()
    }
}

pub fn plugin(name: &str, version: &str) -> PluginDescriptor {
    PluginDescriptor::new(name, Version::parse(version).unwrap())
}

pub fn status_query(plugin: &str) -> ApiRequest {
    ApiRequest::new(plugin, Capability::StatusQuery, "status").with_payload(json!({ "ping": true }))
}

/// Waits for the next event that moves `plugin` into `state`.
pub async fn wait_for_state(
    events: &mut broadcast::Receiver<LifecycleEvent>,
    plugin: &str,
    state: LifecycleState,
) -> LifecycleEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            if event.plugin == plugin && event.to == state {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for lifecycle event")
}

pub fn drain(events: &mut broadcast::Receiver<LifecycleEvent>) -> Vec<LifecycleEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

// ================================================================
// Plugins
// ================================================================

/// Does nothing successfully.
pub struct Quiet;

#[async_trait]
impl Plugin for Quiet {
    async fn load(&mut self, _config: &PluginConfig) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Counts health checks and carries the count across reloads.
#[derive(Default)]
pub struct Counter {
    hits: AtomicU64,
    export_delay: Duration,
}

impl Counter {
    /// A counter whose state export takes `delay`.
    pub fn slow_export(delay: Duration) -> Self {
        Self {
            export_delay: delay,
            ..Self::default()
        }
    }
}

#[async_trait]
impl Plugin for Counter {
    async fn load(&mut self, _config: &PluginConfig) -> anyhow::Result<()> {
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        self.hits.fetch_add(1, Ordering::SeqCst);
        HealthStatus::Healthy
    }

    async fn export_state(&self) -> anyhow::Result<StateSnapshot> {
        tokio::time::sleep(self.export_delay).await;
        Ok(StateSnapshot::from_value(json!({ "hits": self.hits.load(Ordering::SeqCst) })))
    }

    async fn import_state(&mut self, snapshot: StateSnapshot) -> anyhow::Result<()> {
        let hits = snapshot.as_value()["hits"]
            .as_u64()
            .ok_or_else(|| anyhow::anyhow!("snapshot has no hit count"))?;
        self.hits.store(hits, Ordering::SeqCst);
        Ok(())
    }
}

pub fn hits(snapshot: &StateSnapshot) -> u64 {
    snapshot.as_value()["hits"].as_u64().unwrap()
}

/// Fails its activate hook.
pub struct BrokenActivate;

#[async_trait]
impl Plugin for BrokenActivate {
    async fn load(&mut self, _config: &PluginConfig) -> anyhow::Result<()> {
        Ok(())
    }

    async fn activate(&mut self) -> anyhow::Result<()> {
        anyhow::bail!("listener port already in use")
    }
}

/// Blocks inside its activate hook until released.
pub struct Gated {
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

#[async_trait]
impl Plugin for Gated {
    async fn load(&mut self, _config: &PluginConfig) -> anyhow::Result<()> {
        Ok(())
    }

    async fn activate(&mut self) -> anyhow::Result<()> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(())
    }
}

// ================================================================
// Capability providers
// ================================================================

/// Returns the request payload tagged with the method.
pub struct EchoProvider;

#[async_trait]
impl CapabilityProvider for EchoProvider {
    async fn invoke(&self, method: &str, payload: Value) -> anyhow::Result<Value> {
        Ok(json!({ "method": method, "echo": payload }))
    }
}

/// Sleeps for `payload.delay_ms` before echoing the payload.
pub struct SlowProvider;

#[async_trait]
impl CapabilityProvider for SlowProvider {
    async fn invoke(&self, _method: &str, payload: Value) -> anyhow::Result<Value> {
        let delay = payload["delay_ms"].as_u64().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        Ok(payload)
    }
}
