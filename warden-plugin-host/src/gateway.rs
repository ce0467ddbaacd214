//! Plugin API gateway: the single entry point for plugin-to-host calls.
//!
//! Every request passes these gates in order:
//!
//! 1. the plugin must have an open binding (it is `Active`), else `NotActive`
//! 2. the capability must be in the plugin's granted set, else `PermissionDenied`
//! 3. the plugin's token bucket must have a token, else `RateLimited`
//! 4. network capabilities must pass the sandbox's destination and budget checks
//! 5. the call is routed to the registered provider inside a sandbox scope,
//!    bounded by the call timeout
//!
//! Rejections at gates 1-3 and timeouts are reported to the sandbox so
//! repeated abuse counts toward forced termination.

use crate::error::{ErrorKind, PluginHostError};
use crate::monitor::ViolationKind;
use crate::permissions::Capability;
use crate::policy::SecurityPolicy;
use crate::rate_limit::TokenBucket;
use crate::sandbox::SecuritySandbox;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, warn};
use warden_types::CorrelationId;

/// A host capability implementation, registered per [`Capability`] at startup.
#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    async fn invoke(&self, method: &str, payload: Value) -> anyhow::Result<Value>;
}

/// A plugin's call into a host capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiRequest {
    pub plugin: String,
    pub capability: Capability,
    pub method: String,
    #[serde(default)]
    pub payload: Value,
    pub correlation_id: CorrelationId,
    /// Target host for network capabilities.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    /// Caller's maximum wait. Capped by the plugin's call timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl ApiRequest {
    pub fn new(plugin: impl Into<String>, capability: Capability, method: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            capability,
            method: method.into(),
            payload: Value::Null,
            correlation_id: CorrelationId::new(),
            destination: None,
            timeout: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = correlation_id;
        self
    }
}

/// Machine-readable kind plus human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&PluginHostError> for ApiError {
    fn from(err: &PluginHostError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub correlation_id: CorrelationId,
    pub success: bool,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
    pub timestamp: DateTime<Utc>,
}

impl ApiResponse {
    pub fn ok(correlation_id: CorrelationId, payload: Value) -> Self {
        Self {
            correlation_id,
            success: true,
            payload,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(correlation_id: CorrelationId, err: &PluginHostError) -> Self {
        Self {
            correlation_id,
            success: false,
            payload: Value::Null,
            error: Some(err.into()),
            timestamp: Utc::now(),
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

/// Gateway state for one active plugin.
struct Binding {
    policy: Arc<SecurityPolicy>,
    limiter: Mutex<TokenBucket>,
}

pub struct ApiGateway {
    sandbox: SecuritySandbox,
    providers: RwLock<HashMap<Capability, Arc<dyn CapabilityProvider>>>,
    bindings: RwLock<HashMap<String, Arc<Binding>>>,
}

impl ApiGateway {
    pub fn new(sandbox: SecuritySandbox) -> Self {
        Self {
            sandbox,
            providers: RwLock::new(HashMap::new()),
            bindings: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_provider(self, capability: Capability, provider: Arc<dyn CapabilityProvider>) -> Self {
        self.register_provider(capability, provider);
        self
    }

    /// Registers (or replaces) the provider for `capability`.
    pub fn register_provider(&self, capability: Capability, provider: Arc<dyn CapabilityProvider>) {
        self.providers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(capability, provider);
    }

    pub fn has_provider(&self, capability: Capability) -> bool {
        self.providers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&capability)
    }

    /// Starts accepting requests for `policy.plugin()` with a fresh rate limiter.
    pub fn open(&self, policy: Arc<SecurityPolicy>) {
        let plugin = policy.plugin().to_string();
        let binding = Arc::new(Binding {
            limiter: Mutex::new(TokenBucket::per_minute(policy.rate_limit_per_minute())),
            policy,
        });
        self.write_bindings().insert(plugin.clone(), binding);
        debug!(plugin = %plugin, "Gateway binding opened");
    }

    /// Stops accepting requests for `plugin`. Requests already past the
    /// gates run to completion.
    pub fn close(&self, plugin: &str) -> bool {
        let closed = self.write_bindings().remove(plugin).is_some();
        if closed {
            debug!(plugin = %plugin, "Gateway binding closed");
        }
        closed
    }

    pub fn is_open(&self, plugin: &str) -> bool {
        self.read_bindings().contains_key(plugin)
    }

    /// Handles one request. Never fails: errors come back as an
    /// unsuccessful response carrying the request's correlation id.
    pub async fn handle(&self, request: ApiRequest) -> ApiResponse {
        let correlation_id = request.correlation_id;
        match self.dispatch(request).await {
            Ok(payload) => ApiResponse::ok(correlation_id, payload),
            Err(err) => ApiResponse::failure(correlation_id, &err),
        }
    }

    async fn dispatch(&self, request: ApiRequest) -> Result<Value, PluginHostError> {
        let ApiRequest {
            plugin,
            capability,
            method,
            payload,
            destination,
            timeout,
            ..
        } = request;

        let binding = self.read_bindings().get(&plugin).cloned();
        let Some(binding) = binding else {
            return Err(self.reject(&plugin, capability, ViolationKind::NotActive, 0, 0, PluginHostError::NotActive {
                plugin: plugin.clone(),
            }));
        };
        let policy = &binding.policy;

        if !policy.is_granted(capability) {
            return Err(self.reject(
                &plugin,
                capability,
                ViolationKind::PermissionDenied,
                0,
                0,
                PluginHostError::PermissionDenied {
                    plugin: plugin.clone(),
                    capability: capability.to_string(),
                },
            ));
        }

        let (admitted, retry_after) = {
            let mut limiter = binding.limiter.lock().unwrap_or_else(|e| e.into_inner());
            let admitted = limiter.try_acquire();
            (admitted, limiter.retry_after())
        };
        if !admitted {
            let limit = policy.rate_limit_per_minute();
            debug!(
                plugin = %plugin,
                retry_after_ms = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX),
                "Rate limit exhausted"
            );
            return Err(self.reject(
                &plugin,
                capability,
                ViolationKind::RateLimited,
                u64::from(limit) + 1,
                u64::from(limit),
                PluginHostError::RateLimited {
                    plugin: plugin.clone(),
                    limit,
                },
            ));
        }

        if capability.uses_network() {
            let destination = destination.as_deref().unwrap_or_default();
            if let Err(err) = self.sandbox.authorize_network(&plugin, destination) {
                warn!(plugin = %plugin, %capability, destination, "Network request denied: {}", err);
                return Err(err);
            }
        }

        let provider = self
            .providers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&capability)
            .cloned()
            .ok_or_else(|| PluginHostError::CapabilityUnavailable {
                capability: capability.to_string(),
            })?;

        let deadline = timeout.map_or(policy.call_timeout(), |t| t.min(policy.call_timeout()));
        let scope = self.sandbox.enter(&plugin)?;
        let result = tokio::time::timeout(deadline, provider.invoke(&method, payload)).await;
        drop(scope);

        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                debug!(plugin = %plugin, %capability, method = %method, "Capability provider failed: {:#}", e);
                Err(PluginHostError::Provider(format!("{e:#}")))
            }
            Err(_) => {
                let timeout_ms = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX);
                Err(self.reject(
                    &plugin,
                    capability,
                    ViolationKind::Timeout,
                    timeout_ms,
                    timeout_ms,
                    PluginHostError::Timeout {
                        plugin: plugin.clone(),
                        timeout_ms,
                    },
                ))
            }
        }
    }

    /// Logs a rejection, reports it to the sandbox, and hands the error back.
    fn reject(
        &self,
        plugin: &str,
        capability: Capability,
        kind: ViolationKind,
        observed: u64,
        limit: u64,
        err: PluginHostError,
    ) -> PluginHostError {
        warn!(plugin = %plugin, %capability, %kind, "Gateway request rejected: {}", err);
        self.sandbox.report_rejection(plugin, kind, observed, limit);
        err
    }

    fn read_bindings(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Binding>>> {
        self.bindings.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_bindings(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Binding>>> {
        self.bindings.write().unwrap_or_else(|e| e.into_inner())
    }
}
