//! Live per-plugin resource counters.
//!
//! The sandbox writes on every accounted operation while gateway handlers
//! and the sampling task read concurrently, so every counter is atomic
//! except the network window, which needs rollover and increment to
//! happen together.

use crate::policy::SecurityPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Which declared limit a violation breached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    Memory,
    CpuTime,
    NetworkRequests,
    NetworkDestination,
    PermissionDenied,
    RateLimited,
    NotActive,
    Timeout,
}

impl ViolationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::CpuTime => "cpu_time",
            Self::NetworkRequests => "network_requests",
            Self::NetworkDestination => "network_destination",
            Self::PermissionDenied => "permission_denied",
            Self::RateLimited => "rate_limited",
            Self::NotActive => "not_active",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded breach. Units of `observed` and `limit` depend on `kind`:
/// bytes for memory, milliseconds for CPU time, request counts otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub timestamp: DateTime<Utc>,
    pub plugin: String,
    pub kind: ViolationKind,
    pub observed: u64,
    pub limit: u64,
}

impl ViolationRecord {
    pub fn new(plugin: impl Into<String>, kind: ViolationKind, observed: u64, limit: u64) -> Self {
        Self {
            timestamp: Utc::now(),
            plugin: plugin.into(),
            kind,
            observed,
            limit,
        }
    }
}

/// Outcome of [`ResourceMonitor::try_record_network_request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkAdmission {
    /// Counted; `count` requests so far in the current window.
    Admitted { count: u32 },
    /// Not counted; the request would be number `attempted` of `limit`.
    Exceeded { attempted: u32, limit: u32 },
    /// The monitor was torn down.
    Frozen,
}

#[derive(Debug)]
struct NetworkWindow {
    started: Instant,
    count: u32,
}

/// Resource usage snapshot for monitoring.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorSnapshot {
    pub plugin: String,
    /// Highest memory estimate observed, in bytes.
    pub memory_bytes: u64,
    pub memory_limit_bytes: u64,
    /// Memory usage as a ratio (0.0 to 1.0, may exceed 1.0 on breach).
    pub memory_usage_ratio: f64,
    pub cpu_time_ms: u64,
    pub cpu_limit_ms: u64,
    pub cpu_usage_ratio: f64,
    pub network_requests_in_window: u32,
    pub network_limit: u32,
    pub total_network_requests: u64,
    /// Sandbox scopes entered.
    pub calls: u64,
    pub frozen: bool,
}

/// Passive counters for one plugin scope.
#[derive(Debug)]
pub struct ResourceMonitor {
    plugin: String,
    memory_bytes: AtomicU64,
    cpu_nanos: AtomicU64,
    total_network_requests: AtomicU64,
    calls: AtomicU64,
    network: Mutex<NetworkWindow>,
    frozen: AtomicBool,
}

impl ResourceMonitor {
    pub fn new(plugin: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            memory_bytes: AtomicU64::new(0),
            cpu_nanos: AtomicU64::new(0),
            total_network_requests: AtomicU64::new(0),
            calls: AtomicU64::new(0),
            network: Mutex::new(NetworkWindow {
                started: Instant::now(),
                count: 0,
            }),
            frozen: AtomicBool::new(false),
        }
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    /// Records a memory estimate. The counter keeps the high-water mark.
    pub fn record_memory(&self, bytes: u64) {
        if self.is_frozen() {
            return;
        }
        self.memory_bytes.fetch_max(bytes, Ordering::Relaxed);
    }

    pub fn record_cpu(&self, elapsed: Duration) {
        if self.is_frozen() {
            return;
        }
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        // Saturate instead of wrapping
        let _ = self
            .cpu_nanos
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_add(nanos))
            });
    }

    pub(crate) fn record_call(&self) {
        if self.is_frozen() {
            return;
        }
        self.calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one outbound request against `limit` per `window`, rolling
    /// the window over first if it has elapsed.
    pub fn try_record_network_request(&self, limit: u32, window: Duration) -> NetworkAdmission {
        if self.is_frozen() {
            return NetworkAdmission::Frozen;
        }
        let mut network = self.network.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        if now.duration_since(network.started) >= window {
            network.started = now;
            network.count = 0;
        }
        if network.count >= limit {
            return NetworkAdmission::Exceeded {
                attempted: network.count.saturating_add(1),
                limit,
            };
        }
        network.count += 1;
        self.total_network_requests.fetch_add(1, Ordering::Relaxed);
        NetworkAdmission::Admitted {
            count: network.count,
        }
    }

    /// Limit kinds currently breached. Network limits are enforced inline
    /// by [`try_record_network_request`](Self::try_record_network_request)
    /// and never appear here.
    pub fn check(&self, policy: &SecurityPolicy) -> Vec<ViolationKind> {
        let mut breached = Vec::new();
        if self.memory_bytes() > policy.max_memory_bytes() {
            breached.push(ViolationKind::Memory);
        }
        if self.cpu_time() > policy.max_cpu_time() {
            breached.push(ViolationKind::CpuTime);
        }
        breached
    }

    /// Observed value and limit for `kind`, in the units of [`ViolationRecord`].
    pub fn reading(&self, kind: ViolationKind, policy: &SecurityPolicy) -> (u64, u64) {
        match kind {
            ViolationKind::Memory => (self.memory_bytes(), policy.max_memory_bytes()),
            ViolationKind::CpuTime => (
                duration_ms(self.cpu_time()),
                duration_ms(policy.max_cpu_time()),
            ),
            ViolationKind::NetworkRequests => (
                u64::from(self.network_requests_in_window()),
                u64::from(policy.max_network_requests()),
            ),
            _ => (0, 0),
        }
    }

    /// Zeroes every counter, restarts the network window, and accepts
    /// writes again after a freeze.
    pub fn reset(&self) {
        self.memory_bytes.store(0, Ordering::Relaxed);
        self.cpu_nanos.store(0, Ordering::Relaxed);
        self.total_network_requests.store(0, Ordering::Relaxed);
        self.calls.store(0, Ordering::Relaxed);
        {
            let mut network = self.network.lock().unwrap_or_else(|e| e.into_inner());
            network.started = Instant::now();
            network.count = 0;
        }
        self.frozen.store(false, Ordering::Release);
    }

    /// Stops accepting writes. Reads keep returning the final values.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    pub fn memory_bytes(&self) -> u64 {
        self.memory_bytes.load(Ordering::Relaxed)
    }

    pub fn cpu_time(&self) -> Duration {
        Duration::from_nanos(self.cpu_nanos.load(Ordering::Relaxed))
    }

    pub fn network_requests_in_window(&self) -> u32 {
        self.network.lock().unwrap_or_else(|e| e.into_inner()).count
    }

    pub fn snapshot(&self, policy: &SecurityPolicy) -> MonitorSnapshot {
        let memory_bytes = self.memory_bytes();
        let memory_limit_bytes = policy.max_memory_bytes();
        let cpu_time_ms = duration_ms(self.cpu_time());
        let cpu_limit_ms = duration_ms(policy.max_cpu_time());
        MonitorSnapshot {
            plugin: self.plugin.clone(),
            memory_bytes,
            memory_limit_bytes,
            memory_usage_ratio: ratio(memory_bytes, memory_limit_bytes),
            cpu_time_ms,
            cpu_limit_ms,
            cpu_usage_ratio: ratio(cpu_time_ms, cpu_limit_ms),
            network_requests_in_window: self.network_requests_in_window(),
            network_limit: policy.max_network_requests(),
            total_network_requests: self.total_network_requests.load(Ordering::Relaxed),
            calls: self.calls.load(Ordering::Relaxed),
            frozen: self.is_frozen(),
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn ratio(used: u64, limit: u64) -> f64 {
    if limit > 0 {
        used as f64 / limit as f64
    } else {
        0.0
    }
}
