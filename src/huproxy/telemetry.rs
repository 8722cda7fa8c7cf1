use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use dashmap::DashMap;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// This should be called once per process at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")
}

#[derive(Debug, Clone, Serialize)]
pub struct TunnelInfo {
    pub id: String,
    pub client: String,
    pub target: String,
    pub started_at_unix_ms: u64,
}

/// Live tunnels, for the admin `/tunnels` endpoint.
#[derive(Debug, Default)]
pub struct TunnelRegistry {
    tunnels: DashMap<String, TunnelInfo>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, t: TunnelInfo) {
        self.tunnels.insert(t.id.clone(), t);
    }

    pub fn remove(&self, id: &str) {
        self.tunnels.remove(id);
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn snapshot(&self) -> Vec<TunnelInfo> {
        let mut out: Vec<TunnelInfo> = self.tunnels.iter().map(|t| t.value().clone()).collect();
        out.sort_by_key(|t| t.started_at_unix_ms);
        out
    }
}

pub type SharedTunnels = Arc<TunnelRegistry>;

/// Counts a tunnel as active for as long as it is alive.
pub struct ActiveTunnelGuard;

impl ActiveTunnelGuard {
    pub fn new() -> Self {
        metrics::counter!("huproxy_tunnels_total").increment(1);
        metrics::gauge!("huproxy_active_tunnels").increment(1.0);
        Self
    }
}

impl Drop for ActiveTunnelGuard {
    fn drop(&mut self) {
        metrics::gauge!("huproxy_active_tunnels").decrement(1.0);
    }
}

pub fn record_setup_failure(reason: &'static str) {
    metrics::counter!("huproxy_tunnel_setup_failures_total", "reason" => reason).increment(1);
}

pub fn record_bytes(to_target: u64, from_target: u64) {
    metrics::counter!("huproxy_bytes_to_target_total").increment(to_target);
    metrics::counter!("huproxy_bytes_from_target_total").increment(from_target);
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn new_session_id() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(1);
    let n = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("t{n}")
}
