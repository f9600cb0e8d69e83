//! Health monitor
//!
//! Aggregates request outcomes as they happen and samples everything else on
//! a fixed cycle. The derived status uses a fixed precedence:
//!
//! 1. `unhealthy`: recent error rate above threshold (after `min_requests`)
//! 2. `at_risk`: CPU or memory above threshold
//! 3. `degraded`: live store not connected
//! 4. `healthy`

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::system::{ResourceSampler, ResourceUsage, prune_stale_files};
use crate::config::HealthConfig;
use crate::data::{CacheStats, CacheStore, ConnectionManager, ConnectionState, Record};
use crate::error::AppError;
use crate::metrics::{
    CPU_USAGE_PERCENT, DISK_USAGE_PERCENT, HEALTH_ALERTS_TOTAL, HEALTH_STATUS,
    MEMORY_USAGE_PERCENT, TEMP_FILES_PRUNED_TOTAL,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    AtRisk,
    Unhealthy,
}

impl HealthStatus {
    fn gauge_value(self) -> i64 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Degraded => 1,
            HealthStatus::AtRisk => 2,
            HealthStatus::Unhealthy => 3,
        }
    }
}

/// Latest known metrics, also the shape of the snapshot file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthMetrics {
    pub started_at: DateTime<Utc>,
    /// End of the last completed cycle
    pub sampled_at: Option<DateTime<Utc>>,
    pub uptime_secs: u64,
    pub connection_state: ConnectionState,
    pub connection_error: Option<String>,
    pub resources: ResourceUsage,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub mean_latency_ms: f64,
    pub max_latency_ms: f64,
    /// Exponentially smoothed share of failed requests
    pub recent_error_rate: f64,
    pub cache: Option<CacheStats>,
    pub temp_files_pruned: u64,
    /// Alerts raised by the last cycle
    pub alerts: Vec<String>,
}

impl HealthMetrics {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            sampled_at: None,
            uptime_secs: 0,
            connection_state: ConnectionState::Uninitialized,
            connection_error: None,
            resources: ResourceUsage::default(),
            total_requests: 0,
            failed_requests: 0,
            mean_latency_ms: 0.0,
            max_latency_ms: 0.0,
            recent_error_rate: 0.0,
            cache: None,
            temp_files_pruned: 0,
            alerts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    /// Conditions that currently hold, worst first
    pub reasons: Vec<String>,
    pub metrics: HealthMetrics,
}

/// Derive the status and the conditions behind it.
pub fn evaluate(config: &HealthConfig, metrics: &HealthMetrics) -> (HealthStatus, Vec<String>) {
    let mut reasons = Vec::new();

    let error_rate_high = metrics.total_requests >= config.min_requests
        && metrics.recent_error_rate > config.error_rate_threshold;
    if error_rate_high {
        reasons.push(format!(
            "error rate {:.1}% above {:.1}%",
            metrics.recent_error_rate * 100.0,
            config.error_rate_threshold * 100.0
        ));
    }

    let cpu_high = metrics
        .resources
        .cpu_percent
        .is_some_and(|cpu| cpu > config.cpu_threshold);
    if cpu_high {
        reasons.push(format!("cpu above {:.0}%", config.cpu_threshold));
    }
    let memory_high = metrics
        .resources
        .memory_percent
        .is_some_and(|memory| memory > config.memory_threshold);
    if memory_high {
        reasons.push(format!("memory above {:.0}%", config.memory_threshold));
    }

    let disconnected = metrics.connection_state != ConnectionState::Connected;
    if disconnected {
        reasons.push(format!("live store {:?}", metrics.connection_state).to_lowercase());
    }

    let status = if error_rate_high {
        HealthStatus::Unhealthy
    } else if cpu_high || memory_high {
        HealthStatus::AtRisk
    } else if disconnected {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    };
    (status, reasons)
}

pub struct HealthMonitor {
    config: HealthConfig,
    connection: Arc<ConnectionManager>,
    cache: Arc<CacheStore<Record>>,
    sampler: Arc<ResourceSampler>,
    metrics: Mutex<HealthMetrics>,
}

impl HealthMonitor {
    pub fn new(
        config: HealthConfig,
        connection: Arc<ConnectionManager>,
        cache: Arc<CacheStore<Record>>,
    ) -> Self {
        Self {
            config,
            connection,
            cache,
            sampler: Arc::new(ResourceSampler::new()),
            metrics: Mutex::new(HealthMetrics::new()),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.config.interval_secs)
    }

    /// Fold one served request into the running aggregates
    pub fn record_request(&self, latency: Duration, is_error: bool) {
        let latency_ms = latency.as_secs_f64() * 1000.0;
        let alpha = self.config.error_rate_alpha;
        let sample = if is_error { 1.0 } else { 0.0 };

        let mut metrics = self.metrics.lock();
        metrics.total_requests += 1;
        if is_error {
            metrics.failed_requests += 1;
        }
        metrics.mean_latency_ms +=
            (latency_ms - metrics.mean_latency_ms) / metrics.total_requests as f64;
        metrics.max_latency_ms = metrics.max_latency_ms.max(latency_ms);
        metrics.recent_error_rate = if metrics.total_requests == 1 {
            sample
        } else {
            alpha * sample + (1.0 - alpha) * metrics.recent_error_rate
        };
    }

    fn current_metrics(&self) -> HealthMetrics {
        let status = self.connection.status();
        let mut metrics = self.metrics.lock().clone();
        metrics.connection_state = status.state;
        metrics.connection_error = status.last_error;
        metrics.uptime_secs = (Utc::now() - metrics.started_at).num_seconds().max(0) as u64;
        metrics
    }

    /// Latest metrics with the derived status
    pub fn report(&self) -> HealthReport {
        let metrics = self.current_metrics();
        let (status, reasons) = evaluate(&self.config, &metrics);
        HEALTH_STATUS.set(status.gauge_value());
        HealthReport {
            status,
            reasons,
            metrics,
        }
    }

    /// Write the current metrics to `health.snapshot_path`
    pub async fn persist_snapshot(&self) -> Result<(), AppError> {
        let metrics = self.current_metrics();
        crate::storage::write_json_atomic_async(self.config.snapshot_path.clone(), metrics).await
    }

    /// One monitoring pass
    ///
    /// Each step that fails keeps the last known value; the cycle itself
    /// never fails.
    pub async fn run_cycle(&self) -> HealthReport {
        let connected = self.connection.probe().await;
        if !connected {
            tracing::debug!("Liveness probe failed");
        }

        let sampler = self.sampler.clone();
        let resources = match tokio::task::spawn_blocking(move || sampler.sample()).await {
            Ok(resources) => Some(resources),
            Err(error) => {
                tracing::warn!(%error, "Resource sampling failed");
                None
            }
        };

        let pruned = match self.config.temp_dir.clone() {
            Some(dir) => {
                let retention = Duration::from_secs(self.config.temp_retention_secs);
                tokio::task::spawn_blocking(move || prune_stale_files(&dir, retention))
                    .await
                    .unwrap_or_else(|error| {
                        tracing::warn!(%error, "Temp directory pruning failed");
                        0
                    })
            }
            None => 0,
        };
        if pruned > 0 {
            TEMP_FILES_PRUNED_TOTAL.inc_by(pruned as u64);
            tracing::info!(pruned, "Removed stale temporary files");
        }

        let cache_stats = self.cache.stats();

        {
            let mut metrics = self.metrics.lock();
            if let Some(sampled) = resources {
                let previous = metrics.resources;
                metrics.resources = ResourceUsage {
                    cpu_percent: sampled.cpu_percent.or(previous.cpu_percent),
                    memory_percent: sampled.memory_percent.or(previous.memory_percent),
                    disk_percent: sampled.disk_percent.or(previous.disk_percent),
                };
            }
            metrics.temp_files_pruned += pruned as u64;
            metrics.cache = Some(cache_stats);
            metrics.sampled_at = Some(Utc::now());
        }

        let alerts = self.raise_alerts();
        self.metrics.lock().alerts = alerts;

        let report = self.report();
        if let Some(cpu) = report.metrics.resources.cpu_percent {
            CPU_USAGE_PERCENT.set(cpu);
        }
        if let Some(memory) = report.metrics.resources.memory_percent {
            MEMORY_USAGE_PERCENT.set(memory);
        }
        if let Some(disk) = report.metrics.resources.disk_percent {
            DISK_USAGE_PERCENT.set(disk);
        }

        if let Err(error) = self.persist_snapshot().await {
            tracing::error!(%error, "Failed to write health snapshot");
        }

        tracing::info!(
            status = ?report.status,
            connection = ?report.metrics.connection_state,
            requests = report.metrics.total_requests,
            error_rate = report.metrics.recent_error_rate,
            "Health check completed"
        );
        report
    }

    fn raise_alerts(&self) -> Vec<String> {
        let metrics = self.current_metrics();
        let config = &self.config;
        let mut alerts = Vec::new();

        let mut check = |alert: &str, triggered: bool, detail: String| {
            if triggered {
                HEALTH_ALERTS_TOTAL.with_label_values(&[alert]).inc();
                tracing::warn!(alert, detail = %detail, "Health alert");
                alerts.push(alert.to_string());
            }
        };

        let resources = metrics.resources;
        check(
            "cpu",
            resources.cpu_percent.is_some_and(|v| v > config.cpu_threshold),
            format!("{:.1}%", resources.cpu_percent.unwrap_or_default()),
        );
        check(
            "memory",
            resources.memory_percent.is_some_and(|v| v > config.memory_threshold),
            format!("{:.1}%", resources.memory_percent.unwrap_or_default()),
        );
        check(
            "disk",
            resources.disk_percent.is_some_and(|v| v > config.disk_threshold),
            format!("{:.1}%", resources.disk_percent.unwrap_or_default()),
        );
        check(
            "error_rate",
            metrics.total_requests >= config.min_requests
                && metrics.recent_error_rate > config.error_rate_threshold,
            format!("{:.1}%", metrics.recent_error_rate * 100.0),
        );
        check(
            "connection",
            metrics.connection_state != ConnectionState::Connected,
            metrics.connection_error.clone().unwrap_or_default(),
        );

        alerts
    }
}
