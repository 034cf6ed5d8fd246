//! Last-known-value telemetry gauges exported for Prometheus scraping.
//!
//! Three gauge families (`utilization_gpu`, `memory_total`, `memory_used`)
//! are labelled with the configured job name and the device id as
//! `instance`. History is not kept here; the persistence gateway owns it.

use std::collections::HashMap;

use async_trait::async_trait;
use fleetwatch_core::protocol::TelemetrySnapshot;
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use tokio::sync::Mutex;

const LABELS: [&str; 2] = ["job", "instance"];

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Metrics job name is not configured")]
    MissingJobName,

    #[error("Failed to encode metrics: {0}")]
    Encode(#[from] prometheus::Error),

    #[error("Encoded metrics are not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Sink for per-device telemetry gauges.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    /// Replace the device's readings (last write wins).
    async fn set_metrics(&self, device_id: &str, snapshot: &TelemetrySnapshot);

    /// Remove every gauge for the device. A no-op for unknown devices.
    async fn delete_metrics(&self, device_id: &str);
}

/// The values last exported for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GaugeReading {
    pub utilization_gpu: i64,
    pub memory_total: i64,
    pub memory_used: i64,
}

impl From<&TelemetrySnapshot> for GaugeReading {
    fn from(snapshot: &TelemetrySnapshot) -> Self {
        Self {
            utilization_gpu: snapshot.utilization_gpu,
            memory_total: snapshot.memory_total,
            memory_used: snapshot.memory_used,
        }
    }
}

pub struct PrometheusMetrics {
    job_name: String,
    registry: Registry,
    utilization_gpu: GaugeVec,
    memory_total: GaugeVec,
    memory_used: GaugeVec,
    /// Gauge mutation happens while this lock is held.
    last_known: Mutex<HashMap<String, GaugeReading>>,
}

impl PrometheusMetrics {
    pub fn new(job_name: impl Into<String>) -> prometheus::Result<Self> {
        let utilization_gpu = GaugeVec::new(
            Opts::new("utilization_gpu", "GPU utilization reported by the device"),
            &LABELS,
        )?;
        let memory_total = GaugeVec::new(
            Opts::new("memory_total", "Total GPU memory reported by the device"),
            &LABELS,
        )?;
        let memory_used = GaugeVec::new(
            Opts::new("memory_used", "Used GPU memory reported by the device"),
            &LABELS,
        )?;

        let registry = Registry::new();
        registry.register(Box::new(utilization_gpu.clone()))?;
        registry.register(Box::new(memory_total.clone()))?;
        registry.register(Box::new(memory_used.clone()))?;

        Ok(Self {
            job_name: job_name.into(),
            registry,
            utilization_gpu,
            memory_total,
            memory_used,
            last_known: Mutex::new(HashMap::new()),
        })
    }

    /// The last reading exported for `device_id`, if any.
    pub async fn snapshot(&self, device_id: &str) -> Option<GaugeReading> {
        self.last_known.lock().await.get(device_id).copied()
    }

    pub async fn device_count(&self) -> usize {
        self.last_known.lock().await.len()
    }

    /// Encode every gauge in Prometheus text exposition format.
    pub fn render(&self) -> Result<String, MetricsError> {
        if self.job_name.is_empty() {
            return Err(MetricsError::MissingJobName);
        }
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[async_trait]
impl MetricsSink for PrometheusMetrics {
    async fn set_metrics(&self, device_id: &str, snapshot: &TelemetrySnapshot) {
        let reading = GaugeReading::from(snapshot);
        let labels = [self.job_name.as_str(), device_id];

        let mut last_known = self.last_known.lock().await;
        self.utilization_gpu
            .with_label_values(&labels)
            .set(reading.utilization_gpu as f64);
        self.memory_total
            .with_label_values(&labels)
            .set(reading.memory_total as f64);
        self.memory_used
            .with_label_values(&labels)
            .set(reading.memory_used as f64);
        last_known.insert(device_id.to_string(), reading);
    }

    async fn delete_metrics(&self, device_id: &str) {
        let labels = [self.job_name.as_str(), device_id];

        let mut last_known = self.last_known.lock().await;
        if last_known.remove(device_id).is_none() {
            return;
        }
        for gauge in [&self.utilization_gpu, &self.memory_total, &self.memory_used] {
            // Missing label sets are fine here.
            let _ = gauge.remove_label_values(&labels);
        }
    }
}
