//! Allocator Metrics - Export Metrics
//!
//! Module for exporting allocator metrics to monitoring systems
//! (Prometheus, Grafana, etc.)

use crate::allocator::PageAllocator;
use crate::generation::GenerationId;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;

/// AllocatorMetrics - metrics exporter
///
/// Names keep insertion order so exports are stable.
pub struct AllocatorMetrics {
    metrics: Mutex<IndexMap<String, MetricValue>>,
}

impl AllocatorMetrics {
    pub fn new() -> Self {
        Self {
            metrics: Mutex::new(IndexMap::new()),
        }
    }

    /// Snapshot the counters of a page allocator
    pub fn collect(allocator: &PageAllocator) -> Self {
        let metrics = Self::new();
        let summary = allocator.alloc_stats().summary();

        metrics.add("zpage_capacity_bytes", MetricValue::Gauge(allocator.capacity() as f64));
        metrics.add(
            "zpage_current_max_capacity_bytes",
            MetricValue::Gauge(allocator.current_max_capacity() as f64),
        );
        metrics.add("zpage_max_capacity_bytes", MetricValue::Gauge(allocator.max_capacity() as f64));
        metrics.add("zpage_used_bytes", MetricValue::Gauge(allocator.used() as f64));
        for id in GenerationId::ALL {
            metrics.add(
                format!("zpage_{}_used_bytes", id),
                MetricValue::Gauge(allocator.used_generation(id) as f64),
            );
        }
        metrics.add(
            "zpage_stalled_allocations",
            MetricValue::Gauge(allocator.stall_queue_len() as f64),
        );

        metrics.add("zpage_small_pages_total", MetricValue::Counter(summary.small_pages));
        metrics.add("zpage_medium_pages_total", MetricValue::Counter(summary.medium_pages));
        metrics.add("zpage_large_pages_total", MetricValue::Counter(summary.large_pages));
        metrics.add(
            "zpage_multi_partition_pages_total",
            MetricValue::Counter(summary.multi_partition_pages),
        );
        metrics.add("zpage_undone_pages_total", MetricValue::Counter(summary.undone_pages));
        metrics.add("zpage_allocation_stalls_total", MetricValue::Counter(summary.stalls));
        metrics.add(
            "zpage_capacity_reductions_total",
            MetricValue::Counter(summary.capacity_reductions),
        );
        metrics.add(
            "zpage_uncommitted_bytes_total",
            MetricValue::Counter(summary.uncommitted_bytes as u64),
        );
        metrics.add("zpage_page_latency_p99_us", MetricValue::Histogram(summary.latency_p99_us));

        metrics
    }

    /// Add metric
    pub fn add(&self, name: impl Into<String>, value: MetricValue) {
        self.metrics.lock().insert(name.into(), value);
    }

    /// Get metric
    pub fn get(&self, name: &str) -> Option<MetricValue> {
        self.metrics.lock().get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.metrics.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Export to Prometheus text format
    pub fn to_prometheus(&self) -> String {
        let metrics = self.metrics.lock();
        let mut output = String::new();

        for (name, value) in metrics.iter() {
            output.push_str(&format!("# TYPE {} {}\n", name, value.kind()));
            output.push_str(&format!("{} {}\n", name, value.as_f64()));
        }

        output
    }

    /// Export to JSON
    pub fn to_json(&self) -> String {
        let metrics = self.metrics.lock();
        let values: IndexMap<&str, f64> = metrics
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_f64()))
            .collect();

        serde_json::to_string(&values).unwrap_or_else(|_| "{}".to_string())
    }
}

impl Default for AllocatorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Metric value
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum MetricValue {
    Counter(u64),
    Gauge(f64),
    Histogram(u64),
}

impl MetricValue {
    pub fn as_f64(&self) -> f64 {
        match self {
            MetricValue::Counter(v) => *v as f64,
            MetricValue::Gauge(v) => *v,
            MetricValue::Histogram(v) => *v as f64,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            MetricValue::Counter(_) => "counter",
            MetricValue::Gauge(_) => "gauge",
            MetricValue::Histogram(_) => "summary",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exports_keep_order() {
        let metrics = AllocatorMetrics::new();
        metrics.add("b_total", MetricValue::Counter(2));
        metrics.add("a_bytes", MetricValue::Gauge(1.5));

        assert_eq!(
            metrics.to_prometheus(),
            "# TYPE b_total counter\nb_total 2\n# TYPE a_bytes gauge\na_bytes 1.5\n"
        );
        assert_eq!(metrics.to_json(), r#"{"b_total":2.0,"a_bytes":1.5}"#);
        assert_eq!(metrics.get("a_bytes"), Some(MetricValue::Gauge(1.5)));
    }
}
