//! Per-node runtime metrics
//!
//! Hot-path recording is lock-free; `report()` swaps the interval counters
//! atomically so two reporters never double-count. Reports are published on
//! the `{system}:metrics` pub/sub channel and merged by the gateway.

use crate::domain::frame::unix_now;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Lock-free metrics for one node process.
pub struct NodeMetrics {
    /// Frames processed since the last report
    frames_since_report: AtomicU64,
    /// Total frames ever processed (monotonic)
    frames_total: AtomicU64,
    /// Sum of processing latencies since last report, in microseconds
    processing_sum_us: AtomicU64,
    /// Sum of end-to-end latencies since last report, in microseconds
    end_to_end_sum_us: AtomicU64,
    /// Count of latency samples since last report
    latency_samples: AtomicU64,
    /// User-loop faults since start (logged and dropped frames)
    loop_errors: AtomicU64,
    last_report: Mutex<Instant>,
}

impl NodeMetrics {
    pub fn new() -> Self {
        Self {
            frames_since_report: AtomicU64::new(0),
            frames_total: AtomicU64::new(0),
            processing_sum_us: AtomicU64::new(0),
            end_to_end_sum_us: AtomicU64::new(0),
            latency_samples: AtomicU64::new(0),
            loop_errors: AtomicU64::new(0),
            last_report: Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_frame(&self) {
        self.frames_since_report.fetch_add(1, Ordering::Relaxed);
        self.frames_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_latency(&self, processing_us: u64, end_to_end_us: u64) {
        self.processing_sum_us.fetch_add(processing_us, Ordering::Relaxed);
        self.end_to_end_sum_us.fetch_add(end_to_end_us, Ordering::Relaxed);
        self.latency_samples.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_loop_error(&self) {
        self.loop_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_total(&self) -> u64 {
        self.frames_total.load(Ordering::Relaxed)
    }

    pub fn loop_errors(&self) -> u64 {
        self.loop_errors.load(Ordering::Relaxed)
    }

    /// Snapshot and reset the interval counters.
    pub fn report(&self, node_name: &str) -> NodeReport {
        let elapsed = {
            let mut last = self.last_report.lock().unwrap_or_else(|e| e.into_inner());
            let elapsed = last.elapsed().as_secs_f64();
            *last = Instant::now();
            elapsed
        };

        let frames = self.frames_since_report.swap(0, Ordering::Relaxed);
        let processing_us = self.processing_sum_us.swap(0, Ordering::Relaxed);
        let end_to_end_us = self.end_to_end_sum_us.swap(0, Ordering::Relaxed);
        let samples = self.latency_samples.swap(0, Ordering::Relaxed);

        let fps = if elapsed > 0.0 { frames as f64 / elapsed } else { 0.0 };
        let avg_latency_ms = if samples > 0 {
            (end_to_end_us as f64 / samples as f64) / 1000.0
        } else {
            0.0
        };
        let avg_processing_ms = if samples > 0 {
            (processing_us as f64 / samples as f64) / 1000.0
        } else {
            0.0
        };

        NodeReport {
            node_name: node_name.to_string(),
            fps: (fps * 100.0).round() / 100.0,
            avg_latency_ms: (avg_latency_ms * 100.0).round() / 100.0,
            avg_processing_ms: (avg_processing_ms * 100.0).round() / 100.0,
            timestamp: unix_now(),
        }
    }
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// One report on the metrics channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeReport {
    pub node_name: String,
    pub fps: f64,
    pub avg_latency_ms: f64,
    #[serde(default)]
    pub avg_processing_ms: f64,
    pub timestamp: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_resets_interval() {
        let metrics = NodeMetrics::new();
        metrics.record_frame();
        metrics.record_frame();
        metrics.record_latency(1_000, 5_000);

        let report = metrics.report("cam");
        assert_eq!(report.node_name, "cam");
        assert!(report.fps > 0.0);
        assert!((report.avg_latency_ms - 5.0).abs() < 0.01);
        assert!((report.avg_processing_ms - 1.0).abs() < 0.01);

        let second = metrics.report("cam");
        assert_eq!(second.fps, 0.0);
        assert_eq!(second.avg_latency_ms, 0.0);
        assert_eq!(metrics.frames_total(), 2);
    }

    #[test]
    fn test_report_serializes() {
        let metrics = NodeMetrics::new();
        metrics.record_frame();
        let json = serde_json::to_string(&metrics.report("yolo")).unwrap();
        assert!(json.contains("\"node_name\":\"yolo\""));
        assert!(json.contains("avg_latency_ms"));
    }
}
