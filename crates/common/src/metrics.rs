//! Metrics collection for WeightLink
//!
//! This module provides Prometheus metrics for observability of the
//! submission, upload and chat paths.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, Registry};
use std::sync::Arc;

/// Metrics registry for WeightLink
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub submission: SubmissionMetrics,
    pub upload: UploadMetrics,
    pub session: SessionMetrics,
}

/// Write submission metrics
#[derive(Debug, Clone)]
pub struct SubmissionMetrics {
    /// Transactions handed to the ledger (every attempt)
    pub sent_total: IntCounter,

    /// Logical writes that reached confirmation
    pub confirmed_total: IntCounter,

    /// Attempts retried after a transient failure
    pub retries_total: IntCounter,

    /// Logical writes abandoned (terminal error or retries exhausted)
    pub failed_total: IntCounter,

    /// Writes found confirmed on re-check after a confirmation timeout
    pub late_confirmations_total: IntCounter,

    /// Time from send to confirmation
    pub confirmation_duration: Histogram,
}

/// Artifact upload metrics
#[derive(Debug, Clone)]
pub struct UploadMetrics {
    /// Chunk records created
    pub chunks_uploaded_total: IntCounter,

    /// Chunks skipped because the journal already had them
    pub chunks_resumed_total: IntCounter,

    /// Sections skipped for lack of source data
    pub sections_skipped_total: IntCounter,

    /// Registries created
    pub registries_created_total: IntCounter,
}

/// Chat session metrics
#[derive(Debug, Clone)]
pub struct SessionMetrics {
    /// Sessions created
    pub sessions_created_total: IntCounter,

    /// Chat turns submitted
    pub turns_total: IntCounter,

    /// Confirmed turns without a discoverable response
    pub turns_without_response_total: IntCounter,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).unwrap();
    registry.register(Box::new(counter.clone())).unwrap();
    counter
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        // Submission metrics
        let confirmation_duration = Histogram::with_opts(
            HistogramOpts::new(
                "submission_confirmation_duration_seconds",
                "Time from send to confirmation in seconds",
            )
            .buckets(vec![0.25, 0.5, 1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0]),
        )
        .unwrap();
        registry
            .register(Box::new(confirmation_duration.clone()))
            .unwrap();

        let submission = SubmissionMetrics {
            sent_total: counter(
                &registry,
                "submission_sent_total",
                "Total number of transactions sent",
            ),
            confirmed_total: counter(
                &registry,
                "submission_confirmed_total",
                "Total number of confirmed writes",
            ),
            retries_total: counter(
                &registry,
                "submission_retries_total",
                "Total number of retried attempts",
            ),
            failed_total: counter(
                &registry,
                "submission_failed_total",
                "Total number of abandoned writes",
            ),
            late_confirmations_total: counter(
                &registry,
                "submission_late_confirmations_total",
                "Writes confirmed on re-check after a confirmation timeout",
            ),
            confirmation_duration,
        };

        // Upload metrics
        let upload = UploadMetrics {
            chunks_uploaded_total: counter(
                &registry,
                "upload_chunks_uploaded_total",
                "Total number of chunk records created",
            ),
            chunks_resumed_total: counter(
                &registry,
                "upload_chunks_resumed_total",
                "Chunks skipped because they were already confirmed",
            ),
            sections_skipped_total: counter(
                &registry,
                "upload_sections_skipped_total",
                "Sections skipped for lack of source data",
            ),
            registries_created_total: counter(
                &registry,
                "upload_registries_created_total",
                "Total number of registries created",
            ),
        };

        // Session metrics
        let session = SessionMetrics {
            sessions_created_total: counter(
                &registry,
                "session_created_total",
                "Total number of chat sessions created",
            ),
            turns_total: counter(
                &registry,
                "session_turns_total",
                "Total number of chat turns submitted",
            ),
            turns_without_response_total: counter(
                &registry,
                "session_turns_without_response_total",
                "Confirmed turns without a discoverable response",
            ),
        };

        MetricsRegistry {
            registry,
            submission,
            upload,
            session,
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registry() {
        let metrics = MetricsRegistry::new();

        metrics.submission.sent_total.inc();
        metrics.upload.chunks_uploaded_total.inc_by(3);
        metrics.submission.confirmation_duration.observe(0.7);

        let output = metrics.gather();
        assert!(output.contains("submission_sent_total 1"));
        assert!(output.contains("upload_chunks_uploaded_total 3"));
        assert!(output.contains("submission_confirmation_duration_seconds"));
    }
}
