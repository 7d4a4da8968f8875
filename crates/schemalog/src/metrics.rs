//! Prometheus metrics for the registry
//!
//! # Metrics Overview
//!
//! ## Counters
//! - `schemalog_registrations_total` - Register calls by outcome (`new`, `existing`)
//! - `schemalog_compatibility_checks_total` - Checks by level and verdict
//! - `schemalog_forwarded_requests_total` - Requests sent to the primary
//! - `schemalog_records_applied_total` - Log records applied by operation
//! - `schemalog_errors_total` - Errors by error code and operation
//!
//! ## Gauges
//! - `schemalog_schemas_count` - Distinct schemas known to this node
//! - `schemalog_subjects_count` - Live subjects
//! - `schemalog_applied_offset` - Last applied log offset
//! - `schemalog_reader_ready` - 1 once the log reader has caught up
//! - `schemalog_is_primary` - 1 while this node is the primary
//!
//! ## Histograms
//! - `schemalog_request_duration_seconds` - Orchestrator call latency
//! - `schemalog_schema_size_bytes` - Canonical schema sizes
//!
//! # Example
//!
//! ```rust,ignore
//! use schemalog::metrics::{MetricsConfig, RegistryMetrics};
//!
//! let metrics = RegistryMetrics::new(MetricsConfig::new().with_prefix("myapp_schemas"))?;
//! metrics.record_registration("AVRO", true);
//! let output = metrics.render()?;
//! ```

use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::collections::HashMap;

/// Metrics configuration
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Prefix for all metric names (default: "schemalog")
    pub prefix: String,
    /// Constant labels added to every metric
    pub custom_labels: Vec<(String, String)>,
    /// Histogram buckets for request duration
    pub duration_buckets: Vec<f64>,
    /// Histogram buckets for schema size
    pub size_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            prefix: "schemalog".to_string(),
            custom_labels: Vec::new(),
            duration_buckets: vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ],
            size_buckets: vec![
                100.0, 500.0, 1000.0, 5000.0, 10000.0, 50000.0, 100000.0, 500000.0, 1000000.0,
            ],
        }
    }
}

impl MetricsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the metric prefix
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Add constant labels, e.g. the node id
    pub fn with_custom_labels(mut self, labels: Vec<(String, String)>) -> Self {
        self.custom_labels = labels;
        self
    }

    pub fn with_duration_buckets(mut self, buckets: Vec<f64>) -> Self {
        self.duration_buckets = buckets;
        self
    }
}

/// Prometheus metrics for one registry node
pub struct RegistryMetrics {
    registry: Registry,

    // Counters
    registrations: CounterVec,
    compatibility_checks: CounterVec,
    forwarded_requests: CounterVec,
    records_applied: CounterVec,
    errors: CounterVec,

    // Gauges
    schemas_count: Gauge,
    subjects_count: Gauge,
    applied_offset: Gauge,
    reader_ready: Gauge,
    is_primary: Gauge,

    // Histograms
    request_duration: HistogramVec,
    schema_size: HistogramVec,
}

impl RegistryMetrics {
    /// Create metrics on a fresh Prometheus registry
    pub fn new(config: MetricsConfig) -> Result<Self, prometheus::Error> {
        let labels: HashMap<String, String> = config.custom_labels.iter().cloned().collect();
        let registry = if labels.is_empty() {
            Registry::new()
        } else {
            Registry::new_custom(None, Some(labels))?
        };
        Self::with_registry(config, registry)
    }

    /// Create metrics on an existing Prometheus registry
    pub fn with_registry(config: MetricsConfig, registry: Registry) -> Result<Self, prometheus::Error> {
        let prefix = &config.prefix;

        // Counters
        let registrations = CounterVec::new(
            Opts::new(
                format!("{}_registrations_total", prefix),
                "Register calls by outcome",
            ),
            &["schema_type", "outcome"],
        )?;

        let compatibility_checks = CounterVec::new(
            Opts::new(
                format!("{}_compatibility_checks_total", prefix),
                "Compatibility checks performed",
            ),
            &["level", "result"],
        )?;

        let forwarded_requests = CounterVec::new(
            Opts::new(
                format!("{}_forwarded_requests_total", prefix),
                "Requests forwarded to the primary",
            ),
            &["operation", "result"],
        )?;

        let records_applied = CounterVec::new(
            Opts::new(
                format!("{}_records_applied_total", prefix),
                "Log records applied to registry state",
            ),
            &["op"],
        )?;

        let errors = CounterVec::new(
            Opts::new(format!("{}_errors_total", prefix), "Errors by code"),
            &["error_code", "operation"],
        )?;

        // Gauges
        let schemas_count = Gauge::new(
            format!("{}_schemas_count", prefix),
            "Distinct schemas known to this node",
        )?;

        let subjects_count = Gauge::new(format!("{}_subjects_count", prefix), "Live subjects")?;

        let applied_offset = Gauge::new(
            format!("{}_applied_offset", prefix),
            "Offset of the last applied log record",
        )?;

        let reader_ready = Gauge::new(
            format!("{}_reader_ready", prefix),
            "Whether the log reader has caught up",
        )?;

        let is_primary = Gauge::new(
            format!("{}_is_primary", prefix),
            "Whether this node is the primary",
        )?;

        // Histograms
        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                format!("{}_request_duration_seconds", prefix),
                "Orchestrator call duration in seconds",
            )
            .buckets(config.duration_buckets.clone()),
            &["operation", "status"],
        )?;

        let schema_size = HistogramVec::new(
            HistogramOpts::new(
                format!("{}_schema_size_bytes", prefix),
                "Canonical schema size in bytes",
            )
            .buckets(config.size_buckets.clone()),
            &["schema_type"],
        )?;

        registry.register(Box::new(registrations.clone()))?;
        registry.register(Box::new(compatibility_checks.clone()))?;
        registry.register(Box::new(forwarded_requests.clone()))?;
        registry.register(Box::new(records_applied.clone()))?;
        registry.register(Box::new(errors.clone()))?;
        registry.register(Box::new(schemas_count.clone()))?;
        registry.register(Box::new(subjects_count.clone()))?;
        registry.register(Box::new(applied_offset.clone()))?;
        registry.register(Box::new(reader_ready.clone()))?;
        registry.register(Box::new(is_primary.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;
        registry.register(Box::new(schema_size.clone()))?;

        Ok(Self {
            registry,
            registrations,
            compatibility_checks,
            forwarded_requests,
            records_applied,
            errors,
            schemas_count,
            subjects_count,
            applied_offset,
            reader_ready,
            is_primary,
            request_duration,
            schema_size,
        })
    }

    // ========================================================================
    // Counter operations
    // ========================================================================

    /// Record a register call; `created` is false for duplicates
    pub fn record_registration(&self, schema_type: &str, created: bool) {
        self.registrations
            .with_label_values(&[schema_type, if created { "new" } else { "existing" }])
            .inc();
    }

    pub fn record_compatibility_check(&self, level: &str, compatible: bool) {
        self.compatibility_checks
            .with_label_values(&[
                level,
                if compatible {
                    "compatible"
                } else {
                    "incompatible"
                },
            ])
            .inc();
    }

    pub fn record_forward(&self, operation: &str, success: bool) {
        self.forwarded_requests
            .with_label_values(&[operation, if success { "success" } else { "error" }])
            .inc();
    }

    pub fn record_applied(&self, op: &str, offset: u64) {
        self.records_applied.with_label_values(&[op]).inc();
        self.applied_offset.set(offset as f64);
    }

    pub fn record_error(&self, error_code: u32, operation: &str) {
        self.errors
            .with_label_values(&[&error_code.to_string(), operation])
            .inc();
    }

    // ========================================================================
    // Gauge operations
    // ========================================================================

    pub fn set_schemas_count(&self, count: usize) {
        self.schemas_count.set(count as f64);
    }

    pub fn set_subjects_count(&self, count: usize) {
        self.subjects_count.set(count as f64);
    }

    pub fn set_reader_ready(&self, ready: bool) {
        self.reader_ready.set(if ready { 1.0 } else { 0.0 });
    }

    pub fn set_primary(&self, primary: bool) {
        self.is_primary.set(if primary { 1.0 } else { 0.0 });
    }

    // ========================================================================
    // Histogram operations
    // ========================================================================

    pub fn record_duration(&self, operation: &str, status: &str, duration_secs: f64) {
        self.request_duration
            .with_label_values(&[operation, status])
            .observe(duration_secs);
    }

    pub fn record_schema_size(&self, schema_type: &str, size_bytes: usize) {
        self.schema_size
            .with_label_values(&[schema_type])
            .observe(size_bytes as f64);
    }

    /// Start timing an orchestrator call
    pub fn start_timer(&self, operation: &'static str) -> RequestTimer<'_> {
        RequestTimer {
            metrics: self,
            operation,
            start: std::time::Instant::now(),
        }
    }

    // ========================================================================
    // Export
    // ========================================================================

    /// Render metrics in Prometheus text format
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer).unwrap_or_default())
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Timer for an orchestrator call
pub struct RequestTimer<'a> {
    metrics: &'a RegistryMetrics,
    operation: &'static str,
    start: std::time::Instant,
}

impl<'a> RequestTimer<'a> {
    /// Finish with the call's outcome; failures also count toward `errors_total`
    pub fn finish<T>(self, result: &crate::error::SchemaResult<T>) {
        let status = match result {
            Ok(_) => "success",
            Err(e) => {
                self.metrics.record_error(e.error_code(), self.operation);
                "error"
            }
        };
        self.metrics.record_duration(
            self.operation,
            status,
            self.start.elapsed().as_secs_f64(),
        );
    }
}
