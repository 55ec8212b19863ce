// Mount service metrics
//
// Counters for filesystem and media types, read-only fallbacks, daemon exit
// codes and archive formats, plus a latency histogram per mount attempt.
// Exported in Prometheus text format.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::config::types::MountError;
use crate::device::DeviceMediaType;

/// Fire-and-forget sink for mount observations
pub trait Metrics {
    fn record_filesystem_type(&self, filesystem_type: &str);
    fn record_device_media_type(&self, media_type: DeviceMediaType);
    fn record_read_only_fallback(&self, filesystem_type: &str);
    fn record_daemon_exit_code(&self, daemon: &str, exit_code: i32);
    fn record_archive_type(&self, archive_type: &str);
    fn record_mount_duration(&self, filesystem_type: &str, duration: Duration, error: Option<MountError>);
}

/// Counter metric (monotonically increasing)
#[derive(Debug)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.value.store(0, Ordering::Relaxed);
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters partitioned by a string label
#[derive(Debug, Default)]
pub struct KeyedCounter {
    values: Mutex<BTreeMap<String, u64>>,
}

impl KeyedCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self, key: &str) {
        let mut values = self.values.lock().unwrap_or_else(|p| p.into_inner());
        *values.entry(key.to_string()).or_insert(0) += 1;
    }

    pub fn get(&self, key: &str) -> u64 {
        let values = self.values.lock().unwrap_or_else(|p| p.into_inner());
        values.get(key).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> Vec<(String, u64)> {
        let values = self.values.lock().unwrap_or_else(|p| p.into_inner());
        values.iter().map(|(k, v)| (k.clone(), *v)).collect()
    }
}

/// Histogram bucket for latency tracking
#[derive(Debug)]
pub struct HistogramBucket {
    pub le: f64, // upper bound in seconds
    pub count: AtomicU64,
}

/// Histogram metric for latency/duration tracking
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<HistogramBucket>,
    sum: AtomicU64, // microseconds
    count: AtomicU64,
}

impl Histogram {
    /// Buckets sized for mounts: kernel mounts land in milliseconds, FUSE
    /// daemons in seconds
    pub fn new_latency() -> Self {
        let bucket_bounds = vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

        let buckets = bucket_bounds
            .into_iter()
            .map(|le| HistogramBucket {
                le,
                count: AtomicU64::new(0),
            })
            .collect();

        Self {
            buckets,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: Duration) {
        let seconds = value.as_secs_f64();
        let micros = value.as_micros() as u64;

        self.sum.fetch_add(micros, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        for bucket in &self.buckets {
            if seconds <= bucket.le {
                bucket.count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn get_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn get_sum_micros(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    pub fn get_bucket_count(&self, le: f64) -> u64 {
        self.buckets
            .iter()
            .find(|b| (b.le - le).abs() < 0.0001)
            .map(|b| b.count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

/// In-process `Metrics` implementation
#[derive(Debug)]
pub struct MountMetrics {
    pub mounts_total: Counter,
    pub mounts_failed: Counter,
    pub read_only_fallbacks: Counter,
    pub filesystem_types: KeyedCounter,
    pub media_types: KeyedCounter,
    pub read_only_fallbacks_by_type: KeyedCounter,
    pub daemon_exit_codes: KeyedCounter,
    pub archive_types: KeyedCounter,
    pub mount_errors: KeyedCounter,
    pub mount_duration: Histogram,
}

impl MountMetrics {
    pub fn new() -> Self {
        Self {
            mounts_total: Counter::new(),
            mounts_failed: Counter::new(),
            read_only_fallbacks: Counter::new(),
            filesystem_types: KeyedCounter::new(),
            media_types: KeyedCounter::new(),
            read_only_fallbacks_by_type: KeyedCounter::new(),
            daemon_exit_codes: KeyedCounter::new(),
            archive_types: KeyedCounter::new(),
            mount_errors: KeyedCounter::new(),
            mount_duration: Histogram::new_latency(),
        }
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP mountbox_mounts_total Total number of mount attempts\n");
        output.push_str("# TYPE mountbox_mounts_total counter\n");
        output.push_str(&format!("mountbox_mounts_total {}\n", self.mounts_total.get()));

        output.push_str("# HELP mountbox_mounts_failed_total Mount attempts that failed\n");
        output.push_str("# TYPE mountbox_mounts_failed_total counter\n");
        output.push_str(&format!(
            "mountbox_mounts_failed_total {}\n",
            self.mounts_failed.get()
        ));

        push_keyed(
            &mut output,
            "mountbox_mount_errors_total",
            "Mount failures by error",
            "error",
            &self.mount_errors,
        );
        push_keyed(
            &mut output,
            "mountbox_filesystem_type_total",
            "Mount requests by filesystem type",
            "type",
            &self.filesystem_types,
        );
        push_keyed(
            &mut output,
            "mountbox_device_media_type_total",
            "Mount requests by device media type",
            "media",
            &self.media_types,
        );

        output.push_str("# HELP mountbox_read_only_fallback_total Read-write mounts retried read-only\n");
        output.push_str("# TYPE mountbox_read_only_fallback_total counter\n");
        output.push_str(&format!(
            "mountbox_read_only_fallback_total {}\n",
            self.read_only_fallbacks.get()
        ));

        push_keyed(
            &mut output,
            "mountbox_daemon_exit_code_total",
            "FUSE daemon exits by daemon and code",
            "daemon_code",
            &self.daemon_exit_codes,
        );
        push_keyed(
            &mut output,
            "mountbox_archive_type_total",
            "Archive mounts by format",
            "format",
            &self.archive_types,
        );

        output.push_str("# HELP mountbox_mount_duration_seconds Mount attempt latency\n");
        output.push_str("# TYPE mountbox_mount_duration_seconds histogram\n");
        for bucket in &self.mount_duration.buckets {
            output.push_str(&format!(
                "mountbox_mount_duration_seconds_bucket{{le=\"{}\"}} {}\n",
                bucket.le,
                bucket.count.load(Ordering::Relaxed)
            ));
        }
        output.push_str(&format!(
            "mountbox_mount_duration_seconds_sum {}\n",
            self.mount_duration.get_sum_micros() as f64 / 1_000_000.0
        ));
        output.push_str(&format!(
            "mountbox_mount_duration_seconds_count {}\n",
            self.mount_duration.get_count()
        ));

        output
    }
}

fn push_keyed(output: &mut String, name: &str, help: &str, label: &str, counter: &KeyedCounter) {
    output.push_str(&format!("# HELP {} {}\n", name, help));
    output.push_str(&format!("# TYPE {} counter\n", name));
    for (key, value) in counter.snapshot() {
        output.push_str(&format!("{}{{{}=\"{}\"}} {}\n", name, label, key, value));
    }
}

impl Default for MountMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics for MountMetrics {
    fn record_filesystem_type(&self, filesystem_type: &str) {
        let key = if filesystem_type.is_empty() {
            "unknown"
        } else {
            filesystem_type
        };
        self.filesystem_types.inc(key);
    }

    fn record_device_media_type(&self, media_type: DeviceMediaType) {
        self.media_types.inc(media_type.as_str());
    }

    fn record_read_only_fallback(&self, filesystem_type: &str) {
        self.read_only_fallbacks.inc();
        self.read_only_fallbacks_by_type.inc(filesystem_type);
    }

    fn record_daemon_exit_code(&self, daemon: &str, exit_code: i32) {
        self.daemon_exit_codes
            .inc(&format!("{}:{}", daemon, exit_code));
    }

    fn record_archive_type(&self, archive_type: &str) {
        self.archive_types.inc(archive_type);
    }

    fn record_mount_duration(&self, _filesystem_type: &str, duration: Duration, error: Option<MountError>) {
        self.mounts_total.inc();
        self.mount_duration.observe(duration);
        if let Some(error) = error {
            if error != MountError::InProgress {
                self.mounts_failed.inc();
                self.mount_errors.inc(error.as_str());
            }
        }
    }
}
