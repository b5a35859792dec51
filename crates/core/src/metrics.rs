// crates/core/src/metrics.rs
use std::time::Duration;
use tracing::info;

/// Per-run training/evaluation metrics.
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    pub total_time: Option<Duration>,
    pub data_times: Vec<Duration>,
    pub iter_times: Vec<Duration>,
    pub iterations: u64,
    pub samples_seen: u64,
    pub bytes_read: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_iteration(
        &mut self,
        data_time: Duration,
        iter_time: Duration,
        samples: u64,
        bytes: u64,
    ) {
        self.data_times.push(data_time);
        self.iter_times.push(iter_time);
        self.iterations += 1;
        self.samples_seen += samples;
        self.bytes_read += bytes;
    }

    pub fn record_total_time(&mut self, duration: Duration) {
        self.total_time = Some(duration);
    }

    pub fn average_iter_time(&self) -> Option<Duration> {
        if self.iter_times.is_empty() {
            return None;
        }
        let total: Duration = self.iter_times.iter().sum();
        Some(total / self.iter_times.len() as u32)
    }

    pub fn average_data_time(&self) -> Option<Duration> {
        if self.data_times.is_empty() {
            return None;
        }
        let total: Duration = self.data_times.iter().sum();
        Some(total / self.data_times.len() as u32)
    }

    pub fn samples_per_sec(&self) -> Option<f64> {
        let total = self.total_time?;
        let seconds = total.as_secs_f64();
        if seconds > 0.0 {
            Some(self.samples_seen as f64 / seconds)
        } else {
            None
        }
    }

    pub fn throughput_mbps(&self) -> Option<f64> {
        let total = self.total_time?;
        let seconds = total.as_secs_f64();
        if seconds > 0.0 {
            Some(self.bytes_read as f64 / (1024.0 * 1024.0) / seconds)
        } else {
            None
        }
    }

    pub fn log_summary(&self, label: &str) {
        info!(
            label,
            iterations = self.iterations,
            samples = self.samples_seen,
            bytes_read = self.bytes_read,
            "run summary"
        );
        if let Some(total) = self.total_time {
            info!(label, total_time = ?total, "total time");
        }
        if let Some(avg) = self.average_iter_time() {
            info!(label, avg_iter_time = ?avg, avg_data_time = ?self.average_data_time(), "iteration timing");
        }
        if let Some(tp) = self.samples_per_sec() {
            info!(label, samples_per_sec = format!("{:.2}", tp), "throughput");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let mut m = Metrics::new();
        m.record_iteration(Duration::from_millis(2), Duration::from_millis(10), 16, 4096);
        m.record_iteration(Duration::from_millis(4), Duration::from_millis(20), 16, 4096);
        assert_eq!(m.iterations, 2);
        assert_eq!(m.samples_seen, 32);
        assert_eq!(m.bytes_read, 8192);
        assert_eq!(m.average_iter_time(), Some(Duration::from_millis(15)));
    }

    #[test]
    fn test_throughput_requires_total_time() {
        let mut m = Metrics::new();
        m.record_iteration(Duration::ZERO, Duration::from_millis(1), 8, 1024);
        assert!(m.samples_per_sec().is_none());
        m.record_total_time(Duration::from_secs(2));
        assert!((m.samples_per_sec().unwrap() - 4.0).abs() < 1e-9);
    }
}
