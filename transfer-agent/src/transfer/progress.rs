//! Byte-level progress logging for long hash and copy operations.

use std::time::{Duration, Instant};
use tracing::info;

/// Logs progress of a single streaming operation at a fixed interval.
pub struct ProgressLog {
    /// Verb used in log lines ("Copied", "Hashed")
    action: &'static str,
    total_bytes: u64,
    interval: Duration,
    start_time: Instant,
    last_log_time: Instant,
}

impl ProgressLog {
    pub fn new(action: &'static str, total_bytes: u64, interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            action,
            total_bytes,
            interval,
            start_time: now,
            last_log_time: now,
        }
    }

    /// Record that `done_bytes` have been processed so far. Logs at most
    /// once per interval.
    pub fn update(&mut self, done_bytes: u64) {
        let now = Instant::now();
        if now.duration_since(self.last_log_time) < self.interval {
            return;
        }
        self.last_log_time = now;

        info!(
            "{} {} of {}; {:.1}% done",
            self.action,
            format_bytes(done_bytes),
            format_bytes(self.total_bytes),
            percent(done_bytes, self.total_bytes)
        );
    }

    /// Log a closing line with the average speed.
    pub fn finish(&self, done_bytes: u64) {
        let elapsed = self.start_time.elapsed();
        info!(
            "{} {} in {:.1}s ({})",
            self.action,
            format_bytes(done_bytes),
            elapsed.as_secs_f64(),
            format_speed(average_speed(done_bytes, elapsed))
        );
    }
}

fn percent(done: u64, total: u64) -> f64 {
    if total > 0 {
        (done as f64 / total as f64) * 100.0
    } else {
        100.0
    }
}

fn average_speed(bytes: u64, elapsed: Duration) -> u64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        (bytes as f64 / secs) as u64
    } else {
        0
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed as human-readable string
pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}
