//! Progress tracking for individual transfers

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

/// Minimum spacing between progress log lines for one transfer
pub const REPORT_INTERVAL_MS: i64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferDirection {
    Fetch,
    Push,
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferDirection::Fetch => f.write_str("fetch"),
            TransferDirection::Push => f.write_str("push"),
        }
    }
}

/// Progress for one file moving between replicas
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferProgress {
    pub path: String,
    pub direction: TransferDirection,
    pub size: u64,
    pub transferred: u64,
    /// Bytes already held when the transfer (re)started
    pub resumed_from: u64,
    pub start_time: DateTime<Utc>,
    #[serde(skip)]
    last_report: Option<DateTime<Utc>>,
}

impl TransferProgress {
    pub fn new(path: impl Into<String>, direction: TransferDirection, size: u64, resumed_from: u64) -> Self {
        Self::starting_at(path, direction, size, resumed_from, Utc::now())
    }

    pub fn starting_at(
        path: impl Into<String>,
        direction: TransferDirection,
        size: u64,
        resumed_from: u64,
        start_time: DateTime<Utc>,
    ) -> Self {
        let resumed_from = resumed_from.min(size);
        Self {
            path: path.into(),
            direction,
            size,
            transferred: resumed_from,
            resumed_from,
            start_time,
            last_report: None,
        }
    }

    pub fn percentage(&self) -> f32 {
        if self.size == 0 {
            return 100.0;
        }
        (self.transferred as f32 / self.size as f32) * 100.0
    }

    /// MiB per second moved in this session, excluding resumed bytes
    pub fn throughput_mbps(&self, now: DateTime<Utc>) -> f64 {
        let elapsed = (now - self.start_time).num_milliseconds();
        if elapsed <= 0 {
            return 0.0;
        }
        let moved = self.transferred.saturating_sub(self.resumed_from) as f64;
        moved / (elapsed as f64 / 1000.0) / (1024.0 * 1024.0)
    }

    pub fn is_complete(&self) -> bool {
        self.transferred >= self.size
    }

    pub fn advance(&mut self, bytes: u64) {
        self.advance_at(bytes, Utc::now());
    }

    /// Count `bytes` as moved; returns true when a progress line was logged
    pub fn advance_at(&mut self, bytes: u64, now: DateTime<Utc>) -> bool {
        self.transferred = self.transferred.saturating_add(bytes).min(self.size);
        if self.is_complete() {
            info!(
                "{} {} done: {} bytes ({:.2} MB/s)",
                self.direction,
                self.path,
                self.size,
                self.throughput_mbps(now)
            );
            return true;
        }

        let since = self.last_report.unwrap_or(self.start_time);
        if now - since < Duration::milliseconds(REPORT_INTERVAL_MS) {
            return false;
        }
        self.last_report = Some(now);
        debug!(
            "{} {}: {:.1}% ({:.2} MB/s)",
            self.direction,
            self.path,
            self.percentage(),
            self.throughput_mbps(now)
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentage_and_resume() {
        let progress = TransferProgress::new("a.png", TransferDirection::Fetch, 4000, 1000);
        assert_eq!(progress.transferred, 1000);
        assert_eq!(progress.percentage(), 25.0);
        assert!(!progress.is_complete());

        let empty = TransferProgress::new("e.md", TransferDirection::Push, 0, 0);
        assert_eq!(empty.percentage(), 100.0);
        assert!(empty.is_complete());
    }

    #[test]
    fn test_throughput_ignores_resumed_bytes() {
        let start = Utc::now();
        let mut progress = TransferProgress::starting_at("v.png", TransferDirection::Push, 8 << 20, 2 << 20, start);
        progress.advance_at(2 << 20, start + Duration::milliseconds(500));
        let rate = progress.throughput_mbps(start + Duration::seconds(1));
        assert!((rate - 2.0).abs() < 1e-9, "rate {}", rate);
        assert_eq!(progress.throughput_mbps(start), 0.0);
    }

    #[test]
    fn test_reports_are_rate_limited() {
        let start = Utc::now();
        let mut progress = TransferProgress::starting_at("big.png", TransferDirection::Fetch, 1000, 0, start);
        assert!(!progress.advance_at(100, start + Duration::milliseconds(200)));
        assert!(progress.advance_at(100, start + Duration::milliseconds(1200)));
        assert!(!progress.advance_at(100, start + Duration::milliseconds(1500)));
        assert!(progress.advance_at(100, start + Duration::milliseconds(2300)));
        // Completion is always reported
        assert!(progress.advance_at(600, start + Duration::milliseconds(2400)));
        assert_eq!(progress.transferred, 1000);
    }
}
