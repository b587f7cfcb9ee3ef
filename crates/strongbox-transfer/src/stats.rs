/// Per-packet throughput tracking: instantaneous rate, EWMA-smoothed rate,
/// and remaining-time estimate.

use std::time::{Duration, Instant};

use strongbox_types::events::StatusEvent;

/// EWMA weight for the newest sample (same spirit as TCP's RTT smoothing).
const SMOOTHING: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSample {
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub instant_bps: u64,
    pub smoothed_bps: u64,
    pub eta: Duration,
}

impl ProgressSample {
    pub fn to_event(&self) -> StatusEvent {
        StatusEvent::Progress {
            bytes_done: self.bytes_done,
            bytes_total: self.bytes_total,
            speed_bytes_per_sec: self.smoothed_bps,
            eta_ms: u64::try_from(self.eta.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Progress as a fraction 0.0 - 1.0.
    pub fn fraction(&self) -> f64 {
        if self.bytes_total == 0 {
            return 1.0;
        }
        (self.bytes_done as f64 / self.bytes_total as f64).min(1.0)
    }
}

#[derive(Debug)]
pub struct ThroughputMeter {
    bytes_total: u64,
    bytes_done: u64,
    started: Instant,
    last: Instant,
    smoothed_bps: Option<f64>,
}

impl ThroughputMeter {
    pub fn new(bytes_total: u64) -> Self {
        let now = Instant::now();
        Self {
            bytes_total,
            bytes_done: 0,
            started: now,
            last: now,
            smoothed_bps: None,
        }
    }

    pub fn record(&mut self, bytes: u64) -> ProgressSample {
        self.record_at(bytes, Instant::now())
    }

    /// Record `bytes` acknowledged at `now`.
    pub fn record_at(&mut self, bytes: u64, now: Instant) -> ProgressSample {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.last = now;
        self.bytes_done = (self.bytes_done + bytes).min(self.bytes_total);

        // Sub-microsecond loopback packets would otherwise report absurd rates.
        let instant = bytes as f64 / elapsed.max(1e-6);
        let smoothed = match self.smoothed_bps {
            None => instant,
            Some(prev) => (1.0 - SMOOTHING) * prev + SMOOTHING * instant,
        };
        self.smoothed_bps = Some(smoothed);

        let remaining = self.bytes_total - self.bytes_done;
        let eta = if remaining == 0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(remaining as f64 / smoothed).unwrap_or(Duration::MAX)
        };

        ProgressSample {
            bytes_done: self.bytes_done,
            bytes_total: self.bytes_total,
            instant_bps: instant as u64,
            smoothed_bps: smoothed as u64,
            eta,
        }
    }

    /// Average throughput since start, in bytes/sec.
    pub fn average_bps(&self) -> u64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0;
        }
        (self.bytes_done as f64 / elapsed) as u64
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steady_rate_and_eta() {
        let mut meter = ThroughputMeter::new(10_000);
        let t0 = meter.last;
        let s = meter.record_at(1000, t0 + Duration::from_millis(100));
        assert_eq!(s.instant_bps, 10_000);
        assert_eq!(s.smoothed_bps, 10_000);
        assert!((s.eta.as_secs_f64() - 0.9).abs() < 1e-6);
        assert!((s.fraction() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn smoothing_damps_spikes() {
        let mut meter = ThroughputMeter::new(1_000_000);
        let t0 = meter.last;
        meter.record_at(1000, t0 + Duration::from_millis(100));
        let s = meter.record_at(1000, t0 + Duration::from_millis(110));
        // instant jumped to 100 kB/s, smoothed moves only 20% of the way
        assert_eq!(s.instant_bps, 100_000);
        assert_eq!(s.smoothed_bps, 28_000);
    }

    #[test]
    fn completion_has_zero_eta() {
        let mut meter = ThroughputMeter::new(500);
        let t0 = meter.last;
        let s = meter.record_at(500, t0 + Duration::from_millis(5));
        assert_eq!(s.eta, Duration::ZERO);
        assert_eq!(s.fraction(), 1.0);
        match s.to_event() {
            StatusEvent::Progress { bytes_done, eta_ms, .. } => {
                assert_eq!(bytes_done, 500);
                assert_eq!(eta_ms, 0);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
