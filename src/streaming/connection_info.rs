//! Connection quality statistics fed by pull round trips

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Weight of the newest sample in the moving averages
const SMOOTHING: f64 = 0.2;

/// Snapshot of connection statistics
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ConnectionStats {
    /// Smoothed round-trip time in milliseconds
    pub round_trip_ms: f64,
    /// Smoothed bandwidth in bytes per millisecond
    pub bandwidth: f64,
    pub requests: u64,
    pub total_buckets: u64,
    pub total_bytes: u64,
}

impl ConnectionStats {
    fn record(&mut self, round_trip: Duration, bucket_count: usize, byte_count: usize) {
        let rtt = round_trip.as_secs_f64() * 1000.0;
        let bandwidth = byte_count as f64 / rtt.max(1.0);

        if self.requests == 0 {
            self.round_trip_ms = rtt;
            self.bandwidth = bandwidth;
        } else {
            self.round_trip_ms += SMOOTHING * (rtt - self.round_trip_ms);
            self.bandwidth += SMOOTHING * (bandwidth - self.bandwidth);
        }
        self.requests += 1;
        self.total_buckets += bucket_count as u64;
        self.total_bytes += byte_count as u64;
    }
}

/// Shared connection quality tracker, keyed by layer name
#[derive(Debug, Default)]
pub struct ConnectionInfo {
    layers: Mutex<HashMap<String, ConnectionStats>>,
    overall: Mutex<ConnectionStats>,
}

impl ConnectionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed batch
    pub fn log(&self, layer: &str, round_trip: Duration, bucket_count: usize, byte_count: usize) {
        if let Ok(mut layers) = self.layers.lock() {
            layers
                .entry(layer.to_string())
                .or_default()
                .record(round_trip, bucket_count, byte_count);
        }
        if let Ok(mut overall) = self.overall.lock() {
            overall.record(round_trip, bucket_count, byte_count);
        }
        log::trace!(
            "{}: {} buckets, {} bytes in {:?}",
            layer,
            bucket_count,
            byte_count,
            round_trip
        );
    }

    pub fn stats(&self) -> ConnectionStats {
        self.overall.lock().map(|s| *s).unwrap_or_default()
    }

    pub fn layer_stats(&self, layer: &str) -> Option<ConnectionStats> {
        self.layers.lock().ok()?.get(layer).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sample_sets_averages() {
        let info = ConnectionInfo::new();
        info.log("color", Duration::from_millis(100), 3, 3000);

        let stats = info.stats();
        assert_eq!(stats.requests, 1);
        assert_eq!(stats.total_buckets, 3);
        assert_eq!(stats.total_bytes, 3000);
        assert!((stats.round_trip_ms - 100.0).abs() < 1e-9);
        assert!((stats.bandwidth - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_moving_average() {
        let info = ConnectionInfo::new();
        info.log("color", Duration::from_millis(100), 1, 100);
        info.log("color", Duration::from_millis(200), 1, 100);

        let stats = info.layer_stats("color").unwrap();
        assert!((stats.round_trip_ms - 120.0).abs() < 1e-9);
        assert_eq!(stats.requests, 2);
        assert!(info.layer_stats("segmentation").is_none());
    }
}
