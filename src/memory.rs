//! Parameter-memory accounting for sharded blocks.
//!
//! Candle owns the real allocations; this tracker mirrors the parameter
//! bytes one worker holds so the sharding discipline stays observable.
//! Every flat parameter books its resident shard once at construction,
//! then books the gathered remainder in and out around each
//! materialization. `peak` therefore records the worst instant of a step:
//! the sharded residue plus whatever was gathered at the same time. An
//! optional limit marks the budget past which `allocate` reports
//! over-budget; the materialization path logs a warning when it trips.

use std::sync::{Arc, Mutex};

/// Byte counter for one worker's parameter residency. Does not manage any
/// device memory itself.
#[derive(Debug, Clone)]
pub struct MemoryTracker {
    resident: usize,
    high_water: usize,
    limit: Option<usize>,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self {
            resident: 0,
            high_water: 0,
            limit: None,
        }
    }

    /// Tracker with a byte budget
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::new()
        }
    }

    /// Book `bytes` in. Returns false when the total is past the limit.
    pub fn allocate(&mut self, bytes: usize) -> bool {
        self.resident += bytes;
        if self.resident > self.high_water {
            self.high_water = self.resident;
        }
        self.limit.is_none_or(|limit| self.resident <= limit)
    }

    /// Book `bytes` out
    pub fn release(&mut self, bytes: usize) {
        self.resident = self.resident.saturating_sub(bytes);
    }

    /// Bytes currently booked
    pub fn current(&self) -> usize {
        self.resident
    }

    /// Highest value `current` has reached
    pub fn peak(&self) -> usize {
        self.high_water
    }

    /// Whether the booked total currently exceeds the budget
    pub fn is_over_limit(&self) -> bool {
        self.limit.is_some_and(|limit| self.resident > limit)
    }
}

impl Default for MemoryTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared handle to one tracker, cloned into every flat parameter.
#[derive(Debug, Clone, Default)]
pub struct SharedMemoryTracker {
    inner: Arc<Mutex<MemoryTracker>>,
}

impl SharedMemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryTracker::with_limit(limit))),
        }
    }

    /// Book `bytes` in. Returns false when the total is past the limit.
    pub fn allocate(&self, bytes: usize) -> bool {
        match self.inner.lock() {
            Ok(mut tracker) => tracker.allocate(bytes),
            Err(_) => true,
        }
    }

    pub fn release(&self, bytes: usize) {
        if let Ok(mut tracker) = self.inner.lock() {
            tracker.release(bytes);
        }
    }

    pub fn current(&self) -> usize {
        self.inner.lock().map(|t| t.current()).unwrap_or(0)
    }

    pub fn peak(&self) -> usize {
        self.inner.lock().map(|t| t.peak()).unwrap_or(0)
    }

    pub fn is_over_limit(&self) -> bool {
        self.inner
            .lock()
            .map(|t| t.is_over_limit())
            .unwrap_or(false)
    }
}

/// Format bytes as a human-readable string
pub fn format_bytes(bytes: usize) -> String {
    const UNITS: [&str; 4] = ["bytes", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} bytes", bytes)
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_residency_cycle() {
        // One block: shard resident at rest, remainder booked around a
        // materialization, peak keeps the gathered high-water mark
        let mut tracker = MemoryTracker::new();
        let shard = 256;
        let overhead = 768;

        tracker.allocate(shard);
        assert_eq!(tracker.current(), shard);

        tracker.allocate(overhead);
        assert_eq!(tracker.current(), shard + overhead);

        tracker.release(overhead);
        assert_eq!(tracker.current(), shard);
        assert_eq!(tracker.peak(), shard + overhead);
    }

    #[test]
    fn test_limit_reports_over_budget() {
        let mut tracker = MemoryTracker::with_limit(1000);
        assert!(tracker.allocate(900));
        assert!(!tracker.is_over_limit());

        assert!(!tracker.allocate(200));
        assert!(tracker.is_over_limit());

        tracker.release(200);
        assert!(!tracker.is_over_limit());
        assert_eq!(tracker.peak(), 1100);
    }

    #[test]
    fn test_release_saturates_at_zero() {
        let mut tracker = MemoryTracker::new();
        tracker.allocate(10);
        tracker.release(100);
        assert_eq!(tracker.current(), 0);
    }

    #[test]
    fn test_shared_handles_alias_one_tracker() {
        let tracker = SharedMemoryTracker::with_limit(2048);
        let handle = tracker.clone();

        handle.allocate(1024);
        handle.allocate(2048);
        handle.release(2048);

        assert_eq!(tracker.current(), 1024);
        assert_eq!(tracker.peak(), 3072);
        assert!(!tracker.is_over_limit());
    }

    #[test]
    fn test_format_bytes_units() {
        assert_eq!(format_bytes(0), "0 bytes");
        assert_eq!(format_bytes(512), "512 bytes");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00 MB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.00 GB");
    }
}
