// crates/avcap-core/src/stats.rs
//
// Ambient monitoring counters (§10.5). Grounded on `encode.rs`'s periodic
// progress reporting and `aes67-rs`'s stats module: plain atomics a caller
// can snapshot at any time, no sampling thread owned by this crate.

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-path counters updated by the fetcher and muxer workers. Cheap enough
/// to bump on every frame; reading is a handful of relaxed loads.
#[derive(Debug, Default)]
pub struct CaptureStats {
    pub frames_produced: AtomicU64,
    pub frames_delivered: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub bytes_muxed: AtomicU64,
}

impl CaptureStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_produced(&self) {
        self.frames_produced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_delivered(&self) {
        self.frames_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_muxed(&self, n: u64) {
        self.bytes_muxed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CaptureStatsSnapshot {
        CaptureStatsSnapshot {
            frames_produced: self.frames_produced.load(Ordering::Relaxed),
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            bytes_muxed: self.bytes_muxed.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time, `Copy`-able read of [`CaptureStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStatsSnapshot {
    pub frames_produced: u64,
    pub frames_delivered: u64,
    pub frames_dropped: u64,
    pub bytes_muxed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let stats = CaptureStats::new();
        stats.inc_produced();
        stats.inc_produced();
        stats.inc_delivered();
        stats.inc_dropped();
        stats.add_bytes_muxed(128);

        let snap = stats.snapshot();
        assert_eq!(snap.frames_produced, 2);
        assert_eq!(snap.frames_delivered, 1);
        assert_eq!(snap.frames_dropped, 1);
        assert_eq!(snap.bytes_muxed, 128);
    }
}
