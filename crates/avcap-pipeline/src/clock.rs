// crates/avcap-pipeline/src/clock.rs
//
// §4.D: a monotonic PTS reference shared by both fetcher loops. `none` mode
// never corrects either stream; `audio-master` lets the audio fetcher set
// the reference; `system-master` derives the reference from wall-clock time
// since `start`.

use avcap_core::error::ClockError;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::time::Instant;

/// Tolerance (ms) beyond which a stream's PTS is snapped to the clock
/// rather than trusted as-is (§3, §4.E).
pub const SYNC_TOLERANCE_MS: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    None,
    AudioMaster,
    SystemMaster,
}

pub struct SyncClock {
    mode: SyncMode,
    started_at: AtomicI64,
    audio_pts: AtomicI64,
    running: AtomicU8,
}

const NOT_STARTED: i64 = -1;

impl SyncClock {
    pub fn new(mode: SyncMode) -> Self {
        Self { mode, started_at: AtomicI64::new(NOT_STARTED), audio_pts: AtomicI64::new(0), running: AtomicU8::new(0) }
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    pub fn start(&self) {
        self.started_at.store(now_ms(), Ordering::SeqCst);
        self.audio_pts.store(0, Ordering::SeqCst);
        self.running.store(1, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.running.store(0, Ordering::SeqCst);
        self.started_at.store(NOT_STARTED, Ordering::SeqCst);
    }

    pub fn update_audio(&self, pts_ms: u32) {
        if self.mode == SyncMode::AudioMaster {
            self.audio_pts.store(pts_ms as i64, Ordering::SeqCst);
        }
    }

    pub fn current(&self) -> Result<i64, ClockError> {
        if self.running.load(Ordering::SeqCst) == 0 {
            return Err(ClockError::NotStarted);
        }
        match self.mode {
            SyncMode::AudioMaster => Ok(self.audio_pts.load(Ordering::SeqCst)),
            SyncMode::SystemMaster | SyncMode::None => {
                let started = self.started_at.load(Ordering::SeqCst);
                Ok(now_ms() - started)
            }
        }
    }

    /// Applies the §3 drift rule for non-audio-master sync: snap `pts` to
    /// `clock_now` if it drifted by more than [`SYNC_TOLERANCE_MS`].
    pub fn reconcile(&self, pts_ms: u32) -> u32 {
        if self.mode == SyncMode::AudioMaster {
            return pts_ms;
        }
        match self.current() {
            Ok(clock_now) => {
                let drift = (pts_ms as i64) - clock_now;
                if drift.abs() > SYNC_TOLERANCE_MS {
                    clock_now.max(0) as u32
                } else {
                    pts_ms
                }
            }
            Err(_) => pts_ms,
        }
    }
}

// Process-monotonic millisecond clock backed by `Instant`, which avoids the
// wall-clock jumps a raw `SystemTime` read would expose to the drift check.
fn now_ms() -> i64 {
    use std::sync::OnceLock;
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn not_started_reports_error() {
        let clock = SyncClock::new(SyncMode::SystemMaster);
        assert!(matches!(clock.current(), Err(ClockError::NotStarted)));
    }

    #[test]
    fn audio_master_tracks_updates() {
        let clock = SyncClock::new(SyncMode::AudioMaster);
        clock.start();
        clock.update_audio(40);
        assert_eq!(clock.current().unwrap(), 40);
    }

    #[test]
    fn system_master_advances_with_wall_time() {
        let clock = SyncClock::new(SyncMode::SystemMaster);
        clock.start();
        sleep(Duration::from_millis(20));
        assert!(clock.current().unwrap() >= 20);
    }

    #[test]
    fn reconcile_snaps_pts_beyond_tolerance() {
        let clock = SyncClock::new(SyncMode::SystemMaster);
        clock.start();
        let snapped = clock.reconcile(10_000);
        assert!(snapped < 10_000);
    }

    #[test]
    fn reconcile_leaves_pts_within_tolerance() {
        let clock = SyncClock::new(SyncMode::SystemMaster);
        clock.start();
        let pts = clock.reconcile(0);
        assert!(pts <= SYNC_TOLERANCE_MS as u32);
    }
}
