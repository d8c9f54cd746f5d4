// crates/avcap-pipeline/src/fanout.rs
//
// Cross-path reference counting for the single audio/video source buffer a
// fetcher produces each iteration. Each active path gets its own
// independent `ShareQueue` (§3: "two share queues (audio, video)" per
// path) — so when N paths are active, the same source-owned buffer is
// handed to N independent share queues, and the buffer must only travel
// back to the source once all N have released their copy, on top of each
// share queue's own per-outlet refcounting.
//
// Keyed by the buffer's pointer identity, which is stable for as long as
// the source (or ring) holds it live.

use avcap_core::types::Frame;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

struct PendingRelease {
    remaining: AtomicUsize,
    action: Box<dyn Fn() + Send + Sync>,
}

#[derive(Default)]
pub struct CrossPathFanout {
    pending: Mutex<HashMap<usize, Arc<PendingRelease>>>,
}

impl CrossPathFanout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a freshly produced frame as shared by `path_count`
    /// independent share queues. `action` runs exactly once, after
    /// `path_count` calls to [`CrossPathFanout::release`] for this frame's
    /// buffer identity.
    pub fn begin(&self, frame: &Frame, path_count: usize, action: impl Fn() + Send + Sync + 'static) {
        if path_count == 0 {
            action();
            return;
        }
        let mut pending = self.pending.lock().unwrap();
        pending.insert(
            frame.buffer.identity(),
            Arc::new(PendingRelease { remaining: AtomicUsize::new(path_count), action: Box::new(action) }),
        );
    }

    /// Called by a path's share queue release callback once its own
    /// per-outlet refcount for this frame has reached zero.
    pub fn release(&self, frame: Frame) {
        let identity = frame.buffer.identity();
        let entry = {
            let pending = self.pending.lock().unwrap();
            pending.get(&identity).cloned()
        };
        let Some(entry) = entry else {
            return;
        };
        if entry.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            let mut pending = self.pending.lock().unwrap();
            pending.remove(&identity);
            drop(pending);
            (entry.action)();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avcap_core::types::{SourceBuffer, StreamKind};
    use std::sync::atomic::AtomicBool;

    #[test]
    fn action_runs_once_all_paths_release() {
        let bytes = [1u8, 2, 3, 4];
        let frame = Frame { stream: StreamKind::Audio, pts_ms: 0, buffer: SourceBuffer::from_slice(&bytes), token: None };
        let fanout = CrossPathFanout::new();
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        fanout.begin(&frame, 2, move || f.store(true, Ordering::SeqCst));

        fanout.release(frame);
        assert!(!fired.load(Ordering::SeqCst));

        fanout.release(frame);
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn zero_paths_releases_immediately() {
        let bytes = [1u8];
        let frame = Frame { stream: StreamKind::Video, pts_ms: 0, buffer: SourceBuffer::from_slice(&bytes), token: None };
        let fanout = CrossPathFanout::new();
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        fanout.begin(&frame, 0, move || f.store(true, Ordering::SeqCst));
        assert!(fired.load(Ordering::SeqCst));
    }
}
