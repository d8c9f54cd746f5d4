// crates/avcap-pipeline/src/share_queue.rs
//
// §4.C: the correctness keystone. A single producer hands a frame to `add`,
// which logically duplicates it into every enabled outlet and releases the
// underlying source buffer back to the producer exactly once, when the last
// enabled outlet has released its copy.
//
// Identity for release matching is the `SlotToken` stamped onto the frame
// by `add`, per the redesign note in the design document: the token doubles
// as the slot's index (`token.0 % depth`), so `release` is an O(1) array
// lookup instead of a linear scan for a matching buffer pointer. A stale or
// foreign token is rejected as `FrameNotFound`, preserving that failure mode
// for genuine protocol violations (double release, release on the wrong
// queue).

use crate::queue::BoundedQueue;
use avcap_core::error::ShareQueueError;
use avcap_core::types::{Frame, SlotToken};
use std::sync::{Arc, Condvar, Mutex};
use tracing::warn;

/// Called exactly once per admitted frame, when every enabled outlet at the
/// time of `add` has released its copy. Returns the underlying source
/// buffer to its owner.
pub type ReleaseCallback = Arc<dyn Fn(Frame) + Send + Sync>;

struct Slot {
    token: SlotToken,
    ref_count: usize,
    frame: Frame,
}

struct Outlet {
    enabled: bool,
    queue: Option<Arc<BoundedQueue<Frame>>>,
}

struct Inner {
    slots: Vec<Option<Slot>>,
    /// Count of frames admitted via `add` so far; also the next slot token.
    produced: u64,
    /// Count of slots fully collected (ref_count reached zero) so far.
    head: u64,
    valid_count: usize,
    outlets: Vec<Outlet>,
}

pub struct ShareQueue {
    depth: usize,
    external_mode: bool,
    release_cb: ReleaseCallback,
    inner: Mutex<Inner>,
    not_full: Condvar,
}

impl ShareQueue {
    /// `outlet_count` = K, `depth` = Q (ring depth). Each outlet gets an
    /// internally-allocated queue of `outlet_queue_depth`.
    pub fn new_internal(outlet_count: usize, depth: usize, outlet_queue_depth: usize, release_cb: ReleaseCallback) -> Self {
        let outlets = (0..outlet_count)
            .map(|_| Outlet { enabled: false, queue: Some(Arc::new(BoundedQueue::new(outlet_queue_depth))) })
            .collect();
        Self::build(outlet_count, depth, outlets, false, release_cb)
    }

    /// External-queues mode: outlets start with no queue attached; callers
    /// must `set_outlet_queue` before enabling.
    pub fn new_external(outlet_count: usize, depth: usize, release_cb: ReleaseCallback) -> Self {
        let outlets = (0..outlet_count).map(|_| Outlet { enabled: false, queue: None }).collect();
        Self::build(outlet_count, depth, outlets, true, release_cb)
    }

    fn build(_outlet_count: usize, depth: usize, outlets: Vec<Outlet>, external_mode: bool, release_cb: ReleaseCallback) -> Self {
        Self {
            depth,
            external_mode,
            release_cb,
            inner: Mutex::new(Inner { slots: (0..depth).map(|_| None).collect(), produced: 0, head: 0, valid_count: 0, outlets }),
            not_full: Condvar::new(),
        }
    }

    pub fn set_outlet_queue(&self, i: usize, q: Arc<BoundedQueue<Frame>>) -> Result<(), ShareQueueError> {
        if !self.external_mode {
            return Err(ShareQueueError::NotExternalMode);
        }
        let mut inner = self.inner.lock().unwrap();
        let outlet = inner.outlets.get_mut(i).ok_or(ShareQueueError::InvalidOutlet(i))?;
        outlet.queue = Some(q);
        Ok(())
    }

    /// Enables or disables an outlet. Disabling drains any frames still
    /// queued for it, releasing each one so refcounts stay consistent —
    /// the "disabled outlet quiesces" testable property.
    pub fn enable(&self, i: usize, on: bool) -> Result<(), ShareQueueError> {
        let queue = {
            let mut inner = self.inner.lock().unwrap();
            let outlet = inner.outlets.get_mut(i).ok_or(ShareQueueError::InvalidOutlet(i))?;
            if outlet.enabled == on {
                return Ok(());
            }
            outlet.enabled = on;
            if on {
                inner.valid_count += 1;
                None
            } else {
                inner.valid_count -= 1;
                outlet.queue.clone()
            }
        };
        if let Some(q) = queue {
            let mut drained = Vec::new();
            q.drain(|frame| drained.push(frame));
            for frame in drained {
                self.release(&frame);
            }
        }
        Ok(())
    }

    pub fn outlet_queue(&self, i: usize) -> Result<Arc<BoundedQueue<Frame>>, ShareQueueError> {
        let inner = self.inner.lock().unwrap();
        inner.outlets.get(i).and_then(|o| o.queue.clone()).ok_or(ShareQueueError::InvalidOutlet(i))
    }

    /// Reads the next frame from outlet `i`. Per §5, this waits on the
    /// outlet's own queue without holding the share queue's internal lock.
    pub fn recv_from_outlet(&self, i: usize, blocking: bool) -> Result<Frame, ShareQueueError> {
        let q = self.outlet_queue(i)?;
        q.recv(blocking).map_err(|e| match e {
            avcap_core::error::QueueError::Empty => ShareQueueError::NoFrame,
            avcap_core::error::QueueError::Destroyed => ShareQueueError::InvalidOutlet(i),
            avcap_core::error::QueueError::Full => unreachable!("recv never reports Full"),
        })
    }

    /// Admits one frame from the producer. If no outlet is currently
    /// enabled, the frame's buffer is released immediately and `add`
    /// returns without allocating a slot.
    pub fn add(&self, mut item: Frame) -> Result<(), ShareQueueError> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            // Re-checked on every iteration: an outlet can be disabled while
            // this call is parked waiting for a free slot, and a frame
            // admitted after that race with a stale outlet-count would never
            // be collected (zero refs, but no outlet left to release it).
            if inner.valid_count == 0 {
                drop(inner);
                (self.release_cb)(item);
                return Ok(());
            }
            if inner.produced - inner.head < self.depth as u64 {
                break;
            }
            inner = self.not_full.wait(inner).unwrap();
        }

        let token = SlotToken(inner.produced);
        item.token = Some(token);
        let valid_count = inner.valid_count;

        // Reserve-before-send: check every enabled outlet has room before
        // delivering to any of them, so a would-be-full outlet never leaves
        // the slot admitted with a ref nobody will ever release.
        let enabled_indices: Vec<usize> = inner
            .outlets
            .iter()
            .enumerate()
            .filter(|(_, o)| o.enabled)
            .map(|(i, _)| i)
            .collect();
        for &i in &enabled_indices {
            let outlet = &inner.outlets[i];
            if let Some(q) = &outlet.queue {
                if q.count() >= q.capacity() {
                    drop(inner);
                    (self.release_cb)(item);
                    return Err(ShareQueueError::OutletSendFailed(i));
                }
            }
        }

        let idx = (token.0 % self.depth as u64) as usize;
        inner.slots[idx] = Some(Slot { token, ref_count: valid_count, frame: item });
        inner.produced += 1;

        let mut lost_refs = 0usize;
        for &i in &enabled_indices {
            let queue = inner.outlets[i].queue.clone();
            if let Some(q) = queue {
                if q.try_send(item).is_err() {
                    lost_refs += 1;
                    warn!(outlet = i, "share queue outlet send failed after capacity precheck, rolling back its ref");
                }
            }
        }

        if lost_refs > 0 {
            if let Some(slot) = inner.slots[idx].as_mut() {
                slot.ref_count = slot.ref_count.saturating_sub(lost_refs);
            }
            self.collect_head(&mut inner);
        }

        Ok(())
    }

    /// Matches a released frame back to its slot via its `SlotToken` and
    /// decrements the ref count. Invokes the release callback once a
    /// contiguous run starting at the head reaches zero.
    pub fn release(&self, frame: &Frame) -> Result<(), ShareQueueError> {
        let token = frame.token.ok_or(ShareQueueError::FrameNotFound)?;
        let mut inner = self.inner.lock().unwrap();
        let idx = (token.0 % self.depth as u64) as usize;
        let matches = matches!(&inner.slots[idx], Some(slot) if slot.token == token);
        if !matches {
            return Err(ShareQueueError::FrameNotFound);
        }
        if let Some(slot) = inner.slots[idx].as_mut() {
            slot.ref_count = slot.ref_count.saturating_sub(1);
        }
        self.collect_head(&mut inner);
        Ok(())
    }

    fn collect_head(&self, inner: &mut Inner) {
        loop {
            if inner.head >= inner.produced {
                break;
            }
            let hidx = (inner.head % self.depth as u64) as usize;
            let ready = matches!(&inner.slots[hidx], Some(slot) if slot.ref_count == 0);
            if !ready {
                break;
            }
            let slot = inner.slots[hidx].take().unwrap();
            (self.release_cb)(slot.frame);
            inner.head += 1;
        }
        self.not_full.notify_all();
    }

    /// Drains every enabled outlet, releasing every item popped. Used to
    /// unblock readers during path disable and orchestrator stop.
    pub fn drain_all(&self) {
        let queues: Vec<Arc<BoundedQueue<Frame>>> = {
            let inner = self.inner.lock().unwrap();
            inner.outlets.iter().filter(|o| o.enabled).filter_map(|o| o.queue.clone()).collect()
        };
        for q in queues {
            let mut drained = Vec::new();
            q.drain(|frame| drained.push(frame));
            for frame in drained {
                let _ = self.release(&frame);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avcap_core::types::{SourceBuffer, StreamKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn frame(pts: u32) -> Frame {
        Frame { stream: StreamKind::Audio, pts_ms: pts, buffer: SourceBuffer::empty(), token: None }
    }

    #[test]
    fn refcount_closure_releases_exactly_once_after_k_releases() {
        let release_count = Arc::new(AtomicUsize::new(0));
        let rc = release_count.clone();
        let sq = ShareQueue::new_internal(2, 4, 4, Arc::new(move |_frame| { rc.fetch_add(1, Ordering::SeqCst); }));
        sq.enable(0, true).unwrap();
        sq.enable(1, true).unwrap();

        sq.add(frame(0)).unwrap();
        let a = sq.recv_from_outlet(0, false).unwrap();
        let b = sq.recv_from_outlet(1, false).unwrap();
        assert_eq!(release_count.load(Ordering::SeqCst), 0);

        sq.release(&a).unwrap();
        assert_eq!(release_count.load(Ordering::SeqCst), 0);
        sq.release(&b).unwrap();
        assert_eq!(release_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn add_with_no_enabled_outlets_releases_immediately() {
        let released = Arc::new(AtomicUsize::new(0));
        let r = released.clone();
        let sq = ShareQueue::new_internal(1, 4, 4, Arc::new(move |_| { r.fetch_add(1, Ordering::SeqCst); }));
        sq.add(frame(0)).unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn order_preservation_across_outlet() {
        let sq = ShareQueue::new_internal(1, 8, 8, Arc::new(|_| {}));
        sq.enable(0, true).unwrap();
        for pts in [0, 20, 40] {
            sq.add(frame(pts)).unwrap();
        }
        let mut seen = Vec::new();
        for _ in 0..3 {
            let f = sq.recv_from_outlet(0, false).unwrap();
            seen.push(f.pts_ms);
            sq.release(&f).unwrap();
        }
        assert_eq!(seen, vec![0, 20, 40]);
    }

    #[test]
    fn disabling_an_outlet_drains_and_releases_in_flight_frames() {
        let released = Arc::new(AtomicUsize::new(0));
        let r = released.clone();
        let sq = ShareQueue::new_internal(1, 4, 4, Arc::new(move |_| { r.fetch_add(1, Ordering::SeqCst); }));
        sq.enable(0, true).unwrap();
        sq.add(frame(0)).unwrap();
        sq.add(frame(20)).unwrap();
        sq.enable(0, false).unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn release_of_unknown_token_is_a_protocol_violation() {
        let sq = ShareQueue::new_internal(1, 4, 4, Arc::new(|_| {}));
        sq.enable(0, true).unwrap();
        let mut stray = frame(0);
        stray.token = Some(SlotToken(999));
        match sq.release(&stray) {
            Err(ShareQueueError::FrameNotFound) => {}
            other => panic!("expected FrameNotFound, got {other:?}"),
        }
    }

    #[test]
    fn backpressure_add_blocks_until_release_frees_a_slot() {
        use std::thread;
        use std::time::Duration;

        let sq = Arc::new(ShareQueue::new_internal(1, 2, 8, Arc::new(|_| {})));
        sq.enable(0, true).unwrap();
        sq.add(frame(0)).unwrap();
        sq.add(frame(20)).unwrap();

        let sq2 = sq.clone();
        let handle = thread::spawn(move || sq2.add(frame(40)));

        thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());

        let f = sq.recv_from_outlet(0, false).unwrap();
        sq.release(&f).unwrap();

        handle.join().unwrap().unwrap();
    }
}
