// crates/avcap-pipeline/src/ring.rs
//
// §4.B: a single-producer/single-consumer byte arena for variable-size
// records — reserve/commit on the write side, read-lock/read-unlock on the
// read side. Used for the raw-audio source pool and for a muxer's streamed
// output bytes (§4.G), each as an independent instance per §9's "do not
// unify" note.

use avcap_core::error::RingError;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

struct Outstanding {
    /// Offset the reservation starts at, after any end-of-arena wrap.
    start: usize,
    /// Bytes requested by the caller.
    requested: usize,
    /// Bytes actually claimed from the arena, including any wasted prefix
    /// skipped by a wrap-around reservation.
    span: usize,
}

struct Committed {
    start: usize,
    span: usize,
    /// Bytes actually published; may be less than `span` when `commit`
    /// published fewer bytes than were reserved (a discarded slot).
    len: usize,
}

struct RingInner {
    data: Vec<u8>,
    write_pos: usize,
    used: usize,
    reserved: Option<Outstanding>,
    committed: VecDeque<Committed>,
    locked: Option<Committed>,
    destroyed: bool,
}

/// A fixed-capacity byte arena handing out variable-length committed
/// records in FIFO order.
pub struct ByteRing {
    capacity: usize,
    inner: Mutex<RingInner>,
    not_full: Condvar,
}

impl ByteRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(RingInner {
                data: vec![0u8; capacity],
                write_pos: 0,
                used: 0,
                reserved: None,
                committed: VecDeque::new(),
                locked: None,
                destroyed: false,
            }),
            not_full: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Blocks until `n` contiguous bytes are available, then returns a
    /// writable pointer into the arena.
    ///
    /// # Safety
    /// The caller must write at most `n` bytes through the returned pointer
    /// and must not retain it past the matching `commit` call.
    pub unsafe fn reserve(&self, n: usize) -> Result<*mut u8, RingError> {
        if n > self.capacity {
            return Err(RingError::TooLarge(n));
        }
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.destroyed {
                return Err(RingError::Destroyed);
            }
            if inner.reserved.is_some() {
                inner = self.not_full.wait(inner).unwrap();
                continue;
            }
            let start = inner.write_pos;
            let wraps = start + n > self.capacity;
            let span = if wraps { (self.capacity - start) + n } else { n };
            let real_start = if wraps { 0 } else { start };
            if inner.used + span > self.capacity {
                inner = self.not_full.wait(inner).unwrap();
                continue;
            }
            inner.used += span;
            inner.reserved = Some(Outstanding { start: real_start, requested: n, span });
            let ptr = unsafe { inner.data.as_mut_ptr().add(real_start) };
            return Ok(ptr);
        }
    }

    /// Publishes `n` bytes of the outstanding reservation as one committed
    /// record. `n` may be less than the reserved length to discard the
    /// write.
    pub fn commit(&self, n: usize) -> Result<(), RingError> {
        let mut inner = self.inner.lock().unwrap();
        let outstanding = inner.reserved.take().ok_or(RingError::InvalidCommit(n, 0))?;
        if n > outstanding.requested {
            let requested = outstanding.requested;
            inner.reserved = Some(outstanding);
            return Err(RingError::InvalidCommit(n, requested));
        }
        inner.write_pos = (outstanding.start + outstanding.requested) % self.capacity;
        inner.committed.push_back(Committed { start: outstanding.start, span: outstanding.span, len: n });
        Ok(())
    }

    /// Returns a read-only view of the oldest committed record without
    /// removing it, or `None` if nothing is committed. Idempotent: calling
    /// again before `read_unlock` returns the same region.
    ///
    /// # Safety
    /// The returned slice is valid only until the matching `read_unlock`.
    pub unsafe fn read_lock(&self) -> Option<(*const u8, usize)> {
        let mut inner = self.inner.lock().unwrap();
        if inner.locked.is_none() {
            inner.locked = inner.committed.pop_front();
        }
        inner.locked.as_ref().map(|c| {
            let ptr = unsafe { inner.data.as_ptr().add(c.start) };
            (ptr, c.len)
        })
    }

    /// Advances past the currently locked record. No-op if nothing is
    /// locked.
    pub fn read_unlock(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(c) = inner.locked.take() {
            inner.used -= c.span;
            self.not_full.notify_all();
        }
    }

    /// Frees the oldest committed record without exposing its bytes to a
    /// caller. Used by producers that already captured a pointer into the
    /// record at `reserve` time (the audio source ring, fanned out across
    /// paths by identity) rather than through `read_lock`/`read_unlock`.
    /// No-op if nothing is committed.
    pub fn release_record(&self) {
        let mut inner = self.inner.lock().unwrap();
        let next = inner.locked.take().or_else(|| inner.committed.pop_front());
        if let Some(c) = next {
            inner.used -= c.span;
            self.not_full.notify_all();
        }
    }

    /// Discards every committed (and currently locked) record, freeing
    /// their space without the consumer observing them.
    pub fn drain(&self) {
        let mut inner = self.inner.lock().unwrap();
        let mut freed = 0usize;
        if let Some(c) = inner.locked.take() {
            freed += c.span;
        }
        while let Some(c) = inner.committed.pop_front() {
            freed += c.span;
        }
        inner.used -= freed;
        self.not_full.notify_all();
    }

    pub fn destroy(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.destroyed = true;
        self.not_full.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_commit_read_round_trip() {
        let ring = ByteRing::new(64);
        unsafe {
            let ptr = ring.reserve(4).unwrap();
            std::ptr::copy_nonoverlapping([1u8, 2, 3, 4].as_ptr(), ptr, 4);
        }
        ring.commit(4).unwrap();

        let (ptr, len) = unsafe { ring.read_lock() }.unwrap();
        assert_eq!(len, 4);
        let bytes = unsafe { std::slice::from_raw_parts(ptr, len) };
        assert_eq!(bytes, &[1, 2, 3, 4]);
        ring.read_unlock();

        assert!(unsafe { ring.read_lock() }.is_none());
    }

    #[test]
    fn commit_less_than_reserved_discards_the_remainder() {
        let ring = ByteRing::new(64);
        unsafe {
            ring.reserve(10).unwrap();
        }
        ring.commit(3).unwrap();
        let (_, len) = unsafe { ring.read_lock() }.unwrap();
        assert_eq!(len, 3);
        ring.read_unlock();
    }

    #[test]
    fn reserve_blocks_until_space_frees_then_unblocks() {
        use std::sync::Arc;
        use std::thread;
        use std::time::Duration;

        let ring = Arc::new(ByteRing::new(8));
        unsafe {
            ring.reserve(8).unwrap();
        }
        ring.commit(8).unwrap();

        let ring2 = ring.clone();
        let handle = thread::spawn(move || unsafe { ring2.reserve(8).unwrap() });

        thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());

        let (_, len) = unsafe { ring.read_lock() }.unwrap();
        assert_eq!(len, 8);
        ring.read_unlock();

        handle.join().unwrap();
    }

    #[test]
    fn drain_discards_without_exposing_records() {
        let ring = ByteRing::new(32);
        unsafe {
            ring.reserve(4).unwrap();
        }
        ring.commit(4).unwrap();
        ring.drain();
        assert!(unsafe { ring.read_lock() }.is_none());
    }
}
