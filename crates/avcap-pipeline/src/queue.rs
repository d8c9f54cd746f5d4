// crates/avcap-pipeline/src/queue.rs
//
// §4.A: fixed-capacity FIFO of frame handles. Thin wrapper over
// `crossbeam_channel::bounded` — the same channel the teacher's worker
// threads talk over — adding the `count`/`destroy`/non-blocking-drain shape
// the spec asks for on top of it.

use avcap_core::error::QueueError;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// A bounded, typed FIFO. `T` is expected to be cheap to clone (frame
/// handles, not payloads) — the underlying buffer is never copied here.
pub struct BoundedQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    capacity: usize,
    destroyed: AtomicBool,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self { tx, rx, capacity, destroyed: AtomicBool::new(false) }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn count(&self) -> usize {
        self.rx.len()
    }

    fn check_destroyed(&self) -> Result<(), QueueError> {
        if self.destroyed.load(Ordering::SeqCst) {
            Err(QueueError::Destroyed)
        } else {
            Ok(())
        }
    }

    /// Blocks when full. Fails once the queue has been destroyed, either
    /// explicitly via [`BoundedQueue::destroy`] or because the other half of
    /// the channel was dropped.
    pub fn send(&self, item: T) -> Result<(), QueueError> {
        self.check_destroyed()?;
        self.tx.send(item).map_err(|_| QueueError::Destroyed)
    }

    pub fn try_send(&self, item: T) -> Result<(), QueueError> {
        self.check_destroyed()?;
        match self.tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(QueueError::Full),
            Err(TrySendError::Disconnected(_)) => Err(QueueError::Destroyed),
        }
    }

    /// `blocking = true` waits indefinitely for an item; `false` returns
    /// `QueueError::Empty` immediately if none is available.
    pub fn recv(&self, blocking: bool) -> Result<T, QueueError> {
        self.check_destroyed()?;
        if blocking {
            self.rx.recv().map_err(|_| QueueError::Destroyed)
        } else {
            match self.rx.try_recv() {
                Ok(item) => Ok(item),
                Err(crossbeam_channel::TryRecvError::Empty) => Err(QueueError::Empty),
                Err(crossbeam_channel::TryRecvError::Disconnected) => Err(QueueError::Destroyed),
            }
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<T, QueueError> {
        self.check_destroyed()?;
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Ok(item),
            Err(RecvTimeoutError::Timeout) => Err(QueueError::Empty),
            Err(RecvTimeoutError::Disconnected) => Err(QueueError::Destroyed),
        }
    }

    /// Pops everything currently buffered, calling `on_item` for each. Used
    /// by the share queue's `drain_all` and by path disable to flush a
    /// user/muxer outlet without a dedicated consumer callback.
    pub fn drain(&self, mut on_item: impl FnMut(T)) {
        while let Ok(item) = self.rx.try_recv() {
            on_item(item);
        }
    }

    /// Marks the queue destroyed and drains whatever is buffered, discarding
    /// it (§4.A `destroy`). Unlike [`BoundedQueue::drain`], no callback is
    /// required, and every `send`/`recv` after this returns `Destroyed`.
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        while self.rx.try_recv().is_ok() {}
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn sender(&self) -> Sender<T> {
        self.tx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_recv_round_trip() {
        let q: BoundedQueue<u32> = BoundedQueue::new(2);
        q.send(7).unwrap();
        assert_eq!(q.count(), 1);
        assert_eq!(q.recv(false).unwrap(), 7);
        assert_eq!(q.count(), 0);
    }

    #[test]
    fn try_send_reports_full() {
        let q: BoundedQueue<u32> = BoundedQueue::new(1);
        q.try_send(1).unwrap();
        match q.try_send(2) {
            Err(QueueError::Full) => {}
            other => panic!("expected Full, got {other:?}"),
        }
    }

    #[test]
    fn non_blocking_recv_reports_empty() {
        let q: BoundedQueue<u32> = BoundedQueue::new(1);
        match q.recv(false) {
            Err(QueueError::Empty) => {}
            other => panic!("expected Empty, got {other:?}"),
        }
    }

    #[test]
    fn drain_visits_every_buffered_item_in_order() {
        let q: BoundedQueue<u32> = BoundedQueue::new(4);
        q.send(1).unwrap();
        q.send(2).unwrap();
        q.send(3).unwrap();
        let mut seen = Vec::new();
        q.drain(|item| seen.push(item));
        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(q.count(), 0);
    }

    #[test]
    fn destroy_empties_the_queue_and_rejects_further_use() {
        let q: BoundedQueue<u32> = BoundedQueue::new(4);
        q.send(1).unwrap();
        q.send(2).unwrap();
        q.destroy();
        assert!(q.is_destroyed());
        assert_eq!(q.count(), 0);
        match q.send(3) {
            Err(QueueError::Destroyed) => {}
            other => panic!("expected Destroyed, got {other:?}"),
        }
        match q.recv(false) {
            Err(QueueError::Destroyed) => {}
            other => panic!("expected Destroyed, got {other:?}"),
        }
    }
}
