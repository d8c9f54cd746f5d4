// crates/avcap-pipeline/src/muxer_worker.rs
//
// §4.G: one thread per muxed path, draining the path's muxer outlet(s) and
// feeding a concrete `Muxer` implementation. The "muxer outlet" is simply
// outlet 1 of the path's audio and/or video share queues — no separate
// queue is interposed, so release still flows back through the same
// refcounted slot every other outlet uses.

use crate::path::Path;
use crate::ring::ByteRing;
use crate::share_queue::ShareQueue;
use avcap_core::types::StreamKind;
use avcap_core::{CaptureEvent, Muxer};
use crossbeam_channel::Sender;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// How often (in packets written) the worker reports progress over the
/// event channel (§4.G, §10.5) — modeled on the teacher's periodic encode
/// progress cadence rather than reporting every single packet.
const PROGRESS_INTERVAL_PACKETS: u64 = 30;

pub struct MuxerWorkerCtx {
    pub path: Arc<Path>,
    pub muxer: Arc<Mutex<Box<dyn Muxer>>>,
    pub audio_stream_idx: Option<usize>,
    pub video_stream_idx: Option<usize>,
    pub audio_share: Option<Arc<ShareQueue>>,
    pub video_share: Option<Arc<ShareQueue>>,
    pub output_ring: Option<Arc<ByteRing>>,
    pub stop: Arc<AtomicBool>,
    pub events: Sender<CaptureEvent>,
}

/// Runs until `stop` is set, polling whichever of the audio/video muxer
/// outlets this path has. Every frame received is released back through
/// its share queue exactly once, whether or not muxing it succeeded.
pub fn run(ctx: MuxerWorkerCtx) {
    debug!("muxer worker started");
    let audio_queue = ctx.audio_share.as_ref().and_then(|sq| sq.outlet_queue(crate::path::OUTLET_MUXER).ok());
    let video_queue = ctx.video_share.as_ref().and_then(|sq| sq.outlet_queue(crate::path::OUTLET_MUXER).ok());

    let mut packets_written: u64 = 0;
    let mut bytes_written: u64 = 0;

    loop {
        if ctx.stop.load(Ordering::SeqCst) {
            break;
        }
        let mut handled_any = false;

        if let Some(q) = &audio_queue {
            if let Ok(frame) = q.recv_timeout(POLL_INTERVAL) {
                handled_any = true;
                if write_and_release(&ctx, StreamKind::Audio, frame, ctx.audio_share.as_ref()) {
                    packets_written += 1;
                }
            }
        }
        if let Some(q) = &video_queue {
            if let Ok(frame) = q.recv_timeout(Duration::from_millis(1)) {
                handled_any = true;
                if write_and_release(&ctx, StreamKind::Video, frame, ctx.video_share.as_ref()) {
                    packets_written += 1;
                }
            }
        }
        if let Some(ring) = &ctx.output_ring {
            if handled_any {
                let n = drain_muxer_bytes(&ctx.muxer, ring);
                if n > 0 {
                    bytes_written += n as u64;
                    ctx.path.stats.add_bytes_muxed(n as u64);
                }
            }
        }
        if handled_any && packets_written % PROGRESS_INTERVAL_PACKETS == 0 {
            let _ = ctx.events.try_send(CaptureEvent::MuxerProgress {
                path: ctx.path.handle,
                packets_written,
                bytes_written,
            });
        }
        if !handled_any {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
    debug!("muxer worker exiting");
}

/// Writes one frame to the muxer and releases it back through its share
/// queue, returning whether the write succeeded.
fn write_and_release(ctx: &MuxerWorkerCtx, stream: StreamKind, frame: avcap_core::types::Frame, share: Option<&Arc<ShareQueue>>) -> bool {
    let idx = match stream {
        StreamKind::Audio => ctx.audio_stream_idx,
        StreamKind::Video => ctx.video_stream_idx,
        _ => None,
    };
    let mut ok = true;
    if let Some(idx) = idx {
        let result = {
            let mut m = ctx.muxer.lock().unwrap();
            m.write_packet(idx, &frame)
        };
        if let Err(e) = result {
            ok = false;
            warn!(error = %e, "muxer failed to write packet");
            let _ = ctx.events.try_send(CaptureEvent::MuxerError { path: ctx.path.handle, message: e.to_string() });
        }
    }
    if let Some(sq) = share {
        let _ = sq.release(&frame);
    }
    ok
}

/// Drains any streaming container bytes the muxer has produced into the
/// path's muxer-output ring, each record prefixed with a 4-byte PTS (§4.B).
/// Returns the number of payload bytes (excluding PTS prefixes) written.
fn drain_muxer_bytes(muxer: &Arc<Mutex<Box<dyn Muxer>>>, ring: &ByteRing) -> usize {
    let mut chunks: Vec<(Vec<u8>, u32)> = Vec::new();
    {
        let mut m = muxer.lock().unwrap();
        let _ = m.drain_into(&mut |bytes, pts| chunks.push((bytes.to_vec(), pts)));
    }
    let mut written = 0usize;
    for (bytes, pts) in chunks {
        let total = 4 + bytes.len();
        let ptr = match unsafe { ring.reserve(total) } {
            Ok(ptr) => ptr,
            Err(_) => continue,
        };
        unsafe {
            std::ptr::copy_nonoverlapping(pts.to_be_bytes().as_ptr(), ptr, 4);
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.add(4), bytes.len());
        }
        let _ = ring.commit(total);
        written += bytes.len();
    }
    written
}

/// Enforces the §4.G ordering rule: the muxer worker must be fully stopped
/// before its share-queue outlet is torn down. The caller disables outlet 1
/// only after this returns.
pub fn stop_and_join(stop: &AtomicBool, thread: std::thread::JoinHandle<()>) {
    stop.store(true, Ordering::SeqCst);
    let _ = thread.join();
}

