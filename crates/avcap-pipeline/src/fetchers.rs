// crates/avcap-pipeline/src/fetchers.rs
//
// §4.E: the two source worker loops. Each owns its source driver
// exclusively — "source drivers are single-threaded from the
// orchestrator's viewpoint" (§5) — and hands every produced frame to every
// currently active path's share queue, coordinating the underlying
// buffer's single release through `CrossPathFanout`.

use crate::clock::{SyncClock, SyncMode};
use crate::eventset::{EventSet, AUDIO_FETCHER_EXITED, VIDEO_FETCHER_EXITED};
use crate::fanout::CrossPathFanout;
use crate::path::Path;
use crate::ring::ByteRing;
use avcap_core::types::{Frame, SourceBuffer, StreamKind};
use avcap_core::{AudioSource, CaptureEvent, VideoSource};
use crossbeam_channel::Sender;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::sleep;
use std::time::Duration;
use tracing::{debug, warn};

const IDLE_SLEEP: Duration = Duration::from_millis(5);
pub const DEFAULT_FRAME_MS: u32 = 20;

/// Hands a freshly produced frame to one active path, routing around the
/// path's share queue when a processor is attached (§4.F: the processor, not
/// the fetcher, is the one consumer of the raw handle). Reports
/// [`CaptureEvent::PathOverloaded`] whenever the frame has to be dropped.
fn deliver_frame(path: &Arc<Path>, stream: StreamKind, frame: Frame, fanout: &CrossPathFanout, event_tx: &Sender<CaptureEvent>) {
    path.stats.inc_produced();

    if path.has_processor() {
        let Some(raw) = path.raw_queue_for(stream) else {
            fanout.release(frame);
            return;
        };
        if raw.try_send(frame).is_err() {
            fanout.release(frame);
            path.stats.inc_dropped();
            let dropped = path.stats.snapshot().frames_dropped;
            let _ = event_tx.try_send(CaptureEvent::PathOverloaded { path: path.handle, dropped });
        }
        return;
    }

    if let Some(sq) = path.share_queue_for(stream) {
        if sq.add(frame).is_err() {
            path.stats.inc_dropped();
            let dropped = path.stats.snapshot().frames_dropped;
            let _ = event_tx.try_send(CaptureEvent::PathOverloaded { path: path.handle, dropped });
        }
    }
}

pub struct AudioFetcherCtx {
    pub source: Arc<Mutex<Box<dyn AudioSource>>>,
    pub ring: Arc<ByteRing>,
    pub clock: Arc<SyncClock>,
    pub fanout: Arc<CrossPathFanout>,
    pub events: Arc<EventSet>,
    pub fetching: Arc<AtomicBool>,
    pub audio_frames: Arc<AtomicU64>,
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    /// Smallest frame size any active path's processor requested, in
    /// milliseconds; `None` uses the 20ms default (§4.E step 2). Recomputed
    /// from `active_paths` every iteration.
    pub frame_ms_override: Arc<Mutex<Option<u32>>>,
    pub active_paths: Arc<dyn Fn() -> Vec<Arc<Path>> + Send + Sync>,
    pub event_tx: Sender<CaptureEvent>,
}

pub fn run_audio_fetcher(ctx: AudioFetcherCtx) {
    debug!("audio fetcher started");
    while ctx.fetching.load(Ordering::SeqCst) {
        let active = (ctx.active_paths)();
        if active.is_empty() {
            sleep(IDLE_SLEEP);
            continue;
        }

        let min_override = active.iter().filter_map(|p| p.processor_frame_ms(ctx.sample_rate)).min();
        *ctx.frame_ms_override.lock().unwrap() = min_override;
        let frame_ms = min_override.unwrap_or(DEFAULT_FRAME_MS);
        let samples_per_frame = ((ctx.sample_rate as u64 * frame_ms as u64) / 1000).max(1) as u32;
        let bytes_per_frame = samples_per_frame * ctx.channels as u32 * (ctx.bits_per_sample as u32 / 8);
        let bytes_per_frame = bytes_per_frame.max(1) as usize;

        let ptr = match unsafe { ctx.ring.reserve(bytes_per_frame) } {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "audio ring reservation failed, stopping fetcher");
                break;
            }
        };
        let buf = unsafe { std::slice::from_raw_parts_mut(ptr, bytes_per_frame) };
        let read_result = ctx.source.lock().unwrap().read(buf);
        if let Err(e) = read_result {
            warn!(error = %e, "audio source read failed, audio fetcher exiting");
            let _ = ctx.event_tx.try_send(CaptureEvent::SourceError { message: e.to_string() });
            let _ = ctx.ring.commit(0);
            break;
        }
        if ctx.ring.commit(bytes_per_frame).is_err() {
            break;
        }

        let frame_index = ctx.audio_frames.fetch_add(1, Ordering::SeqCst);
        let raw_pts = ((frame_index * samples_per_frame as u64 * 1000) / ctx.sample_rate as u64) as u32;
        let pts = if ctx.clock.mode() == SyncMode::AudioMaster {
            ctx.clock.update_audio(raw_pts);
            raw_pts
        } else {
            ctx.clock.reconcile(raw_pts)
        };

        let buffer = SourceBuffer::from_slice(unsafe { std::slice::from_raw_parts(ptr, bytes_per_frame) });
        let frame = Frame { stream: StreamKind::Audio, pts_ms: pts, buffer, token: None };

        let ring = ctx.ring.clone();
        ctx.fanout.begin(&frame, active.len(), move || ring.release_record());

        for path in &active {
            deliver_frame(path, StreamKind::Audio, frame, &ctx.fanout, &ctx.event_tx);
        }
    }
    ctx.events.set(AUDIO_FETCHER_EXITED);
    debug!("audio fetcher exited");
}

pub struct VideoFetcherCtx {
    pub source: Arc<Mutex<Box<dyn VideoSource>>>,
    pub clock: Arc<SyncClock>,
    pub fanout: Arc<CrossPathFanout>,
    pub events: Arc<EventSet>,
    pub fetching: Arc<AtomicBool>,
    pub video_frames: Arc<AtomicU64>,
    pub fps: u32,
    pub active_paths: Arc<dyn Fn() -> Vec<Arc<Path>> + Send + Sync>,
    pub event_tx: Sender<CaptureEvent>,
}

pub fn run_video_fetcher(ctx: VideoFetcherCtx) {
    debug!("video fetcher started");
    while ctx.fetching.load(Ordering::SeqCst) {
        let active = (ctx.active_paths)();
        if active.is_empty() {
            sleep(IDLE_SLEEP);
            continue;
        }

        let (buffer, is_encoded) = {
            let mut src = ctx.source.lock().unwrap();
            match src.acquire() {
                Ok(buf) => (buf, src.is_encoded()),
                Err(e) => {
                    warn!(error = %e, "video source acquire failed, video fetcher exiting");
                    let _ = ctx.event_tx.try_send(CaptureEvent::SourceError { message: e.to_string() });
                    break;
                }
            }
        };

        let frame_index = ctx.video_frames.fetch_add(1, Ordering::SeqCst);
        let mut pts = ((frame_index * 1000) / ctx.fps as u64) as u32;

        if ctx.clock.mode() == SyncMode::SystemMaster && is_encoded {
            if let Ok(clock_now) = ctx.clock.current() {
                if pts as i64 > clock_now {
                    let mut src = ctx.source.lock().unwrap();
                    let _ = src.release(buffer);
                    continue;
                }
                if (pts as i64) + 100 < clock_now {
                    pts = clock_now.max(0) as u32;
                }
            }
        } else if ctx.clock.mode() != SyncMode::AudioMaster {
            pts = ctx.clock.reconcile(pts);
        }

        let frame = Frame { stream: StreamKind::Video, pts_ms: pts, buffer, token: None };

        let source = ctx.source.clone();
        ctx.fanout.begin(&frame, active.len(), move || {
            let _ = source.lock().unwrap().release(buffer);
        });

        for path in &active {
            deliver_frame(path, StreamKind::Video, frame, &ctx.fanout, &ctx.event_tx);
        }
    }
    ctx.events.set(VIDEO_FETCHER_EXITED);
    debug!("video fetcher exited");
}
