// crates/avcap-pipeline/src/path.rs
//
// §3/§4.F: a configured downstream pipeline. Owns its two share queues
// (audio, video — each with a "user" outlet and an optional "muxer"
// outlet), the muxer worker's plumbing, and the state flags the
// orchestrator's start/stop sequence flips.

use crate::queue::BoundedQueue;
use crate::ring::ByteRing;
use crate::share_queue::ShareQueue;
use avcap_core::error::{OrchestratorError, PathError};
use avcap_core::types::{Frame, MuxerConfig, OverlayConfig, PathHandle, RunType, SinkConfig, StreamKind};
use avcap_core::{CaptureStats, MuxerFactory, PathProcessor};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Outlet index conventions within a path's share queues (§4.F).
pub const OUTLET_USER: usize = 0;
pub const OUTLET_MUXER: usize = 1;

pub struct MuxerAttachment {
    pub config: MuxerConfig,
    pub factory: Arc<dyn MuxerFactory>,
}

pub struct Path {
    pub handle: PathHandle,
    pub sink: Mutex<SinkConfig>,
    pub run_type: Mutex<RunType>,
    pub enabled: AtomicBool,
    pub run_finished: AtomicBool,
    pub muxer_enabled: AtomicBool,
    pub muxer_started: AtomicBool,
    pub audio_path_disabled: AtomicBool,
    pub video_path_disabled: AtomicBool,

    pub audio_share: Mutex<Option<Arc<ShareQueue>>>,
    pub video_share: Mutex<Option<Arc<ShareQueue>>>,

    pub muxer: Mutex<Option<MuxerAttachment>>,
    pub muxer_input: Mutex<Option<Arc<BoundedQueue<Frame>>>>,
    pub muxer_output_ring: Mutex<Option<Arc<ByteRing>>>,
    pub muxer_stop: Arc<AtomicBool>,
    pub muxer_thread: Mutex<Option<JoinHandle<()>>>,

    pub overlay: Mutex<Option<OverlayConfig>>,
    pub stats: CaptureStats,

    /// Optional per-path processing stage (§4.F, §6). When set, raw frames
    /// bypass this path's share queue on the way in — the fetcher pushes
    /// into `raw_audio_in`/`raw_video_in` instead, and the processor's
    /// `frame_processed` callback is what ultimately calls `sq.add()`.
    pub processor: Mutex<Option<Box<dyn PathProcessor>>>,
    pub raw_audio_in: Mutex<Option<Arc<BoundedQueue<Frame>>>>,
    pub raw_video_in: Mutex<Option<Arc<BoundedQueue<Frame>>>>,
}

impl Path {
    pub fn new(handle: PathHandle, sink: SinkConfig) -> Self {
        Self {
            handle,
            sink: Mutex::new(sink),
            run_type: Mutex::new(RunType::Continuous),
            enabled: AtomicBool::new(false),
            run_finished: AtomicBool::new(false),
            muxer_enabled: AtomicBool::new(false),
            muxer_started: AtomicBool::new(false),
            audio_path_disabled: AtomicBool::new(false),
            video_path_disabled: AtomicBool::new(false),
            audio_share: Mutex::new(None),
            video_share: Mutex::new(None),
            muxer: Mutex::new(None),
            muxer_input: Mutex::new(None),
            muxer_output_ring: Mutex::new(None),
            muxer_stop: Arc::new(AtomicBool::new(false)),
            muxer_thread: Mutex::new(None),
            overlay: Mutex::new(None),
            stats: CaptureStats::new(),
            processor: Mutex::new(None),
            raw_audio_in: Mutex::new(None),
            raw_video_in: Mutex::new(None),
        }
    }

    pub fn has_processor(&self) -> bool {
        self.processor.lock().unwrap().is_some()
    }

    pub fn set_processor(&self, processor: Box<dyn PathProcessor>) {
        *self.processor.lock().unwrap() = Some(processor);
    }

    /// Installs the raw, pre-processor input queue for `stream`, created by
    /// the orchestrator when a processor is attached to this path.
    pub fn set_raw_queue(&self, stream: StreamKind, queue: Arc<BoundedQueue<Frame>>) {
        match stream {
            StreamKind::Audio => *self.raw_audio_in.lock().unwrap() = Some(queue),
            StreamKind::Video => *self.raw_video_in.lock().unwrap() = Some(queue),
            StreamKind::MuxerOutput | StreamKind::Control => {}
        }
    }

    pub fn raw_queue_for(&self, stream: StreamKind) -> Option<Arc<BoundedQueue<Frame>>> {
        match stream {
            StreamKind::Audio => self.raw_audio_in.lock().unwrap().clone(),
            StreamKind::Video => self.raw_video_in.lock().unwrap().clone(),
            StreamKind::MuxerOutput | StreamKind::Control => None,
        }
    }

    /// The audio frame size (in samples) this path's processor wants, if any
    /// (§4.E step 2 — the fetcher takes the minimum across active paths).
    pub fn processor_frame_ms(&self, sample_rate: u32) -> Option<u32> {
        let processor = self.processor.lock().unwrap();
        let samples = processor.as_ref()?.get_audio_frame_samples(self.handle)?;
        if sample_rate == 0 {
            return None;
        }
        Some(((samples as u64 * 1000) / sample_rate as u64) as u32)
    }

    pub fn wants(&self, stream: StreamKind) -> bool {
        let sink = self.sink.lock().unwrap();
        sink.wants(stream) && !self.stream_disabled(stream)
    }

    pub fn stream_disabled(&self, stream: StreamKind) -> bool {
        match stream {
            StreamKind::Audio => self.audio_path_disabled.load(Ordering::SeqCst),
            StreamKind::Video => self.video_path_disabled.load(Ordering::SeqCst),
            StreamKind::MuxerOutput | StreamKind::Control => false,
        }
    }

    /// A path is active for a stream when enabled, wanting that stream, and
    /// (for run-once paths) not yet finished — the `has_active_path`
    /// predicate fetchers consult each iteration (§4.E, §4.H).
    pub fn is_active(&self, stream: StreamKind, check_finished: bool) -> bool {
        if !self.enabled.load(Ordering::SeqCst) {
            return false;
        }
        if check_finished && *self.run_type.lock().unwrap() == RunType::RunOnce && self.run_finished.load(Ordering::SeqCst) {
            return false;
        }
        self.wants(stream)
    }

    pub fn set_muxer(&self, attachment: MuxerAttachment) -> Result<(), PathError> {
        if self.enabled.load(Ordering::SeqCst) {
            return Err(PathError::AlreadyStarted);
        }
        let mut slot = self.muxer.lock().unwrap();
        if slot.is_some() {
            return Err(PathError::MuxerAlreadyEnabled);
        }
        *slot = Some(attachment);
        Ok(())
    }

    pub fn has_muxer(&self) -> bool {
        self.muxer.lock().unwrap().is_some()
    }

    pub fn outlet_count_for(&self) -> usize {
        if self.has_muxer() {
            2
        } else {
            1
        }
    }

    pub fn share_queue_for(&self, stream: StreamKind) -> Option<Arc<ShareQueue>> {
        match stream {
            StreamKind::Audio => self.audio_share.lock().unwrap().clone(),
            StreamKind::Video => self.video_share.lock().unwrap().clone(),
            StreamKind::MuxerOutput | StreamKind::Control => None,
        }
    }

    pub fn set_share_queue(&self, stream: StreamKind, sq: Arc<ShareQueue>) {
        match stream {
            StreamKind::Audio => *self.audio_share.lock().unwrap() = Some(sq),
            StreamKind::Video => *self.video_share.lock().unwrap() = Some(sq),
            StreamKind::MuxerOutput | StreamKind::Control => {}
        }
    }

    /// Caller-facing acquire (§4.F). For `StreamKind::MuxerOutput`, reads
    /// from the muxer's byte ring instead of a share-queue outlet.
    pub fn acquire(&self, stream: StreamKind, blocking: bool) -> Result<Frame, OrchestratorError> {
        match stream {
            StreamKind::MuxerOutput => Err(OrchestratorError::InvalidArg(
                "muxer-output frames are read via acquire_muxer_bytes, not acquire_path_frame".into(),
            )),
            _ => {
                let sq = self.share_queue_for(stream).ok_or(PathError::StreamNotConfigured(stream))?;
                Ok(sq.recv_from_outlet(OUTLET_USER, blocking)?)
            }
        }
    }

    pub fn release(&self, stream: StreamKind, frame: &Frame) -> Result<(), OrchestratorError> {
        let sq = self.share_queue_for(stream).ok_or(PathError::StreamNotConfigured(stream))?;
        sq.release(frame)?;
        if *self.run_type.lock().unwrap() == RunType::RunOnce {
            self.run_finished.store(true, Ordering::SeqCst);
        }
        Ok(())
    }
}
