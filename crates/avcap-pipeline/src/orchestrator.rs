// crates/avcap-pipeline/src/orchestrator.rs
//
// §4.H: the public API surface. Owns the two source drivers, the sync
// clock, every configured path, and drives the open/start/stop/close
// lifecycle — including the reverse-order quiesce sequence in `stop`.

use crate::clock::{SyncClock, SyncMode};
use crate::eventset::{EventSet, AUDIO_FETCHER_EXITED, VIDEO_FETCHER_EXITED};
use crate::fanout::CrossPathFanout;
use crate::fetchers::{self, AudioFetcherCtx, VideoFetcherCtx};
use crate::muxer_worker::{self, MuxerWorkerCtx};
use crate::path::{MuxerAttachment, Path, OUTLET_MUXER, OUTLET_USER};
use crate::queue::BoundedQueue;
use crate::ring::ByteRing;
use crate::share_queue::ShareQueue;
use avcap_core::error::{OrchestratorError, PathError};
use avcap_core::types::{
    AudioInfo, Frame, MuxerConfig, MuxerOutputMode, OverlayConfig, PathHandle, RunType, SinkConfig, SourceBuffer,
    StreamKind, VideoInfo,
};
use avcap_core::{AudioSource, CaptureEvent, Muxer, MuxerFactory, PathProcessor, PathProcessorCallbacks, VideoSource};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{info, warn};

const STOP_QUIESCE_TIMEOUT: Duration = Duration::from_secs(1);
const AUDIO_SOURCE_RING_BYTES: usize = 10 * 1024;
const SHARE_QUEUE_DEPTH: usize = 5;
const MUXER_OUTPUT_RING_BYTES: usize = 64 * 1024;

pub struct OpenConfig {
    pub audio_source: Box<dyn AudioSource>,
    pub video_source: Box<dyn VideoSource>,
    pub sync_mode: SyncMode,
}

pub struct Orchestrator {
    audio_source: Arc<Mutex<Box<dyn AudioSource>>>,
    video_source: Arc<Mutex<Box<dyn VideoSource>>>,
    clock: Arc<SyncClock>,
    paths: Mutex<Vec<Arc<Path>>>,
    next_path_id: AtomicU32,

    audio_ring: Arc<ByteRing>,
    audio_info: Mutex<Option<AudioInfo>>,
    video_info: Mutex<Option<VideoInfo>>,
    audio_frames: Arc<AtomicU64>,
    video_frames: Arc<AtomicU64>,
    frame_ms_override: Arc<Mutex<Option<u32>>>,

    fanout_audio: Arc<CrossPathFanout>,
    fanout_video: Arc<CrossPathFanout>,
    events: Arc<EventSet>,

    started: AtomicBool,
    closed: AtomicBool,
    audio_fetching: Arc<AtomicBool>,
    video_fetching: Arc<AtomicBool>,
    audio_fetcher_thread: Mutex<Option<JoinHandle<()>>>,
    video_fetcher_thread: Mutex<Option<JoinHandle<()>>>,

    api_mutex: Mutex<()>,

    event_tx: Sender<CaptureEvent>,
    event_rx: Receiver<CaptureEvent>,
}

impl Orchestrator {
    /// §4.H `open`. Failures cascade to closing whichever source already
    /// opened successfully before returning, per §7.
    pub fn open(mut config: OpenConfig) -> Result<Self, OrchestratorError> {
        if let Err(e) = config.audio_source.open() {
            return Err(OrchestratorError::SourceError(e.to_string()));
        }
        if let Err(e) = config.video_source.open() {
            let _ = config.audio_source.close();
            return Err(OrchestratorError::SourceError(e.to_string()));
        }

        let (event_tx, event_rx) = unbounded();
        Ok(Self {
            audio_source: Arc::new(Mutex::new(config.audio_source)),
            video_source: Arc::new(Mutex::new(config.video_source)),
            clock: Arc::new(SyncClock::new(config.sync_mode)),
            paths: Mutex::new(Vec::new()),
            next_path_id: AtomicU32::new(0),
            audio_ring: Arc::new(ByteRing::new(AUDIO_SOURCE_RING_BYTES)),
            audio_info: Mutex::new(None),
            video_info: Mutex::new(None),
            audio_frames: Arc::new(AtomicU64::new(0)),
            video_frames: Arc::new(AtomicU64::new(0)),
            frame_ms_override: Arc::new(Mutex::new(None)),
            fanout_audio: Arc::new(CrossPathFanout::new()),
            fanout_video: Arc::new(CrossPathFanout::new()),
            events: Arc::new(EventSet::new()),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            audio_fetching: Arc::new(AtomicBool::new(false)),
            video_fetching: Arc::new(AtomicBool::new(false)),
            audio_fetcher_thread: Mutex::new(None),
            video_fetcher_thread: Mutex::new(None),
            api_mutex: Mutex::new(()),
            event_tx,
            event_rx,
        })
    }

    pub fn events(&self) -> &Receiver<CaptureEvent> {
        &self.event_rx
    }

    fn find_path(&self, handle: PathHandle) -> Result<Arc<Path>, OrchestratorError> {
        self.paths
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.handle == handle)
            .cloned()
            .ok_or(OrchestratorError::UnknownPath(handle.0))
    }

    /// §4.H `setup_path`: negotiates the sink's desired formats against the
    /// (single, shared) source drivers and records a new path.
    pub fn setup_path(&self, sink: SinkConfig) -> Result<PathHandle, OrchestratorError> {
        let _api = self.api_mutex.lock().unwrap();
        if self.started.load(Ordering::SeqCst) {
            return Err(OrchestratorError::AlreadyStarted);
        }

        let mut resolved = sink;
        if let Some(desired) = sink.audio {
            let negotiated = self
                .audio_source
                .lock()
                .unwrap()
                .negotiate(&desired)
                .map_err(|e| OrchestratorError::NegotiationFailed(e.to_string()))?;
            let mut cached = self.audio_info.lock().unwrap();
            match *cached {
                Some(existing) if existing != negotiated => {
                    return Err(OrchestratorError::NegotiationFailed(
                        "audio source format already pinned by an earlier path".into(),
                    ));
                }
                _ => *cached = Some(negotiated),
            }
            resolved.audio = Some(negotiated);
        }
        if let Some(desired) = sink.video {
            let negotiated = self
                .video_source
                .lock()
                .unwrap()
                .negotiate(&desired)
                .map_err(|e| OrchestratorError::NegotiationFailed(e.to_string()))?;
            let mut cached = self.video_info.lock().unwrap();
            match *cached {
                Some(existing) if existing != negotiated => {
                    return Err(OrchestratorError::NegotiationFailed(
                        "video source format already pinned by an earlier path".into(),
                    ));
                }
                _ => *cached = Some(negotiated),
            }
            resolved.video = Some(negotiated);
        }

        let handle = PathHandle(self.next_path_id.fetch_add(1, Ordering::SeqCst));
        self.paths.lock().unwrap().push(Arc::new(Path::new(handle, resolved)));
        Ok(handle)
    }

    pub fn add_muxer_to_path(&self, handle: PathHandle, config: MuxerConfig, factory: Arc<dyn MuxerFactory>) -> Result<(), OrchestratorError> {
        let _api = self.api_mutex.lock().unwrap();
        let path = self.find_path(handle)?;
        path.set_muxer(MuxerAttachment { config, factory })?;
        Ok(())
    }

    pub fn add_overlay_to_path(&self, handle: PathHandle, overlay: OverlayConfig) -> Result<(), OrchestratorError> {
        let _api = self.api_mutex.lock().unwrap();
        let path = self.find_path(handle)?;
        *path.overlay.lock().unwrap() = Some(overlay);
        Ok(())
    }

    /// Attaches a [`PathProcessor`] to a path (§4.F, §6). Must be called
    /// before `start()`. Builds the raw per-stream queues a fetcher routes
    /// through once a processor is present (bypassing the path's share
    /// queue on the way in, per §4.F) and the callback closures the
    /// processor uses to pull/push frames and negotiate formats. The
    /// closures are built here rather than inside `Path` so they can reach
    /// the orchestrator's shared source drivers and cross-path fanouts
    /// without `Path` holding a back-reference to the orchestrator (§9).
    pub fn add_path_processor(&self, handle: PathHandle, mut processor: Box<dyn PathProcessor>) -> Result<(), OrchestratorError> {
        let _api = self.api_mutex.lock().unwrap();
        if self.started.load(Ordering::SeqCst) {
            return Err(OrchestratorError::AlreadyStarted);
        }
        let path = self.find_path(handle)?;
        let sink = *path.sink.lock().unwrap();

        if sink.audio.is_some() {
            path.set_raw_queue(StreamKind::Audio, Arc::new(BoundedQueue::new(SHARE_QUEUE_DEPTH)));
        }
        if sink.video.is_some() {
            path.set_raw_queue(StreamKind::Video, Arc::new(BoundedQueue::new(SHARE_QUEUE_DEPTH)));
        }

        let acquire_path = path.clone();
        let acquire_src_frame: Box<dyn Fn(StreamKind) -> Result<Frame, OrchestratorError> + Send> = Box::new(move |stream| {
            let q = acquire_path.raw_queue_for(stream).ok_or(PathError::StreamNotConfigured(stream))?;
            Ok(q.recv(true)?)
        });

        let fanout_audio = self.fanout_audio.clone();
        let fanout_video = self.fanout_video.clone();
        let release_src_frame: Box<dyn Fn(StreamKind, &Frame) -> Result<(), OrchestratorError> + Send> = Box::new(move |stream, frame| {
            match stream {
                StreamKind::Audio => fanout_audio.release(*frame),
                StreamKind::Video => fanout_video.release(*frame),
                StreamKind::MuxerOutput | StreamKind::Control => {}
            }
            Ok(())
        });

        let audio_source = self.audio_source.clone();
        let nego_audio: Box<dyn Fn(&AudioInfo) -> Result<AudioInfo, OrchestratorError> + Send> = Box::new(move |desired| {
            audio_source.lock().unwrap().negotiate(desired).map_err(|e| OrchestratorError::NegotiationFailed(e.to_string()))
        });

        let video_source = self.video_source.clone();
        let nego_video: Box<dyn Fn(&VideoInfo) -> Result<VideoInfo, OrchestratorError> + Send> = Box::new(move |desired| {
            video_source.lock().unwrap().negotiate(desired).map_err(|e| OrchestratorError::NegotiationFailed(e.to_string()))
        });

        let processed_path = path.clone();
        let frame_processed: Box<dyn Fn(StreamKind, Frame) + Send> = Box::new(move |stream, frame| {
            if let Some(sq) = processed_path.share_queue_for(stream) {
                let _ = sq.add(frame);
            }
        });

        let event_path = path.clone();
        let event_tx = self.event_tx.clone();
        let event: Box<dyn Fn(StreamKind, &str) + Send> = Box::new(move |stream, kind| {
            if kind.contains("error") {
                match stream {
                    StreamKind::Audio => event_path.audio_path_disabled.store(true, Ordering::SeqCst),
                    StreamKind::Video => event_path.video_path_disabled.store(true, Ordering::SeqCst),
                    StreamKind::MuxerOutput | StreamKind::Control => {}
                }
            }
            let _ = event_tx.try_send(CaptureEvent::SourceError { message: format!("path processor reported '{kind}' on {stream:?}") });
        });

        processor.open(PathProcessorCallbacks { acquire_src_frame, release_src_frame, nego_audio, nego_video, frame_processed, event })?;
        if sink.audio.is_some() {
            processor.add_path(StreamKind::Audio, &sink)?;
        }
        if sink.video.is_some() {
            processor.add_path(StreamKind::Video, &sink)?;
        }

        path.set_processor(processor);
        Ok(())
    }

    pub fn set_path_bitrate(&self, handle: PathHandle, bitrate: u32) -> Result<(), OrchestratorError> {
        let _api = self.api_mutex.lock().unwrap();
        let path = self.find_path(handle)?;
        let mut sink = path.sink.lock().unwrap();
        match sink.video.as_mut() {
            Some(v) => {
                v.bitrate = bitrate;
                Ok(())
            }
            None => Err(PathError::StreamNotConfigured(StreamKind::Video).into()),
        }
    }

    /// Creates this path's share queues for whichever streams its sink
    /// wants, if not already present. Idempotent.
    fn materialize_path(&self, path: &Arc<Path>) {
        let outlet_count = path.outlet_count_for();
        let sink = *path.sink.lock().unwrap();
        if sink.audio.is_some() && path.share_queue_for(StreamKind::Audio).is_none() {
            let release_path = path.clone();
            let fanout = self.fanout_audio.clone();
            let sq = Arc::new(ShareQueue::new_internal(
                outlet_count,
                SHARE_QUEUE_DEPTH,
                SHARE_QUEUE_DEPTH,
                Arc::new(move |frame: Frame| {
                    release_path.stats.inc_delivered();
                    fanout.release(frame);
                }),
            ));
            path.set_share_queue(StreamKind::Audio, sq);
        }
        if sink.video.is_some() && path.share_queue_for(StreamKind::Video).is_none() {
            let release_path = path.clone();
            let fanout = self.fanout_video.clone();
            let sq = Arc::new(ShareQueue::new_internal(
                outlet_count,
                SHARE_QUEUE_DEPTH,
                SHARE_QUEUE_DEPTH,
                Arc::new(move |frame: Frame| {
                    release_path.stats.inc_delivered();
                    fanout.release(frame);
                }),
            ));
            path.set_share_queue(StreamKind::Video, sq);
        }
        if path.enabled.load(Ordering::SeqCst) {
            if let Some(sq) = path.share_queue_for(StreamKind::Audio) {
                let _ = sq.enable(OUTLET_USER, true);
            }
            if let Some(sq) = path.share_queue_for(StreamKind::Video) {
                let _ = sq.enable(OUTLET_USER, true);
            }
        }
    }

    /// §4.H `enable_path`. `on = false` runs the full §4.F disable sequence.
    pub fn enable_path(&self, handle: PathHandle, on: bool, run_type: RunType) -> Result<(), OrchestratorError> {
        let _api = self.api_mutex.lock().unwrap();
        let path = self.find_path(handle)?;
        if on {
            *path.run_type.lock().unwrap() = run_type;
            path.run_finished.store(false, Ordering::SeqCst);
            path.enabled.store(true, Ordering::SeqCst);
            if self.started.load(Ordering::SeqCst) {
                self.materialize_path(&path);
                let _ = self.event_tx.try_send(CaptureEvent::PathStarted { path: handle });
            }
        } else {
            path.enabled.store(false, Ordering::SeqCst);
            for stream in [StreamKind::Audio, StreamKind::Video] {
                if let Some(sq) = path.share_queue_for(stream) {
                    let _ = sq.enable(OUTLET_USER, false);
                    sq.drain_all();
                }
            }
            self.maybe_reset_stream_accounting();
        }
        Ok(())
    }

    /// §4.H `enable_muxer`. Starts or stops the muxer worker live if the
    /// orchestrator is already running (scenario 6).
    pub fn enable_muxer(&self, handle: PathHandle, on: bool) -> Result<(), OrchestratorError> {
        let _api = self.api_mutex.lock().unwrap();
        let path = self.find_path(handle)?;
        if path.muxer_enabled.load(Ordering::SeqCst) == on {
            return Ok(());
        }
        path.muxer_enabled.store(on, Ordering::SeqCst);
        if !self.started.load(Ordering::SeqCst) {
            return Ok(());
        }
        if on {
            self.start_muxer_worker(&path)
        } else {
            self.stop_muxer_worker(&path);
            Ok(())
        }
    }

    fn start_muxer_worker(&self, path: &Arc<Path>) -> Result<(), OrchestratorError> {
        if path.muxer_started.load(Ordering::SeqCst) {
            return Ok(());
        }
        let (base, factory) = {
            let guard = path.muxer.lock().unwrap();
            let attachment = guard.as_ref().ok_or(PathError::NoMuxerAttached)?;
            (attachment.config.base.clone(), attachment.factory.clone())
        };
        let mut muxer = factory.open(&base).map_err(OrchestratorError::Muxer)?;
        let sink = *path.sink.lock().unwrap();
        let audio_idx = match sink.audio {
            Some(info) => Some(muxer.add_audio_stream(&info).map_err(OrchestratorError::Muxer)?),
            None => None,
        };
        let video_idx = match sink.video {
            Some(info) => Some(muxer.add_video_stream(&info).map_err(OrchestratorError::Muxer)?),
            None => None,
        };

        let output_ring = if matches!(base.output_mode, MuxerOutputMode::Streaming) {
            let ring = Arc::new(ByteRing::new(MUXER_OUTPUT_RING_BYTES));
            *path.muxer_output_ring.lock().unwrap() = Some(ring.clone());
            Some(ring)
        } else {
            None
        };

        let audio_share = path.share_queue_for(StreamKind::Audio);
        let video_share = path.share_queue_for(StreamKind::Video);
        if let Some(sq) = &audio_share {
            let _ = sq.enable(OUTLET_MUXER, audio_idx.is_some());
        }
        if let Some(sq) = &video_share {
            let _ = sq.enable(OUTLET_MUXER, video_idx.is_some());
        }

        let stop = path.muxer_stop.clone();
        stop.store(false, Ordering::SeqCst);
        let ctx = MuxerWorkerCtx {
            path: path.clone(),
            muxer: Arc::new(Mutex::new(muxer)),
            audio_stream_idx: audio_idx,
            video_stream_idx: video_idx,
            audio_share,
            video_share,
            output_ring,
            stop: stop.clone(),
            events: self.event_tx.clone(),
        };
        let handle = std::thread::Builder::new()
            .name("avcap-muxer".into())
            .spawn(move || muxer_worker::run(ctx))
            .expect("failed to spawn muxer worker thread");
        *path.muxer_thread.lock().unwrap() = Some(handle);
        path.muxer_started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop_muxer_worker(&self, path: &Arc<Path>) {
        if !path.muxer_started.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = path.muxer_thread.lock().unwrap().take() {
            muxer_worker::stop_and_join(&path.muxer_stop, handle);
        }
        if let Some(sq) = path.share_queue_for(StreamKind::Audio) {
            let _ = sq.enable(OUTLET_MUXER, false);
        }
        if let Some(sq) = path.share_queue_for(StreamKind::Video) {
            let _ = sq.enable(OUTLET_MUXER, false);
        }
        *path.muxer_output_ring.lock().unwrap() = None;
    }

    /// §4.H `start`: materialize every configured path's queues, then start
    /// source fetchers. Fetchers idle whenever no path currently wants
    /// their stream, so it's safe to start both unconditionally.
    pub fn start(&self) -> Result<(), OrchestratorError> {
        let _api = self.api_mutex.lock().unwrap();
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.events.clear(AUDIO_FETCHER_EXITED | VIDEO_FETCHER_EXITED);
        self.clock.start();

        let paths = self.paths.lock().unwrap().clone();
        for path in &paths {
            self.materialize_path(path);
            if path.muxer_enabled.load(Ordering::SeqCst) {
                self.start_muxer_worker(path)?;
            }
            let mut processor = path.processor.lock().unwrap();
            if let Some(processor) = processor.as_mut() {
                for stream in [StreamKind::Audio, StreamKind::Video] {
                    if path.wants(stream) {
                        processor.enable_path(stream, path.enabled.load(Ordering::SeqCst))?;
                    }
                }
                processor.start()?;
            }
        }

        let audio_info = *self.audio_info.lock().unwrap();
        let video_info = *self.video_info.lock().unwrap();

        self.audio_fetching.store(true, Ordering::SeqCst);
        let audio_paths = self.paths.lock().unwrap().clone();
        let audio_ctx = AudioFetcherCtx {
            source: self.audio_source.clone(),
            ring: self.audio_ring.clone(),
            clock: self.clock.clone(),
            fanout: self.fanout_audio.clone(),
            events: self.events.clone(),
            fetching: self.audio_fetching.clone(),
            audio_frames: self.audio_frames.clone(),
            sample_rate: audio_info.map(|i| i.sample_rate).unwrap_or(16_000),
            channels: audio_info.map(|i| i.channels).unwrap_or(1),
            bits_per_sample: audio_info.map(|i| i.bits_per_sample).unwrap_or(16),
            frame_ms_override: self.frame_ms_override.clone(),
            active_paths: Arc::new(move || audio_paths.iter().filter(|p| p.is_active(StreamKind::Audio, true)).cloned().collect()),
            event_tx: self.event_tx.clone(),
        };
        let audio_thread = std::thread::Builder::new()
            .name("avcap-audio-fetcher".into())
            .spawn(move || fetchers::run_audio_fetcher(audio_ctx))
            .expect("failed to spawn audio fetcher thread");
        *self.audio_fetcher_thread.lock().unwrap() = Some(audio_thread);

        self.video_fetching.store(true, Ordering::SeqCst);
        let video_paths = self.paths.lock().unwrap().clone();
        let video_ctx = VideoFetcherCtx {
            source: self.video_source.clone(),
            clock: self.clock.clone(),
            fanout: self.fanout_video.clone(),
            events: self.events.clone(),
            fetching: self.video_fetching.clone(),
            video_frames: self.video_frames.clone(),
            fps: video_info.map(|i| i.fps).unwrap_or(30),
            active_paths: Arc::new(move || video_paths.iter().filter(|p| p.is_active(StreamKind::Video, true)).cloned().collect()),
            event_tx: self.event_tx.clone(),
        };
        let video_thread = std::thread::Builder::new()
            .name("avcap-video-fetcher".into())
            .spawn(move || fetchers::run_video_fetcher(video_ctx))
            .expect("failed to spawn video fetcher thread");
        *self.video_fetcher_thread.lock().unwrap() = Some(video_thread);

        info!(paths = paths.len(), "orchestrator started");
        Ok(())
    }

    /// §4.H `stop`: the reverse-order quiesce sequence. Best-effort — never
    /// returns a hard error (§7).
    pub fn stop(&self) {
        let _api = self.api_mutex.lock().unwrap();
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }

        let paths = self.paths.lock().unwrap().clone();
        for path in &paths {
            self.stop_muxer_worker(path);
        }
        for path in &paths {
            path.enabled.store(false, Ordering::SeqCst);
            for stream in [StreamKind::Audio, StreamKind::Video] {
                if let Some(sq) = path.share_queue_for(stream) {
                    // `enable(false)` drains and releases whatever was
                    // buffered in the outlet's queue, which guarantees the
                    // sentinel send below finds room and never blocks; it
                    // only needs to unblock a caller already parked in a
                    // blocking `recv` on the same (now-empty) queue.
                    let _ = sq.enable(OUTLET_USER, false);
                    if let Ok(q) = sq.outlet_queue(OUTLET_USER) {
                        let _ = q.send(Frame::leave_sentinel(stream));
                    }
                }
            }
        }
        // Stopped only after outlets are drained and sentinels are queued, so
        // a processor blocked acquiring a released src frame isn't starved by
        // its own shutdown.
        for path in &paths {
            if let Some(processor) = path.processor.lock().unwrap().as_mut() {
                let _ = processor.stop();
            }
        }

        self.audio_fetching.store(false, Ordering::SeqCst);
        self.video_fetching.store(false, Ordering::SeqCst);
        // §5's "event-group wait during stop (bounded, 1 second)" requires
        // both fetcher-exited bits, not just one — `wait_any` would return
        // as soon as the faster fetcher exits, and the unconditional joins
        // that used to follow could then block indefinitely on a source
        // driver call with no timeout of its own. Only join a thread whose
        // exit the wait actually observed; a fetcher that never signaled
        // within the bound is left detached rather than hung on.
        let quiesced = self.events.wait_all(AUDIO_FETCHER_EXITED | VIDEO_FETCHER_EXITED, STOP_QUIESCE_TIMEOUT);
        if !quiesced {
            warn!("source fetchers did not both quiesce within the stop timeout");
        }
        let exited = self.events.get();
        if exited & AUDIO_FETCHER_EXITED != 0 {
            if let Some(h) = self.audio_fetcher_thread.lock().unwrap().take() {
                let _ = h.join();
            }
        }
        if exited & VIDEO_FETCHER_EXITED != 0 {
            if let Some(h) = self.video_fetcher_thread.lock().unwrap().take() {
                let _ = h.join();
            }
        }
        let _ = self.audio_source.lock().unwrap().stop();
        let _ = self.video_source.lock().unwrap().stop();

        self.clock.stop();
        self.audio_ring.drain();
        self.audio_frames.store(0, Ordering::SeqCst);
        self.video_frames.store(0, Ordering::SeqCst);

        let _ = self.event_tx.try_send(CaptureEvent::Stopped);
        info!("orchestrator stopped");
    }

    /// §4.H `close`: tears down the source drivers. Only valid once
    /// stopped; idempotent.
    pub fn close(&self) {
        let _api = self.api_mutex.lock().unwrap();
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.audio_source.lock().unwrap().close();
        let _ = self.video_source.lock().unwrap().close();
        let paths = self.paths.lock().unwrap().clone();
        for path in &paths {
            if let Some(processor) = path.processor.lock().unwrap().as_mut() {
                let _ = processor.close();
            }
        }
        self.paths.lock().unwrap().clear();
    }

    fn maybe_reset_stream_accounting(&self) {
        let paths = self.paths.lock().unwrap();
        if !paths.iter().any(|p| p.is_active(StreamKind::Audio, true)) {
            self.audio_frames.store(0, Ordering::SeqCst);
        }
        if !paths.iter().any(|p| p.is_active(StreamKind::Video, true)) {
            self.video_frames.store(0, Ordering::SeqCst);
        }
    }

    pub fn acquire_path_frame(&self, handle: PathHandle, stream: StreamKind, blocking: bool) -> Result<Frame, OrchestratorError> {
        let path = self.find_path(handle)?;
        match stream {
            StreamKind::MuxerOutput => self.acquire_muxer_output(&path, blocking),
            _ => path.acquire(stream, blocking),
        }
    }

    pub fn release_path_frame(&self, handle: PathHandle, stream: StreamKind, frame: &Frame) -> Result<(), OrchestratorError> {
        let path = self.find_path(handle)?;
        match stream {
            StreamKind::MuxerOutput => {
                let ring = path.muxer_output_ring.lock().unwrap().clone().ok_or(PathError::NoMuxerAttached)?;
                ring.read_unlock();
                Ok(())
            }
            _ => {
                let result = path.release(stream, frame);
                if result.is_ok() && path.run_finished.load(Ordering::SeqCst) {
                    let _ = self.event_tx.try_send(CaptureEvent::PathFinished { path: handle });
                }
                result
            }
        }
    }

    fn acquire_muxer_output(&self, path: &Arc<Path>, blocking: bool) -> Result<Frame, OrchestratorError> {
        let ring = path.muxer_output_ring.lock().unwrap().clone().ok_or(PathError::NoMuxerAttached)?;
        loop {
            let locked = unsafe { ring.read_lock() };
            match locked {
                Some((ptr, len)) if len >= 4 => {
                    let pts = unsafe { u32::from_be_bytes([*ptr, *ptr.add(1), *ptr.add(2), *ptr.add(3)]) };
                    let payload = unsafe { std::slice::from_raw_parts(ptr.add(4), len - 4) };
                    return Ok(Frame { stream: StreamKind::MuxerOutput, pts_ms: pts, buffer: SourceBuffer::from_slice(payload), token: None });
                }
                Some(_) => return Err(avcap_core::error::ShareQueueError::FrameNotFound.into()),
                None if blocking => std::thread::sleep(Duration::from_millis(5)),
                None => return Err(avcap_core::error::ShareQueueError::NoFrame.into()),
            }
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.stop();
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avcap_core::error::MuxerError;
    use avcap_core::types::{AudioInfo, MuxerBaseConfig, VideoInfo};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct TestAudioSource {
        reads: Arc<AtomicUsize>,
    }

    impl AudioSource for TestAudioSource {
        fn open(&mut self) -> Result<(), OrchestratorError> {
            Ok(())
        }
        fn negotiate(&mut self, desired: &AudioInfo) -> Result<AudioInfo, OrchestratorError> {
            Ok(*desired)
        }
        fn start(&mut self) -> Result<(), OrchestratorError> {
            Ok(())
        }
        fn read(&mut self, buf: &mut [u8]) -> Result<(), OrchestratorError> {
            buf.fill(0x11);
            self.reads.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(2));
            Ok(())
        }
        fn stop(&mut self) -> Result<(), OrchestratorError> {
            Ok(())
        }
        fn close(&mut self) -> Result<(), OrchestratorError> {
            Ok(())
        }
    }

    struct TestVideoSource {
        acquires: Arc<AtomicUsize>,
        releases: Arc<AtomicUsize>,
        frame_bytes: usize,
    }

    impl VideoSource for TestVideoSource {
        fn open(&mut self) -> Result<(), OrchestratorError> {
            Ok(())
        }
        fn negotiate(&mut self, desired: &VideoInfo) -> Result<VideoInfo, OrchestratorError> {
            Ok(*desired)
        }
        fn start(&mut self) -> Result<(), OrchestratorError> {
            Ok(())
        }
        fn acquire(&mut self) -> Result<SourceBuffer, OrchestratorError> {
            self.acquires.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(2));
            let boxed: Box<[u8]> = vec![0x22u8; self.frame_bytes].into_boxed_slice();
            let ptr = Box::into_raw(boxed) as *const u8;
            Ok(SourceBuffer::from_slice(unsafe { std::slice::from_raw_parts(ptr, self.frame_bytes) }))
        }
        fn release(&mut self, buffer: SourceBuffer) -> Result<(), OrchestratorError> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            let raw = std::ptr::slice_from_raw_parts_mut(buffer.identity() as *mut u8, buffer.len());
            drop(unsafe { Box::from_raw(raw) });
            Ok(())
        }
        fn stop(&mut self) -> Result<(), OrchestratorError> {
            Ok(())
        }
        fn close(&mut self) -> Result<(), OrchestratorError> {
            Ok(())
        }
    }

    struct NoopMuxer;

    impl Muxer for NoopMuxer {
        fn add_audio_stream(&mut self, _info: &AudioInfo) -> Result<usize, MuxerError> {
            Ok(0)
        }
        fn add_video_stream(&mut self, _info: &VideoInfo) -> Result<usize, MuxerError> {
            Ok(1)
        }
        fn write_packet(&mut self, _stream_index: usize, _frame: &Frame) -> Result<(), MuxerError> {
            Ok(())
        }
        fn drain_into(&mut self, _out: &mut dyn FnMut(&[u8], u32)) -> Result<(), MuxerError> {
            Ok(())
        }
        fn close(&mut self) -> Result<(), MuxerError> {
            Ok(())
        }
    }

    struct NoopMuxerFactory;

    impl MuxerFactory for NoopMuxerFactory {
        fn open(&self, _base: &MuxerBaseConfig) -> Result<Box<dyn Muxer>, MuxerError> {
            Ok(Box::new(NoopMuxer))
        }
    }

    fn test_orchestrator() -> Orchestrator {
        Orchestrator::open(OpenConfig {
            audio_source: Box::new(TestAudioSource { reads: Arc::new(AtomicUsize::new(0)) }),
            video_source: Box::new(TestVideoSource {
                acquires: Arc::new(AtomicUsize::new(0)),
                releases: Arc::new(AtomicUsize::new(0)),
                frame_bytes: 64,
            }),
            sync_mode: SyncMode::None,
        })
        .unwrap()
    }

    fn audio_sink() -> SinkConfig {
        SinkConfig { audio: Some(AudioInfo { sample_rate: 8_000, channels: 1, bits_per_sample: 16, codec: None }), video: None }
    }

    fn video_sink() -> SinkConfig {
        SinkConfig { audio: None, video: Some(VideoInfo { width: 320, height: 240, fps: 30, codec: None, bitrate: 0, gop: 30 }) }
    }

    #[test]
    fn single_path_audio_capture_delivers_and_releases_frames() {
        let orch = test_orchestrator();
        let handle = orch.setup_path(audio_sink()).unwrap();
        orch.enable_path(handle, true, RunType::Continuous).unwrap();
        orch.start().unwrap();

        let frame = orch.acquire_path_frame(handle, StreamKind::Audio, true).unwrap();
        assert_eq!(frame.stream, StreamKind::Audio);
        orch.release_path_frame(handle, StreamKind::Audio, &frame).unwrap();

        orch.stop();
    }

    #[test]
    fn fan_out_reaches_every_active_path_independently() {
        let orch = test_orchestrator();
        let h1 = orch.setup_path(video_sink()).unwrap();
        let h2 = orch.setup_path(video_sink()).unwrap();
        orch.enable_path(h1, true, RunType::Continuous).unwrap();
        orch.enable_path(h2, true, RunType::Continuous).unwrap();
        orch.start().unwrap();

        let f1 = orch.acquire_path_frame(h1, StreamKind::Video, true).unwrap();
        let f2 = orch.acquire_path_frame(h2, StreamKind::Video, true).unwrap();
        orch.release_path_frame(h1, StreamKind::Video, &f1).unwrap();
        orch.release_path_frame(h2, StreamKind::Video, &f2).unwrap();

        orch.stop();
    }

    #[test]
    fn muxer_attached_to_one_path_does_not_block_its_user_outlet() {
        let orch = test_orchestrator();
        let handle = orch.setup_path(video_sink()).unwrap();
        orch.add_muxer_to_path(handle, MuxerConfig::default(), Arc::new(NoopMuxerFactory)).unwrap();
        orch.enable_muxer(handle, true).unwrap();
        orch.enable_path(handle, true, RunType::Continuous).unwrap();
        orch.start().unwrap();

        let frame = orch.acquire_path_frame(handle, StreamKind::Video, true).unwrap();
        orch.release_path_frame(handle, StreamKind::Video, &frame).unwrap();

        std::thread::sleep(Duration::from_millis(20));
        assert!(orch.find_path(handle).unwrap().muxer_started.load(Ordering::SeqCst));

        orch.stop();
    }

    #[test]
    fn run_once_path_marks_itself_finished_after_one_release() {
        let orch = test_orchestrator();
        let handle = orch.setup_path(audio_sink()).unwrap();
        orch.start().unwrap();
        orch.enable_path(handle, true, RunType::RunOnce).unwrap();

        let frame = orch.acquire_path_frame(handle, StreamKind::Audio, true).unwrap();
        orch.release_path_frame(handle, StreamKind::Audio, &frame).unwrap();

        let path = orch.find_path(handle).unwrap();
        assert!(path.run_finished.load(Ordering::SeqCst));

        orch.stop();
    }

    #[test]
    fn stop_unblocks_a_caller_parked_in_a_blocking_acquire() {
        let orch = Arc::new(test_orchestrator());
        let handle = orch.setup_path(audio_sink()).unwrap();
        orch.enable_path(handle, true, RunType::Continuous).unwrap();
        orch.start().unwrap();

        let o2 = orch.clone();
        let blocked = std::thread::spawn(move || o2.acquire_path_frame(handle, StreamKind::Audio, true));

        std::thread::sleep(Duration::from_millis(30));
        orch.stop();

        blocked.join().unwrap().expect("blocked acquire should return the sentinel, not hang");
    }

    #[test]
    fn unconsumed_path_backpressure_does_not_hang_the_fetcher() {
        // Nothing ever calls acquire_path_frame, so the outlet queue fills
        // and add() starts dropping instead of blocking the fetcher forever.
        let orch = test_orchestrator();
        let handle = orch.setup_path(audio_sink()).unwrap();
        orch.enable_path(handle, true, RunType::Continuous).unwrap();
        orch.start().unwrap();

        std::thread::sleep(Duration::from_millis(100));
        orch.stop();

        let path = orch.find_path(handle).unwrap();
        let snap = path.stats.snapshot();
        assert!(snap.frames_produced > 0);
    }

    #[test]
    fn disabling_a_muxer_while_running_joins_its_worker_thread() {
        let orch = test_orchestrator();
        let handle = orch.setup_path(video_sink()).unwrap();
        orch.add_muxer_to_path(handle, MuxerConfig::default(), Arc::new(NoopMuxerFactory)).unwrap();
        orch.enable_muxer(handle, true).unwrap();
        orch.enable_path(handle, true, RunType::Continuous).unwrap();
        orch.start().unwrap();

        std::thread::sleep(Duration::from_millis(20));
        orch.enable_muxer(handle, false).unwrap();

        let path = orch.find_path(handle).unwrap();
        assert!(!path.muxer_started.load(Ordering::SeqCst));
        assert!(path.muxer_thread.lock().unwrap().is_none());

        orch.stop();
    }
}
