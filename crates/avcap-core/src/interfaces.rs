// crates/avcap-core/src/interfaces.rs
//
// Traits implemented by external collaborators: audio/video source drivers,
// muxer implementations, and the optional per-path processor. The pipeline
// crate only ever talks to these traits — it never knows about a concrete
// capture device or container format.

use crate::error::{MuxerError, OrchestratorError};
use crate::types::{AudioInfo, Frame, MuxerBaseConfig, OverlayConfig, PathHandle, SinkConfig, SourceBuffer, StreamKind, VideoInfo};

/// Driver for the single audio source an orchestrator owns.
///
/// Lifecycle mirrors §4.H: `open` once, `negotiate` against each path's
/// demand as paths are added, `start`/`stop` bracket capture, `close` once.
pub trait AudioSource: Send {
    fn open(&mut self) -> Result<(), OrchestratorError>;

    /// Returns the format actually usable, which may differ from `desired`
    /// (sample rate snapping, channel downmix, etc).
    fn negotiate(&mut self, desired: &AudioInfo) -> Result<AudioInfo, OrchestratorError>;

    fn start(&mut self) -> Result<(), OrchestratorError>;

    /// Fills `buf` (a region reserved from the audio source ring) with PCM.
    /// Called from the audio fetcher's own thread only. Unlike
    /// [`VideoSource`], the driver owns no buffers of its own to release —
    /// the ring is the pool.
    fn read(&mut self, buf: &mut [u8]) -> Result<(), OrchestratorError>;

    fn stop(&mut self) -> Result<(), OrchestratorError>;

    fn close(&mut self) -> Result<(), OrchestratorError>;
}

/// Driver for the single video source an orchestrator owns.
pub trait VideoSource: Send {
    fn open(&mut self) -> Result<(), OrchestratorError>;

    fn negotiate(&mut self, desired: &VideoInfo) -> Result<VideoInfo, OrchestratorError>;

    fn start(&mut self) -> Result<(), OrchestratorError>;

    /// Acquires the next frame. Implementations that hand out already-encoded
    /// access units (no raw-frame pacing) should set [`VideoSource::is_encoded`]
    /// so the fetcher skips PTS-snapping logic meant for raw sources.
    fn acquire(&mut self) -> Result<SourceBuffer, OrchestratorError>;

    fn release(&mut self, buffer: SourceBuffer) -> Result<(), OrchestratorError>;

    fn stop(&mut self) -> Result<(), OrchestratorError>;

    fn close(&mut self) -> Result<(), OrchestratorError>;

    fn is_encoded(&self) -> bool {
        false
    }
}

/// A container muxer attached to one path (§4.G). One instance per path.
pub trait Muxer: Send {
    fn add_audio_stream(&mut self, info: &AudioInfo) -> Result<usize, MuxerError>;

    fn add_video_stream(&mut self, info: &VideoInfo) -> Result<usize, MuxerError>;

    /// Appends one packet to the stream at `stream_index`. `frame.buffer`
    /// is only valid for the duration of this call.
    fn write_packet(&mut self, stream_index: usize, frame: &Frame) -> Result<(), MuxerError>;

    /// When this muxer produces a continuous byte stream (Streaming mode),
    /// `out` receives each chunk of muxed container bytes along with the
    /// PTS of the packet that produced them. Not called in SlicedFile mode.
    fn drain_into(&mut self, out: &mut dyn FnMut(&[u8], u32)) -> Result<(), MuxerError>;

    fn close(&mut self) -> Result<(), MuxerError>;
}

/// Opens concrete [`Muxer`] instances on demand. A path calls this once per
/// `add_muxer_to_path`, handing back the base config the muxer needs to know
/// its output mode.
pub trait MuxerFactory: Send + Sync {
    fn open(&self, base: &MuxerBaseConfig) -> Result<Box<dyn Muxer>, MuxerError>;
}

/// Callbacks a [`PathProcessor`] uses to pull frames from and push frames
/// back into the pipeline around whatever transformation it performs (§6).
pub struct PathProcessorCallbacks {
    /// Pulls the next raw frame the fetcher produced for this path's stream,
    /// blocking until one arrives. Bypasses the path's share queue — the
    /// processor is the one consumer of the raw handle.
    pub acquire_src_frame: Box<dyn Fn(StreamKind) -> Result<Frame, OrchestratorError> + Send>,
    /// Returns a frame obtained via `acquire_src_frame`, releasing the
    /// underlying source buffer once every fanned-out path has done the same.
    pub release_src_frame: Box<dyn Fn(StreamKind, &Frame) -> Result<(), OrchestratorError> + Send>,
    /// Negotiates a desired audio format against the shared audio source.
    pub nego_audio: Box<dyn Fn(&AudioInfo) -> Result<AudioInfo, OrchestratorError> + Send>,
    /// Negotiates a desired video format against the shared video source.
    pub nego_video: Box<dyn Fn(&VideoInfo) -> Result<VideoInfo, OrchestratorError> + Send>,
    /// Pushes a processed frame into this path's share queue for delivery to
    /// its user/muxer outlets.
    pub frame_processed: Box<dyn Fn(StreamKind, Frame) + Send>,
    /// Signals a condition (e.g. `"audio_error"`) that should disable the
    /// named half of this path.
    pub event: Box<dyn Fn(StreamKind, &str) + Send>,
}

/// Optional per-path processing stage (overlay compositing, transcoding,
/// etc). No concrete implementation ships in this crate — only the seam.
pub trait PathProcessor: Send {
    fn open(&mut self, callbacks: PathProcessorCallbacks) -> Result<(), OrchestratorError>;

    fn add_path(&mut self, stream: StreamKind, sink: &SinkConfig) -> Result<(), OrchestratorError>;

    fn enable_path(&mut self, stream: StreamKind, enabled: bool) -> Result<(), OrchestratorError>;

    fn start(&mut self) -> Result<(), OrchestratorError>;

    fn stop(&mut self) -> Result<(), OrchestratorError>;

    fn close(&mut self) -> Result<(), OrchestratorError>;

    fn add_overlay(&mut self, overlay: &OverlayConfig) -> Result<(), OrchestratorError>;

    fn enable_overlay(&mut self, enabled: bool) -> Result<(), OrchestratorError>;

    fn set_property(&mut self, stream: StreamKind, key: &str, value: &str) -> Result<(), OrchestratorError>;

    /// The smallest audio frame size (in samples) this path's processing
    /// wants, or `None` to defer to the default (§4.E step 2). The audio
    /// fetcher takes the minimum reported across every active path.
    fn get_audio_frame_samples(&self, _path: PathHandle) -> Option<u32> {
        None
    }
}
