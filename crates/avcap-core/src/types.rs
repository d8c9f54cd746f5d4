// crates/avcap-core/src/types.rs
//
// Plain data shared across the pipeline crate and any embedding host — no
// threads, no locks, no trait objects. Mirrors the role `velocut-core`'s
// `media_types.rs` plays for its UI: the one module both sides import.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which logical stream a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Audio,
    Video,
    MuxerOutput,
    Control,
}

/// Presentation timestamp in milliseconds. Spec'd as a 32-bit wrapping
/// counter — arithmetic on it wraps the same way a C `uint32_t` would.
pub type Pts = u32;

/// A token identifying the share-queue slot a frame was allocated into.
///
/// This replaces the pointer-identity release matching the distilled design
/// describes (scanning the ring for a `frame_data` pointer match) with an
/// O(1) lookup, per the redesign note in the design document: the consumer
/// hands the token straight back on release instead of the producer's buffer
/// address being re-derived and searched for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotToken(pub u64);

/// A view into memory owned by a source driver (or an internal ring buffer).
/// Ownership never transfers to the holder — the identity (`ptr`) is used
/// only to detect misuse (double release, unknown frame) when no
/// [`SlotToken`] is available, e.g. a frame read in the bypass single-path
/// mode (§4.F).
///
/// # Safety
/// The region `[ptr, ptr+len)` is only valid for as long as the producer
/// (source driver, or the ring buffer that reserved it) has not reused it.
/// Reading it from multiple threads concurrently with a write is undefined
/// behavior; callers must rely on the share queue / ring buffer's own
/// synchronization (refcounting, read-lock/unlock) to avoid this.
#[derive(Debug, Clone, Copy)]
pub struct SourceBuffer {
    ptr: *const u8,
    len: usize,
}

// SAFETY: SourceBuffer is an inert (pointer, length) pair handed between
// worker threads under the share queue / ring buffer's own synchronization;
// it performs no aliasing on its own.
unsafe impl Send for SourceBuffer {}

impl SourceBuffer {
    pub fn empty() -> Self {
        Self { ptr: std::ptr::null(), len: 0 }
    }

    pub fn from_slice(slice: &[u8]) -> Self {
        Self { ptr: slice.as_ptr(), len: slice.len() }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Identity used for pointer-based release matching when no
    /// [`SlotToken`] travels with the frame.
    pub fn identity(&self) -> usize {
        self.ptr as usize
    }

    /// # Safety
    /// See the struct-level safety note: the caller must know the producer
    /// still owns live memory at this address for the duration of the borrow.
    pub unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        if self.len == 0 {
            &[]
        } else {
            unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
        }
    }
}

/// A frame handle flowing through the pipeline. The payload it points at is
/// owned by the producer; see [`SourceBuffer`].
#[derive(Debug, Clone, Copy)]
pub struct Frame {
    pub stream: StreamKind,
    pub pts_ms: Pts,
    pub buffer: SourceBuffer,
    /// Set by [`crate`][self]'s share queue when the frame is admitted via
    /// `add`; `None` for frames that never pass through one (bypass mode,
    /// or the zero-size "leave" control sentinel).
    pub token: Option<SlotToken>,
}

impl Frame {
    pub fn leave_sentinel(stream: StreamKind) -> Self {
        Self { stream, pts_ms: 0, buffer: SourceBuffer::empty(), token: None }
    }

    pub fn is_sentinel(&self) -> bool {
        self.buffer.is_empty() && self.token.is_none()
    }
}

/// Audio format negotiated between a sink config and a source driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioInfo {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub codec: CodecTag,
}

/// Video format negotiated between a sink config and a source driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub codec: CodecTag,
    pub bitrate: u32,
    pub gop: u32,
}

/// A codec tag, or `None` meaning "this half of the stream has no demand" —
/// the degraded state a resource error zeroes a sink config half into (§7).
pub type CodecTag = Option<u32>;

/// A per-path pair of desired formats. Either half may be absent.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SinkConfig {
    pub audio: Option<AudioInfo>,
    pub video: Option<VideoInfo>,
}

impl SinkConfig {
    pub fn wants(&self, stream: StreamKind) -> bool {
        match stream {
            StreamKind::Audio => self.audio.is_some(),
            StreamKind::Video => self.video.is_some(),
            StreamKind::MuxerOutput | StreamKind::Control => false,
        }
    }

    /// Degrade the given half to "no demand", per the §7 resource-error
    /// handling: a half whose queue/ring allocation failed is zeroed so
    /// later decisions (has_active_path, fetcher gating) see no demand.
    pub fn degrade(&mut self, stream: StreamKind) {
        match stream {
            StreamKind::Audio => self.audio = None,
            StreamKind::Video => self.video = None,
            StreamKind::MuxerOutput | StreamKind::Control => {}
        }
    }
}

/// How a path's `enable_path` call should behave once queues drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunType {
    /// Deliver frames indefinitely until disabled.
    Continuous,
    /// Deliver exactly one batch, then mark itself finished (§4.H).
    RunOnce,
}

/// Output mode for a muxer attached to a path (§4.G).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MuxerOutputMode {
    /// Bytes stream out continuously through a `data_cb`-equivalent into the
    /// path's muxer-output ring (TS, FLV-style containers).
    Streaming,
    /// The muxer writes fixed-duration file slices; no byte ring is used.
    SlicedFile { slice_duration: Duration },
}

impl Default for MuxerOutputMode {
    fn default() -> Self {
        MuxerOutputMode::SlicedFile { slice_duration: Duration::from_secs(300) }
    }
}

/// Base configuration handed to a muxer implementation's `open`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MuxerBaseConfig {
    pub output_mode: MuxerOutputMode,
}

/// User-supplied description of a muxer to attach to a path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MuxerConfig {
    pub base: MuxerBaseConfig,
}

/// Placeholder for an overlay attachment — the renderer itself is out of
/// scope (§1); only the configuration shape is owned by the core.
#[derive(Debug, Clone, Default)]
pub struct OverlayConfig {
    pub enabled: bool,
}

/// Opaque handle to a path, returned by `setup_path`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PathHandle(pub u32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_config_wants_reflects_codec_presence() {
        let mut sink = SinkConfig {
            audio: Some(AudioInfo { sample_rate: 16_000, channels: 1, bits_per_sample: 16, codec: Some(1) }),
            video: None,
        };
        assert!(sink.wants(StreamKind::Audio));
        assert!(!sink.wants(StreamKind::Video));

        sink.degrade(StreamKind::Audio);
        assert!(!sink.wants(StreamKind::Audio));
    }

    #[test]
    fn leave_sentinel_is_recognized() {
        let f = Frame::leave_sentinel(StreamKind::Audio);
        assert!(f.is_sentinel());
    }

    /// §10.3: config types derive `Serialize`/`Deserialize` so an embedding
    /// host can snapshot/log/replay a configuration; the crate itself never
    /// reads or writes one.
    #[test]
    fn sink_config_round_trips_through_json() {
        let sink = SinkConfig {
            audio: Some(AudioInfo { sample_rate: 48_000, channels: 2, bits_per_sample: 16, codec: Some(7) }),
            video: Some(VideoInfo { width: 1920, height: 1080, fps: 30, codec: None, bitrate: 4_000_000, gop: 60 }),
        };
        let json = serde_json::to_string(&sink).unwrap();
        let back: SinkConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.audio, sink.audio);
        assert_eq!(back.video, sink.video);
    }

    #[test]
    fn muxer_config_round_trips_through_json() {
        let cfg = MuxerConfig { base: MuxerBaseConfig { output_mode: MuxerOutputMode::Streaming } };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: MuxerConfig = serde_json::from_str(&json).unwrap();
        assert!(matches!(back.base.output_mode, MuxerOutputMode::Streaming));
    }
}
