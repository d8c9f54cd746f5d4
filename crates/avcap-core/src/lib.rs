// crates/avcap-core/src/lib.rs
//
// Shared vocabulary for the avcap capture pipeline: data types, the stable
// error code taxonomy, external-collaborator traits, the ambient event
// channel and monitoring counters. No threads and no I/O live here — that's
// `avcap-pipeline`'s job.

pub mod error;
pub mod events;
pub mod interfaces;
pub mod stats;
pub mod types;

pub use error::{CaptureErrorCode, CaptureResult, GetErrorCode, OrchestratorError};
pub use events::CaptureEvent;
pub use interfaces::{AudioSource, Muxer, MuxerFactory, PathProcessor, PathProcessorCallbacks, VideoSource};
pub use stats::{CaptureStats, CaptureStatsSnapshot};
pub use types::{
    AudioInfo, CodecTag, Frame, MuxerBaseConfig, MuxerConfig, MuxerOutputMode, OverlayConfig, PathHandle, Pts,
    RunType, SinkConfig, SlotToken, SourceBuffer, StreamKind, VideoInfo,
};
