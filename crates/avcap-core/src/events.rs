// crates/avcap-core/src/events.rs
//
// The ambient event channel (§10.5 of the design document). Grounded on
// `velocut-core`'s `MediaResult` enum: one flat enum of everything a
// background worker might need to tell the host, delivered over a bounded
// `crossbeam_channel::Sender` rather than a callback trait, so the host can
// poll or select on it alongside its own channels.

use crate::types::PathHandle;

/// Emitted by the orchestrator and its workers over the course of a capture
/// session. Purely observational — nothing in the pipeline blocks waiting
/// for a consumer to read these, matching the bounded best-effort delivery
/// `encode_timeline`'s progress channel uses.
#[derive(Debug, Clone)]
pub enum CaptureEvent {
    /// A path finished negotiating and its muxer (if any) has been opened.
    PathStarted { path: PathHandle },
    /// A `RunOnce` path delivered its batch and disabled itself.
    PathFinished { path: PathHandle },
    /// A path's queue has been above its high-water mark for long enough
    /// that frames are being dropped rather than delivered.
    PathOverloaded { path: PathHandle, dropped: u64 },
    /// The audio or video source reported an error; the orchestrator is
    /// tearing the affected fetcher down.
    SourceError { message: String },
    /// A muxer produced an error while writing a packet for `path`.
    MuxerError { path: PathHandle, message: String },
    /// Periodic muxer progress, emitted every `PROGRESS_INTERVAL_PACKETS`
    /// packets written (§4.G, §10.5) — the same cadence the teacher's
    /// encode progress channel reports on.
    MuxerProgress { path: PathHandle, packets_written: u64, bytes_written: u64 },
    /// The orchestrator finished its stop sequence.
    Stopped,
}
