// crates/avcap-core/src/error.rs
//
// Stable integer error codes (§6) plus the internal `thiserror` taxonomy (§7,
// §10.2) that every subsystem's errors collapse into at the public boundary.
// Internal error types are never returned across the orchestrator's public
// API — only `CaptureErrorCode` (or `OrchestratorError`, which knows how to
// produce one) crosses that line.

use thiserror::Error;

/// Stable integer error codes returned by the public API. Values and meaning
/// are part of the contract — do not renumber.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureErrorCode {
    Ok = 0,
    NoMem = -1,
    InvalidArg = -2,
    NotSupported = -3,
    NotFound = -4,
    Timeout = -5,
    InvalidState = -6,
    Internal = -7,
    NoResources = -8,
    /// `not_enough` in §6. Kept at a distinct slot so it never collides with
    /// the other fixed codes above.
    NotEnough = -9,
}

impl CaptureErrorCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// Implemented by every internal error enum so it can report which stable
/// code it degrades to at the API boundary.
pub trait GetErrorCode {
    fn error_code(&self) -> CaptureErrorCode;
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue is full")]
    Full,
    #[error("queue is empty")]
    Empty,
    #[error("queue was destroyed")]
    Destroyed,
}

impl GetErrorCode for QueueError {
    fn error_code(&self) -> CaptureErrorCode {
        match self {
            QueueError::Full => CaptureErrorCode::NoResources,
            QueueError::Empty => CaptureErrorCode::NotFound,
            QueueError::Destroyed => CaptureErrorCode::InvalidState,
        }
    }
}

#[derive(Error, Debug)]
pub enum RingError {
    #[error("requested region of {0} bytes exceeds ring capacity")]
    TooLarge(usize),
    #[error("ring buffer was destroyed")]
    Destroyed,
    #[error("commit of {0} bytes exceeds the {1}-byte reservation")]
    InvalidCommit(usize, usize),
}

impl GetErrorCode for RingError {
    fn error_code(&self) -> CaptureErrorCode {
        match self {
            RingError::TooLarge(_) => CaptureErrorCode::NoResources,
            RingError::Destroyed => CaptureErrorCode::InvalidState,
            RingError::InvalidCommit(_, _) => CaptureErrorCode::InvalidArg,
        }
    }
}

#[derive(Error, Debug)]
pub enum ShareQueueError {
    /// §4.C: release of a frame whose underlying buffer isn't in any live
    /// slot. A protocol violation — logged by the caller, never panics.
    #[error("frame not found in share queue ring")]
    FrameNotFound,
    #[error("outlet {0} send failed, producer buffer leaked one ref (see design notes)")]
    OutletSendFailed(usize),
    #[error("outlet index {0} out of range")]
    InvalidOutlet(usize),
    #[error("set_outlet_queue is only permitted in external-queues mode")]
    NotExternalMode,
    #[error("no frame currently available")]
    NoFrame,
}

impl GetErrorCode for ShareQueueError {
    fn error_code(&self) -> CaptureErrorCode {
        match self {
            ShareQueueError::FrameNotFound => CaptureErrorCode::NotFound,
            ShareQueueError::OutletSendFailed(_) => CaptureErrorCode::Internal,
            ShareQueueError::InvalidOutlet(_) => CaptureErrorCode::InvalidArg,
            ShareQueueError::NotExternalMode => CaptureErrorCode::InvalidState,
            ShareQueueError::NoFrame => CaptureErrorCode::NotFound,
        }
    }
}

#[derive(Error, Debug)]
pub enum ClockError {
    #[error("clock has not been started")]
    NotStarted,
}

impl GetErrorCode for ClockError {
    fn error_code(&self) -> CaptureErrorCode {
        match self {
            ClockError::NotStarted => CaptureErrorCode::InvalidState,
        }
    }
}

#[derive(Error, Debug)]
pub enum PathError {
    #[error("cannot modify path configuration after start()")]
    AlreadyStarted,
    #[error("path is not configured for stream kind {0:?}")]
    StreamNotConfigured(crate::types::StreamKind),
    #[error("muxer already enabled for this path")]
    MuxerAlreadyEnabled,
    #[error("no muxer attached to this path")]
    NoMuxerAttached,
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Ring(#[from] RingError),
    #[error(transparent)]
    ShareQueue(#[from] ShareQueueError),
}

impl GetErrorCode for PathError {
    fn error_code(&self) -> CaptureErrorCode {
        match self {
            PathError::AlreadyStarted => CaptureErrorCode::InvalidState,
            PathError::StreamNotConfigured(_) => CaptureErrorCode::InvalidArg,
            PathError::MuxerAlreadyEnabled => CaptureErrorCode::InvalidState,
            PathError::NoMuxerAttached => CaptureErrorCode::InvalidArg,
            PathError::Queue(e) => e.error_code(),
            PathError::Ring(e) => e.error_code(),
            PathError::ShareQueue(e) => e.error_code(),
        }
    }
}

#[derive(Error, Debug)]
pub enum MuxerError {
    #[error("adding stream {0} to muxer failed")]
    StreamAddFailed(usize),
    #[error("muxer not configured for this path")]
    NotConfigured,
}

impl GetErrorCode for MuxerError {
    fn error_code(&self) -> CaptureErrorCode {
        match self {
            MuxerError::StreamAddFailed(_) => CaptureErrorCode::Internal,
            MuxerError::NotConfigured => CaptureErrorCode::InvalidState,
        }
    }
}

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("invalid argument: {0}")]
    InvalidArg(String),
    #[error("unknown path handle {0}")]
    UnknownPath(u32),
    #[error("orchestrator already started")]
    AlreadyStarted,
    #[error("orchestrator not started")]
    NotStarted,
    #[error("source negotiation failed: {0}")]
    NegotiationFailed(String),
    #[error("source reported an error: {0}")]
    SourceError(String),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Ring(#[from] RingError),
    #[error(transparent)]
    ShareQueue(#[from] ShareQueueError),
    #[error(transparent)]
    Clock(#[from] ClockError),
    #[error(transparent)]
    Muxer(#[from] MuxerError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl GetErrorCode for OrchestratorError {
    fn error_code(&self) -> CaptureErrorCode {
        match self {
            OrchestratorError::InvalidArg(_) => CaptureErrorCode::InvalidArg,
            OrchestratorError::UnknownPath(_) => CaptureErrorCode::NotFound,
            OrchestratorError::AlreadyStarted => CaptureErrorCode::InvalidState,
            OrchestratorError::NotStarted => CaptureErrorCode::InvalidState,
            OrchestratorError::NegotiationFailed(_) => CaptureErrorCode::NotSupported,
            OrchestratorError::SourceError(_) => CaptureErrorCode::Internal,
            OrchestratorError::Path(e) => e.error_code(),
            OrchestratorError::Queue(e) => e.error_code(),
            OrchestratorError::Ring(e) => e.error_code(),
            OrchestratorError::ShareQueue(e) => e.error_code(),
            OrchestratorError::Clock(e) => e.error_code(),
            OrchestratorError::Muxer(e) => e.error_code(),
            OrchestratorError::Internal(_) => CaptureErrorCode::Internal,
        }
    }
}

pub type CaptureResult<T> = Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(CaptureErrorCode::Ok.as_i32(), 0);
        assert_eq!(CaptureErrorCode::NoMem.as_i32(), -1);
        assert_eq!(CaptureErrorCode::InvalidArg.as_i32(), -2);
        assert_eq!(CaptureErrorCode::NotSupported.as_i32(), -3);
        assert_eq!(CaptureErrorCode::NotFound.as_i32(), -4);
        assert_eq!(CaptureErrorCode::Timeout.as_i32(), -5);
        assert_eq!(CaptureErrorCode::InvalidState.as_i32(), -6);
        assert_eq!(CaptureErrorCode::Internal.as_i32(), -7);
        assert_eq!(CaptureErrorCode::NoResources.as_i32(), -8);
    }

    #[test]
    fn share_queue_frame_not_found_maps_to_not_found() {
        assert_eq!(
            ShareQueueError::FrameNotFound.error_code(),
            CaptureErrorCode::NotFound
        );
    }

    #[test]
    fn path_error_forwards_nested_code() {
        let err = PathError::from(QueueError::Full);
        assert_eq!(err.error_code(), CaptureErrorCode::NoResources);
    }
}
