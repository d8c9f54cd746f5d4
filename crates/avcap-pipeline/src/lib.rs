// crates/avcap-pipeline/src/lib.rs
//
// The concurrency substrate and its orchestrator: everything `avcap-core`'s
// traits and types get wired into at runtime. Threads, locks, and the
// capture session lifecycle live here.

pub mod clock;
pub mod eventset;
pub mod fanout;
pub mod fetchers;
pub mod muxer_worker;
pub mod orchestrator;
pub mod path;
pub mod queue;
pub mod ring;
pub mod share_queue;

pub use clock::{SyncClock, SyncMode};
pub use orchestrator::{OpenConfig, Orchestrator};
pub use path::Path;
pub use queue::BoundedQueue;
pub use ring::ByteRing;
pub use share_queue::ShareQueue;
