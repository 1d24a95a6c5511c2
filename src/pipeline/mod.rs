pub mod handoff;
pub mod signal;

pub use handoff::{FrameConsumer, HandoffQueue, HandoffStats, PushError, HANDOFF_CAPACITY};
pub use signal::{CancellationSignal, Permit, RequestToken};
