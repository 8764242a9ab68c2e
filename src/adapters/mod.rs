//! Event sinks for build lifecycle events.
//!
//! The orchestrator publishes [`BuildEvent`]s to a sink and never waits on
//! it. A slow or disconnected consumer must not stall a build.

pub mod channel;

use crate::domain::BuildEvent;

pub use channel::{ChannelSink, FanoutSink, TracingSink};

/// Consumer of build lifecycle events
pub trait EventSink: Send + Sync {
    /// Human-readable sink name
    fn name(&self) -> &str;

    /// Deliver an event. Must not block.
    fn emit(&self, event: BuildEvent);
}
