//! Built-in event sinks.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::EventSink;
use crate::domain::BuildEvent;

/// Forwards events into an unbounded channel
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<BuildEvent>,
}

impl ChannelSink {
    /// Create a sink together with the receiving end
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BuildEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn name(&self) -> &str {
        "channel"
    }

    fn emit(&self, event: BuildEvent) {
        // A dropped receiver just means nobody is listening any more
        if self.tx.send(event).is_err() {
            debug!("Event receiver dropped");
        }
    }
}

/// Writes events to the tracing log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn name(&self) -> &str {
        "tracing"
    }

    fn emit(&self, event: BuildEvent) {
        match &event {
            BuildEvent::StageStart { build_id, stage } => {
                info!(build_id = %build_id, stage = %stage, "Stage started");
            }
            BuildEvent::StageOutput { build_id, stage, line } => {
                debug!(build_id = %build_id, stage = %stage, "{}", line);
            }
            BuildEvent::StageComplete { build_id, stage, status } => {
                info!(build_id = %build_id, stage = %stage, status = %status, "Stage complete");
            }
            BuildEvent::BuildComplete { build_id, status } => {
                info!(build_id = %build_id, status = %status, "Build complete");
            }
            BuildEvent::BuildError { build_id, stage, error } => {
                error!(build_id = %build_id, stage = ?stage, "Build failed: {}", error);
            }
            BuildEvent::SudoRequired { build_id, reason } => {
                warn!(build_id = %build_id, "Sudo password required: {}", reason);
            }
        }
    }
}

/// Delivers every event to several sinks in order
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutSink {
    fn name(&self) -> &str {
        "fanout"
    }

    fn emit(&self, event: BuildEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.emit(event.clone());
            }
            last.emit(event);
        }
    }
}
