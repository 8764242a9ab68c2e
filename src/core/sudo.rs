//! Sudo password relay.
//!
//! When a stage prints a privilege prompt, the executor asks the relay for
//! a credential. The relay announces the request through the event sink
//! and parks the stage until a consumer answers, declines, or the build is
//! cancelled. Supplied credentials are cached per build in memory only.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::adapters::EventSink;
use crate::domain::BuildEvent;

/// Prompt prefix printed by a stock sudo
pub const STOCK_SUDO_MARKER: &str = "[sudo] password for";

/// A sudo password. Never printed by `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// The secret itself
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Where a build's credential request stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Nothing requested, nothing cached
    Idle,
    /// A stage is blocked on a credential
    Awaiting,
    /// A credential is cached for the build
    Resolved,
}

#[derive(Default)]
struct Entry {
    cached: Option<Credential>,
    pending: Option<oneshot::Sender<Option<Credential>>>,
}

/// Relays sudo credentials between running stages and the sink's consumer
pub struct SudoRelay {
    sink: Arc<dyn EventSink>,
    markers: Vec<String>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl SudoRelay {
    /// Create a relay that recognises the given prompt markers
    pub fn new(sink: Arc<dyn EventSink>, markers: Vec<String>) -> Self {
        Self {
            sink,
            markers,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Start tracking a build so credentials can be supplied ahead of its
    /// first prompt. Undone by [`SudoRelay::release`].
    pub fn open(&self, build_id: &str) {
        self.entries.lock().entry(build_id.to_string()).or_default();
    }

    /// Whether an output line is a password prompt
    pub fn is_privilege_prompt(&self, line: &str) -> bool {
        let line = line.trim();
        !line.is_empty() && self.markers.iter().any(|m| line.contains(m.as_str()))
    }

    /// Get a credential for a build, blocking until one is supplied.
    ///
    /// Returns the cached credential immediately if the build already has
    /// one. Returns `None` if the request is declined or `cancel` fires.
    pub async fn request_credential(
        &self,
        build_id: &str,
        reason: &str,
        cancel: &CancellationToken,
    ) -> Option<Credential> {
        let rx = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(build_id.to_string()).or_default();
            if let Some(cached) = &entry.cached {
                debug!(build_id, "Using cached sudo credential");
                return Some(cached.clone());
            }
            let (tx, rx) = oneshot::channel();
            entry.pending = Some(tx);
            rx
        };

        info!(build_id, "Waiting for sudo credential");
        self.sink.emit(BuildEvent::SudoRequired {
            build_id: build_id.to_string(),
            reason: reason.to_string(),
        });

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                if let Some(entry) = self.entries.lock().get_mut(build_id) {
                    entry.pending = None;
                }
                debug!(build_id, "Credential request abandoned");
                None
            }
            answer = rx => answer.ok().flatten(),
        }
    }

    /// Answer a pending request. `None` declines it.
    ///
    /// A credential supplied with no request pending is cached for the
    /// build's next prompt, but only while the build is tracked. Returns
    /// whether a waiting stage was resolved.
    pub fn supply_credential(&self, build_id: &str, credential: Option<Credential>) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(build_id) else {
            debug!(build_id, "Ignoring credential for untracked build");
            return false;
        };

        if let Some(credential) = &credential {
            entry.cached = Some(credential.clone());
        }

        match entry.pending.take() {
            Some(tx) => tx.send(credential).is_ok(),
            None => false,
        }
    }

    /// Current state for a build
    pub fn state(&self, build_id: &str) -> RelayState {
        match self.entries.lock().get(build_id) {
            Some(entry) if entry.pending.is_some() => RelayState::Awaiting,
            Some(entry) if entry.cached.is_some() => RelayState::Resolved,
            _ => RelayState::Idle,
        }
    }

    /// Drop everything held for a build
    pub fn release(&self, build_id: &str) {
        if self.entries.lock().remove(build_id).is_some() {
            debug!(build_id, "Released sudo relay state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::ChannelSink;

    fn relay() -> (Arc<SudoRelay>, tokio::sync::mpsc::UnboundedReceiver<BuildEvent>) {
        let (sink, rx) = ChannelSink::new();
        let relay = SudoRelay::new(Arc::new(sink), vec![STOCK_SUDO_MARKER.to_string()]);
        (Arc::new(relay), rx)
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        let cred = Credential::new("hunter2");
        assert!(!format!("{:?}", cred).contains("hunter2"));
        assert_eq!(cred.expose(), "hunter2");
    }

    #[test]
    fn test_prompt_detection() {
        let (relay, _rx) = relay();
        assert!(relay.is_privilege_prompt("[sudo] password for lfs: "));
        assert!(!relay.is_privilege_prompt("compiling gcc"));
        assert!(!relay.is_privilege_prompt(""));
    }

    #[tokio::test]
    async fn test_request_is_resolved_and_cached() {
        let (relay, mut rx) = relay();
        let cancel = CancellationToken::new();

        let waiter = {
            let relay = relay.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { relay.request_credential("b1", "mount", &cancel).await })
        };

        match rx.recv().await.unwrap() {
            BuildEvent::SudoRequired { build_id, .. } => assert_eq!(build_id, "b1"),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(relay.state("b1"), RelayState::Awaiting);
        assert!(relay.supply_credential("b1", Some(Credential::new("pw"))));

        assert_eq!(waiter.await.unwrap(), Some(Credential::new("pw")));
        assert_eq!(relay.state("b1"), RelayState::Resolved);

        // Second prompt uses the cache without emitting
        let again = relay.request_credential("b1", "mount", &cancel).await;
        assert_eq!(again, Some(Credential::new("pw")));
        assert!(rx.try_recv().is_err());

        // Not shared with other builds
        assert_eq!(relay.state("b2"), RelayState::Idle);

        relay.release("b1");
        assert_eq!(relay.state("b1"), RelayState::Idle);
    }

    #[tokio::test]
    async fn test_decline_and_cancel() {
        let (relay, mut rx) = relay();
        let cancel = CancellationToken::new();

        let waiter = {
            let relay = relay.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { relay.request_credential("b1", "mount", &cancel).await })
        };
        rx.recv().await.unwrap();
        relay.supply_credential("b1", None);
        assert_eq!(waiter.await.unwrap(), None);

        let waiter = {
            let relay = relay.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { relay.request_credential("b1", "mount", &cancel).await })
        };
        rx.recv().await.unwrap();
        cancel.cancel();
        assert_eq!(waiter.await.unwrap(), None);
        assert_eq!(relay.state("b1"), RelayState::Idle);
    }

    #[test]
    fn test_untracked_build_keeps_nothing() {
        let (relay, _rx) = relay();

        assert!(!relay.supply_credential("never-started", Some(Credential::new("pw"))));
        assert_eq!(relay.state("never-started"), RelayState::Idle);

        relay.open("b1");
        assert!(!relay.supply_credential("b1", Some(Credential::new("pw"))));
        assert_eq!(relay.state("b1"), RelayState::Resolved);

        relay.release("b1");
        assert!(!relay.supply_credential("b1", Some(Credential::new("pw"))));
        assert_eq!(relay.state("b1"), RelayState::Idle);
    }
}
