//! In-memory persistence gateway for tests and dry runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{build_transition_allowed, ControlRequest, PersistenceError, PersistenceGateway};
use crate::domain::{Build, BuildStatus, ControlAction, LogDocument, Stage, StageStatus};

#[derive(Default)]
struct State {
    builds: HashMap<String, Build>,
    stages: HashMap<String, Vec<Stage>>,
    documents: Vec<LogDocument>,
    controls: Vec<(ControlRequest, bool)>,
    activity: HashMap<String, DateTime<Utc>>,
}

impl State {
    fn touch(&mut self, build_id: &str) {
        self.activity.insert(build_id.to_string(), Utc::now());
    }
}

/// Gateway that keeps everything in process memory
#[derive(Default)]
pub struct MemoryGateway {
    state: Mutex<State>,
    fail_documents: AtomicBool,
    fail_stage_inserts: AtomicBool,
    failing_status_writes: AtomicU32,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `append_document` call fail
    pub fn fail_documents(&self, fail: bool) {
        self.fail_documents.store(fail, Ordering::SeqCst);
    }

    /// Make every `insert_stages` call fail
    pub fn fail_stage_inserts(&self, fail: bool) {
        self.fail_stage_inserts.store(fail, Ordering::SeqCst);
    }

    /// Make the next `count` build/stage status writes fail
    pub fn fail_next_status_writes(&self, count: u32) {
        self.failing_status_writes.store(count, Ordering::SeqCst);
    }

    fn status_write_fault(&self) -> Result<(), PersistenceError> {
        let tripped = self
            .failing_status_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            Err(PersistenceError::Unavailable("injected status write failure".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    async fn create_build(&self, build: &Build) -> Result<(), PersistenceError> {
        let mut state = self.state.lock();
        state.builds.insert(build.build_id.clone(), build.clone());
        state.touch(&build.build_id);
        Ok(())
    }

    async fn update_build(&self, build: &Build) -> Result<bool, PersistenceError> {
        self.status_write_fault()?;
        let mut state = self.state.lock();
        let Some(stored) = state.builds.get_mut(&build.build_id) else {
            return Ok(false);
        };
        if stored.status.is_terminal() || build.status == BuildStatus::Archived {
            return Ok(false);
        }
        *stored = build.clone();
        state.touch(&build.build_id);
        Ok(true)
    }

    async fn archive_build(&self, build_id: &str) -> Result<bool, PersistenceError> {
        let mut state = self.state.lock();
        let Some(stored) = state.builds.get_mut(build_id) else {
            return Ok(false);
        };
        if !build_transition_allowed(stored.status, BuildStatus::Archived) {
            return Ok(false);
        }
        stored.status = BuildStatus::Archived;
        state.touch(build_id);
        Ok(true)
    }

    async fn insert_stages(&self, build_id: &str, stages: &[Stage]) -> Result<(), PersistenceError> {
        if self.fail_stage_inserts.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("injected stage insert failure".to_string()));
        }
        let mut state = self.state.lock();
        state
            .stages
            .entry(build_id.to_string())
            .or_default()
            .extend(stages.iter().cloned());
        state.touch(build_id);
        Ok(())
    }

    async fn update_stage(&self, build_id: &str, stage: &Stage) -> Result<bool, PersistenceError> {
        self.status_write_fault()?;
        let mut state = self.state.lock();
        let stored = state
            .stages
            .get_mut(build_id)
            .and_then(|stages| stages.iter_mut().find(|s| s.name == stage.name));
        let Some(stored) = stored else {
            return Ok(false);
        };
        if stored.status.is_terminal() {
            return Ok(false);
        }
        *stored = stage.clone();
        state.touch(build_id);
        Ok(true)
    }

    async fn cancel_build_rows(
        &self,
        build_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, PersistenceError> {
        let mut state = self.state.lock();
        let Some(build) = state.builds.get_mut(build_id) else {
            return Ok(false);
        };
        if build.is_terminal() {
            return Ok(false);
        }
        build.finish(BuildStatus::Cancelled, at);

        for stage in state.stages.get_mut(build_id).into_iter().flatten() {
            match stage.status {
                StageStatus::Running => stage.finish(StageStatus::Cancelled, at),
                StageStatus::Pending => stage.status = StageStatus::Skipped,
                _ => {}
            }
        }
        state.touch(build_id);
        Ok(true)
    }

    async fn append_document(&self, document: &LogDocument) -> Result<i64, PersistenceError> {
        if self.fail_documents.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("injected document failure".to_string()));
        }
        let mut state = self.state.lock();
        let id = state.documents.len() as i64 + 1;
        let mut stored = document.clone();
        stored.id = id;
        state.documents.push(stored);
        state.touch(&document.build_id);
        Ok(id)
    }

    async fn get_build(&self, build_id: &str) -> Result<Option<Build>, PersistenceError> {
        Ok(self.state.lock().builds.get(build_id).cloned())
    }

    async fn list_stages(&self, build_id: &str) -> Result<Vec<Stage>, PersistenceError> {
        let mut stages = self
            .state
            .lock()
            .stages
            .get(build_id)
            .cloned()
            .unwrap_or_default();
        stages.sort_by_key(|s| s.stage_order);
        Ok(stages)
    }

    async fn list_documents(
        &self,
        build_id: &str,
        stage: Option<&str>,
    ) -> Result<Vec<LogDocument>, PersistenceError> {
        Ok(self
            .state
            .lock()
            .documents
            .iter()
            .filter(|d| d.build_id == build_id)
            .filter(|d| stage.map_or(true, |s| d.stage.as_deref() == Some(s)))
            .cloned()
            .collect())
    }

    async fn list_builds(
        &self,
        limit: usize,
        include_archived: bool,
    ) -> Result<Vec<Build>, PersistenceError> {
        let mut builds: Vec<Build> = self
            .state
            .lock()
            .builds
            .values()
            .filter(|b| include_archived || b.status != BuildStatus::Archived)
            .cloned()
            .collect();
        builds.sort_by(|a, b| {
            b.start_time
                .cmp(&a.start_time)
                .then_with(|| b.build_id.cmp(&a.build_id))
        });
        builds.truncate(limit);
        Ok(builds)
    }

    async fn last_activity(
        &self,
        build_id: &str,
    ) -> Result<Option<DateTime<Utc>>, PersistenceError> {
        Ok(self.state.lock().activity.get(build_id).copied())
    }

    async fn request_control(
        &self,
        build_id: &str,
        action: ControlAction,
    ) -> Result<i64, PersistenceError> {
        let mut state = self.state.lock();
        let id = state.controls.len() as i64 + 1;
        state.controls.push((
            ControlRequest {
                id,
                build_id: build_id.to_string(),
                action,
                requested_at: Utc::now(),
            },
            false,
        ));
        Ok(id)
    }

    async fn take_controls(&self, build_id: &str) -> Result<Vec<ControlRequest>, PersistenceError> {
        let mut state = self.state.lock();
        let mut out = Vec::new();
        for (request, handled) in state.controls.iter_mut() {
            if !*handled && request.build_id == build_id {
                *handled = true;
                out.push(request.clone());
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_injected_status_failures_run_out() {
        let gateway = MemoryGateway::new();
        let mut build = Build::new("b1".to_string(), "cfg".to_string(), 1);
        gateway.create_build(&build).await.unwrap();

        gateway.fail_next_status_writes(2);
        build.status = BuildStatus::Running;
        assert!(gateway.update_build(&build).await.is_err());
        assert!(gateway.update_build(&build).await.is_err());
        assert!(gateway.update_build(&build).await.unwrap());
    }

    #[tokio::test]
    async fn test_controls_are_taken_once() {
        let gateway = MemoryGateway::new();
        gateway.request_control("b1", ControlAction::Cancel).await.unwrap();
        gateway.request_control("b2", ControlAction::ForceCancel).await.unwrap();

        let taken = gateway.take_controls("b1").await.unwrap();
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].action, ControlAction::Cancel);
        assert!(gateway.take_controls("b1").await.unwrap().is_empty());
        assert_eq!(gateway.take_controls("b2").await.unwrap().len(), 1);
    }
}
