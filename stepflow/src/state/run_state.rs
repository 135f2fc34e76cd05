//! Run State: the shared context of one build.

use super::Rendezvous;
use crate::artifact::{ArtifactRepository, ByteStream};
use crate::cancellation::CancellationToken;
use crate::core::PlanId;
use crate::errors::Result;
use dashmap::DashMap;
use std::any::Any;
use std::sync::Arc;

type StoredResult = Arc<dyn Any + Send + Sync>;

/// Everything steps of one build share.
///
/// Concurrent branches only ever touch shared state through these
/// synchronized operations.
pub struct RunState {
    artifacts: Arc<ArtifactRepository>,
    results: DashMap<PlanId, StoredResult>,
    rendezvous: Rendezvous,
}

impl RunState {
    /// Creates a Run State with an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::with_artifacts(Arc::new(ArtifactRepository::new()))
    }

    /// Creates a Run State around an existing repository.
    #[must_use]
    pub fn with_artifacts(artifacts: Arc<ArtifactRepository>) -> Self {
        Self {
            artifacts,
            results: DashMap::new(),
            rendezvous: Rendezvous::new(),
        }
    }

    /// The build's artifact repository.
    #[must_use]
    pub fn artifacts(&self) -> &Arc<ArtifactRepository> {
        &self.artifacts
    }

    /// Stores a typed result for `plan_id`, replacing any earlier one.
    pub fn store_result<T>(&self, plan_id: &PlanId, value: T)
    where
        T: Any + Send + Sync,
    {
        self.results.insert(plan_id.clone(), Arc::new(value));
    }

    /// Returns the result stored for `plan_id` if it has type `T`.
    #[must_use]
    pub fn result<T>(&self, plan_id: &PlanId) -> Option<T>
    where
        T: Any + Clone,
    {
        let entry = self.results.get(plan_id)?;
        let any: &(dyn Any + Send + Sync) = &**entry.value();
        any.downcast_ref::<T>().cloned()
    }

    /// Copies the result stored for `plan_id` into `dest`.
    ///
    /// Returns false and leaves `dest` untouched when there is no result of
    /// type `T`.
    pub fn result_into<T>(&self, plan_id: &PlanId, dest: &mut T) -> bool
    where
        T: Any + Clone,
    {
        match self.result::<T>(plan_id) {
            Some(value) => {
                *dest = value;
                true
            }
            None => false,
        }
    }

    /// Sends a stream to whoever receives for `plan_id`.
    pub async fn send_stream(
        &self,
        plan_id: &PlanId,
        stream: ByteStream,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.rendezvous.send(plan_id, stream, cancel).await
    }

    /// Receives the stream sent for `plan_id`.
    pub async fn receive_stream(
        &self,
        plan_id: &PlanId,
        cancel: &CancellationToken,
    ) -> Result<ByteStream> {
        self.rendezvous.receive(plan_id, cancel).await
    }

    /// The rendezvous table.
    #[must_use]
    pub fn rendezvous(&self) -> &Rendezvous {
        &self.rendezvous
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunState")
            .field("artifacts", &self.artifacts)
            .field("results", &self.results.len())
            .field("rendezvous", &self.rendezvous)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ExitStatus, VersionInfo};

    #[test]
    fn test_result_is_type_checked() {
        let state = RunState::new();
        let id = PlanId::new("task");
        state.store_result(&id, ExitStatus(2));

        assert_eq!(state.result::<ExitStatus>(&id), Some(ExitStatus(2)));
        assert!(state.result::<VersionInfo>(&id).is_none());
        assert!(state.result::<ExitStatus>(&PlanId::new("other")).is_none());
    }

    #[test]
    fn test_result_into_leaves_dest_untouched() {
        let state = RunState::new();
        let id = PlanId::new("get");
        state.store_result(&id, ExitStatus(0));

        let mut dest = VersionInfo::default();
        dest.version.insert("ref".to_string(), "keep".to_string());
        assert!(!state.result_into(&id, &mut dest));
        assert_eq!(dest.version.get("ref").map(String::as_str), Some("keep"));

        let mut status = ExitStatus(99);
        assert!(state.result_into(&id, &mut status));
        assert_eq!(status, ExitStatus(0));
    }

    #[test]
    fn test_store_overwrites() {
        let state = RunState::new();
        let id = PlanId::new("put");
        state.store_result(&id, ExitStatus(1));
        state.store_result(&id, ExitStatus(0));
        assert_eq!(state.result::<ExitStatus>(&id), Some(ExitStatus(0)));
    }

    #[test]
    fn test_shares_repository() {
        let repo = Arc::new(ArtifactRepository::new());
        let state = RunState::with_artifacts(repo.clone());
        assert!(Arc::ptr_eq(state.artifacts(), &repo));
    }
}
