//! The build-wide artifact repository.

use super::{join_path, ArtifactDestination, ArtifactSource, ByteStream};
use crate::errors::{FileNotFoundError, Result, UnknownArtifactSourceError};
use crate::worker::{Volume, Worker};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// A concurrency-safe mapping from artifact name to source.
///
/// One repository is shared by every step of a build. Registering a name
/// twice overwrites the earlier source, so retried steps simply replace what
/// their previous attempt produced.
#[derive(Default)]
pub struct ArtifactRepository {
    sources: RwLock<HashMap<String, Arc<dyn ArtifactSource>>>,
}

impl ArtifactRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `source` under `name`, replacing any previous source.
    pub fn register_source(&self, name: impl Into<String>, source: Arc<dyn ArtifactSource>) {
        let name = name.into();
        debug!(artifact = %name, "registering artifact source");
        self.sources.write().insert(name, source);
    }

    /// Looks up the source registered under `name`.
    #[must_use]
    pub fn source_for(&self, name: &str) -> Option<Arc<dyn ArtifactSource>> {
        self.sources.read().get(name).cloned()
    }

    /// Returns a snapshot of every registered source.
    #[must_use]
    pub fn as_map(&self) -> HashMap<String, Arc<dyn ArtifactSource>> {
        self.sources.read().clone()
    }

    /// Returns the registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sources.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns the number of registered sources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sources.read().len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sources.read().is_empty()
    }

    /// Builds a new repository holding what is registered right now.
    ///
    /// Later registrations on `self` do not show up in the snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Self {
        Self {
            sources: RwLock::new(self.as_map()),
        }
    }

    /// Builds a new repository exposing only `names`.
    ///
    /// Fails on the first name that is not registered.
    pub fn scoped_to<S: AsRef<str>>(&self, names: &[S]) -> Result<Self> {
        let sources = self.sources.read();
        let mut scoped = HashMap::with_capacity(names.len());

        for name in names {
            let name = name.as_ref();
            let source = sources
                .get(name)
                .ok_or_else(|| UnknownArtifactSourceError::new(name))?;
            scoped.insert(name.to_string(), Arc::clone(source));
        }

        Ok(Self {
            sources: RwLock::new(scoped),
        })
    }

    fn snapshot_sorted(&self) -> Vec<(String, Arc<dyn ArtifactSource>)> {
        let mut entries: Vec<_> = self
            .sources
            .read()
            .iter()
            .map(|(name, source)| (name.clone(), Arc::clone(source)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

impl std::fmt::Debug for ArtifactRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactRepository")
            .field("sources", &self.names())
            .finish()
    }
}

/// Redirects everything streamed into it under a named subdirectory.
struct SubdirDestination<'a> {
    dir: &'a str,
    inner: &'a dyn ArtifactDestination,
}

#[async_trait]
impl ArtifactDestination for SubdirDestination<'_> {
    async fn stream_in(&self, path: &str, stream: ByteStream) -> Result<()> {
        self.inner.stream_in(&join_path(self.dir, path), stream).await
    }
}

#[async_trait]
impl ArtifactSource for ArtifactRepository {
    /// Streams every source into a like-named subdirectory of `dest`.
    async fn stream_to(&self, dest: &dyn ArtifactDestination) -> Result<()> {
        // Released before any await so registrations are never blocked on IO.
        let entries = self.snapshot_sorted();

        for (name, source) in entries {
            let sub = SubdirDestination {
                dir: &name,
                inner: dest,
            };
            source.stream_to(&sub).await?;
        }
        Ok(())
    }

    /// Routes `name/rest` to `rest` inside the source called `name`.
    async fn stream_file(&self, path: &str) -> Result<ByteStream> {
        let Some((name, rest)) = path.split_once('/') else {
            return Err(FileNotFoundError::new(path).into());
        };

        match self.source_for(name) {
            Some(source) => source.stream_file(rest).await,
            None => Err(FileNotFoundError::new(path).into()),
        }
    }

    async fn volume_on(&self, _worker: &dyn Worker) -> Result<Option<Arc<dyn Volume>>> {
        Ok(None)
    }
}
