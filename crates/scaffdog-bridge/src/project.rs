//! Project discovery.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;

use crate::error::ResolveError;

/// Probe `dir/pattern` for each comma-separated pattern, in order, then
/// retry from the parent directory. Stops at the filesystem root.
///
/// `try_load` receives the candidate path and the directory it was joined to.
pub async fn resolve_project<T, E, F, Fut>(
    root: &Path,
    patterns: &str,
    mut try_load: F,
) -> Result<T, ResolveError>
where
    E: Display,
    F: FnMut(PathBuf, PathBuf) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut dir = root.to_path_buf();
    loop {
        for pattern in patterns.split(',') {
            let pattern = pattern.trim();
            if pattern.is_empty() {
                continue;
            }
            let candidate = dir.join(pattern);
            match try_load(candidate.clone(), dir.clone()).await {
                Ok(project) => {
                    tracing::debug!(path = %candidate.display(), "Resolved project");
                    return Ok(project);
                }
                Err(e) => tracing::trace!(path = %candidate.display(), error = %e, "Not a project"),
            }
        }

        match dir.parent() {
            Some(parent) if parent != dir => dir = parent.to_path_buf(),
            _ => {
                return Err(ResolveError::ProjectNotFound {
                    root: root.to_path_buf(),
                });
            }
        }
    }
}

/// Resolved projects keyed by starting directory and pattern list.
pub struct ProjectCache<T> {
    entries: StdMutex<HashMap<(PathBuf, String), T>>,
}

impl<T> Default for ProjectCache<T> {
    fn default() -> Self {
        Self {
            entries: StdMutex::new(HashMap::new()),
        }
    }
}

impl<T: Clone> ProjectCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<(PathBuf, String), T>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Project cache mutex poisoned - recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn get(&self, root: &Path, patterns: &str) -> Option<T> {
        self.entries()
            .get(&(root.to_path_buf(), patterns.to_string()))
            .cloned()
    }

    pub fn insert(&self, root: &Path, patterns: &str, project: T) {
        self.entries()
            .insert((root.to_path_buf(), patterns.to_string()), project);
    }

    /// Cached lookup, resolving with `try_load` on a miss.
    pub async fn resolve<E, F, Fut>(
        &self,
        root: &Path,
        patterns: &str,
        try_load: F,
    ) -> Result<T, ResolveError>
    where
        E: Display,
        F: FnMut(PathBuf, PathBuf) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(project) = self.get(root, patterns) {
            return Ok(project);
        }
        let project = resolve_project(root, patterns, try_load).await?;
        self.insert(root, patterns, project.clone());
        Ok(project)
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
