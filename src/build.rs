//! Build provider contract and build metadata.
//!
//! Fetching artifacts (download, cache, branch resolution) is an external
//! collaborator; the orchestrator only needs "give me the build for this
//! device config, or tell me there is none". "No build" is a normal
//! outcome distinct from a retrieval error: the sequencer reports a
//! degenerate failed invocation rather than crashing.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{InvocationError, InvocationResult};

/// Metadata of one fetched build under test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    pub build_id: String,
    pub build_flavor: String,
    pub branch: String,
    /// Host paths of fetched artifacts, keyed by artifact name.
    #[serde(default)]
    pub files: HashMap<String, PathBuf>,
    /// Free-form attributes (battery snapshots, fetch timings, etc.).
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl BuildInfo {
    pub fn new(
        build_id: impl Into<String>,
        build_flavor: impl Into<String>,
        branch: impl Into<String>,
    ) -> Self {
        Self {
            build_id: build_id.into(),
            build_flavor: build_flavor.into(),
            branch: branch.into(),
            files: HashMap::new(),
            attributes: HashMap::new(),
        }
    }

    pub fn add_file(&mut self, name: impl Into<String>, path: impl Into<PathBuf>) {
        self.files.insert(name.into(), path.into());
    }

    pub fn add_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(key.into(), value.into());
    }
}

impl std::fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} on {}", self.build_flavor, self.build_id, self.branch)
    }
}

/// Fetches and releases builds for an invocation.
#[async_trait]
pub trait BuildProvider: Send + Sync {
    /// Fetches the build to test. `Ok(None)` means "no build available",
    /// which the sequencer reports as a failed-but-bracketed invocation.
    async fn fetch_build(&self) -> InvocationResult<Option<BuildInfo>>;

    /// Releases artifacts of a fetched build. Best-effort; always called
    /// during cleanup even when the invocation failed.
    async fn clean_up(&self, build: &BuildInfo);
}

/// Scriptable in-memory provider for tests and dry runs.
pub struct StubBuildProvider {
    build: Mutex<Option<BuildInfo>>,
    fail_fetch: bool,
    fetches: AtomicUsize,
    cleaned: Mutex<Vec<String>>,
}

impl StubBuildProvider {
    pub fn with_build(build: BuildInfo) -> Self {
        Self {
            build: Mutex::new(Some(build)),
            fail_fetch: false,
            fetches: AtomicUsize::new(0),
            cleaned: Mutex::new(Vec::new()),
        }
    }

    /// A provider that finds no build.
    pub fn empty() -> Self {
        Self {
            build: Mutex::new(None),
            fail_fetch: false,
            fetches: AtomicUsize::new(0),
            cleaned: Mutex::new(Vec::new()),
        }
    }

    /// A provider whose fetch fails outright.
    pub fn failing() -> Self {
        Self {
            build: Mutex::new(None),
            fail_fetch: true,
            fetches: AtomicUsize::new(0),
            cleaned: Mutex::new(Vec::new()),
        }
    }

    /// Build ids that have been cleaned up.
    pub fn cleaned(&self) -> Vec<String> {
        self.cleaned.lock().unwrap().clone()
    }

    /// How many times a fetch was attempted.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BuildProvider for StubBuildProvider {
    async fn fetch_build(&self) -> InvocationResult<Option<BuildInfo>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail_fetch {
            return Err(InvocationError::BuildRetrieval(
                "scripted fetch failure".into(),
            ));
        }
        Ok(self.build.lock().unwrap().clone())
    }

    async fn clean_up(&self, build: &BuildInfo) {
        self.cleaned.lock().unwrap().push(build.build_id.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stub_provider_round_trip() {
        let provider =
            StubBuildProvider::with_build(BuildInfo::new("8912345", "sailfish-userdebug", "main"));
        let build = provider.fetch_build().await.unwrap().unwrap();
        assert_eq!(build.build_id, "8912345");
        provider.clean_up(&build).await;
        assert_eq!(provider.cleaned(), vec!["8912345"]);
    }

    #[tokio::test]
    async fn empty_provider_reports_no_build_without_error() {
        assert!(StubBuildProvider::empty().fetch_build().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failing_provider_is_a_retrieval_error() {
        let err = StubBuildProvider::failing().fetch_build().await.unwrap_err();
        assert!(matches!(err, InvocationError::BuildRetrieval(_)));
    }
}
