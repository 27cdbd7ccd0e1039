//! Target lifecycle management
//!
//! Decides, once per run, whether a target is built per test or once per
//! session, and tears targets down most-recently-constructed first.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::target::Target;
use crate::{Error, Result};

/// Lifetime policy for targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// A fresh target for every test, torn down right after it
    #[default]
    PerTest,
    /// One target shared by every test of the run
    Session,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::PerTest => write!(f, "per_test"),
            Scope::Session => write!(f, "session"),
        }
    }
}

impl FromStr for Scope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "per_test" | "per-test" | "function" => Ok(Scope::PerTest),
            "session" | "keep" => Ok(Scope::Session),
            other => Err(Error::InvalidConfig(format!("unknown target scope '{}'", other))),
        }
    }
}

/// Builds targets for a [`LifecycleManager`]
#[async_trait]
pub trait TargetFactory: Send + Sync {
    /// Backend name used in diagnostics
    fn name(&self) -> &str;

    /// Construct a fully usable target, cleaning up after itself on failure
    async fn create(&self) -> Result<Target>;
}

#[derive(Default)]
struct State {
    session: Option<Arc<Target>>,
    /// Construction order; teardown walks it backwards
    live: Vec<Arc<Target>>,
    last_failure: Option<String>,
}

/// Scope-tagged target cache with explicit teardown ordering
pub struct LifecycleManager {
    scope: Scope,
    factory: Arc<dyn TargetFactory>,
    state: Mutex<State>,
}

impl LifecycleManager {
    pub fn new(scope: Scope, factory: Arc<dyn TargetFactory>) -> Self {
        info!("Target scope: {} ({})", scope, factory.name());
        Self {
            scope,
            factory,
            state: Mutex::new(State::default()),
        }
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// Construct a target, or return the cached session target
    pub async fn acquire(&self) -> Result<Arc<Target>> {
        let mut state = self.state.lock().await;

        if self.scope == Scope::Session {
            if let Some(target) = &state.session {
                if !target.is_torn_down() {
                    debug!("Reusing session target {}", target.id());
                    return Ok(target.clone());
                }
            }
            if let Some(reason) = &state.last_failure {
                info!("Rebuilding session target after earlier failure: {}", reason);
            }
        }

        let target = match self.factory.create().await {
            Ok(target) => Arc::new(target),
            Err(e) => {
                error!("Failed to construct {} target: {}", self.factory.name(), e);
                state.last_failure = Some(e.to_string());
                state.session = None;
                return Err(match e {
                    e @ Error::Environment { .. } => e,
                    e => Error::environment(self.factory.name(), e),
                });
            }
        };

        info!("Constructed target {} ({})", target.name(), target.id());
        state.live.push(target.clone());
        if self.scope == Scope::Session {
            state.session = Some(target.clone());
            state.last_failure = None;
        }

        Ok(target)
    }

    /// Hand a target back after a test
    ///
    /// Per-test targets are torn down immediately; session targets stay
    /// alive until [`LifecycleManager::shutdown`].
    pub async fn release(&self, target: &Arc<Target>) -> Result<()> {
        match self.scope {
            Scope::Session => {
                debug!("Keeping session target {} alive", target.id());
                Ok(())
            }
            Scope::PerTest => {
                let mut state = self.state.lock().await;
                state.live.retain(|t| t.id() != target.id());
                target.teardown().await
            }
        }
    }

    /// Tear down the cached session target so the next acquire rebuilds it
    pub async fn invalidate(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(target) = state.session.take() else {
            return Ok(());
        };
        warn!("Invalidating session target {}", target.id());
        state.live.retain(|t| t.id() != target.id());
        target.teardown().await
    }

    /// Tear down every live target, newest first
    ///
    /// All targets are attempted; the first failure is returned.
    pub async fn shutdown(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.session = None;

        let mut first_error = None;
        while let Some(target) = state.live.pop() {
            if let Err(e) = target.teardown().await {
                error!("Teardown of {} failed: {}", target.name(), e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Reason of the most recent failed construction, if it was not yet rebuilt
    pub async fn last_failure(&self) -> Option<String> {
        self.state.lock().await.last_failure.clone()
    }

    pub async fn live_targets(&self) -> usize {
        self.state.lock().await.live.len()
    }
}

impl Drop for LifecycleManager {
    fn drop(&mut self) {
        let live = &self.state.get_mut().live;
        if !live.is_empty() {
            warn!(
                "Lifecycle manager dropped with {} live target(s); \
                 call shutdown() to tear them down",
                live.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::Teardown;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Records teardown order by target name
    #[derive(Default)]
    struct Journal(SyncMutex<Vec<String>>);

    struct Recorder {
        name: String,
        journal: Arc<Journal>,
    }

    #[async_trait]
    impl Teardown for Recorder {
        async fn teardown(&self) -> Result<()> {
            self.journal.0.lock().push(self.name.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        built: AtomicUsize,
        fail_next: AtomicBool,
        journal: Arc<Journal>,
    }

    #[async_trait]
    impl TargetFactory for FakeFactory {
        fn name(&self) -> &str {
            "fake"
        }

        async fn create(&self) -> Result<Target> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(Error::CommandFailed {
                    command: "boot".into(),
                    reason: "image missing".into(),
                });
            }
            let n = self.built.fetch_add(1, Ordering::SeqCst);
            let name = format!("fake-{}", n);
            Target::builder(name.clone())
                .on_teardown(Arc::new(Recorder {
                    name,
                    journal: self.journal.clone(),
                }))
                .build()
        }
    }

    #[tokio::test]
    async fn test_session_scope_reuses_target() {
        let factory = Arc::new(FakeFactory::default());
        let manager = LifecycleManager::new(Scope::Session, factory.clone());

        let a = manager.acquire().await.unwrap();
        manager.release(&a).await.unwrap();
        let b = manager.acquire().await.unwrap();

        assert_eq!(a.id(), b.id());
        assert!(!a.is_torn_down());
        assert_eq!(factory.built.load(Ordering::SeqCst), 1);

        manager.shutdown().await.unwrap();
        assert!(a.is_torn_down());
    }

    #[tokio::test]
    async fn test_per_test_scope_builds_fresh_targets() {
        let factory = Arc::new(FakeFactory::default());
        let manager = LifecycleManager::new(Scope::PerTest, factory.clone());

        let a = manager.acquire().await.unwrap();
        manager.release(&a).await.unwrap();
        assert!(a.is_torn_down());

        let b = manager.acquire().await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(manager.live_targets().await, 1);
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_tears_down_newest_first() {
        let factory = Arc::new(FakeFactory::default());
        let manager = LifecycleManager::new(Scope::PerTest, factory.clone());

        let _a = manager.acquire().await.unwrap();
        let _b = manager.acquire().await.unwrap();
        let _c = manager.acquire().await.unwrap();
        manager.shutdown().await.unwrap();

        let order = factory.journal.0.lock().clone();
        assert_eq!(order, vec!["fake-2", "fake-1", "fake-0"]);
    }

    #[tokio::test]
    async fn test_session_failure_is_environment_error_and_rebuilds() {
        let factory = Arc::new(FakeFactory::default());
        factory.fail_next.store(true, Ordering::SeqCst);
        let manager = LifecycleManager::new(Scope::Session, factory.clone());

        let err = manager.acquire().await.unwrap_err();
        assert!(err.is_environment());
        assert!(manager.last_failure().await.unwrap().contains("image missing"));
        assert_eq!(manager.live_targets().await, 0);

        let target = manager.acquire().await.unwrap();
        assert!(manager.last_failure().await.is_none());
        assert_eq!(target.name(), "fake-0");
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalidate_forces_rebuild() {
        let factory = Arc::new(FakeFactory::default());
        let manager = LifecycleManager::new(Scope::Session, factory.clone());

        let a = manager.acquire().await.unwrap();
        manager.invalidate().await.unwrap();
        assert!(a.is_torn_down());

        let b = manager.acquire().await.unwrap();
        assert_ne!(a.id(), b.id());
        manager.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_session_acquire_constructs_once() {
        let factory = Arc::new(FakeFactory::default());
        let manager = Arc::new(LifecycleManager::new(Scope::Session, factory.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.acquire().await.unwrap().id() })
            })
            .collect();

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(factory.built.load(Ordering::SeqCst), 1);
        manager.shutdown().await.unwrap();
    }

    #[test]
    fn test_scope_parsing() {
        assert_eq!("session".parse::<Scope>().unwrap(), Scope::Session);
        assert_eq!("per-test".parse::<Scope>().unwrap(), Scope::PerTest);
        assert!("forever".parse::<Scope>().is_err());
    }
}
