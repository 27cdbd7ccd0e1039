//! Suite runner: acquires targets, applies capability gates, runs test bodies

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::preflight::Preflight;
use itf_common::{
    Capability, CapabilityGate, Error, GateDecision, LifecycleManager, Result, Scope, Target,
    TargetId,
};

type TestBody = Box<dyn Fn(Arc<Target>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A named test with the capabilities it needs
pub struct TestCase {
    name: String,
    gate: CapabilityGate,
    timeout: Option<Duration>,
    body: TestBody,
}

impl TestCase {
    pub fn new<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(Arc<Target>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            gate: CapabilityGate::none(),
            timeout: None,
            body: Box::new(move |target| body(target).boxed()),
        }
    }

    /// Skip the test on targets lacking any of `capabilities`
    pub fn requires<C: Into<Capability>>(
        mut self,
        capabilities: impl IntoIterator<Item = C>,
    ) -> Self {
        self.gate = CapabilityGate::new(capabilities);
        self
    }

    pub fn with_gate(mut self, gate: CapabilityGate) -> Self {
        self.gate = gate;
        self
    }

    /// Fail the test when its body runs longer than `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn gate(&self) -> &CapabilityGate {
        &self.gate
    }
}

/// How a single test ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TestOutcome {
    Passed,
    Failed { reason: String },
    /// The gate rejected the target; the body never ran
    Skipped { missing: Vec<Capability> },
    /// The target could not be provided or broke underneath the test
    EnvironmentError { reason: String },
}

/// Result of running a single test
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub name: String,
    #[serde(flatten)]
    pub outcome: TestOutcome,
    pub target: Option<TargetId>,
    pub duration_ms: u64,
}

/// Result of running all tests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteResult {
    pub name: String,
    pub scope: Scope,
    pub started_at: DateTime<Utc>,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub environment_errors: usize,
    pub duration_ms: u64,
    pub results: Vec<TestResult>,
    /// First error raised while tearing targets down after the run
    pub teardown_error: Option<String>,
}

impl SuiteResult {
    /// No test failed and the environment held up
    pub fn success(&self) -> bool {
        self.failed == 0 && self.environment_errors == 0 && self.teardown_error.is_none()
    }
}

/// An ordered collection of test cases
pub struct Suite {
    name: String,
    tests: Vec<TestCase>,
    preflight: Option<Preflight>,
}

impl Suite {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tests: Vec::new(),
            preflight: None,
        }
    }

    pub fn test(mut self, test: TestCase) -> Self {
        self.tests.push(test);
        self
    }

    pub fn push(&mut self, test: TestCase) {
        self.tests.push(test);
    }

    /// Run pre-test checks on every freshly constructed target
    pub fn with_preflight(mut self, preflight: Preflight) -> Self {
        self.preflight = Some(preflight);
        self
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    /// Run every test in order, then shut the manager down
    pub async fn run(&self, manager: &LifecycleManager) -> SuiteResult {
        let started_at = Utc::now();
        let start = Instant::now();
        let mut checked = HashSet::new();
        let mut results = Vec::with_capacity(self.tests.len());

        info!(
            "Running {} test(s) of {} with {} scope...",
            self.tests.len(),
            self.name,
            manager.scope()
        );

        for test in &self.tests {
            let result = self.run_test(test, manager, &mut checked).await;
            match &result.outcome {
                TestOutcome::Passed => info!("✓ {} ({} ms)", result.name, result.duration_ms),
                TestOutcome::Failed { reason } => error!("✗ {} - {}", result.name, reason),
                TestOutcome::Skipped { .. } => info!("- {} skipped", result.name),
                TestOutcome::EnvironmentError { reason } => {
                    error!("! {} - environment error: {}", result.name, reason)
                }
            }
            results.push(result);
        }

        let teardown_error = match manager.shutdown().await {
            Ok(()) => None,
            Err(e) => {
                error!("Teardown after {} failed: {}", self.name, e);
                Some(e.to_string())
            }
        };

        let count = |f: fn(&TestOutcome) -> bool| results.iter().filter(|r| f(&r.outcome)).count();
        let passed = count(|o| matches!(o, TestOutcome::Passed));
        let failed = count(|o| matches!(o, TestOutcome::Failed { .. }));
        let skipped = count(|o| matches!(o, TestOutcome::Skipped { .. }));
        let environment_errors = count(|o| matches!(o, TestOutcome::EnvironmentError { .. }));
        let duration_ms = start.elapsed().as_millis() as u64;

        info!(
            "Test Results: {} passed, {} failed, {} skipped, {} environment error(s) ({} ms)",
            passed, failed, skipped, environment_errors, duration_ms
        );

        SuiteResult {
            name: self.name.clone(),
            scope: manager.scope(),
            started_at,
            total: results.len(),
            passed,
            failed,
            skipped,
            environment_errors,
            duration_ms,
            results,
            teardown_error,
        }
    }

    async fn run_test(
        &self,
        test: &TestCase,
        manager: &LifecycleManager,
        checked: &mut HashSet<TargetId>,
    ) -> TestResult {
        let start = Instant::now();
        debug!("Running test: {}", test.name);

        let finish = |outcome: TestOutcome, target: Option<TargetId>| TestResult {
            name: test.name.clone(),
            outcome,
            target,
            duration_ms: start.elapsed().as_millis() as u64,
        };

        let target = match manager.acquire().await {
            Ok(target) => target,
            Err(e) => {
                return finish(
                    TestOutcome::EnvironmentError {
                        reason: e.to_string(),
                    },
                    None,
                )
            }
        };
        let id = target.id();

        if let GateDecision::Skip { missing } = test.gate.evaluate(&target) {
            release(manager, &target).await;
            return finish(TestOutcome::Skipped { missing }, Some(id));
        }

        if let Some(preflight) = &self.preflight {
            if checked.insert(id) {
                if let Err(e) = preflight.run(&target).await {
                    checked.remove(&id);
                    discard(manager, &target).await;
                    return finish(
                        TestOutcome::EnvironmentError {
                            reason: e.to_string(),
                        },
                        Some(id),
                    );
                }
            }
        }

        let outcome = match run_body(test, target.clone()).await {
            Ok(()) => TestOutcome::Passed,
            Err(e) if e.is_environment() => {
                discard(manager, &target).await;
                return finish(
                    TestOutcome::EnvironmentError {
                        reason: e.to_string(),
                    },
                    Some(id),
                );
            }
            Err(e) => TestOutcome::Failed {
                reason: e.to_string(),
            },
        };

        release(manager, &target).await;
        finish(outcome, Some(id))
    }
}

/// Run the body, turning panics and overruns into failures
async fn run_body(test: &TestCase, target: Arc<Target>) -> Result<()> {
    let body = AssertUnwindSafe((test.body)(target)).catch_unwind();
    let outcome = match test.timeout {
        Some(limit) => match tokio::time::timeout(limit, body).await {
            Ok(outcome) => outcome,
            Err(_) => return Err(Error::Timeout(limit)),
        },
        None => body.await,
    };

    outcome.unwrap_or_else(|panic| {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "test panicked".to_string());
        Err(Error::Internal(format!("panicked: {}", message)))
    })
}

async fn release(manager: &LifecycleManager, target: &Arc<Target>) {
    if let Err(e) = manager.release(target).await {
        warn!("Releasing {} failed: {}", target.name(), e);
    }
}

/// Drop a target that can no longer be trusted
async fn discard(manager: &LifecycleManager, target: &Arc<Target>) {
    let result = match manager.scope() {
        Scope::Session => manager.invalidate().await,
        Scope::PerTest => manager.release(target).await,
    };
    if let Err(e) = result {
        warn!("Discarding {} failed: {}", target.name(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use itf_common::TargetFactory;

    struct Plain;

    #[async_trait]
    impl TargetFactory for Plain {
        fn name(&self) -> &str {
            "plain"
        }

        async fn create(&self) -> Result<Target> {
            Target::builder("plain").with_capability("sensor_bus").build()
        }
    }

    fn manager() -> LifecycleManager {
        LifecycleManager::new(Scope::PerTest, Arc::new(Plain))
    }

    #[tokio::test]
    async fn test_outcomes_are_counted() {
        let suite = Suite::new("outcomes")
            .test(TestCase::new("passes", |_| async { Ok(()) }))
            .test(TestCase::new("fails", |_| async {
                Err(Error::Internal("expected 1, got 2".into()))
            }))
            .test(TestCase::new("needs ssh", |_| async { Ok(()) }).requires(["ssh"]))
            .test(TestCase::new("broken env", |_| async {
                Err(Error::environment("plain", "link down"))
            }));

        let result = suite.run(&manager()).await;

        assert_eq!(result.total, 4);
        assert_eq!(
            (result.passed, result.failed, result.skipped, result.environment_errors),
            (1, 1, 1, 1)
        );
        assert_eq!(
            result.results[2].outcome,
            TestOutcome::Skipped {
                missing: vec![Capability::from("ssh")]
            }
        );
        assert!(!result.success());
    }

    #[tokio::test]
    async fn test_panic_and_timeout_fail_the_test() {
        let suite = Suite::new("faults")
            .test(TestCase::new("panics", |_| async {
                assert_eq!(1 + 1, 3, "boom");
                Ok(())
            }))
            .test(
                TestCase::new("hangs", |_| async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                })
                .with_timeout(Duration::from_millis(50)),
            );

        let result = suite.run(&manager()).await;

        assert_eq!(result.failed, 2);
        match &result.results[0].outcome {
            TestOutcome::Failed { reason } => assert!(reason.contains("boom")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_result_serializes_flat() {
        let result = TestResult {
            name: "t".into(),
            outcome: TestOutcome::Skipped {
                missing: vec![Capability::from("ssh")],
            },
            target: None,
            duration_ms: 0,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["outcome"], "skipped");
        assert_eq!(json["missing"][0], "ssh");
    }
}
