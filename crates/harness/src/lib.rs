//! ITF test harness
//!
//! Runs capability-gated test cases against targets supplied by a
//! [`itf_common::LifecycleManager`], with optional pre-test environment
//! checks and a TOML run configuration.

pub mod config;
pub mod preflight;
pub mod runner;

pub use config::{Backend, QemuSection, RunConfig, SCOPE_ENV};
pub use preflight::Preflight;
pub use runner::{Suite, SuiteResult, TestCase, TestOutcome, TestResult};
