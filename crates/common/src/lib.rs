//! ITF Common Library
//!
//! Capability-typed targets and their lifecycle: the registry of capability
//! names, the [`Target`] contract, the capability gate tests are guarded
//! with, the scope-aware [`LifecycleManager`], and bounded reachability
//! checks.

pub mod capability;
pub mod error;
pub mod gate;
pub mod lifecycle;
pub mod reachability;
pub mod session;
pub mod target;

// Re-export commonly used types
pub use capability::{Capability, CapabilitySet};
pub use error::{Error, Result};
pub use gate::{CapabilityGate, GateDecision};
pub use lifecycle::{LifecycleManager, Scope, TargetFactory};
pub use reachability::PollPolicy;
pub use session::{CommandOptions, CommandOutput, RemoteSession, SessionOptions};
pub use target::{
    Exec, ExecOutput, FileTransfer, Ping, Restart, SessionFactory, Target, TargetBuilder,
    TargetId, Teardown,
};

/// ITF version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
