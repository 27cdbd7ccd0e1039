//! Targets: one addressable test environment
//!
//! A [`Target`] is a fixed capability set plus a table of operations keyed by
//! capability. Backends compose a target through [`TargetBuilder`]; callers
//! dispatch on capability presence, never on the backend's concrete type.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::capability::{self, Capability, CapabilitySet};
use crate::reachability::PollPolicy;
use crate::session::{RemoteSession, SessionOptions};
use crate::{Error, Result};

/// Unique identity of a constructed target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetId(Uuid);

impl TargetId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TargetId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of a command run through [`Exec`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub output: Vec<u8>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn output_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.output)
    }
}

/// `exec`: run a command, capturing exit code and output
#[async_trait]
pub trait Exec: Send + Sync {
    async fn execute(&self, command: &str) -> Result<ExecOutput>;
}

/// `file_transfer` / `sftp`: copy files between host and target
#[async_trait]
pub trait FileTransfer: Send + Sync {
    async fn upload(&self, local: &Path, remote: &str) -> Result<()>;
    async fn download(&self, remote: &str, local: &Path) -> Result<()>;
}

/// `restart`: restart the target environment
#[async_trait]
pub trait Restart: Send + Sync {
    async fn restart(&self) -> Result<()>;
}

/// `ssh`: factory for scoped remote sessions
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open_session(&self, options: &SessionOptions) -> Result<Box<dyn RemoteSession>>;
}

/// `ping`: bounded reachability checks
#[async_trait]
pub trait Ping: Send + Sync {
    async fn ping(&self, policy: PollPolicy) -> Result<()>;
    async fn ping_lost(&self, policy: PollPolicy) -> Result<()>;
}

/// Releases backend connection state when the target is torn down
#[async_trait]
pub trait Teardown: Send + Sync {
    async fn teardown(&self) -> Result<()>;
}

#[derive(Default, Clone)]
struct Operations {
    exec: Option<Arc<dyn Exec>>,
    file_transfer: Option<Arc<dyn FileTransfer>>,
    restart: Option<Arc<dyn Restart>>,
    sessions: Option<Arc<dyn SessionFactory>>,
    ping: Option<Arc<dyn Ping>>,
}

/// A test environment with a frozen capability set
pub struct Target {
    id: TargetId,
    name: String,
    capabilities: CapabilitySet,
    ops: Operations,
    teardown: Option<Arc<dyn Teardown>>,
    torn_down: AtomicBool,
}

impl Target {
    pub fn builder(name: impl Into<String>) -> TargetBuilder {
        TargetBuilder::new(name)
    }

    pub fn id(&self) -> TargetId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    pub fn has_capability(&self, capability: &Capability) -> bool {
        self.capabilities.contains(capability)
    }

    pub fn has_all_capabilities(&self, capabilities: &CapabilitySet) -> bool {
        capabilities.is_subset(&self.capabilities)
    }

    pub fn has_any_capability(&self, capabilities: &CapabilitySet) -> bool {
        capabilities.intersects(&self.capabilities)
    }

    fn op<'a, T: ?Sized>(&self, op: &'a Option<Arc<T>>, capability: Capability) -> Result<&'a T> {
        match op {
            Some(op) if self.has_capability(&capability) => Ok(&**op),
            _ => Err(Error::Unsupported { capability }),
        }
    }

    pub fn exec(&self) -> Result<&dyn Exec> {
        self.op(&self.ops.exec, capability::EXEC)
    }

    pub fn file_transfer(&self) -> Result<&dyn FileTransfer> {
        self.op(&self.ops.file_transfer, capability::FILE_TRANSFER)
    }

    pub fn restarter(&self) -> Result<&dyn Restart> {
        self.op(&self.ops.restart, capability::RESTART)
    }

    pub fn sessions(&self) -> Result<&dyn SessionFactory> {
        self.op(&self.ops.sessions, capability::SSH)
    }

    pub fn pinger(&self) -> Result<&dyn Ping> {
        self.op(&self.ops.ping, capability::PING)
    }

    /// Execute a command on the target
    pub async fn execute(&self, command: &str) -> Result<ExecOutput> {
        debug!("[{}] exec: {}", self.name, command);
        self.exec()?.execute(command).await
    }

    /// Upload a file from the test host to the target
    pub async fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        self.file_transfer()?.upload(local, remote).await
    }

    /// Download a file from the target to the test host
    pub async fn download(&self, remote: &str, local: &Path) -> Result<()> {
        self.file_transfer()?.download(remote, local).await
    }

    /// Restart the target environment
    pub async fn restart(&self) -> Result<()> {
        info!("Restarting target {}", self.name);
        self.restarter()?.restart().await
    }

    pub async fn open_session(&self, options: &SessionOptions) -> Result<Box<dyn RemoteSession>> {
        self.sessions()?.open_session(options).await
    }

    /// Run `body` inside a remote session that is closed on every exit path
    pub async fn with_session<T, F>(&self, options: &SessionOptions, body: F) -> Result<T>
    where
        T: Send,
        F: for<'s> FnOnce(&'s mut dyn RemoteSession) -> BoxFuture<'s, Result<T>> + Send,
    {
        let mut session = self.open_session(options).await?;
        let result = body(session.as_mut()).await;
        let closed = session.close().await;
        let value = result?;
        closed?;
        Ok(value)
    }

    pub async fn ping(&self, policy: PollPolicy) -> Result<()> {
        self.pinger()?.ping(policy).await
    }

    pub async fn ping_lost(&self, policy: PollPolicy) -> Result<()> {
        self.pinger()?.ping_lost(policy).await
    }

    /// Release backend state; later calls are no-ops
    pub async fn teardown(&self) -> Result<()> {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("Tearing down target {} ({})", self.name, self.id);
        match &self.teardown {
            Some(hook) => hook
                .teardown()
                .await
                .map_err(|e| Error::environment(&self.name, e)),
            None => Ok(()),
        }
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("capabilities", &self.capabilities)
            .field("torn_down", &self.is_torn_down())
            .finish()
    }
}

/// Composes a [`Target`] from operations
///
/// Registering an operation declares the capability it implements, so a
/// declared well-known capability always has an implementation.
pub struct TargetBuilder {
    name: String,
    capabilities: CapabilitySet,
    ops: Operations,
    teardown: Option<Arc<dyn Teardown>>,
}

impl TargetBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capabilities: CapabilitySet::new(),
            ops: Operations::default(),
            teardown: None,
        }
    }

    pub fn with_exec<E: Exec + 'static>(mut self, exec: Arc<E>) -> Self {
        self.ops.exec = Some(exec);
        self.capabilities.insert(capability::EXEC);
        self
    }

    pub fn with_file_transfer<F: FileTransfer + 'static>(mut self, transfer: Arc<F>) -> Self {
        self.ops.file_transfer = Some(transfer);
        self.capabilities.insert(capability::FILE_TRANSFER);
        self
    }

    /// File transfer carried over SFTP; declares both `sftp` and `file_transfer`
    pub fn with_sftp<F: FileTransfer + 'static>(mut self, transfer: Arc<F>) -> Self {
        self = self.with_file_transfer(transfer);
        self.capabilities.insert(capability::SFTP);
        self
    }

    pub fn with_restart<R: Restart + 'static>(mut self, restart: Arc<R>) -> Self {
        self.ops.restart = Some(restart);
        self.capabilities.insert(capability::RESTART);
        self
    }

    pub fn with_sessions<S: SessionFactory + 'static>(mut self, sessions: Arc<S>) -> Self {
        self.ops.sessions = Some(sessions);
        self.capabilities.insert(capability::SSH);
        self
    }

    pub fn with_ping<P: Ping + 'static>(mut self, ping: Arc<P>) -> Self {
        self.ops.ping = Some(ping);
        self.capabilities.insert(capability::PING);
        self
    }

    /// Declare a capability that has no operation in the table
    pub fn with_capability(mut self, capability: impl Into<Capability>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn on_teardown<T: Teardown + 'static>(mut self, hook: Arc<T>) -> Self {
        self.teardown = Some(hook);
        self
    }

    pub fn build(self) -> Result<Target> {
        let missing_op = |cap: &Capability| match cap.as_str() {
            "exec" => self.ops.exec.is_none(),
            "file_transfer" | "sftp" => self.ops.file_transfer.is_none(),
            "restart" => self.ops.restart.is_none(),
            "ssh" => self.ops.sessions.is_none(),
            "ping" => self.ops.ping.is_none(),
            _ => false,
        };

        if let Some(cap) = self.capabilities.iter().find(|&c| missing_op(c)) {
            return Err(Error::InvalidConfig(format!(
                "target {} declares '{}' without an implementation",
                self.name, cap
            )));
        }

        Ok(Target {
            id: TargetId::new(),
            name: self.name,
            capabilities: self.capabilities,
            ops: self.ops,
            teardown: self.teardown,
            torn_down: AtomicBool::new(false),
        })
    }
}
