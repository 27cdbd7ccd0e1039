//! Environment checks run on a fresh target before its first test
//!
//! A check runs only when the target declares the matching capability.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

use itf_common::capability;
use itf_common::{Error, PollPolicy, Result, SessionOptions, Target};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Preflight {
    /// How long the target gets to answer ping
    pub ping_timeout: Duration,

    /// Connection settings for the SSH check
    pub ssh: SessionOptions,

    /// Command the SSH check runs; must exit 0
    pub ssh_command: String,
}

impl Default for Preflight {
    fn default() -> Self {
        Self {
            ping_timeout: Duration::from_secs(10),
            ssh: SessionOptions {
                connect_timeout: Duration::from_secs(5),
                retries: 5,
                retry_interval: Duration::from_secs(2),
                ..Default::default()
            },
            ssh_command: "echo Qnx_S-core!".to_string(),
        }
    }
}

impl Preflight {
    /// Run every applicable check; the first failure is an environment error
    pub async fn run(&self, target: &Target) -> Result<()> {
        if target.has_capability(&capability::PING) {
            self.check_ping(target).await?;
        }
        if target.has_capability(&capability::SSH) {
            self.check_ssh(target).await?;
        }
        Ok(())
    }

    async fn check_ping(&self, target: &Target) -> Result<()> {
        target
            .ping(PollPolicy::with_timeout(self.ping_timeout))
            .await
            .map_err(|e| {
                Error::environment(
                    target.name(),
                    format!("target is not pingable within expected time frame: {}", e),
                )
            })?;
        info!("Check target ping: OK");
        Ok(())
    }

    async fn check_ssh(&self, target: &Target) -> Result<()> {
        let command = self.ssh_command.clone();
        let exit_code = target
            .with_session(&self.ssh, move |session| {
                Box::pin(async move { session.execute_command(&command).await })
            })
            .await
            .map_err(|e| Error::environment(target.name(), format!("SSH check failed: {}", e)))?;

        if exit_code != 0 {
            return Err(Error::environment(
                target.name(),
                format!("running SSH command on the target failed with exit code {}", exit_code),
            ));
        }
        info!("Check target ssh: OK");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use itf_common::{CommandOptions, CommandOutput, Ping, RemoteSession, SessionFactory};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct FixedExit(i32);

    #[async_trait]
    impl RemoteSession for FixedExit {
        async fn execute_command_output(
            &mut self,
            _command: &str,
            _options: &CommandOptions,
        ) -> Result<CommandOutput> {
            Ok(CommandOutput {
                exit_code: self.0,
                ..Default::default()
            })
        }

        async fn close(self: Box<Self>) -> Result<()> {
            Ok(())
        }
    }

    struct Sessions(i32);

    #[async_trait]
    impl SessionFactory for Sessions {
        async fn open_session(&self, _options: &SessionOptions) -> Result<Box<dyn RemoteSession>> {
            Ok(Box::new(FixedExit(self.0)))
        }
    }

    #[derive(Default)]
    struct CountingPing(AtomicU32);

    #[async_trait]
    impl Ping for CountingPing {
        async fn ping(&self, _policy: PollPolicy) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn ping_lost(&self, _policy: PollPolicy) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_checks_follow_capabilities() {
        let ping = Arc::new(CountingPing::default());
        let target = Target::builder("guest")
            .with_ping(ping.clone())
            .with_sessions(Arc::new(Sessions(0)))
            .build()
            .unwrap();

        Preflight::default().run(&target).await.unwrap();
        assert_eq!(ping.0.load(Ordering::SeqCst), 1);

        // Nothing to check
        let bare = Target::builder("bare").build().unwrap();
        Preflight::default().run(&bare).await.unwrap();
    }

    #[tokio::test]
    async fn test_failing_ssh_command_is_environment_error() {
        let target = Target::builder("guest")
            .with_sessions(Arc::new(Sessions(1)))
            .build()
            .unwrap();

        let err = Preflight::default().run(&target).await.unwrap_err();
        assert!(err.is_environment());
    }
}
