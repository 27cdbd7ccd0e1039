//! Remote sessions over the OpenSSH client
//!
//! Every command runs through the system `ssh` binary. With multiplexing
//! enabled a session keeps one master connection alive (`ControlMaster`)
//! and individual commands reuse it.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use crate::command::{self, shell_quote};
use itf_common::session::{LineSplitter, EXIT_TIMED_OUT};
use itf_common::{
    CommandOptions, CommandOutput, Error, FileTransfer, RemoteSession, Result, SessionFactory,
    SessionOptions,
};

/// Exit status the OpenSSH client reserves for its own errors
const SSH_ERROR_EXIT: i32 = 255;
const READ_CHUNK: usize = 32 * 1024;

/// Wrap `command` so the remote login profile is sourced first
///
/// With `merge_stderr` the remote shell redirects stderr into stdout.
pub fn remote_command(command: &str, merge_stderr: bool) -> String {
    let redirect = if merge_stderr { "exec 2>&1; " } else { "" };
    let inner = format!(
        "[ -r /etc/profile ] && . /etc/profile >/dev/null 2>&1; {}{}",
        redirect, command
    );
    format!("sh -lc {}", shell_quote(&inner))
}

/// Where and how to reach an SSH server
#[derive(Debug, Clone)]
pub struct SshEndpoint {
    pub host: String,
    pub port: u16,
    pub ssh_binary: PathBuf,
    pub scp_binary: PathBuf,
    /// Keep a master connection per session
    pub multiplex: bool,
    /// Login name used instead of the session options' one
    pub user: Option<String>,
    /// Key used when the session options carry none
    pub identity: Option<PathBuf>,
}

impl SshEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ssh_binary: PathBuf::from("ssh"),
            scp_binary: PathBuf::from("scp"),
            multiplex: true,
            user: None,
            identity: None,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_identity(mut self, identity: impl Into<PathBuf>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    fn user<'a>(&'a self, options: &'a SessionOptions) -> &'a str {
        self.user.as_deref().unwrap_or(&options.username)
    }

    pub fn with_ssh_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.ssh_binary = binary.into();
        self
    }

    pub fn with_scp_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.scp_binary = binary.into();
        self
    }

    pub fn without_multiplexing(mut self) -> Self {
        self.multiplex = false;
        self
    }

    fn destination(&self, options: &SessionOptions) -> String {
        format!("{}@{}", self.user(options), self.host)
    }

    /// `user@host:path` as scp expects it, bracketing IPv6 literals
    fn scp_location(&self, options: &SessionOptions, path: &str) -> String {
        if self.host.contains(':') {
            format!("{}@[{}]:{}", self.user(options), self.host, path)
        } else {
            format!("{}@{}:{}", self.user(options), self.host, path)
        }
    }

    /// Options shared by `ssh` and `scp`
    fn common_options(&self, options: &SessionOptions, control_path: Option<&Path>) -> Vec<String> {
        let mut args = Vec::new();
        for opt in [
            "BatchMode=yes".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "LogLevel=ERROR".to_string(),
            format!("ConnectTimeout={}", options.connect_timeout.as_secs().max(1)),
        ] {
            args.push("-o".to_string());
            args.push(opt);
        }
        if let Some(identity) = options.identity.as_ref().or(self.identity.as_ref()) {
            args.extend(["-i".to_string(), identity.display().to_string()]);
            args.extend(["-o".to_string(), "IdentitiesOnly=yes".to_string()]);
        }
        if let Some(path) = control_path {
            args.extend(["-o".to_string(), format!("ControlPath={}", path.display())]);
        }
        args
    }

    /// Arguments for running `remote` with `ssh`
    pub fn ssh_args(
        &self,
        options: &SessionOptions,
        control_path: Option<&Path>,
        remote: &str,
    ) -> Vec<String> {
        let port = options.port.unwrap_or(self.port);
        let mut args = vec!["-p".to_string(), port.to_string(), "-T".to_string()];
        args.extend(self.common_options(options, control_path));
        args.push(self.destination(options));
        args.push(remote.to_string());
        args
    }
}

/// Opens [`OpenSshSession`]s against one endpoint
#[derive(Debug, Clone)]
pub struct SshSessionFactory {
    endpoint: SshEndpoint,
}

impl SshSessionFactory {
    pub fn new(endpoint: SshEndpoint) -> Self {
        Self { endpoint }
    }

    pub fn endpoint(&self) -> &SshEndpoint {
        &self.endpoint
    }

    /// Connect, retrying on connection failures
    pub async fn connect(&self, options: &SessionOptions) -> Result<OpenSshSession> {
        let control_dir = if self.endpoint.multiplex {
            Some(tempfile::Builder::new().prefix("itf-ssh-").tempdir()?)
        } else {
            None
        };
        let control_path = control_dir.as_ref().map(|d| d.path().join("master"));

        info!("Connecting to {} ...", self.endpoint.host);
        let attempts = options.retries.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let mut args = self.endpoint.ssh_args(options, control_path.as_deref(), "true");
            if control_path.is_some() {
                // The first connection becomes the master and lingers in the background
                args.splice(0..0, ["-o".to_string(), "ControlMaster=auto".to_string()]);
                args.splice(0..0, ["-o".to_string(), "ControlPersist=60".to_string()]);
            }

            // No pipes: a backgrounded master would hold them open
            let status = Command::new(&self.endpoint.ssh_binary)
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
            let bound = options.connect_timeout + Duration::from_secs(5);

            match timeout(bound, status).await {
                Ok(Ok(status)) if status.code() != Some(SSH_ERROR_EXIT) => {
                    info!("SSH connection to {} established", self.endpoint.host);
                    return Ok(OpenSshSession {
                        endpoint: self.endpoint.clone(),
                        options: options.clone(),
                        control_path,
                        _control_dir: control_dir,
                    });
                }
                Ok(Ok(status)) => last_error = format!("ssh exited with {}", status),
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = format!("no answer within {:?}", bound),
            }

            debug!(
                "SSH connection to {} failed (attempt {}/{}): {}",
                self.endpoint.host, attempt, attempts, last_error
            );
            if attempt < attempts {
                sleep(options.retry_interval).await;
            }
        }

        Err(Error::Connection(format!(
            "SSH connection to {}:{} failed after {} attempt(s): {}",
            self.endpoint.host,
            options.port.unwrap_or(self.endpoint.port),
            attempts,
            last_error
        )))
    }
}

#[async_trait]
impl SessionFactory for SshSessionFactory {
    async fn open_session(&self, options: &SessionOptions) -> Result<Box<dyn RemoteSession>> {
        Ok(Box::new(self.connect(options).await?))
    }
}

/// Session backed by the `ssh` client
pub struct OpenSshSession {
    endpoint: SshEndpoint,
    options: SessionOptions,
    control_path: Option<PathBuf>,
    /// Removed, with the master socket, when the session goes away
    _control_dir: Option<TempDir>,
}

impl OpenSshSession {
    pub fn endpoint(&self) -> &SshEndpoint {
        &self.endpoint
    }
}

#[async_trait]
impl RemoteSession for OpenSshSession {
    async fn execute_command_output(
        &mut self,
        command: &str,
        options: &CommandOptions,
    ) -> Result<CommandOutput> {
        debug!("Executing command: {}", command);
        let remote = remote_command(command, !options.separate_stderr);
        let mut session_options = self.options.clone();
        session_options.connect_timeout = options.start_timeout;
        let args = self
            .endpoint
            .ssh_args(&session_options, self.control_path.as_deref(), &remote);

        let mut child = Command::new(&self.endpoint.ssh_binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::CommandFailed {
                command: command.to_string(),
                reason: format!("failed to spawn {}: {}", self.endpoint.ssh_binary.display(), e),
            })?;

        let (Some(mut stdout), Some(mut stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(Error::Internal("ssh output pipes missing".into()));
        };

        let deadline = Instant::now() + options.max_exec_time;
        let mut out = LineSplitter::default();
        let mut err = LineSplitter::default();
        let mut stdout_lines = Vec::new();
        let mut stderr_lines = Vec::new();
        let mut out_buf = vec![0u8; READ_CHUNK];
        let mut err_buf = vec![0u8; READ_CHUNK];
        let (mut out_open, mut err_open) = (true, true);
        let mut timed_out = false;

        while out_open || err_open {
            tokio::select! {
                _ = sleep_until(deadline) => {
                    timed_out = true;
                    break;
                }
                read = stdout.read(&mut out_buf), if out_open => match read {
                    Ok(0) | Err(_) => out_open = false,
                    Ok(n) => {
                        let lines = out.push(&out_buf[..n]);
                        if options.verbose {
                            lines.iter().for_each(|l| info!("{}", l.trim_end_matches('\n')));
                        }
                        stdout_lines.extend(lines);
                    }
                },
                read = stderr.read(&mut err_buf), if err_open => match read {
                    Ok(0) | Err(_) => err_open = false,
                    Ok(n) => {
                        let lines = err.push(&err_buf[..n]);
                        if options.verbose {
                            lines.iter().for_each(|l| info!("{}", l.trim_end_matches('\n')));
                        }
                        stderr_lines.extend(lines);
                    }
                },
            }
        }
        stdout_lines.extend(out.finish());
        stderr_lines.extend(err.finish());

        if timed_out {
            warn!(
                "Command '{}' did not finish within {:?}",
                command, options.max_exec_time
            );
            let _ = child.start_kill();
            let _ = timeout(Duration::from_secs(1), child.wait()).await;
            if !options.separate_stderr {
                stderr_lines.clear();
            }
            return Ok(CommandOutput {
                exit_code: EXIT_TIMED_OUT,
                stdout_lines,
                stderr_lines,
            });
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let status = match timeout(remaining, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                let _ = child.start_kill();
                return Ok(CommandOutput {
                    exit_code: EXIT_TIMED_OUT,
                    stdout_lines,
                    stderr_lines: if options.separate_stderr { stderr_lines } else { Vec::new() },
                });
            }
        };

        let exit_code = status.code().unwrap_or(EXIT_TIMED_OUT);
        if exit_code == SSH_ERROR_EXIT {
            return Err(Error::Connection(format!(
                "ssh to {} failed: {}",
                self.endpoint.host,
                stderr_lines.concat().trim()
            )));
        }

        if !options.separate_stderr {
            // Only the client's own diagnostics remain on stderr
            for line in stderr_lines.drain(..) {
                debug!("ssh: {}", line.trim_end());
            }
        }

        Ok(CommandOutput {
            exit_code,
            stdout_lines,
            stderr_lines,
        })
    }

    async fn close(self: Box<Self>) -> Result<()> {
        if let Some(path) = &self.control_path {
            let mut args = vec![
                "-o".to_string(),
                format!("ControlPath={}", path.display()),
                "-O".to_string(),
                "exit".to_string(),
            ];
            args.push(self.endpoint.destination(&self.options));
            if let Err(e) = command::checked(&self.endpoint.ssh_binary, &args).await {
                debug!("Closing SSH master failed: {}", e);
            }
        }
        info!("Closed SSH connection.");
        Ok(())
    }
}

/// File transfer over `scp`
#[derive(Debug, Clone)]
pub struct ScpTransfer {
    endpoint: SshEndpoint,
    options: SessionOptions,
}

impl ScpTransfer {
    pub fn new(endpoint: SshEndpoint, options: SessionOptions) -> Self {
        Self { endpoint, options }
    }

    fn args(&self, from: String, to: String) -> Vec<String> {
        let port = self.options.port.unwrap_or(self.endpoint.port);
        let mut args = vec!["-P".to_string(), port.to_string(), "-q".to_string()];
        args.extend(self.endpoint.common_options(&self.options, None));
        args.push(from);
        args.push(to);
        args
    }
}

#[async_trait]
impl FileTransfer for ScpTransfer {
    async fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        if !local.is_file() {
            return Err(Error::NotFound(local.display().to_string()));
        }
        let args = self.args(
            local.display().to_string(),
            self.endpoint.scp_location(&self.options, remote),
        );
        command::checked(&self.endpoint.scp_binary, &args).await?;
        debug!("Uploaded {} to {}", local.display(), remote);
        Ok(())
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<()> {
        if let Some(parent) = local.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let args = self.args(
            self.endpoint.scp_location(&self.options, remote),
            local.display().to_string(),
        );
        command::checked(&self.endpoint.scp_binary, &args).await?;
        debug!("Downloaded {} to {}", remote, local.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_command_sources_profile() {
        assert_eq!(
            remote_command("echo hi", false),
            r"sh -lc '[ -r /etc/profile ] && . /etc/profile >/dev/null 2>&1; echo hi'"
        );
        assert!(remote_command("echo hi", true).contains("exec 2>&1; echo hi"));
        assert!(remote_command("echo 'x'", false).contains(r"echo '\''x'\''"));
    }

    #[test]
    fn test_ssh_args() {
        let endpoint = SshEndpoint::new("10.0.0.5", 22);
        let options = SessionOptions {
            port: Some(2222),
            identity: Some(PathBuf::from("/keys/id")),
            ..Default::default()
        };
        let args = endpoint.ssh_args(&options, None, "true");

        assert_eq!(&args[..3], ["-p", "2222", "-T"]);
        assert!(args.contains(&"ConnectTimeout=15".to_string()));
        assert!(args.windows(2).any(|w| w == ["-i", "/keys/id"]));
        assert_eq!(args[args.len() - 2], "root@10.0.0.5");
        assert_eq!(args[args.len() - 1], "true");
    }

    #[test]
    fn test_scp_location_brackets_ipv6() {
        let options = SessionOptions::default();
        assert_eq!(
            SshEndpoint::new("fe80::1", 22).scp_location(&options, "/tmp/x"),
            "root@[fe80::1]:/tmp/x"
        );
        assert_eq!(
            SshEndpoint::new("10.0.0.5", 22).scp_location(&options, "/tmp/x"),
            "root@10.0.0.5:/tmp/x"
        );
    }

    #[tokio::test]
    async fn test_upload_of_missing_file_is_not_found() {
        let transfer =
            ScpTransfer::new(SshEndpoint::new("127.0.0.1", 22), SessionOptions::default());
        let err = transfer
            .upload(Path::new("/nonexistent/file"), "/tmp/file")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
