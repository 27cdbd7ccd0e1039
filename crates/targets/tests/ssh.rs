//! Session behaviour against a stand-in `ssh` that runs commands locally
#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use itf_common::{CommandOptions, Error, RemoteSession, SessionOptions};
use itf_targets::ssh::{SshEndpoint, SshSessionFactory};
use tempfile::TempDir;

/// Write an executable script that runs its last argument with `sh -c`
fn fake_ssh(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("ssh");
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

const RUN_LAST_ARG: &str = r#"for last; do :; done
exec sh -c "$last""#;

fn fast_options() -> SessionOptions {
    SessionOptions {
        retries: 2,
        retry_interval: Duration::from_millis(10),
        connect_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn open(dir: &TempDir) -> Box<dyn RemoteSession> {
    init_logging();
    let ssh = fake_ssh(dir.path(), RUN_LAST_ARG);
    let endpoint = SshEndpoint::new("127.0.0.1", 22)
        .with_ssh_binary(ssh)
        .without_multiplexing();
    Box::new(
        SshSessionFactory::new(endpoint)
            .connect(&fast_options())
            .await
            .unwrap(),
    )
}

fn quiet() -> CommandOptions {
    CommandOptions {
        verbose: false,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_separate_stderr() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = open(&dir).await;

    let output = session
        .execute_command_output("echo out; echo err 1>&2; exit 7", &quiet())
        .await
        .unwrap();

    assert_eq!(output.exit_code, 7);
    assert_eq!(output.stdout_lines, vec!["out\n"]);
    assert_eq!(output.stderr_lines, vec!["err\n"]);
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_merged_stderr() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = open(&dir).await;
    let options = CommandOptions {
        separate_stderr: false,
        ..quiet()
    };

    let output = session
        .execute_command_output("echo out; echo err 1>&2; exit 7", &options)
        .await
        .unwrap();

    assert_eq!(output.exit_code, 7);
    assert_eq!(output.stdout_lines, vec!["out\n", "err\n"]);
    assert!(output.stderr_lines.is_empty());
}

#[tokio::test]
async fn test_lines_keep_newlines() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = open(&dir).await;

    let output = session
        .execute_command_output(r"printf 'a\nb\n'", &quiet())
        .await
        .unwrap();
    assert_eq!(output.stdout_lines, vec!["a\n", "b\n"]);
    assert_eq!(session.execute_command("exit 3").await.unwrap(), 3);
}

#[tokio::test]
async fn test_deadline_yields_minus_one() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = open(&dir).await;
    let options = CommandOptions {
        max_exec_time: Duration::from_secs(1),
        ..quiet()
    };

    let output = session
        .execute_command_output("sleep 2; echo done", &options)
        .await
        .unwrap();

    assert_eq!(output.exit_code, -1);
    assert!(output.timed_out());
    assert!(output.stdout_lines.is_empty());
}

#[tokio::test]
async fn test_large_output_is_complete() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = open(&dir).await;

    let output = session
        .execute_command_output("seq 1 100000", &quiet())
        .await
        .unwrap();

    assert_eq!(output.exit_code, 0);
    assert_eq!(output.stdout_lines.len(), 100_000);
    assert!(output.stdout().len() > 300_000);
    assert_eq!(output.stdout_lines.last().unwrap(), "100000\n");
}

#[tokio::test]
async fn test_unreachable_host_is_connection_error() {
    let dir = tempfile::tempdir().unwrap();
    let ssh = fake_ssh(dir.path(), "exit 255");
    let endpoint = SshEndpoint::new("127.0.0.1", 22)
        .with_ssh_binary(ssh)
        .without_multiplexing();

    let err = SshSessionFactory::new(endpoint)
        .connect(&fast_options())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::Connection(ref msg) if msg.contains("2 attempt")));
}
