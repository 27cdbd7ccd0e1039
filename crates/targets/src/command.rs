//! Running host-side CLI tools (`docker`, `ssh`, `scp`, ...)

use std::ffi::OsStr;
use std::fmt::Write as _;
use std::process::{Output, Stdio};
use tokio::process::Command;
use tracing::trace;

use itf_common::{Error, Result};

/// Human-readable command line for diagnostics
pub(crate) fn display<S: AsRef<OsStr>>(program: impl AsRef<OsStr>, args: &[S]) -> String {
    let mut line = program.as_ref().to_string_lossy().into_owned();
    for arg in args {
        let _ = write!(line, " {}", arg.as_ref().to_string_lossy());
    }
    line
}

/// Run to completion and collect its output
pub(crate) async fn output<S: AsRef<OsStr>>(
    program: impl AsRef<OsStr>,
    args: &[S],
) -> Result<Output> {
    let line = display(&program, args);
    trace!("Running {}", line);
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| Error::CommandFailed {
            command: line,
            reason: e.to_string(),
        })
}

/// Run to completion, failing on a non-zero exit status; returns trimmed stdout
pub(crate) async fn checked<S: AsRef<OsStr>>(
    program: impl AsRef<OsStr>,
    args: &[S],
) -> Result<String> {
    let out = output(&program, args).await?;
    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        return Err(Error::CommandFailed {
            command: display(&program, args),
            reason: format!("{} ({})", stderr.trim(), out.status),
        });
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

/// Quote `s` for a POSIX shell
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./=:,@%+".contains(&b))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("plain", "plain" ; "safe word")]
    #[test_case("", "''" ; "empty")]
    #[test_case("two words", "'two words'" ; "space")]
    #[test_case("it's", r"'it'\''s'" ; "single quote")]
    #[test_case("$HOME", "'$HOME'" ; "variable")]
    fn test_shell_quote(input: &str, expected: &str) {
        assert_eq!(shell_quote(input), expected);
    }

    #[tokio::test]
    async fn test_checked_reports_failure() {
        assert_eq!(checked("sh", &["-c", "echo hi"]).await.unwrap(), "hi");

        let err = checked("sh", &["-c", "echo boom >&2; exit 3"]).await.unwrap_err();
        match err {
            Error::CommandFailed { command, reason } => {
                assert!(command.starts_with("sh -c"));
                assert!(reason.contains("boom"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_program_is_command_failure() {
        let err = output("/nonexistent/tool", &["x"]).await.unwrap_err();
        assert!(matches!(err, Error::CommandFailed { .. }));
    }
}
