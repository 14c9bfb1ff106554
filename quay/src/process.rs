//! Helpers for executing external processes, used by the git source.

use std::process::{Command, Stdio};

use anyhow::{Context, Result, bail};
use tracing::debug;

/// Runs a command to completion, returning its standard output as a string.
/// A non-zero exit status is an error carrying the command's stderr.
pub fn exec(cmd: &mut Command) -> Result<String> {
    let cmd_display = format!(
        "{} {}",
        cmd.get_program().to_string_lossy(),
        cmd.get_args()
            .map(|arg| arg.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    );
    debug!("exec: {cmd_display}");

    let output = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .with_context(|| format!("failed to spawn: {cmd_display}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "command failed with {}: {cmd_display}\n{}",
            output.status,
            stderr.trim()
        );
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use std::process::Command;

    use super::exec;

    #[test]
    fn captures_stdout() {
        let output = exec(Command::new("echo").arg("hello")).unwrap();
        assert_eq!(output.trim(), "hello");
    }

    #[test]
    fn failure_carries_status() {
        let err = exec(&mut Command::new("false")).unwrap_err();
        assert!(err.to_string().contains("command failed"));
    }
}
