//! Configured command lines run through `tokio::process`.

use std::io;
use std::process::{Output, Stdio};

use tokio::process::Command;
use tracing::debug;

/// Replaces `{key}` placeholders in every argument.
pub(crate) fn expand(template: &[String], vars: &[(&str, &str)]) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            vars.iter().fold(arg.clone(), |acc, (key, value)| {
                acc.replace(&format!("{{{}}}", key), value)
            })
        })
        .collect()
}

/// Runs `argv` to completion, capturing its output.
pub(crate) async fn run(argv: &[String], env: &[(&str, &str)]) -> io::Result<Output> {
    let Some((program, args)) = argv.split_first() else {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty command line"));
    };
    debug!("running {} {:?}", program, args);

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in env {
        command.env(key, value);
    }
    command.output().await
}

/// One-line summary of a failed command for error messages.
pub(crate) fn describe_failure(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        format!("exited with {}", output.status)
    } else {
        format!("exited with {}: {}", output.status, stderr.lines().last().unwrap_or(stderr))
    }
}
