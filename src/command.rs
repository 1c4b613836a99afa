//! Helpers for running the external tools the worker drives.

use crate::{MigrateError, Result, log_debug};
use std::path::Path;
use std::process::Output;
use tokio::process::Command;

const SECRET_KEYS: [&str; 3] = ["password=", "GOVC_PASSWORD=", "token="];

/// Mask `key=value` secrets before a command line reaches the logs.
pub fn redact(arg: &str) -> String {
    for key in SECRET_KEYS {
        if let Some(rest) = arg.strip_prefix(key) {
            if rest.starts_with('+') {
                return arg.to_string();
            }
            return format!("{}****", key);
        }
    }
    arg.to_string()
}

pub fn describe(cmd: &Command) -> String {
    let std_cmd = cmd.as_std();
    let mut parts = vec![std_cmd.get_program().to_string_lossy().into_owned()];
    parts.extend(
        std_cmd
            .get_args()
            .map(|arg| redact(&arg.to_string_lossy())),
    );
    parts.join(" ")
}

/// Run to completion; a non-zero exit becomes `CommandFailed`.
pub async fn run_checked(cmd: &mut Command) -> Result<Output> {
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    log_debug!("Running: {}", describe(cmd));

    let output = cmd.output().await.map_err(|e| {
        MigrateError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to launch '{}': {}", program, e),
        ))
    })?;

    if !output.status.success() {
        return Err(MigrateError::CommandFailed {
            program,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output)
}

pub async fn stdout_of(cmd: &mut Command) -> Result<String> {
    let output = run_checked(cmd).await?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// True when `program` is an existing path or resolves on `PATH`.
pub fn tool_available(program: &str) -> bool {
    if program.contains('/') {
        return Path::new(program).is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
        .unwrap_or(false)
}
