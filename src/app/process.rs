//! OS process plumbing: launching in a fresh process group, signalling the
//! group, file descriptor limits and one-shot shell commands.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::process::{Output, Stdio};

use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::config::AppConfig;
use crate::errors::AppError;

/// Launch `command_line` through `sh -c` as the leader of a new process group.
///
/// stdin is `/dev/null`; stdout and stderr are appended to the given files.
pub(crate) fn spawn(
    command_line: &str,
    env: &BTreeMap<String, String>,
    fdlimit: Option<u64>,
    stdout_path: &Path,
    stderr_path: &Path,
) -> Result<Child, AppError> {
    let stdout = open_append(stdout_path)?;
    let stderr = open_append(stderr_path)?;

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command_line)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .process_group(0);

    if let Some(limit) = fdlimit {
        // SAFETY: the closure only calls setrlimit, which is async-signal-safe.
        unsafe {
            cmd.pre_exec(move || {
                set_nofile_limit(limit);
                Ok(())
            });
        }
    }

    cmd.spawn().map_err(|source| AppError::SpawnFailed {
        command: command_line.to_string(),
        source,
    })
}

fn open_append(path: &Path) -> Result<std::fs::File, AppError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| AppError::io(path, e))
}

/// Run `command_line` through `sh -c` to completion, capturing its output.
///
/// A non-zero exit is a [`AppError::CommandFailed`].
pub(crate) async fn run_shell(
    command_line: &str,
    env: &BTreeMap<String, String>,
) -> Result<Output, AppError> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command_line)
        .envs(env)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| AppError::SpawnFailed {
            command: command_line.to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(AppError::CommandFailed {
            command: command_line.to_string(),
            code: output.status.code().unwrap_or(-1),
        });
    }
    Ok(output)
}

/// Send `signal` to every process in the group led by `pid`.
pub(crate) fn signal_group(pid: u32, signal: libc::c_int) -> io::Result<()> {
    // SAFETY: killpg has no memory-safety preconditions.
    let rc = unsafe { libc::killpg(pid as libc::pid_t, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Returns whether the given process is currently running
pub fn process_running(pid: u32) -> bool {
    // Signal 0 only checks that the process exists.
    0 == (unsafe { libc::kill(pid as libc::pid_t, 0) })
}

/// The RLIMIT_NOFILE to apply from the `fdlimit` config key: `"max"` for the
/// current hard limit, or a positive integer.
pub(crate) fn resolve_fdlimit(app: &str, config: &AppConfig) -> Option<u64> {
    let limit = match config.get("fdlimit")? {
        serde_json::Value::String(s) if s == "max" => match nofile_hard_limit() {
            Ok(hard) => hard,
            Err(e) => {
                warn!(app, error = %e, "Failed to get RLIMIT_NOFILE: using system default");
                return None;
            }
        },
        value => value.as_u64()?,
    };
    debug!(app, fdlimit = limit, "fd limit");
    (limit > 0).then_some(limit)
}

fn nofile_hard_limit() -> io::Result<u64> {
    let mut rl = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: rl is a valid, writable rlimit.
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rl) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(rl.rlim_max as u64)
}

fn set_nofile_limit(limit: u64) {
    let rl = libc::rlimit {
        rlim_cur: limit as libc::rlim_t,
        rlim_max: limit as libc::rlim_t,
    };
    // Failure leaves the inherited limit in place.
    unsafe {
        libc::setrlimit(libc::RLIMIT_NOFILE, &rl);
    }
}
