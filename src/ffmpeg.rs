// This file is part of Reelcut, a short-form clip rendering service.
// Copyright (C) 2025 The Reelcut Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Media toolchain lookup and subprocess plumbing.
//!
//! Every external invocation runs with an explicit deadline; a blown deadline
//! kills the child and surfaces as a `Timeout` stage failure. stderr is
//! captured UTF-8-lossily because that's what ends up on failed job rows.

use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use base::{bail, err, Error, ErrorKind};
use tracing::{debug, warn};

/// How often to poll a running child for exit while its deadline has not
/// passed.
const WAIT_POLL: Duration = Duration::from_millis(100);

/// Resolved paths to the codec toolchain.
#[derive(Clone, Debug)]
pub struct Toolchain {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
}

impl Toolchain {
    pub fn locate() -> Result<Self, Error> {
        Ok(Toolchain {
            ffmpeg: locate_tool("ffmpeg")?,
            ffprobe: locate_tool("ffprobe")?,
        })
    }
}

pub fn locate_tool(name: &str) -> Result<PathBuf, Error> {
    which::which(name)
        .map_err(|e| err!(ConfigError, msg("{name} not found on PATH"), source(e)))
}

/// Runs the command to completion with a deadline, returning its stdout.
///
/// Non-zero exit becomes an error of `fail_kind` carrying the tail of stderr;
/// exceeding the deadline kills the child and returns `Timeout`.
pub fn run(
    mut cmd: Command,
    timeout: Duration,
    what: &str,
    fail_kind: ErrorKind,
) -> Result<Vec<u8>, Error> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    debug!("running {what}: {cmd:?}");

    let mut child = cmd
        .spawn()
        .map_err(|e| err!(ConfigError, msg("unable to spawn {what}"), source(e)))?;

    // Drain both pipes on their own threads so a chatty child can't fill a
    // pipe buffer and deadlock against our wait loop.
    let mut stdout_pipe = child.stdout.take().expect("stdout piped");
    let mut stderr_pipe = child.stderr.take().expect("stderr piped");
    let stdout_h = std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stdout_pipe.read_to_end(&mut buf);
        buf
    });
    let stderr_h = std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stderr_pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    });

    let status = wait_with_deadline(&mut child, timeout, what)?;
    let stdout = stdout_h.join().expect("stdout reader never panics");
    let stderr = stderr_h.join().expect("stderr reader never panics");

    if !status.success() {
        return Err(Error::new(
            fail_kind,
            format!("{what} failed ({status}): {}", tail(&stderr, 1500)),
        ));
    }
    Ok(stdout)
}

fn wait_with_deadline(
    child: &mut Child,
    timeout: Duration,
    what: &str,
) -> Result<std::process::ExitStatus, Error> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) => {}
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(err!(Internal, msg("unable to wait for {what}"), source(e)));
            }
        }
        if Instant::now() >= deadline {
            if let Err(e) = child.kill() {
                warn!(err = %e, "unable to kill timed-out {what}");
            }
            let _ = child.wait();
            bail!(Timeout, msg("{what} exceeded {} s deadline", timeout.as_secs()));
        }
        std::thread::sleep(WAIT_POLL);
    }
}

/// Last `max` characters of `s`, respecting char boundaries.
pub fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successful_command_captures_stdout() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo hi"]);
        let out = run(cmd, Duration::from_secs(5), "echo", ErrorKind::Internal).unwrap();
        assert_eq!(out, b"hi\n");
    }

    #[test]
    fn nonzero_exit_carries_stderr() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo boom >&2; exit 3"]);
        let e = run(cmd, Duration::from_secs(5), "sh", ErrorKind::EncodeFailed).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::EncodeFailed);
        assert!(e.to_string().contains("boom"), "{e}");
    }

    #[test]
    fn deadline_kills_child() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let start = Instant::now();
        let e = run(cmd, Duration::from_millis(200), "sleep", ErrorKind::Internal).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Timeout);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn missing_binary_is_config_error() {
        let cmd = Command::new("definitely-not-a-real-binary-7f3a");
        let e = run(cmd, Duration::from_secs(1), "nothing", ErrorKind::Internal).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::ConfigError);
    }

    #[test]
    fn tail_respects_char_boundaries() {
        let s = "héllo wörld";
        let t = tail(s, 4);
        assert!(t.len() <= 5);
        assert!(s.ends_with(t));
        assert_eq!(tail("short", 100), "short");
    }
}
