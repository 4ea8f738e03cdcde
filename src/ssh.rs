//! SSH transport.
//!
//! Drives the OpenSSH client as a subprocess: non-interactive public-key
//! sessions, host keys pinned through the shared known_hosts file
//! (`StrictHostKeyChecking=accept-new` gives trust-on-first-use and refuses
//! a changed key), output streamed line by line, every call bounded by a
//! deadline with a guaranteed kill.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::known_hosts::KnownHosts;

/// How long a session gets to die after cancellation before SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Result of a completed (possibly non-zero) remote execution.
pub struct ExecOutput {
    pub exit: i32,
    pub stdout: String,
    pub stderr_tail: String,
}

#[derive(Clone)]
pub struct Target<'a> {
    pub host: &'a str,
    pub port: u16,
    pub user: &'a str,
    pub key_path: &'a Path,
}

impl Target<'_> {
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

#[derive(Clone)]
pub struct Ssh {
    known_hosts: Arc<KnownHosts>,
    connect_timeout: Duration,
}

impl Ssh {
    pub fn new(known_hosts: Arc<KnownHosts>, connect_timeout: Duration) -> Self {
        Self {
            known_hosts,
            connect_timeout,
        }
    }

    pub fn known_hosts(&self) -> &KnownHosts {
        &self.known_hosts
    }

    /// Common client options for a target, also exported to the applier
    /// subprocesses via NIX_SSHOPTS so every hop verifies the same pins.
    pub fn options(&self, target: &Target<'_>) -> Vec<String> {
        vec![
            "-p".into(),
            target.port.to_string(),
            "-i".into(),
            target.key_path.display().to_string(),
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            "StrictHostKeyChecking=accept-new".into(),
            "-o".into(),
            format!(
                "UserKnownHostsFile={}",
                self.known_hosts.path().display()
            ),
            "-o".into(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs()),
        ]
    }

    pub fn options_string(&self, target: &Target<'_>) -> String {
        self.options(target).join(" ")
    }

    /// Reachability probe: run a trivial remote echo, report latency.
    pub async fn probe(&self, target: &Target<'_>) -> Result<Duration> {
        let started = Instant::now();
        let deadline = self.connect_timeout + Duration::from_secs(5);
        let output = self
            .run(target, "echo machine_available", None, deadline, &mut |_, _| {})
            .await?;
        if output.exit != 0 {
            return Err(self.classify(target, &output));
        }
        if output.stdout.trim() != "machine_available" {
            return Err(Error::Unreachable {
                host: target.host.to_string(),
                detail: "unexpected probe response".into(),
            });
        }
        Ok(started.elapsed())
    }

    /// Execute a remote command with streamed output.
    ///
    /// `on_line` is called for every line of stdout and stderr as it
    /// arrives; a slow handler slows the subprocess read, which is the
    /// backpressure contract. The call is bounded by `deadline`: on expiry
    /// the channel is closed, the child killed within [`KILL_GRACE`], and
    /// `Timeout` returned.
    pub async fn run(
        &self,
        target: &Target<'_>,
        command: &str,
        stdin: Option<&[u8]>,
        deadline: Duration,
        on_line: &mut (dyn FnMut(Stream, &str) + Send),
    ) -> Result<ExecOutput> {
        let mut cmd = Command::new("ssh");
        cmd.args(self.options(target))
            .arg(target.destination())
            .arg(command)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(host = target.host, command, "ssh exec");
        let mut child = cmd.spawn()?;

        if let Some(bytes) = stdin {
            let mut handle = child.stdin.take().expect("stdin was piped");
            handle.write_all(bytes).await?;
            handle.shutdown().await?;
            drop(handle);
        }

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        let work = async {
            let mut out_lines = BufReader::new(stdout).lines();
            let mut err_lines = BufReader::new(stderr).lines();
            let mut out_done = false;
            let mut err_done = false;
            let mut collected_out = String::new();
            let mut collected_err = String::new();

            while !(out_done && err_done) {
                tokio::select! {
                    line = out_lines.next_line(), if !out_done => match line? {
                        Some(line) => {
                            on_line(Stream::Stdout, &line);
                            collected_out.push_str(&line);
                            collected_out.push('\n');
                        }
                        None => out_done = true,
                    },
                    line = err_lines.next_line(), if !err_done => match line? {
                        Some(line) => {
                            on_line(Stream::Stderr, &line);
                            collected_err.push_str(&line);
                            collected_err.push('\n');
                        }
                        None => err_done = true,
                    },
                }
            }

            let status = child.wait().await?;
            Ok::<_, Error>(ExecOutput {
                exit: status.code().unwrap_or(-1),
                stdout: collected_out,
                stderr_tail: tail(&collected_err, 4096),
            })
        };

        let timed = tokio::time::timeout(deadline, work).await;
        match timed {
            Ok(result) => result,
            Err(_) => {
                warn!(host = target.host, "ssh session deadline exceeded, killing");
                kill_with_grace(&mut child).await;
                Err(Error::Timeout {
                    seconds: deadline.as_secs(),
                })
            }
        }
    }

    /// Run a remote command, classifying any non-zero exit as an error.
    pub async fn run_checked(
        &self,
        target: &Target<'_>,
        command: &str,
        stdin: Option<&[u8]>,
        deadline: Duration,
    ) -> Result<ExecOutput> {
        let output = self.run(target, command, stdin, deadline, &mut |_, _| {}).await?;
        if output.exit != 0 {
            return Err(self.classify(target, &output));
        }
        Ok(output)
    }

    /// Copy bytes to a remote path with the given mode.
    pub async fn upload(
        &self,
        target: &Target<'_>,
        contents: &[u8],
        dest: &str,
        mode: u32,
        deadline: Duration,
    ) -> Result<()> {
        let command = format!("cat > {dest} && chmod {mode:o} {dest}");
        self.run_checked(target, &command, Some(contents), deadline)
            .await?;
        Ok(())
    }

    /// Map an ssh failure onto the engine error taxonomy.
    pub fn classify(&self, target: &Target<'_>, output: &ExecOutput) -> Error {
        classify_failure(target.host, &target.destination(), output.exit, &output.stderr_tail)
    }
}

/// Classification of a failed ssh invocation.
///
/// The OpenSSH client exits 255 for transport-level failures and otherwise
/// forwards the remote command's status; the distinguishing detail is only
/// on stderr.
pub fn classify_failure(host: &str, destination: &str, exit: i32, stderr: &str) -> Error {
    if exit != 255 {
        return Error::RemoteExecFailed { exit };
    }
    if stderr.contains("Host key verification failed")
        || stderr.contains("REMOTE HOST IDENTIFICATION HAS CHANGED")
        || stderr.contains("differs from the key for the IP address")
    {
        return Error::HostKeyMismatch {
            host: host.to_string(),
        };
    }
    if stderr.contains("Permission denied")
        || stderr.contains("Too many authentication failures")
        || stderr.contains("no mutual signature algorithm")
    {
        return Error::AuthFailed {
            target: destination.to_string(),
        };
    }
    if stderr.contains("Connection timed out")
        || stderr.contains("timed out")
        || stderr.contains("Connection refused")
        || stderr.contains("No route to host")
        || stderr.contains("Network is unreachable")
        || stderr.contains("Could not resolve hostname")
    {
        return Error::Unreachable {
            host: host.to_string(),
            detail: last_line(stderr),
        };
    }
    Error::Network(last_line(stderr))
}

async fn kill_with_grace(child: &mut tokio::process::Child) {
    let _ = child.start_kill();
    if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
        let _ = child.kill().await;
    }
}

fn tail(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        return s.to_string();
    }
    let start = s.len() - limit;
    // keep whole lines in the tail
    match s[start..].find('\n') {
        Some(idx) => s[start + idx + 1..].to_string(),
        None => s[start..].to_string(),
    }
}

fn last_line(s: &str) -> String {
    s.lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_key_mismatch_is_detected_before_auth() {
        let stderr = "@@@@ WARNING: REMOTE HOST IDENTIFICATION HAS CHANGED! @@@@\n\
                      Host key verification failed.\n";
        let err = classify_failure("host1", "root@host1", 255, stderr);
        assert!(matches!(err, Error::HostKeyMismatch { .. }));
    }

    #[test]
    fn permission_denied_is_auth_failed() {
        let err = classify_failure(
            "host1",
            "root@host1",
            255,
            "root@host1: Permission denied (publickey).\n",
        );
        assert!(matches!(err, Error::AuthFailed { .. }));
    }

    #[test]
    fn connect_timeout_is_unreachable() {
        let err = classify_failure(
            "host1",
            "root@host1",
            255,
            "ssh: connect to host host1 port 22: Connection timed out\n",
        );
        assert!(matches!(err, Error::Unreachable { .. }));
    }

    #[test]
    fn remote_exit_codes_pass_through() {
        let err = classify_failure("host1", "root@host1", 7, "");
        assert!(matches!(err, Error::RemoteExecFailed { exit: 7 }));
    }

    #[test]
    fn tail_keeps_whole_lines() {
        let long = "first line\n".repeat(1000);
        let tailed = tail(&long, 64);
        assert!(tailed.len() <= 64);
        assert!(tailed.starts_with("first line"));
    }
}
