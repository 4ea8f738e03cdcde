//! Remote applier.
//!
//! Drives the two apply modes as long-running child processes:
//! `nixos-anywhere` reimages a host through an in-kernel handoff
//! (bootstrap, destructive), `nixos-rebuild switch --target-host`
//! activates a new generation on an already-provisioned host. Output is
//! streamed line by line into the log and a bounded tail buffer; the
//! process is killed on timeout or cancellation.

use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Bootstrap,
    Switch,
}

impl Mode {
    /// Metric label value.
    pub fn label(&self) -> &'static str {
        match self {
            Mode::Bootstrap => "bootstrap",
            Mode::Switch => "switch",
        }
    }
}

pub struct Request<'a> {
    pub mode: Mode,
    /// Working-tree directory holding the flake (subdir already applied).
    pub flake_dir: &'a Path,
    /// Fragment selecting the system, e.g. `#web01`.
    pub flake: &'a str,
    /// `user@host` target.
    pub destination: &'a str,
    pub ssh_port: u16,
    pub key_path: &'a Path,
    /// Options string exported as NIX_SSHOPTS so every hop pins host keys.
    pub ssh_options: &'a str,
    pub timeout: Duration,
    /// Bytes of output tail to retain for status and events.
    pub tail_limit: usize,
}

impl Request<'_> {
    fn flake_ref(&self) -> String {
        let dir = self.flake_dir.display();
        if self.flake.starts_with('#') {
            format!("{}{}", dir, self.flake)
        } else {
            format!("{}#{}", dir, self.flake)
        }
    }

    fn command(&self) -> Command {
        let flake_ref = self.flake_ref();
        let mut cmd = match self.mode {
            Mode::Bootstrap => {
                let mut cmd = Command::new("nixos-anywhere");
                cmd.arg("--flake")
                    .arg(&flake_ref)
                    .arg("-i")
                    .arg(self.key_path)
                    .arg("--ssh-port")
                    .arg(self.ssh_port.to_string())
                    .arg(self.destination);
                cmd
            }
            Mode::Switch => {
                let mut cmd = Command::new("nixos-rebuild");
                cmd.arg("switch")
                    .arg("--flake")
                    .arg(&flake_ref)
                    .arg("--target-host")
                    .arg(self.destination);
                cmd
            }
        };
        cmd.env("NIX_SSHOPTS", self.ssh_options);
        cmd.env("NIX_CONFIG", "experimental-features = nix-command flakes");
        cmd
    }
}

pub struct Outcome {
    pub tail: String,
    pub duration: Duration,
}

/// Execute the apply. Exit 0 is the only success; anything else surfaces
/// as `ApplyFailed` with the captured output tail.
pub async fn run(request: &Request<'_>) -> Result<Outcome> {
    let started = Instant::now();
    let mut cmd = request.command();
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    info!(
        mode = request.mode.label(),
        destination = request.destination,
        flake = %request.flake_ref(),
        "starting apply"
    );
    let mut child = cmd.spawn()?;

    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");
    let mut tail = Tail::new(request.tail_limit);

    let work = async {
        let mut out_lines = BufReader::new(stdout).lines();
        let mut err_lines = BufReader::new(stderr).lines();
        let mut out_done = false;
        let mut err_done = false;

        while !(out_done && err_done) {
            tokio::select! {
                line = out_lines.next_line(), if !out_done => match line? {
                    Some(line) => {
                        debug!(target: "apply", "{}", line);
                        tail.push(&line);
                    }
                    None => out_done = true,
                },
                line = err_lines.next_line(), if !err_done => match line? {
                    Some(line) => {
                        debug!(target: "apply", "{}", line);
                        tail.push(&line);
                    }
                    None => err_done = true,
                },
            }
        }
        let status = child.wait().await?;
        Ok::<_, Error>(status.code().unwrap_or(-1))
    };

    let timed = tokio::time::timeout(request.timeout, work).await;
    let exit = match timed {
        Ok(result) => result?,
        Err(_) => {
            warn!(
                mode = request.mode.label(),
                destination = request.destination,
                "apply deadline exceeded, killing"
            );
            let _ = child.start_kill();
            if tokio::time::timeout(Duration::from_secs(10), child.wait())
                .await
                .is_err()
            {
                let _ = child.kill().await;
            }
            return Err(Error::Timeout {
                seconds: request.timeout.as_secs(),
            });
        }
    };

    let duration = started.elapsed();
    if exit != 0 {
        return Err(Error::ApplyFailed {
            exit,
            tail: tail.into_string(),
        });
    }
    info!(
        mode = request.mode.label(),
        destination = request.destination,
        duration_secs = duration.as_secs(),
        "apply succeeded"
    );
    Ok(Outcome {
        tail: tail.into_string(),
        duration,
    })
}

/// Byte-bounded line ring buffer retaining the newest output.
struct Tail {
    lines: VecDeque<String>,
    bytes: usize,
    limit: usize,
}

impl Tail {
    fn new(limit: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            bytes: 0,
            limit,
        }
    }

    fn push(&mut self, line: &str) {
        self.bytes += line.len() + 1;
        self.lines.push_back(line.to_string());
        while self.bytes > self.limit && self.lines.len() > 1 {
            if let Some(dropped) = self.lines.pop_front() {
                self.bytes -= dropped.len() + 1;
            }
        }
    }

    fn into_string(self) -> String {
        let mut out = String::with_capacity(self.bytes);
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flake_ref_joins_dir_and_fragment() {
        let request = Request {
            mode: Mode::Switch,
            flake_dir: Path::new("/work/abc"),
            flake: "#web01",
            destination: "root@host1",
            ssh_port: 22,
            key_path: Path::new("/scratch/key"),
            ssh_options: "",
            timeout: Duration::from_secs(1),
            tail_limit: 1024,
        };
        assert_eq!(request.flake_ref(), "/work/abc#web01");

        let bare = Request {
            flake: "web01",
            ..request
        };
        assert_eq!(bare.flake_ref(), "/work/abc#web01");
    }

    #[test]
    fn tail_retains_newest_lines_within_budget() {
        let mut tail = Tail::new(32);
        for i in 0..100 {
            tail.push(&format!("line {i:03}"));
        }
        let text = tail.into_string();
        assert!(text.len() <= 40);
        assert!(text.contains("line 099"));
        assert!(!text.contains("line 000"));
    }

    #[test]
    fn tail_keeps_at_least_one_line() {
        let mut tail = Tail::new(4);
        tail.push("a line much longer than the limit");
        let text = tail.into_string();
        assert!(text.contains("much longer"));
    }
}
