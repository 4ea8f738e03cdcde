//! Pinned host-key store.
//!
//! Maintains an OpenSSH-format known_hosts file with trust-on-first-use
//! semantics: the first connection to a host records its key, every later
//! connection must present a byte-identical one. The engine never overwrites
//! a pinned key; mismatches require the `known-hosts clear` admin command.
//! Writes serialize through a process-wide lock; readers see whole files.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::info;

use crate::error::Result;

pub struct KnownHosts {
    path: PathBuf,
    lock: Mutex<()>,
}

impl KnownHosts {
    /// Open (creating if needed) the known_hosts file at `path`.
    pub fn open(path: PathBuf) -> Result<Self> {
        use std::os::unix::fs::OpenOptionsExt;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o600)
            .open(&path)?;
        info!(path = %path.display(), "using known_hosts file");
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a key is already pinned for `host` (on any port form).
    pub fn has(&self, host: &str, port: u16) -> bool {
        let _guard = self.lock.lock().unwrap();
        let content = std::fs::read_to_string(&self.path).unwrap_or_default();
        content
            .lines()
            .filter_map(first_token)
            .any(|token| token_matches(token, host, port))
    }

    /// Pin a key for a host. Used by tests and by the admin import path;
    /// normal learning happens through the ssh subprocess writing the file.
    pub fn add(&self, host: &str, port: u16, key_type: &str, public_key: &str) -> Result<()> {
        let _guard = self.lock.lock().unwrap();
        let entry = format!("{} {} {}\n", host_token(host, port), key_type, public_key);
        let content = std::fs::read_to_string(&self.path).unwrap_or_default();
        if content.contains(entry.trim_end()) {
            return Ok(());
        }
        std::fs::write(&self.path, format!("{}{}", content, entry))?;
        info!(host, "pinned host key");
        Ok(())
    }

    /// Remove every pinned key for a host. This is the operator-facing
    /// adjudication step after a HostKeyMismatch.
    pub fn clear(&self, host: &str) -> Result<usize> {
        let _guard = self.lock.lock().unwrap();
        let content = std::fs::read_to_string(&self.path).unwrap_or_default();
        let mut removed = 0;
        let kept: Vec<&str> = content
            .lines()
            .filter(|line| {
                let matches = first_token(line)
                    .map(|token| token_names_host(token, host))
                    .unwrap_or(false);
                if matches {
                    removed += 1;
                }
                !matches
            })
            .collect();
        let mut output = kept.join("\n");
        if !output.is_empty() {
            output.push('\n');
        }
        std::fs::write(&self.path, output)?;
        if removed > 0 {
            info!(host, removed, "cleared pinned host keys");
        }
        Ok(removed)
    }

    /// All pinned entries as `(host-token, key-type)` pairs.
    pub fn entries(&self) -> Vec<(String, String)> {
        let _guard = self.lock.lock().unwrap();
        let content = std::fs::read_to_string(&self.path).unwrap_or_default();
        content
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                match (parts.next(), parts.next()) {
                    (Some(host), Some(key_type)) => {
                        Some((host.to_string(), key_type.to_string()))
                    }
                    _ => None,
                }
            })
            .collect()
    }
}

/// The host field openssh writes for a host/port pair.
fn host_token(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    }
}

fn first_token(line: &str) -> Option<&str> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    line.split_whitespace().next()
}

/// Known_hosts lines may carry several comma-separated names per entry.
fn token_matches(token: &str, host: &str, port: u16) -> bool {
    let wanted = host_token(host, port);
    token.split(',').any(|name| name == wanted || name == host)
}

fn token_names_host(token: &str, host: &str) -> bool {
    token.split(',').any(|name| {
        name == host
            || name
                .strip_prefix('[')
                .and_then(|rest| rest.split_once("]:"))
                .map(|(h, _)| h == host)
                .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, KnownHosts) {
        let dir = tempfile::tempdir().unwrap();
        let store = KnownHosts::open(dir.path().join("known_hosts")).unwrap();
        (dir, store)
    }

    #[test]
    fn first_use_pins_then_matches() {
        let (_dir, store) = store();
        assert!(!store.has("host1.example.com", 22));
        store
            .add("host1.example.com", 22, "ssh-ed25519", "AAAAC3Nza...host1")
            .unwrap();
        assert!(store.has("host1.example.com", 22));
        assert!(!store.has("host2.example.com", 22));
    }

    #[test]
    fn non_default_port_uses_bracket_form() {
        let (_dir, store) = store();
        store
            .add("10.0.0.5", 2222, "ssh-ed25519", "AAAAC3Nza...p2222")
            .unwrap();
        assert!(store.has("10.0.0.5", 2222));
        let entries = store.entries();
        assert_eq!(entries[0].0, "[10.0.0.5]:2222");
    }

    #[test]
    fn clear_removes_all_forms_for_a_host() {
        let (_dir, store) = store();
        store.add("host1", 22, "ssh-ed25519", "AAAA1").unwrap();
        store.add("host1", 2222, "ssh-rsa", "AAAA2").unwrap();
        store.add("host2", 22, "ssh-ed25519", "AAAA3").unwrap();
        let removed = store.clear("host1").unwrap();
        assert_eq!(removed, 2);
        assert!(!store.has("host1", 22));
        assert!(!store.has("host1", 2222));
        assert!(store.has("host2", 22));
    }

    #[test]
    fn add_is_idempotent() {
        let (_dir, store) = store();
        store.add("host1", 22, "ssh-ed25519", "AAAA1").unwrap();
        store.add("host1", 22, "ssh-ed25519", "AAAA1").unwrap();
        assert_eq!(store.entries().len(), 1);
    }

    #[test]
    fn file_is_created_with_owner_only_mode() {
        use std::os::unix::fs::PermissionsExt;
        let (_dir, store) = store();
        let mode = std::fs::metadata(store.path())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
