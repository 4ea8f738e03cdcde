//! Desired-state fingerprint.
//!
//! A 256-bit hash over the fully resolved desired state. The encoding is
//! length-prefixed so field boundaries cannot alias, and file tuples are
//! sorted by path so declaration order does not affect the result. The
//! fingerprint is the engine's idempotence key: equal fingerprint on the
//! target machine means no remote work.

use sha2::{Digest, Sha256};

use crate::inject::InjectedFile;

pub struct Inputs<'a> {
    /// Resolved 40-hex commit hash.
    pub commit: &'a str,
    pub flake: &'a str,
    pub subdir: Option<&'a str>,
    pub full_install: bool,
    pub files: &'a [InjectedFile],
}

/// Compute the fingerprint as lowercase hex.
pub fn compute(inputs: &Inputs<'_>) -> String {
    let mut hasher = Sha256::new();
    feed(&mut hasher, inputs.commit.as_bytes());
    feed(&mut hasher, inputs.flake.as_bytes());
    feed(&mut hasher, inputs.subdir.unwrap_or("").as_bytes());
    feed(&mut hasher, &[inputs.full_install as u8]);

    let mut files: Vec<&InjectedFile> = inputs.files.iter().collect();
    files.sort_by(|a, b| a.path.cmp(&b.path));
    feed(&mut hasher, &(files.len() as u64).to_le_bytes());
    for file in files {
        feed(&mut hasher, file.path.as_bytes());
        feed(&mut hasher, file.sha256.as_bytes());
        feed(&mut hasher, &file.mode.to_le_bytes());
    }
    format!("{:x}", hasher.finalize())
}

fn feed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    const COMMIT: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    fn file(path: &str, sha256: &str, mode: u32) -> InjectedFile {
        InjectedFile {
            path: path.to_string(),
            sha256: sha256.to_string(),
            mode,
        }
    }

    fn base() -> (Vec<InjectedFile>, String) {
        let files = vec![
            file("etc/a.conf", "11", 0o644),
            file("etc/b.conf", "22", 0o600),
        ];
        let fingerprint = compute(&Inputs {
            commit: COMMIT,
            flake: "#web01",
            subdir: None,
            full_install: false,
            files: &files,
        });
        (files, fingerprint)
    }

    #[test]
    fn pure_function_of_inputs() {
        let (_, first) = base();
        let (_, second) = base();
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
    }

    #[test]
    fn reordering_distinct_paths_does_not_change_it() {
        let (mut files, fingerprint) = base();
        files.reverse();
        let reordered = compute(&Inputs {
            commit: COMMIT,
            flake: "#web01",
            subdir: None,
            full_install: false,
            files: &files,
        });
        assert_eq!(fingerprint, reordered);
    }

    #[test]
    fn any_field_change_changes_it() {
        let (files, fingerprint) = base();
        let variants = [
            Inputs {
                commit: "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb",
                flake: "#web01",
                subdir: None,
                full_install: false,
                files: &files,
            },
            Inputs {
                commit: COMMIT,
                flake: "#web02",
                subdir: None,
                full_install: false,
                files: &files,
            },
            Inputs {
                commit: COMMIT,
                flake: "#web01",
                subdir: Some("hosts"),
                full_install: false,
                files: &files,
            },
            Inputs {
                commit: COMMIT,
                flake: "#web01",
                subdir: None,
                full_install: true,
                files: &files,
            },
        ];
        for variant in &variants {
            assert_ne!(fingerprint, compute(variant));
        }
    }

    #[test]
    fn file_content_change_changes_it() {
        let (mut files, fingerprint) = base();
        files[0].sha256 = "33".into();
        let changed = compute(&Inputs {
            commit: COMMIT,
            flake: "#web01",
            subdir: None,
            full_install: false,
            files: &files,
        });
        assert_ne!(fingerprint, changed);
    }

    #[test]
    fn field_boundaries_do_not_alias() {
        // Moving a byte across the flake/subdir boundary must change the
        // digest; a plain concatenation would collide.
        let a = compute(&Inputs {
            commit: COMMIT,
            flake: "#ab",
            subdir: Some("c"),
            full_install: false,
            files: &[],
        });
        let b = compute(&Inputs {
            commit: COMMIT,
            flake: "#a",
            subdir: Some("bc"),
            full_install: false,
            files: &[],
        });
        assert_ne!(a, b);
    }

    #[test]
    fn empty_subdir_equals_absent_subdir() {
        let absent = compute(&Inputs {
            commit: COMMIT,
            flake: "#web01",
            subdir: None,
            full_install: false,
            files: &[],
        });
        let empty = compute(&Inputs {
            commit: COMMIT,
            flake: "#web01",
            subdir: Some(""),
            full_install: false,
            files: &[],
        });
        assert_eq!(absent, empty);
    }
}
