//! Additional-file injection.
//!
//! Materializes user-declared files into the cloned working tree, in
//! declared order, after which the tree is frozen for the rest of the
//! reconcile. Paths are validated against traversal and collisions before
//! any byte is written.

use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Error, Result};

/// A file whose content has already been resolved from its value source.
pub struct ResolvedFile {
    pub path: String,
    pub contents: Vec<u8>,
    /// Secret-derived files are written mode 0600 instead of 0644.
    pub secret: bool,
}

/// Record of one written file, input to the fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectedFile {
    pub path: String,
    /// Hex SHA-256 of the file content.
    pub sha256: String,
    pub mode: u32,
}

/// Write all files under `tree_root`, creating intermediate directories.
pub fn inject(tree_root: &Path, files: &[ResolvedFile]) -> Result<Vec<InjectedFile>> {
    use std::io::Write;
    use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};

    let mut injected = Vec::with_capacity(files.len());
    let mut seen = std::collections::BTreeSet::new();

    for file in files {
        let relative = validate_path(&file.path)?;
        if !seen.insert(relative.clone()) {
            return Err(Error::PathCollision {
                path: file.path.clone(),
            });
        }
        let destination = tree_root.join(&relative);
        if destination.exists() {
            return Err(Error::PathCollision {
                path: file.path.clone(),
            });
        }
        if let Some(parent) = destination.parent() {
            if !parent.exists() {
                std::fs::DirBuilder::new()
                    .recursive(true)
                    .mode(0o755)
                    .create(parent)?;
            }
        }
        let mode = if file.secret { 0o600 } else { 0o644 };
        let mut handle = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(&destination)?;
        handle.write_all(&file.contents)?;

        let digest = Sha256::digest(&file.contents);
        debug!(path = %file.path, mode, "injected file");
        injected.push(InjectedFile {
            path: file.path.clone(),
            sha256: format!("{:x}", digest),
            mode,
        });
    }
    Ok(injected)
}

/// Validate a declared path: relative, no `..`, no traversal after
/// normalization.
fn validate_path(declared: &str) -> Result<PathBuf> {
    if declared.is_empty() {
        return Err(invalid(declared, "path is empty"));
    }
    let path = Path::new(declared);
    if path.is_absolute() {
        return Err(invalid(declared, "path must be relative"));
    }
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(invalid(declared, "path must not contain .."));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(invalid(declared, "path must be relative"));
            }
        }
    }
    if normalized.as_os_str().is_empty() {
        return Err(invalid(declared, "path resolves to the tree root"));
    }
    Ok(normalized)
}

fn invalid(path: &str, reason: &str) -> Error {
    Error::Validation {
        field: format!("additionalFiles[{}]", path),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn inline(path: &str, contents: &str) -> ResolvedFile {
        ResolvedFile {
            path: path.to_string(),
            contents: contents.as_bytes().to_vec(),
            secret: false,
        }
    }

    #[test]
    fn writes_files_with_expected_modes() {
        let tree = tempfile::tempdir().unwrap();
        let files = vec![
            inline("etc/x.conf", "hello\n"),
            ResolvedFile {
                path: "secrets/age.key".into(),
                contents: b"AGE-SECRET-KEY-1".to_vec(),
                secret: true,
            },
        ];
        let injected = inject(tree.path(), &files).unwrap();

        assert_eq!(injected.len(), 2);
        assert_eq!(injected[0].mode, 0o644);
        assert_eq!(injected[1].mode, 0o600);

        let plain = std::fs::metadata(tree.path().join("etc/x.conf")).unwrap();
        assert_eq!(plain.permissions().mode() & 0o777, 0o644);
        let secret = std::fs::metadata(tree.path().join("secrets/age.key")).unwrap();
        assert_eq!(secret.permissions().mode() & 0o777, 0o600);

        assert_eq!(
            std::fs::read_to_string(tree.path().join("etc/x.conf")).unwrap(),
            "hello\n"
        );
    }

    #[test]
    fn digest_matches_content() {
        let tree = tempfile::tempdir().unwrap();
        let injected = inject(tree.path(), &[inline("etc/x.conf", "hello\n")]).unwrap();
        // sha256 of "hello\n"
        assert_eq!(
            injected[0].sha256,
            "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03"
        );
    }

    #[test]
    fn rejects_absolute_and_traversal_paths() {
        let tree = tempfile::tempdir().unwrap();
        for bad in ["/etc/x.conf", "../x.conf", "a/../../x.conf", "", "."] {
            let err = inject(tree.path(), &[inline(bad, "x")]).unwrap_err();
            assert!(
                matches!(err, Error::Validation { .. }),
                "expected validation error for {bad:?}"
            );
        }
    }

    #[test]
    fn duplicate_paths_collide() {
        let tree = tempfile::tempdir().unwrap();
        let err = inject(
            tree.path(),
            &[inline("etc/x.conf", "a"), inline("etc/./x.conf", "b")],
        )
        .unwrap_err();
        assert!(matches!(err, Error::PathCollision { .. }));
    }

    #[test]
    fn existing_clone_files_collide() {
        let tree = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tree.path().join("etc")).unwrap();
        std::fs::write(tree.path().join("etc/x.conf"), "from clone").unwrap();
        let err = inject(tree.path(), &[inline("etc/x.conf", "injected")]).unwrap_err();
        assert!(matches!(err, Error::PathCollision { .. }));
    }

    #[test]
    fn empty_file_list_is_valid() {
        let tree = tempfile::tempdir().unwrap();
        assert!(inject(tree.path(), &[]).unwrap().is_empty());
    }
}
