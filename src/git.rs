//! Git workspace.
//!
//! Each reconcile gets a fresh `{uuid}/` scratch directory under the
//! configured base. The repository is cloned there (shallow when the ref
//! allows it), the ref is resolved to a full commit hash before anything
//! else runs, and the directory is removed on every exit path through the
//! workspace guard. Credentials flow through libgit2 callbacks and are
//! never part of a URL or argv.

use std::path::{Path, PathBuf};

use git2::build::RepoBuilder;
use git2::{Cred, ErrorClass, ErrorCode, FetchOptions, RemoteCallbacks, Repository};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::secrets::{Credential, CredentialKind};

/// Scratch directory guard; removes the tree when dropped.
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    fn allocate(base: &Path) -> Result<Self> {
        let root = base.join(uuid::Uuid::new_v4().to_string());
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Root of the cloned working tree.
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// The directory the applier should treat as the flake root.
    pub fn flake_dir(&self, subdir: Option<&str>) -> PathBuf {
        match subdir {
            Some(subdir) if !subdir.is_empty() => self.root.join(subdir),
            _ => self.root.clone(),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.root) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.root.display(), error = %e, "failed to remove workspace");
            }
        }
    }
}

/// Clone `url` at `reference` under `base` and resolve the ref to a commit.
///
/// Returns the workspace guard and the resolved 40-hex commit hash. All
/// libgit2 work runs on the blocking pool.
pub async fn prepare(
    base: &Path,
    url: &str,
    reference: &str,
    credential: Option<Credential>,
) -> Result<(Workspace, String)> {
    let workspace = Workspace::allocate(base)?;
    let target = workspace.path().to_path_buf();
    let url = url.to_string();
    let reference = reference.to_string();

    let commit = tokio::task::spawn_blocking(move || {
        clone_and_resolve(&target, &url, &reference, credential.as_ref())
    })
    .await
    .map_err(|e| Error::Network(format!("git task panicked: {e}")))??;

    info!(commit = %commit, "prepared git workspace");
    Ok((workspace, commit))
}

fn clone_and_resolve(
    target: &Path,
    url: &str,
    reference: &str,
    credential: Option<&Credential>,
) -> Result<String> {
    let repo = clone(target, url, reference, credential)?;
    let commit = resolve(&repo, url, reference)?;
    checkout_detached(&repo, &commit)?;
    Ok(commit)
}

fn clone(
    target: &Path,
    url: &str,
    reference: &str,
    credential: Option<&Credential>,
) -> Result<Repository> {
    // Shallow clones cover the tip of HEAD or a named branch; an arbitrary
    // commit needs history, and some transports reject shallow outright, so
    // a failed shallow attempt falls back to a full clone.
    let shallow_branch = match reference {
        "HEAD" => Some(None),
        r if !is_commit_hash(r) => Some(Some(r)),
        _ => None,
    };
    if let Some(branch) = shallow_branch {
        match builder(credential, Some(1), branch).clone(url, target) {
            Ok(repo) => return Ok(repo),
            Err(e) => {
                debug!(reference, error = %e, "shallow clone failed, retrying full");
                reset_dir(target)?;
            }
        }
    }
    builder(credential, None, None)
        .clone(url, target)
        .map_err(|e| map_git_error(url, reference, e))
}

fn reset_dir(target: &Path) -> Result<()> {
    std::fs::remove_dir_all(target)?;
    std::fs::create_dir_all(target)?;
    Ok(())
}

fn builder<'a>(
    credential: Option<&'a Credential>,
    depth: Option<i32>,
    branch: Option<&str>,
) -> RepoBuilder<'a> {
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(move |_url, username_from_url, _allowed| match credential {
        Some(cred) if cred.kind == CredentialKind::GitToken => {
            let token = std::str::from_utf8(cred.bytes())
                .map_err(|_| git2::Error::from_str("token is not valid UTF-8"))?;
            Cred::userpass_plaintext("token", token)
        }
        Some(cred) if cred.kind == CredentialKind::GitSshKey => {
            let key = std::str::from_utf8(cred.bytes())
                .map_err(|_| git2::Error::from_str("ssh key is not valid UTF-8"))?;
            Cred::ssh_key_from_memory(username_from_url.unwrap_or("git"), None, key, None)
        }
        _ => Cred::default(),
    });

    let mut fetch = FetchOptions::new();
    fetch.remote_callbacks(callbacks);
    if let Some(depth) = depth {
        fetch.depth(depth);
    }

    let mut builder = RepoBuilder::new();
    builder.fetch_options(fetch);
    if let Some(branch) = branch {
        builder.branch(branch);
    }
    builder
}

/// Resolve a ref name to a 40-hex commit hash.
fn resolve(repo: &Repository, url: &str, reference: &str) -> Result<String> {
    if reference == "HEAD" {
        let head = repo
            .head()
            .and_then(|h| h.peel_to_commit())
            .map_err(|e| map_git_error(url, reference, e))?;
        return Ok(head.id().to_string());
    }
    let candidates = [
        reference.to_string(),
        format!("origin/{reference}"),
        format!("refs/remotes/origin/{reference}"),
        format!("refs/tags/{reference}"),
    ];
    for candidate in &candidates {
        if let Ok(object) = repo.revparse_single(candidate) {
            let commit = object
                .peel_to_commit()
                .map_err(|e| map_git_error(url, reference, e))?;
            return Ok(commit.id().to_string());
        }
    }
    Err(Error::RefNotFound {
        repo: url.to_string(),
        reference: reference.to_string(),
    })
}

fn checkout_detached(repo: &Repository, commit: &str) -> Result<()> {
    let oid = git2::Oid::from_str(commit)
        .map_err(|e| Error::Network(format!("bad oid {commit}: {e}")))?;
    let object = repo
        .find_object(oid, None)
        .map_err(|e| Error::Network(e.message().to_string()))?;
    repo.checkout_tree(&object, Some(git2::build::CheckoutBuilder::new().force()))
        .map_err(|e| Error::Network(e.message().to_string()))?;
    repo.set_head_detached(oid)
        .map_err(|e| Error::Network(e.message().to_string()))?;
    Ok(())
}

fn is_commit_hash(reference: &str) -> bool {
    reference.len() == 40 && reference.chars().all(|c| c.is_ascii_hexdigit())
}

fn map_git_error(url: &str, reference: &str, e: git2::Error) -> Error {
    match (e.class(), e.code()) {
        (_, ErrorCode::Auth) | (ErrorClass::Ssh, _) => Error::AuthFailed {
            target: url.to_string(),
        },
        (_, ErrorCode::NotFound) | (ErrorClass::Reference, _) => Error::RefNotFound {
            repo: url.to_string(),
            reference: reference.to_string(),
        },
        (ErrorClass::Net, _) | (ErrorClass::Http, _) => Error::Network(e.message().to_string()),
        _ => Error::Network(e.message().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_hash_detection() {
        assert!(is_commit_hash(
            "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"
        ));
        assert!(!is_commit_hash("main"));
        assert!(!is_commit_hash("aaaaaaaa"));
        assert!(!is_commit_hash(
            "zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz"
        ));
    }

    #[test]
    fn workspace_is_removed_on_drop() {
        let base = tempfile::tempdir().unwrap();
        let path = {
            let workspace = Workspace::allocate(base.path()).unwrap();
            assert!(workspace.path().is_dir());
            workspace.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn flake_dir_honors_subdir() {
        let base = tempfile::tempdir().unwrap();
        let workspace = Workspace::allocate(base.path()).unwrap();
        assert_eq!(workspace.flake_dir(None), workspace.path());
        assert_eq!(
            workspace.flake_dir(Some("hosts/web")),
            workspace.path().join("hosts/web")
        );
    }

    #[test]
    fn local_clone_resolves_head_to_commit() {
        // Build a tiny local repository and clone it through the real path.
        let upstream = tempfile::tempdir().unwrap();
        let repo = Repository::init(upstream.path()).unwrap();
        std::fs::write(upstream.path().join("flake.nix"), "{ }\n").unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("flake.nix")).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = git2::Signature::now("test", "test@example.com").unwrap();
        let oid = repo
            .commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
            .unwrap();

        let base = tempfile::tempdir().unwrap();
        let workspace = Workspace::allocate(base.path()).unwrap();
        let url = format!("file://{}", upstream.path().display());
        let commit = clone_and_resolve(workspace.path(), &url, "HEAD", None).unwrap();
        assert_eq!(commit, oid.to_string());
        assert!(workspace.path().join("flake.nix").is_file());
    }
}
