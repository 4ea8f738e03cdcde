//! Desired-state pipeline against a local repository: clone, inject,
//! fingerprint. Exercises the idempotence key the reconcile loop trusts:
//! identical inputs reproduce the fingerprint across fresh workspaces,
//! and any spec change moves it.

use std::path::Path;

use nixos_operator::fingerprint;
use nixos_operator::git;
use nixos_operator::inject::{self, ResolvedFile};

fn make_repo() -> (tempfile::TempDir, String) {
    let dir = tempfile::tempdir().unwrap();
    let repo = git2::Repository::init(dir.path()).unwrap();
    std::fs::write(dir.path().join("flake.nix"), "{ outputs = _: { }; }\n").unwrap();
    std::fs::create_dir_all(dir.path().join("hosts")).unwrap();
    std::fs::write(dir.path().join("hosts/web01.nix"), "{ }\n").unwrap();

    let mut index = repo.index().unwrap();
    index.add_path(Path::new("flake.nix")).unwrap();
    index.add_path(Path::new("hosts/web01.nix")).unwrap();
    index.write().unwrap();
    let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
    let sig = git2::Signature::now("tester", "tester@example.com").unwrap();
    repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
        .unwrap();
    let url = format!("file://{}", dir.path().display());
    (dir, url)
}

async fn pipeline(url: &str, files: &[ResolvedFile]) -> (String, String) {
    let base = tempfile::tempdir().unwrap();
    let (workspace, commit) = git::prepare(base.path(), url, "HEAD", None)
        .await
        .expect("clone must succeed");
    let injected = inject::inject(workspace.path(), files).unwrap();
    let print = fingerprint::compute(&fingerprint::Inputs {
        commit: &commit,
        flake: "#web01",
        subdir: None,
        full_install: false,
        files: &injected,
    });
    (commit, print)
}

fn inline(path: &str, contents: &str) -> ResolvedFile {
    ResolvedFile {
        path: path.to_string(),
        contents: contents.as_bytes().to_vec(),
        secret: false,
    }
}

#[tokio::test]
async fn same_inputs_reproduce_the_fingerprint_across_workspaces() {
    let (_repo, url) = make_repo();
    let files = vec![inline("etc/x.conf", "hello\n")];
    let (commit_a, print_a) = pipeline(&url, &files).await;
    let (commit_b, print_b) = pipeline(&url, &files).await;

    assert_eq!(commit_a.len(), 40, "ref must resolve to a full commit hash");
    assert_eq!(commit_a, commit_b);
    assert_eq!(print_a, print_b);
}

#[tokio::test]
async fn adding_a_file_changes_the_fingerprint() {
    let (_repo, url) = make_repo();
    let (_, before) = pipeline(&url, &[]).await;
    let (_, after) = pipeline(&url, &[inline("etc/x.conf", "hello\n")]).await;
    assert_ne!(before, after);
}

#[tokio::test]
async fn injection_collides_with_tracked_files() {
    let (_repo, url) = make_repo();
    let base = tempfile::tempdir().unwrap();
    let (workspace, _) = git::prepare(base.path(), &url, "HEAD", None)
        .await
        .unwrap();
    let err = inject::inject(workspace.path(), &[inline("flake.nix", "evil")]).unwrap_err();
    assert!(matches!(
        err,
        nixos_operator::error::Error::PathCollision { .. }
    ));
}

#[tokio::test]
async fn missing_ref_is_ref_not_found() {
    let (_repo, url) = make_repo();
    let base = tempfile::tempdir().unwrap();
    let err = git::prepare(base.path(), &url, "no-such-branch", None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        nixos_operator::error::Error::RefNotFound { .. }
    ));
}
