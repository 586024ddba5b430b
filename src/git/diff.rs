//! Read-only branch inspection through libgit2.
//!
//! None of these functions touch a working tree, so they are safe to call on
//! a branch whose worktree is mid-rebase or already removed.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use git2::{Diff, DiffFormat, DiffOptions, ErrorCode, Oid, Repository};

/// Unified diff of `branch` against its merge base with `trunk`.
/// A branch that does not exist yields an empty diff.
pub fn branch_patch(repo_root: &Path, trunk: &str, branch: &str) -> Result<String> {
    let repo = Repository::open(repo_root).context("Failed to open git repository")?;
    let Some(branch_oid) = resolve_branch(&repo, branch)? else {
        return Ok(String::new());
    };
    let diff = diff_against_base(&repo, trunk, branch_oid)?;

    let mut buf = Vec::new();
    diff.print(DiffFormat::Patch, |_delta, _hunk, line| {
        if matches!(line.origin(), '+' | '-' | ' ') {
            buf.push(line.origin() as u8);
        }
        buf.extend_from_slice(line.content());
        true
    })?;
    Ok(String::from_utf8_lossy(&buf).to_string())
}

/// Paths touched on `branch` relative to its merge base with `trunk`.
pub fn branch_files(repo_root: &Path, trunk: &str, branch: &str) -> Result<Vec<PathBuf>> {
    let repo = Repository::open(repo_root).context("Failed to open git repository")?;
    let Some(branch_oid) = resolve_branch(&repo, branch)? else {
        return Ok(Vec::new());
    };
    let diff = diff_against_base(&repo, trunk, branch_oid)?;

    let mut files = Vec::new();
    for delta in diff.deltas() {
        let path = delta.new_file().path().or_else(|| delta.old_file().path());
        if let Some(path) = path {
            files.push(path.to_path_buf());
        }
    }
    Ok(files)
}

fn resolve_branch(repo: &Repository, branch: &str) -> Result<Option<Oid>> {
    match repo.find_reference(&format!("refs/heads/{}", branch)) {
        Ok(reference) => {
            let commit = reference
                .peel_to_commit()
                .with_context(|| format!("Branch {} does not point at a commit", branch))?;
            Ok(Some(commit.id()))
        }
        Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to resolve branch {}", branch)),
    }
}

fn diff_against_base<'r>(repo: &'r Repository, trunk: &str, branch_oid: Oid) -> Result<Diff<'r>> {
    let trunk_oid = resolve_branch(repo, trunk)?
        .with_context(|| format!("Trunk branch {} not found", trunk))?;
    let base_oid = repo
        .merge_base(trunk_oid, branch_oid)
        .context("Branch shares no history with trunk")?;

    let base_tree = repo.find_commit(base_oid)?.tree()?;
    let branch_tree = repo.find_commit(branch_oid)?.tree()?;

    let mut opts = DiffOptions::new();
    opts.context_lines(3);
    let diff = repo.diff_tree_to_tree(Some(&base_tree), Some(&branch_tree), Some(&mut opts))?;
    Ok(diff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::{RepositoryInitOptions, Signature};
    use tempfile::tempdir;

    fn setup_repo() -> (Repository, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head("main");
        let repo = Repository::init_opts(dir.path(), &opts).unwrap();
        (repo, dir)
    }

    /// Commit `files` on top of `parent` and point `refname` at the result.
    fn commit_on(repo: &Repository, refname: &str, parent: Option<Oid>, files: &[(&str, &str)]) -> Oid {
        let parent_commit = parent.map(|oid| repo.find_commit(oid).unwrap());
        let parent_tree = parent_commit.as_ref().map(|c| c.tree().unwrap());
        let mut builder = repo.treebuilder(parent_tree.as_ref()).unwrap();
        for (name, content) in files {
            let blob = repo.blob(content.as_bytes()).unwrap();
            builder.insert(name, blob, 0o100644).unwrap();
        }
        let tree = repo.find_tree(builder.write().unwrap()).unwrap();
        let sig = Signature::now("test", "test@test.com").unwrap();
        let parents: Vec<&git2::Commit> = parent_commit.iter().collect();
        repo.commit(Some(refname), &sig, &sig, "commit", &tree, &parents)
            .unwrap()
    }

    #[test]
    fn test_branch_patch_shows_only_branch_changes() {
        let (repo, dir) = setup_repo();
        let base = commit_on(&repo, "refs/heads/main", None, &[("lib.rs", "fn a() {}\n")]);
        commit_on(&repo, "refs/heads/kiln/kl-1", Some(base), &[("new.rs", "fn b() {}\n")]);
        // Trunk moves on independently
        commit_on(&repo, "refs/heads/main", Some(base), &[("other.rs", "x\n")]);

        let patch = branch_patch(dir.path(), "main", "kiln/kl-1").unwrap();
        assert!(patch.contains("new.rs"));
        assert!(patch.contains("+fn b() {}"));
        assert!(!patch.contains("other.rs"));
    }

    #[test]
    fn test_branch_files_lists_modified_and_added() {
        let (repo, dir) = setup_repo();
        let base = commit_on(&repo, "refs/heads/main", None, &[("a.txt", "one\n")]);
        commit_on(
            &repo,
            "refs/heads/kiln/kl-2",
            Some(base),
            &[("a.txt", "one\ntwo\n"), ("b.txt", "new\n")],
        );

        let mut files = branch_files(dir.path(), "main", "kiln/kl-2").unwrap();
        files.sort();
        assert_eq!(files, vec![PathBuf::from("a.txt"), PathBuf::from("b.txt")]);
    }

    #[test]
    fn test_missing_branch_is_empty() {
        let (repo, dir) = setup_repo();
        commit_on(&repo, "refs/heads/main", None, &[("a.txt", "one\n")]);
        assert!(branch_patch(dir.path(), "main", "kiln/gone").unwrap().is_empty());
        assert!(branch_files(dir.path(), "main", "kiln/gone").unwrap().is_empty());
    }

    #[test]
    fn test_missing_trunk_is_an_error() {
        let (repo, dir) = setup_repo();
        let base = commit_on(&repo, "refs/heads/feature", None, &[("a.txt", "one\n")]);
        commit_on(&repo, "refs/heads/kiln/kl-3", Some(base), &[("b.txt", "two\n")]);
        assert!(branch_patch(dir.path(), "main", "kiln/kl-3").is_err());
    }
}
