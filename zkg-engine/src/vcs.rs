// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! VCS driver (C3): a capability-set abstraction over one repository so
//! tests can substitute an in-memory driver (§9).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Typed operations over a single repository, assumed to be backed by git
/// but expressed as an abstraction per spec §1 ("the underlying
/// version-control tool... invoked through an abstraction").
pub trait VcsDriver: Send + Sync {
    /// Clones `url` into `dest`. Requests a shallow clone when `shallow` is
    /// true; callers must only pass `shallow = true` when the target ref is
    /// a tag or branch, never a raw commit hash (§4.3).
    fn clone(&self, url: &str, dest: &Path, shallow: bool) -> Result<()>;

    /// Fetches updates for an existing clone.
    fn fetch(&self, repo: &Path) -> Result<()>;

    /// Lists tags reachable from the repository.
    fn list_tags(&self, repo: &Path) -> Result<Vec<String>>;

    /// Lists local and remote-tracking branches.
    fn list_branches(&self, repo: &Path) -> Result<Vec<String>>;

    /// Checks out `refname` (tag, branch, or commit) in the working tree.
    fn checkout(&self, repo: &Path, refname: &str) -> Result<()>;

    /// Returns the commit hash currently checked out.
    fn current_commit(&self, repo: &Path) -> Result<String>;

    /// Writes an archive of `refname` to `dest_tar`, without a full clone.
    fn archive(&self, repo: &Path, refname: &str, dest_tar: &Path) -> Result<()>;

    /// Initializes/updates submodules.
    fn submodule_update(&self, repo: &Path) -> Result<()>;

    /// Initializes a fresh repository at `path` (§4.9 "initialize a git
    /// repository in the output directory").
    fn init(&self, path: &Path) -> Result<()>;

    /// Stages every file under the repository root and creates the initial
    /// commit (§4.9 "produce an initial commit").
    fn commit_all(&self, repo: &Path, message: &str) -> Result<String>;
}

/// Detects whether `path` holds a partial (interrupted) clone rather than a
/// complete one, so the caller can re-clone instead of operating on broken
/// state (§4.3 "must tolerate interruption").
pub fn is_partial_clone(path: &Path) -> bool {
    !path.join(".git").exists()
}

/// The real driver, shelling out to the `git2` bindings for structured
/// operations and to `processes::run_and_check` for the handful of
/// operations (archive, submodule update) that are simplest as a raw
/// subprocess invocation.
pub struct GitVcsDriver;

impl VcsDriver for GitVcsDriver {
    fn clone(&self, url: &str, dest: &Path, shallow: bool) -> Result<()> {
        let mut builder = git2::build::RepoBuilder::new();
        if shallow {
            let mut fetch_opts = git2::FetchOptions::new();
            fetch_opts.depth(1);
            builder.fetch_options(fetch_opts);
        }
        builder
            .clone(url, dest)
            .with_context(|| format!("git clone {url} {}", dest.display()))?;
        Ok(())
    }

    fn fetch(&self, repo: &Path) -> Result<()> {
        let repo = git2::Repository::open(repo)?;
        let mut remote = repo.find_remote("origin")?;
        remote.fetch(&[] as &[&str], None, None)?;
        Ok(())
    }

    fn list_tags(&self, repo: &Path) -> Result<Vec<String>> {
        let repo = git2::Repository::open(repo)?;
        let tags = repo.tag_names(None)?;
        Ok(tags.iter().flatten().map(str::to_owned).collect())
    }

    fn list_branches(&self, repo: &Path) -> Result<Vec<String>> {
        let repo = git2::Repository::open(repo)?;
        let mut names = Vec::new();
        for branch in repo.branches(None)? {
            let (branch, _) = branch?;
            if let Some(name) = branch.name()? {
                names.push(name.to_owned());
            }
        }
        Ok(names)
    }

    fn checkout(&self, repo: &Path, refname: &str) -> Result<()> {
        let repo = git2::Repository::open(repo)?;
        let (object, reference) = repo.revparse_ext(refname)?;
        repo.checkout_tree(&object, None)?;
        match reference {
            Some(gref) => repo.set_head(gref.name().unwrap_or(refname))?,
            None => repo.set_head_detached(object.id())?,
        }
        Ok(())
    }

    fn current_commit(&self, repo: &Path) -> Result<String> {
        let repo = git2::Repository::open(repo)?;
        let head = repo.head()?;
        let commit = head.peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    fn archive(&self, repo: &Path, refname: &str, dest_tar: &Path) -> Result<()> {
        let mut cmd = std::process::Command::new("git");
        cmd.current_dir(repo)
            .args(["archive", "--format=tar", "-o"])
            .arg(dest_tar)
            .arg(refname);
        processes::run_and_check(&mut cmd)
            .with_context(|| format!("git archive {refname} in {}", repo.display()))
    }

    fn submodule_update(&self, repo: &Path) -> Result<()> {
        let repo = git2::Repository::open(repo)?;
        for mut submodule in repo.submodules()? {
            submodule.update(true, None)?;
        }
        Ok(())
    }

    fn init(&self, path: &Path) -> Result<()> {
        git2::Repository::init(path).with_context(|| format!("git init {}", path.display()))?;
        Ok(())
    }

    fn commit_all(&self, repo: &Path, message: &str) -> Result<String> {
        let repo = git2::Repository::open(repo)?;
        let mut index = repo.index()?;
        index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
        index.write()?;
        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let signature = repo
            .signature()
            .or_else(|_| git2::Signature::now("zkg", "zkg@localhost"))?;
        let commit_id = repo.commit(Some("HEAD"), &signature, &signature, message, &tree, &[])?;
        Ok(commit_id.to_string())
    }
}

/// An in-memory test double recording calls and serving canned tag/branch
/// lists, so solver and pipeline tests never touch a real git binary (§9,
/// §10.5).
#[derive(Default)]
pub struct FakeVcsDriver {
    pub tags: std::sync::Mutex<std::collections::HashMap<PathBuf, Vec<String>>>,
    pub branches: std::sync::Mutex<std::collections::HashMap<PathBuf, Vec<String>>>,
    pub cloned: std::sync::Mutex<Vec<(String, PathBuf)>>,
}

impl VcsDriver for FakeVcsDriver {
    fn clone(&self, url: &str, dest: &Path, _shallow: bool) -> Result<()> {
        std::fs::create_dir_all(dest)?;
        std::fs::create_dir_all(dest.join(".git"))?;
        self.cloned
            .lock()
            .unwrap()
            .push((url.to_owned(), dest.to_owned()));
        Ok(())
    }

    fn fetch(&self, _repo: &Path) -> Result<()> {
        Ok(())
    }

    fn list_tags(&self, repo: &Path) -> Result<Vec<String>> {
        Ok(self.tags.lock().unwrap().get(repo).cloned().unwrap_or_default())
    }

    fn list_branches(&self, repo: &Path) -> Result<Vec<String>> {
        Ok(self
            .branches
            .lock()
            .unwrap()
            .get(repo)
            .cloned()
            .unwrap_or_default())
    }

    fn checkout(&self, _repo: &Path, _refname: &str) -> Result<()> {
        Ok(())
    }

    fn current_commit(&self, _repo: &Path) -> Result<String> {
        Ok("0000000000000000000000000000000000000000".to_owned())
    }

    fn archive(&self, _repo: &Path, _refname: &str, dest_tar: &Path) -> Result<()> {
        std::fs::write(dest_tar, b"")?;
        Ok(())
    }

    fn submodule_update(&self, _repo: &Path) -> Result<()> {
        Ok(())
    }

    fn init(&self, path: &Path) -> Result<()> {
        std::fs::create_dir_all(path.join(".git"))?;
        Ok(())
    }

    fn commit_all(&self, _repo: &Path, _message: &str) -> Result<String> {
        Ok("0000000000000000000000000000000000000000".to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn fake_driver_records_clones() {
        let driver = FakeVcsDriver::default();
        let dir = tempdir().unwrap();
        let dest = dir.path().join("bar");
        driver.clone("https://example.com/bar.git", &dest, false).unwrap();
        assert_eq!(driver.cloned.lock().unwrap().len(), 1);
        assert!(!is_partial_clone(&dest));
    }

    #[test]
    fn partial_clone_is_detected() {
        let dir = tempdir().unwrap();
        assert!(is_partial_clone(dir.path()));
    }
}
