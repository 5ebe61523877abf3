// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Advisory lock over the state directory (§5 "Shared resources", §10.6).
//!
//! A single on-disk state directory is the mutable shared resource;
//! concurrent engine invocations against it are unsupported, so a mutating
//! operation must hold this lock for its duration. Read-only operations
//! (list, info, config) never acquire it.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;

use crate::error::EngineError;

/// RAII guard over the state directory's advisory lock file, released on
/// drop the same way the teacher's `LogGuard` releases its tracing span.
pub struct StateLock {
    file: File,
    path: PathBuf,
}

impl StateLock {
    /// Acquires the lock, failing immediately with [`EngineError::Lock`] if
    /// another instance already holds it (non-blocking, matching
    /// §5 "another instance holds the state lock").
    pub fn acquire(state_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_dir)
            .with_context(|| format!("creating state directory {}", state_dir.display()))?;
        let path = state_dir.join(".zkg.lock");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("opening lock file {}", path.display()))?;
        file.try_lock_exclusive().map_err(|_| EngineError::Lock {
            reason: format!("{} is held by another process", path.display()),
        })?;
        Ok(Self { file, path })
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

impl std::fmt::Debug for StateLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StateLock({})", self.path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn second_acquire_fails_while_first_is_held() {
        let dir = tempdir().unwrap();
        let _first = StateLock::acquire(dir.path()).unwrap();
        let err = StateLock::acquire(dir.path()).unwrap_err();
        assert!(err.downcast_ref::<EngineError>().is_some());
    }

    #[test]
    fn lock_is_released_on_drop() {
        let dir = tempdir().unwrap();
        {
            let _lock = StateLock::acquire(dir.path()).unwrap();
        }
        let _lock2 = StateLock::acquire(dir.path()).unwrap();
    }
}
