// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::Path;
use std::path::PathBuf;

/// A path that exists under two different roots: an ephemeral staging root
/// and the root it will eventually be installed under. Stage-tree writes
/// (C6) are tracked with both halves so rollback and the final install move
/// can address either view without recomputing the other.
#[derive(Debug, Eq, PartialEq)]
pub struct DualPath {
    pub outside: PathBuf,
    pub inside: PathBuf,
}

impl DualPath {
    pub fn join<P: AsRef<Path>>(&self, path: P) -> DualPath {
        Self {
            outside: self.outside.join(&path),
            inside: self.inside.join(&path),
        }
    }
}
