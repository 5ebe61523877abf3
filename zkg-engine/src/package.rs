// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Package object (C4): the installable unit. Immutable once constructed
//! for a given resolution cycle (§4.4), with memoized metadata loading
//! mirrored from the teacher's `CachedPackageLoader` pattern.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use once_cell::sync::OnceCell;

use crate::metadata::{read_package_metadata, PackageMetadata};
use crate::version::VersionKind;

/// The three-part identity a package has (§3 "Package identity").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageIdentity {
    /// `source/author_path/short_name`, or a raw URL for packages installed
    /// outside any source.
    pub canonical_name: String,
}

impl PackageIdentity {
    pub fn new(canonical_name: impl Into<String>) -> Self {
        Self {
            canonical_name: canonical_name.into(),
        }
    }

    /// The last path component of the canonical name/URL.
    pub fn short_name(&self) -> &str {
        self.canonical_name
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(&self.canonical_name)
    }
}

/// An immutable snapshot of a package resolved to a specific version, with
/// its metadata and dependency edges.
#[derive(Debug, Clone)]
pub struct Package {
    pub identity: PackageIdentity,
    pub version: VersionKind,
    pub metadata: PackageMetadata,
    pub clone_root: PathBuf,
}

impl Package {
    pub fn short_name(&self) -> &str {
        self.identity.short_name()
    }

    /// Re-parses metadata after a checkout, returning a fresh instance
    /// rather than mutating `self` (§4.4 "reload_metadata").
    pub fn reload_metadata(&self) -> Result<Package> {
        let metadata = read_package_metadata(self.short_name(), &self.clone_root)?;
        Ok(Package {
            identity: self.identity.clone(),
            version: self.version.clone(),
            metadata,
            clone_root: self.clone_root.clone(),
        })
    }
}

/// Loads a package's metadata snapshot from its clone root.
pub struct PackageLoader;

impl PackageLoader {
    pub fn load(
        identity: PackageIdentity,
        version: VersionKind,
        clone_root: PathBuf,
    ) -> Result<Package> {
        let metadata = read_package_metadata(identity.short_name(), &clone_root)?;
        Ok(Package {
            identity,
            version,
            metadata,
            clone_root,
        })
    }
}

/// Memoizes [`PackageLoader::load`] by clone root so a resolution cycle that
/// touches the same package many times only parses its metadata once,
/// mirroring the teacher's `Arc<OnceCell<...>>`-keyed cache idiom.
#[derive(Default)]
pub struct CachedPackageLoader {
    cache: Mutex<HashMap<PathBuf, Arc<OnceCell<Package>>>>,
}

impl CachedPackageLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(
        &self,
        identity: PackageIdentity,
        version: VersionKind,
        clone_root: PathBuf,
    ) -> Result<Package> {
        let cell = {
            let mut cache = self.cache.lock().unwrap();
            cache
                .entry(clone_root.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };
        let pkg = cell.get_or_try_init(|| PackageLoader::load(identity, version, clone_root))?;
        Ok(pkg.clone())
    }
}
