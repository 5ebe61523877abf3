// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Built-in capability query (§4.1, §4.5, §4.8, §10.6).
//!
//! A *built-in capability* is a dependency name satisfied by a facility the
//! host platform exposes rather than by an installable package (e.g. a
//! native plugin bundled with the platform itself). The host platform's own
//! configuration tool is out of scope (§1); this trait is the seam a real
//! deployment plugs a query against that tool into.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use semver::Version;

/// Queries which capabilities the running platform advertises, and at what
/// version.
pub trait PlatformCapabilities: Send + Sync {
    /// Returns the advertised version of `name`, or `None` if the platform
    /// does not advertise it at all.
    fn capability_version(&self, name: &str) -> Option<Version>;

    /// The platform's own runtime version (checked against `PlatformVersion`
    /// dependencies, §4.1).
    fn platform_version(&self) -> Version;

    /// This package manager's own version (checked against
    /// `ManagerVersion` dependencies, §4.1).
    fn manager_version(&self) -> Version;
}

/// Reads a small JSON file the platform's configuration tool would have
/// produced, of the shape `{"platform_version": "...", "capabilities":
/// {"name": "version", ...}}`. Kept deliberately minimal: the platform
/// configuration tool itself is out of scope.
pub struct FileBackedCapabilities {
    platform_version: Version,
    manager_version: Version,
    capabilities: HashMap<String, Version>,
}

#[derive(serde::Deserialize)]
struct CapabilitiesFile {
    platform_version: String,
    #[serde(default)]
    capabilities: HashMap<String, String>,
}

impl FileBackedCapabilities {
    pub fn load(path: &Path, manager_version: Version) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading capabilities file {}", path.display()))?;
        let parsed: CapabilitiesFile = serde_json::from_str(&text)
            .with_context(|| format!("parsing capabilities file {}", path.display()))?;
        let platform_version = crate::version::parse_tag(&parsed.platform_version)?;
        let capabilities = parsed
            .capabilities
            .into_iter()
            .filter_map(|(name, v)| crate::version::parse_tag(&v).ok().map(|v| (name, v)))
            .collect();
        Ok(Self {
            platform_version,
            manager_version,
            capabilities,
        })
    }
}

impl PlatformCapabilities for FileBackedCapabilities {
    fn capability_version(&self, name: &str) -> Option<Version> {
        self.capabilities.get(name).cloned()
    }

    fn platform_version(&self) -> Version {
        self.platform_version.clone()
    }

    fn manager_version(&self) -> Version {
        self.manager_version.clone()
    }
}

/// An in-memory stub for tests.
#[derive(Default)]
pub struct StubCapabilities {
    pub platform_version: Option<Version>,
    pub manager_version: Option<Version>,
    pub capabilities: HashMap<String, Version>,
}

impl PlatformCapabilities for StubCapabilities {
    fn capability_version(&self, name: &str) -> Option<Version> {
        self.capabilities.get(name).cloned()
    }

    fn platform_version(&self) -> Version {
        self.platform_version
            .clone()
            .unwrap_or_else(|| Version::new(0, 0, 0))
    }

    fn manager_version(&self) -> Version {
        self.manager_version
            .clone()
            .unwrap_or_else(|| Version::new(0, 0, 0))
    }
}
