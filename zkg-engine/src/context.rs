// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The object threaded through every C5-C10 call instead of module-level
//! globals (§9 "Global state").

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;

use crate::capabilities::PlatformCapabilities;
use crate::lock::StateLock;
use crate::metadata::UserConfig;
use crate::vcs::VcsDriver;

/// Filesystem layout rooted at the state directory (§6 "Filesystem layout").
#[derive(Debug, Clone)]
pub struct Layout {
    pub state_dir: PathBuf,
}

impl Layout {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn package_clone(&self, name: &str) -> PathBuf {
        self.state_dir.join("clones/package").join(name)
    }

    pub fn source_clone(&self, name: &str) -> PathBuf {
        self.state_dir.join("clones/source").join(name)
    }

    pub fn template_clone(&self, name: &str) -> PathBuf {
        self.state_dir.join("clones/template").join(name)
    }

    pub fn scratch(&self) -> PathBuf {
        self.state_dir.join("scratch")
    }

    pub fn scratch_bundle(&self) -> PathBuf {
        self.scratch().join("bundle")
    }

    pub fn scratch_untar(&self) -> PathBuf {
        self.scratch().join("untar")
    }

    pub fn scratch_tmpcfg(&self) -> PathBuf {
        self.scratch().join("tmpcfg")
    }

    pub fn testing_clones(&self, name: &str) -> PathBuf {
        self.state_dir.join("testing").join(name).join("clones")
    }

    pub fn testing_stage_mirror(&self, name: &str) -> PathBuf {
        self.state_dir.join("testing").join(name).join("stage-mirror")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.state_dir.join("manifest.json")
    }

    pub fn build_log(&self, name: &str) -> PathBuf {
        self.state_dir.join("logs").join(format!("{name}-build.log"))
    }
}

/// Where installed artifacts live on the host platform (§6 "Stage
/// directories"), read from the user config's `[paths]` section.
#[derive(Debug, Clone)]
pub struct StagePaths {
    pub script_dir: PathBuf,
    pub plugin_dir: PathBuf,
    pub bin_dir: PathBuf,
}

impl StagePaths {
    pub fn loader_index(&self) -> PathBuf {
        self.script_dir.join("packages/packages.zeek")
    }
}

/// Bundles the parsed config, filesystem layout, advisory lock, VCS driver,
/// and platform-capability query that every operation needs, per the design
/// notes' instruction to pass a context object rather than consult
/// module-level singletons.
pub struct Context {
    pub config: UserConfig,
    pub layout: Layout,
    pub stage: StagePaths,
    pub vcs: Arc<dyn VcsDriver>,
    pub capabilities: Arc<dyn PlatformCapabilities>,
    /// Held for the duration of a mutating operation; `None` for read-only
    /// operations, which never acquire the lock (§5).
    pub lock: Option<StateLock>,
}

impl Context {
    pub fn new(
        config: UserConfig,
        state_dir: impl Into<PathBuf>,
        stage: StagePaths,
        vcs: Arc<dyn VcsDriver>,
        capabilities: Arc<dyn PlatformCapabilities>,
    ) -> Self {
        Self {
            config,
            layout: Layout::new(state_dir),
            stage,
            vcs,
            capabilities,
            lock: None,
        }
    }

    /// Acquires the state-directory lock for a mutating operation.
    pub fn lock_for_mutation(&mut self) -> Result<()> {
        self.lock = Some(StateLock::acquire(&self.layout.state_dir)?);
        Ok(())
    }

    pub fn is_stdout_tty(&self) -> bool {
        is_terminal::IsTerminal::is_terminal(&std::io::stdout())
    }
}

pub fn resolve_stage_paths(config: &UserConfig) -> StagePaths {
    let get = |key: &str, default: &str| {
        config
            .paths
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_owned())
    };
    StagePaths {
        script_dir: PathBuf::from(get("script_dir", "/usr/share/zeek/site")),
        plugin_dir: PathBuf::from(get("plugin_dir", "/usr/lib/zeek/plugins")),
        bin_dir: PathBuf::from(get("bin_dir", "/usr/bin")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths_are_rooted_at_state_dir() {
        let layout = Layout::new("/var/lib/zkg");
        assert_eq!(
            layout.package_clone("bar"),
            Path::new("/var/lib/zkg/clones/package/bar")
        );
        assert_eq!(
            layout.manifest_path(),
            Path::new("/var/lib/zkg/manifest.json")
        );
    }

    #[test]
    fn stage_paths_fall_back_to_defaults() {
        let config = UserConfig::default();
        let stage = resolve_stage_paths(&config);
        assert_eq!(stage.script_dir, Path::new("/usr/share/zeek/site"));
    }
}
