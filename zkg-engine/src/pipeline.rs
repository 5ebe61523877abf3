// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Stage & install pipeline (C6): drives a resolved [`Plan`] through fetch,
//! stage preparation, build, test, and install, with whole-plan rollback.
//! The per-package ordered stages mirror the teacher's `ebuild` action
//! pipeline (`fetch` -> `build` -> `install`), generalized from Portage
//! phases to this engine's script/plugin/binary staging model.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context as _, Result};
use walkdir::WalkDir;

use crate::context::Context;
use crate::error::EngineError;
use crate::manifest::{InstalledPackage, PackageStatus};
use crate::resolver::Plan;
use crate::version::VersionKind;

/// Flags affecting pipeline behavior for a single run (§4.6, Open Question
/// (a): `--skiptests` never overrides a test failure encountered while
/// upgrading an already-installed package, even with `--force`).
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineOptions {
    pub skip_tests: bool,
    pub force: bool,
    pub add_to_load_set: bool,
}

/// Per-package build/test log paths and exit state, returned for callers
/// that want to report progress or surface failures.
#[derive(Debug, Clone)]
pub struct PackageOutcome {
    pub canonical_name: String,
    pub build_log: PathBuf,
    pub test_log: Option<PathBuf>,
}

/// An ephemeral mirror of the real stage (script/plugin/binary trees),
/// populated incrementally as each package in the plan completes, so later
/// packages in the same plan see earlier packages' artifacts without ever
/// touching the real stage until the whole plan has succeeded (§4.6
/// "Rollback").
struct StagingWorkspace {
    root: PathBuf,
}

impl StagingWorkspace {
    fn create(root: PathBuf) -> Result<Self> {
        for sub in ["scripts/packages", "plugins/packages", "bin"] {
            fs::create_dir_all(root.join(sub))
                .with_context(|| format!("mkdir -p {}", root.join(sub).display()))?;
        }
        Ok(Self { root })
    }

    fn script_dir(&self) -> PathBuf {
        self.root.join("scripts")
    }

    fn plugin_dir(&self) -> PathBuf {
        self.root.join("plugins")
    }

    fn bin_dir(&self) -> PathBuf {
        self.root.join("bin")
    }

    /// Seeds the workspace from the real stage, so a plan that installs one
    /// new package alongside N already-installed ones still builds with
    /// every existing artifact on `PATH`/load path.
    fn seed_from_real_stage(&self, ctx: &Context) -> Result<()> {
        for (real, staged) in [
            (&ctx.stage.script_dir, self.script_dir()),
            (&ctx.stage.plugin_dir, self.plugin_dir()),
            (&ctx.stage.bin_dir, self.bin_dir()),
        ] {
            if real.exists() {
                copy_dir_contents(real, &staged)?;
            }
        }
        Ok(())
    }

    /// Swaps the ephemeral workspace's trees onto the real stage; only
    /// called after every package in the plan has succeeded.
    fn commit_to_real_stage(&self, ctx: &Context) -> Result<()> {
        for (staged, real) in [
            (self.script_dir(), &ctx.stage.script_dir),
            (self.plugin_dir(), &ctx.stage.plugin_dir),
            (self.bin_dir(), &ctx.stage.bin_dir),
        ] {
            fs::create_dir_all(real)?;
            copy_dir_contents(&staged, real)?;
        }
        Ok(())
    }
}

fn copy_dir_contents(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir_all(to)?;
    for entry in WalkDir::new(from).min_depth(1) {
        let entry = entry?;
        let rel = entry.path().strip_prefix(from).unwrap();
        let dest = to.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest)?;
        } else if entry.file_type().is_symlink() {
            let target = fs::read_link(entry.path())?;
            let _ = fs::remove_file(&dest);
            std::os::unix::fs::symlink(target, &dest)?;
        } else {
            fs::copy(entry.path(), &dest)
                .with_context(|| format!("copying {} to {}", entry.path().display(), dest.display()))?;
        }
    }
    Ok(())
}

/// Executes `plan` transactionally against `ctx`: every package reaches
/// `installed` state and the manifest is updated, or nothing observable
/// changes.
pub fn execute_plan(
    ctx: &mut Context,
    plan: &Plan,
    user_var_overrides: &HashMap<String, String>,
    options: PipelineOptions,
    already_installed: &HashSet<String>,
) -> Result<Vec<InstalledPackage>> {
    ctx.lock_for_mutation()?;

    let workspace_root = ctx.layout.scratch().join(format!("stage-{}", plan.entries.len()));
    let _ = fs::remove_dir_all(&workspace_root);
    let workspace = StagingWorkspace::create(workspace_root.clone())?;
    workspace.seed_from_real_stage(ctx)?;

    let mut completed: Vec<InstalledPackage> = Vec::new();
    let quiet = !ctx.is_stdout_tty();

    for entry in &plan.entries {
        if !quiet {
            tracing::info!(package = %entry.canonical_name, "installing");
        }

        let is_upgrade = already_installed.contains(&entry.canonical_name);
        match install_one(ctx, &workspace, entry, user_var_overrides, options, is_upgrade) {
            Ok(installed) => completed.push(installed),
            Err(e) => {
                // Rollback: this package's partial artifacts were written
                // only under the ephemeral workspace, which is discarded
                // wholesale; the real stage was never touched.
                let _ = fs::remove_dir_all(&workspace_root);
                return Err(e);
            }
        }
    }

    // The real stage is only swapped from the workspace after every package
    // has succeeded.
    workspace.commit_to_real_stage(ctx)?;
    let _ = fs::remove_dir_all(&workspace_root);

    Ok(completed)
}

fn install_one(
    ctx: &Context,
    workspace: &StagingWorkspace,
    entry: &crate::resolver::PlanEntry,
    user_var_overrides: &HashMap<String, String>,
    options: PipelineOptions,
    is_upgrade: bool,
) -> Result<InstalledPackage> {
    let short_name = entry
        .canonical_name
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(&entry.canonical_name);

    // 1. Fetch.
    let clone_root = ctx.layout.package_clone(short_name);
    fetch_package(ctx, &clone_root, &entry.canonical_name, &entry.version)?;

    // `%(name)s` references in build/test commands resolve against user
    // vars, configured paths, and this package's own clone root (§3, §4.1).
    let interp_vars = crate::metadata::interpolation_vars(
        &entry.metadata.user_vars,
        user_var_overrides,
        &ctx.config,
        &clone_root,
    );

    // 3. Build.
    let build_log = ctx.layout.build_log(short_name);
    if let Some(build_command) = &entry.metadata.build_command {
        let build_command =
            crate::metadata::interpolate(&entry.canonical_name, build_command, &interp_vars)?;
        run_staged_command(
            &build_command,
            &clone_root,
            workspace,
            user_var_overrides,
            &build_log,
        )
        .map_err(|e| EngineError::BuildFailed {
            entity: entry.canonical_name.clone(),
            exit_code: extract_exit_code(&e),
            log_path: build_log.display().to_string(),
        })?;
    }

    // 4. Test.
    let test_log = if let Some(test_command) = &entry.metadata.test_command {
        let test_command =
            crate::metadata::interpolate(&entry.canonical_name, test_command, &interp_vars)?;
        let test_root = prepare_testing_clone_area(ctx, short_name, entry)?;
        let log = ctx.layout.state_dir.join("logs").join(format!("{short_name}-test.log"));
        let result = run_staged_command(&test_command, &test_root, workspace, user_var_overrides, &log);
        match result {
            Ok(()) => Some(log),
            Err(e) => {
                // An upgrade's failing test only yields with --force
                // *and* --skiptests together; a fresh install yields on
                // --skiptests alone (Open Question (a)).
                let skip_allowed = if is_upgrade {
                    options.skip_tests && options.force
                } else {
                    options.skip_tests
                };
                if skip_allowed {
                    None
                } else {
                    return Err(EngineError::TestFailed {
                        entity: entry.canonical_name.clone(),
                        exit_code: extract_exit_code(&e),
                    }
                    .into());
                }
            }
        }
    } else {
        None
    };
    let _ = test_log;

    // 5. Install: copy artifacts into the staging workspace.
    install_artifacts(workspace, &clone_root, short_name, entry)?;

    // 6. Config file preservation.
    preserve_config_files(ctx, workspace, short_name, entry)?;

    if options.add_to_load_set {
        append_to_loader_index(workspace, short_name)?;
    }

    Ok(InstalledPackage {
        canonical_name: entry.canonical_name.clone(),
        version: entry.version.clone(),
        status: if options.add_to_load_set {
            PackageStatus::Loaded
        } else {
            PackageStatus::Installed
        },
        source: entry.canonical_name.clone(),
        aliases: entry.metadata.aliases.clone(),
        template: entry.metadata.template.clone(),
    })
}

fn fetch_package(ctx: &Context, clone_root: &Path, url: &str, version: &VersionKind) -> Result<()> {
    if clone_root.exists() && !crate::vcs::is_partial_clone(clone_root) {
        ctx.vcs.fetch(clone_root)?;
    } else {
        let _ = fs::remove_dir_all(clone_root);
        let shallow = !matches!(version, VersionKind::Commit(_));
        ctx.vcs.clone(url, clone_root, shallow)?;
    }
    let refname = match version {
        VersionKind::Tag(v) => format!("v{v}"),
        VersionKind::Branch(name) => name.clone(),
        VersionKind::Commit(hash) => hash.clone(),
    };
    ctx.vcs.checkout(clone_root, &refname)?;
    ctx.vcs.submodule_update(clone_root)?;
    Ok(())
}

fn prepare_testing_clone_area(
    ctx: &Context,
    short_name: &str,
    entry: &crate::resolver::PlanEntry,
) -> Result<PathBuf> {
    let test_root = ctx.layout.testing_clones(short_name);
    let _ = fs::remove_dir_all(&test_root);
    fs::create_dir_all(&test_root)?;

    let own_clone = ctx.layout.package_clone(short_name);
    let own_test_clone = test_root.join(short_name);
    copy_dir_contents(&own_clone, &own_test_clone)?;

    for dep in &entry.metadata.depends {
        let dep_clone = ctx.layout.package_clone(&dep.name);
        if dep_clone.exists() {
            copy_dir_contents(&dep_clone, &test_root.join(&dep.name))?;
        }
    }

    Ok(own_test_clone)
}

fn run_staged_command(
    command_line: &str,
    cwd: &Path,
    workspace: &StagingWorkspace,
    user_var_overrides: &HashMap<String, String>,
    log_path: &Path,
) -> Result<()> {
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let log_file = fs::File::create(log_path)
        .with_context(|| format!("creating log {}", log_path.display()))?;

    let path_var = std::env::var_os("PATH").unwrap_or_default();
    let mut new_path = workspace.bin_dir().into_os_string();
    new_path.push(":");
    new_path.push(path_var);

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command_line)
        .current_dir(cwd)
        .env("PATH", new_path)
        .envs(user_var_overrides)
        .stdout(log_file.try_clone()?)
        .stderr(log_file);

    processes::run_and_check(&mut cmd)
}

fn extract_exit_code(err: &anyhow::Error) -> Option<i32> {
    err.to_string()
        .rsplit("exit status: ")
        .next()
        .and_then(|s| s.split_whitespace().next())
        .and_then(|s| s.parse().ok())
}

fn install_artifacts(
    workspace: &StagingWorkspace,
    clone_root: &Path,
    short_name: &str,
    entry: &crate::resolver::PlanEntry,
) -> Result<()> {
    if let Some(script_dir) = &entry.metadata.script_dir {
        let src = clone_root.join(script_dir);
        if src.exists() {
            let dest = workspace.script_dir().join("packages").join(short_name);
            copy_dir_contents(&src, &dest)?;
        }
    }

    if let Some(plugin_dir) = &entry.metadata.plugin_dir {
        let src = clone_root.join(plugin_dir);
        if src.exists() {
            let dest = workspace.plugin_dir().join("packages").join(short_name);
            copy_dir_contents(&src, &dest)?;
        }
    }

    for executable in &entry.metadata.executables {
        let src = clone_root.join(executable);
        let name = Path::new(executable)
            .file_name()
            .context("executable entry has no file name")?;
        let dest = workspace.bin_dir().join(name);
        let _ = fs::remove_file(&dest);
        std::os::unix::fs::symlink(&src, &dest)
            .with_context(|| format!("symlinking executable {}", dest.display()))?;
    }

    for alias in &entry.metadata.aliases {
        let real = workspace.script_dir().join("packages").join(short_name);
        let alias_path = workspace.script_dir().join("packages").join(alias);
        let _ = fs::remove_file(&alias_path);
        if real.exists() {
            std::os::unix::fs::symlink(short_name, &alias_path)
                .with_context(|| format!("symlinking alias {alias}"))?;
        }
    }

    Ok(())
}

/// Backs up/restores `config_files` into a directory outside the package's
/// own artifact tree, so a plain `remove` (which only deletes the package's
/// artifact tree) leaves the backups in place for a later reinstall, and only
/// `purge` removes them (§3 "Lifecycle": "Purge additionally removes any
/// backed-up user-edited config files").
fn preserve_config_files(
    ctx: &Context,
    workspace: &StagingWorkspace,
    short_name: &str,
    entry: &crate::resolver::PlanEntry,
) -> Result<()> {
    let package_dir = workspace.script_dir().join("packages").join(short_name);
    let backup_dir = config_backup_dir(ctx, short_name);
    for config_file in &entry.metadata.config_files {
        let path = package_dir.join(config_file);
        let backup = backup_dir.join(config_file);
        if path.exists() && !backup.exists() {
            if let Some(parent) = backup.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&path, &backup)
                .with_context(|| format!("backing up config file {}", path.display()))?;
        } else if backup.exists() {
            fs::copy(&backup, &path)
                .with_context(|| format!("restoring config file {}", path.display()))?;
        }
    }
    Ok(())
}

/// Where a package's preserved `config_files` live, independent of its
/// artifact tree under the stage.
pub fn config_backup_dir(ctx: &Context, short_name: &str) -> PathBuf {
    ctx.layout.state_dir.join("config-backups").join(short_name)
}

const LOAD_MARKER_ENABLED: &str = "__plugin_marker__";
const LOAD_MARKER_DISABLED: &str = "__plugin_marker__.disabled";

fn append_to_loader_index(workspace: &StagingWorkspace, short_name: &str) -> Result<()> {
    let index_path = workspace.script_dir().join("packages/packages.zeek");
    let directive = format!("@load packages/{short_name}\n");
    let existing = fs::read_to_string(&index_path).unwrap_or_default();
    if !existing.lines().any(|l| l.trim() == directive.trim()) {
        if let Some(parent) = index_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&index_path, existing + &directive)?;
    }
    Ok(())
}

/// Toggles a plugin's enabled/disabled marker file without re-installing
/// (§4.6 "Plugin enable/disable").
pub fn set_plugin_loaded(ctx: &Context, short_name: &str, loaded: bool) -> Result<()> {
    let plugin_root = ctx.stage.plugin_dir.join("packages").join(short_name);
    let enabled = plugin_root.join(LOAD_MARKER_ENABLED);
    let disabled = plugin_root.join(LOAD_MARKER_DISABLED);
    if loaded && disabled.exists() {
        fs::rename(&disabled, &enabled)?;
    } else if !loaded && enabled.exists() {
        fs::rename(&enabled, &disabled)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::capabilities::StubCapabilities;
    use crate::context::{Context, StagePaths};
    use crate::metadata::{PackageMetadata, UserConfig};
    use crate::resolver::PlanEntry;
    use crate::vcs::FakeVcsDriver;
    use tempfile::tempdir;

    fn test_context(state_dir: &Path) -> Context {
        let stage_root = state_dir.join("real-stage");
        Context::new(
            UserConfig::default(),
            state_dir,
            StagePaths {
                script_dir: stage_root.join("scripts"),
                plugin_dir: stage_root.join("plugins"),
                bin_dir: stage_root.join("bin"),
            },
            Arc::new(FakeVcsDriver::default()),
            Arc::new(StubCapabilities::default()),
        )
    }

    #[test]
    fn install_without_build_or_test_commands_succeeds() {
        let dir = tempdir().unwrap();
        let mut ctx = test_context(dir.path());

        let mut meta = PackageMetadata::default();
        meta.script_dir = None;
        let plan = Plan {
            entries: vec![PlanEntry {
                canonical_name: "bar".into(),
                version: VersionKind::Branch("master".into()),
                metadata: meta,
            }],
        };

        let installed = execute_plan(
            &mut ctx,
            &plan,
            &HashMap::new(),
            PipelineOptions::default(),
            &HashSet::new(),
        )
        .unwrap();
        assert_eq!(installed.len(), 1);
        assert_eq!(installed[0].canonical_name, "bar");
    }

    #[test]
    fn build_command_interpolates_user_var_override() {
        let dir = tempdir().unwrap();
        let mut ctx = test_context(dir.path());

        let mut meta = PackageMetadata::default();
        meta.user_vars.push(crate::metadata::UserVarSpec {
            key: "LAST_VAR".to_string(),
            default: "/tmp".to_string(),
            description: "where to put things".to_string(),
        });
        meta.build_command = Some("echo %(LAST_VAR)s".to_string());
        let plan = Plan {
            entries: vec![PlanEntry {
                canonical_name: "bar".into(),
                version: VersionKind::Branch("master".into()),
                metadata: meta,
            }],
        };

        let mut overrides = HashMap::new();
        overrides.insert("LAST_VAR".to_string(), "/home/x/sandbox".to_string());
        execute_plan(&mut ctx, &plan, &overrides, PipelineOptions::default(), &HashSet::new()).unwrap();

        let build_log = ctx.layout.build_log("bar");
        let contents = fs::read_to_string(build_log).unwrap();
        assert!(contents.contains("/home/x/sandbox"));
    }

    #[test]
    fn build_failure_does_not_touch_real_stage() {
        let dir = tempdir().unwrap();
        let mut ctx = test_context(dir.path());

        let mut meta = PackageMetadata::default();
        meta.build_command = Some("exit 1".to_string());
        let plan = Plan {
            entries: vec![PlanEntry {
                canonical_name: "bar".into(),
                version: VersionKind::Branch("master".into()),
                metadata: meta,
            }],
        };

        let result = execute_plan(
            &mut ctx,
            &plan,
            &HashMap::new(),
            PipelineOptions::default(),
            &HashSet::new(),
        );
        assert!(result.is_err());
        assert!(!ctx.stage.script_dir.exists());
    }

    #[test]
    fn upgrade_with_skiptests_alone_still_fails_on_test_failure() {
        let dir = tempdir().unwrap();
        let mut ctx = test_context(dir.path());

        let mut meta = PackageMetadata::default();
        meta.test_command = Some("exit 1".to_string());
        let plan = Plan {
            entries: vec![PlanEntry {
                canonical_name: "bar".into(),
                version: VersionKind::Branch("master".into()),
                metadata: meta,
            }],
        };
        let mut already_installed = HashSet::new();
        already_installed.insert("bar".to_string());

        let options = PipelineOptions {
            skip_tests: true,
            force: false,
            add_to_load_set: false,
        };
        let result = execute_plan(&mut ctx, &plan, &HashMap::new(), options, &already_installed);
        assert!(result.is_err());
    }

    #[test]
    fn upgrade_with_skiptests_and_force_skips_failing_test() {
        let dir = tempdir().unwrap();
        let mut ctx = test_context(dir.path());

        let mut meta = PackageMetadata::default();
        meta.test_command = Some("exit 1".to_string());
        let plan = Plan {
            entries: vec![PlanEntry {
                canonical_name: "bar".into(),
                version: VersionKind::Branch("master".into()),
                metadata: meta,
            }],
        };
        let mut already_installed = HashSet::new();
        already_installed.insert("bar".to_string());

        let options = PipelineOptions {
            skip_tests: true,
            force: true,
            add_to_load_set: false,
        };
        let installed = execute_plan(&mut ctx, &plan, &HashMap::new(), options, &already_installed).unwrap();
        assert_eq!(installed.len(), 1);
    }

    #[test]
    fn plugin_marker_toggles_between_enabled_and_disabled() {
        let dir = tempdir().unwrap();
        let ctx = test_context(dir.path());
        let plugin_root = ctx.stage.plugin_dir.join("packages/bar");
        fs::create_dir_all(&plugin_root).unwrap();
        fs::write(plugin_root.join(LOAD_MARKER_ENABLED), "").unwrap();

        set_plugin_loaded(&ctx, "bar", false).unwrap();
        assert!(plugin_root.join(LOAD_MARKER_DISABLED).exists());

        set_plugin_loaded(&ctx, "bar", true).unwrap();
        assert!(plugin_root.join(LOAD_MARKER_ENABLED).exists());
    }
}
