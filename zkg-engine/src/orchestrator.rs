// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Operation orchestrator (C10): the public verbs named in §4.10, composing
//! the solver (C5), pipeline (C6), manifest store (C7), bundle engine (C8),
//! and template engine (C9) transactionally. Modeled as a set of free
//! functions taking a [`Context`] by reference, the way `bin/alchemist`'s
//! `Commands` enum dispatches into free functions rather than a god object
//! (Design Notes §9: "pass a context object... rather than consulting
//! module-level singletons").

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};

use crate::bundle::{self, BundleEntry};
use crate::context::Context;
use crate::error::{EngineError, Warning};
use crate::manifest::{InstalledPackage, Manifest, PackageStatus};
use crate::metadata::{PackageMetadata, TemplateRecord};
use crate::pipeline::{self, PipelineOptions};
use crate::resolver::{self, Candidate, CandidateSource, Plan, Request};
use crate::source::{Source, SourceSet};
use crate::template;
use crate::version::{Constraint, VersionKind};

fn short_name_of(canonical_name: &str) -> &str {
    canonical_name
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(canonical_name)
}

/// Builds the configured [`SourceSet`] from the user config's `[sources]`
/// section, rooted under the state directory's source clone area.
pub fn load_source_set(ctx: &Context) -> SourceSet {
    let sources = ctx
        .config
        .sources
        .iter()
        .map(|(name, url)| Source {
            name: name.clone(),
            url: url.clone(),
            clone_path: ctx.layout.source_clone(name),
        })
        .collect();
    SourceSet::new(sources)
}

/// Resolves version candidates for the solver (C5) by consulting, in order,
/// an already-installed package's own clone, and the configured sources for
/// anything not yet cloned. Generalized from the teacher's
/// `PackageResolver::find_packages` (which reads ebuilds off disk) into a
/// driver that enumerates a git remote's tags/branches on demand.
struct GitCandidateSource<'a> {
    ctx: &'a Context,
    manifest: &'a Manifest,
    sources: &'a SourceSet,
}

impl<'a> CandidateSource for GitCandidateSource<'a> {
    fn candidates(&self, canonical_name: &str) -> Result<Vec<Candidate>> {
        let short_name = short_name_of(canonical_name);
        let url = if canonical_name.contains("://") || canonical_name.starts_with("git@") {
            canonical_name.to_owned()
        } else if let Some(installed) = self.manifest.find(canonical_name) {
            installed.source.clone()
        } else if let Some(url) = self.sources.find_package_url(short_name) {
            url
        } else {
            return Ok(Vec::new());
        };

        let clone_root = self.ctx.layout.package_clone(short_name);
        if !clone_root.exists() || crate::vcs::is_partial_clone(&clone_root) {
            let _ = std::fs::remove_dir_all(&clone_root);
            self.ctx
                .vcs
                .clone(&url, &clone_root, true)
                .with_context(|| format!("cloning {canonical_name} to evaluate candidates"))?;
        } else {
            // Best-effort refresh; a stale clone still yields a usable (if
            // outdated) candidate set rather than aborting resolution.
            let _ = self.ctx.vcs.fetch(&clone_root);
        }

        let mut candidates = Vec::new();

        for tag in self.ctx.vcs.list_tags(&clone_root).unwrap_or_default() {
            let Ok(version) = crate::version::parse_tag(&tag) else {
                continue;
            };
            if self.ctx.vcs.checkout(&clone_root, &tag).is_err() {
                continue;
            }
            if let Ok(metadata) = crate::metadata::read_package_metadata(short_name, &clone_root) {
                candidates.push(Candidate {
                    version: VersionKind::Tag(version),
                    metadata,
                });
            }
        }

        for branch in self.ctx.vcs.list_branches(&clone_root).unwrap_or_default() {
            if self.ctx.vcs.checkout(&clone_root, &branch).is_err() {
                continue;
            }
            if let Ok(metadata) = crate::metadata::read_package_metadata(short_name, &clone_root) {
                candidates.push(Candidate {
                    version: VersionKind::Branch(branch),
                    metadata,
                });
            }
        }

        // A commit-pinned install has no tag/branch of its own; re-seed it as
        // a candidate so the pin constraint (Constraint::Commit) added in
        // resolver::pin_constraint has something to match (§4.5 step 5).
        if let Some(installed) = self.manifest.find(canonical_name) {
            if let VersionKind::Commit(hash) = &installed.version {
                if self.ctx.vcs.checkout(&clone_root, hash).is_ok() {
                    if let Ok(metadata) = crate::metadata::read_package_metadata(short_name, &clone_root) {
                        candidates.push(Candidate {
                            version: VersionKind::Commit(hash.clone()),
                            metadata,
                        });
                    }
                }
            }
        }

        Ok(candidates)
    }
}

/// A [`CandidateSource`] for `unbundle` (§4.8): each bundled package's sole
/// candidate is the exact version the bundle recorded for it, with the
/// metadata already read from its unpacked clone; any other name (an
/// already-installed package, a dependency not itself part of the bundle)
/// falls back to [`GitCandidateSource`]. This is what lets a bundled
/// package's built-in-capability requirement actually reach the solver's
/// version check instead of only producing the non-fatal warning collected
/// by `bundle::unbundle`.
struct UnbundleCandidateSource<'a> {
    bundle: &'a HashMap<String, Vec<Candidate>>,
    git: GitCandidateSource<'a>,
}

impl<'a> CandidateSource for UnbundleCandidateSource<'a> {
    fn candidates(&self, canonical_name: &str) -> Result<Vec<Candidate>> {
        if let Some(candidates) = self.bundle.get(canonical_name) {
            return Ok(candidates.clone());
        }
        self.git.candidates(canonical_name)
    }
}

/// Resolves `requests` against the manifest and source set, then executes
/// only the subset of the resulting plan that differs from what's already on
/// disk (a package not yet in the manifest, or resolved to a version other
/// than its manifest entry). Unaffected dependencies are left alone; the
/// pipeline still observes their artifacts via `seed_from_real_stage`, so
/// nothing is lost by not re-running their build/test stages. This is the
/// one point where this engine deliberately narrows the solver's full-graph
/// re-validation (every installed package is a solver node, per §4.5 step 1)
/// down to an actual unit of work, matching both `install`'s "don't touch
/// unrelated packages" and `upgrade`'s "only the named targets move".
fn resolve_and_execute(
    ctx: &mut Context,
    requests: &[Request],
    manifest: Manifest,
    user_var_overrides: &HashMap<String, String>,
    options: PipelineOptions,
) -> Result<Vec<InstalledPackage>> {
    let source_set = load_source_set(ctx);

    let plan = {
        let candidate_source = GitCandidateSource {
            ctx: &*ctx,
            manifest: &manifest,
            sources: &source_set,
        };
        resolver::resolve(requests, &manifest, &candidate_source, ctx.capabilities.as_ref())?
    };

    let mut to_execute = Plan::default();
    for entry in plan.entries {
        let unchanged = manifest
            .find(&entry.canonical_name)
            .map(|installed| installed.version == entry.version)
            .unwrap_or(false);
        if !unchanged {
            to_execute.entries.push(entry);
        }
    }

    // Alias pre-check (invariant 2): every newly-introduced package's short
    // name and declared aliases must be free before any mutation happens.
    for entry in &to_execute.entries {
        if manifest.find(&entry.canonical_name).is_none() {
            manifest.check_alias_available(
                &entry.canonical_name,
                short_name_of(&entry.canonical_name),
                &entry.metadata.aliases,
            )?;
        }
    }

    let already_installed: HashSet<String> =
        manifest.packages().iter().map(|p| p.canonical_name.clone()).collect();

    let installed = pipeline::execute_plan(ctx, &to_execute, user_var_overrides, options, &already_installed)?;

    let mut manifest = manifest;
    for package in &installed {
        manifest.upsert(package.clone());
    }
    manifest.save(&ctx.layout.manifest_path())?;
    Ok(installed)
}

/// `install`: resolves `requests` plus the current manifest into a plan and
/// installs whatever's new or changed. Fails without mutating anything if
/// any request targets an already-pinned package (invariant 5).
pub fn install(
    ctx: &mut Context,
    requests: &[Request],
    user_var_overrides: &HashMap<String, String>,
    options: PipelineOptions,
) -> Result<Vec<InstalledPackage>> {
    let manifest = Manifest::load(&ctx.layout.manifest_path())?;
    for request in requests {
        if manifest.is_pinned(&request.canonical_name) {
            return Err(EngineError::dependency(
                request.canonical_name.clone(),
                "package is pinned; unpin before installing a different version",
            )
            .into());
        }
    }
    resolve_and_execute(ctx, requests, manifest, user_var_overrides, options)
}

/// `upgrade`: re-resolves the named installed packages (by canonical name or
/// alias) to their newest satisfying candidate. Fails without mutating
/// anything if any target is pinned (invariant 5).
pub fn upgrade(
    ctx: &mut Context,
    names: &[String],
    user_var_overrides: &HashMap<String, String>,
    options: PipelineOptions,
) -> Result<Vec<InstalledPackage>> {
    let manifest = Manifest::load(&ctx.layout.manifest_path())?;
    let mut requests = Vec::with_capacity(names.len());
    for name in names {
        let installed = manifest
            .find(name)
            .or_else(|| manifest.find_by_alias(name))
            .ok_or_else(|| EngineError::dependency(name.clone(), "not installed"))?;
        if manifest.is_pinned(&installed.canonical_name) {
            return Err(EngineError::dependency(
                installed.canonical_name.clone(),
                "package is pinned; unpin before upgrading",
            )
            .into());
        }
        requests.push(Request {
            canonical_name: installed.canonical_name.clone(),
            constraint: Constraint::Any,
        });
    }
    resolve_and_execute(ctx, &requests, manifest, user_var_overrides, options)
}

fn remove_loader_directive(ctx: &Context, short_name: &str) -> Result<()> {
    let index_path = ctx.stage.loader_index();
    let directive = format!("@load packages/{short_name}");
    if let Ok(existing) = std::fs::read_to_string(&index_path) {
        let filtered: String = existing
            .lines()
            .filter(|line| line.trim() != directive)
            .map(|line| format!("{line}\n"))
            .collect();
        std::fs::write(&index_path, filtered)?;
    }
    Ok(())
}

fn add_loader_directive(ctx: &Context, short_name: &str) -> Result<()> {
    let index_path = ctx.stage.loader_index();
    let directive = format!("@load packages/{short_name}\n");
    let existing = std::fs::read_to_string(&index_path).unwrap_or_default();
    if !existing.lines().any(|line| line.trim() == directive.trim()) {
        if let Some(parent) = index_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&index_path, existing + &directive)?;
    }
    Ok(())
}

fn remove_stage_artifacts(ctx: &Context, entry: &InstalledPackage, executables: &[String]) -> Result<()> {
    let short_name = entry.short_name();
    let _ = std::fs::remove_dir_all(ctx.stage.script_dir.join("packages").join(short_name));
    let _ = std::fs::remove_dir_all(ctx.stage.plugin_dir.join("packages").join(short_name));
    for alias in &entry.aliases {
        let _ = std::fs::remove_file(ctx.stage.script_dir.join("packages").join(alias));
    }
    for executable in executables {
        if let Some(file_name) = Path::new(executable).file_name() {
            let _ = std::fs::remove_file(ctx.stage.bin_dir.join(file_name));
        }
    }
    remove_loader_directive(ctx, short_name)?;
    Ok(())
}

/// `remove`: deletes a package's clone, staged artifacts, and loader-index
/// entry, and drops its manifest entry. Preserved config-file backups are
/// left in place for a later reinstall (§3 "Lifecycle"); only `purge`
/// deletes them. Fails without mutating anything if the package is pinned.
pub fn remove(ctx: &mut Context, name: &str) -> Result<()> {
    ctx.lock_for_mutation()?;
    let mut manifest = Manifest::load(&ctx.layout.manifest_path())?;
    let entry = manifest
        .find(name)
        .or_else(|| manifest.find_by_alias(name))
        .cloned()
        .ok_or_else(|| EngineError::dependency(name.to_owned(), "not installed"))?;
    if entry.status == PackageStatus::Pinned {
        return Err(EngineError::dependency(
            entry.canonical_name.clone(),
            "package is pinned; unpin before removing",
        )
        .into());
    }

    let clone_root = ctx.layout.package_clone(entry.short_name());
    // Read the clone's own metadata before deleting it, so executable
    // symlinks can be found by name; the manifest itself doesn't carry
    // enough to reconstruct them, and reading it here (instead of adding it
    // to the manifest schema) avoids a needless schema bump.
    let executables = crate::metadata::read_package_metadata(entry.short_name(), &clone_root)
        .map(|metadata| metadata.executables)
        .unwrap_or_default();

    remove_stage_artifacts(ctx, &entry, &executables)?;
    let _ = std::fs::remove_dir_all(&clone_root);

    manifest.remove(&entry.canonical_name);
    manifest.save(&ctx.layout.manifest_path())?;
    Ok(())
}

/// `purge`: `remove` plus deletion of any preserved config-file backups.
pub fn purge(ctx: &mut Context, name: &str) -> Result<()> {
    let manifest = Manifest::load(&ctx.layout.manifest_path())?;
    let entry = manifest.find(name).or_else(|| manifest.find_by_alias(name)).cloned();
    remove(ctx, name)?;
    if let Some(entry) = entry {
        let backup_dir = pipeline::config_backup_dir(ctx, entry.short_name());
        let _ = std::fs::remove_dir_all(backup_dir);
    }
    Ok(())
}

/// `load`: adds the package to the load set (loader-index directive) and
/// flips its plugin marker, if any, to enabled.
pub fn load(ctx: &mut Context, name: &str) -> Result<()> {
    ctx.lock_for_mutation()?;
    let mut manifest = Manifest::load(&ctx.layout.manifest_path())?;
    let entry = manifest
        .find(name)
        .or_else(|| manifest.find_by_alias(name))
        .cloned()
        .ok_or_else(|| EngineError::dependency(name.to_owned(), "not installed"))?;

    add_loader_directive(ctx, entry.short_name())?;
    pipeline::set_plugin_loaded(ctx, entry.short_name(), true)?;
    manifest.set_status(&entry.canonical_name, PackageStatus::Loaded)?;
    manifest.save(&ctx.layout.manifest_path())?;
    Ok(())
}

/// `unload`: removes the loader-index directive and flips the plugin marker
/// to disabled, without uninstalling.
pub fn unload(ctx: &mut Context, name: &str) -> Result<()> {
    ctx.lock_for_mutation()?;
    let mut manifest = Manifest::load(&ctx.layout.manifest_path())?;
    let entry = manifest
        .find(name)
        .or_else(|| manifest.find_by_alias(name))
        .cloned()
        .ok_or_else(|| EngineError::dependency(name.to_owned(), "not installed"))?;

    remove_loader_directive(ctx, entry.short_name())?;
    pipeline::set_plugin_loaded(ctx, entry.short_name(), false)?;
    manifest.set_status(&entry.canonical_name, PackageStatus::Installed)?;
    manifest.save(&ctx.layout.manifest_path())?;
    Ok(())
}

/// `pin`: marks a package so no later operation upgrades, downgrades, or
/// replaces it short of `unpin` (invariant 5).
pub fn pin(ctx: &mut Context, name: &str) -> Result<()> {
    ctx.lock_for_mutation()?;
    let mut manifest = Manifest::load(&ctx.layout.manifest_path())?;
    let entry = manifest
        .find(name)
        .or_else(|| manifest.find_by_alias(name))
        .cloned()
        .ok_or_else(|| EngineError::dependency(name.to_owned(), "not installed"))?;
    manifest.set_status(&entry.canonical_name, PackageStatus::Pinned)?;
    manifest.save(&ctx.layout.manifest_path())?;
    Ok(())
}

/// `unpin`: reverts a pinned package to plain `installed` status (or
/// `loaded`, if it's currently in the load set).
pub fn unpin(ctx: &mut Context, name: &str) -> Result<()> {
    ctx.lock_for_mutation()?;
    let mut manifest = Manifest::load(&ctx.layout.manifest_path())?;
    let entry = manifest
        .find(name)
        .or_else(|| manifest.find_by_alias(name))
        .cloned()
        .ok_or_else(|| EngineError::dependency(name.to_owned(), "not installed"))?;
    let loaded = std::fs::read_to_string(ctx.stage.loader_index())
        .map(|text| text.lines().any(|line| line.trim() == format!("@load packages/{}", entry.short_name())))
        .unwrap_or(false);
    let status = if loaded { PackageStatus::Loaded } else { PackageStatus::Installed };
    manifest.set_status(&entry.canonical_name, status)?;
    manifest.save(&ctx.layout.manifest_path())?;
    Ok(())
}

/// `refresh`: fetches every configured source.
pub fn refresh(ctx: &Context) -> Result<()> {
    load_source_set(ctx).refresh_all(ctx.vcs.as_ref())
}

/// `list`: every manifest entry, installed/loaded/pinned alike. Read-only;
/// does not take the state lock (§5).
pub fn list(ctx: &Context) -> Result<Vec<InstalledPackage>> {
    Ok(Manifest::load(&ctx.layout.manifest_path())?.packages().to_vec())
}

/// `search`: package short names across every configured source whose name
/// contains `query`, sorted for reproducible output.
pub fn search(ctx: &Context, query: &str) -> Result<Vec<String>> {
    let result = load_source_set(ctx).aggregate(false)?;
    let mut names: Vec<String> = result
        .entries
        .keys()
        .filter(|name| name.contains(query))
        .cloned()
        .collect();
    names.sort();
    Ok(names)
}

/// `info`: a package's metadata, read from its clone if installed, or from a
/// disposable shallow clone of its default ref otherwise.
pub fn info(ctx: &Context, name: &str) -> Result<PackageMetadata> {
    let manifest = Manifest::load(&ctx.layout.manifest_path())?;
    if let Some(installed) = manifest.find(name).or_else(|| manifest.find_by_alias(name)) {
        let short_name = installed.short_name();
        return crate::metadata::read_package_metadata(short_name, &ctx.layout.package_clone(short_name));
    }

    let source_set = load_source_set(ctx);
    let short_name = short_name_of(name);
    let url = source_set
        .find_package_url(short_name)
        .unwrap_or_else(|| name.to_owned());

    let scratch = ctx.layout.scratch().join("info").join(short_name);
    let _ = std::fs::remove_dir_all(&scratch);
    ctx.vcs
        .clone(&url, &scratch, true)
        .with_context(|| format!("cloning {name} to read its metadata"))?;
    let metadata = crate::metadata::read_package_metadata(short_name, &scratch);
    let _ = std::fs::remove_dir_all(&scratch);
    metadata
}

/// `test`: re-runs `test_command` for an already-installed package in a
/// fresh testing clone area, without touching the manifest or real stage.
/// Read-only from the manifest/stage's perspective, so no lock is taken.
pub fn test(ctx: &Context, name: &str) -> Result<Option<PathBuf>> {
    let manifest = Manifest::load(&ctx.layout.manifest_path())?;
    let entry = manifest
        .find(name)
        .or_else(|| manifest.find_by_alias(name))
        .cloned()
        .ok_or_else(|| EngineError::dependency(name.to_owned(), "not installed"))?;
    let short_name = entry.short_name().to_owned();
    let clone_root = ctx.layout.package_clone(&short_name);
    let metadata = crate::metadata::read_package_metadata(&short_name, &clone_root)?;

    let Some(test_command) = &metadata.test_command else {
        return Ok(None);
    };

    let test_root = ctx.layout.testing_clones(&short_name);
    let _ = std::fs::remove_dir_all(&test_root);
    std::fs::create_dir_all(&test_root)?;
    let own_test_clone = test_root.join(&short_name);
    copy_dir(&clone_root, &own_test_clone)?;
    for dep in &metadata.depends {
        let dep_clone = ctx.layout.package_clone(&dep.name);
        if dep_clone.exists() {
            copy_dir(&dep_clone, &test_root.join(&dep.name))?;
        }
    }

    let interp_vars = crate::metadata::interpolation_vars(
        &metadata.user_vars,
        &HashMap::new(),
        &ctx.config,
        &clone_root,
    );
    let test_command = crate::metadata::interpolate(&short_name, test_command, &interp_vars)?;

    let log_path = ctx.layout.state_dir.join("logs").join(format!("{short_name}-test.log"));
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let log_file = std::fs::File::create(&log_path)?;
    let mut cmd = std::process::Command::new("sh");
    cmd.arg("-c")
        .arg(&test_command)
        .current_dir(&own_test_clone)
        .stdout(log_file.try_clone()?)
        .stderr(log_file);
    processes::run_and_check(&mut cmd).map_err(|e| {
        EngineError::TestFailed {
            entity: entry.canonical_name.clone(),
            exit_code: e
                .to_string()
                .rsplit("exit status: ")
                .next()
                .and_then(|s| s.split_whitespace().next())
                .and_then(|s| s.parse().ok()),
        }
    })?;
    Ok(Some(log_path))
}

fn copy_dir(from: &Path, to: &Path) -> Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in walkdir::WalkDir::new(from).min_depth(1) {
        let entry = entry?;
        let rel = entry.path().strip_prefix(from).unwrap();
        let dest = to.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&dest)?;
        } else if entry.file_type().is_symlink() {
            let target = std::fs::read_link(entry.path())?;
            let _ = std::fs::remove_file(&dest);
            std::os::unix::fs::symlink(target, &dest)?;
        } else {
            std::fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

/// `bundle`: packages `names` (or, if `None`, every installed package) into a
/// tar.gz at `dest`.
pub fn bundle(ctx: &mut Context, names: Option<&[String]>, dest: &Path) -> Result<()> {
    ctx.lock_for_mutation()?;
    let manifest = Manifest::load(&ctx.layout.manifest_path())?;
    let selected: Vec<&InstalledPackage> = match names {
        Some(names) => names
            .iter()
            .map(|name| {
                manifest
                    .find(name)
                    .or_else(|| manifest.find_by_alias(name))
                    .ok_or_else(|| EngineError::dependency(name.clone(), "not installed").into())
            })
            .collect::<Result<_>>()?,
        None => manifest.packages().iter().collect(),
    };

    let entries: Vec<(BundleEntry, PathBuf)> = selected
        .iter()
        .map(|package| {
            (
                BundleEntry {
                    canonical_name: package.canonical_name.clone(),
                    version: package.version.clone(),
                },
                ctx.layout.package_clone(package.short_name()),
            )
        })
        .collect();

    bundle::create_bundle(ctx, &entries, dest)
}

/// `unbundle`: unpacks `tar_gz`'s packages into the clone area, resolves
/// them (pinned to the exact versions the bundle recorded) through the same
/// solver used by `install`/`upgrade`, and runs the install pipeline over
/// the result. Warnings for unverifiable built-in capabilities are
/// collected by the unpack step and never block it; the resolve step right
/// after may still turn a wrong-version built-in capability into an
/// [`EngineError::VersionResolution`] (§4.8, §9 Open Question (b): both the
/// warning and the possible later solver failure are intentional).
pub fn unbundle(
    ctx: &mut Context,
    tar_gz: &Path,
    known_builtin_capabilities: &[String],
    options: PipelineOptions,
) -> Result<(Vec<InstalledPackage>, Vec<Warning>)> {
    ctx.lock_for_mutation()?;
    let (entries, warnings) = bundle::unbundle(&*ctx, tar_gz, known_builtin_capabilities)?;

    let mut manifest = Manifest::load(&ctx.layout.manifest_path())?;

    let mut bundle_candidates: HashMap<String, Vec<Candidate>> = HashMap::new();
    let mut requests = Vec::with_capacity(entries.len());
    for entry in &entries {
        let short_name = short_name_of(&entry.canonical_name);
        let clone_root = ctx.layout.package_clone(short_name);
        let metadata = crate::metadata::read_package_metadata(short_name, &clone_root)?;
        if manifest.find(&entry.canonical_name).is_none() {
            manifest.check_alias_available(&entry.canonical_name, short_name, &metadata.aliases)?;
        }
        bundle_candidates.insert(
            entry.canonical_name.clone(),
            vec![Candidate {
                version: entry.version.clone(),
                metadata,
            }],
        );
        requests.push(Request {
            canonical_name: entry.canonical_name.clone(),
            constraint: resolver::pin_constraint(&entry.version),
        });
    }

    let source_set = load_source_set(ctx);
    let resolved = {
        let candidate_source = UnbundleCandidateSource {
            bundle: &bundle_candidates,
            git: GitCandidateSource {
                ctx: &*ctx,
                manifest: &manifest,
                sources: &source_set,
            },
        };
        resolver::resolve(&requests, &manifest, &candidate_source, ctx.capabilities.as_ref())?
    };

    // Only the packages this bundle actually names are installed here;
    // `resolve` also re-validates every other already-installed package
    // (§4.5 step 1) but those stay untouched, same as `resolve_and_execute`.
    let bundled_names: HashSet<String> = entries.iter().map(|entry| entry.canonical_name.clone()).collect();
    let plan = Plan {
        entries: resolved
            .entries
            .into_iter()
            .filter(|entry| bundled_names.contains(&entry.canonical_name))
            .collect(),
    };

    let already_installed: HashSet<String> =
        manifest.packages().iter().map(|p| p.canonical_name.clone()).collect();
    let installed = pipeline::execute_plan(ctx, &plan, &HashMap::new(), options, &already_installed)?;
    for package in &installed {
        manifest.upsert(package.clone());
    }
    manifest.save(&ctx.layout.manifest_path())?;

    Ok((installed, warnings))
}

/// `create`: instantiates a new package from a template repository at
/// `template_url` into `output_dir` (C9), then initializes it as a fresh git
/// repository with the rendered tree as its initial commit.
pub fn create(
    ctx: &mut Context,
    template_url: &str,
    output_dir: &Path,
    selected_features: &[String],
    cli_variables: &HashMap<String, String>,
    force: bool,
) -> Result<TemplateRecord> {
    ctx.lock_for_mutation()?;

    let template_root = ctx.layout.template_clone(short_name_of(template_url));
    if !template_root.exists() || crate::vcs::is_partial_clone(&template_root) {
        let _ = std::fs::remove_dir_all(&template_root);
        ctx.vcs
            .clone(template_url, &template_root, true)
            .with_context(|| format!("cloning template {template_url}"))?;
    } else {
        ctx.vcs.fetch(&template_root)?;
    }

    let control_text = std::fs::read_to_string(template_root.join(template::CONTROL_FILE_NAME))
        .with_context(|| format!("reading {} in {}", template::CONTROL_FILE_NAME, template_root.display()))?;
    let control = template::parse_control_file(&control_text)?;
    let resolved_vars = template::resolve_parameters(&control, cli_variables)?;

    let record = template::instantiate(
        ctx.vcs.as_ref(),
        template_url,
        &template_root,
        output_dir,
        &control,
        selected_features,
        &resolved_vars,
        force,
    )?;

    for name in crate::metadata::METADATA_FILE_NAMES {
        let candidate = output_dir.join(name);
        if candidate.exists() {
            template::write_template_record(&candidate, &record)?;
            break;
        }
    }

    ctx.vcs.init(output_dir)?;
    ctx.vcs.commit_all(output_dir, "Initial commit from template")?;

    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::StubCapabilities;
    use crate::context::StagePaths;
    use crate::metadata::UserConfig;
    use crate::vcs::FakeVcsDriver;
    use std::sync::Arc;
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
    fn install_rejects_request_against_pinned_package() {
        let dir = tempdir().unwrap();
        let mut ctx = test_context(dir.path());
        let mut manifest = Manifest::new();
        manifest.upsert(InstalledPackage {
            canonical_name: "bar".into(),
            version: VersionKind::Tag(crate::version::parse_tag("1.0.0").unwrap()),
            status: PackageStatus::Pinned,
            source: "https://example.com/bar".into(),
            aliases: vec![],
            template: None,
        });
        manifest.save(&ctx.layout.manifest_path()).unwrap();

        let err = install(
            &mut ctx,
            &[Request {
                canonical_name: "bar".into(),
                constraint: Constraint::Any,
            }],
            &HashMap::new(),
            PipelineOptions::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("pinned"));
    }

    #[test]
    fn resolve_and_execute_skips_unchanged_packages() {
        let dir = tempdir().unwrap();
        let driver = Arc::new(FakeVcsDriver::default());
        let stage_root = dir.path().join("real-stage");
        let mut ctx = Context::new(
            UserConfig::default(),
            dir.path(),
            StagePaths {
                script_dir: stage_root.join("scripts"),
                plugin_dir: stage_root.join("plugins"),
                bin_dir: stage_root.join("bin"),
            },
            driver.clone(),
            Arc::new(StubCapabilities::default()),
        );

        // Pre-seed a complete clone at tag 1.0.0, the same version already
        // recorded in the manifest, so the solver re-resolves it to an
        // unchanged candidate.
        let clone_root = ctx.layout.package_clone("bar");
        std::fs::create_dir_all(clone_root.join(".git")).unwrap();
        std::fs::write(clone_root.join("zkg.meta"), "[package]\n").unwrap();
        driver
            .tags
            .lock()
            .unwrap()
            .insert(clone_root.clone(), vec!["1.0.0".to_string()]);

        let mut manifest = Manifest::new();
        manifest.upsert(InstalledPackage {
            canonical_name: "bar".into(),
            version: VersionKind::Tag(crate::version::parse_tag("1.0.0").unwrap()),
            status: PackageStatus::Installed,
            source: "https://example.com/bar".into(),
            aliases: vec![],
            template: None,
        });

        let installed =
            resolve_and_execute(&mut ctx, &[], manifest, &HashMap::new(), PipelineOptions::default()).unwrap();
        assert!(installed.is_empty());
    }

    #[test]
    fn pin_then_unpin_round_trips_status() {
        let dir = tempdir().unwrap();
        let mut ctx = test_context(dir.path());
        let mut manifest = Manifest::new();
        manifest.upsert(InstalledPackage {
            canonical_name: "bar".into(),
            version: VersionKind::Branch("master".into()),
            status: PackageStatus::Installed,
            source: "https://example.com/bar".into(),
            aliases: vec![],
            template: None,
        });
        manifest.save(&ctx.layout.manifest_path()).unwrap();

        pin(&mut ctx, "bar").unwrap();
        let reloaded = Manifest::load(&ctx.layout.manifest_path()).unwrap();
        assert!(reloaded.is_pinned("bar"));

        unpin(&mut ctx, "bar").unwrap();
        let reloaded = Manifest::load(&ctx.layout.manifest_path()).unwrap();
        assert!(!reloaded.is_pinned("bar"));
    }

    #[test]
    fn remove_is_rejected_for_pinned_package() {
        let dir = tempdir().unwrap();
        let mut ctx = test_context(dir.path());
        let mut manifest = Manifest::new();
        manifest.upsert(InstalledPackage {
            canonical_name: "bar".into(),
            version: VersionKind::Branch("master".into()),
            status: PackageStatus::Pinned,
            source: "https://example.com/bar".into(),
            aliases: vec![],
            template: None,
        });
        manifest.save(&ctx.layout.manifest_path()).unwrap();

        let err = remove(&mut ctx, "bar").unwrap_err();
        assert!(err.to_string().contains("pinned"));
        let reloaded = Manifest::load(&ctx.layout.manifest_path()).unwrap();
        assert!(reloaded.find("bar").is_some());
    }

    #[test]
    fn remove_of_missing_package_is_dependency_error() {
        let dir = tempdir().unwrap();
        let mut ctx = test_context(dir.path());
        let err = remove(&mut ctx, "nonexistent").unwrap_err();
        assert!(err.to_string().contains("not installed"));
    }

    #[test]
    fn unbundle_surfaces_version_resolution_error_for_wrong_version_builtin_capability() {
        // The bundled package declares a dependency on a built-in capability
        // at a version higher than the one the host platform advertises.
        // `bundle::unbundle` only warns about this (it can't tell whether
        // the *version* will satisfy anything); `orchestrator::unbundle`
        // must still run the bundled entries through the solver afterward
        // so the mismatch surfaces as a real error (§4.8, §9 Open Question
        // (b)).
        let dir = tempdir().unwrap();
        let mut capabilities = StubCapabilities::default();
        capabilities
            .capabilities
            .insert("spicy-plugin".to_string(), semver::Version::new(1, 0, 0));
        let stage_root = dir.path().join("real-stage");
        let mut ctx = Context::new(
            UserConfig::default(),
            dir.path(),
            StagePaths {
                script_dir: stage_root.join("scripts"),
                plugin_dir: stage_root.join("plugins"),
                bin_dir: stage_root.join("bin"),
            },
            Arc::new(FakeVcsDriver::default()),
            Arc::new(capabilities),
        );

        let foo_source = dir.path().join("foo-source");
        std::fs::create_dir_all(&foo_source).unwrap();
        std::fs::write(
            foo_source.join("zkg.meta"),
            "[package]\n[depends]\nspicy-plugin = >=2.0.0\n",
        )
        .unwrap();

        let bundle_path = dir.path().join("bundle.tar.gz");
        bundle::create_bundle(
            &ctx,
            &[(
                BundleEntry {
                    canonical_name: "foo".into(),
                    version: VersionKind::Tag(crate::version::parse_tag("1.0.0").unwrap()),
                },
                foo_source,
            )],
            &bundle_path,
        )
        .unwrap();

        let err = unbundle(&mut ctx, &bundle_path, &[], PipelineOptions::default()).unwrap_err();
        assert!(err.to_string().contains("does not satisfy"));

        // No manifest entry was committed for the failed package.
        let manifest = Manifest::load(&ctx.layout.manifest_path()).unwrap();
        assert!(manifest.find("foo").is_none());
    }
}
