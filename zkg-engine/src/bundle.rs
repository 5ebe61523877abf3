// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bundle engine (C8): packs/unpacks a self-contained snapshot of a package
//! set for offline transfer. Generalized from the teacher's tar-based
//! archive output (`durabletree`/archive writing in the build pipeline) to a
//! package-set transport format.

use std::collections::HashSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::context::Context as EngineContext;
use crate::error::Warning;
use crate::version::VersionKind;

/// One line of `manifest.txt`: `/<source>/<author>/<name> = <version-or-branch>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleEntry {
    pub canonical_name: String,
    pub version: VersionKind,
}

impl BundleEntry {
    fn format_line(&self) -> String {
        format!("{} = {}", self.canonical_name, self.version)
    }

    fn parse_line(line: &str) -> Result<Self> {
        let (name, version) = line
            .split_once('=')
            .with_context(|| format!("malformed manifest.txt line: {line:?}"))?;
        let name = name.trim().to_owned();
        let version = version.trim();
        let version = if let Some(branch) = version.strip_prefix("branch=") {
            VersionKind::Branch(branch.to_owned())
        } else if version.len() == 40 && version.chars().all(|c| c.is_ascii_hexdigit()) {
            VersionKind::Commit(version.to_owned())
        } else {
            VersionKind::Tag(crate::version::parse_tag(version)?)
        };
        Ok(BundleEntry {
            canonical_name: name,
            version,
        })
    }
}

/// Creates a bundle at `dest_tar_gz` containing `entries`. Packages whose
/// clone already exists in the clone area are reused from there rather than
/// re-cloned (§4.8 "the remaining packages' full clones are reused").
pub fn create_bundle(
    ctx: &EngineContext,
    entries: &[(BundleEntry, PathBuf)],
    dest_tar_gz: &Path,
) -> Result<()> {
    let scratch = ctx.layout.scratch_bundle();
    let _ = fs::remove_dir_all(&scratch);
    fs::create_dir_all(&scratch)?;

    let mut manifest_lines = Vec::new();
    for (entry, clone_root) in entries {
        manifest_lines.push(entry.format_line());
        let dest = scratch.join(sanitize(&entry.canonical_name));
        copy_tree(clone_root, &dest)?;
    }
    fs::write(scratch.join("manifest.txt"), manifest_lines.join("\n") + "\n")?;

    let tar_gz = File::create(dest_tar_gz)
        .with_context(|| format!("creating bundle {}", dest_tar_gz.display()))?;
    let encoder = GzEncoder::new(tar_gz, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append_dir_all(".", &scratch)?;
    builder.finish()?;

    fs::remove_dir_all(&scratch)?;
    Ok(())
}

/// Unpacks `tar_gz` into the clone area and returns the parsed manifest
/// entries for the caller (typically the orchestrator) to run the stage
/// pipeline over, plus non-fatal warnings for entries whose dependencies
/// reference built-in capabilities the current platform doesn't advertise
/// (§4.8 "Unbundle").
pub fn unbundle(
    ctx: &EngineContext,
    tar_gz: &Path,
    known_builtin_capabilities: &[String],
) -> Result<(Vec<BundleEntry>, Vec<Warning>)> {
    let scratch = ctx.layout.scratch_untar();
    let _ = fs::remove_dir_all(&scratch);
    fs::create_dir_all(&scratch)?;

    let file = File::open(tar_gz).with_context(|| format!("opening bundle {}", tar_gz.display()))?;
    let decoder = GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);
    archive.unpack(&scratch)?;

    let manifest_text = fs::read_to_string(scratch.join("manifest.txt"))
        .context("reading bundle manifest.txt")?;
    let entries: Vec<BundleEntry> = manifest_text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(BundleEntry::parse_line)
        .collect::<Result<_>>()?;

    let mut warnings = Vec::new();
    let known: HashSet<&str> = known_builtin_capabilities.iter().map(String::as_str).collect();

    for entry in &entries {
        let short_name = entry
            .canonical_name
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(&entry.canonical_name);
        let src = scratch.join(sanitize(&entry.canonical_name));
        let dest = ctx.layout.package_clone(short_name);
        if src.exists() {
            let _ = fs::remove_dir_all(&dest);
            copy_tree(&src, &dest)?;

            if let Ok(metadata) = crate::metadata::read_package_metadata(short_name, &dest) {
                for dep in &metadata.depends {
                    let kind = crate::dependency::classify_name(&dep.name, known_builtin_capabilities);
                    if matches!(kind, crate::dependency::DependencyKind::BuiltinCapability(_))
                        && !known.contains(dep.name.as_str())
                    {
                        warnings.push(Warning::new(
                            entry.canonical_name.clone(),
                            format!(
                                "declares built-in capability {} ({}), not advertised by this platform",
                                dep.name, dep.constraint
                            ),
                        ));
                    }
                }
            }
        }
    }

    fs::remove_dir_all(&scratch)?;
    Ok((entries, warnings))
}

fn sanitize(canonical_name: &str) -> String {
    canonical_name.replace(['/', ':'], "_")
}

fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir_all(to)?;
    for entry in walkdir::WalkDir::new(from).min_depth(1) {
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
            fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tag_line() {
        let entry = BundleEntry::parse_line("github.com/zeek/bar = 1.2.0").unwrap();
        assert_eq!(entry.canonical_name, "github.com/zeek/bar");
        assert_eq!(entry.version, VersionKind::Tag(crate::version::parse_tag("1.2.0").unwrap()));
    }

    #[test]
    fn parses_branch_line() {
        let entry = BundleEntry::parse_line("bar = branch=master").unwrap();
        assert_eq!(entry.version, VersionKind::Branch("master".into()));
    }

    #[test]
    fn format_then_parse_round_trips() {
        let entry = BundleEntry {
            canonical_name: "bar".into(),
            version: VersionKind::Branch("release".into()),
        };
        let parsed = BundleEntry::parse_line(&entry.format_line()).unwrap();
        assert_eq!(entry, parsed);
    }
}
