// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Source index (C2): a named collection of remote package indices.
//! Generalized from the teacher's `RepositorySet`/`RepositoryLookup`
//! (overlaying multiple named repositories by priority, resolving a package
//! name across them) from "ebuild repositories on disk" to "git-hosted
//! package indices".

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ini::Ini;

use crate::vcs::VcsDriver;

/// The accepted index file names, newest first (§4.2 "file name variants
/// accepted for backward compatibility").
pub const INDEX_FILE_NAMES: &[&str] = &["zkg.index.json", "index.txt", "bro-pkg.index"];

/// One entry in a source's aggregated index: a package URL and, for legacy
/// INI-format sources, its declared tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub url: String,
    pub tags: Vec<String>,
}

/// A named remote source: a git repository holding one or more index files.
pub struct Source {
    pub name: String,
    pub url: String,
    pub clone_path: PathBuf,
}

impl Source {
    /// Fetches this source's clone, cloning it fresh if absent (§4.2
    /// "refresh fetches each configured source").
    pub fn refresh(&self, vcs: &dyn VcsDriver) -> Result<()> {
        if self.clone_path.join(".git").exists() {
            vcs.fetch(&self.clone_path)
                .with_context(|| format!("refreshing source {}", self.name))?;
        } else {
            vcs.clone(&self.url, &self.clone_path, true)
                .with_context(|| format!("cloning source {}", self.name))?;
        }
        Ok(())
    }

    /// Parses whichever accepted index file is present in this source's
    /// clone, newer format preferred.
    pub fn load_entries(&self) -> Result<Vec<IndexEntry>> {
        for name in INDEX_FILE_NAMES {
            let path = self.clone_path.join(name);
            if path.exists() {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading index {}", path.display()))?;
                return parse_index(name, &text);
            }
        }
        Ok(Vec::new())
    }
}

fn parse_index(file_name: &str, text: &str) -> Result<Vec<IndexEntry>> {
    if file_name.ends_with(".index") {
        // Legacy INI format: `[name] url=... tags=...`.
        let ini = Ini::load_from_str(text).context("parsing legacy INI index")?;
        let mut entries = Vec::new();
        for (section_name, props) in ini.iter() {
            if section_name.is_none() {
                continue;
            }
            let url = props.get("url").unwrap_or_default().to_owned();
            let tags = props
                .get("tags")
                .map(|t| t.split(',').map(|s| s.trim().to_owned()).collect())
                .unwrap_or_default();
            if !url.is_empty() {
                entries.push(IndexEntry { url, tags });
            }
        }
        Ok(entries)
    } else {
        // Current format: newline-separated list of package URLs.
        Ok(text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(|url| IndexEntry {
                url: url.to_owned(),
                tags: Vec::new(),
            })
            .collect())
    }
}

/// A set of named sources overlaid by configuration order, the way the
/// teacher's `RepositorySet` overlays named ebuild repositories.
pub struct SourceSet {
    sources: Vec<Source>,
}

impl SourceSet {
    pub fn new(sources: Vec<Source>) -> Self {
        Self { sources }
    }

    pub fn refresh_all(&self, vcs: &dyn VcsDriver) -> Result<()> {
        for source in &self.sources {
            source.refresh(vcs)?;
        }
        Ok(())
    }

    /// Aggregates metadata for every package listed by every source into an
    /// index keyed by short name (§4.2 "aggregate").
    pub fn aggregate(&self, fail_on_problems: bool) -> Result<AggregateResult> {
        let mut entries: HashMap<String, IndexEntry> = HashMap::new();
        let mut problems = Vec::new();

        for source in &self.sources {
            match source.load_entries() {
                Ok(found) => {
                    for entry in found {
                        let short_name = entry
                            .url
                            .trim_end_matches('/')
                            .rsplit('/')
                            .next()
                            .unwrap_or(&entry.url)
                            .to_owned();
                        entries.insert(short_name, entry);
                    }
                }
                Err(e) => {
                    if fail_on_problems {
                        return Err(e);
                    }
                    problems.push(format!("{}: {}", source.name, e));
                }
            }
        }

        Ok(AggregateResult { entries, problems })
    }

    /// Resolves a package's URL by looking it up across all sources,
    /// preferring sources in configuration order.
    pub fn find_package_url(&self, short_name: &str) -> Option<String> {
        for source in &self.sources {
            if let Ok(entries) = source.load_entries() {
                for entry in entries {
                    let name = entry
                        .url
                        .trim_end_matches('/')
                        .rsplit('/')
                        .next()
                        .unwrap_or(&entry.url);
                    if name == short_name {
                        return Some(entry.url);
                    }
                }
            }
        }
        None
    }
}

/// The result of [`SourceSet::aggregate`]: the merged index plus any
/// non-fatal problems encountered (§7 "Warnings... metadata problems during
/// aggregation (unless --fail-on-problems)").
pub struct AggregateResult {
    pub entries: HashMap<String, IndexEntry>,
    pub problems: Vec<String>,
}

/// Writes the aggregated index back to `path` in the current (newline-list)
/// format, used by `aggregate --push` before committing/pushing.
pub fn write_aggregate(path: &Path, result: &AggregateResult) -> Result<()> {
    let mut lines: Vec<&str> = result.entries.values().map(|e| e.url.as_str()).collect();
    lines.sort_unstable();
    std::fs::write(path, lines.join("\n") + "\n")
        .with_context(|| format!("writing aggregate index {}", path.display()))
}
