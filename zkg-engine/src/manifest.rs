// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Manifest store (C7): the single source of truth for what is installed,
//! loaded, and pinned. Schema-versioned and written atomically, mirroring
//! the write-temp-then-rename idiom the teacher uses for its own JSON state
//! files.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::metadata::TemplateRecord;
use crate::version::VersionKind;

/// The current on-disk schema version. Bump this and add a migration arm in
/// [`migrate`] whenever the envelope shape changes.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

/// Status an installed package can be in (§3 "Manifest").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageStatus {
    Installed,
    Loaded,
    Pinned,
}

/// One manifest entry: everything the engine must remember about an
/// installed package independently of its clone (§3, invariant 1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstalledPackage {
    pub canonical_name: String,
    pub version: VersionKind,
    pub status: PackageStatus,
    pub source: String,
    pub aliases: Vec<String>,
    pub template: Option<TemplateRecord>,
}

impl InstalledPackage {
    pub fn short_name(&self) -> &str {
        self.canonical_name
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(&self.canonical_name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ManifestEnvelope {
    schema_version: u32,
    packages: Vec<InstalledPackage>,
}

/// The parsed, in-memory manifest plus the machinery to persist it.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    packages: Vec<InstalledPackage>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn packages(&self) -> &[InstalledPackage] {
        &self.packages
    }

    pub fn find(&self, canonical_name: &str) -> Option<&InstalledPackage> {
        self.packages.iter().find(|p| p.canonical_name == canonical_name)
    }

    pub fn find_by_alias(&self, alias: &str) -> Option<&InstalledPackage> {
        self.packages.iter().find(|p| {
            p.short_name() == alias || p.aliases.iter().any(|a| a == alias)
        })
    }

    /// Fails with [`EngineError::AliasConflict`] if any alias in `aliases`
    /// (or the short name itself) is already claimed by a different package
    /// (§3, invariant 2).
    pub fn check_alias_available(&self, canonical_name: &str, short_name: &str, aliases: &[String]) -> Result<()> {
        let mut candidates: Vec<&str> = vec![short_name];
        candidates.extend(aliases.iter().map(String::as_str));
        for candidate in candidates {
            if let Some(owner) = self.find_by_alias(candidate) {
                if owner.canonical_name != canonical_name {
                    return Err(EngineError::AliasConflict {
                        entity: canonical_name.to_owned(),
                        alias: candidate.to_owned(),
                        owner: owner.canonical_name.clone(),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    pub fn upsert(&mut self, package: InstalledPackage) {
        if let Some(existing) = self
            .packages
            .iter_mut()
            .find(|p| p.canonical_name == package.canonical_name)
        {
            *existing = package;
        } else {
            self.packages.push(package);
        }
    }

    pub fn remove(&mut self, canonical_name: &str) -> Option<InstalledPackage> {
        let idx = self.packages.iter().position(|p| p.canonical_name == canonical_name)?;
        Some(self.packages.remove(idx))
    }

    pub fn set_status(&mut self, canonical_name: &str, status: PackageStatus) -> Result<()> {
        let entry = self
            .packages
            .iter_mut()
            .find(|p| p.canonical_name == canonical_name)
            .ok_or_else(|| EngineError::Manifest {
                reason: format!("no manifest entry for {canonical_name}"),
            })?;
        entry.status = status;
        Ok(())
    }

    pub fn is_pinned(&self, canonical_name: &str) -> bool {
        self.find(canonical_name)
            .map(|p| p.status == PackageStatus::Pinned)
            .unwrap_or(false)
    }

    /// Reads the manifest from `path`, tolerating older schema versions by
    /// migration. A missing file is treated as an empty manifest.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading manifest {}", path.display()))?;
        let raw: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| EngineError::Manifest { reason: format!("invalid JSON: {e}") })?;
        let envelope = migrate(raw)?;
        Ok(Self {
            packages: envelope.packages,
        })
    }

    /// Writes the manifest atomically: serialize to a temp file in the same
    /// directory, then rename over the target (§4.7 "writes are atomic").
    pub fn save(&self, path: &Path) -> Result<()> {
        let envelope = ManifestEnvelope {
            schema_version: CURRENT_SCHEMA_VERSION,
            packages: self.packages.clone(),
        };
        let json = serde_json::to_string_pretty(&envelope)
            .context("serializing manifest")?;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;
        let tmp = dir.join(format!(
            ".{}.tmp",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("manifest")
        ));
        std::fs::write(&tmp, json)
            .with_context(|| format!("writing temp manifest {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("renaming manifest into place at {}", path.display()))?;
        Ok(())
    }
}

/// Migrates an on-disk envelope of unknown schema version up to
/// [`CURRENT_SCHEMA_VERSION`], one step at a time.
fn migrate(mut raw: serde_json::Value) -> Result<ManifestEnvelope> {
    let mut version = raw
        .get("schema_version")
        .and_then(|v| v.as_u64())
        .unwrap_or(1) as u32;

    if version == 1 {
        raw = migrate_v1_to_v2(raw);
        version = 2;
    }

    if version != CURRENT_SCHEMA_VERSION {
        return Err(EngineError::Manifest {
            reason: format!("unsupported manifest schema version {version}"),
        }
        .into());
    }

    serde_json::from_value(raw).map_err(|e| {
        EngineError::Manifest {
            reason: format!("malformed manifest envelope: {e}"),
        }
        .into()
    })
}

/// v1 manifests stored `status` as a lowercase string without the
/// `snake_case` normalization and had no `aliases` field. Add the missing
/// field and bump the version tag.
fn migrate_v1_to_v2(mut raw: serde_json::Value) -> serde_json::Value {
    if let Some(packages) = raw.get_mut("packages").and_then(|p| p.as_array_mut()) {
        for package in packages {
            if let Some(obj) = package.as_object_mut() {
                obj.entry("aliases").or_insert_with(|| serde_json::json!([]));
                obj.entry("template").or_insert(serde_json::Value::Null);
            }
        }
    }
    raw["schema_version"] = serde_json::json!(2);
    raw
}

/// Builds a map from every known short name/alias to its owning package's
/// canonical name, for quick lookup during resolution (§3 invariant 2).
pub fn alias_index(manifest: &Manifest) -> HashMap<String, String> {
    let mut index = HashMap::new();
    for package in manifest.packages() {
        index.insert(package.short_name().to_owned(), package.canonical_name.clone());
        for alias in &package.aliases {
            index.insert(alias.clone(), package.canonical_name.clone());
        }
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample(name: &str) -> InstalledPackage {
        InstalledPackage {
            canonical_name: name.to_owned(),
            version: VersionKind::Branch("master".into()),
            status: PackageStatus::Installed,
            source: "https://example.com".into(),
            aliases: vec![],
            template: None,
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        let mut manifest = Manifest::new();
        manifest.upsert(sample("github.com/zeek/bar"));
        manifest.save(&path).unwrap();

        let loaded = Manifest::load(&path).unwrap();
        assert_eq!(loaded.packages().len(), 1);
        assert_eq!(loaded.packages()[0].canonical_name, "github.com/zeek/bar");
    }

    #[test]
    fn missing_file_is_empty_manifest() {
        let dir = tempdir().unwrap();
        let manifest = Manifest::load(&dir.path().join("missing.json")).unwrap();
        assert!(manifest.packages().is_empty());
    }

    #[test]
    fn migrates_v1_schema_adding_aliases_field() {
        let v1 = serde_json::json!({
            "schema_version": 1,
            "packages": [{
                "canonical_name": "bar",
                "version": {"kind": "Branch", "value": "master"},
                "status": "installed",
                "source": "https://example.com",
            }]
        });
        let envelope = migrate(v1).unwrap();
        assert_eq!(envelope.packages[0].aliases, Vec::<String>::new());
    }

    #[test]
    fn alias_conflict_is_detected() {
        let mut manifest = Manifest::new();
        let mut pkg = sample("github.com/zeek/bar");
        pkg.aliases = vec!["samp".to_string()];
        manifest.upsert(pkg);

        let err = manifest
            .check_alias_available("github.com/zeek/baz", "baz", &["samp".to_string()])
            .unwrap_err();
        assert!(err.to_string().contains("conflicts"));
    }

    #[test]
    fn pinned_status_is_tracked() {
        let mut manifest = Manifest::new();
        manifest.upsert(sample("bar"));
        manifest.set_status("bar", PackageStatus::Pinned).unwrap();
        assert!(manifest.is_pinned("bar"));
    }
}
