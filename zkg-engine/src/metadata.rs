// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Metadata & config model (C1): per-package metadata, the user config file,
//! and `%(name)s` interpolation with cycle detection.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use ini::Ini;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::dependency::{parse_dependency_list, DependencyLine};
use crate::error::EngineError;

/// The two accepted metadata file names, newer preferred (§3, §10.6).
pub const METADATA_FILE_NAMES: &[&str] = &["zkg.meta", "bro-pkg.meta"];

/// A `(key, default, description)` entry a package declares for the user to
/// supply (§3 "user_vars").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserVarSpec {
    pub key: String,
    pub default: String,
    pub description: String,
}

/// Origin-template record written into a package created via C9 (§3, §4.9).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateRecord {
    pub source_url: String,
    pub commit: String,
    pub engine_version: String,
    pub features: Vec<String>,
    pub variables: HashMap<String, String>,
}

/// A fully parsed package metadata record (§3 "Metadata record").
#[derive(Debug, Clone, Default)]
pub struct PackageMetadata {
    pub description: String,
    pub tags: Vec<String>,
    pub credits: Vec<String>,
    pub aliases: Vec<String>,
    pub script_dir: Option<String>,
    pub plugin_dir: Option<String>,
    pub executables: Vec<String>,
    pub config_files: Vec<String>,
    pub build_command: Option<String>,
    pub test_command: Option<String>,
    pub user_vars: Vec<UserVarSpec>,
    pub depends: Vec<DependencyLine>,
    pub external_depends: Vec<DependencyLine>,
    pub suggests: Vec<DependencyLine>,
    pub template: Option<TemplateRecord>,
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Parses a package's metadata file contents (already interpolated by the
/// caller via [`interpolate`]). `entity` names the package for error
/// messages, per §7 ("each carries a message naming the offending entity").
pub fn parse_package_metadata(entity: &str, ini_text: &str) -> Result<PackageMetadata> {
    let ini = Ini::load_from_str(ini_text).map_err(|e| {
        EngineError::bad_metadata(entity, format!("failed to parse INI: {e}"))
    })?;
    let package = ini.section(Some("package")).ok_or_else(|| {
        EngineError::bad_metadata(entity, "missing mandatory [package] section")
    })?;

    let mut meta = PackageMetadata {
        description: package.get("description").unwrap_or_default().to_owned(),
        tags: package.get("tags").map(split_list).unwrap_or_default(),
        credits: package.get("credits").map(split_list).unwrap_or_default(),
        aliases: package.get("aliases").map(split_list).unwrap_or_default(),
        script_dir: package.get("script_dir").map(str::to_owned),
        plugin_dir: package.get("plugin_dir").map(str::to_owned),
        executables: package.get("executables").map(split_list).unwrap_or_default(),
        config_files: package.get("config_files").map(split_list).unwrap_or_default(),
        build_command: package.get("build_command").map(str::to_owned),
        test_command: package.get("test_command").map(str::to_owned),
        user_vars: Vec::new(),
        depends: Vec::new(),
        external_depends: Vec::new(),
        suggests: Vec::new(),
        template: None,
    };

    if let Some(section) = ini.section(Some("depends")) {
        let body = section
            .iter()
            .map(|(k, v)| format!("{k} {v}"))
            .collect::<Vec<_>>()
            .join("\n");
        meta.depends = parse_dependency_list(&body)
            .map_err(|e| EngineError::bad_metadata(entity, e.to_string()))?;
    }
    if let Some(section) = ini.section(Some("external_depends")) {
        let body = section
            .iter()
            .map(|(k, v)| format!("{k} {v}"))
            .collect::<Vec<_>>()
            .join("\n");
        meta.external_depends = parse_dependency_list(&body)
            .map_err(|e| EngineError::bad_metadata(entity, e.to_string()))?;
    }
    if let Some(section) = ini.section(Some("suggests")) {
        let body = section
            .iter()
            .map(|(k, v)| format!("{k} {v}"))
            .collect::<Vec<_>>()
            .join("\n");
        meta.suggests = parse_dependency_list(&body)
            .map_err(|e| EngineError::bad_metadata(entity, e.to_string()))?;
    }

    if let Some(section) = ini.section(Some("user_vars")) {
        for (key, raw) in section.iter() {
            // `default :: description`
            let mut parts = raw.splitn(2, "::");
            let default = parts.next().unwrap_or_default().trim().to_owned();
            let description = parts.next().unwrap_or_default().trim().to_owned();
            meta.user_vars.push(UserVarSpec {
                key: key.to_owned(),
                default,
                description,
            });
        }
    }

    if let Some(section) = ini.section(Some("template")) {
        meta.template = Some(TemplateRecord {
            source_url: section.get("source_url").unwrap_or_default().to_owned(),
            commit: section.get("commit").unwrap_or_default().to_owned(),
            engine_version: section.get("engine_version").unwrap_or_default().to_owned(),
            features: section.get("features").map(split_list).unwrap_or_default(),
            variables: HashMap::new(),
        });
    }

    Ok(meta)
}

/// Reads the metadata file at a package's clone root, trying each accepted
/// name in preference order (§3, §10.6).
pub fn read_package_metadata(entity: &str, clone_root: &Path) -> Result<PackageMetadata> {
    for name in METADATA_FILE_NAMES {
        let path = clone_root.join(name);
        if path.exists() {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            return parse_package_metadata(entity, &text);
        }
    }
    Err(EngineError::bad_metadata(
        entity,
        format!(
            "no metadata file found (tried {})",
            METADATA_FILE_NAMES.join(", ")
        ),
    )
    .into())
}

/// Resolves every package-declared user var into a single map, using the
/// priority order in [`resolve_user_var`] (CLI > env > persisted > default).
pub fn resolve_all_user_vars(
    user_vars: &[UserVarSpec],
    cli_overrides: &HashMap<String, String>,
    config: &UserConfig,
) -> HashMap<String, String> {
    let mut resolved = HashMap::new();
    for spec in user_vars {
        if let Some(v) = resolve_user_var(
            &spec.key,
            cli_overrides.get(spec.key.as_str()).map(String::as_str),
            config,
            &spec.default,
        ) {
            resolved.insert(spec.key.clone(), v);
        }
    }
    resolved
}

/// Builds the `%(name)s` interpolation vars union (§3 "Values may contain
/// %(name)s references..."): the package's resolved `user_vars`, the user
/// config's `[paths]` section, `zeek_dist`/`bro_dist` aliased to each other
/// when only one is configured, `package_base` resolved to this package's
/// clone path, and command-line overrides, which win over everything else.
pub fn interpolation_vars(
    user_vars: &[UserVarSpec],
    cli_overrides: &HashMap<String, String>,
    config: &UserConfig,
    package_base: &Path,
) -> HashMap<String, String> {
    let mut vars = resolve_all_user_vars(user_vars, cli_overrides, config);
    vars.extend(config.paths.clone());
    if let Some(zeek_dist) = config.paths.get("zeek_dist").cloned() {
        vars.entry("bro_dist".to_string()).or_insert(zeek_dist);
    }
    if let Some(bro_dist) = config.paths.get("bro_dist").cloned() {
        vars.entry("zeek_dist".to_string()).or_insert(bro_dist);
    }
    vars.insert("package_base".to_string(), package_base.display().to_string());
    vars.extend(cli_overrides.clone());
    vars
}

static INTERP_REF: Lazy<Regex> = Lazy::new(|| Regex::new(r"%\(([A-Za-z0-9_]+)\)s").unwrap());

/// Interpolates `%(name)s` references in `value` against `vars`, resolving
/// recursively (§4.1 "Interpolation"). Fails with a metadata error naming
/// the cycle on self-reference or circularity, and on any unresolved
/// reference.
pub fn interpolate(entity: &str, value: &str, vars: &HashMap<String, String>) -> Result<String> {
    interpolate_inner(entity, value, vars, &mut Vec::new())
}

fn interpolate_inner(
    entity: &str,
    value: &str,
    vars: &HashMap<String, String>,
    stack: &mut Vec<String>,
) -> Result<String> {
    let mut result = String::with_capacity(value.len());
    let mut last = 0;
    for caps in INTERP_REF.captures_iter(value) {
        let whole = caps.get(0).unwrap();
        let key = caps.get(1).unwrap().as_str();
        result.push_str(&value[last..whole.start()]);
        last = whole.end();

        if stack.iter().any(|k| k == key) {
            let mut cycle = stack.clone();
            cycle.push(key.to_owned());
            return Err(EngineError::bad_metadata(
                entity,
                format!("interpolation cycle: {}", cycle.join(" -> ")),
            )
            .into());
        }
        let raw = vars.get(key).ok_or_else(|| {
            EngineError::bad_metadata(entity, format!("unresolved interpolation reference %({key})s"))
        })?;

        stack.push(key.to_owned());
        let resolved = interpolate_inner(entity, raw, vars, stack)?;
        stack.pop();

        result.push_str(&resolved);
    }
    result.push_str(&value[last..]);
    Ok(result)
}

/// The `[sources]`/`[paths]`/`[user_vars]` user configuration (§6 "Config
/// file"). Values in `[paths]`/`[user_vars]` may themselves be interpolated
/// against each other and against `zeek_dist`/`bro_dist`/`package_base`, per
/// §3.
#[derive(Debug, Clone, Default)]
pub struct UserConfig {
    pub sources: HashMap<String, String>,
    pub paths: HashMap<String, String>,
    pub user_vars: HashMap<String, String>,
}

impl UserConfig {
    pub fn parse(ini_text: &str) -> Result<Self> {
        let ini = Ini::load_from_str(ini_text)
            .map_err(|e| EngineError::bad_metadata("config", format!("failed to parse INI: {e}")))?;
        let mut cfg = UserConfig::default();
        if let Some(section) = ini.section(Some("sources")) {
            cfg.sources = section.iter().map(|(k, v)| (k.to_owned(), v.to_owned())).collect();
        }
        if let Some(section) = ini.section(Some("paths")) {
            cfg.paths = section.iter().map(|(k, v)| (k.to_owned(), v.to_owned())).collect();
        }
        if let Some(section) = ini.section(Some("user_vars")) {
            cfg.user_vars = section.iter().map(|(k, v)| (k.to_owned(), v.to_owned())).collect();
        }
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::parse(&text)
    }
}

/// Resolves a single user variable in priority order: CLI override, env var,
/// persisted config answer, package-declared default (§4.1 "User vars").
pub fn resolve_user_var(
    key: &str,
    cli_override: Option<&str>,
    config: &UserConfig,
    default: &str,
) -> Option<String> {
    if let Some(v) = cli_override {
        return Some(v.to_owned());
    }
    if let Ok(v) = std::env::var(key) {
        return Some(v);
    }
    if let Some(v) = config.user_vars.get(key) {
        return Some(v.clone());
    }
    if !default.is_empty() {
        return Some(default.to_owned());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
[package]
description = A sample package
aliases = samp, samplepkg
script_dir = scripts
plugin_dir = plugin
executables = bin/tool
build_command = ./configure && make
test_command = make test

[depends]
bar = >=1.0.0
zeek = *

[user_vars]
LAST_VAR = /tmp :: where to put things
";

    #[test]
    fn parses_full_record() {
        let meta = parse_package_metadata("sample", SAMPLE).unwrap();
        assert_eq!(meta.description, "A sample package");
        assert_eq!(meta.aliases, vec!["samp", "samplepkg"]);
        assert_eq!(meta.depends.len(), 2);
        assert_eq!(meta.user_vars[0].key, "LAST_VAR");
        assert_eq!(meta.user_vars[0].default, "/tmp");
    }

    #[test]
    fn missing_package_section_is_bad_metadata() {
        let err = parse_package_metadata("sample", "[depends]\nbar = *\n").unwrap_err();
        assert!(err.to_string().contains("missing mandatory"));
    }

    #[test]
    fn interpolation_resolves_recursively() {
        let mut vars = HashMap::new();
        vars.insert("base".to_string(), "/opt".to_string());
        vars.insert("dist".to_string(), "%(base)s/zeek".to_string());
        let resolved = interpolate("sample", "%(dist)s/share", &vars).unwrap();
        assert_eq!(resolved, "/opt/zeek/share");
    }

    #[test]
    fn interpolation_cycle_is_an_error() {
        let mut vars = HashMap::new();
        vars.insert("a".to_string(), "%(b)s".to_string());
        vars.insert("b".to_string(), "%(a)s".to_string());
        let err = interpolate("sample", "%(a)s", &vars).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn interpolation_vars_prefers_env_over_default_and_cli_over_env() {
        let user_vars = vec![UserVarSpec {
            key: "LAST_VAR".to_string(),
            default: "/tmp".to_string(),
            description: "where to put things".to_string(),
        }];
        let config = UserConfig::default();
        let package_base = Path::new("/state/clones/package/sample");

        std::env::set_var("LAST_VAR", "/home/x/sandbox");
        let vars = interpolation_vars(&user_vars, &HashMap::new(), &config, package_base);
        assert_eq!(vars.get("LAST_VAR").unwrap(), "/home/x/sandbox");
        assert_eq!(vars.get("package_base").unwrap(), "/state/clones/package/sample");

        let mut overrides = HashMap::new();
        overrides.insert("LAST_VAR".to_string(), "/home/x/sandbox2".to_string());
        let vars = interpolation_vars(&user_vars, &overrides, &config, package_base);
        assert_eq!(vars.get("LAST_VAR").unwrap(), "/home/x/sandbox2");
        std::env::remove_var("LAST_VAR");
    }

    #[test]
    fn interpolation_vars_aliases_zeek_dist_and_bro_dist() {
        let mut config = UserConfig::default();
        config.paths.insert("zeek_dist".to_string(), "/opt/zeek".to_string());
        let vars = interpolation_vars(&[], &HashMap::new(), &config, Path::new("/x"));
        assert_eq!(vars.get("bro_dist").unwrap(), "/opt/zeek");
    }

    #[test]
    fn interpolation_unresolved_reference_is_an_error() {
        let vars = HashMap::new();
        assert!(interpolate("sample", "%(missing)s", &vars).is_err());
    }

    #[test]
    fn user_var_priority_order() {
        let mut config = UserConfig::default();
        config.user_vars.insert("X".to_string(), "from_config".to_string());
        assert_eq!(
            resolve_user_var("X", Some("from_cli"), &config, "default"),
            Some("from_cli".to_string())
        );
        assert_eq!(
            resolve_user_var("X", None, &config, "default"),
            Some("from_config".to_string())
        );
        let empty = UserConfig::default();
        assert_eq!(
            resolve_user_var("X", None, &empty, "default"),
            Some("default".to_string())
        );
    }
}
