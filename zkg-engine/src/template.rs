// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Template engine (C9): instantiates a new package from a template
//! repository. Rendering is delegated to `tera`, reused directly from the
//! teacher's own templating stack rather than hand-rolled substitution.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _, Result};
use ini::Ini;
use regex::Regex;
use tera::Tera;

use crate::error::EngineError;
use crate::metadata::TemplateRecord;
use crate::vcs::VcsDriver;

/// A template control file's `[parameters]` entry.
#[derive(Debug, Clone)]
pub struct TemplateParameter {
    pub name: String,
    pub default: Option<String>,
    pub description: String,
    pub validator: Option<Regex>,
}

/// A named additive feature: a set of extra/overridden output files.
#[derive(Debug, Clone)]
pub struct TemplateFeature {
    pub name: String,
    pub files: Vec<String>,
}

/// The parsed control file at a template repository's root.
#[derive(Debug, Clone)]
pub struct TemplateControlFile {
    pub api_version: String,
    pub parameters: Vec<TemplateParameter>,
    pub features: Vec<TemplateFeature>,
    /// Output files always rendered, independent of selected features.
    pub base_files: Vec<String>,
}

pub const CONTROL_FILE_NAME: &str = "zkg.template";

pub fn parse_control_file(text: &str) -> Result<TemplateControlFile> {
    let ini = Ini::load_from_str(text).context("parsing template control file")?;
    let template = ini
        .section(Some("template"))
        .ok_or_else(|| EngineError::bad_metadata("template", "missing [template] section"))?;
    let api_version = template.get("api_version").unwrap_or("1").to_owned();

    let mut parameters = Vec::new();
    if let Some(section) = ini.section(Some("parameters")) {
        for (name, raw) in section.iter() {
            // `default :: description :: regex` (default/regex may be empty).
            let mut parts = raw.splitn(3, "::").map(str::trim);
            let default = parts.next().filter(|s| !s.is_empty()).map(str::to_owned);
            let description = parts.next().unwrap_or_default().to_owned();
            let validator = parts
                .next()
                .filter(|s| !s.is_empty())
                .map(Regex::new)
                .transpose()
                .with_context(|| format!("invalid validator regex for parameter {name}"))?;
            parameters.push(TemplateParameter {
                name: name.to_owned(),
                default,
                description,
                validator,
            });
        }
    }

    let mut features = Vec::new();
    if let Some(section) = ini.section(Some("features")) {
        for (name, raw) in section.iter() {
            let files = raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_owned).collect();
            features.push(TemplateFeature {
                name: name.to_owned(),
                files,
            });
        }
    }

    let base_files = ini
        .section(Some("files"))
        .map(|section| section.iter().map(|(_, v)| v.to_owned()).collect())
        .unwrap_or_default();

    Ok(TemplateControlFile {
        api_version,
        parameters,
        features,
        base_files,
    })
}

/// Resolves every declared parameter, failing with a metadata error naming
/// the first unresolved required variable in non-interactive mode
/// (§4.9 "non-interactive refuses to prompt").
pub fn resolve_parameters(
    control: &TemplateControlFile,
    cli_overrides: &HashMap<String, String>,
) -> Result<HashMap<String, String>> {
    let mut resolved = HashMap::new();
    for param in &control.parameters {
        let value = cli_overrides
            .get(&param.name)
            .cloned()
            .or_else(|| std::env::var(&param.name).ok())
            .or_else(|| param.default.clone());

        let value = value.ok_or_else(|| {
            EngineError::bad_metadata(
                "template",
                format!("required variable {} has no value and no default", param.name),
            )
        })?;

        if let Some(validator) = &param.validator {
            if !validator.is_match(&value) {
                bail!(
                    "value {value:?} for variable {} does not match validator /{}/",
                    param.name,
                    validator.as_str()
                );
            }
        }

        resolved.insert(param.name.clone(), value);
    }
    Ok(resolved)
}

/// Instantiates a package from the clone at `template_root` (cloned from
/// `template_url`) into `output_dir`.
///
/// Unicode in `variables` passes through tera's UTF-8 string rendering
/// verbatim, with no escaping layer (the output is plain text/config files,
/// not HTML).
pub fn instantiate(
    vcs: &dyn VcsDriver,
    template_url: &str,
    template_root: &Path,
    output_dir: &Path,
    control: &TemplateControlFile,
    selected_features: &[String],
    variables: &HashMap<String, String>,
    force: bool,
) -> Result<TemplateRecord> {
    if output_dir.exists() {
        if !force {
            bail!(
                "output directory {} already exists; pass --force to overwrite",
                output_dir.display()
            );
        }
        std::fs::remove_dir_all(output_dir)?;
    }
    std::fs::create_dir_all(output_dir)?;

    let mut files = control.base_files.clone();
    for feature in &control.features {
        if selected_features.contains(&feature.name) {
            files.extend(feature.files.iter().cloned());
        }
    }

    let mut tera_ctx = tera::Context::new();
    for (k, v) in variables {
        tera_ctx.insert(k.as_str(), v);
    }

    let mut tera = Tera::default();
    for relative_path in &files {
        let source_path = template_root.join(relative_path);
        let source_text = std::fs::read_to_string(&source_path)
            .with_context(|| format!("reading template file {}", source_path.display()))?;
        tera.add_raw_template(relative_path, &source_text)
            .with_context(|| format!("parsing template file {relative_path}"))?;
        let rendered = tera
            .render(relative_path, &tera_ctx)
            .with_context(|| format!("rendering template file {relative_path}"))?;

        // Template source files conventionally carry a `.tera` suffix over
        // the real output file name (`zkg.meta.tera` -> `zkg.meta`); strip it
        // so the rendered tree has the file names a real package needs.
        let dest_relative = relative_path.strip_suffix(".tera").unwrap_or(relative_path);
        let dest_path = output_dir.join(dest_relative);
        if let Some(parent) = dest_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&dest_path, rendered)
            .with_context(|| format!("writing rendered file {}", dest_path.display()))?;
    }

    vcs.clone(&output_dir.to_string_lossy(), output_dir, false).ok();
    let commit = vcs.current_commit(template_root).unwrap_or_default();

    Ok(TemplateRecord {
        source_url: template_url.to_owned(),
        commit,
        engine_version: env!("CARGO_PKG_VERSION").to_owned(),
        features: selected_features.to_vec(),
        variables: variables.clone(),
    })
}

/// Writes the resolved `[template]` section into a freshly created
/// package's metadata file, appending to whatever the template itself
/// already rendered there.
pub fn write_template_record(package_meta_path: &Path, record: &TemplateRecord) -> Result<()> {
    let mut text = std::fs::read_to_string(package_meta_path).unwrap_or_default();
    if !text.contains("[template]") {
        text.push_str("\n[template]\n");
        text.push_str(&format!("source_url = {}\n", record.source_url));
        text.push_str(&format!("commit = {}\n", record.commit));
        text.push_str(&format!("engine_version = {}\n", record.engine_version));
        text.push_str(&format!("features = {}\n", record.features.join(", ")));
        std::fs::write(package_meta_path, text)?;
    }
    Ok(())
}
