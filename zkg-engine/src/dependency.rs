// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Dependency-kind modeling (§4.1 "Dependency parsing", §9 "Polymorphism").
//!
//! Kept as a tagged variant over dependency kinds, the shape recommended in
//! the design notes, rather than the boolean-algebra dependency tree a
//! USE-flag-driven resolver would need.

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};

use crate::version::Constraint;

/// The reserved names that do not refer to an installable package.
const PLATFORM_NAMES: &[&str] = &["zeek", "bro"];
const MANAGER_NAMES: &[&str] = &["zkg", "bro-pkg"];

/// What a single `depends`/`external_depends`/`suggests` entry refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyKind {
    /// The literal `zeek`/`bro`: checked against the running platform version.
    PlatformVersion,
    /// The literal `zkg`/`bro-pkg`: checked against the running manager version.
    ManagerVersion,
    /// A reserved capability name the host platform may advertise instead of
    /// an installable package (e.g. `spicy-plugin`).
    BuiltinCapability(String),
    /// A package, named either by full git URL or short name.
    Package(String),
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependencyKind::PlatformVersion => write!(f, "zeek"),
            DependencyKind::ManagerVersion => write!(f, "zkg"),
            DependencyKind::BuiltinCapability(name) => write!(f, "{name}"),
            DependencyKind::Package(name) => write!(f, "{name}"),
        }
    }
}

/// Names treated as built-in capabilities rather than ordinary package names
/// when no package of that name can be found (§4.1). This list mirrors the
/// platform's own advertised-capability roster; it is intentionally small
/// and can be extended without changing the dependency-kind shape.
pub fn classify_name(name: &str, known_builtin_capabilities: &[String]) -> DependencyKind {
    if PLATFORM_NAMES.contains(&name) {
        DependencyKind::PlatformVersion
    } else if MANAGER_NAMES.contains(&name) {
        DependencyKind::ManagerVersion
    } else if known_builtin_capabilities.iter().any(|c| c == name) {
        DependencyKind::BuiltinCapability(name.to_owned())
    } else {
        DependencyKind::Package(name.to_owned())
    }
}

/// A single parsed `depends` line: `name SPEC`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyLine {
    pub name: String,
    pub constraint: Constraint,
}

impl FromStr for DependencyLine {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self> {
        let line = line.trim();
        let mut parts = line.splitn(2, char::is_whitespace);
        let name = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("empty dependency line"))?
            .to_owned();
        let spec = parts
            .next()
            .ok_or_else(|| anyhow!("dependency line {line:?} is missing a version spec"))?
            .trim();
        let constraint = spec
            .parse()
            .map_err(|e| anyhow!("dependency line {line:?}: {e}"))?;
        Ok(DependencyLine { name, constraint })
    }
}

impl fmt::Display for DependencyLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.constraint)
    }
}

/// Parses the full body of a `depends`/`external_depends`/`suggests` field,
/// one line per dependency, blank lines ignored.
pub fn parse_dependency_list(body: &str) -> Result<Vec<DependencyLine>> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::parse)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_name_and_range() {
        let dep: DependencyLine = "bar >=1.0.0".parse().unwrap();
        assert_eq!(dep.name, "bar");
        assert_eq!(dep.constraint, Constraint::Range(">=1.0.0".into()));
    }

    #[test]
    fn parses_branch_spec() {
        let dep: DependencyLine = "bar branch=release".parse().unwrap();
        assert_eq!(dep.constraint, Constraint::Branch("release".into()));
    }

    #[test]
    fn parses_wildcard() {
        let dep: DependencyLine = "bar *".parse().unwrap();
        assert_eq!(dep.constraint, Constraint::Any);
    }

    #[test]
    fn rejects_missing_spec() {
        assert!("bar".parse::<DependencyLine>().is_err());
    }

    #[test]
    fn classifies_platform_and_manager_names() {
        assert_eq!(classify_name("zeek", &[]), DependencyKind::PlatformVersion);
        assert_eq!(classify_name("zkg", &[]), DependencyKind::ManagerVersion);
    }

    #[test]
    fn classifies_builtin_capability_before_package() {
        let builtins = vec!["spicy-plugin".to_string()];
        assert_eq!(
            classify_name("spicy-plugin", &builtins),
            DependencyKind::BuiltinCapability("spicy-plugin".into())
        );
        assert_eq!(
            classify_name("some-other-pkg", &builtins),
            DependencyKind::Package("some-other-pkg".into())
        );
    }

    #[test]
    fn parses_multiline_dependency_list() {
        let deps = parse_dependency_list("bar >=1.0.0\n\nbaz branch=master\n").unwrap();
        assert_eq!(deps.len(), 2);
        assert_eq!(deps[0].name, "bar");
        assert_eq!(deps[1].name, "baz");
    }
}
