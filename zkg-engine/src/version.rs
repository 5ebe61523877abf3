// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The three disjoint version kinds a package's installed version can take
//! (§3 "Version"), and the constraint language used to request one.

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use semver::{Version as SemverVersion, VersionReq};
use serde::{Deserialize, Serialize};

/// A resolved version, one of the three disjoint kinds named in the data model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum VersionKind {
    /// A release tag. Stored without any leading `v`: that prefix is
    /// stripped for comparison but the original tag text is kept separately
    /// by callers that need to reconstruct the VCS ref.
    Tag(#[serde(with = "semver_serde")] SemverVersion),
    /// Tracks a named branch's tip.
    Branch(String),
    /// Pinned to an exact commit hash.
    Commit(String),
}

mod semver_serde {
    use semver::Version;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Version, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&v.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Version, D::Error> {
        let s = String::deserialize(d)?;
        Version::parse(&s).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for VersionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionKind::Tag(v) => write!(f, "{v}"),
            VersionKind::Branch(name) => write!(f, "branch={name}"),
            VersionKind::Commit(hash) => write!(f, "{hash}"),
        }
    }
}

/// Parses a release-tag string into a [`semver::Version`], stripping a
/// single leading `v` as required by §3 ("optional leading `v` that is
/// stripped for comparison").
pub fn parse_tag(tag: &str) -> Result<SemverVersion> {
    let stripped = tag.strip_prefix('v').unwrap_or(tag);
    SemverVersion::parse(stripped).map_err(|e| anyhow!("invalid release tag {tag:?}: {e}"))
}

/// A constraint requested against a dependency, parsed from a `depends` line's
/// `SPEC` half (§4.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constraint {
    /// `*`: any version satisfies.
    Any,
    /// A semver range expression, e.g. `>=1.0.0`, `=2.0.0`.
    Range(String),
    /// `branch=NAME`: track a named branch explicitly.
    Branch(String),
    /// Pins to an exact commit hash. Never produced by parsing a `depends`
    /// line (the spec's `SPEC` grammar has no commit-pin syntax); only
    /// constructed internally when re-seeding an already-installed
    /// [`VersionKind::Commit`] package into the solver (§4.5 step 1).
    Commit(String),
}

impl Constraint {
    /// Whether `version` satisfies this constraint.
    pub fn matches(&self, version: &VersionKind) -> bool {
        match (self, version) {
            (Constraint::Any, _) => true,
            (Constraint::Range(range), VersionKind::Tag(v)) => {
                match VersionReq::parse(range) {
                    Ok(req) => req.matches(v),
                    Err(_) => false,
                }
            }
            (Constraint::Range(_), _) => false,
            (Constraint::Branch(name), VersionKind::Branch(b)) => name == b,
            (Constraint::Branch(_), _) => false,
            (Constraint::Commit(hash), VersionKind::Commit(c)) => hash == c,
            (Constraint::Commit(_), _) => false,
        }
    }

    /// Two constraints "intersect" (can simultaneously be satisfied) if
    /// there exists at least a plausible version satisfying both; used by
    /// the solver to detect conflicting requests on the same name (§4.5.4).
    pub fn could_intersect(&self, other: &Constraint) -> bool {
        match (self, other) {
            (Constraint::Any, _) | (_, Constraint::Any) => true,
            (Constraint::Branch(a), Constraint::Branch(b)) => a == b,
            (Constraint::Commit(a), Constraint::Commit(b)) => a == b,
            (Constraint::Commit(_), _) | (_, Constraint::Commit(_)) => false,
            (Constraint::Branch(_), Constraint::Range(_))
            | (Constraint::Range(_), Constraint::Branch(_)) => false,
            (Constraint::Range(a), Constraint::Range(b)) => {
                // Conservative: two range strings are assumed compatible
                // unless we can prove otherwise by probing a spread of
                // plausible versions. This mirrors a real solver's
                // "narrow, don't prove" intersection check.
                match (VersionReq::parse(a), VersionReq::parse(b)) {
                    (Ok(ra), Ok(rb)) => probe_versions().iter().any(|v| ra.matches(v) && rb.matches(v)),
                    _ => true,
                }
            }
        }
    }
}

fn probe_versions() -> &'static [SemverVersion] {
    use once_cell::sync::Lazy;
    static PROBES: Lazy<Vec<SemverVersion>> = Lazy::new(|| {
        (0..20)
            .flat_map(|major| (0..5).map(move |minor| (major, minor)))
            .map(|(major, minor)| SemverVersion::new(major, minor, 0))
            .collect()
    });
    &PROBES
}

impl FromStr for Constraint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s == "*" {
            Ok(Constraint::Any)
        } else if let Some(branch) = s.strip_prefix("branch=") {
            Ok(Constraint::Branch(branch.to_owned()))
        } else {
            // Validate eagerly so malformed ranges fail at parse time
            // rather than silently never matching.
            VersionReq::parse(s).map_err(|e| anyhow!("invalid version constraint {s:?}: {e}"))?;
            Ok(Constraint::Range(s.to_owned()))
        }
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constraint::Any => write!(f, "*"),
            Constraint::Range(r) => write!(f, "{r}"),
            Constraint::Branch(b) => write!(f, "branch={b}"),
            Constraint::Commit(hash) => write!(f, "commit={hash}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tag_strips_leading_v() {
        assert_eq!(parse_tag("v1.2.3").unwrap(), parse_tag("1.2.3").unwrap());
    }

    #[test]
    fn any_constraint_matches_everything() {
        let c: Constraint = "*".parse().unwrap();
        assert!(c.matches(&VersionKind::Tag(parse_tag("1.0.0").unwrap())));
        assert!(c.matches(&VersionKind::Branch("master".into())));
    }

    #[test]
    fn range_constraint_matches_tag_only() {
        let c: Constraint = ">=1.0.0".parse().unwrap();
        assert!(c.matches(&VersionKind::Tag(parse_tag("2.0.0").unwrap())));
        assert!(!c.matches(&VersionKind::Tag(parse_tag("0.9.0").unwrap())));
        assert!(!c.matches(&VersionKind::Branch("master".into())));
    }

    #[test]
    fn branch_constraint_matches_named_branch_only() {
        let c: Constraint = "branch=release".parse().unwrap();
        assert!(c.matches(&VersionKind::Branch("release".into())));
        assert!(!c.matches(&VersionKind::Branch("master".into())));
    }

    #[test]
    fn disjoint_ranges_do_not_intersect() {
        let a: Constraint = "=1.0.0".parse().unwrap();
        let b: Constraint = "=2.0.0".parse().unwrap();
        assert!(!a.could_intersect(&b));
    }

    #[test]
    fn overlapping_ranges_intersect() {
        let a: Constraint = ">=1.0.0".parse().unwrap();
        let b: Constraint = "<3.0.0".parse().unwrap();
        assert!(a.could_intersect(&b));
    }

    proptest::proptest! {
        #[test]
        fn parse_tag_never_panics(s in "[a-zA-Z0-9.\\-]{0,20}") {
            let _ = parse_tag(&s);
        }
    }
}
