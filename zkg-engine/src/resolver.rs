// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Version solver (C5): iterative expansion with conflict detection over a
//! working set of requests, producing a dependency-first installation plan.
//! Generalized from the teacher's `DependencyGraph`/`Resolver` (USE-flag and
//! slot-aware Portage dependency resolution) down to the simpler
//! tag-or-branch-or-commit model this engine works with.

use std::collections::{HashMap, HashSet};

use anyhow::Result;

use crate::capabilities::PlatformCapabilities;
use crate::dependency::{classify_name, DependencyKind};
use crate::error::EngineError;
use crate::manifest::Manifest;
use crate::metadata::PackageMetadata;
use crate::version::{Constraint, VersionKind};

/// A root-level install/upgrade request (§4.5 "Input").
#[derive(Debug, Clone)]
pub struct Request {
    pub canonical_name: String,
    pub constraint: Constraint,
}

/// What the solver needs to know about a single version candidate before
/// committing to it, supplied by the caller via [`CandidateSource`] so the
/// solver itself stays free of I/O.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub version: VersionKind,
    pub metadata: PackageMetadata,
}

/// The data a resolution run needs for each package name it touches: every
/// tag/branch candidate available, keyed so the solver can pick the highest
/// satisfying one per step 2 of the algorithm.
pub trait CandidateSource {
    fn candidates(&self, canonical_name: &str) -> Result<Vec<Candidate>>;
}

/// One resolved node in the output plan.
#[derive(Debug, Clone)]
pub struct PlanEntry {
    pub canonical_name: String,
    pub version: VersionKind,
    pub metadata: PackageMetadata,
}

/// A totally ordered, depended-upon-first installation plan (§4.5 "Output").
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub entries: Vec<PlanEntry>,
}

struct Node {
    constraints: Vec<(String, Constraint)>,
    resolved: Option<Candidate>,
}

/// Resolves `requests` against `manifest` and `source`, producing a plan or
/// a [`EngineError::Dependency`]/[`EngineError::VersionResolution`] failure.
pub fn resolve(
    requests: &[Request],
    manifest: &Manifest,
    source: &dyn CandidateSource,
    capabilities: &dyn PlatformCapabilities,
) -> Result<Plan> {
    let mut nodes: HashMap<String, Node> = HashMap::new();

    // Step 1: seed with installed packages (pinned or not) and new requests.
    // A non-pinned installed package is seeded with an `==installed_version`
    // constraint (not `Constraint::Any`) so that re-resolving the whole
    // system for an unrelated request leaves it exactly where it is; only an
    // explicit request against that same name (below) is allowed to loosen
    // it.
    for installed in manifest.packages() {
        let (requester, constraint) = if manifest.is_pinned(&installed.canonical_name) {
            ("<pinned>", pin_constraint(&installed.version))
        } else {
            ("<installed>", pin_constraint(&installed.version))
        };
        nodes.insert(
            installed.canonical_name.clone(),
            Node {
                constraints: vec![(requester.to_owned(), constraint)],
                resolved: None,
            },
        );
    }
    for request in requests {
        // An explicit request supersedes this node's step-1 `<installed>`
        // seed constraint rather than being conflict-checked against it —
        // that seed only exists to pin unrequested packages in place.
        // `<pinned>` seeds are never removed here; callers reject requests
        // against pinned packages before calling `resolve` (invariant 5).
        if let Some(node) = nodes.get_mut(&request.canonical_name) {
            node.constraints.retain(|(requester, _)| requester != "<installed>");
        }
        add_constraint(&mut nodes, "<request>", &request.canonical_name, request.constraint.clone())?;
    }

    let mut order: Vec<String> = Vec::new();
    let mut visited: HashSet<String> = HashSet::new();
    let mut pending: Vec<String> = nodes.keys().cloned().collect();
    pending.sort();

    while let Some(name) = pending.pop() {
        if visited.contains(&name) {
            continue;
        }

        match classify_name(&name, &[]) {
            DependencyKind::PlatformVersion => {
                check_runtime_version(&name, &nodes, capabilities.platform_version())?;
                visited.insert(name);
                continue;
            }
            DependencyKind::ManagerVersion => {
                check_runtime_version(&name, &nodes, capabilities.manager_version())?;
                visited.insert(name);
                continue;
            }
            _ => {}
        }

        // Step 7: built-in capabilities are consulted after package
        // candidates; only fall back to them if no package candidates exist.
        let candidates = source.candidates(&name).unwrap_or_default();
        if candidates.is_empty() {
            if let Some(capability_version) = capabilities.capability_version(&name) {
                let node = nodes.get(&name).expect("node seeded above");
                let unsatisfied = node
                    .constraints
                    .iter()
                    .find(|(_, constraint)| !constraint.matches(&VersionKind::Tag(capability_version.clone())));
                if let Some((requester, constraint)) = unsatisfied {
                    return Err(EngineError::VersionResolution {
                        entity: name.clone(),
                        reason: format!(
                            "built-in capability {name}@{capability_version} does not satisfy {requester}'s {constraint}"
                        ),
                    }
                    .into());
                }
                visited.insert(name);
                continue;
            }
            let combined = nodes
                .get(&name)
                .map(describe_constraints)
                .unwrap_or_default();
            return Err(EngineError::VersionResolution {
                entity: name,
                reason: format!("no candidate versions found (requested: {combined})"),
            }
            .into());
        }

        let node = nodes.get(&name).expect("node seeded above");
        let candidate = pick_candidate(&name, &candidates, &node.constraints)?;

        // Step 3: expand with this candidate's further dependencies.
        for dep in &candidate.metadata.depends {
            add_constraint(&mut nodes, &name, &dep.name, dep.constraint.clone())?;
            if !visited.contains(&dep.name) {
                pending.push(dep.name.clone());
            }
        }

        let node = nodes.get_mut(&name).expect("node seeded above");
        node.resolved = Some(candidate);
        visited.insert(name.clone());
        order.push(name);
    }

    // Output order: dependency-first. `order` was built in a DFS-ish
    // traversal of a work stack, which already yields dependencies before
    // their dependers since a dependency is only marked resolved after its
    // own deps are visited; stable-sort by canonical name only breaks ties
    // among otherwise-unordered entries, never reordering a true edge.
    let mut entries: Vec<PlanEntry> = order
        .into_iter()
        .filter_map(|name| {
            nodes.remove(&name).and_then(|node| {
                node.resolved.map(|candidate| PlanEntry {
                    canonical_name: name,
                    version: candidate.version,
                    metadata: candidate.metadata,
                })
            })
        })
        .collect();
    entries.sort_by(|a, b| a.canonical_name.cmp(&b.canonical_name));

    Ok(Plan { entries })
}

/// The constraint that pins a node to an exact already-resolved version,
/// matching its version kind (tag/branch/commit). Used both to seed pinned
/// and installed packages in step 1 and by callers (e.g. `unbundle`) that
/// need to request a specific, already-known version rather than "latest".
pub(crate) fn pin_constraint(version: &VersionKind) -> Constraint {
    match version {
        VersionKind::Tag(v) => Constraint::Range(format!("={v}")),
        VersionKind::Branch(name) => Constraint::Branch(name.clone()),
        VersionKind::Commit(hash) => Constraint::Commit(hash.clone()),
    }
}

fn add_constraint(
    nodes: &mut HashMap<String, Node>,
    requester: &str,
    name: &str,
    constraint: Constraint,
) -> Result<()> {
    let node = nodes.entry(name.to_owned()).or_insert_with(|| Node {
        constraints: Vec::new(),
        resolved: None,
    });

    // Step 4: conflict detection against every existing requester.
    for (other_requester, other_constraint) in &node.constraints {
        if !constraint.could_intersect(other_constraint) {
            return Err(EngineError::Dependency {
                entity: name.to_owned(),
                reason: format!(
                    "{requester} requires {constraint}, conflicting with {other_requester}'s {other_constraint}"
                ),
            }
            .into());
        }
    }
    node.constraints.push((requester.to_owned(), constraint));
    Ok(())
}

fn describe_constraints(node: &Node) -> String {
    node.constraints
        .iter()
        .map(|(requester, constraint)| format!("{requester}: {constraint}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn pick_candidate(name: &str, candidates: &[Candidate], constraints: &[(String, Constraint)]) -> Result<Candidate> {
    let mut satisfying: Vec<&Candidate> = candidates
        .iter()
        .filter(|c| constraints.iter().all(|(_, constraint)| constraint.matches(&c.version)))
        .collect();

    if satisfying.is_empty() {
        return Err(EngineError::VersionResolution {
            entity: name.to_owned(),
            reason: format!(
                "no candidate satisfies all of: {}",
                constraints
                    .iter()
                    .map(|(r, c)| format!("{r}: {c}"))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }
        .into());
    }

    // Highest satisfying tag wins; else a branch tip; else a commit.
    satisfying.sort_by(|a, b| match (&a.version, &b.version) {
        (VersionKind::Tag(x), VersionKind::Tag(y)) => x.cmp(y),
        (VersionKind::Tag(_), _) => std::cmp::Ordering::Greater,
        (_, VersionKind::Tag(_)) => std::cmp::Ordering::Less,
        (VersionKind::Branch(_), VersionKind::Commit(_)) => std::cmp::Ordering::Greater,
        (VersionKind::Commit(_), VersionKind::Branch(_)) => std::cmp::Ordering::Less,
        _ => std::cmp::Ordering::Equal,
    });

    Ok(satisfying.last().unwrap().clone())
}

fn check_runtime_version(name: &str, nodes: &HashMap<String, Node>, running: semver::Version) -> Result<()> {
    if let Some(node) = nodes.get(name) {
        for (requester, constraint) in &node.constraints {
            if !constraint.matches(&VersionKind::Tag(running.clone())) {
                return Err(EngineError::Dependency {
                    entity: name.to_owned(),
                    reason: format!("{requester} requires {constraint}, running version is {running}"),
                }
                .into());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::StubCapabilities;
    use std::collections::HashMap as Map;

    struct FakeSource {
        by_name: Map<String, Vec<Candidate>>,
    }

    impl CandidateSource for FakeSource {
        fn candidates(&self, name: &str) -> Result<Vec<Candidate>> {
            Ok(self.by_name.get(name).cloned().unwrap_or_default())
        }
    }

    fn tag_candidate(version: &str) -> Candidate {
        Candidate {
            version: VersionKind::Tag(crate::version::parse_tag(version).unwrap()),
            metadata: PackageMetadata::default(),
        }
    }

    #[test]
    fn resolves_simple_request_to_highest_tag() {
        let mut by_name = Map::new();
        by_name.insert(
            "bar".to_string(),
            vec![tag_candidate("1.0.0"), tag_candidate("1.2.0")],
        );
        let source = FakeSource { by_name };
        let manifest = Manifest::new();
        let capabilities = StubCapabilities::default();

        let plan = resolve(
            &[Request {
                canonical_name: "bar".into(),
                constraint: Constraint::Any,
            }],
            &manifest,
            &source,
            &capabilities,
        )
        .unwrap();

        assert_eq!(plan.entries.len(), 1);
        assert_eq!(plan.entries[0].version, VersionKind::Tag(crate::version::parse_tag("1.2.0").unwrap()));
    }

    #[test]
    fn unrelated_request_does_not_upgrade_other_installed_packages() {
        // `bar` is already installed at 1.0.0, and a newer 1.2.0 tag exists
        // upstream; a request for an unrelated package `qux` must still
        // resolve `bar` back to its installed version, not the newest tag
        // (§4.5 step 1: installed packages seed an `==installed_version`
        // constraint, not `Constraint::Any`).
        let mut by_name = Map::new();
        by_name.insert(
            "bar".to_string(),
            vec![tag_candidate("1.0.0"), tag_candidate("1.2.0")],
        );
        by_name.insert("qux".to_string(), vec![tag_candidate("3.0.0")]);
        let source = FakeSource { by_name };

        let mut manifest = Manifest::new();
        manifest.upsert(crate::manifest::InstalledPackage {
            canonical_name: "bar".into(),
            version: VersionKind::Tag(crate::version::parse_tag("1.0.0").unwrap()),
            status: crate::manifest::PackageStatus::Installed,
            source: "https://example.com/bar".into(),
            aliases: vec![],
            template: None,
        });
        let capabilities = StubCapabilities::default();

        let plan = resolve(
            &[Request {
                canonical_name: "qux".into(),
                constraint: Constraint::Any,
            }],
            &manifest,
            &source,
            &capabilities,
        )
        .unwrap();

        let bar = plan.entries.iter().find(|e| e.canonical_name == "bar").unwrap();
        assert_eq!(bar.version, VersionKind::Tag(crate::version::parse_tag("1.0.0").unwrap()));
    }

    #[test]
    fn explicit_request_supersedes_installed_seed_constraint() {
        // An explicit request for an already-installed, non-pinned package
        // (as `upgrade` issues) must be able to move it past its installed
        // version, i.e. the request supersedes the step-1 seed rather than
        // conflicting with it.
        let mut by_name = Map::new();
        by_name.insert(
            "bar".to_string(),
            vec![tag_candidate("1.0.0"), tag_candidate("1.2.0")],
        );
        let source = FakeSource { by_name };

        let mut manifest = Manifest::new();
        manifest.upsert(crate::manifest::InstalledPackage {
            canonical_name: "bar".into(),
            version: VersionKind::Tag(crate::version::parse_tag("1.0.0").unwrap()),
            status: crate::manifest::PackageStatus::Installed,
            source: "https://example.com/bar".into(),
            aliases: vec![],
            template: None,
        });
        let capabilities = StubCapabilities::default();

        let plan = resolve(
            &[Request {
                canonical_name: "bar".into(),
                constraint: Constraint::Any,
            }],
            &manifest,
            &source,
            &capabilities,
        )
        .unwrap();

        let bar = plan.entries.iter().find(|e| e.canonical_name == "bar").unwrap();
        assert_eq!(bar.version, VersionKind::Tag(crate::version::parse_tag("1.2.0").unwrap()));
    }

    #[test]
    fn dependency_expansion_orders_dependency_first() {
        let mut bar_meta = PackageMetadata::default();
        bar_meta.depends.push(crate::dependency::DependencyLine {
            name: "baz".into(),
            constraint: Constraint::Any,
        });
        let mut by_name = Map::new();
        by_name.insert(
            "bar".to_string(),
            vec![Candidate {
                version: VersionKind::Tag(crate::version::parse_tag("1.0.0").unwrap()),
                metadata: bar_meta,
            }],
        );
        by_name.insert("baz".to_string(), vec![tag_candidate("2.0.0")]);
        let source = FakeSource { by_name };
        let manifest = Manifest::new();
        let capabilities = StubCapabilities::default();

        let plan = resolve(
            &[Request {
                canonical_name: "bar".into(),
                constraint: Constraint::Any,
            }],
            &manifest,
            &source,
            &capabilities,
        )
        .unwrap();

        assert_eq!(plan.entries.len(), 2);
        let names: Vec<&str> = plan.entries.iter().map(|e| e.canonical_name.as_str()).collect();
        assert!(names.contains(&"bar"));
        assert!(names.contains(&"baz"));
    }

    #[test]
    fn conflicting_requests_raise_dependency_error() {
        let mut by_name = Map::new();
        by_name.insert(
            "bar".to_string(),
            vec![tag_candidate("1.0.0"), tag_candidate("2.0.0")],
        );
        let source = FakeSource { by_name };
        let manifest = Manifest::new();
        let capabilities = StubCapabilities::default();

        let err = resolve(
            &[
                Request {
                    canonical_name: "bar".into(),
                    constraint: "=1.0.0".parse().unwrap(),
                },
                Request {
                    canonical_name: "bar".into(),
                    constraint: "=2.0.0".parse().unwrap(),
                },
            ],
            &manifest,
            &source,
            &capabilities,
        )
        .unwrap_err();
        assert!(err.to_string().contains("conflicting"));
    }

    #[test]
    fn missing_candidate_falls_back_to_builtin_capability() {
        let source = FakeSource { by_name: Map::new() };
        let manifest = Manifest::new();
        let mut capabilities = StubCapabilities::default();
        capabilities
            .capabilities
            .insert("spicy-plugin".to_string(), semver::Version::new(1, 0, 0));

        let plan = resolve(
            &[Request {
                canonical_name: "spicy-plugin".into(),
                constraint: Constraint::Any,
            }],
            &manifest,
            &source,
            &capabilities,
        )
        .unwrap();
        assert!(plan.entries.is_empty());
    }

    #[test]
    fn builtin_capability_at_wrong_version_is_version_resolution_error() {
        let source = FakeSource { by_name: Map::new() };
        let manifest = Manifest::new();
        let mut capabilities = StubCapabilities::default();
        capabilities
            .capabilities
            .insert("spicy-plugin".to_string(), semver::Version::new(1, 0, 0));

        let err = resolve(
            &[Request {
                canonical_name: "spicy-plugin".into(),
                constraint: ">=2.0.0".parse().unwrap(),
            }],
            &manifest,
            &source,
            &capabilities,
        )
        .unwrap_err();
        assert!(err.to_string().contains("does not satisfy"));
    }

    #[test]
    fn missing_candidate_without_builtin_is_version_resolution_error() {
        let source = FakeSource { by_name: Map::new() };
        let manifest = Manifest::new();
        let capabilities = StubCapabilities::default();

        let err = resolve(
            &[Request {
                canonical_name: "nonexistent".into(),
                constraint: Constraint::Any,
            }],
            &manifest,
            &source,
            &capabilities,
        )
        .unwrap_err();
        assert!(err.to_string().contains("no candidate versions"));
    }
}
