//! Dependency resolution over plugin descriptors.
//!
//! Computes a load order in which every plugin comes after the plugins it
//! depends on. Plugins that cannot be ordered (missing dependency, version
//! range not satisfied, member of a cycle, or depending on one of those)
//! are reported individually instead of aborting the whole resolution.

use crate::descriptor::PluginDescriptor;
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;

/// A declared dependency: plugin name plus acceptable version range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySpec {
    pub name: String,
    pub range: VersionReq,
}

impl DependencySpec {
    pub fn new(name: impl Into<String>, range: VersionReq) -> Self {
        Self {
            name: name.into(),
            range,
        }
    }

    /// A dependency accepting any version.
    pub fn any(name: impl Into<String>) -> Self {
        Self::new(name, VersionReq::STAR)
    }

    pub fn is_satisfied_by(&self, version: &Version) -> bool {
        self.range.matches(version)
    }
}

impl fmt::Display for DependencySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.range)
    }
}

/// Why a plugin could not be placed in the load order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DependencyFailure {
    Missing { dependency: String },
    VersionMismatch {
        dependency: String,
        required: VersionReq,
        found: Version,
    },
    Cycle { members: Vec<String> },
    FailedDependency { dependency: String },
}

impl fmt::Display for DependencyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing { dependency } => write!(f, "missing dependency '{dependency}'"),
            Self::VersionMismatch {
                dependency,
                required,
                found,
            } => write!(
                f,
                "dependency '{dependency}' requires {required} but {found} is available"
            ),
            Self::Cycle { members } => {
                write!(f, "circular dependency among [{}]", members.join(", "))
            }
            Self::FailedDependency { dependency } => {
                write!(f, "dependency '{dependency}' cannot be loaded")
            }
        }
    }
}

/// Result of [`resolve_load_order`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyResolution {
    /// Plugins in dependency-first order.
    pub order: Vec<String>,
    /// Plugins that cannot be loaded, keyed by name.
    pub failures: BTreeMap<String, DependencyFailure>,
}

/// Orders `targets` for loading using Kahn's algorithm.
///
/// `catalog` holds every known descriptor; a target's dependencies are
/// looked up there, and dependencies not themselves in `targets` are
/// checked for presence and version only (they are assumed to be loaded
/// already or handled by the caller).
pub fn resolve_load_order(
    targets: &[PluginDescriptor],
    catalog: &HashMap<String, PluginDescriptor>,
) -> DependencyResolution {
    let mut failures: BTreeMap<String, DependencyFailure> = BTreeMap::new();
    let target_names: BTreeSet<&str> = targets.iter().map(|d| d.name.as_str()).collect();

    // Presence and version checks
    for descriptor in targets {
        for dep in &descriptor.dependencies {
            let failure = match catalog.get(&dep.name) {
                None => Some(DependencyFailure::Missing {
                    dependency: dep.name.clone(),
                }),
                Some(found) if !dep.is_satisfied_by(&found.version) => {
                    Some(DependencyFailure::VersionMismatch {
                        dependency: dep.name.clone(),
                        required: dep.range.clone(),
                        found: found.version.clone(),
                    })
                }
                Some(_) => None,
            };
            if let Some(failure) = failure {
                failures.entry(descriptor.name.clone()).or_insert(failure);
            }
        }
    }

    // Build the graph among targets: edge dep -> dependent
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
    for descriptor in targets {
        in_degree.entry(descriptor.name.as_str()).or_insert(0);
        for dep in &descriptor.dependencies {
            if target_names.contains(dep.name.as_str()) {
                dependents
                    .entry(dep.name.as_str())
                    .or_default()
                    .push(descriptor.name.as_str());
                *in_degree.entry(descriptor.name.as_str()).or_insert(0) += 1;
            }
        }
    }

    // BTreeMap iteration keeps the order deterministic for independent plugins
    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut sorted: Vec<&str> = Vec::with_capacity(targets.len());

    while let Some(name) = queue.pop_front() {
        sorted.push(name);
        if let Some(children) = dependents.get(name) {
            let mut ready = Vec::new();
            for child in children {
                if let Some(degree) = in_degree.get_mut(child) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(*child);
                    }
                }
            }
            ready.sort_unstable();
            queue.extend(ready);
        }
    }

    // Anything left with a positive in-degree is in a cycle or downstream of one
    if sorted.len() < in_degree.len() {
        let remaining: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree > 0)
            .map(|(name, _)| *name)
            .collect();
        let cycle_members = cycle_members(targets, &remaining);
        let members: Vec<String> = cycle_members.iter().map(|s| s.to_string()).collect();
        for name in &remaining {
            let failure = if cycle_members.contains(name) {
                DependencyFailure::Cycle {
                    members: members.clone(),
                }
            } else {
                DependencyFailure::FailedDependency {
                    dependency: first_failed_dependency(targets, name, &remaining)
                        .unwrap_or_default(),
                }
            };
            failures.entry(name.to_string()).or_insert(failure);
        }
    }

    // Propagate failures to dependents in topological order
    let mut order = Vec::with_capacity(sorted.len());
    let by_name: HashMap<&str, &PluginDescriptor> =
        targets.iter().map(|d| (d.name.as_str(), d)).collect();
    for name in sorted {
        if failures.contains_key(name) {
            continue;
        }
        let failed_dep = by_name.get(name).and_then(|d| {
            d.dependencies
                .iter()
                .find(|dep| failures.contains_key(&dep.name))
                .map(|dep| dep.name.clone())
        });
        match failed_dep {
            Some(dependency) => {
                failures.insert(
                    name.to_string(),
                    DependencyFailure::FailedDependency { dependency },
                );
            }
            None => order.push(name.to_string()),
        }
    }

    DependencyResolution { order, failures }
}

/// Nodes in `remaining` that can reach themselves through dependencies
/// that are also in `remaining`.
fn cycle_members<'a>(targets: &'a [PluginDescriptor], remaining: &BTreeSet<&'a str>) -> BTreeSet<&'a str> {
    let deps: HashMap<&str, Vec<&str>> = targets
        .iter()
        .filter(|d| remaining.contains(d.name.as_str()))
        .map(|d| {
            let edges = d
                .dependencies
                .iter()
                .map(|dep| dep.name.as_str())
                .filter(|n| remaining.contains(n))
                .collect();
            (d.name.as_str(), edges)
        })
        .collect();

    remaining
        .iter()
        .copied()
        .filter(|start| {
            let mut stack: Vec<&str> = deps.get(start).cloned().unwrap_or_default();
            let mut seen: BTreeSet<&str> = BTreeSet::new();
            while let Some(node) = stack.pop() {
                if node == *start {
                    return true;
                }
                if seen.insert(node) {
                    if let Some(next) = deps.get(node) {
                        stack.extend(next.iter().copied());
                    }
                }
            }
            false
        })
        .collect()
}

fn first_failed_dependency(
    targets: &[PluginDescriptor],
    name: &str,
    remaining: &BTreeSet<&str>,
) -> Option<String> {
    targets
        .iter()
        .find(|d| d.name == name)?
        .dependencies
        .iter()
        .find(|dep| remaining.contains(dep.name.as_str()))
        .map(|dep| dep.name.clone())
}
