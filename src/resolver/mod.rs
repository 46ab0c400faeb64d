// src/resolver/mod.rs

//! Shared-object dependency consistency checker
//!
//! Reads the committed catalog and reports shared-object dependencies that
//! nothing published can satisfy. Two classes are reported per dependent
//! package:
//!
//! - **missing soname**: no provider of that library name exists in scope
//! - **not sure**: providers of the name exist, but none at a compatible
//!   version; the same-named providers are listed as hints
//!
//! A provider version satisfies a requirement when it equals it or extends it
//! with further components (`.1.2` satisfies `.1`). The checker never writes.

use crate::db::models::{PackageKey, RepoDescriptor, SoDirection, SoLink};
use crate::error::Result;
use rusqlite::Connection;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use tracing::debug;

/// Which dependent repos to check
///
/// Unset fields match everything. Providers are always drawn from every repo
/// a dependent repo may link against, whether or not it is in scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckScope {
    pub branch: Option<String>,
    pub component: Option<String>,
    pub architecture: Option<String>,
}

impl CheckScope {
    pub fn all() -> Self {
        Self::default()
    }

    fn is_unrestricted(&self) -> bool {
        self.branch.is_none() && self.component.is_none() && self.architecture.is_none()
    }

    fn matches(&self, repo: &RepoDescriptor) -> bool {
        let field = |want: &Option<String>, have: &str| want.as_deref().is_none_or(|w| w == have);
        field(&self.branch, &repo.branch)
            && field(&self.component, &repo.component)
            && field(&self.architecture, &repo.architecture)
    }
}

/// Whether packages in `provider` may satisfy dependencies of `dependent`
fn provides_for(provider: &RepoDescriptor, dependent: &RepoDescriptor) -> bool {
    (provider.architecture == dependent.architecture || provider.architecture == "all")
        && provider.testing <= dependent.testing
        && (provider.component == dependent.component || provider.component == "main")
}

/// `have` equals `want` or extends it with more components
fn match_soversion(want: &str, have: &str) -> bool {
    have == want
        || have
            .strip_prefix(want)
            .is_some_and(|rest| rest.starts_with('.'))
}

/// A provider that shares the soname of an unmatched dependency
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Hint {
    pub provider: PackageKey,
    /// Same-named sonames it provides, e.g. `libx.so.2.0`
    pub provides: Vec<String>,
}

/// Unsatisfied dependencies of one package
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageReport {
    pub package: PackageKey,
    /// `soname ++ soversion`, sorted
    pub missing: Vec<String>,
    /// Empty for missing-soname reports
    pub hints: Vec<Hint>,
}

/// Result of a consistency check
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    pub missing_soname: Vec<PackageReport>,
    pub not_sure: Vec<PackageReport>,
}

impl CheckReport {
    pub fn is_empty(&self) -> bool {
        self.missing_soname.is_empty() && self.not_sure.is_empty()
    }
}

impl fmt::Display for CheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "missing soname: {}", self.missing_soname.len())?;
        for report in &self.missing_soname {
            writeln!(f, "{}: {}", report.package, report.missing.join(", "))?;
        }

        writeln!(f)?;
        writeln!(f, "not sure: {}", self.not_sure.len())?;
        for report in &self.not_sure {
            writeln!(f, "{}:", report.package)?;
            writeln!(f, "  missing: {}", report.missing.join(", "))?;
            if !report.hints.is_empty() {
                writeln!(f, "  hints:")?;
                for hint in &report.hints {
                    writeln!(f, "    - {} has {}", hint.provider, hint.provides.join(", "))?;
                }
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Check every current package's shared-object dependencies in `scope`
pub fn check(conn: &Connection, scope: &CheckScope) -> Result<CheckReport> {
    let links = SoLink::find_current(conn)?;
    let repos = RepoDescriptor::list_all(conn)?;
    debug!("Checking {} links across {} repos", links.len(), repos.len());
    Ok(check_links(&links, &repos, scope))
}

/// Per-repo view of the links
#[derive(Default)]
struct RepoLinks<'a> {
    depends: Vec<(&'a PackageKey, &'a SoLink)>,
    provides: Vec<(&'a PackageKey, &'a SoLink)>,
}

/// Run the check over an in-memory snapshot
pub fn check_links(
    links: &[(PackageKey, SoLink)],
    repos: &[RepoDescriptor],
    scope: &CheckScope,
) -> CheckReport {
    let mut by_repo: HashMap<&str, RepoLinks> = HashMap::new();
    for (key, link) in links {
        let slot = by_repo.entry(key.repo.as_str()).or_default();
        match link.direction {
            SoDirection::Depends => slot.depends.push((key, link)),
            SoDirection::Provides => slot.provides.push((key, link)),
        }
    }

    let descriptors: HashMap<&str, &RepoDescriptor> =
        repos.iter().map(|r| (r.name.as_str(), r)).collect();

    let mut missing_soname: BTreeMap<PackageKey, BTreeSet<String>> = BTreeMap::new();
    let mut not_sure: BTreeMap<PackageKey, NotSure> = BTreeMap::new();

    let mut dependent_repos: Vec<&str> = by_repo
        .iter()
        .filter(|(_, l)| !l.depends.is_empty())
        .map(|(name, _)| *name)
        .collect();
    dependent_repos.sort_unstable();

    for repo in dependent_repos {
        let descriptor = descriptors.get(repo).copied();
        let in_scope = match descriptor {
            Some(d) => scope.matches(d),
            None => scope.is_unrestricted(),
        };
        if !in_scope {
            continue;
        }

        // A repo without a descriptor only provides for itself
        let provider_repos: Vec<&str> = match descriptor {
            Some(dependent) => repos
                .iter()
                .filter(|q| q.name == repo || provides_for(q, dependent))
                .map(|q| q.name.as_str())
                .collect(),
            None => vec![repo],
        };

        // soname -> soversion -> providing packages
        let mut provides: BTreeMap<&str, BTreeMap<&str, BTreeSet<&PackageKey>>> = BTreeMap::new();
        for provider in provider_repos {
            let Some(repo_links) = by_repo.get(provider) else {
                continue;
            };
            for (key, link) in &repo_links.provides {
                provides
                    .entry(link.soname.as_str())
                    .or_default()
                    .entry(link.soversion.as_str())
                    .or_default()
                    .insert(*key);
            }
        }

        let mut depends: BTreeMap<(&str, &str), BTreeSet<&PackageKey>> = BTreeMap::new();
        for (key, link) in &by_repo[repo].depends {
            depends
                .entry((link.soname.as_str(), link.soversion.as_str()))
                .or_default()
                .insert(*key);
        }

        for ((soname, soversion), dependents) in depends {
            let wanted = format!("{}{}", soname, soversion);

            if !provides.contains_key(soname) {
                for key in dependents {
                    missing_soname
                        .entry(key.clone())
                        .or_default()
                        .insert(wanted.clone());
                }
                continue;
            }

            let versions = provides
                .get(soname)
                .expect("provider cache holds every name-matched soname");

            if versions.contains_key(soversion)
                || versions.contains_key(format!("{}.0", soversion).as_str())
                || versions.contains_key(format!("{}.0.0", soversion).as_str())
            {
                continue;
            }
            if versions.keys().any(|have| match_soversion(soversion, have)) {
                continue;
            }

            for key in dependents {
                let entry = not_sure.entry(key.clone()).or_default();
                entry.missing.insert(wanted.clone());
                for (have, providers) in versions {
                    for provider in providers {
                        entry
                            .hints
                            .entry((*provider).clone())
                            .or_default()
                            .insert(format!("{}{}", soname, have));
                    }
                }
            }
        }
    }

    CheckReport {
        missing_soname: missing_soname
            .into_iter()
            .map(|(package, missing)| PackageReport {
                package,
                missing: missing.into_iter().collect(),
                hints: Vec::new(),
            })
            .collect(),
        not_sure: not_sure
            .into_iter()
            .map(|(package, entry)| PackageReport {
                package,
                missing: entry.missing.into_iter().collect(),
                hints: entry
                    .hints
                    .into_iter()
                    .map(|(provider, provides)| Hint {
                        provider,
                        provides: provides.into_iter().collect(),
                    })
                    .collect(),
            })
            .collect(),
    }
}

#[derive(Default)]
struct NotSure {
    missing: BTreeSet<String>,
    hints: BTreeMap<PackageKey, BTreeSet<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(package: &str, version: &str, repo: &str) -> PackageKey {
        PackageKey::new(package, version, repo)
    }

    fn dep(package: &str, repo: &str, so: &str) -> (PackageKey, SoLink) {
        (key(package, "1", repo), SoLink::parse(SoDirection::Depends, so))
    }

    fn prov(package: &str, repo: &str, so: &str) -> (PackageKey, SoLink) {
        (key(package, "1", repo), SoLink::parse(SoDirection::Provides, so))
    }

    fn repos() -> Vec<RepoDescriptor> {
        vec![
            RepoDescriptor::derive("stable", "main", "amd64", 0),
            RepoDescriptor::derive("stable", "main", "all", 0),
            RepoDescriptor::derive("testing", "main", "amd64", 1),
            RepoDescriptor::derive("stable", "bsp", "amd64", 0),
            RepoDescriptor::derive("stable", "main", "arm64", 0),
        ]
    }

    #[test]
    fn test_zero_extension_resolves() {
        let links = vec![
            dep("a", "amd64/stable", "libx.so.1"),
            prov("b", "amd64/stable", "libx.so.1.0"),
        ];
        assert!(check_links(&links, &repos(), &CheckScope::all()).is_empty());
    }

    #[test]
    fn test_prefix_match_resolves() {
        let links = vec![
            dep("a", "amd64/stable", "libx.so.1"),
            dep("a", "amd64/stable", "libz.so"),
            prov("b", "amd64/stable", "libx.so.1.2.3"),
            prov("c", "amd64/stable", "libz.so.5"),
        ];
        assert!(check_links(&links, &repos(), &CheckScope::all()).is_empty());
    }

    #[test]
    fn test_version_mismatch_is_not_sure_with_hint() {
        let links = vec![
            dep("a", "amd64/stable", "libx.so.1"),
            prov("b", "amd64/stable", "libx.so.2.0"),
            prov("b", "amd64/stable", "libother.so.1"),
        ];
        let report = check_links(&links, &repos(), &CheckScope::all());
        assert!(report.missing_soname.is_empty());
        assert_eq!(report.not_sure.len(), 1);

        let entry = &report.not_sure[0];
        assert_eq!(entry.package, key("a", "1", "amd64/stable"));
        assert_eq!(entry.missing, vec!["libx.so.1"]);
        assert_eq!(
            entry.hints,
            vec![Hint {
                provider: key("b", "1", "amd64/stable"),
                provides: vec!["libx.so.2.0".to_string()],
            }]
        );
    }

    #[test]
    fn test_prefix_needs_component_boundary() {
        let links = vec![
            dep("a", "amd64/stable", "libx.so.1"),
            prov("b", "amd64/stable", "libx.so.10"),
        ];
        let report = check_links(&links, &repos(), &CheckScope::all());
        assert_eq!(report.not_sure.len(), 1);
    }

    #[test]
    fn test_no_provider_is_missing_soname() {
        let links = vec![
            dep("c", "amd64/stable", "liby.so.3"),
            dep("c", "amd64/stable", "liba.so.1"),
        ];
        let report = check_links(&links, &repos(), &CheckScope::all());
        assert!(report.not_sure.is_empty());
        assert_eq!(report.missing_soname.len(), 1);
        assert_eq!(report.missing_soname[0].missing, vec!["liba.so.1", "liby.so.3"]);
    }

    #[test]
    fn test_provider_repo_rules() {
        let links = vec![
            // noarch and main components provide for everyone of equal or higher rank
            dep("a", "bsp-amd64/stable", "libnoarch.so.1"),
            prov("n", "noarch/stable", "libnoarch.so.1"),
            dep("a", "bsp-amd64/stable", "libmain.so.1"),
            prov("m", "amd64/stable", "libmain.so.1"),
            // a more experimental branch never provides for a stable one
            dep("s", "amd64/stable", "libtesting.so.1"),
            prov("t", "amd64/testing", "libtesting.so.1"),
            // the testing branch sees stable providers
            dep("t", "amd64/testing", "libmain.so.1"),
            // other architectures never provide
            dep("s", "amd64/stable", "libarm.so.1"),
            prov("r", "arm64/stable", "libarm.so.1"),
            // a component other than main only provides for itself
            dep("s", "amd64/stable", "libbsp.so.1"),
            prov("p", "bsp-amd64/stable", "libbsp.so.1"),
        ];
        let report = check_links(&links, &repos(), &CheckScope::all());
        assert!(report.not_sure.is_empty());
        assert_eq!(report.missing_soname.len(), 1);
        assert_eq!(report.missing_soname[0].package, key("s", "1", "amd64/stable"));
        assert_eq!(
            report.missing_soname[0].missing,
            vec!["libarm.so.1", "libbsp.so.1", "libtesting.so.1"]
        );
    }

    #[test]
    fn test_scope_filters_dependents() {
        let links = vec![
            dep("a", "amd64/stable", "liby.so.1"),
            dep("t", "amd64/testing", "liby.so.1"),
            dep("x", "unknown/stable", "liby.so.1"),
        ];
        let scope = CheckScope {
            branch: Some("testing".to_string()),
            ..Default::default()
        };
        let report = check_links(&links, &repos(), &scope);
        assert_eq!(report.missing_soname.len(), 1);
        assert_eq!(report.missing_soname[0].package.package, "t");

        // Repos without a descriptor are only checked in an unrestricted scope
        let report = check_links(&links, &repos(), &CheckScope::all());
        assert_eq!(report.missing_soname.len(), 3);
    }

    #[test]
    fn test_empty_scope_is_empty_report() {
        let report = check_links(&[], &[], &CheckScope::all());
        assert!(report.is_empty());
        assert!(report.to_string().contains("missing soname: 0"));
    }

    #[test]
    fn test_report_display() {
        let links = vec![
            dep("a", "amd64/stable", "libx.so.1"),
            prov("b", "amd64/stable", "libx.so.2"),
            dep("c", "amd64/stable", "liby.so"),
        ];
        let text = check_links(&links, &repos(), &CheckScope::all()).to_string();
        assert!(text.contains("c(1) [amd64/stable]: liby.so"));
        assert!(text.contains("  missing: libx.so.1"));
        assert!(text.contains("    - b(1) [amd64/stable] has libx.so.2"));
    }

    #[test]
    fn test_match_soversion() {
        assert!(match_soversion(".1", ".1"));
        assert!(match_soversion(".1", ".1.0"));
        assert!(match_soversion("", ".6"));
        assert!(!match_soversion(".1", ".10"));
        assert!(!match_soversion(".1.2", ".1"));
    }
}
