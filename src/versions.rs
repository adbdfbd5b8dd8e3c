//! Version resolution and legacy constraint parsing.

use crate::error::{ConvertError, Result, VersionConflict};
use lazy_static::lazy_static;
use regex::Regex;
use semver::{Comparator, Op, Version, VersionReq};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

lazy_static! {
    /// `name`, `name@1.2.3`, `name@=1.2.3`, `user:name@1.0.0 || 2.0.0`
    static ref PACKAGE_SPEC: Regex =
        Regex::new(r"^\s*([A-Za-z0-9][A-Za-z0-9._:-]*)\s*(?:@\s*(.+?))?\s*$").unwrap();
    /// Legacy wrap numbers: `1.2.3_4`.
    static ref WRAP_SUFFIX: Regex = Regex::new(r"^(\d+\.\d+\.\d+(?:-[0-9A-Za-z.-]+)?)_(\d+)$").unwrap();
}

/// Parse a legacy version. A `_N` wrap suffix becomes build metadata.
pub fn parse_version(value: &str) -> Result<Version> {
    let trimmed = value.trim().trim_start_matches(['^', '=', '~', 'v']);
    let normalized = match WRAP_SUFFIX.captures(trimmed) {
        Some(caps) => format!("{}+wrap.{}", &caps[1], &caps[2]),
        None => trimmed.to_string(),
    };
    Version::parse(&normalized).map_err(|source| ConvertError::InvalidVersion {
        value: value.to_string(),
        source,
    })
}

fn caret(version: &Version) -> VersionReq {
    VersionReq {
        comparators: vec![Comparator {
            op: Op::Caret,
            major: version.major,
            minor: Some(version.minor),
            patch: Some(version.patch),
            pre: version.pre.clone(),
        }],
    }
}

fn exact(version: &Version) -> VersionReq {
    VersionReq {
        comparators: vec![Comparator {
            op: Op::Exact,
            major: version.major,
            minor: Some(version.minor),
            patch: Some(version.patch),
            pre: version.pre.clone(),
        }],
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONSTRAINTS
// ═══════════════════════════════════════════════════════════════════════════════

/// A legacy constraint: `1.2.3` means compatible-with, `=1.2.3` means exactly,
/// and `a || b` accepts either alternative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constraint {
    raw: String,
    alternatives: Vec<(Version, VersionReq)>,
}

impl Constraint {
    pub fn parse(raw: &str) -> Result<Self> {
        let mut alternatives = Vec::new();
        for part in raw.split("||").map(str::trim).filter(|p| !p.is_empty()) {
            let version = parse_version(part)?;
            let req = if part.starts_with('=') {
                exact(&version)
            } else {
                caret(&version)
            };
            alternatives.push((version, req));
        }
        if alternatives.is_empty() {
            return Err(ConvertError::InvalidConstraint {
                value: raw.to_string(),
            });
        }
        Ok(Constraint {
            raw: raw.trim().to_string(),
            alternatives,
        })
    }

    pub fn matches(&self, version: &Version) -> bool {
        self.alternatives.iter().any(|(_, req)| req.matches(version))
    }

    /// Lowest version the constraint names.
    pub fn base_version(&self) -> &Version {
        self.alternatives
            .iter()
            .map(|(v, _)| v)
            .min()
            .unwrap_or(&self.alternatives[0].0)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// `name@constraint` as written in a declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSpec {
    pub name: String,
    pub constraint: Option<String>,
}

impl PackageSpec {
    pub fn parse(spec: &str) -> std::result::Result<Self, String> {
        let caps = PACKAGE_SPEC
            .captures(spec)
            .ok_or_else(|| format!("invalid package reference '{}'", spec))?;
        Ok(PackageSpec {
            name: caps[1].to_string(),
            constraint: caps.get(2).map(|m| m.as_str().to_string()),
        })
    }
}

/// Highest of `available` that satisfies `constraint` (any, when none).
pub fn pick_highest<'v>(
    available: impl IntoIterator<Item = &'v Version>,
    constraint: Option<&Constraint>,
) -> Option<&'v Version> {
    available
        .into_iter()
        .filter(|v| constraint.map(|c| c.matches(v)).unwrap_or(true))
        .max()
}

// ═══════════════════════════════════════════════════════════════════════════════
// RESOLVER
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionRequest {
    pub name: String,
    /// `None` is an unconstrained request.
    pub version: Option<String>,
    pub weak: bool,
}

impl VersionRequest {
    pub fn strong(name: &str, version: Option<&str>) -> Self {
        VersionRequest {
            name: name.to_string(),
            version: version.map(str::to_string),
            weak: false,
        }
    }

    pub fn weak(name: &str, version: Option<&str>) -> Self {
        VersionRequest {
            weak: true,
            ..Self::strong(name, version)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedVersion {
    /// Sources on disk; always authoritative.
    Local(PathBuf),
    Version(Version),
    /// Only unconstrained requests were seen.
    Any,
}

/// Pick one version per name. Every conflict is reported at once.
///
/// Each request is a full constraint. Candidates are the versions the
/// constraints name; the highest candidate accepted by every constraint on
/// the name wins.
pub fn resolve_versions(
    requests: &[VersionRequest],
    local: &BTreeMap<String, PathBuf>,
) -> Result<BTreeMap<String, ResolvedVersion>> {
    let mut by_name: BTreeMap<&str, (bool, BTreeMap<String, Constraint>)> = BTreeMap::new();
    for request in requests {
        let entry = by_name
            .entry(request.name.as_str())
            .or_insert_with(|| (false, BTreeMap::new()));
        entry.0 |= !request.weak;
        if let Some(raw) = &request.version {
            let constraint = Constraint::parse(raw)?;
            entry.1.insert(constraint.as_str().to_string(), constraint);
        }
    }

    let mut resolved = BTreeMap::new();
    let mut conflicts = Vec::new();
    for (name, (has_strong, constraints)) in by_name {
        if let Some(path) = local.get(name) {
            resolved.insert(name.to_string(), ResolvedVersion::Local(path.clone()));
            continue;
        }
        if !has_strong {
            tracing::debug!(package = name, "only weakly requested, not pinned");
            continue;
        }
        match pick_compatible(&constraints) {
            Some(Some(version)) => {
                resolved.insert(name.to_string(), ResolvedVersion::Version(version));
            }
            Some(None) => {
                resolved.insert(name.to_string(), ResolvedVersion::Any);
            }
            None => conflicts.push(VersionConflict {
                name: name.to_string(),
                requested: constraints.into_keys().collect(),
            }),
        }
    }

    if conflicts.is_empty() {
        Ok(resolved)
    } else {
        Err(ConvertError::VersionConflicts(conflicts))
    }
}

/// `Some(None)` when nothing was pinned, `None` on conflict.
fn pick_compatible(constraints: &BTreeMap<String, Constraint>) -> Option<Option<Version>> {
    if constraints.is_empty() {
        return Some(None);
    }
    constraints
        .values()
        .flat_map(|constraint| constraint.alternatives.iter().map(|(version, _)| version))
        .filter(|candidate| constraints.values().all(|c| c.matches(candidate)))
        .max()
        .cloned()
        .map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn test_single_version_is_used() {
        let out = resolve_versions(
            &[VersionRequest::strong("alpha", Some("1.2.0"))],
            &BTreeMap::new(),
        )
        .unwrap();
        assert_eq!(out["alpha"], ResolvedVersion::Version(v("1.2.0")));
    }

    #[test]
    fn test_highest_compatible_is_picked() {
        let out = resolve_versions(
            &[
                VersionRequest::strong("alpha", Some("1.2.0")),
                VersionRequest::strong("alpha", Some("1.4.1")),
                VersionRequest::strong("alpha", None),
            ],
            &BTreeMap::new(),
        )
        .unwrap();
        assert_eq!(out["alpha"], ResolvedVersion::Version(v("1.4.1")));
    }

    #[test]
    fn test_conflicts_are_collected() {
        let err = resolve_versions(
            &[
                VersionRequest::strong("delta", Some("^1.0.0")),
                VersionRequest::strong("delta", Some("^2.0.0")),
                VersionRequest::strong("omega", Some("3.0.0")),
                VersionRequest::strong("omega", Some("4.0.0")),
                VersionRequest::strong("fine", Some("1.0.0")),
            ],
            &BTreeMap::new(),
        )
        .unwrap_err();
        match err {
            ConvertError::VersionConflicts(conflicts) => {
                assert_eq!(conflicts.len(), 2);
                assert_eq!(conflicts[0].name, "delta");
                assert_eq!(conflicts[0].requested, vec!["^1.0.0", "^2.0.0"]);
                assert_eq!(conflicts[1].name, "omega");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_weak_only_requests_are_skipped_and_weak_joins_strong() {
        let out = resolve_versions(
            &[
                VersionRequest::weak("lonely", Some("1.0.0")),
                VersionRequest::strong("paired", Some("1.0.0")),
                VersionRequest::weak("paired", Some("2.0.0")),
            ],
            &BTreeMap::new(),
        );
        let err = out.unwrap_err();
        assert!(err.to_string().contains("paired (1.0.0, 2.0.0)"));

        let out = resolve_versions(
            &[VersionRequest::weak("lonely", Some("1.0.0"))],
            &BTreeMap::new(),
        )
        .unwrap();
        assert!(!out.contains_key("lonely"));
    }

    #[test]
    fn test_local_path_always_wins() {
        let mut local = BTreeMap::new();
        local.insert("delta".to_string(), PathBuf::from("/src/delta"));
        let out = resolve_versions(
            &[
                VersionRequest::strong("delta", Some("1.0.0")),
                VersionRequest::strong("delta", Some("2.0.0")),
            ],
            &local,
        )
        .unwrap();
        assert_eq!(out["delta"], ResolvedVersion::Local(PathBuf::from("/src/delta")));
    }

    #[test]
    fn test_resolution_is_order_independent() {
        let mut requests = vec![
            VersionRequest::strong("a", Some("1.0.0")),
            VersionRequest::strong("b", Some("2.1.0")),
            VersionRequest::strong("a", Some("1.3.0")),
            VersionRequest::weak("b", Some("2.0.5")),
            VersionRequest::strong("c", None),
            VersionRequest::strong("a", Some("1.1.0")),
        ];
        let forward = resolve_versions(&requests, &BTreeMap::new()).unwrap();
        requests.reverse();
        let backward = resolve_versions(&requests, &BTreeMap::new()).unwrap();
        requests.swap(0, 3);
        let shuffled = resolve_versions(&requests, &BTreeMap::new()).unwrap();
        assert_eq!(forward, backward);
        assert_eq!(forward, shuffled);
        assert_eq!(forward["a"], ResolvedVersion::Version(v("1.3.0")));
        assert_eq!(forward["c"], ResolvedVersion::Any);
    }

    #[test]
    fn test_constraint_forms() {
        let caret = Constraint::parse("1.2.0").unwrap();
        assert!(caret.matches(&v("1.9.0")));
        assert!(!caret.matches(&v("2.0.0")));

        let exact = Constraint::parse("=1.2.0").unwrap();
        assert!(exact.matches(&v("1.2.0")));
        assert!(!exact.matches(&v("1.2.1")));

        let either = Constraint::parse("1.0.0 || 2.0.0").unwrap();
        assert!(either.matches(&v("2.3.0")));
        assert_eq!(either.base_version(), &v("1.0.0"));

        assert!(Constraint::parse("").is_err());
    }

    #[test]
    fn test_alternatives_and_exact_requests() {
        let out = resolve_versions(
            &[VersionRequest::strong("alpha", Some("1.0.0 || 2.0.0"))],
            &BTreeMap::new(),
        )
        .unwrap();
        assert_eq!(out["alpha"], ResolvedVersion::Version(v("2.0.0")));

        let out = resolve_versions(
            &[
                VersionRequest::strong("alpha", Some("1.0.0 || 2.0.0")),
                VersionRequest::strong("alpha", Some("1.2.0")),
            ],
            &BTreeMap::new(),
        )
        .unwrap();
        assert_eq!(out["alpha"], ResolvedVersion::Version(v("1.2.0")));

        let err = resolve_versions(
            &[
                VersionRequest::strong("beta", Some("=1.2.0")),
                VersionRequest::strong("beta", Some("1.3.0")),
            ],
            &BTreeMap::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("beta (1.3.0, =1.2.0)"), "{}", err);

        let out = resolve_versions(
            &[
                VersionRequest::strong("beta", Some("=1.3.1")),
                VersionRequest::strong("beta", Some("1.3.0")),
            ],
            &BTreeMap::new(),
        )
        .unwrap();
        assert_eq!(out["beta"], ResolvedVersion::Version(v("1.3.1")));
    }

    #[test]
    fn test_wrap_suffix_parses() {
        let version = parse_version("1.2.3_2").unwrap();
        assert_eq!((version.major, version.minor, version.patch), (1, 2, 3));
        assert!(Constraint::parse("1.2.0").unwrap().matches(&version));
    }

    #[test]
    fn test_package_spec() {
        let spec = PackageSpec::parse("user:pkg@=1.0.0").unwrap();
        assert_eq!(spec.name, "user:pkg");
        assert_eq!(spec.constraint.as_deref(), Some("=1.0.0"));
        assert_eq!(PackageSpec::parse("tracker").unwrap().constraint, None);
        assert!(PackageSpec::parse("@bad").is_err());
    }

    #[test]
    fn test_pick_highest() {
        let available = vec![v("1.0.0"), v("1.5.0"), v("2.0.0")];
        let pin = Constraint::parse("1.0.0").unwrap();
        assert_eq!(pick_highest(&available, Some(&pin)), Some(&v("1.5.0")));
        assert_eq!(pick_highest(&available, None), Some(&v("2.0.0")));
    }
}
