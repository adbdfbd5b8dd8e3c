//! Read-only package-version database consulted before conversion.
//!
//! The catalog answers two questions: which versions of a package exist, and
//! what a given version depends on. It is fed from local declarations,
//! previously converted manifests in the registry folder and unpacked legacy
//! archives.

use crate::config::ConvertConfig;
use crate::discovery::{FolderIndex, DECLARATION_FILE};
use crate::error::{ConvertError, Result};
use crate::manifest::{read_converted_package, MANIFEST_FILE};
use crate::package::{Dependency, EdgeKind, Package};
use crate::versions::{parse_version, pick_highest, Constraint, VersionRequest};
use semver::Version;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub version: String,
    pub edges: Vec<Dependency>,
}

pub trait Catalog {
    /// Known versions of `name`, unordered.
    fn versions(&self, name: &str) -> Vec<String>;

    /// Dependency edges of one version.
    fn edges(&self, name: &str, version: &str) -> Option<Vec<Dependency>>;

    /// Source folder of a package with local sources.
    fn local_path(&self, name: &str) -> Option<PathBuf>;
}

#[derive(Debug, Default)]
pub struct DirectoryCatalog {
    entries: BTreeMap<String, Vec<CatalogEntry>>,
    local: BTreeMap<String, PathBuf>,
}

impl DirectoryCatalog {
    /// Read every declaration and manifest reachable from `config`.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn scan(config: &ConvertConfig, folders: &FolderIndex) -> Result<Self> {
        let mut catalog = DirectoryCatalog::default();

        let mut seen_dirs = BTreeSet::new();
        for name in folders.names() {
            let Some(dir) = folders.get(name) else {
                continue;
            };
            if !seen_dirs.insert(dir.to_path_buf()) {
                continue;
            }
            let package = Package::from_declaration_dir(dir, name, config)
                .await
                .map_err(|e| e.in_package(name))?;
            catalog.local.insert(package.name.clone(), dir.to_path_buf());
            catalog.record(&package);
        }

        if let Some(registry) = &config.registry_dir {
            for dir in manifest_dirs(registry) {
                let package = read_converted_package(&dir, config).await?;
                catalog.record(&package);
            }
        }

        for archive in &config.archive_dirs {
            for (name, dir) in archive_dirs(archive) {
                let package = Package::from_declaration_dir(&dir, &name, config)
                    .await
                    .map_err(|e| e.in_package(&name))?;
                catalog.record(&package);
            }
        }

        tracing::debug!(
            packages = catalog.entries.len(),
            local = catalog.local.len(),
            "catalog scanned"
        );
        Ok(catalog)
    }

    /// Record one package version; the first record of a version wins.
    pub fn record(&mut self, package: &Package) {
        let versions = self.entries.entry(package.name.clone()).or_default();
        if versions.iter().any(|e| e.version == package.version) {
            return;
        }
        versions.push(CatalogEntry {
            version: package.version.clone(),
            edges: package.dependencies.clone(),
        });
    }

    pub fn local_paths(&self) -> &BTreeMap<String, PathBuf> {
        &self.local
    }
}

impl Catalog for DirectoryCatalog {
    fn versions(&self, name: &str) -> Vec<String> {
        self.entries
            .get(name)
            .map(|entries| entries.iter().map(|e| e.version.clone()).collect())
            .unwrap_or_default()
    }

    fn edges(&self, name: &str, version: &str) -> Option<Vec<Dependency>> {
        self.entries
            .get(name)?
            .iter()
            .find(|e| e.version == version)
            .map(|e| e.edges.clone())
    }

    fn local_path(&self, name: &str) -> Option<PathBuf> {
        self.local.get(name).cloned()
    }
}

/// Folders holding a manifest: `<registry>/<name>` or `<registry>/<scope>/<name>`.
fn manifest_dirs(registry: &Path) -> Vec<PathBuf> {
    WalkDir::new(registry)
        .min_depth(2)
        .max_depth(3)
        .into_iter()
        .flatten()
        .filter(|e| e.file_type().is_file() && e.file_name() == MANIFEST_FILE)
        .filter_map(|e| e.path().parent().map(Path::to_path_buf))
        .collect()
}

/// `(name, folder)` for every `<archive>/<name>/<version>/package.js`.
fn archive_dirs(archive: &Path) -> Vec<(String, PathBuf)> {
    WalkDir::new(archive)
        .min_depth(3)
        .max_depth(3)
        .into_iter()
        .flatten()
        .filter(|e| e.file_type().is_file() && e.file_name() == DECLARATION_FILE)
        .filter_map(|e| {
            let version_dir = e.path().parent()?;
            let name = version_dir.parent()?.file_name()?.to_string_lossy().to_string();
            Some((name, version_dir.to_path_buf()))
        })
        .collect()
}

/// Archived release of `name` with the highest version satisfying `pin`.
pub fn find_archived(
    archives: &[PathBuf],
    name: &str,
    pin: Option<&Constraint>,
) -> Option<(Version, PathBuf)> {
    let mut candidates: Vec<(Version, PathBuf)> = Vec::new();
    for archive in archives {
        let Ok(read) = std::fs::read_dir(archive.join(name)) else {
            continue;
        };
        for entry in read.flatten() {
            let dir = entry.path();
            if !dir.join(DECLARATION_FILE).is_file() {
                continue;
            }
            let Some(version) = dir
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| parse_version(n).ok())
            else {
                continue;
            };
            candidates.push((version, dir));
        }
    }
    let best = pick_highest(candidates.iter().map(|(v, _)| v), pin)?.clone();
    candidates.into_iter().find(|(v, _)| *v == best)
}

/// Every version request of the graph reachable from `roots`. Each name is
/// expanded once, at its local version or the highest catalog version that
/// satisfies the first constraint seen for it.
pub fn collect_requests(
    catalog: &dyn Catalog,
    roots: &[(String, Option<String>)],
) -> Result<Vec<VersionRequest>> {
    let mut requests = Vec::new();
    let mut expanded = BTreeSet::new();
    let mut queue: VecDeque<(String, Option<String>, bool)> = roots
        .iter()
        .map(|(name, version)| (name.clone(), version.clone(), false))
        .collect();

    while let Some((name, version, weak)) = queue.pop_front() {
        requests.push(VersionRequest {
            name: name.clone(),
            version: version.clone(),
            weak,
        });
        if weak || !expanded.insert(name.clone()) {
            continue;
        }
        let Some(chosen) = choose_version(catalog, &name, version.as_deref())? else {
            continue;
        };
        for edge in catalog.edges(&name, &chosen).unwrap_or_default() {
            queue.push_back((edge.name, edge.constraint, edge.kind == EdgeKind::Weak));
        }
    }
    Ok(requests)
}

fn choose_version(catalog: &dyn Catalog, name: &str, requested: Option<&str>) -> Result<Option<String>> {
    let available = catalog.versions(name);
    if catalog.local_path(name).is_some() {
        return Ok(available.into_iter().next());
    }
    let constraint = requested.map(Constraint::parse).transpose()?;
    let parsed: Vec<(Version, String)> = available
        .into_iter()
        .filter_map(|raw| parse_version(&raw).ok().map(|v| (v, raw)))
        .collect();
    let best = pick_highest(parsed.iter().map(|(v, _)| v), constraint.as_ref())
        .or_else(|| pick_highest(parsed.iter().map(|(v, _)| v), None));
    Ok(best.and_then(|best| {
        parsed
            .iter()
            .find(|(v, _)| v == best)
            .map(|(_, raw)| raw.clone())
    }))
}

/// Fail when a loaded package's version does not satisfy a requester's
/// constraint.
pub fn check_version(loaded: &Package, required_by: &str, constraint: Option<&str>) -> Result<()> {
    let Some(raw) = constraint else {
        return Ok(());
    };
    let constraint = Constraint::parse(raw)?;
    let version = loaded.version()?;
    if constraint.matches(&version) {
        return Ok(());
    }
    Err(ConvertError::VersionMismatch {
        name: loaded.name.clone(),
        loaded: loaded.version.clone(),
        required_by: required_by.to_string(),
        constraint: constraint.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::versions::resolve_versions;

    fn package(name: &str, version: &str, edges: &[(&str, Option<&str>, EdgeKind)]) -> Package {
        let mut pkg = Package::new(name, &ConvertConfig::default());
        pkg.version = version.to_string();
        pkg.dependencies = edges
            .iter()
            .map(|(n, c, kind)| Dependency {
                name: n.to_string(),
                constraint: c.map(str::to_string),
                kind: *kind,
                archs: vec!["common".to_string()],
            })
            .collect();
        pkg
    }

    #[test]
    fn test_collect_requests_walks_chosen_versions() {
        let mut catalog = DirectoryCatalog::default();
        catalog.record(&package("app", "1.0.0", &[("beta", Some("1.0.0"), EdgeKind::Strong)]));
        catalog.record(&package("beta", "1.0.0", &[("alpha", Some("1.0.0"), EdgeKind::Strong)]));
        catalog.record(&package("beta", "1.4.0", &[("alpha", Some("2.0.0"), EdgeKind::Strong)]));
        catalog.record(&package("beta", "2.0.0", &[("gamma", None, EdgeKind::Weak)]));

        let requests = collect_requests(&catalog, &[("app".to_string(), None)]).unwrap();
        assert_eq!(
            requests,
            vec![
                VersionRequest::strong("app", None),
                VersionRequest::strong("beta", Some("1.0.0")),
                VersionRequest::strong("alpha", Some("2.0.0")),
            ]
        );
    }

    #[test]
    fn test_conflicting_graph_is_reported() {
        let mut catalog = DirectoryCatalog::default();
        catalog.record(&package("app", "1.0.0", &[
            ("alpha", Some("1.0.0"), EdgeKind::Strong),
            ("beta", None, EdgeKind::Strong),
        ]));
        catalog.record(&package("beta", "1.0.0", &[("alpha", Some("2.0.0"), EdgeKind::Strong)]));

        let requests = collect_requests(&catalog, &[("app".to_string(), None)]).unwrap();
        let err = resolve_versions(&requests, catalog.local_paths()).unwrap_err();
        assert_eq!(err.code(), crate::error::ERR_VERSION_CONFLICT);
    }

    #[test]
    fn test_find_archived_picks_highest_match() {
        let tmp = tempfile::tempdir().unwrap();
        for version in ["1.0.0", "1.2.0", "2.0.0"] {
            let dir = tmp.path().join("alpha").join(version);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join(DECLARATION_FILE), "").unwrap();
        }
        let archives = vec![tmp.path().to_path_buf()];

        let (version, dir) = find_archived(&archives, "alpha", None).unwrap();
        assert_eq!(version.to_string(), "2.0.0");
        assert!(dir.ends_with("alpha/2.0.0"));

        let pin = Constraint::parse("1.0.0").unwrap();
        let (version, _) = find_archived(&archives, "alpha", Some(&pin)).unwrap();
        assert_eq!(version.to_string(), "1.2.0");
        assert!(find_archived(&archives, "missing", None).is_none());
    }

    #[test]
    fn test_check_version() {
        let alpha = package("alpha", "1.2.0", &[]);
        assert!(check_version(&alpha, "beta", None).is_ok());
        assert!(check_version(&alpha, "beta", Some("1.0.0")).is_ok());
        let err = check_version(&alpha, "beta", Some("=1.0.0")).unwrap_err();
        assert_eq!(err.code(), crate::error::ERR_VERSION_MISMATCH);
    }

    #[tokio::test]
    async fn test_scan_reads_local_and_archived_declarations() {
        let tmp = tempfile::tempdir().unwrap();
        let local = tmp.path().join("packages/alpha");
        std::fs::create_dir_all(&local).unwrap();
        std::fs::write(
            local.join(DECLARATION_FILE),
            r#"Package.describe({ name: "alpha", version: "1.0.0" });"#,
        )
        .unwrap();
        let archived = tmp.path().join("archive/beta/0.9.0");
        std::fs::create_dir_all(&archived).unwrap();
        std::fs::write(
            archived.join(DECLARATION_FILE),
            r#"Package.describe({ version: "0.9.0" });
Package.onUse(function (api) { api.use("alpha@1.0.0"); });"#,
        )
        .unwrap();

        let config = ConvertConfig {
            local_dirs: vec![tmp.path().join("packages")],
            archive_dirs: vec![tmp.path().join("archive")],
            ..ConvertConfig::default()
        };
        let folders = crate::discovery::discover_packages(&config.local_dirs);
        let catalog = DirectoryCatalog::scan(&config, &folders).await.unwrap();

        assert_eq!(catalog.versions("alpha"), vec!["1.0.0"]);
        assert_eq!(catalog.local_path("alpha"), Some(local));
        let edges = catalog.edges("beta", "0.9.0").unwrap();
        assert_eq!(edges[0].name, "alpha");
        assert_eq!(edges[0].constraint.as_deref(), Some("1.0.0"));
    }
}
