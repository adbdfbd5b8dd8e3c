//! `package.json` of a converted package.
//!
//! Besides the fields a package manager reads, the manifest carries a `legacy`
//! block with the raw declaration data, so a converted package can satisfy
//! dependents on a later run without its original sources.

use crate::arch::{self, entry_file, ArchList, BUILD_TARGETS};
use crate::config::ConvertConfig;
use crate::error::{ConvertError, Result};
use crate::package::{Dependency, EdgeKind, ExportRecord, Package, PackageSource, Visibility};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

pub const MANIFEST_FILE: &str = "package.json";
pub const DEFINE_STUB: &str = "__define.js";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleType {
    Module,
    Commonjs,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionTarget {
    pub import: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require: Option<String>,
}

/// Export conditions in resolution order; `default` must stay last, so this
/// is a list rather than a sorted map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conditions(pub Vec<(String, ConditionTarget)>);

impl Serialize for Conditions {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (condition, target) in &self.0 {
            map.serialize_entry(condition, target)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Conditions {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct ConditionsVisitor;

        impl<'de> Visitor<'de> for ConditionsVisitor {
            type Value = Conditions;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of export conditions")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Self::Value, A::Error> {
                let mut entries = Vec::new();
                while let Some((key, value)) = access.next_entry::<String, ConditionTarget>()? {
                    entries.push((key, value));
                }
                Ok(Conditions(entries))
            }
        }

        deserializer.deserialize_map(ConditionsVisitor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExportTarget {
    Path(String),
    Conditions(Conditions),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub test_only: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub debug_only: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub prod_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraint: Option<String>,
    #[serde(default)]
    pub weak: bool,
    #[serde(default)]
    pub unordered: bool,
    #[serde(default)]
    pub implied: bool,
    pub archs: Vec<String>,
}

impl EdgeEntry {
    fn kind(&self) -> EdgeKind {
        if self.implied {
            EdgeKind::Implied
        } else if self.weak {
            EdgeKind::Weak
        } else if self.unordered {
            EdgeKind::Unordered
        } else {
            EdgeKind::Strong
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyBlock {
    pub name: String,
    /// Export lists keyed by the architecture they were declared on.
    #[serde(default)]
    pub exports: BTreeMap<String, Vec<ExportEntry>>,
    #[serde(default)]
    pub edges: Vec<EdgeEntry>,
    #[serde(default)]
    pub implies: Vec<String>,
    #[serde(default)]
    pub main_modules: BTreeMap<String, String>,
    #[serde(default)]
    pub lazy: bool,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub legacy_module: bool,
    #[serde(default)]
    pub npm_dependencies: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub module_type: ModuleType,
    pub exports: BTreeMap<String, ExportTarget>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub peer_dependencies: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub optional_dependencies: BTreeMap<String, String>,
    pub legacy: LegacyBlock,
}

/// npm range for a legacy constraint; missing constraints accept anything.
pub fn npm_range(constraint: Option<&str>) -> String {
    let Some(constraint) = constraint else {
        return "*".to_string();
    };
    constraint
        .split("||")
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| match part.strip_prefix('=') {
            Some(exact) => exact.trim().to_string(),
            None if part.starts_with('^') || part.starts_with('~') => part.to_string(),
            None => format!("^{}", part),
        })
        .collect::<Vec<_>>()
        .join(" || ")
}

// ═══════════════════════════════════════════════════════════════════════════════
// PACKAGE -> MANIFEST
// ═══════════════════════════════════════════════════════════════════════════════

fn conditions(package: &Package, test: bool) -> Conditions {
    let entries = package
        .archs
        .active_targets()
        .into_iter()
        .map(|(condition, arch)| {
            let path = format!("./{}", entry_file(arch, test));
            let target = ConditionTarget {
                import: path.clone(),
                require: package.common_module.then_some(path),
            };
            (condition.to_string(), target)
        })
        .collect();
    Conditions(entries)
}

impl Manifest {
    pub fn from_package(package: &Package, config: &ConvertConfig, include_tests: bool) -> Self {
        let mut exports = BTreeMap::new();
        exports.insert(".".to_string(), ExportTarget::Conditions(conditions(package, false)));
        if include_tests {
            if let Some(test) = &package.test {
                exports.insert("./test".to_string(), ExportTarget::Conditions(conditions(test, true)));
            }
        }
        if package.lazy {
            exports.insert("./define".to_string(), ExportTarget::Path(format!("./{}", DEFINE_STUB)));
        }
        exports.insert(
            format!("./{}", MANIFEST_FILE),
            ExportTarget::Path(format!("./{}", MANIFEST_FILE)),
        );

        let mut dependencies = BTreeMap::new();
        let mut peer_dependencies = BTreeMap::new();
        let mut optional_dependencies = BTreeMap::new();
        for dep in &package.dependencies {
            let range = npm_range(dep.constraint.as_deref());
            let target = match dep.kind {
                EdgeKind::Strong | EdgeKind::Implied => &mut dependencies,
                EdgeKind::Unordered => &mut peer_dependencies,
                EdgeKind::Weak => &mut optional_dependencies,
            };
            target.insert(config.converted_name(&dep.name), range);
        }
        for (name, version) in &package.npm_dependencies {
            dependencies.insert(name.clone(), version.clone());
        }

        let mut legacy_exports: BTreeMap<String, Vec<ExportEntry>> = BTreeMap::new();
        for (name, record) in &package.exports {
            for arch in &record.archs {
                legacy_exports.entry(arch.clone()).or_default().push(ExportEntry {
                    name: name.clone(),
                    test_only: record.test_only,
                    debug_only: record.debug_only,
                    prod_only: record.prod_only,
                });
            }
        }
        let mut main_modules = BTreeMap::new();
        let mut implies = Vec::new();
        for arch in arch::known_archs() {
            if let Some(main) = package.archs.main_module(arch, false) {
                main_modules.insert(arch.to_string(), main);
            }
            for implied in package.archs.get(arch, ArchList::Implies, false) {
                if !implies.contains(&implied) {
                    implies.push(implied);
                }
            }
        }

        Manifest {
            name: package.output_name.clone(),
            version: package.version.clone(),
            description: package.description.clone(),
            module_type: if package.common_module {
                ModuleType::Commonjs
            } else {
                ModuleType::Module
            },
            exports,
            dependencies,
            peer_dependencies,
            optional_dependencies,
            legacy: LegacyBlock {
                name: package.name.clone(),
                exports: legacy_exports,
                edges: package
                    .dependencies
                    .iter()
                    .map(|dep| EdgeEntry {
                        name: dep.name.clone(),
                        constraint: dep.constraint.clone(),
                        weak: dep.kind == EdgeKind::Weak,
                        unordered: dep.kind == EdgeKind::Unordered,
                        implied: dep.kind == EdgeKind::Implied,
                        archs: dep.archs.clone(),
                    })
                    .collect(),
                implies,
                main_modules,
                lazy: package.lazy,
                visibility: package.visibility,
                legacy_module: package.legacy_module,
                npm_dependencies: package.npm_dependencies.clone(),
            },
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // MANIFEST -> PACKAGE
    // ═══════════════════════════════════════════════════════════════════════════

    /// Descriptor equivalent to the one the manifest was written from, minus
    /// source files, assets and the test variant.
    pub fn into_package(self, config: &ConvertConfig) -> Package {
        let legacy = self.legacy;
        let mut package = Package::new(&legacy.name, config);
        package.output_name = self.name;
        package.version = self.version;
        package.description = self.description;
        package.visibility = legacy.visibility;
        package.lazy = legacy.lazy;
        package.legacy_module = legacy.legacy_module;
        package.common_module = self.module_type == ModuleType::Commonjs;
        package.npm_dependencies = legacy.npm_dependencies;

        for edge in &legacy.edges {
            let kind = edge.kind();
            for arch in &edge.archs {
                match kind {
                    EdgeKind::Strong => {
                        package.archs.add(arch, ArchList::Imports, &config.converted_name(&edge.name))
                    }
                    EdgeKind::Weak => package.archs.add(arch, ArchList::Preload, &edge.name),
                    EdgeKind::Unordered => package.archs.add(arch, ArchList::Unordered, &edge.name),
                    EdgeKind::Implied => package.archs.add(arch, ArchList::Implies, &edge.name),
                }
            }
            package.dependencies.push(Dependency {
                name: edge.name.clone(),
                constraint: edge.constraint.clone(),
                kind,
                archs: edge.archs.clone(),
            });
        }

        for (arch, entries) in legacy.exports {
            for entry in entries {
                package.archs.add(&arch, ArchList::Exports, &entry.name);
                let record: &mut ExportRecord = package.exports.entry(entry.name).or_default();
                if !record.archs.contains(&arch) {
                    record.archs.push(arch.clone());
                }
                record.test_only |= entry.test_only;
                record.debug_only |= entry.debug_only;
                record.prod_only |= entry.prod_only;
            }
        }
        for (arch, main) in legacy.main_modules {
            package.archs.set_main_module(&arch, &main);
        }
        package
    }

    pub async fn read(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ConvertError::io(path, e))?;
        serde_json::from_str(&text).map_err(|source| ConvertError::Manifest {
            path: path.to_path_buf(),
            source,
        })
    }

    pub async fn write(&self, path: &Path) -> Result<()> {
        let mut text = serde_json::to_string_pretty(self).map_err(|source| ConvertError::Manifest {
            path: path.to_path_buf(),
            source,
        })?;
        text.push('\n');
        tokio::fs::write(path, text)
            .await
            .map_err(|e| ConvertError::io(path, e))
    }
}

/// Load a converted package from its output or registry folder.
pub async fn read_converted_package(dir: &Path, config: &ConvertConfig) -> Result<Package> {
    let manifest = Manifest::read(&dir.join(MANIFEST_FILE)).await?;
    let mut package = manifest.into_package(config);
    package.source = PackageSource::Converted {
        dir: dir.to_path_buf(),
    };
    Ok(package)
}

/// Ordered condition names, for callers that only need the keys.
pub fn condition_names() -> impl Iterator<Item = &'static str> {
    BUILD_TARGETS.iter().map(|(_, condition)| *condition)
}
