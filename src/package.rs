//! Package descriptors.
//!
//! A [`Package`] is built by replaying a `package.js` through
//! [`PackageBuilder`], or recovered from a converted package's manifest. The
//! `onTest` half of a declaration becomes a shadow descriptor in
//! [`Package::test`].

use crate::arch::{self, known_archs, ArchList, ArchTree};
use crate::config::ConvertConfig;
use crate::declaration::{
    interpret_declaration, Describe, ExportOptions, MainModuleOptions, PackageApi, Section,
    UseOptions,
};
use crate::error::{ConvertError, Result};
use crate::load_order::DependencyRecord;
use crate::versions::PackageSpec;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

pub const DEFAULT_VERSION: &str = "0.0.0";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Visibility {
    #[default]
    Always,
    ProdOnly,
    DevOnly,
    TestOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EdgeKind {
    Strong,
    Weak,
    Unordered,
    Implied,
}

/// One dependency edge of a package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    pub name: String,
    pub constraint: Option<String>,
    pub kind: EdgeKind,
    /// Canonical architectures the edge was declared on.
    pub archs: Vec<String>,
}

impl Dependency {
    /// Whether the edge is in effect on `arch`.
    pub fn applies_to(&self, arch: &str) -> bool {
        self.archs.iter().any(|declared| arch::descends_from(arch, declared))
    }

    /// Edges that must be loaded before the declaring package counts as loaded.
    pub fn gates_loading(&self) -> bool {
        matches!(self.kind, EdgeKind::Strong | EdgeKind::Implied)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRecord {
    pub archs: Vec<String>,
    pub test_only: bool,
    pub debug_only: bool,
    pub prod_only: bool,
}

impl ExportRecord {
    pub fn visible_on(&self, arch: &str) -> bool {
        self.archs.iter().any(|declared| arch::descends_from(arch, declared))
    }
}

/// Where a descriptor was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageSource {
    /// A legacy declaration; sources live next to it.
    Declaration { dir: PathBuf },
    /// A previously converted package; nothing left to write.
    Converted { dir: PathBuf },
    /// Built in memory.
    Detached,
}

/// A source file and the architectures it is loaded on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: String,
    pub archs: Vec<&'static str>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Package {
    pub name: String,
    pub output_name: String,
    pub version: String,
    pub description: Option<String>,
    pub visibility: Visibility,
    pub archs: ArchTree,
    pub exports: BTreeMap<String, ExportRecord>,
    pub dependencies: Vec<Dependency>,
    pub lazy: bool,
    /// Emitted as CommonJS.
    pub common_module: bool,
    /// Sources use module semantics (`require`, `exports`, `module` are bound).
    pub legacy_module: bool,
    pub npm_dependencies: BTreeMap<String, String>,
    pub source: PackageSource,
    pub test: Option<Box<Package>>,
}

impl Package {
    pub fn new(name: &str, config: &ConvertConfig) -> Self {
        Package {
            name: name.to_string(),
            output_name: config.converted_name(name),
            version: DEFAULT_VERSION.to_string(),
            description: None,
            visibility: Visibility::Always,
            archs: ArchTree::new(),
            exports: BTreeMap::new(),
            dependencies: Vec::new(),
            lazy: false,
            common_module: config.is_common_module(name),
            legacy_module: false,
            npm_dependencies: BTreeMap::new(),
            source: PackageSource::Detached,
            test: None,
        }
    }

    /// Read `package.js` in `dir`. `default_name` is used when the
    /// declaration does not name itself.
    pub async fn from_declaration_dir(
        dir: &Path,
        default_name: &str,
        config: &ConvertConfig,
    ) -> Result<Self> {
        let file = dir.join("package.js");
        let source = tokio::fs::read_to_string(&file)
            .await
            .map_err(|e| ConvertError::io(&file, e))?;
        let mut package = Self::from_declaration(&source, &file.to_string_lossy(), default_name, config)?;
        package.source = PackageSource::Declaration {
            dir: dir.to_path_buf(),
        };
        Ok(package)
    }

    pub fn from_declaration(
        source: &str,
        file_path: &str,
        default_name: &str,
        config: &ConvertConfig,
    ) -> Result<Self> {
        let mut builder = PackageBuilder::new(default_name, file_path, config);
        interpret_declaration(source, file_path, &mut builder)?;
        Ok(builder.finish())
    }

    pub fn version(&self) -> Result<semver::Version> {
        crate::versions::parse_version(&self.version)
    }

    pub fn is_converted(&self) -> bool {
        matches!(self.source, PackageSource::Converted { .. })
    }

    pub fn edges(&self, include_test: bool) -> impl Iterator<Item = &Dependency> {
        let test_edges: &[Dependency] = match (&self.test, include_test) {
            (Some(test), true) => test.dependencies.as_slice(),
            _ => &[],
        };
        self.dependencies.iter().chain(test_edges.iter())
    }

    /// Exported symbols visible on `arch`, excluding test-only ones.
    pub fn surface(&self, arch: &str) -> BTreeSet<String> {
        self.exports
            .iter()
            .filter(|(_, record)| !record.test_only && record.visible_on(arch))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Legacy names of packages this one implies on `arch`.
    pub fn implied_on(&self, arch: &str) -> Vec<String> {
        self.archs.get(arch, ArchList::Implies, true)
    }

    /// Every file to convert with the architectures that load it; main modules
    /// count as files.
    pub fn source_files(&self) -> Vec<SourceFile> {
        let mut files: Vec<SourceFile> = Vec::new();
        for arch in known_archs() {
            let Some(node) = self.archs.node(arch) else {
                continue;
            };
            for path in node.files.iter().chain(node.main_module.iter()) {
                match files.iter_mut().find(|f| &f.path == path) {
                    Some(existing) => {
                        if !existing.archs.contains(&arch) {
                            existing.archs.push(arch);
                        }
                    }
                    None => files.push(SourceFile {
                        path: path.clone(),
                        archs: vec![arch],
                    }),
                }
            }
        }
        files
    }

    pub fn assets(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for arch in known_archs() {
            for asset in self.archs.get(arch, ArchList::Assets, false) {
                if !out.contains(&asset) {
                    out.push(asset);
                }
            }
        }
        out
    }

    /// Load-order record of this package on `arch`.
    pub fn dependency_record(&self, arch: &str) -> DependencyRecord {
        let mut record = DependencyRecord {
            name: self.name.clone(),
            lazy: self.lazy,
            prod_only: self.visibility == Visibility::ProdOnly,
            ..DependencyRecord::default()
        };
        for dep in self.dependencies.iter().filter(|d| d.applies_to(arch)) {
            let list = match dep.kind {
                EdgeKind::Strong => &mut record.strong,
                EdgeKind::Weak => &mut record.weak,
                EdgeKind::Unordered | EdgeKind::Implied => &mut record.after,
            };
            if !list.contains(&dep.name) {
                list.push(dep.name.clone());
            }
        }
        record
    }

    /// Forget everything derived from the declaration.
    pub fn reset(&mut self) {
        self.archs.reset();
        self.exports.clear();
        self.dependencies.clear();
        self.test = None;
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DECLARATION BUILDER
// ═══════════════════════════════════════════════════════════════════════════════

/// [`PackageApi`] implementation that records a declaration into descriptors.
pub struct PackageBuilder<'c> {
    main: Package,
    test: Package,
    section: Section,
    file_path: String,
    config: &'c ConvertConfig,
}

impl<'c> PackageBuilder<'c> {
    pub fn new(default_name: &str, file_path: &str, config: &'c ConvertConfig) -> Self {
        PackageBuilder {
            main: Package::new(default_name, config),
            test: Package::new(default_name, config),
            section: Section::Use,
            file_path: file_path.to_string(),
            config,
        }
    }

    pub fn finish(self) -> Package {
        let PackageBuilder {
            mut main, mut test, ..
        } = self;
        let has_test = !test.dependencies.is_empty()
            || !test.exports.is_empty()
            || !test.archs.modified_archs().is_empty();
        if has_test {
            test.name = main.name.clone();
            test.output_name = main.output_name.clone();
            test.version = main.version.clone();
            test.common_module = main.common_module;
            test.legacy_module |= main.legacy_module;
            main.test = Some(Box::new(test));
        }
        main
    }

    fn target(&mut self) -> &mut Package {
        match self.section {
            Section::Use => &mut self.main,
            Section::Test => &mut self.test,
        }
    }

    fn archs(&self, archs: &[String]) -> Result<Vec<&'static str>> {
        arch::resolve_archs(archs).map_err(|message| ConvertError::declaration(&self.file_path, message))
    }

    fn spec(&self, raw: &str) -> Result<PackageSpec> {
        PackageSpec::parse(raw).map_err(|message| ConvertError::declaration(&self.file_path, message))
    }

    fn add_edge(&mut self, spec: PackageSpec, kind: EdgeKind, archs: &[&'static str]) {
        let converted = self.config.converted_name(&spec.name);
        let package = self.target();
        for arch in archs {
            match kind {
                EdgeKind::Strong => package.archs.add(arch, ArchList::Imports, &converted),
                EdgeKind::Weak => package.archs.add(arch, ArchList::Preload, &spec.name),
                EdgeKind::Unordered => package.archs.add(arch, ArchList::Unordered, &spec.name),
                EdgeKind::Implied => package.archs.add(arch, ArchList::Implies, &spec.name),
            }
        }
        match package
            .dependencies
            .iter_mut()
            .find(|d| d.name == spec.name && d.kind == kind)
        {
            Some(existing) => {
                for arch in archs {
                    if !existing.archs.iter().any(|a| a == arch) {
                        existing.archs.push(arch.to_string());
                    }
                }
                if existing.constraint.is_none() {
                    existing.constraint = spec.constraint;
                }
            }
            None => package.dependencies.push(Dependency {
                name: spec.name,
                constraint: spec.constraint,
                kind,
                archs: archs.iter().map(|a| a.to_string()).collect(),
            }),
        }
    }
}

impl<'c> PackageApi for PackageBuilder<'c> {
    fn enter(&mut self, section: Section) {
        self.section = section;
    }

    fn describe(&mut self, describe: Describe) -> Result<()> {
        let flags = [describe.prod_only, describe.dev_only, describe.test_only];
        if let Some(name) = &describe.name {
            self.main.name = name.clone();
            self.main.output_name = self.config.converted_name(name);
            self.main.common_module = self.config.is_common_module(name);
        }
        if flags.iter().filter(|f| **f).count() > 1 {
            return Err(ConvertError::ConflictingVisibility {
                package: self.main.name.clone(),
            });
        }
        self.main.visibility = if describe.prod_only {
            Visibility::ProdOnly
        } else if describe.dev_only {
            Visibility::DevOnly
        } else if describe.test_only {
            Visibility::TestOnly
        } else {
            Visibility::Always
        };
        if let Some(version) = describe.version {
            self.main.version = version;
        }
        self.main.description = describe.description;
        Ok(())
    }

    fn use_packages(&mut self, specs: &[String], archs: &[String], options: UseOptions) -> Result<()> {
        let archs = self.archs(archs)?;
        let kind = if options.weak {
            EdgeKind::Weak
        } else if options.unordered {
            EdgeKind::Unordered
        } else {
            EdgeKind::Strong
        };
        for raw in specs {
            let spec = self.spec(raw)?;
            if self.config.is_module_marker(&spec.name) {
                self.target().legacy_module = true;
                continue;
            }
            self.add_edge(spec, kind, &archs);
        }
        Ok(())
    }

    fn imply(&mut self, specs: &[String], archs: &[String]) -> Result<()> {
        let archs = self.archs(archs)?;
        for raw in specs {
            let spec = self.spec(raw)?;
            if self.config.is_module_marker(&spec.name) {
                continue;
            }
            self.add_edge(spec, EdgeKind::Implied, &archs);
        }
        Ok(())
    }

    fn export(&mut self, symbols: &[String], archs: &[String], options: ExportOptions) -> Result<()> {
        let archs = self.archs(archs)?;
        let package = self.target();
        for symbol in symbols {
            let record = package.exports.entry(symbol.clone()).or_default();
            for arch in &archs {
                if !record.archs.iter().any(|a| a == arch) {
                    record.archs.push(arch.to_string());
                }
            }
            record.test_only |= options.test_only;
            record.debug_only |= options.debug_only;
            record.prod_only |= options.prod_only;
            for arch in &archs {
                package.archs.add(arch, ArchList::Exports, symbol);
            }
        }
        Ok(())
    }

    fn add_files(&mut self, files: &[String], archs: &[String]) -> Result<()> {
        let archs = self.archs(archs)?;
        let package = self.target();
        for file in files {
            for arch in &archs {
                package.archs.add(arch, ArchList::Files, file);
            }
        }
        Ok(())
    }

    fn add_assets(&mut self, files: &[String], archs: &[String]) -> Result<()> {
        let archs = self.archs(archs)?;
        let package = self.target();
        for file in files {
            for arch in &archs {
                package.archs.add(arch, ArchList::Assets, file);
            }
        }
        Ok(())
    }

    fn main_module(&mut self, file: &str, archs: &[String], options: MainModuleOptions) -> Result<()> {
        let archs = self.archs(archs)?;
        let package = self.target();
        for arch in &archs {
            package.archs.set_main_module(arch, file);
        }
        package.lazy |= options.lazy;
        package.legacy_module = true;
        Ok(())
    }

    fn npm_depends(&mut self, dependencies: &BTreeMap<String, String>) -> Result<()> {
        self.main
            .npm_dependencies
            .extend(dependencies.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }
}
