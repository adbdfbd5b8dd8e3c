//! Materializes a loaded package into its output folder: rewritten sources,
//! copied assets, entry points, the globals module and the manifest.

use crate::arch::{self, entry_file, known_archs, ArchList};
use crate::cache::AnalysisCache;
use crate::codegen::{
    render_define_stub, render_entry, render_globals, EntryPlan, ExportBinding, ExportCondition,
    ExportSource,
};
use crate::config::ConvertConfig;
use crate::error::{ConvertError, Result};
use crate::manifest::{Manifest, DEFINE_STUB, MANIFEST_FILE};
use crate::package::{EdgeKind, ExportRecord, Package, PackageSource, SourceFile};
use crate::rewrite::{
    globals_specifier_for, rewrite_source, GlobalSource, ModuleFormat, ResolutionTable,
    RewriteOptions, GLOBALS_MODULE, TEST_GLOBALS_MODULE,
};
use crate::scope::{AnalyzeOptions, FreeIdentifiers};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use walkdir::WalkDir;

const SCRIPT_EXTENSIONS: &[&str] = &["js", "mjs", "cjs"];

/// What a loaded dependency offers the package being written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencySurface {
    pub name: String,
    pub output_name: String,
    pub lazy: bool,
    pub kind: EdgeKind,
    pub archs: Vec<String>,
    /// Exported names per architecture, implied packages included.
    pub provides: BTreeMap<&'static str, BTreeSet<String>>,
}

impl DependencySurface {
    fn applies_to(&self, arch: &str) -> bool {
        self.archs.iter().any(|declared| arch::descends_from(arch, declared))
    }

    fn import_specifier(&self) -> String {
        if self.lazy {
            format!("{}/define", self.output_name)
        } else {
            self.output_name.clone()
        }
    }
}

pub struct WriteContext<'c> {
    pub config: &'c ConvertConfig,
    pub out_dir: PathBuf,
    pub dependencies: &'c [DependencySurface],
    pub test_dependencies: &'c [DependencySurface],
    pub cache: &'c AnalysisCache,
    pub cancelled: &'c AtomicBool,
}

#[derive(Debug, Clone, Default)]
pub struct WriteReport {
    pub files: Vec<PathBuf>,
}

struct Variant<'v> {
    package: &'v Package,
    dependencies: &'v [DependencySurface],
    globals_module: &'static str,
    test: bool,
    /// Test-only exports of the main package, surfaced by test entries.
    test_only_exports: Vec<(&'v String, &'v ExportRecord)>,
}

/// Globals owned by the package. A name the package assigns that a
/// dependency also exports is owned too, seeded from the dependency.
#[derive(Debug, Default)]
struct PackageGlobals {
    names: BTreeSet<String>,
    /// Name to the specifier that seeds it.
    seeds: BTreeMap<String, String>,
}

impl PackageGlobals {
    fn source_for(&self, name: &str, provided: &BTreeMap<String, String>) -> Option<GlobalSource> {
        if self.seeds.contains_key(name) {
            return Some(GlobalSource::Package);
        }
        match provided.get(name) {
            Some(specifier) => Some(GlobalSource::Import(specifier.clone())),
            None if self.names.contains(name) => Some(GlobalSource::Package),
            None => None,
        }
    }
}

struct ScriptFile {
    file: SourceFile,
    text: String,
    free: FreeIdentifiers,
    provided: BTreeMap<String, String>,
}

fn is_script(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| SCRIPT_EXTENSIONS.contains(&ext))
        .unwrap_or(false)
}

fn relative_specifier(path: &str) -> String {
    format!("./{}", path.trim_start_matches("./"))
}

/// Names dependencies provide on any architecture at or below `archs`,
/// mapped to the specifier that exports them. Earlier edges win.
fn provided_names(dependencies: &[DependencySurface], archs: &[&str]) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for arch in known_archs().filter(|k| archs.iter().any(|a| arch::descends_from(k, a))) {
        for dep in dependencies.iter().filter(|d| !d.lazy && d.applies_to(arch)) {
            if let Some(names) = dep.provides.get(arch) {
                for name in names {
                    out.entry(name.clone()).or_insert_with(|| dep.output_name.clone());
                }
            }
        }
    }
    out
}

fn export_condition(record: &ExportRecord) -> ExportCondition {
    if record.debug_only {
        ExportCondition::DebugOnly
    } else if record.prod_only {
        ExportCondition::ProdOnly
    } else {
        ExportCondition::Always
    }
}

fn check_cancelled(ctx: &WriteContext<'_>, package: &Package) -> Result<()> {
    if ctx.cancelled.load(Ordering::SeqCst) {
        return Err(ConvertError::Cancelled {
            package: package.name.clone(),
        });
    }
    Ok(())
}

async fn write_text(path: &Path, text: &str, report: &mut WriteReport) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ConvertError::io(parent, e))?;
    }
    tokio::fs::write(path, text)
        .await
        .map_err(|e| ConvertError::io(path, e))?;
    report.files.push(path.to_path_buf());
    Ok(())
}

/// Copy a file, or a directory tree, verbatim.
async fn copy_verbatim(src: &Path, dest: &Path, report: &mut WriteReport) -> Result<()> {
    let mut pairs = Vec::new();
    for entry in WalkDir::new(src).follow_links(true) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(src).to_path_buf();
            ConvertError::io(path, e.into())
        })?;
        if entry.file_type().is_file() {
            let relative = entry.path().strip_prefix(src).unwrap_or(Path::new(""));
            let target = if relative.as_os_str().is_empty() {
                dest.to_path_buf()
            } else {
                dest.join(relative)
            };
            pairs.push((entry.path().to_path_buf(), target));
        }
    }
    for (from, to) in pairs {
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ConvertError::io(parent, e))?;
        }
        tokio::fs::copy(&from, &to)
            .await
            .map_err(|e| ConvertError::io(&from, e))?;
        report.files.push(to);
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// WRITE
// ═══════════════════════════════════════════════════════════════════════════════

/// Write every artifact of `package`. Converted packages are left as they are.
#[tracing::instrument(level = "debug", skip_all, fields(package = %package.name))]
pub async fn write_package(package: &Package, ctx: &WriteContext<'_>) -> Result<WriteReport> {
    let mut report = WriteReport::default();
    let src_dir = match &package.source {
        PackageSource::Declaration { dir } => dir.clone(),
        PackageSource::Converted { .. } => return Ok(report),
        PackageSource::Detached => PathBuf::new(),
    };
    check_cancelled(ctx, package)?;
    tokio::fs::create_dir_all(&ctx.out_dir)
        .await
        .map_err(|e| ConvertError::io(&ctx.out_dir, e))?;

    let main = Variant {
        package,
        dependencies: ctx.dependencies,
        globals_module: GLOBALS_MODULE,
        test: false,
        test_only_exports: Vec::new(),
    };
    write_variant(&main, &src_dir, ctx, &mut report).await?;

    if ctx.config.include_tests {
        if let Some(test) = &package.test {
            let variant = Variant {
                package: test,
                dependencies: ctx.test_dependencies,
                globals_module: TEST_GLOBALS_MODULE,
                test: true,
                test_only_exports: package.exports.iter().filter(|(_, r)| r.test_only).collect(),
            };
            write_variant(&variant, &src_dir, ctx, &mut report).await?;
        }
    }

    for asset in package.assets() {
        check_cancelled(ctx, package)?;
        copy_verbatim(&src_dir.join(&asset), &ctx.out_dir.join(&asset), &mut report).await?;
    }

    let format = module_format(package);
    if package.lazy {
        let stub = render_define_stub(&package.output_name, format);
        write_text(&ctx.out_dir.join(DEFINE_STUB), &stub, &mut report).await?;
    }

    check_cancelled(ctx, package)?;
    let manifest = Manifest::from_package(package, ctx.config, ctx.config.include_tests);
    let manifest_path = ctx.out_dir.join(MANIFEST_FILE);
    manifest.write(&manifest_path).await?;
    report.files.push(manifest_path);

    tracing::info!(
        package = %package.name,
        files = report.files.len(),
        "package written"
    );
    Ok(report)
}

fn module_format(package: &Package) -> ModuleFormat {
    if package.common_module {
        ModuleFormat::CommonJs
    } else {
        ModuleFormat::Esm
    }
}

async fn write_variant(
    variant: &Variant<'_>,
    src_dir: &Path,
    ctx: &WriteContext<'_>,
    report: &mut WriteReport,
) -> Result<()> {
    let package = variant.package;
    let format = module_format(package);
    let analyze = AnalyzeOptions {
        legacy_module: package.legacy_module,
    };

    let mut scripts = Vec::new();
    for file in package.source_files() {
        check_cancelled(ctx, package)?;
        let src = src_dir.join(&file.path);
        if !is_script(&file.path) {
            copy_verbatim(&src, &ctx.out_dir.join(&file.path), report).await?;
            continue;
        }
        let text = tokio::fs::read_to_string(&src)
            .await
            .map_err(|e| ConvertError::io(&src, e))?;
        let free = ctx.cache.analyze(&text, &src.to_string_lossy(), analyze).await?;
        let provided = provided_names(variant.dependencies, &file.archs);
        scripts.push(ScriptFile {
            file,
            text,
            free,
            provided,
        });
    }

    let globals = produced_globals(variant, &scripts);

    for script in &scripts {
        check_cancelled(ctx, package)?;
        let mut table = ResolutionTable::new();
        for name in script.free.names.keys() {
            if let Some(source) = globals.source_for(name, &script.provided) {
                table.insert(name.clone(), source);
            }
        }
        let options = RewriteOptions {
            format,
            globals_specifier: globals_specifier_for(&script.file.path, variant.globals_module),
            legacy_module: package.legacy_module,
        };
        let output = rewrite_source(&script.text, &script.file.path, &script.free, &table, &options)?;
        write_text(&ctx.out_dir.join(&script.file.path), &output.code, report).await?;
    }

    for arch in package.archs.active_archs() {
        check_cancelled(ctx, package)?;
        let plan = entry_plan(variant, &globals, arch, format);
        let path = ctx.out_dir.join(entry_file(arch, variant.test));
        write_text(&path, &render_entry(&plan), report).await?;
    }

    let module = render_globals(&globals.names, &globals.seeds, format);
    write_text(&ctx.out_dir.join(variant.globals_module), &module, report).await
}

/// Globals owned by the package: assigned somewhere in its sources or
/// exported and not provided by a dependency. Assigning a dependency's
/// export takes it over for the whole package.
fn produced_globals(variant: &Variant<'_>, scripts: &[ScriptFile]) -> PackageGlobals {
    let package = variant.package;
    let mut globals = PackageGlobals::default();
    for script in scripts {
        for name in script.free.assigned() {
            if let Some(dependency) = script.provided.get(name) {
                if !globals.seeds.contains_key(name) {
                    tracing::debug!(
                        package = %package.name,
                        file = %script.file.path,
                        global = name,
                        dependency = %dependency,
                        "assigned global shadows a dependency export"
                    );
                    globals.seeds.insert(name.to_string(), dependency.clone());
                }
            }
            globals.names.insert(name.to_string());
        }
    }
    for (name, record) in &package.exports {
        let archs: Vec<&str> = record.archs.iter().map(String::as_str).collect();
        if !provided_names(variant.dependencies, &archs).contains_key(name) {
            globals.names.insert(name.clone());
        }
    }
    globals
}

fn entry_plan(
    variant: &Variant<'_>,
    globals: &PackageGlobals,
    arch: &str,
    format: ModuleFormat,
) -> EntryPlan {
    let package = variant.package;
    let provided = provided_names(variant.dependencies, &[arch]);
    let own_globals = relative_specifier(variant.globals_module);

    let dependencies = package
        .archs
        .get(arch, ArchList::Imports, true)
        .into_iter()
        .map(|converted| {
            variant
                .dependencies
                .iter()
                .find(|d| d.output_name == converted)
                .map(DependencySurface::import_specifier)
                .unwrap_or(converted)
        })
        .collect();

    let files = package
        .archs
        .get(arch, ArchList::Files, true)
        .into_iter()
        .filter(|f| is_script(f))
        .map(|f| relative_specifier(&f))
        .collect();

    let implies = package
        .implied_on(arch)
        .iter()
        .filter_map(|name| {
            variant
                .dependencies
                .iter()
                .find(|d| &d.name == name)
                .map(|d| d.output_name.clone())
        })
        .collect();

    let mut exports = Vec::new();
    let own = package
        .exports
        .iter()
        .filter(|(_, record)| !record.test_only || variant.test)
        .map(|(name, record)| (name, record, own_globals.clone(), true));
    let main_test_only = variant
        .test_only_exports
        .iter()
        .map(|(name, record)| (*name, *record, relative_specifier(GLOBALS_MODULE), false));
    for (name, record, module, own_module) in own.chain(main_test_only) {
        if !record.visible_on(arch) || exports.iter().any(|b: &ExportBinding| &b.name == name) {
            continue;
        }
        let source = match provided.get(name) {
            Some(specifier) if !(own_module && globals.seeds.contains_key(name)) => {
                ExportSource::Dependency(specifier.clone())
            }
            _ => ExportSource::Globals(module),
        };
        exports.push(ExportBinding {
            name: name.clone(),
            source,
            condition: export_condition(record),
        });
    }

    EntryPlan {
        format,
        dependencies,
        files,
        implies,
        main_module: package
            .archs
            .main_module(arch, true)
            .map(|m| relative_specifier(&m)),
        exports,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface(name: &str, archs: &[&str], provides: &[(&'static str, &[&str])]) -> DependencySurface {
        DependencySurface {
            name: name.to_string(),
            output_name: format!("@legacy/{}", name),
            lazy: false,
            kind: EdgeKind::Strong,
            archs: archs.iter().map(|a| a.to_string()).collect(),
            provides: provides
                .iter()
                .map(|(arch, names)| (*arch, names.iter().map(|n| n.to_string()).collect()))
                .collect(),
        }
    }

    #[test]
    fn test_provided_names_follow_architectures() {
        let deps = vec![
            surface("tracker", &["common"], &[("os", &["Tracker"]), ("web.browser", &["Tracker"])]),
            surface("blaze", &["client"], &[("web.browser", &["Blaze", "Tracker"])]),
        ];
        let client = provided_names(&deps, &["client"]);
        assert_eq!(client.get("Blaze").map(String::as_str), Some("@legacy/blaze"));
        assert_eq!(client.get("Tracker").map(String::as_str), Some("@legacy/tracker"));

        let server = provided_names(&deps, &["server"]);
        assert!(!server.contains_key("Blaze"));
        assert!(server.contains_key("Tracker"));
    }

    #[test]
    fn test_lazy_dependencies_are_imported_through_define() {
        let mut dep = surface("lazy", &["common"], &[("os", &["Lazy"])]);
        dep.lazy = true;
        assert_eq!(dep.import_specifier(), "@legacy/lazy/define");
        assert!(provided_names(&[dep], &["common"]).is_empty());
    }

    #[test]
    fn test_script_detection() {
        assert!(is_script("lib/a.js"));
        assert!(is_script("a.mjs"));
        assert!(!is_script("style.css"));
        assert_eq!(relative_specifier("./lib/a.js"), "./lib/a.js");
        assert_eq!(relative_specifier("lib/a.js"), "./lib/a.js");
    }
}
