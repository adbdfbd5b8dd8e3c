//! Conversion job: loads the dependency closure of the requested packages,
//! each package exactly once, then writes every loaded package.
//!
//! Every name owns a slot holding two cells. The load cell is filled by the
//! first caller and awaited by everyone else, cyclic re-entrants included;
//! loading never waits on another package, so a cycle cannot deadlock. The
//! write cell makes writing at-most-once per descriptor.

use crate::arch::known_archs;
use crate::cache::AnalysisCache;
use crate::catalog::{check_version, collect_requests, find_archived, DirectoryCatalog};
use crate::config::ConvertConfig;
use crate::discovery::{discover_packages, FolderIndex};
use crate::error::{ConvertError, Result};
use crate::load_order::{build_load_order, LoadOrderEntry};
use crate::manifest::{read_converted_package, MANIFEST_FILE};
use crate::package::{Dependency, EdgeKind, Package};
use crate::versions::{resolve_versions, Constraint, PackageSpec, ResolvedVersion};
use crate::writer::{write_package, DependencySurface, WriteContext};
use semver::Version;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OnceCell;
use tokio::task::JoinSet;
use tracing::instrument;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Outcome of [`ConversionJob::warm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Warm {
    /// A slot was created; the caller is responsible for ensuring it.
    New,
    /// Someone else already owns the slot.
    Existing,
}

#[derive(Default)]
struct PackageSlot {
    /// First constraint the package was requested with.
    pin: Option<String>,
    /// Skip previously converted output when locating.
    refresh: bool,
    loaded: OnceCell<Arc<Package>>,
    /// Outcome of the single write attempt; `Some` holds its failure.
    written: OnceCell<Option<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversionSummary {
    /// Every package loaded by the job, sorted.
    pub loaded: Vec<String>,
    /// Packages written by the job so far.
    pub written: usize,
}

pub struct ConversionJob {
    config: ConvertConfig,
    cache: AnalysisCache,
    packages: Mutex<HashMap<String, Arc<PackageSlot>>>,
    folders: OnceCell<FolderIndex>,
    resolved: Mutex<BTreeMap<String, ResolvedVersion>>,
    cancelled: AtomicBool,
    writes: AtomicUsize,
}

async fn join_all(mut tasks: JoinSet<Result<()>>) -> Result<()> {
    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        let outcome = joined.map_err(|e| ConvertError::Task(e.to_string())).and_then(|r| r);
        if let Err(e) = outcome {
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

impl ConversionJob {
    pub fn new(config: ConvertConfig) -> Arc<Self> {
        let cache = AnalysisCache::new(config.cache_dir.clone());
        Arc::new(ConversionJob {
            config,
            cache,
            packages: Mutex::new(HashMap::new()),
            folders: OnceCell::new(),
            resolved: Mutex::new(BTreeMap::new()),
            cancelled: AtomicBool::new(false),
            writes: AtomicUsize::new(0),
        })
    }

    pub fn config(&self) -> &ConvertConfig {
        &self.config
    }

    /// Number of package writes performed by this job.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Arc<PackageSlot>>> {
        self.packages.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn slot(&self, name: &str) -> Option<Arc<PackageSlot>> {
        self.slots().get(name).cloned()
    }

    /// Create the slot for `name` unless one exists.
    pub fn warm(&self, name: &str, pin: Option<&str>) -> Warm {
        self.warm_slot(name, pin, false)
    }

    fn warm_slot(&self, name: &str, pin: Option<&str>, refresh: bool) -> Warm {
        let mut packages = self.slots();
        if packages.contains_key(name) {
            return Warm::Existing;
        }
        tracing::trace!(package = name, "warmed");
        packages.insert(
            name.to_string(),
            Arc::new(PackageSlot {
                pin: pin.map(str::to_string),
                refresh,
                ..PackageSlot::default()
            }),
        );
        Warm::New
    }

    /// Loaded descriptor of `name`, if any.
    pub fn get(&self, name: &str) -> Option<Arc<Package>> {
        self.slot(name)?.loaded.get().cloned()
    }

    pub fn loaded_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .slots()
            .iter()
            .filter(|(_, slot)| slot.loaded.initialized())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    async fn folders(&self) -> &FolderIndex {
        self.folders
            .get_or_init(|| async {
                let roots: Vec<PathBuf> = self
                    .config
                    .local_dirs
                    .iter()
                    .chain(self.config.shared_dirs.iter())
                    .cloned()
                    .collect();
                discover_packages(&roots)
            })
            .await
    }

    fn is_local(&self, name: &str) -> bool {
        self.folders
            .get()
            .map(|folders| folders.get(name).is_some())
            .unwrap_or(false)
    }

    fn resolved_version(&self, name: &str) -> Option<Version> {
        let resolved = self.resolved.lock().unwrap_or_else(|p| p.into_inner());
        match resolved.get(name) {
            Some(ResolvedVersion::Version(version)) => Some(version.clone()),
            _ => None,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // LOAD
    // ═══════════════════════════════════════════════════════════════════════════

    /// Load `name` through its slot, warming it when needed.
    pub async fn load(&self, name: &str) -> Result<Arc<Package>> {
        let slot = match self.slot(name) {
            Some(slot) => slot,
            None => {
                self.warm(name, None);
                self.slot(name).ok_or_else(|| ConvertError::PackageNotFound {
                    name: name.to_string(),
                })?
            }
        };
        let package = slot
            .loaded
            .get_or_try_init(|| async {
                self.locate(name, slot.pin.as_deref(), slot.refresh)
                    .await
                    .map(Arc::new)
            })
            .await?;
        Ok(package.clone())
    }

    #[instrument(level = "debug", skip(self))]
    async fn locate(&self, name: &str, pin: Option<&str>, refresh: bool) -> Result<Package> {
        let config = &self.config;
        if let Some(dir) = self.folders().await.get(name) {
            tracing::debug!(package = name, dir = %dir.display(), "loading local declaration");
            return Package::from_declaration_dir(dir, name, config).await;
        }

        let converted = config.converted_name(name);
        if !refresh && !config.force_refresh.applies_to(name) {
            let dir = config.output_dir.join(&converted);
            if dir.join(MANIFEST_FILE).is_file() {
                tracing::debug!(package = name, "reusing converted output");
                return read_converted_package(&dir, config).await;
            }
        }
        if let Some(registry) = &config.registry_dir {
            let dir = registry.join(&converted);
            if dir.join(MANIFEST_FILE).is_file() {
                tracing::debug!(package = name, "loading from registry");
                return read_converted_package(&dir, config).await;
            }
        }

        let requested = pin.map(Constraint::parse).transpose()?;
        let resolved = self
            .resolved_version(name)
            .map(|version| Constraint::parse(&format!("={}", version)))
            .transpose()?;
        let archived = resolved
            .as_ref()
            .and_then(|exact| find_archived(&config.archive_dirs, name, Some(exact)))
            .or_else(|| find_archived(&config.archive_dirs, name, requested.as_ref()));
        if let Some((version, dir)) = archived {
            tracing::debug!(package = name, %version, "loading archived release");
            return Package::from_declaration_dir(&dir, name, config).await;
        }

        Err(ConvertError::PackageNotFound {
            name: name.to_string(),
        })
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // ENSURE
    // ═══════════════════════════════════════════════════════════════════════════

    /// Load `name` and, recursively, every package it depends on.
    pub async fn ensure_packages(self: &Arc<Self>, name: &str) -> Result<()> {
        self.warm(name, None);
        self.clone().ensure(name.to_string()).await
    }

    fn ensure(self: Arc<Self>, name: String) -> BoxFuture<Result<()>> {
        Box::pin(async move {
            let package = self.load(&name).await.map_err(|e| e.in_package(&name))?;
            let mut children = JoinSet::new();
            for edge in package.edges(self.config.include_tests) {
                if edge.name == package.name {
                    continue;
                }
                let warm = self.warm(&edge.name, edge.constraint.as_deref());
                let dependency = match self.load(&edge.name).await {
                    Ok(dependency) => dependency,
                    Err(e) if edge.kind == EdgeKind::Weak && e.is_not_found() => {
                        tracing::warn!(
                            package = %package.name,
                            dependency = %edge.name,
                            "weak dependency not found, treating it as absent"
                        );
                        continue;
                    }
                    Err(e) => return Err(e.for_dependency(&package.name, &edge.name)),
                };
                if !self.is_local(&edge.name) {
                    check_version(&dependency, &package.name, edge.constraint.as_deref())
                        .map_err(|e| e.for_dependency(&package.name, &edge.name))?;
                }
                if warm == Warm::New {
                    children.spawn(self.clone().ensure(edge.name.clone()));
                }
            }
            join_all(children).await
        })
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // WRITE
    // ═══════════════════════════════════════════════════════════════════════════

    /// Write `name` unless it was already written by this descriptor.
    ///
    /// Writing is attempted once per descriptor. Concurrent callers wait for
    /// the first attempt; when it fails, they and every later caller get
    /// [`ConvertError::WriteFailed`] instead of a second attempt. A fresh
    /// descriptor from [`ConversionJob::reconvert`] may be written again.
    pub async fn write(&self, name: &str) -> Result<()> {
        let not_loaded = || ConvertError::PackageNotFound {
            name: name.to_string(),
        };
        let slot = self.slot(name).ok_or_else(not_loaded)?;
        let package = slot.loaded.get().cloned().ok_or_else(not_loaded)?;
        let mut first_error = None;
        let error_slot = &mut first_error;
        let failure = slot
            .written
            .get_or_init(move || async move {
                match self.materialize(&package).await {
                    Ok(()) => None,
                    Err(e) => {
                        let message = e.to_string();
                        *error_slot = Some(e);
                        Some(message)
                    }
                }
            })
            .await;
        if let Some(e) = first_error {
            return Err(e.in_package(name));
        }
        match failure {
            Some(message) => Err(ConvertError::WriteFailed {
                package: name.to_string(),
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }

    async fn materialize(&self, package: &Package) -> Result<()> {
        if self.is_cancelled() {
            return Err(ConvertError::Cancelled {
                package: package.name.clone(),
            });
        }
        let dependencies = self.surfaces(&package.dependencies);
        let test_dependencies = package
            .test
            .as_ref()
            .map(|test| self.surfaces(&test.dependencies))
            .unwrap_or_default();
        let ctx = WriteContext {
            config: &self.config,
            out_dir: self.config.package_output_dir(&package.name),
            dependencies: &dependencies,
            test_dependencies: &test_dependencies,
            cache: &self.cache,
            cancelled: &self.cancelled,
        };
        let report = write_package(package, &ctx).await?;
        if !report.files.is_empty() {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn write_all(self: &Arc<Self>) -> Result<()> {
        let mut tasks = JoinSet::new();
        for name in self.loaded_names() {
            let job = self.clone();
            tasks.spawn(async move { job.write(&name).await });
        }
        join_all(tasks).await
    }

    /// What each loaded edge target offers; absent weak targets are skipped.
    fn surfaces(&self, edges: &[Dependency]) -> Vec<DependencySurface> {
        edges
            .iter()
            .filter_map(|edge| {
                let dependency = self.get(&edge.name)?;
                let provides = known_archs()
                    .map(|arch| (arch, self.provided_on(&dependency, arch)))
                    .collect();
                Some(DependencySurface {
                    name: edge.name.clone(),
                    output_name: dependency.output_name.clone(),
                    lazy: dependency.lazy,
                    kind: edge.kind,
                    archs: edge.archs.clone(),
                    provides,
                })
            })
            .collect()
    }

    /// Export surface of `package` on `arch`, implied packages included.
    fn provided_on(&self, package: &Package, arch: &str) -> BTreeSet<String> {
        let mut names = package.surface(arch);
        let mut seen = BTreeSet::from([package.name.clone()]);
        let mut pending = package.implied_on(arch);
        while let Some(implied) = pending.pop() {
            if !seen.insert(implied.clone()) {
                continue;
            }
            if let Some(implied) = self.get(&implied) {
                names.extend(implied.surface(arch));
                pending.extend(implied.implied_on(arch));
            }
        }
        names
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // ENTRY POINTS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Convert `names` and `versioned_names` (`name@constraint`) together
    /// with their dependency closure.
    #[instrument(skip(self), fields(roots = names.len() + versioned_names.len()))]
    pub async fn convert_packages(
        self: &Arc<Self>,
        names: &[String],
        versioned_names: &[String],
    ) -> Result<ConversionSummary> {
        let mut roots: Vec<(String, Option<String>)> =
            names.iter().map(|name| (name.clone(), None)).collect();
        for raw in versioned_names {
            let spec = PackageSpec::parse(raw)
                .map_err(|_| ConvertError::InvalidConstraint { value: raw.clone() })?;
            roots.push((spec.name, spec.constraint));
        }

        self.folders().await;
        if self.config.check_versions {
            self.check_versions(&roots).await?;
        }

        let mut tasks = JoinSet::new();
        for (name, pin) in &roots {
            if self.warm(name, pin.as_deref()) == Warm::New {
                tasks.spawn(self.clone().ensure(name.clone()));
            }
        }
        join_all(tasks).await?;

        for (name, pin) in &roots {
            if let Some(package) = self.get(name) {
                if !self.is_local(name) {
                    check_version(&package, "requested packages", pin.as_deref())?;
                }
            }
        }

        self.write_all().await?;
        let summary = ConversionSummary {
            loaded: self.loaded_names(),
            written: self.write_count(),
        };
        tracing::info!(
            loaded = summary.loaded.len(),
            written = summary.written,
            "conversion finished"
        );
        Ok(summary)
    }

    async fn check_versions(&self, roots: &[(String, Option<String>)]) -> Result<()> {
        let folders = self.folders().await;
        let catalog = DirectoryCatalog::scan(&self.config, folders).await?;
        let requests = collect_requests(&catalog, roots)?;
        let resolved = resolve_versions(&requests, catalog.local_paths())?;
        tracing::debug!(packages = resolved.len(), "versions resolved");
        *self.resolved.lock().unwrap_or_else(|p| p.into_inner()) = resolved;
        Ok(())
    }

    /// Discard `name` and its direct dependents, then load, ensure and
    /// write them again.
    #[instrument(skip(self))]
    pub async fn reconvert(self: &Arc<Self>, name: &str) -> Result<()> {
        let discarded: Vec<(String, Option<String>)> = {
            let mut packages = self.slots();
            let mut names = vec![name.to_string()];
            for (other, slot) in packages.iter() {
                let depends = slot
                    .loaded
                    .get()
                    .map(|p| p.edges(self.config.include_tests).any(|e| e.name == name))
                    .unwrap_or(false);
                if depends && !names.contains(other) {
                    names.push(other.clone());
                }
            }
            names
                .into_iter()
                .map(|n| {
                    let pin = packages.remove(&n).and_then(|slot| slot.pin.clone());
                    (n, pin)
                })
                .collect()
        };
        tracing::info!(
            package = name,
            discarded = discarded.len(),
            "reconverting"
        );

        let mut tasks = JoinSet::new();
        for (package, pin) in &discarded {
            self.warm_slot(package, pin.as_deref(), true);
            tasks.spawn(self.clone().ensure(package.clone()));
        }
        join_all(tasks).await?;
        self.write_all().await
    }

    /// Stop all further writes and remove the output of `name`.
    #[instrument(skip(self))]
    pub async fn cancel_and_delete(&self, name: &str) -> Result<()> {
        self.cancelled.store(true, Ordering::SeqCst);
        let dir = self.config.package_output_dir(name);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                tracing::info!(package = name, dir = %dir.display(), "output removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ConvertError::io(dir, e)),
        }
    }

    /// Load order on `arch` of the loaded packages reachable from `roots`.
    /// Weak edges are not followed: a weak target is ordered only when it is
    /// reached some other way.
    pub fn load_order(&self, arch: &str, roots: &[String]) -> Vec<LoadOrderEntry> {
        let mut records = BTreeMap::new();
        let mut pending: Vec<String> = roots.to_vec();
        while let Some(name) = pending.pop() {
            if records.contains_key(&name) {
                continue;
            }
            let Some(package) = self.get(&name) else {
                continue;
            };
            let record = package.dependency_record(arch);
            pending.extend(record.strong.iter().chain(record.after.iter()).cloned());
            records.insert(name, record);
        }
        let records: Vec<_> = records.into_values().collect();
        build_load_order(&records, roots)
    }
}
