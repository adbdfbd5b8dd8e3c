//! Package folder discovery.
//!
//! Walks the configured local and shared folders for `package.js`
//! declarations and indexes them by package name. A folder is indexed under
//! its directory name and, when it declares one, under the name passed to
//! `Package.describe`.

use crate::declaration::{
    interpret_declaration, Describe, ExportOptions, MainModuleOptions, PackageApi, UseOptions,
};
use crate::error::Result;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const DECLARATION_FILE: &str = "package.js";

lazy_static! {
    /// Cheap pre-check before running the declaration interpreter.
    static ref DESCRIBES_NAME: Regex = Regex::new(r"Package\s*\.\s*describe\s*\(").unwrap();
}

/// Declaration folders by package name. Earlier folders win.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderIndex {
    folders: BTreeMap<String, PathBuf>,
}

impl FolderIndex {
    pub fn get(&self, name: &str) -> Option<&Path> {
        self.folders.get(name).map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.folders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.folders.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.folders.keys().map(String::as_str)
    }

    fn insert(&mut self, name: String, dir: &Path) {
        if let Some(existing) = self.folders.get(&name) {
            if existing != dir {
                tracing::debug!(
                    package = %name,
                    kept = %existing.display(),
                    ignored = %dir.display(),
                    "package found in more than one folder"
                );
            }
            return;
        }
        self.folders.insert(name, dir.to_path_buf());
    }
}

/// Name-only view of a declaration.
#[derive(Default)]
struct NameReader {
    name: Option<String>,
}

impl PackageApi for NameReader {
    fn describe(&mut self, describe: Describe) -> Result<()> {
        self.name = describe.name;
        Ok(())
    }

    fn use_packages(&mut self, _: &[String], _: &[String], _: UseOptions) -> Result<()> {
        Ok(())
    }

    fn imply(&mut self, _: &[String], _: &[String]) -> Result<()> {
        Ok(())
    }

    fn export(&mut self, _: &[String], _: &[String], _: ExportOptions) -> Result<()> {
        Ok(())
    }

    fn add_files(&mut self, _: &[String], _: &[String]) -> Result<()> {
        Ok(())
    }

    fn add_assets(&mut self, _: &[String], _: &[String]) -> Result<()> {
        Ok(())
    }

    fn main_module(&mut self, _: &str, _: &[String], _: MainModuleOptions) -> Result<()> {
        Ok(())
    }

    fn npm_depends(&mut self, _: &BTreeMap<String, String>) -> Result<()> {
        Ok(())
    }
}

/// Name declared by `package.js` in `dir`, if it declares one and parses.
pub fn declared_name(dir: &Path) -> Option<String> {
    let file = dir.join(DECLARATION_FILE);
    let source = std::fs::read_to_string(&file).ok()?;
    if !DESCRIBES_NAME.is_match(&source) {
        return None;
    }
    let mut reader = NameReader::default();
    match interpret_declaration(&source, &file.to_string_lossy(), &mut reader) {
        Ok(()) => reader.name,
        Err(e) => {
            tracing::debug!(file = %file.display(), error = %e, "skipping unreadable declaration");
            None
        }
    }
}

/// Index every folder under `roots` holding a declaration. `node_modules`
/// and hidden directories are skipped.
pub fn discover_packages(roots: &[PathBuf]) -> FolderIndex {
    let mut index = FolderIndex::default();
    for root in roots {
        if !root.exists() {
            tracing::debug!(root = %root.display(), "package folder does not exist");
            continue;
        }
        let walker = WalkDir::new(root)
            .follow_links(true)
            .into_iter()
            .filter_entry(|entry| {
                let name = entry.file_name().to_string_lossy();
                entry.depth() == 0 || !(name.starts_with('.') || name == "node_modules")
            });
        for entry in walker.flatten() {
            if !entry.file_type().is_file() || entry.file_name() != DECLARATION_FILE {
                continue;
            }
            let Some(dir) = entry.path().parent() else {
                continue;
            };
            let folder_name = dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if let Some(declared) = declared_name(dir) {
                index.insert(declared, dir);
            }
            if !folder_name.is_empty() {
                index.insert(folder_name, dir);
            }
        }
    }
    tracing::debug!(packages = index.len(), "package folders indexed");
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn declare(root: &Path, folder: &str, source: &str) -> PathBuf {
        let dir = root.join(folder);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(DECLARATION_FILE), source).unwrap();
        dir
    }

    #[test]
    fn test_indexes_folder_and_declared_names() {
        let tmp = tempfile::tempdir().unwrap();
        let plain = declare(tmp.path(), "alpha", "Package.onUse(function (api) {});");
        let named = declare(
            tmp.path(),
            "nested/beta-src",
            r#"Package.describe({ name: "acme:beta" });"#,
        );
        declare(tmp.path(), "node_modules/ignored", "");

        let index = discover_packages(&[tmp.path().to_path_buf()]);
        assert_eq!(index.get("alpha"), Some(plain.as_path()));
        assert_eq!(index.get("acme:beta"), Some(named.as_path()));
        assert_eq!(index.get("beta-src"), Some(named.as_path()));
        assert_eq!(index.get("ignored"), None);
    }

    #[test]
    fn test_earlier_roots_win() {
        let local = tempfile::tempdir().unwrap();
        let shared = tempfile::tempdir().unwrap();
        let first = declare(local.path(), "alpha", "");
        declare(shared.path(), "alpha", "");

        let index = discover_packages(&[local.path().to_path_buf(), shared.path().to_path_buf()]);
        assert_eq!(index.get("alpha"), Some(first.as_path()));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_missing_roots_are_skipped() {
        let index = discover_packages(&[PathBuf::from("/definitely/not/here")]);
        assert!(index.is_empty());
    }
}
