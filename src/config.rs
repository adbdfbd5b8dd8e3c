use crate::error::{ConvertError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

pub const DEFAULT_SCOPE: &str = "@legacy";

/// Which already-converted packages must be converted again.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ForceRefresh {
    #[default]
    None,
    All,
    Only(BTreeSet<String>),
}

impl ForceRefresh {
    pub fn applies_to(&self, name: &str) -> bool {
        match self {
            ForceRefresh::None => false,
            ForceRefresh::All => true,
            ForceRefresh::Only(names) => names.contains(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConvertConfig {
    pub output_dir: PathBuf,
    /// Package source folders, searched before `shared_dirs`.
    pub local_dirs: Vec<PathBuf>,
    pub shared_dirs: Vec<PathBuf>,
    /// Unpacked legacy releases laid out as `<dir>/<name>/<version>/package.js`.
    pub archive_dirs: Vec<PathBuf>,
    /// Folder of previously converted packages, one manifest per package.
    pub registry_dir: Option<PathBuf>,
    pub scope: String,
    pub force_refresh: ForceRefresh,
    pub check_versions: bool,
    /// Packages emitted as CommonJS instead of ES modules.
    pub common_modules: BTreeSet<String>,
    /// Build-system packages that switch a package to module semantics
    /// instead of being converted themselves.
    pub module_markers: BTreeSet<String>,
    pub include_tests: bool,
    pub cache_dir: Option<PathBuf>,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        ConvertConfig {
            output_dir: PathBuf::from("converted"),
            local_dirs: Vec::new(),
            shared_dirs: Vec::new(),
            archive_dirs: Vec::new(),
            registry_dir: None,
            scope: DEFAULT_SCOPE.to_string(),
            force_refresh: ForceRefresh::None,
            check_versions: false,
            common_modules: BTreeSet::new(),
            module_markers: ["ecmascript", "modules", "typescript"]
                .into_iter()
                .map(String::from)
                .collect(),
            include_tests: false,
            cache_dir: None,
        }
    }
}

impl ConvertConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| ConvertError::io(path, e))?;
        serde_json::from_str(&text).map_err(|source| ConvertError::Manifest {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Published name of a legacy package: `user:pkg` becomes `@legacy/user_pkg`.
    pub fn converted_name(&self, name: &str) -> String {
        format!("{}/{}", self.scope, name.replace(':', "_"))
    }

    pub fn package_output_dir(&self, name: &str) -> PathBuf {
        self.output_dir.join(self.converted_name(name))
    }

    pub fn is_common_module(&self, name: &str) -> bool {
        self.common_modules.contains(name)
    }

    pub fn is_module_marker(&self, name: &str) -> bool {
        self.module_markers.contains(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_partial_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("convert.json");
        std::fs::write(
            &path,
            r#"{
              "outputDir": "out",
              "localDirs": ["packages"],
              "forceRefresh": { "only": ["alpha"] },
              "commonModules": ["legacy-lib"]
            }"#,
        )
        .unwrap();

        let config = ConvertConfig::load(&path).unwrap();
        assert_eq!(config.output_dir, PathBuf::from("out"));
        assert_eq!(config.scope, DEFAULT_SCOPE);
        assert!(config.force_refresh.applies_to("alpha"));
        assert!(!config.force_refresh.applies_to("beta"));
        assert!(config.is_common_module("legacy-lib"));
        assert!(config.is_module_marker("ecmascript"));
    }

    #[test]
    fn test_converted_names() {
        let config = ConvertConfig::default();
        assert_eq!(config.converted_name("user:pkg"), "@legacy/user_pkg");
        assert_eq!(
            config.package_output_dir("alpha"),
            PathBuf::from("converted").join("@legacy/alpha")
        );
    }

    #[test]
    fn test_bad_config_reports_manifest_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("convert.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = ConvertConfig::load(&path).unwrap_err();
        assert_eq!(err.code(), crate::error::ERR_MANIFEST);
    }
}
