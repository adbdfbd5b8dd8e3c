use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

// ═══════════════════════════════════════════════════════════════════════════════
// ERROR CODES
// ═══════════════════════════════════════════════════════════════════════════════

pub const ERR_SYNTAX: &str = "CV-ERR-SYNTAX";
pub const ERR_DECLARATION: &str = "CV-ERR-DECL";
pub const ERR_VISIBILITY: &str = "CV-ERR-DECL-VISIBILITY";
pub const ERR_NOT_FOUND: &str = "CV-ERR-RESOLVE-MISSING";
pub const ERR_VERSION_MISMATCH: &str = "CV-ERR-RESOLVE-MISMATCH";
pub const ERR_VERSION_CONFLICT: &str = "CV-ERR-RESOLVE-CONFLICT";
pub const ERR_INVALID_VERSION: &str = "CV-ERR-VERSION";
pub const ERR_IO: &str = "CV-ERR-IO";
pub const ERR_MANIFEST: &str = "CV-ERR-MANIFEST";
pub const ERR_REWRITE: &str = "CV-ERR-REWRITE";
pub const ERR_WRITE_FAILED: &str = "CV-ERR-WRITE";
pub const ERR_CANCELLED: &str = "CV-ERR-CANCELLED";
pub const ERR_TASK: &str = "CV-ERR-TASK";

/// Which parser goal produced a syntax error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    /// Module goal, no recovery.
    Strict,
    /// Script goal, top-level `return` allowed, recoverable errors tolerated.
    Loose,
}

impl fmt::Display for ParseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseMode::Strict => f.write_str("strict"),
            ParseMode::Loose => f.write_str("loose"),
        }
    }
}

/// One name whose requested versions have no mutually compatible member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionConflict {
    pub name: String,
    pub requested: Vec<String>,
}

impl fmt::Display for VersionConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.requested.join(", "))
    }
}

fn format_conflicts(conflicts: &[VersionConflict]) -> String {
    conflicts
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONVERT ERROR
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("{file}:{line}:{column}: syntax error ({mode} parse): {message}")]
    Syntax {
        file: String,
        mode: ParseMode,
        line: u32,
        column: u32,
        message: String,
    },

    #[error("invalid package declaration in {file}: {message}")]
    Declaration { file: String, message: String },

    #[error("package '{package}' sets more than one of prodOnly, devOnly and testOnly")]
    ConflictingVisibility { package: String },

    #[error("package '{name}' was not found in any package folder, catalog or archive")]
    PackageNotFound { name: String },

    #[error("package '{name}' is loaded at version {loaded} but '{required_by}' requires {constraint}")]
    VersionMismatch {
        name: String,
        loaded: String,
        required_by: String,
        constraint: String,
    },

    #[error("unresolvable version constraints: {}", format_conflicts(.0))]
    VersionConflicts(Vec<VersionConflict>),

    #[error("invalid version '{value}': {source}")]
    InvalidVersion {
        value: String,
        #[source]
        source: semver::Error,
    },

    #[error("invalid version constraint '{value}'")]
    InvalidConstraint { value: String },

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}: invalid manifest: {source}", .path.display())]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{file}: assigns '{name}', which is imported from '{specifier}'")]
    ImportedGlobalAssigned {
        file: String,
        name: String,
        specifier: String,
    },

    #[error("an earlier write of '{package}' failed: {message}")]
    WriteFailed { package: String, message: String },

    #[error("conversion of '{package}' was cancelled")]
    Cancelled { package: String },

    #[error("while converting '{package}': {source}")]
    InPackage {
        package: String,
        #[source]
        source: Box<ConvertError>,
    },

    #[error("'{package}' requires '{dependency}': {source}")]
    Dependency {
        package: String,
        dependency: String,
        #[source]
        source: Box<ConvertError>,
    },

    #[error("conversion task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, ConvertError>;

impl ConvertError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ConvertError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn declaration(file: impl Into<String>, message: impl Into<String>) -> Self {
        ConvertError::Declaration {
            file: file.into(),
            message: message.into(),
        }
    }

    /// Annotate with the package being processed. Already-annotated errors for
    /// the same package are left alone so chains don't stutter.
    pub fn in_package(self, package: &str) -> Self {
        match &self {
            ConvertError::InPackage { package: p, .. } if p == package => self,
            _ => ConvertError::InPackage {
                package: package.to_string(),
                source: Box::new(self),
            },
        }
    }

    pub fn for_dependency(self, package: &str, dependency: &str) -> Self {
        ConvertError::Dependency {
            package: package.to_string(),
            dependency: dependency.to_string(),
            source: Box::new(self),
        }
    }

    /// Stable error code; wrappers report the code of the innermost cause.
    pub fn code(&self) -> &'static str {
        match self {
            ConvertError::Syntax { .. } => ERR_SYNTAX,
            ConvertError::Declaration { .. } => ERR_DECLARATION,
            ConvertError::ConflictingVisibility { .. } => ERR_VISIBILITY,
            ConvertError::PackageNotFound { .. } => ERR_NOT_FOUND,
            ConvertError::VersionMismatch { .. } => ERR_VERSION_MISMATCH,
            ConvertError::VersionConflicts(_) => ERR_VERSION_CONFLICT,
            ConvertError::InvalidVersion { .. } | ConvertError::InvalidConstraint { .. } => {
                ERR_INVALID_VERSION
            }
            ConvertError::Io { .. } => ERR_IO,
            ConvertError::Manifest { .. } => ERR_MANIFEST,
            ConvertError::ImportedGlobalAssigned { .. } => ERR_REWRITE,
            ConvertError::WriteFailed { .. } => ERR_WRITE_FAILED,
            ConvertError::Cancelled { .. } => ERR_CANCELLED,
            ConvertError::Task(_) => ERR_TASK,
            ConvertError::InPackage { source, .. } | ConvertError::Dependency { source, .. } => {
                source.code()
            }
        }
    }

    /// Innermost error of an annotation chain.
    pub fn root_cause(&self) -> &ConvertError {
        match self {
            ConvertError::InPackage { source, .. } | ConvertError::Dependency { source, .. } => {
                source.root_cause()
            }
            other => other,
        }
    }

    /// Whether the failure only means "this package does not exist", which
    /// weak edges treat as absence.
    pub fn is_not_found(&self) -> bool {
        matches!(self.root_cause(), ConvertError::PackageNotFound { .. })
    }

    /// Full chain, outermost first, one cause per line.
    pub fn chain_report(&self) -> String {
        let mut lines = Vec::new();
        let mut current: Option<&(dyn std::error::Error + 'static)> = Some(self);
        while let Some(err) = current {
            let text = match err.downcast_ref::<ConvertError>() {
                Some(ConvertError::InPackage { package, .. }) => {
                    format!("while converting '{}'", package)
                }
                Some(ConvertError::Dependency {
                    package,
                    dependency,
                    ..
                }) => format!("'{}' requires '{}'", package, dependency),
                _ => err.to_string(),
            };
            lines.push(text);
            current = err.source();
        }
        lines.join("\n  caused by: ")
    }
}

/// Line and 1-based column of a byte offset.
pub fn line_column(source: &str, offset: usize) -> (u32, u32) {
    let offset = offset.min(source.len());
    let before = &source[..offset];
    let line = before.matches('\n').count() as u32 + 1;
    let column = match before.rfind('\n') {
        Some(idx) => before[idx + 1..].chars().count() as u32 + 1,
        None => before.chars().count() as u32 + 1,
    };
    (line, column)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_passes_through_wrappers() {
        let err = ConvertError::PackageNotFound {
            name: "missing".to_string(),
        }
        .for_dependency("beta", "missing")
        .in_package("app");
        assert_eq!(err.code(), ERR_NOT_FOUND);
        assert!(err.is_not_found());
    }

    #[test]
    fn test_in_package_does_not_stutter() {
        let err = ConvertError::Task("boom".to_string())
            .in_package("alpha")
            .in_package("alpha");
        match err {
            ConvertError::InPackage { source, .. } => {
                assert!(matches!(*source, ConvertError::Task(_)))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_chain_report_names_every_package() {
        let err = ConvertError::declaration("gamma/package.js", "bad call")
            .in_package("gamma")
            .for_dependency("beta", "gamma")
            .in_package("beta");
        let report = err.chain_report();
        assert!(report.starts_with("while converting 'beta'"));
        assert!(report.contains("'beta' requires 'gamma'"));
        assert!(report.contains("while converting 'gamma'"));
        assert!(report.contains("bad call"));
    }

    #[test]
    fn test_conflicts_list_every_name() {
        let err = ConvertError::VersionConflicts(vec![
            VersionConflict {
                name: "delta".to_string(),
                requested: vec!["1.0.0".to_string(), "2.0.0".to_string()],
            },
            VersionConflict {
                name: "omega".to_string(),
                requested: vec!["3.0.0".to_string(), "4.1.0".to_string()],
            },
        ]);
        let text = err.to_string();
        assert!(text.contains("delta (1.0.0, 2.0.0)"));
        assert!(text.contains("omega (3.0.0, 4.1.0)"));
    }

    #[test]
    fn test_line_column() {
        let src = "let a;\nlet b = ;";
        assert_eq!(line_column(src, 0), (1, 1));
        assert_eq!(line_column(src, 15), (2, 9));
    }
}
