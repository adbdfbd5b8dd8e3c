//! # Legacy Package Converter
//!
//! Converts packages described by a legacy `package.js` declaration into
//! ES-module packages that a standard bundler can consume.
//!
//! ## Pipeline
//!
//! 1. **Declaration**: `package.js` is interpreted statically against the
//!    [`declaration::PackageApi`] trait; nothing in it is executed.
//! 2. **Descriptor**: the calls build a [`Package`] with one architecture
//!    node per target (`common`, `client`, `server`, `web.browser`, ...).
//! 3. **Job**: [`ConversionJob`] loads the dependency closure of the requested
//!    packages, each package once, tolerating cycles.
//! 4. **Rewrite**: every source file is scanned for free identifiers. Names a
//!    dependency exports become imports; names the package itself assigns are
//!    moved onto the shared `__globals__` object.
//! 5. **Write**: rewritten sources, one entry point per active architecture,
//!    `__globals.js` and a `package.json` with conditional exports.
//!
//! ## Invariants
//!
//! - A package is written at most once per descriptor.
//! - Strong dependencies load before their dependents; unordered and implied
//!   ones load after.
//! - Rewriting a file with no free globals returns it unchanged.
//! - Version resolution does not depend on request order.

pub mod arch;
pub mod cache;
pub mod catalog;
pub mod codegen;
pub mod config;
pub mod declaration;
pub mod discovery;
pub mod error;
pub mod job;
pub mod load_order;
pub mod manifest;
pub mod package;
pub mod rewrite;
pub mod scope;
pub mod versions;
pub mod writer;

#[cfg(feature = "napi")]
mod bridge;


#[cfg(feature = "napi")]
pub use bridge::{analyze_globals_native, convert_packages_native, load_order_native};

pub use config::{ConvertConfig, ForceRefresh};
pub use error::{ConvertError, Result};
pub use job::{ConversionJob, ConversionSummary, Warm};
pub use load_order::{build_load_order, DependencyRecord, LoadOrderEntry};
pub use package::Package;
pub use rewrite::{rewrite_source, ModuleFormat, RewriteOptions};
pub use scope::{analyze_source, FreeIdentifiers};
pub use versions::{resolve_versions, ResolvedVersion, VersionRequest};
