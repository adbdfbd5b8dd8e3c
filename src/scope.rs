//! Identifier/scope analysis for legacy package sources.
//!
//! Finds the identifiers a file references without declaring them anywhere in
//! an enclosing scope. In a legacy package those are either host globals or
//! package globals shared implicitly between files; the host ones are filtered
//! here, everything left is a candidate for rewriting.

use crate::error::{line_column, ConvertError, ParseMode, Result};
use oxc_allocator::Allocator;
use oxc_ast::ast::{IdentifierReference, Program};
use oxc_ast_visit::Visit;
use oxc_parser::{ParseOptions, Parser, ParserReturn};
use oxc_semantic::{Scoping, SemanticBuilder};
use oxc_span::SourceType;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

lazy_static::lazy_static! {
    /// Browser and host-provided names that are never package globals.
    pub static ref HOST_GLOBALS: HashSet<&'static str> = {
        let mut s = HashSet::new();
        for name in [
            "window", "document", "navigator", "location", "history", "screen",
            "localStorage", "sessionStorage", "indexedDB", "alert", "confirm", "prompt",
            "fetch", "XMLHttpRequest", "WebSocket", "Worker", "Blob", "File", "FileReader",
            "FormData", "URL", "URLSearchParams", "Headers", "Request", "Response",
            "Event", "CustomEvent", "EventTarget", "HTMLElement", "Element", "Node",
            "MutationObserver", "IntersectionObserver", "ResizeObserver",
            "requestAnimationFrame", "cancelAnimationFrame", "getComputedStyle",
            "atob", "btoa", "crypto", "performance", "self", "frames", "parent", "top",
            "opener", "Image", "Audio", "Option", "DOMParser", "XMLSerializer",
            "TextEncoder", "TextDecoder", "AbortController", "AbortSignal",
            "structuredClone", "queueMicrotask", "postMessage", "cordova", "device",
        ] {
            s.insert(name);
        }
        s
    };

    /// The engine's own ambient globals (ECMAScript built-ins plus the Node
    /// process surface).
    pub static ref ENGINE_GLOBALS: HashSet<&'static str> = {
        let mut s = HashSet::new();
        for name in [
            "globalThis", "undefined", "NaN", "Infinity", "eval", "isFinite", "isNaN",
            "parseInt", "parseFloat", "decodeURI", "decodeURIComponent", "encodeURI",
            "encodeURIComponent", "escape", "unescape", "Object", "Function", "Array",
            "Number", "Boolean", "String", "Symbol", "BigInt", "Math", "JSON", "Date",
            "RegExp", "Error", "EvalError", "RangeError", "ReferenceError", "SyntaxError",
            "TypeError", "URIError", "AggregateError", "Promise", "Proxy", "Reflect",
            "Map", "Set", "WeakMap", "WeakSet", "WeakRef", "FinalizationRegistry",
            "ArrayBuffer", "SharedArrayBuffer", "DataView", "Atomics", "Int8Array",
            "Uint8Array", "Uint8ClampedArray", "Int16Array", "Uint16Array", "Int32Array",
            "Uint32Array", "Float32Array", "Float64Array", "BigInt64Array",
            "BigUint64Array", "Intl", "console", "setTimeout", "clearTimeout",
            "setInterval", "clearInterval", "setImmediate", "clearImmediate", "process",
            "Buffer", "global", "__dirname", "__filename", "arguments",
        ] {
            s.insert(name);
        }
        s
    };
}

/// The implicit parameters of the legacy two-argument module wrapper.
pub const MODULE_WRAPPER_NAMES: [&str; 3] = ["require", "exports", "module"];

/// How one free identifier is used in a file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifierUse {
    pub read: bool,
    pub written: bool,
}

/// Free identifiers of one file, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FreeIdentifiers {
    pub names: BTreeMap<String, IdentifierUse>,
}

impl FreeIdentifiers {
    pub fn contains(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Names that are the target of an assignment somewhere in the file.
    pub fn assigned(&self) -> impl Iterator<Item = &str> {
        self.names
            .iter()
            .filter(|(_, u)| u.written)
            .map(|(n, _)| n.as_str())
    }

    /// Names only ever read.
    pub fn consumed(&self) -> impl Iterator<Item = &str> {
        self.names
            .iter()
            .filter(|(_, u)| !u.written)
            .map(|(n, _)| n.as_str())
    }

    fn record(&mut self, name: &str, read: bool, written: bool) {
        let entry = self.names.entry(name.to_string()).or_default();
        entry.read |= read;
        entry.written |= written;
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AnalyzeOptions {
    /// The file runs inside the legacy module wrapper, so `require`,
    /// `exports` and `module` are parameters rather than globals.
    pub legacy_module: bool,
}

/// Result of analyzing one file.
#[derive(Debug, Clone)]
pub struct ModuleAnalysis {
    pub free: FreeIdentifiers,
    pub mode: ParseMode,
}

// ═══════════════════════════════════════════════════════════════════════════════
// PARSING
// ═══════════════════════════════════════════════════════════════════════════════

/// Parse with the module goal first and fall back to the lenient script goal.
pub(crate) fn parse_program<'a>(
    allocator: &'a Allocator,
    source: &'a str,
    file_path: &str,
) -> Result<(Program<'a>, ParseMode)> {
    let strict = Parser::new(
        allocator,
        source,
        SourceType::default().with_module(true),
    )
    .parse();
    if !strict.panicked && strict.errors.is_empty() {
        return Ok((strict.program, ParseMode::Strict));
    }
    let strict_error = first_error(&strict, source, file_path, ParseMode::Strict);
    tracing::debug!(file = file_path, error = %strict_error, "strict parse failed, retrying loose");

    let loose = Parser::new(
        allocator,
        source,
        SourceType::default().with_module(false),
    )
    .with_options(ParseOptions {
        allow_return_outside_function: true,
        ..ParseOptions::default()
    })
    .parse();
    if loose.panicked {
        return Err(first_error(&loose, source, file_path, ParseMode::Loose));
    }
    if !loose.errors.is_empty() {
        tracing::warn!(
            file = file_path,
            errors = loose.errors.len(),
            "accepted file with recoverable syntax errors"
        );
    }
    Ok((loose.program, ParseMode::Loose))
}

fn first_error(ret: &ParserReturn, source: &str, file_path: &str, mode: ParseMode) -> ConvertError {
    let (message, offset) = match ret.errors.first() {
        Some(error) => {
            let offset = error
                .labels
                .as_ref()
                .and_then(|labels| labels.first())
                .map(|label| label.offset())
                .unwrap_or(0);
            (error.to_string(), offset)
        }
        None => ("parser aborted".to_string(), 0),
    };
    let (line, column) = line_column(source, offset);
    ConvertError::Syntax {
        file: file_path.to_string(),
        mode,
        line,
        column,
        message,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ANALYSIS
// ═══════════════════════════════════════════════════════════════════════════════

/// Whether `name` is provided by the host or engine and never rewritten.
pub fn is_ambient(name: &str, options: AnalyzeOptions) -> bool {
    HOST_GLOBALS.contains(name)
        || ENGINE_GLOBALS.contains(name)
        || (options.legacy_module && MODULE_WRAPPER_NAMES.contains(&name))
}

/// Analyze one file's source text.
pub fn analyze_source(source: &str, file_path: &str, options: AnalyzeOptions) -> Result<ModuleAnalysis> {
    let allocator = Allocator::default();
    let (program, mode) = parse_program(&allocator, source, file_path)?;
    let semantic = SemanticBuilder::new().build(&program).semantic;
    let free = collect_free_identifiers(&program, semantic.scoping(), options);
    Ok(ModuleAnalysis { free, mode })
}

/// Collect the unresolved references of an already-analyzed program.
pub(crate) fn collect_free_identifiers(
    program: &Program<'_>,
    scoping: &Scoping,
    options: AnalyzeOptions,
) -> FreeIdentifiers {
    let mut collector = FreeReferenceCollector {
        scoping,
        options,
        free: FreeIdentifiers::default(),
    };
    collector.visit_program(program);
    collector.free
}

struct FreeReferenceCollector<'s> {
    scoping: &'s Scoping,
    options: AnalyzeOptions,
    free: FreeIdentifiers,
}

impl<'a, 's> Visit<'a> for FreeReferenceCollector<'s> {
    fn visit_identifier_reference(&mut self, ident: &IdentifierReference<'a>) {
        let Some(reference_id) = ident.reference_id.get() else {
            return;
        };
        let reference = self.scoping.get_reference(reference_id);
        if reference.symbol_id().is_some() {
            return;
        }
        let name = ident.name.to_string();
        if is_ambient(&name, self.options) {
            return;
        }
        self.free
            .record(&name, reference.is_read(), reference.is_write());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free(src: &str) -> FreeIdentifiers {
        analyze_source(src, "test.js", AnalyzeOptions::default())
            .unwrap()
            .free
    }

    #[test]
    fn test_reports_unbound_reads_and_writes() {
        let f = free("Foo = 42;\nconsole.log(Bar);");
        assert_eq!(
            f.names.get("Foo"),
            Some(&IdentifierUse {
                read: false,
                written: true
            })
        );
        assert_eq!(
            f.names.get("Bar"),
            Some(&IdentifierUse {
                read: true,
                written: false
            })
        );
        assert!(!f.contains("console"));
    }

    #[test]
    fn test_shadowed_bindings_are_not_free() {
        let src = r#"
            function outer(Foo) { return Foo + 1; }
            class Bar {}
            try { risky(); } catch (Baz) { Baz.message; }
            const { Qux, nested: [Quux] } = source;
            let fn = (Zap) => Zap;
            new Bar();
        "#;
        let f = free(src);
        for name in ["Foo", "Bar", "Baz", "Qux", "Quux", "Zap"] {
            assert!(!f.contains(name), "{} should be bound", name);
        }
        assert!(f.contains("risky"));
        assert!(f.contains("source"));
    }

    #[test]
    fn test_shadowing_is_per_scope() {
        let src = r#"
            function a() { var Shared = 1; return Shared; }
            function b() { return Shared; }
        "#;
        let f = free(src);
        assert!(f.contains("Shared"));
    }

    #[test]
    fn test_host_globals_are_excluded() {
        let f = free("window.x = document.title + navigator.userAgent; Math.max(1, 2);");
        assert!(f.is_empty());
    }

    #[test]
    fn test_legacy_module_parameters() {
        let src = "var dep = require('x'); module.exports = dep; exports.y = 1;";
        let plain = analyze_source(src, "a.js", AnalyzeOptions::default()).unwrap();
        assert!(plain.free.contains("require"));
        let wrapped = analyze_source(
            src,
            "a.js",
            AnalyzeOptions {
                legacy_module: true,
            },
        )
        .unwrap();
        assert!(!wrapped.free.contains("require"));
        assert!(!wrapped.free.contains("module"));
        assert!(!wrapped.free.contains("exports"));
    }

    #[test]
    fn test_update_expressions_are_read_and_write() {
        let f = free("Counter += 1;");
        let u = f.names.get("Counter").unwrap();
        assert!(u.read && u.written);
        assert_eq!(f.assigned().collect::<Vec<_>>(), vec!["Counter"]);
        assert_eq!(f.consumed().count(), 0);
    }

    #[test]
    fn test_top_level_return_falls_back_to_loose() {
        let a = analyze_source("if (!Enabled) return;\nRan = true;", "a.js", AnalyzeOptions::default())
            .unwrap();
        assert_eq!(a.mode, ParseMode::Loose);
        assert!(a.free.contains("Enabled"));
        assert!(a.free.contains("Ran"));
    }

    #[test]
    fn test_unrecoverable_syntax_reports_position() {
        let err = analyze_source("let = = = ;\n}}}", "broken.js", AnalyzeOptions::default())
            .unwrap_err();
        match err {
            ConvertError::Syntax { file, mode, .. } => {
                assert_eq!(file, "broken.js");
                assert_eq!(mode, ParseMode::Loose);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
