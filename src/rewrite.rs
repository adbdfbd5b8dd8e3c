//! Global rewriting.
//!
//! Package globals become member accesses on the package's injected globals
//! object; globals supplied by dependencies become explicit imports. Edits are
//! collected as span replacements during a read-only walk and applied to the
//! original text afterwards, so nothing outside the rewritten identifiers is
//! reformatted.

use crate::error::{ConvertError, ParseMode, Result};
use crate::scope::{collect_free_identifiers, parse_program, AnalyzeOptions, FreeIdentifiers};
use oxc_allocator::Allocator;
use oxc_ast::ast::{
    AssignmentTargetPropertyIdentifier, CallExpression, Expression, ExportSpecifier,
    IdentifierReference, ObjectProperty,
};
use oxc_ast_visit::{walk, Visit};
use oxc_semantic::{Scoping, SemanticBuilder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Local name of the injected per-package globals object.
pub const GLOBALS_NAMESPACE: &str = "__globals__";

/// File name of the per-package globals module.
pub const GLOBALS_MODULE: &str = "__globals.js";

/// Globals module of the package's test variant.
pub const TEST_GLOBALS_MODULE: &str = "__globals.test.js";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleFormat {
    #[default]
    Esm,
    CommonJs,
}

/// Where a free identifier's value comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "from")]
pub enum GlobalSource {
    /// Exported by another package: `import { Name } from "<specifier>"`.
    Import(String),
    /// Produced by this package: read and written through the globals object.
    Package,
}

/// Resolution of free identifiers for one file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionTable {
    pub entries: BTreeMap<String, GlobalSource>,
}

impl ResolutionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, source: GlobalSource) {
        self.entries.insert(name.into(), source);
    }

    pub fn get(&self, name: &str) -> Option<&GlobalSource> {
        self.entries.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct RewriteOptions {
    pub format: ModuleFormat,
    /// Specifier of the globals module relative to the file being rewritten.
    pub globals_specifier: String,
    pub legacy_module: bool,
}

impl Default for RewriteOptions {
    fn default() -> Self {
        RewriteOptions {
            format: ModuleFormat::Esm,
            globals_specifier: format!("./{}", GLOBALS_MODULE),
            legacy_module: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RewriteOutput {
    pub code: String,
    /// Specifiers imported by the generated preamble, in emission order.
    pub imports: Vec<String>,
    pub replacements: usize,
    pub mode: ParseMode,
}

// ═══════════════════════════════════════════════════════════════════════════════
// REWRITE
// ═══════════════════════════════════════════════════════════════════════════════

/// Rewrite one file. Only identifiers that are free in this file, present in
/// `free` and resolved by `table` are touched.
pub fn rewrite_source(
    source: &str,
    file_path: &str,
    free: &FreeIdentifiers,
    table: &ResolutionTable,
    options: &RewriteOptions,
) -> Result<RewriteOutput> {
    let allocator = Allocator::default();
    let (program, mode) = parse_program(&allocator, source, file_path)?;
    let semantic = SemanticBuilder::new().build(&program).semantic;
    let scoping = semantic.scoping();

    let analyze = AnalyzeOptions {
        legacy_module: options.legacy_module,
    };
    let local_free = collect_free_identifiers(&program, scoping, analyze);

    let mut package_names = BTreeSet::new();
    let mut imported: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (name, usage) in &local_free.names {
        if !free.contains(name) {
            continue;
        }
        match table.get(name) {
            Some(GlobalSource::Package) => {
                package_names.insert(name.clone());
            }
            Some(GlobalSource::Import(specifier)) if usage.written => {
                return Err(ConvertError::ImportedGlobalAssigned {
                    file: file_path.to_string(),
                    name: name.clone(),
                    specifier: specifier.clone(),
                });
            }
            Some(GlobalSource::Import(specifier)) => {
                imported
                    .entry(specifier.clone())
                    .or_default()
                    .insert(name.clone());
            }
            None => {}
        }
    }

    let mut visitor = GlobalRewriteVisitor {
        scoping,
        package_names: &package_names,
        replacements: Vec::new(),
    };
    visitor.visit_program(&program);
    let replacements = visitor.replacements;

    if !package_names.is_empty() {
        imported
            .entry(options.globals_specifier.clone())
            .or_default();
    }
    if replacements.is_empty() && imported.is_empty() {
        return Ok(RewriteOutput {
            code: source.to_string(),
            imports: Vec::new(),
            replacements: 0,
            mode,
        });
    }

    let (preamble, specifiers) = emit_preamble(&imported, options);
    let count = replacements.len();
    let mut body = apply_replacements(source, replacements);
    if mode == ParseMode::Loose && options.format == ModuleFormat::Esm {
        body = wrap_script_body(&body);
    }
    Ok(RewriteOutput {
        code: splice_preamble(&body, &preamble),
        imports: specifiers,
        replacements: count,
        mode,
    })
}

struct GlobalRewriteVisitor<'s> {
    scoping: &'s Scoping,
    package_names: &'s BTreeSet<String>,
    replacements: Vec<(u32, u32, String)>,
}

impl<'s> GlobalRewriteVisitor<'s> {
    /// The package global this reference points at, if any.
    fn package_global(&self, ident: &IdentifierReference<'_>) -> Option<String> {
        let reference_id = ident.reference_id.get()?;
        if self.scoping.get_reference(reference_id).symbol_id().is_some() {
            return None;
        }
        let name = ident.name.to_string();
        self.package_names.contains(&name).then_some(name)
    }

    fn member(name: &str) -> String {
        format!("{}.{}", GLOBALS_NAMESPACE, name)
    }
}

impl<'a, 's> Visit<'a> for GlobalRewriteVisitor<'s> {
    fn visit_identifier_reference(&mut self, ident: &IdentifierReference<'a>) {
        if let Some(name) = self.package_global(ident) {
            self.replacements
                .push((ident.span.start, ident.span.end, Self::member(&name)));
        }
    }

    fn visit_object_property(&mut self, prop: &ObjectProperty<'a>) {
        if prop.shorthand {
            if let Expression::Identifier(ident) = &prop.value {
                if let Some(name) = self.package_global(ident) {
                    // `{ x }` -> `{ x: __globals__.x }`
                    self.replacements.push((
                        prop.span.start,
                        prop.span.end,
                        format!("{}: {}", name, Self::member(&name)),
                    ));
                    return;
                }
            }
        }
        walk::walk_object_property(self, prop);
    }

    fn visit_assignment_target_property_identifier(
        &mut self,
        prop: &AssignmentTargetPropertyIdentifier<'a>,
    ) {
        if let Some(name) = self.package_global(&prop.binding) {
            // `({ x } = o)` -> `({ x: __globals__.x } = o)`; a default stays attached.
            self.replacements.push((
                prop.binding.span.start,
                prop.binding.span.end,
                format!("{}: {}", name, Self::member(&name)),
            ));
            if let Some(init) = &prop.init {
                self.visit_expression(init);
            }
            return;
        }
        walk::walk_assignment_target_property_identifier(self, prop);
    }

    fn visit_call_expression(&mut self, call: &CallExpression<'a>) {
        if let Expression::Identifier(ident) = &call.callee {
            if let Some(name) = self.package_global(ident) {
                // Keep `this` undefined for plain calls.
                self.replacements.push((
                    ident.span.start,
                    ident.span.end,
                    format!("(0, {})", Self::member(&name)),
                ));
                for argument in &call.arguments {
                    self.visit_argument(argument);
                }
                return;
            }
        }
        walk::walk_call_expression(self, call);
    }

    fn visit_export_specifier(&mut self, _specifier: &ExportSpecifier<'a>) {
        // A member expression cannot be exported by name; leave specifiers alone.
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// EMISSION
// ═══════════════════════════════════════════════════════════════════════════════

fn is_relative(specifier: &str) -> bool {
    specifier.starts_with('.') || specifier.starts_with('/')
}

/// Package specifiers first, relative paths last, each group by specifier.
pub fn import_order(a: &str, b: &str) -> std::cmp::Ordering {
    (is_relative(a), a).cmp(&(is_relative(b), b))
}

fn emit_preamble(
    imported: &BTreeMap<String, BTreeSet<String>>,
    options: &RewriteOptions,
) -> (String, Vec<String>) {
    let mut specifiers: Vec<&String> = imported.keys().collect();
    specifiers.sort_by(|a, b| import_order(a, b));

    let mut lines = Vec::new();
    for specifier in &specifiers {
        let names = &imported[*specifier];
        let is_globals = **specifier == options.globals_specifier;
        let line = match (options.format, is_globals) {
            (ModuleFormat::Esm, true) => {
                format!("import {} from \"{}\";", GLOBALS_NAMESPACE, specifier)
            }
            (ModuleFormat::CommonJs, true) => {
                format!("const {} = require(\"{}\");", GLOBALS_NAMESPACE, specifier)
            }
            (ModuleFormat::Esm, false) => format!(
                "import {{ {} }} from \"{}\";",
                names.iter().cloned().collect::<Vec<_>>().join(", "),
                specifier
            ),
            (ModuleFormat::CommonJs, false) => format!(
                "const {{ {} }} = require(\"{}\");",
                names.iter().cloned().collect::<Vec<_>>().join(", "),
                specifier
            ),
        };
        lines.push(line);
    }
    (
        lines.join("\n"),
        specifiers.into_iter().cloned().collect(),
    )
}

fn apply_replacements(source: &str, mut replacements: Vec<(u32, u32, String)>) -> String {
    replacements.sort_by(|a, b| b.0.cmp(&a.0));
    let mut out = source.to_string();
    for (start, end, text) in replacements {
        out.replace_range(start as usize..end as usize, &text);
    }
    out
}

/// Run a script-goal body inside a function so top-level `return` stays
/// legal once the file becomes a module. A hashbang line stays outside.
fn wrap_script_body(body: &str) -> String {
    let (hashbang, rest) = if body.starts_with("#!") {
        body.split_at(body.find('\n').map(|i| i + 1).unwrap_or(body.len()))
    } else {
        ("", body)
    };
    let mut out = hashbang.to_string();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str("(function () {\n");
    out.push_str(rest);
    if !rest.is_empty() && !rest.ends_with('\n') {
        out.push('\n');
    }
    out.push_str("})();\n");
    out
}

/// Insert the preamble at the top, after a hashbang line if there is one.
fn splice_preamble(body: &str, preamble: &str) -> String {
    if preamble.is_empty() {
        return body.to_string();
    }
    if body.starts_with("#!") {
        let split = body.find('\n').map(|i| i + 1).unwrap_or(body.len());
        let (hashbang, rest) = body.split_at(split);
        let mut out = hashbang.to_string();
        if !hashbang.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(preamble);
        out.push('\n');
        out.push_str(rest);
        return out;
    }
    format!("{}\n{}", preamble, body)
}

/// Relative specifier of a package-root file `module_file` as seen from the
/// file at `relative_path` (package-root relative, `/`-separated).
pub fn globals_specifier_for(relative_path: &str, module_file: &str) -> String {
    let depth = relative_path
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .count()
        .saturating_sub(1);
    if depth == 0 {
        format!("./{}", module_file)
    } else {
        format!("{}{}", "../".repeat(depth), module_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::analyze_source;

    fn run(src: &str, table: &ResolutionTable, options: &RewriteOptions) -> String {
        let free = analyze_source(
            src,
            "file.js",
            AnalyzeOptions {
                legacy_module: options.legacy_module,
            },
        )
        .unwrap()
        .free;
        rewrite_source(src, "file.js", &free, table, options)
            .unwrap()
            .code
    }

    fn table(entries: &[(&str, GlobalSource)]) -> ResolutionTable {
        let mut t = ResolutionTable::new();
        for (name, source) in entries {
            t.insert(*name, source.clone());
        }
        t
    }

    #[test]
    fn test_package_global_becomes_member_access() {
        let t = table(&[("Foo", GlobalSource::Package)]);
        let out = run("Foo = 42;\nconsole.log(Foo);\n", &t, &RewriteOptions::default());
        assert_eq!(
            out,
            "import __globals__ from \"./__globals.js\";\n__globals__.Foo = 42;\nconsole.log(__globals__.Foo);\n"
        );
    }

    #[test]
    fn test_declarations_keys_and_params_are_untouched() {
        let t = table(&[("Foo", GlobalSource::Package)]);
        let src = "function f(Foo) { return Foo; }\nvar o = { Foo: 1 };\no.Foo;\ntry {} catch (Foo) {}\nFoo;\n";
        let out = run(src, &t, &RewriteOptions::default());
        assert!(out.contains("function f(Foo) { return Foo; }"));
        assert!(out.contains("{ Foo: 1 }"));
        assert!(out.contains("o.Foo;"));
        assert!(out.contains("catch (Foo)"));
        assert!(out.ends_with("\n__globals__.Foo;\n"));
    }

    #[test]
    fn test_shorthand_property_is_expanded() {
        let t = table(&[("x", GlobalSource::Package)]);
        let out = run("var o = { x };\n", &t, &RewriteOptions::default());
        assert!(out.contains("var o = { x: __globals__.x };"));
    }

    #[test]
    fn test_destructuring_assignment_shorthand() {
        let t = table(&[("x", GlobalSource::Package)]);
        let out = run("({ x = 1 } = other);\n", &t, &RewriteOptions::default());
        assert!(out.contains("({ x: __globals__.x = 1 } = other);"));
    }

    #[test]
    fn test_plain_call_keeps_this_unbound() {
        let t = table(&[("helper", GlobalSource::Package)]);
        let out = run("helper(1, helper);\n", &t, &RewriteOptions::default());
        assert!(out.contains("(0, __globals__.helper)(1, __globals__.helper);"));
    }

    #[test]
    fn test_imports_sorted_packages_before_relative() {
        let t = table(&[
            ("Tracker", GlobalSource::Import("@legacy/tracker".to_string())),
            ("Blaze", GlobalSource::Import("@legacy/blaze".to_string())),
            ("Local", GlobalSource::Import("./local.js".to_string())),
            ("Other", GlobalSource::Import("@legacy/blaze".to_string())),
            ("Mine", GlobalSource::Package),
        ]);
        let out = run(
            "Tracker.autorun(); Blaze.render(Other); Local(); Mine = 1;\n",
            &t,
            &RewriteOptions::default(),
        );
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "import { Blaze, Other } from \"@legacy/blaze\";");
        assert_eq!(lines[1], "import { Tracker } from \"@legacy/tracker\";");
        assert_eq!(lines[2], "import __globals__ from \"./__globals.js\";");
        assert_eq!(lines[3], "import { Local } from \"./local.js\";");
    }

    #[test]
    fn test_rewrite_is_idempotent() {
        let t = table(&[
            ("Foo", GlobalSource::Package),
            ("Dep", GlobalSource::Import("@legacy/dep".to_string())),
        ]);
        let options = RewriteOptions::default();
        let once = run("Foo = Dep.make({ Foo });\n", &t, &options);
        let twice = run(&once, &t, &options);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_commonjs_preamble() {
        let t = table(&[
            ("Foo", GlobalSource::Package),
            ("Dep", GlobalSource::Import("@legacy/dep".to_string())),
        ]);
        let options = RewriteOptions {
            format: ModuleFormat::CommonJs,
            globals_specifier: "../__globals.js".to_string(),
            legacy_module: true,
        };
        let out = run("Foo = Dep;\n", &t, &options);
        assert!(out.starts_with(
            "const { Dep } = require(\"@legacy/dep\");\nconst __globals__ = require(\"../__globals.js\");\n"
        ));
    }

    #[test]
    fn test_unresolved_names_are_left_alone() {
        let t = table(&[("Foo", GlobalSource::Package)]);
        let src = "Unknown.call();\n";
        assert_eq!(run(src, &t, &RewriteOptions::default()), src);
    }

    #[test]
    fn test_hashbang_stays_first() {
        let t = table(&[("Foo", GlobalSource::Package)]);
        let out = run("#!/usr/bin/env node\nFoo = 1;\n", &t, &RewriteOptions::default());
        assert!(out.starts_with("#!/usr/bin/env node\nimport __globals__"));
    }

    #[test]
    fn test_top_level_return_is_wrapped_for_modules() {
        let t = table(&[("X", GlobalSource::Package), ("Y", GlobalSource::Package)]);
        let src = "if (!X) return;\nY = 1;\n";
        let out = run(src, &t, &RewriteOptions::default());
        assert_eq!(
            out,
            "import __globals__ from \"./__globals.js\";\n\
             (function () {\n\
             if (!__globals__.X) return;\n\
             __globals__.Y = 1;\n\
             })();\n"
        );
        assert_eq!(run(&out, &t, &RewriteOptions::default()), out);

        let cjs = RewriteOptions {
            format: ModuleFormat::CommonJs,
            ..RewriteOptions::default()
        };
        assert_eq!(
            run(src, &t, &cjs),
            "const __globals__ = require(\"./__globals.js\");\nif (!__globals__.X) return;\n__globals__.Y = 1;\n"
        );
    }

    #[test]
    fn test_assigning_an_imported_global_fails() {
        let t = table(&[("Alpha", GlobalSource::Import("@legacy/alpha".to_string()))]);
        let free = analyze_source("Alpha = Alpha || {};\n", "file.js", AnalyzeOptions::default())
            .unwrap()
            .free;
        let err = rewrite_source("Alpha = Alpha || {};\n", "file.js", &free, &t, &RewriteOptions::default())
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ERR_REWRITE);
        assert!(err.to_string().contains("Alpha"), "{}", err);
    }

    #[test]
    fn test_globals_specifier_depth() {
        assert_eq!(globals_specifier_for("a.js", GLOBALS_MODULE), "./__globals.js");
        assert_eq!(globals_specifier_for("lib/a.js", GLOBALS_MODULE), "../__globals.js");
        assert_eq!(
            globals_specifier_for("./lib/deep/a.js", TEST_GLOBALS_MODULE),
            "../../__globals.test.js"
        );
    }
}
