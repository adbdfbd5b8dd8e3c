//! Codegen module for converted packages
//!
//! Renders the generated modules of a package: one entry point per active
//! architecture, the injected globals module and the lazy define stub.

use crate::rewrite::{import_order, ModuleFormat, GLOBALS_NAMESPACE};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// ═══════════════════════════════════════════════════════════════════════════════
// INPUT TYPES
// ═══════════════════════════════════════════════════════════════════════════════

/// Gate on an exported binding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExportCondition {
    #[default]
    Always,
    DebugOnly,
    ProdOnly,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "from")]
pub enum ExportSource {
    /// Read from a globals module, given as a relative specifier.
    Globals(String),
    /// Re-exported from a dependency.
    Dependency(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportBinding {
    pub name: String,
    pub source: ExportSource,
    pub condition: ExportCondition,
}

/// Everything an entry point imports and exports, in emission order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryPlan {
    pub format: ModuleFormat,
    /// Side-effect imports of dependencies.
    pub dependencies: Vec<String>,
    /// Relative specifiers of the architecture's source files.
    pub files: Vec<String>,
    /// Specifiers of implied packages, re-exported wholesale.
    pub implies: Vec<String>,
    pub main_module: Option<String>,
    pub exports: Vec<ExportBinding>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// ENTRY POINTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Local names for each distinct globals module an entry reads from.
fn globals_namespaces(exports: &[ExportBinding]) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = Vec::new();
    for binding in exports {
        if let ExportSource::Globals(module) = &binding.source {
            if out.iter().any(|(m, _)| m == module) {
                continue;
            }
            let local = if out.is_empty() {
                GLOBALS_NAMESPACE.to_string()
            } else {
                format!("__globals_{}__", out.len())
            };
            out.push((module.clone(), local));
        }
    }
    out
}

fn gated(value: String, condition: ExportCondition) -> String {
    match condition {
        ExportCondition::Always => value,
        ExportCondition::DebugOnly => format!(
            "process.env.NODE_ENV !== \"production\" ? {} : undefined",
            value
        ),
        ExportCondition::ProdOnly => format!(
            "process.env.NODE_ENV === \"production\" ? {} : undefined",
            value
        ),
    }
}

pub fn render_entry(plan: &EntryPlan) -> String {
    match plan.format {
        ModuleFormat::Esm => render_esm_entry(plan),
        ModuleFormat::CommonJs => render_cjs_entry(plan),
    }
}

fn render_esm_entry(plan: &EntryPlan) -> String {
    let namespaces = globals_namespaces(&plan.exports);
    let mut lines = Vec::new();

    for dep in &plan.dependencies {
        lines.push(format!("import \"{}\";", dep));
    }
    for file in &plan.files {
        lines.push(format!("import \"{}\";", file));
    }
    for (module, local) in &namespaces {
        lines.push(format!("import {} from \"{}\";", local, module));
    }
    for implied in &plan.implies {
        lines.push(format!("export * from \"{}\";", implied));
    }
    if let Some(main) = &plan.main_module {
        lines.push(format!("export * from \"{}\";", main));
    }
    for binding in &plan.exports {
        match &binding.source {
            ExportSource::Dependency(specifier) if binding.condition == ExportCondition::Always => {
                lines.push(format!("export {{ {} }} from \"{}\";", binding.name, specifier));
            }
            ExportSource::Dependency(specifier) => {
                let local = format!("__dep_{}", binding.name);
                lines.push(format!(
                    "import {{ {} as {} }} from \"{}\";",
                    binding.name, local, specifier
                ));
                lines.push(format!(
                    "export const {} = {};",
                    binding.name,
                    gated(local, binding.condition)
                ));
            }
            ExportSource::Globals(module) => {
                let local = namespace_for(&namespaces, module);
                lines.push(format!(
                    "export const {} = {};",
                    binding.name,
                    gated(format!("{}.{}", local, binding.name), binding.condition)
                ));
            }
        }
    }
    finish(lines)
}

fn render_cjs_entry(plan: &EntryPlan) -> String {
    let namespaces = globals_namespaces(&plan.exports);
    let mut lines = Vec::new();

    for dep in &plan.dependencies {
        lines.push(format!("require(\"{}\");", dep));
    }
    for file in &plan.files {
        lines.push(format!("require(\"{}\");", file));
    }
    for (module, local) in &namespaces {
        lines.push(format!("const {} = require(\"{}\");", local, module));
    }

    let mut parts: Vec<String> = vec!["{}".to_string()];
    for implied in &plan.implies {
        parts.push(format!("require(\"{}\")", implied));
    }
    if let Some(main) = &plan.main_module {
        parts.push(format!("require(\"{}\")", main));
    }
    let mut fields = Vec::new();
    for binding in &plan.exports {
        let value = match &binding.source {
            ExportSource::Dependency(specifier) => {
                format!("require(\"{}\").{}", specifier, binding.name)
            }
            ExportSource::Globals(module) => {
                format!("{}.{}", namespace_for(&namespaces, module), binding.name)
            }
        };
        fields.push(format!("  {}: {},", binding.name, gated(value, binding.condition)));
    }
    if !fields.is_empty() {
        parts.push(format!("{{\n{}\n}}", fields.join("\n")));
    }
    if parts.len() > 1 {
        lines.push(format!("module.exports = Object.assign({});", parts.join(", ")));
    }
    finish(lines)
}

fn namespace_for<'n>(namespaces: &'n [(String, String)], module: &str) -> &'n str {
    namespaces
        .iter()
        .find(|(m, _)| m == module)
        .map(|(_, local)| local.as_str())
        .unwrap_or(GLOBALS_NAMESPACE)
}

fn finish(lines: Vec<String>) -> String {
    if lines.is_empty() {
        return String::new();
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

// ═══════════════════════════════════════════════════════════════════════════════
// GLOBALS MODULE & DEFINE STUB
// ═══════════════════════════════════════════════════════════════════════════════

/// The shared object behind a package's cross-file globals. Keys are exactly
/// `names`; a name listed in `seeds` starts out as the value its dependency
/// exports (`name -> specifier`), every other name as `undefined`.
pub fn render_globals(
    names: &BTreeSet<String>,
    seeds: &BTreeMap<String, String>,
    format: ModuleFormat,
) -> String {
    let body = if names.is_empty() {
        "{}".to_string()
    } else {
        let fields: Vec<String> = names
            .iter()
            .map(|n| {
                if seeds.contains_key(n) {
                    format!("  {}: {},", n, n)
                } else {
                    format!("  {}: undefined,", n)
                }
            })
            .collect();
        format!("{{\n{}\n}}", fields.join("\n"))
    };

    let mut by_specifier: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (name, specifier) in seeds.iter().filter(|(n, _)| names.contains(*n)) {
        by_specifier.entry(specifier.as_str()).or_default().push(name.as_str());
    }
    let mut specifiers: Vec<&str> = by_specifier.keys().copied().collect();
    specifiers.sort_by(|a, b| import_order(a, b));
    let mut out = String::new();
    for specifier in specifiers {
        let list = by_specifier[specifier].join(", ");
        match format {
            ModuleFormat::Esm => out.push_str(&format!("import {{ {} }} from \"{}\";\n", list, specifier)),
            ModuleFormat::CommonJs => {
                out.push_str(&format!("const {{ {} }} = require(\"{}\");\n", list, specifier))
            }
        }
    }

    match format {
        ModuleFormat::Esm => out.push_str(&format!(
            "const {ns} = {body};\nexport default {ns};\n",
            ns = GLOBALS_NAMESPACE,
            body = body
        )),
        ModuleFormat::CommonJs => out.push_str(&format!("module.exports = {};\n", body)),
    }
    out
}

/// Stub imported by dependents of a lazy package; loading the package itself
/// is left to the caller.
pub fn render_define_stub(output_name: &str, format: ModuleFormat) -> String {
    match format {
        ModuleFormat::Esm => format!(
            "export default function load() {{\n  return import(\"{}\");\n}}\n",
            output_name
        ),
        ModuleFormat::CommonJs => format!(
            "module.exports = function load() {{\n  return Promise.resolve().then(() => require(\"{}\"));\n}};\n",
            output_name
        ),
    }
}
