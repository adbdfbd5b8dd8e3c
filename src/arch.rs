//! Architecture model.
//!
//! Every package carries one node per known architecture, stored flat and
//! indexed by name. Parent links come from a fixed table, so walking the
//! inherited chain always terminates.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const COMMON: &str = "common";

/// Architecture name and its parent. Order is root-first.
const ARCH_PARENTS: &[(&str, Option<&str>)] = &[
    ("common", None),
    ("client", Some("common")),
    ("server", Some("common")),
    ("web", Some("client")),
    ("os", Some("server")),
    ("web.browser", Some("web")),
    ("web.browser.legacy", Some("web.browser")),
    ("web.cordova", Some("web.browser.legacy")),
];

/// Build targets materialized by a converted package, most specific first,
/// with the export condition each one is published under.
pub const BUILD_TARGETS: &[(&str, &str)] = &[
    ("os", "node"),
    ("web.cordova", "cordova"),
    ("web.browser.legacy", "legacy"),
    ("web.browser", "browser"),
    ("common", "default"),
];

pub fn known_archs() -> impl Iterator<Item = &'static str> {
    ARCH_PARENTS.iter().map(|(name, _)| *name)
}

pub fn parent_of(arch: &str) -> Option<&'static str> {
    ARCH_PARENTS
        .iter()
        .find(|(name, _)| *name == arch)
        .and_then(|(_, parent)| *parent)
}

/// Canonical architecture for a name accepted by the declaration API.
pub fn normalize_arch(name: &str) -> Option<&'static str> {
    let name = match name {
        "legacy" => "web.browser.legacy",
        "cordova" => "web.cordova",
        other => other,
    };
    known_archs().find(|arch| *arch == name)
}

/// Canonicalize a declared architecture list; an empty list means `common`.
pub fn resolve_archs(names: &[String]) -> std::result::Result<Vec<&'static str>, String> {
    if names.is_empty() {
        return Ok(vec![COMMON]);
    }
    let mut out = Vec::new();
    for name in names {
        let arch = normalize_arch(name).ok_or_else(|| format!("unknown architecture '{}'", name))?;
        if !out.contains(&arch) {
            out.push(arch);
        }
    }
    Ok(out)
}

/// `arch` and its ancestors, root first.
pub fn lineage(arch: &str) -> Vec<&'static str> {
    let mut chain = Vec::new();
    let mut current = normalize_arch(arch);
    while let Some(name) = current {
        chain.push(name);
        current = parent_of(name);
    }
    chain.reverse();
    chain
}

/// Whether `arch` is `ancestor` or one of its descendants.
pub fn descends_from(arch: &str, ancestor: &str) -> bool {
    lineage(arch).contains(&ancestor)
}

pub fn entry_file(arch: &str, test: bool) -> String {
    if test {
        format!("__{}.test.js", arch)
    } else {
        format!("__{}.js", arch)
    }
}

fn push_unique(list: &mut Vec<String>, value: &str) -> bool {
    if list.iter().any(|v| v == value) {
        return false;
    }
    list.push(value.to_string());
    true
}

// ═══════════════════════════════════════════════════════════════════════════════
// ARCH NODE
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchNode {
    pub name: String,
    /// Converted names of eagerly imported dependencies.
    pub imports: Vec<String>,
    pub exports: Vec<String>,
    pub implies: Vec<String>,
    /// Weak dependencies, loaded first when present.
    pub preload: Vec<String>,
    pub unordered: Vec<String>,
    pub main_module: Option<String>,
    pub assets: Vec<String>,
    pub files: Vec<String>,
    pub modified: bool,
}

/// Which list of an [`ArchNode`] an accessor reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchList {
    Imports,
    Exports,
    Implies,
    Preload,
    Unordered,
    Assets,
    Files,
}

impl ArchNode {
    fn list(&self, which: ArchList) -> &Vec<String> {
        match which {
            ArchList::Imports => &self.imports,
            ArchList::Exports => &self.exports,
            ArchList::Implies => &self.implies,
            ArchList::Preload => &self.preload,
            ArchList::Unordered => &self.unordered,
            ArchList::Assets => &self.assets,
            ArchList::Files => &self.files,
        }
    }

    fn list_mut(&mut self, which: ArchList) -> &mut Vec<String> {
        match which {
            ArchList::Imports => &mut self.imports,
            ArchList::Exports => &mut self.exports,
            ArchList::Implies => &mut self.implies,
            ArchList::Preload => &mut self.preload,
            ArchList::Unordered => &mut self.unordered,
            ArchList::Assets => &mut self.assets,
            ArchList::Files => &mut self.files,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ARCH TREE
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchTree {
    nodes: BTreeMap<String, ArchNode>,
}

impl Default for ArchTree {
    fn default() -> Self {
        let nodes = known_archs()
            .map(|name| {
                (
                    name.to_string(),
                    ArchNode {
                        name: name.to_string(),
                        ..ArchNode::default()
                    },
                )
            })
            .collect();
        ArchTree { nodes }
    }
}

impl ArchTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, arch: &str) -> Option<&ArchNode> {
        normalize_arch(arch).and_then(|name| self.nodes.get(name))
    }

    fn node_mut(&mut self, arch: &str) -> Option<&mut ArchNode> {
        normalize_arch(arch).and_then(move |name| self.nodes.get_mut(name))
    }

    /// Append `value` to one list of `arch`, marking the node modified.
    pub fn add(&mut self, arch: &str, which: ArchList, value: &str) {
        if let Some(node) = self.node_mut(arch) {
            node.modified = true;
            push_unique(node.list_mut(which), value);
        }
    }

    pub fn set_main_module(&mut self, arch: &str, file: &str) {
        if let Some(node) = self.node_mut(arch) {
            node.modified = true;
            node.main_module = Some(file.to_string());
        }
    }

    /// Values of one list; with `inherited`, ancestors come first and
    /// duplicates are dropped.
    pub fn get(&self, arch: &str, which: ArchList, inherited: bool) -> Vec<String> {
        let chain = if inherited {
            lineage(arch)
        } else {
            normalize_arch(arch).into_iter().collect()
        };
        let mut out = Vec::new();
        for name in chain {
            if let Some(node) = self.nodes.get(name) {
                for value in node.list(which) {
                    push_unique(&mut out, value);
                }
            }
        }
        out
    }

    /// Main module of `arch`; with `inherited`, the nearest declared one.
    pub fn main_module(&self, arch: &str, inherited: bool) -> Option<String> {
        if !inherited {
            return self.node(arch).and_then(|n| n.main_module.clone());
        }
        lineage(arch)
            .into_iter()
            .rev()
            .find_map(|name| self.nodes.get(name).and_then(|n| n.main_module.clone()))
    }

    pub fn is_modified(&self, arch: &str) -> bool {
        self.node(arch).map(|n| n.modified).unwrap_or(false)
    }

    /// Nearest modified architecture at or above `arch`, else `common`.
    pub fn active_arch(&self, arch: &str) -> &'static str {
        lineage(arch)
            .into_iter()
            .rev()
            .find(|name| self.is_modified(name))
            .unwrap_or(COMMON)
    }

    /// Active architecture per build target, in [`BUILD_TARGETS`] order.
    pub fn active_targets(&self) -> Vec<(&'static str, &'static str)> {
        BUILD_TARGETS
            .iter()
            .map(|(arch, condition)| (*condition, self.active_arch(arch)))
            .collect()
    }

    /// Distinct active architectures that need an entry point.
    pub fn active_archs(&self) -> Vec<&'static str> {
        let mut out: Vec<&'static str> = Vec::new();
        for (_, arch) in self.active_targets() {
            if !out.contains(&arch) {
                out.push(arch);
            }
        }
        out
    }

    /// Architectures whose node declares anything, root first.
    pub fn modified_archs(&self) -> Vec<&'static str> {
        known_archs().filter(|a| self.is_modified(a)).collect()
    }

    /// Drop every modification.
    pub fn reset(&mut self) {
        *self = ArchTree::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lineage_is_root_first() {
        assert_eq!(
            lineage("web.cordova"),
            vec![
                "common",
                "client",
                "web",
                "web.browser",
                "web.browser.legacy",
                "web.cordova"
            ]
        );
        assert_eq!(lineage("os"), vec!["common", "server", "os"]);
        assert!(lineage("nowhere").is_empty());
    }

    #[test]
    fn test_aliases_and_default() {
        assert_eq!(normalize_arch("legacy"), Some("web.browser.legacy"));
        assert_eq!(normalize_arch("cordova"), Some("web.cordova"));
        assert_eq!(resolve_archs(&[]).unwrap(), vec!["common"]);
        assert!(resolve_archs(&["mars".to_string()]).is_err());
        assert_eq!(
            resolve_archs(&["client".to_string(), "client".to_string()]).unwrap(),
            vec!["client"]
        );
    }

    #[test]
    fn test_inherited_lists_keep_order_and_dedupe() {
        let mut tree = ArchTree::new();
        tree.add("common", ArchList::Imports, "@legacy/alpha");
        tree.add("client", ArchList::Imports, "@legacy/beta");
        tree.add("web.browser", ArchList::Imports, "@legacy/alpha");
        tree.add("web.browser", ArchList::Imports, "@legacy/gamma");

        assert_eq!(
            tree.get("web.browser", ArchList::Imports, true),
            vec!["@legacy/alpha", "@legacy/beta", "@legacy/gamma"]
        );
        assert_eq!(
            tree.get("web.browser", ArchList::Imports, false),
            vec!["@legacy/alpha", "@legacy/gamma"]
        );
        assert_eq!(tree.get("os", ArchList::Imports, true), vec!["@legacy/alpha"]);
    }

    #[test]
    fn test_active_arch_collapses_to_modified_ancestor() {
        let mut tree = ArchTree::new();
        assert_eq!(tree.active_arch("web.cordova"), "common");

        tree.add("client", ArchList::Files, "client.js");
        assert_eq!(tree.active_arch("web.cordova"), "client");
        assert_eq!(tree.active_arch("os"), "common");
        assert_eq!(tree.active_archs(), vec!["common", "client"]);

        tree.set_main_module("server", "server.js");
        let targets = tree.active_targets();
        assert_eq!(targets[0], ("node", "server"));
        assert_eq!(targets[4], ("default", "common"));
    }

    #[test]
    fn test_main_module_nearest_wins() {
        let mut tree = ArchTree::new();
        tree.set_main_module("common", "main.js");
        tree.set_main_module("web.browser", "browser.js");
        assert_eq!(tree.main_module("web.cordova", true).as_deref(), Some("browser.js"));
        assert_eq!(tree.main_module("os", true).as_deref(), Some("main.js"));
        assert_eq!(tree.main_module("os", false), None);
    }

    #[test]
    fn test_entry_file_names() {
        assert_eq!(entry_file("web.browser", false), "__web.browser.js");
        assert_eq!(entry_file("os", true), "__os.test.js");
    }
}
