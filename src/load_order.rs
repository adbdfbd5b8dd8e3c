//! Flattened load order for one architecture.
//!
//! Ordering is per package rather than per dependency edge: a package is
//! emitted once, after its strong and present weak dependencies and before its
//! unordered and implied ones. Two packages that each need the other strongly
//! are emitted in first-visit order.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyRecord {
    pub name: String,
    /// Strong dependencies in declaration order.
    pub strong: Vec<String>,
    pub weak: Vec<String>,
    /// Unordered and implied dependencies, loaded after the package.
    pub after: Vec<String>,
    pub lazy: bool,
    pub prod_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadOrderEntry {
    pub package: String,
    pub lazy: bool,
    pub prod_only: bool,
}

pub fn build_load_order(records: &[DependencyRecord], roots: &[String]) -> Vec<LoadOrderEntry> {
    let index: HashMap<&str, &DependencyRecord> =
        records.iter().map(|r| (r.name.as_str(), r)).collect();
    let mut builder = OrderBuilder {
        index,
        seen: HashSet::new(),
        order: Vec::new(),
    };
    for root in roots {
        builder.visit(root);
    }
    builder.order
}

struct OrderBuilder<'r> {
    index: HashMap<&'r str, &'r DependencyRecord>,
    seen: HashSet<&'r str>,
    order: Vec<LoadOrderEntry>,
}

impl<'r> OrderBuilder<'r> {
    fn visit(&mut self, name: &str) {
        let Some(record) = self.index.get(name).copied() else {
            tracing::debug!(package = name, "no dependency record, skipped in load order");
            return;
        };
        if !self.seen.insert(record.name.as_str()) {
            return;
        }
        for dep in &record.strong {
            self.visit(dep);
        }
        for dep in &record.weak {
            if self.index.contains_key(dep.as_str()) {
                self.visit(dep);
            }
        }
        self.order.push(LoadOrderEntry {
            package: record.name.clone(),
            lazy: record.lazy,
            prod_only: record.prod_only,
        });
        for dep in &record.after {
            self.visit(dep);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, strong: &[&str], weak: &[&str], after: &[&str]) -> DependencyRecord {
        DependencyRecord {
            name: name.to_string(),
            strong: strong.iter().map(|s| s.to_string()).collect(),
            weak: weak.iter().map(|s| s.to_string()).collect(),
            after: after.iter().map(|s| s.to_string()).collect(),
            ..DependencyRecord::default()
        }
    }

    fn names(order: &[LoadOrderEntry]) -> Vec<&str> {
        order.iter().map(|e| e.package.as_str()).collect()
    }

    fn position(order: &[LoadOrderEntry], name: &str) -> usize {
        order.iter().position(|e| e.package == name).unwrap()
    }

    #[test]
    fn test_simple_chain() {
        let records = vec![record("beta", &["alpha"], &[], &[]), record("alpha", &[], &[], &[])];
        let order = build_load_order(&records, &["alpha".to_string(), "beta".to_string()]);
        assert_eq!(names(&order), vec!["alpha", "beta"]);
    }

    #[test]
    fn test_strong_before_and_after_edges_later() {
        let records = vec![
            record("app", &["router", "base"], &[], &["extras"]),
            record("router", &["base"], &[], &[]),
            record("base", &[], &[], &[]),
            record("extras", &["app"], &[], &[]),
        ];
        let order = build_load_order(&records, &["app".to_string()]);
        assert_eq!(names(&order), vec!["base", "router", "app", "extras"]);
        assert!(position(&order, "base") < position(&order, "router"));
        assert!(position(&order, "extras") > position(&order, "app"));
    }

    #[test]
    fn test_weak_only_when_present() {
        let records = vec![
            record("gamma", &[], &["epsilon", "missing"], &[]),
            record("epsilon", &[], &[], &[]),
        ];
        let order = build_load_order(&records, &["gamma".to_string()]);
        assert_eq!(names(&order), vec!["epsilon", "gamma"]);
    }

    #[test]
    fn test_each_package_once_and_cycles_terminate() {
        let records = vec![
            record("a", &["b"], &[], &[]),
            record("b", &["a"], &[], &[]),
            record("c", &["a", "b"], &[], &[]),
        ];
        let roots = vec!["a".to_string(), "c".to_string(), "a".to_string()];
        let order = build_load_order(&records, &roots);
        assert_eq!(names(&order), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_flags_carried() {
        let mut lazy = record("lazy", &[], &[], &[]);
        lazy.lazy = true;
        let mut prod = record("prod", &[], &[], &[]);
        prod.prod_only = true;
        let order = build_load_order(&[lazy, prod], &["lazy".to_string(), "prod".to_string()]);
        assert!(order[0].lazy && !order[0].prod_only);
        assert!(order[1].prod_only && !order[1].lazy);
    }
}
