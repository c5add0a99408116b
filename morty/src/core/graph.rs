//! Module-level dependency graph and deterministic topological ordering.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::OrchestrationError;

/// One declared dependency entry before expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencySpec {
    /// Explicitly no dependencies.
    None,
    /// Depends on every other known module.
    All,
    Module(String),
}

impl DependencySpec {
    /// Parse a raw plan entry. Recognises the "none" and "all modules" markers.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim().trim_matches('`').trim();
        match trimmed {
            "" | "-" | "无" => DependencySpec::None,
            "__ALL__" | "所有模块" => DependencySpec::All,
            other if other.eq_ignore_ascii_case("none") => DependencySpec::None,
            other if other.eq_ignore_ascii_case("all") => DependencySpec::All,
            other => DependencySpec::Module(other.to_string()),
        }
    }
}

/// Directed graph of "module depends on module" edges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    deps: BTreeMap<String, BTreeSet<String>>,
    unknown: Vec<(String, String)>,
}

impl DependencyGraph {
    /// Build a graph from declared per-module dependency lists.
    ///
    /// `All` expands to every other module known at construction time. References
    /// to modules that do not exist are dropped and reported by
    /// [`DependencyGraph::unknown_dependencies`].
    pub fn new<'a, I>(modules: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a [DependencySpec])>,
    {
        let declared: Vec<(&str, &[DependencySpec])> = modules.into_iter().collect();
        let known: BTreeSet<String> = declared.iter().map(|(n, _)| n.to_string()).collect();

        let mut deps = BTreeMap::new();
        let mut unknown = Vec::new();
        for (name, specs) in declared {
            let mut edges = BTreeSet::new();
            for spec in specs {
                match spec {
                    DependencySpec::None => {}
                    DependencySpec::All => {
                        edges.extend(known.iter().filter(|other| *other != name).cloned());
                    }
                    DependencySpec::Module(dep) if dep == name => {}
                    DependencySpec::Module(dep) if known.contains(dep) => {
                        edges.insert(dep.clone());
                    }
                    DependencySpec::Module(dep) => {
                        unknown.push((name.to_string(), dep.clone()));
                    }
                }
            }
            deps.insert(name.to_string(), edges);
        }
        Self { deps, unknown }
    }

    /// Build a graph from already-expanded dependency names.
    pub fn from_expanded<'a, I>(modules: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a [String])>,
    {
        let specs: Vec<(String, Vec<DependencySpec>)> = modules
            .into_iter()
            .map(|(name, deps)| {
                let specs = deps
                    .iter()
                    .map(|dep| DependencySpec::Module(dep.clone()))
                    .collect();
                (name.to_string(), specs)
            })
            .collect();
        Self::new(specs.iter().map(|(n, s)| (n.as_str(), s.as_slice())))
    }

    /// Expanded dependencies of `module`, sorted.
    pub fn dependencies(&self, module: &str) -> Option<&BTreeSet<String>> {
        self.deps.get(module)
    }

    /// `(module, missing_dependency)` pairs dropped at construction.
    pub fn unknown_dependencies(&self) -> &[(String, String)] {
        &self.unknown
    }

    pub fn len(&self) -> usize {
        self.deps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }

    /// Kahn's algorithm where in-degree counts a module's own dependencies.
    ///
    /// Ready modules are always taken in lexicographic order, so equal graphs
    /// produce equal orders.
    pub fn topological_order(&self) -> Result<Vec<String>, OrchestrationError> {
        let mut in_degree: BTreeMap<&str, usize> = self
            .deps
            .iter()
            .map(|(name, edges)| (name.as_str(), edges.len()))
            .collect();
        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(name, _)| *name)
            .collect();

        let mut order = Vec::with_capacity(self.deps.len());
        while let Some(current) = ready.pop_first() {
            order.push(current.to_string());
            for (name, edges) in &self.deps {
                if !edges.contains(current) {
                    continue;
                }
                if let Some(degree) = in_degree.get_mut(name.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(name.as_str());
                    }
                }
            }
        }

        if order.len() < self.deps.len() {
            let emitted: BTreeSet<&str> = order.iter().map(String::as_str).collect();
            let modules = self
                .deps
                .keys()
                .filter(|name| !emitted.contains(name.as_str()))
                .cloned()
                .collect();
            return Err(OrchestrationError::CircularDependency { modules });
        }
        Ok(order)
    }
}
