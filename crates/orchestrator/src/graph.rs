//! Resource dependency graph
//!
//! Nodes are resource URNs. Apply walks the graph in topological order,
//! destroy in the reverse. Ties are broken by insertion order so plans are
//! reproducible.

use skein_common::{Error, Result};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<String>,
    dependencies: Vec<Vec<String>>,
    index: HashMap<String, usize>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, urn: impl Into<String>, dependencies: Vec<String>) -> Result<()> {
        let urn = urn.into();
        if self.index.contains_key(&urn) {
            return Err(Error::AlreadyExists {
                kind: "resource".into(),
                id: urn,
            });
        }
        self.index.insert(urn.clone(), self.nodes.len());
        self.nodes.push(urn);
        self.dependencies.push(dependencies);
        Ok(())
    }

    pub fn contains(&self, urn: &str) -> bool {
        self.index.contains_key(urn)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn dependencies(&self, urn: &str) -> Option<&[String]> {
        self.index.get(urn).map(|&i| self.dependencies[i].as_slice())
    }

    /// Every node after all of its dependencies
    pub fn topological_order(&self) -> Result<Vec<String>> {
        let mut indegree = vec![0usize; self.nodes.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];

        for (i, deps) in self.dependencies.iter().enumerate() {
            for dep in deps {
                let &d = self.index.get(dep).ok_or_else(|| {
                    Error::Validation(format!("{} depends on undeclared {}", self.nodes[i], dep))
                })?;
                indegree[i] += 1;
                dependents[d].push(i);
            }
        }

        // lowest insertion index first
        let mut ready: BTreeSet<usize> = (0..self.nodes.len()).filter(|&i| indegree[i] == 0).collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(i) = ready.pop_first() {
            order.push(self.nodes[i].clone());
            for &j in &dependents[i] {
                indegree[j] -= 1;
                if indegree[j] == 0 {
                    ready.insert(j);
                }
            }
        }

        if order.len() != self.nodes.len() {
            let stuck: Vec<&str> = (0..self.nodes.len())
                .filter(|&i| indegree[i] > 0)
                .map(|i| self.nodes[i].as_str())
                .collect();
            return Err(Error::Validation(format!(
                "dependency cycle among {}",
                stuck.join(", ")
            )));
        }
        Ok(order)
    }

    /// Every node before all of its dependencies
    pub fn reverse_order(&self) -> Result<Vec<String>> {
        let mut order = self.topological_order()?;
        order.reverse();
        Ok(order)
    }

    /// Graph over recorded resources; dependencies outside the set are dropped
    pub fn from_records<'a, I>(records: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a [String])> + Clone,
    {
        let known: BTreeSet<&str> = records.clone().into_iter().map(|(urn, _)| urn).collect();
        let mut graph = Self::new();
        for (urn, deps) in records {
            let deps = deps
                .iter()
                .filter(|d| known.contains(d.as_str()))
                .cloned()
                .collect();
            graph.add(urn, deps)?;
        }
        Ok(graph)
    }
}
