//! Workflow dependency graph construction and cycle detection: jobs are nodes, `DependencyEdge`s are directed arcs from
//! upstream to downstream, compiled once at submission time.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::errors::{JobletError, Result};
use crate::model::DependencyEdge;

use super::expr::{self, Expr};

pub struct CompiledEdge {
    pub from: String,
    pub to: String,
    pub condition: Expr,
}

pub struct Graph {
    pub nodes: Vec<String>,
    pub edges: Vec<CompiledEdge>,
}

impl Graph {
    pub fn build(job_names: &[String], edges: &[DependencyEdge]) -> Result<Self> {
        let known: HashSet<&str> = job_names.iter().map(|s| s.as_str()).collect();
        let mut compiled = Vec::with_capacity(edges.len());
        for edge in edges {
            if !known.contains(edge.from.as_str()) {
                return Err(JobletError::validation(format!(
                    "dependency edge references unknown job '{}'",
                    edge.from
                )));
            }
            if !known.contains(edge.to.as_str()) {
                return Err(JobletError::validation(format!(
                    "dependency edge references unknown job '{}'",
                    edge.to
                )));
            }
            compiled.push(CompiledEdge {
                from: edge.from.clone(),
                to: edge.to.clone(),
                condition: expr::parse(&edge.condition)?,
            });
        }

        let graph = Graph {
            nodes: job_names.to_vec(),
            edges: compiled,
        };
        graph.check_acyclic()?;
        Ok(graph)
    }

    pub fn upstream_edges_of<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a CompiledEdge> {
        self.edges.iter().filter(move |e| e.to == name)
    }

    pub fn roots(&self) -> Vec<&str> {
        let has_upstream: HashSet<&str> = self.edges.iter().map(|e| e.to.as_str()).collect();
        self.nodes
            .iter()
            .map(|s| s.as_str())
            .filter(|n| !has_upstream.contains(n))
            .collect()
    }

    pub fn downstream_of<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> {
        self.edges.iter().filter(move |e| e.from == name).map(|e| e.to.as_str())
    }

    fn check_acyclic(&self) -> Result<()> {
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for edge in &self.edges {
            adjacency.entry(edge.from.as_str()).or_default().push(edge.to.as_str());
        }

        #[derive(Clone, Copy, PartialEq)]
        enum State {
            Unvisited,
            Visiting,
            Done,
        }
        let mut state: HashMap<&str, State> = self.nodes.iter().map(|n| (n.as_str(), State::Unvisited)).collect();

        fn visit<'a>(
            node: &'a str,
            adjacency: &HashMap<&'a str, Vec<&'a str>>,
            state: &mut HashMap<&'a str, State>,
        ) -> Result<()> {
            match state.get(node) {
                Some(State::Visiting) => {
                    return Err(JobletError::validation(format!(
                        "dependency cycle detected involving '{node}'"
                    )))
                }
                Some(State::Done) => return Ok(()),
                _ => {}
            }
            state.insert(node, State::Visiting);
            if let Some(children) = adjacency.get(node) {
                for child in children {
                    visit(child, adjacency, state)?;
                }
            }
            state.insert(node, State::Done);
            Ok(())
        }

        let nodes: Vec<&str> = self.nodes.iter().map(|s| s.as_str()).collect();
        for node in nodes {
            visit(node, &adjacency, &mut state)?;
        }
        Ok(())
    }
}

pub type StatusMap = BTreeMap<String, crate::model::JobStatus>;

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(from: &str, to: &str, cond: &str) -> DependencyEdge {
        DependencyEdge { from: from.into(), to: to.into(), condition: cond.into() }
    }

    #[test]
    fn builds_roots_correctly() {
        let names = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let edges = vec![edge("a", "b", "success"), edge("b", "c", "success")];
        let graph = Graph::build(&names, &edges).unwrap();
        assert_eq!(graph.roots(), vec!["a"]);
    }

    #[test]
    fn detects_cycle() {
        let names = vec!["a".to_string(), "b".to_string()];
        let edges = vec![edge("a", "b", "success"), edge("b", "a", "success")];
        assert!(Graph::build(&names, &edges).is_err());
    }

    #[test]
    fn rejects_edge_to_unknown_job() {
        let names = vec!["a".to_string()];
        let edges = vec![edge("a", "ghost", "success")];
        assert!(Graph::build(&names, &edges).is_err());
    }
}
