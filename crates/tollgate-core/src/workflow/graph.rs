//! Graph builder, edge table and compile-time validation.
//!
//! A graph is a set of named nodes plus, per node, at most one outgoing edge
//! (static or conditional) and an optional allow-list of `Command` targets.
//! `compile()` checks the structure with `petgraph` before any run can use it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;

use tollgate_types::workflow::WorkflowState;

use super::node::{Node, NodeDyn};

/// Terminal sentinel. Routing here ends the run.
pub const END: &str = "__end__";

/// Chooses the next node from the state a node just produced.
pub type Router = Arc<dyn Fn(&WorkflowState) -> String + Send + Sync>;

enum Edge {
    Static(String),
    Conditional { router: Router, targets: Vec<String> },
}

impl Edge {
    fn targets(&self) -> Vec<&str> {
        match self {
            Edge::Static(to) => vec![to.as_str()],
            Edge::Conditional { targets, .. } => targets.iter().map(String::as_str).collect(),
        }
    }
}

/// Structural problems found by [`GraphBuilder::compile`].
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum GraphError {
    #[error("no entry point set")]
    MissingEntry,

    #[error("node '{0}' is registered twice")]
    DuplicateNode(String),

    #[error("node '{0}' has more than one outgoing edge")]
    DuplicateEdge(String),

    #[error("reference to unknown node '{0}'")]
    UnknownNode(String),

    #[error("'{0}' is reserved for the terminal")]
    ReservedName(String),

    #[error("node '{0}' has no outgoing edge or command targets")]
    NoOutgoingEdge(String),

    #[error("node '{0}' is unreachable from the entry point")]
    Unreachable(String),

    #[error("the terminal is unreachable from the entry point")]
    TerminalUnreachable,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Assembles a workflow graph.
#[derive(Default)]
pub struct GraphBuilder {
    nodes: Vec<(String, Box<dyn NodeDyn>)>,
    edges: Vec<(String, Edge)>,
    commands: HashMap<String, Vec<String>>,
    entry: Option<String>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node<N: Node + 'static>(mut self, name: impl Into<String>, node: N) -> Self {
        self.nodes.push((name.into(), Box::new(node)));
        self
    }

    /// Unconditional edge followed after an `Update`.
    pub fn add_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push((from.into(), Edge::Static(to.into())));
        self
    }

    /// Router-driven edge; the router's answer must be one of `targets`.
    pub fn add_conditional_edges<F>(
        mut self,
        from: impl Into<String>,
        router: F,
        targets: &[&str],
    ) -> Self
    where
        F: Fn(&WorkflowState) -> String + Send + Sync + 'static,
    {
        self.edges.push((
            from.into(),
            Edge::Conditional {
                router: Arc::new(router),
                targets: targets.iter().map(|t| t.to_string()).collect(),
            },
        ));
        self
    }

    /// Destinations a node may name in a `Command`.
    pub fn allow_commands(mut self, from: impl Into<String>, targets: &[&str]) -> Self {
        self.commands
            .entry(from.into())
            .or_default()
            .extend(targets.iter().map(|t| t.to_string()));
        self
    }

    pub fn set_entry(mut self, name: impl Into<String>) -> Self {
        self.entry = Some(name.into());
        self
    }

    /// Validate the structure and freeze it.
    pub fn compile(self) -> Result<CompiledGraph, GraphError> {
        let entry = self.entry.clone().ok_or(GraphError::MissingEntry)?;

        let mut names: HashSet<&str> = HashSet::new();
        for (name, _) in &self.nodes {
            if name == END {
                return Err(GraphError::ReservedName(name.clone()));
            }
            if !names.insert(name.as_str()) {
                return Err(GraphError::DuplicateNode(name.clone()));
            }
        }

        let known = |name: &str| name == END || names.contains(name);
        if !names.contains(entry.as_str()) {
            return Err(GraphError::UnknownNode(entry.clone()));
        }

        let mut seen_edges: HashSet<&str> = HashSet::new();
        for (from, edge) in &self.edges {
            if !names.contains(from.as_str()) {
                return Err(GraphError::UnknownNode(from.clone()));
            }
            if !seen_edges.insert(from.as_str()) {
                return Err(GraphError::DuplicateEdge(from.clone()));
            }
            if let Some(bad) = edge.targets().into_iter().find(|t| !known(t)) {
                return Err(GraphError::UnknownNode(bad.to_string()));
            }
        }
        for (from, targets) in &self.commands {
            if !names.contains(from.as_str()) {
                return Err(GraphError::UnknownNode(from.clone()));
            }
            if let Some(bad) = targets.iter().find(|t| !known(t)) {
                return Err(GraphError::UnknownNode(bad.clone()));
            }
        }

        // Reachability over every possible transition.
        let mut graph = DiGraph::<&str, ()>::new();
        let mut index: HashMap<&str, NodeIndex> = HashMap::new();
        index.insert(END, graph.add_node(END));
        for (name, _) in &self.nodes {
            index.insert(name.as_str(), graph.add_node(name.as_str()));
        }

        for (name, _) in &self.nodes {
            let mut targets: Vec<&str> = Vec::new();
            if let Some((_, edge)) = self.edges.iter().find(|(from, _)| from == name) {
                targets.extend(edge.targets());
            }
            if let Some(cmds) = self.commands.get(name) {
                targets.extend(cmds.iter().map(String::as_str));
            }
            if targets.is_empty() {
                return Err(GraphError::NoOutgoingEdge(name.clone()));
            }
            for target in targets {
                graph.add_edge(index[name.as_str()], index[target], ());
            }
        }

        let mut reached: HashSet<NodeIndex> = HashSet::new();
        let mut dfs = Dfs::new(&graph, index[entry.as_str()]);
        while let Some(ix) = dfs.next(&graph) {
            reached.insert(ix);
        }

        for (name, _) in &self.nodes {
            if !reached.contains(&index[name.as_str()]) {
                return Err(GraphError::Unreachable(name.clone()));
            }
        }
        if !reached.contains(&index[END]) {
            return Err(GraphError::TerminalUnreachable);
        }

        tracing::debug!(
            entry = %entry,
            nodes = self.nodes.len(),
            edges = graph.edge_count(),
            "compiled workflow graph"
        );

        Ok(CompiledGraph {
            nodes: self.nodes.into_iter().collect(),
            edges: self.edges.into_iter().collect(),
            commands: self.commands,
            entry,
        })
    }
}

// ---------------------------------------------------------------------------
// CompiledGraph
// ---------------------------------------------------------------------------

/// A validated graph ready to be driven by the engine.
pub struct CompiledGraph {
    nodes: HashMap<String, Box<dyn NodeDyn>>,
    edges: HashMap<String, Edge>,
    commands: HashMap<String, Vec<String>>,
    entry: String,
}

/// Why a transition was refused.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteViolation {
    pub from: String,
    pub to: String,
}

impl CompiledGraph {
    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub(crate) fn node(&self, name: &str) -> Option<&dyn NodeDyn> {
        self.nodes.get(name).map(|n| n.as_ref())
    }

    /// Resolve the node that follows `from`.
    ///
    /// `goto` is the destination named by a `Command`; without one the
    /// node's edge decides, consulting its router against the updated state.
    pub fn next(
        &self,
        from: &str,
        goto: Option<&str>,
        state: &WorkflowState,
    ) -> Result<String, RouteViolation> {
        let violation = |to: &str| RouteViolation {
            from: from.to_string(),
            to: to.to_string(),
        };

        if let Some(goto) = goto {
            let allowed = self
                .commands
                .get(from)
                .is_some_and(|targets| targets.iter().any(|t| t == goto));
            return if allowed {
                Ok(goto.to_string())
            } else {
                Err(violation(goto))
            };
        }

        match self.edges.get(from) {
            Some(Edge::Static(to)) => Ok(to.clone()),
            Some(Edge::Conditional { router, targets }) => {
                let to = router(state);
                if targets.contains(&to) {
                    Ok(to)
                } else {
                    Err(violation(&to))
                }
            }
            None => Err(violation("<none>")),
        }
    }
}

impl std::fmt::Debug for CompiledGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut nodes: Vec<&String> = self.nodes.keys().collect();
        nodes.sort();
        f.debug_struct("CompiledGraph")
            .field("entry", &self.entry)
            .field("nodes", &nodes)
            .finish()
    }
}
