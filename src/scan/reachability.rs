//! Call-graph reachability: which vulnerable symbols does the program reach?
//!
//! The interprocedural call graph is supplied by the external IR builder as
//! an interchange document and held in a petgraph `StableDiGraph`. Vulnerable
//! nodes are matched against the symbol sets from the vulnerability matcher;
//! a representative stack per node is found by BFS over reverse edges from
//! the node to the nearest entry point. Traversals use explicit worklists and
//! visited sets; call graphs have cycles.

use crate::error::{Error, Result};
use crate::scan::packages::{PackageGraph, Position};
use petgraph::stable_graph::{EdgeIndex, NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

/// At most this many distinct stack summaries are kept per OSV × package.
pub const MAX_SUMMARIES_PER_GROUP: usize = 8;

/// A function node of the call graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuncSym {
    pub package: String,
    pub name: String,
    /// Receiver type when the function is a method; may be pointer-prefixed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
}

impl FuncSym {
    /// The symbol name as it appears in OSV symbol lists: `Name` for plain
    /// functions, `Receiver.Name` for methods with pointer markers and
    /// package qualifiers stripped.
    pub fn symbol(&self) -> String {
        match self.receiver.as_deref() {
            Some(receiver) => {
                let bare = receiver.trim_start_matches('*');
                let bare = bare.rsplit('.').next().unwrap_or(bare);
                format!("{bare}.{}", self.name)
            }
            None => self.name.clone(),
        }
    }

    /// Short human name used in stack summaries, e.g. `dht.DHT.Run`.
    pub fn display_name(&self) -> String {
        let base = self.package.rsplit('/').next().unwrap_or(&self.package);
        format!("{base}.{}", self.symbol())
    }

    fn is_init(&self) -> bool {
        // Implicit initializers are named "init"; source-level init functions
        // and their closures are named "init#d".
        self.name == "init" || self.name.starts_with("init#")
    }
}

/// The IR builder's call graph interchange document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallGraphData {
    pub functions: Vec<FuncSym>,
    #[serde(default)]
    pub edges: Vec<CallEdgeData>,
    /// Indices of entry functions (main, init, test roots).
    #[serde(default)]
    pub entries: Vec<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallEdgeData {
    pub caller: usize,
    pub callee: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
}

#[derive(Debug, Clone)]
struct CallEdge {
    position: Option<Position>,
}

/// One frame of a call stack, ordered entry first. `call_position` is the
/// source position of the call this frame makes to the next frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackFrame {
    pub function: FuncSym,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_position: Option<Position>,
}

/// A call stack from an entry point to a vulnerable symbol.
pub type CallStack = Vec<StackFrame>;

/// The call graph of the analyzed program.
#[derive(Debug)]
pub struct CallGraph {
    graph: StableDiGraph<FuncSym, CallEdge>,
    entries: HashSet<NodeIndex>,
}

impl CallGraph {
    /// Load the interchange document, validating node references.
    pub fn from_data(data: CallGraphData) -> Result<Self> {
        let mut graph = StableDiGraph::new();
        let nodes: Vec<NodeIndex> = data
            .functions
            .into_iter()
            .map(|f| graph.add_node(f))
            .collect();
        let bound = nodes.len();
        for edge in data.edges {
            if edge.caller >= bound || edge.callee >= bound {
                return Err(Error::data(
                    "call graph",
                    format!("edge {} -> {} out of range", edge.caller, edge.callee),
                ));
            }
            graph.add_edge(
                nodes[edge.caller],
                nodes[edge.callee],
                CallEdge {
                    position: edge.position,
                },
            );
        }
        let mut entries = HashSet::new();
        for entry in data.entries {
            if entry >= bound {
                return Err(Error::data(
                    "call graph",
                    format!("entry {entry} out of range"),
                ));
            }
            entries.insert(nodes[entry]);
        }
        Ok(Self { graph, entries })
    }

    pub fn load(bytes: &[u8]) -> Result<Self> {
        Self::from_data(serde_json::from_slice(bytes)?)
    }

    pub fn node(&self, index: NodeIndex) -> &FuncSym {
        &self.graph[index]
    }

    /// Match graph nodes against per-package symbol sets. An empty set marks
    /// the whole package as vulnerable.
    pub fn vulnerable_nodes(
        &self,
        symbols: &HashMap<String, HashSet<String>>,
    ) -> Vec<NodeIndex> {
        let mut nodes: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|&idx| {
                let func = &self.graph[idx];
                match symbols.get(&func.package) {
                    Some(set) => set.is_empty() || set.contains(&func.symbol()),
                    None => false,
                }
            })
            .collect();
        nodes.sort_by_key(|idx| idx.index());
        nodes
    }

    /// A representative stack from some entry node to `vuln`, preferring
    /// shortest, or `None` when no entry reaches it.
    pub fn call_stack(&self, vuln: NodeIndex) -> Option<CallStack> {
        // BFS from the vulnerable node over reverse edges; the first entry
        // dequeued yields a shortest stack.
        let mut visited: HashSet<NodeIndex> = [vuln].into();
        let mut queue: VecDeque<NodeIndex> = [vuln].into();
        // For each visited node, the step back toward the vulnerable node.
        let mut toward_vuln: HashMap<NodeIndex, (NodeIndex, EdgeIndex)> = HashMap::new();

        while let Some(node) = queue.pop_front() {
            if self.entries.contains(&node) {
                return Some(self.reconstruct(node, &toward_vuln));
            }
            for edge in self.graph.edges_directed(node, Direction::Incoming) {
                let caller = edge.source();
                if visited.insert(caller) {
                    toward_vuln.insert(caller, (node, edge.id()));
                    queue.push_back(caller);
                }
            }
        }
        None
    }

    fn reconstruct(
        &self,
        entry: NodeIndex,
        toward_vuln: &HashMap<NodeIndex, (NodeIndex, EdgeIndex)>,
    ) -> CallStack {
        let mut stack = Vec::new();
        let mut current = entry;
        loop {
            match toward_vuln.get(&current) {
                Some(&(next, edge)) => {
                    stack.push(StackFrame {
                        function: self.graph[current].clone(),
                        call_position: self.graph[edge].position.clone(),
                    });
                    current = next;
                }
                None => {
                    stack.push(StackFrame {
                        function: self.graph[current].clone(),
                        call_position: None,
                    });
                    return stack;
                }
            }
        }
    }
}

/// Produce the one-line summary of a stack, or `None` when the stack has no
/// top-level frame or no frame in the vulnerable package below it.
pub fn summarize_call_stack(
    stack: &[StackFrame],
    top_packages: &HashSet<String>,
    vuln_package: &str,
) -> Option<String> {
    // The lowest-indexed frame in a user package.
    let top = stack
        .iter()
        .position(|f| top_packages.contains(&f.function.package))?;
    // The highest-indexed frame in the vulnerable package, below the top.
    let vuln = stack
        .iter()
        .rposition(|f| f.function.package == vuln_package)?;
    if vuln <= top {
        return None;
    }
    let top_name = stack[top].function.display_name();
    let vuln_name = stack[vuln].function.display_name();
    if vuln == top + 1 {
        Some(format!("{top_name} calls {vuln_name}"))
    } else {
        let mid_name = stack[top + 1].function.display_name();
        Some(format!(
            "{top_name} calls {mid_name}, which eventually calls {vuln_name}"
        ))
    }
}

/// Sort summaries, drop duplicates, and bound the group size. Different
/// stacks can yield the same summary.
pub fn dedup_summaries(mut summaries: Vec<String>) -> Vec<String> {
    summaries.sort();
    summaries.dedup();
    summaries.truncate(MAX_SUMMARIES_PER_GROUP);
    summaries
}

/// Populate missing positions of init functions and their call sites.
///
/// An implicit `init` is positioned at the `package P` clause of some file
/// of P. A call `P1.init -> P2.init` is positioned at the `import "P2"`
/// statement in some file of P1; a call `P.init -> P.init#d` at the package
/// clause of P.
pub fn update_init_positions(stacks: &mut [CallStack], packages: &PackageGraph) {
    for stack in stacks.iter_mut() {
        for i in 0..stack.len() {
            update_init_position(&mut stack[i], packages);
            if i + 1 < stack.len() {
                let next = stack[i + 1].function.clone();
                update_init_call_position(&mut stack[i], &next, packages);
            }
        }
    }
}

fn update_init_position(frame: &mut StackFrame, packages: &PackageGraph) {
    let func = &frame.function;
    if !func.is_init() || frame.function.position.as_ref().is_some_and(Position::is_valid) {
        return;
    }
    frame.function.position = package_clause_position(packages, &func.package);
}

fn update_init_call_position(frame: &mut StackFrame, next: &FuncSym, packages: &PackageGraph) {
    if !next.is_init() || frame.call_position.as_ref().is_some_and(Position::is_valid) {
        return;
    }
    let position = if frame.function.name == "init" && frame.function.package == next.package {
        // Implicit P.init calling the explicit P.init#d.
        package_clause_position(packages, &frame.function.package)
    } else {
        import_statement_position(packages, &frame.function.package, &next.package)
    };
    frame.call_position = position;
}

fn package_clause_position(packages: &PackageGraph, package: &str) -> Option<Position> {
    // Any file of the package is as good as any other.
    packages
        .package(package)?
        .files
        .first()
        .map(|f| f.package_clause.clone())
}

fn import_statement_position(
    packages: &PackageGraph,
    package: &str,
    import_path: &str,
) -> Option<Position> {
    for file in &packages.package(package)?.files {
        for import in &file.imports {
            if import.path == import_path {
                return Some(import.position.clone());
            }
        }
    }
    // Call graph imprecision can produce an edge with no matching import.
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::packages::{ImportDecl, Package, SourceFile};

    const APP: &str = "example.com/cmd/app";
    const LIB: &str = "example.com/lib";
    const DEP: &str = "github.com/dep/pkg";

    fn func(package: &str, name: &str) -> FuncSym {
        FuncSym {
            package: package.to_string(),
            name: name.to_string(),
            receiver: None,
            position: None,
        }
    }

    fn method(package: &str, receiver: &str, name: &str) -> FuncSym {
        FuncSym {
            receiver: Some(receiver.to_string()),
            ..func(package, name)
        }
    }

    /// main -> Run, main -> Helper -> Run, Helper -> Conn.Close,
    /// plus an Orphan nothing reaches.
    fn sample_graph() -> CallGraph {
        CallGraph::from_data(CallGraphData {
            functions: vec![
                func(APP, "main"),           // 0
                func(LIB, "Helper"),         // 1
                func(DEP, "Run"),            // 2
                method(DEP, "*Conn", "Close"), // 3
                func(DEP, "Orphan"),         // 4
            ],
            edges: vec![
                CallEdgeData { caller: 0, callee: 2, position: None },
                CallEdgeData { caller: 0, callee: 1, position: None },
                CallEdgeData { caller: 1, callee: 2, position: None },
                CallEdgeData { caller: 1, callee: 3, position: None },
            ],
            entries: vec![0],
        })
        .unwrap()
    }

    fn dep_symbols(symbols: &[&str]) -> HashMap<String, HashSet<String>> {
        [(
            DEP.to_string(),
            symbols.iter().map(|s| s.to_string()).collect(),
        )]
        .into()
    }

    #[test]
    fn symbol_matching_covers_methods_and_pointers() {
        let graph = sample_graph();
        let nodes = graph.vulnerable_nodes(&dep_symbols(&["Run", "Conn.Close"]));
        let names: Vec<String> = nodes.iter().map(|&n| graph.node(n).symbol()).collect();
        assert_eq!(names, vec!["Run", "Conn.Close"]);

        // An empty symbol set marks the whole package.
        let nodes = graph.vulnerable_nodes(&dep_symbols(&[]));
        assert_eq!(nodes.len(), 3);
    }

    #[test]
    fn shortest_stack_is_preferred() {
        let graph = sample_graph();
        let run = graph.vulnerable_nodes(&dep_symbols(&["Run"]))[0];
        let stack = graph.call_stack(run).unwrap();
        let names: Vec<String> = stack.iter().map(|f| f.function.display_name()).collect();
        assert_eq!(names, vec!["app.main", "pkg.Run"]);
    }

    #[test]
    fn unreachable_nodes_yield_no_stack() {
        let graph = sample_graph();
        let orphan = graph.vulnerable_nodes(&dep_symbols(&["Orphan"]))[0];
        assert!(graph.call_stack(orphan).is_none());
    }

    #[test]
    fn cycles_terminate() {
        let graph = CallGraph::from_data(CallGraphData {
            functions: vec![func(DEP, "A"), func(DEP, "B")],
            edges: vec![
                CallEdgeData { caller: 0, callee: 1, position: None },
                CallEdgeData { caller: 1, callee: 0, position: None },
            ],
            entries: vec![],
        })
        .unwrap();
        let b = graph.vulnerable_nodes(&dep_symbols(&["B"]))[0];
        assert!(graph.call_stack(b).is_none());
    }

    #[test]
    fn out_of_range_references_are_rejected() {
        let err = CallGraph::from_data(CallGraphData {
            functions: vec![func(DEP, "A")],
            edges: vec![CallEdgeData { caller: 0, callee: 7, position: None }],
            entries: vec![],
        })
        .unwrap_err();
        assert!(matches!(err, Error::Data { .. }));
    }

    #[test]
    fn summary_shapes() {
        let tops: HashSet<String> = [APP.to_string()].into();
        let direct = vec![
            StackFrame { function: func(APP, "main"), call_position: None },
            StackFrame { function: func(DEP, "Run"), call_position: None },
        ];
        assert_eq!(
            summarize_call_stack(&direct, &tops, DEP).unwrap(),
            "app.main calls pkg.Run"
        );

        let indirect = vec![
            StackFrame { function: func(APP, "main"), call_position: None },
            StackFrame { function: func(LIB, "Helper"), call_position: None },
            StackFrame { function: method(DEP, "*Conn", "Close"), call_position: None },
        ];
        assert_eq!(
            summarize_call_stack(&indirect, &tops, DEP).unwrap(),
            "app.main calls lib.Helper, which eventually calls pkg.Conn.Close"
        );

        // No top-level frame: no summary.
        assert!(summarize_call_stack(&indirect[1..], &tops, DEP).is_none());
        // No frame in the vulnerable package below the top: no summary.
        assert!(summarize_call_stack(&indirect[..2], &tops, DEP).is_none());
    }

    #[test]
    fn summaries_dedup_and_cap() {
        let mut summaries = Vec::new();
        for i in 0..20 {
            summaries.push(format!("main calls f{}", i / 2));
        }
        let deduped = dedup_summaries(summaries);
        assert_eq!(deduped.len(), MAX_SUMMARIES_PER_GROUP);
        assert!(deduped.windows(2).all(|w| w[0] < w[1]));
    }

    fn positions_graph() -> PackageGraph {
        PackageGraph {
            packages: vec![
                Package {
                    path: "p1".into(),
                    files: vec![SourceFile {
                        path: "p1/a.src".into(),
                        package_clause: Position { file: "p1/a.src".into(), line: 1, column: 1 },
                        imports: vec![ImportDecl {
                            path: "p2".into(),
                            position: Position { file: "p1/a.src".into(), line: 3, column: 8 },
                        }],
                    }],
                    ..Default::default()
                },
                Package {
                    path: "p2".into(),
                    files: vec![SourceFile {
                        path: "p2/b.src".into(),
                        package_clause: Position { file: "p2/b.src".into(), line: 1, column: 1 },
                        imports: vec![],
                    }],
                    ..Default::default()
                },
            ],
            roots: vec![],
        }
    }

    #[test]
    fn init_positions_are_patched() {
        let mut stacks = vec![vec![
            StackFrame { function: func("p1", "init"), call_position: None },
            StackFrame { function: func("p2", "init"), call_position: None },
            StackFrame { function: func("p2", "Use"), call_position: None },
        ]];
        update_init_positions(&mut stacks, &positions_graph());
        let stack = &stacks[0];

        // Implicit inits sit at their package clause.
        assert_eq!(stack[0].function.position.as_ref().unwrap().line, 1);
        assert_eq!(stack[0].function.position.as_ref().unwrap().file, "p1/a.src");
        // The p1.init -> p2.init call sits at the import statement.
        assert_eq!(stack[0].call_position.as_ref().unwrap().line, 3);
        assert_eq!(stack[1].function.position.as_ref().unwrap().file, "p2/b.src");
        // p2.Use is not an init; its call position is left alone.
        assert!(stack[1].call_position.is_none());
    }

    #[test]
    fn explicit_init_call_sits_at_the_package_clause() {
        let mut stacks = vec![vec![
            StackFrame { function: func("p2", "init"), call_position: None },
            StackFrame { function: func("p2", "init#1"), call_position: None },
        ]];
        update_init_positions(&mut stacks, &positions_graph());
        let pos = stacks[0][0].call_position.as_ref().unwrap();
        assert_eq!((pos.file.as_str(), pos.line), ("p2/b.src", 1));
    }
}
