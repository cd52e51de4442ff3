//! Resource graph construction — the arena of declared nodes and the
//! dependency DAG derived from it.
//!
//! Nodes are declared against an explicit [`Context`] (no ambient globals)
//! and held in an arena keyed by opaque [`NodeId`] indices. Dependency edges
//! come from three sources: value-cell provenance on inputs, explicit
//! `depends_on` declarations, and parent/child containment. `build` flattens
//! the declarations into a cycle-checked, deterministically ordered DAG.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, OnceLock};

use indexmap::IndexMap;
use regex::Regex;
use rustc_hash::FxHashMap;

use crate::core::value::{Cell, Input};
use crate::error::{Error, Result};

/// Opaque arena index of a declared node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Backed by one remote object through a provider.
    Custom,
    /// Grouping only; never touches the provider.
    Component,
}

/// Per-declaration options.
#[derive(Default, Clone)]
pub struct ResourceOptions {
    /// Containment: scopes the identity and orders the child after the parent.
    pub parent: Option<NodeId>,
    /// Extra dependency edges beyond what input provenance implies.
    pub depends_on: Vec<NodeId>,
    /// Refuse destroy/replace until explicitly unprotected.
    pub protect: bool,
    /// Per-instance override of the provider's per-type replacement strategy.
    pub delete_before_replace: Option<bool>,
}

#[derive(Debug)]
struct Node {
    urn: String,
    ty: String,
    name: String,
    kind: NodeKind,
    parent: Option<NodeId>,
    inputs: IndexMap<String, Input>,
    depends_on: Vec<NodeId>,
    protect: bool,
    delete_before_replace: Option<bool>,
    outputs: IndexMap<String, Input>,
}

#[derive(Debug)]
struct GraphInner {
    nodes: Vec<Node>,
    identity: FxHashMap<(Option<NodeId>, String, String), NodeId>,
}

/// Graph-construction context for one stack. Cheap to clone; all clones share
/// the same arena.
#[derive(Clone, Debug)]
pub struct Context {
    inner: Arc<Mutex<GraphInner>>,
    stack_id: String,
}

fn name_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9._-]*$").expect("valid name pattern"))
}

impl Context {
    pub fn new(stack_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(GraphInner {
                nodes: Vec::new(),
                identity: FxHashMap::default(),
            })),
            stack_id: stack_id.into(),
        }
    }

    pub fn stack_id(&self) -> &str {
        &self.stack_id
    }

    /// Declare a provider-backed resource node.
    pub fn declare(
        &self,
        ty: &str,
        name: &str,
        inputs: IndexMap<String, Input>,
        opts: ResourceOptions,
    ) -> Result<ResourceHandle> {
        let id = self.register(NodeKind::Custom, ty, name, inputs, opts)?;
        Ok(ResourceHandle {
            id,
            ctx: self.clone(),
        })
    }

    /// Declare a component node (used by [`crate::core::component::Component`]).
    pub(crate) fn declare_component(
        &self,
        ty: &str,
        name: &str,
        opts: ResourceOptions,
    ) -> Result<NodeId> {
        self.register(NodeKind::Component, ty, name, IndexMap::new(), opts)
    }

    fn register(
        &self,
        kind: NodeKind,
        ty: &str,
        name: &str,
        inputs: IndexMap<String, Input>,
        opts: ResourceOptions,
    ) -> Result<NodeId> {
        if !name_pattern().is_match(name) {
            return Err(Error::InvalidName(name.to_string()));
        }

        let mut inner = self.inner.lock().expect("graph lock poisoned");
        let key = (opts.parent, ty.to_string(), name.to_string());
        if inner.identity.contains_key(&key) {
            let parent = match opts.parent {
                Some(p) => inner.nodes[p.0].urn.clone(),
                None => format!("stack '{}'", self.stack_id),
            };
            return Err(Error::DuplicateIdentity {
                ty: ty.to_string(),
                name: name.to_string(),
                parent,
            });
        }

        let qualified = match opts.parent {
            Some(p) => format!("{}/{}", inner.qualified_name(p), name),
            None => name.to_string(),
        };
        let urn = format!("urn:{}::{}::{}", self.stack_id, ty, qualified);

        let id = NodeId(inner.nodes.len());
        inner.nodes.push(Node {
            urn,
            ty: ty.to_string(),
            name: name.to_string(),
            kind,
            parent: opts.parent,
            inputs,
            depends_on: opts.depends_on,
            protect: opts.protect,
            delete_before_replace: opts.delete_before_replace,
            outputs: IndexMap::new(),
        });
        inner.identity.insert(key, id);
        Ok(id)
    }

    /// Deferred cell for a named output attribute of `node`, populated after
    /// the node applies. Repeated calls return the same cell.
    pub fn output_of(&self, node: NodeId, name: &str) -> Input {
        let mut inner = self.inner.lock().expect("graph lock poisoned");
        if let Some(cell) = inner.nodes[node.0].outputs.get(name) {
            return cell.clone();
        }
        let cell = Cell::pending_for(node);
        inner.nodes[node.0]
            .outputs
            .insert(name.to_string(), cell.clone());
        cell
    }

    pub fn urn(&self, node: NodeId) -> String {
        self.inner.lock().expect("graph lock poisoned").nodes[node.0]
            .urn
            .clone()
    }

    pub fn node_count(&self) -> usize {
        self.inner.lock().expect("graph lock poisoned").nodes.len()
    }

    /// All nodes inside `root`'s subtree, `root` included.
    pub(crate) fn subtree(&self, root: NodeId) -> Vec<NodeId> {
        let inner = self.inner.lock().expect("graph lock poisoned");
        self.subtree_locked(&inner, root)
    }

    /// Flatten declarations into a cycle-checked DAG with a deterministic
    /// topological order (insertion-order tie-breaking).
    pub fn build(&self) -> Result<BuiltGraph> {
        let subtrees: Vec<Vec<NodeId>>;
        let mut deps: Vec<Vec<NodeId>> = Vec::new();
        let mut execs: Vec<NodeExec> = Vec::new();

        {
            let inner = self.inner.lock().expect("graph lock poisoned");
            let n = inner.nodes.len();
            subtrees = (0..n)
                .map(|i| {
                    if inner.nodes[i].kind == NodeKind::Component {
                        self.subtree_locked(&inner, NodeId(i))
                    } else {
                        vec![NodeId(i)]
                    }
                })
                .collect();

            for (i, node) in inner.nodes.iter().enumerate() {
                let mut set: Vec<NodeId> = Vec::new();
                let push = |id: NodeId, set: &mut Vec<NodeId>| {
                    if id != NodeId(i) && !set.contains(&id) {
                        set.push(id);
                    }
                };

                if let Some(parent) = node.parent {
                    push(parent, &mut set);
                }
                for cell in node.inputs.values() {
                    for &dep in cell.provenance() {
                        push(dep, &mut set);
                    }
                }
                for &dep in &node.depends_on {
                    // Depending on a component means depending on its whole
                    // subtree, not just the marker node.
                    for &member in &subtrees[dep.0] {
                        push(member, &mut set);
                    }
                }
                deps.push(set);

                execs.push(NodeExec {
                    id: NodeId(i),
                    urn: node.urn.clone(),
                    ty: node.ty.clone(),
                    name: node.name.clone(),
                    kind: node.kind,
                    protect: node.protect,
                    delete_before_replace: node.delete_before_replace,
                    inputs: node
                        .inputs
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                    outputs: node
                        .outputs
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                });
            }
        }

        let n = execs.len();
        let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, dep_set) in deps.iter().enumerate() {
            for dep in dep_set {
                adjacency[dep.0].push(i);
            }
        }

        if let Some(cycle) = find_cycle(n, &adjacency) {
            let chain = cycle.iter().map(|&i| execs[i].urn.clone()).collect();
            return Err(Error::DependencyCycle { chain });
        }

        let order = topo_order(n, &adjacency, &deps);
        Ok(BuiltGraph {
            order,
            deps,
            nodes: execs,
        })
    }

    fn subtree_locked(&self, inner: &GraphInner, root: NodeId) -> Vec<NodeId> {
        (0..inner.nodes.len())
            .map(NodeId)
            .filter(|&id| {
                let mut cursor = Some(id);
                while let Some(c) = cursor {
                    if c == root {
                        return true;
                    }
                    cursor = inner.nodes[c.0].parent;
                }
                false
            })
            .collect()
    }
}

impl GraphInner {
    fn qualified_name(&self, node: NodeId) -> String {
        let mut parts = Vec::new();
        let mut cursor = Some(node);
        while let Some(c) = cursor {
            parts.push(self.nodes[c.0].name.clone());
            cursor = self.nodes[c.0].parent;
        }
        parts.reverse();
        parts.join("/")
    }
}

/// Handle to a declared resource node.
#[derive(Clone, Debug)]
pub struct ResourceHandle {
    id: NodeId,
    ctx: Context,
}

impl ResourceHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn urn(&self) -> String {
        self.ctx.urn(self.id)
    }

    /// Deferred output attribute, resolved once the node applies.
    pub fn output(&self, name: &str) -> Input {
        self.ctx.output_of(self.id, name)
    }
}

/// Flattened, validated graph ready for planning and execution.
pub struct BuiltGraph {
    /// Topological order (dependency before dependent, insertion-order ties).
    pub order: Vec<NodeId>,
    /// Dependency set per node, indexed by `NodeId`.
    pub deps: Vec<Vec<NodeId>>,
    /// Execution view per node, indexed by `NodeId`.
    pub nodes: Vec<NodeExec>,
}

/// Everything the planner/executor needs about one node, detached from the
/// arena lock. Cells are shared with the declaring stack, so resolving them
/// here propagates to component exposures and stack exports.
#[derive(Clone)]
pub struct NodeExec {
    pub id: NodeId,
    pub urn: String,
    pub ty: String,
    pub name: String,
    pub kind: NodeKind,
    pub protect: bool,
    pub delete_before_replace: Option<bool>,
    pub inputs: Vec<(String, Input)>,
    pub outputs: Vec<(String, Input)>,
}

/// DFS coloring. Returns the node chain of the first cycle found.
fn find_cycle(n: usize, adjacency: &[Vec<usize>]) -> Option<Vec<usize>> {
    const WHITE: u8 = 0;
    const GRAY: u8 = 1;
    const BLACK: u8 = 2;

    fn visit(
        v: usize,
        adjacency: &[Vec<usize>],
        color: &mut [u8],
        path: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        color[v] = GRAY;
        path.push(v);
        for &w in &adjacency[v] {
            if color[w] == GRAY {
                let start = path.iter().position(|&x| x == w).unwrap_or(0);
                let mut chain: Vec<usize> = path[start..].to_vec();
                chain.push(w);
                return Some(chain);
            }
            if color[w] == WHITE {
                if let Some(chain) = visit(w, adjacency, color, path) {
                    return Some(chain);
                }
            }
        }
        path.pop();
        color[v] = BLACK;
        None
    }

    let mut color = vec![WHITE; n];
    let mut path = Vec::new();
    for v in 0..n {
        if color[v] == WHITE {
            if let Some(chain) = visit(v, adjacency, &mut color, &mut path) {
                return Some(chain);
            }
        }
    }
    None
}

/// Kahn's algorithm; ready nodes are taken lowest-id first so repeated applies
/// of an unchanged graph produce the same operation order.
fn topo_order(n: usize, adjacency: &[Vec<usize>], deps: &[Vec<NodeId>]) -> Vec<NodeId> {
    let mut in_degree: Vec<usize> = deps.iter().map(|d| d.len()).collect();
    let mut ready: BinaryHeap<Reverse<usize>> = (0..n)
        .filter(|&i| in_degree[i] == 0)
        .map(Reverse)
        .collect();

    let mut order = Vec::with_capacity(n);
    while let Some(Reverse(current)) = ready.pop() {
        order.push(NodeId(current));
        for &next in &adjacency[current] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }
    order
}
