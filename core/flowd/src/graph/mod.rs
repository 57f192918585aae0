//! Dependency graph of the pipeline.
//!
//! An edge `a -> b` means that `a` depends on `b`: an expression of `a` refers
//! to the outputs of `b`. The nodes are kept in insertion order, which is the
//! declaration order, and every ordering produced by the graph breaks ties with it.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use indexmap::IndexMap;
use rustc_hash::FxHashSet;

/// Position of a node in the graph, in declaration order.
pub type NodeIndex = usize;

#[derive(Debug, Clone)]
pub struct Dag<T = ()> {
    nodes: IndexMap<String, T>,
    /// `dependencies[i]` are the nodes that `i` depends on.
    dependencies: Vec<FxHashSet<NodeIndex>>,
    /// `dependents[i]` are the nodes that depend on `i`.
    dependents: Vec<FxHashSet<NodeIndex>>,
}

impl<T> Default for Dag<T> {
    fn default() -> Self {
        Self {
            nodes: IndexMap::new(),
            dependencies: Vec::new(),
            dependents: Vec::new(),
        }
    }
}

impl<T> Dag<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node. Returns `None` if a node with the same id already exists,
    /// in which case the graph is not modified.
    pub fn add_node(&mut self, id: impl Into<String>, data: T) -> Option<NodeIndex> {
        let (index, inserted) = {
            let entry = self.nodes.entry(id.into());
            let index = entry.index();
            match entry {
                indexmap::map::Entry::Occupied(_) => (index, false),
                indexmap::map::Entry::Vacant(v) => {
                    v.insert(data);
                    (index, true)
                }
            }
        };
        if !inserted {
            return None;
        }
        self.dependencies.push(FxHashSet::default());
        self.dependents.push(FxHashSet::default());
        Some(index)
    }

    /// Adds an edge: `dependent` depends on `dependency`.
    pub fn add_edge(&mut self, dependent: NodeIndex, dependency: NodeIndex) {
        self.dependencies[dependent].insert(dependency);
        self.dependents[dependency].insert(dependent);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn index_of(&self, id: &str) -> Option<NodeIndex> {
        self.nodes.get_index_of(id)
    }

    /// Returns the id of a node, or an empty string if the index is out of bounds.
    pub fn id(&self, index: NodeIndex) -> &str {
        self.nodes.get_index(index).map(|(id, _)| id.as_str()).unwrap_or_default()
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.nodes.get(id)
    }

    pub fn data(&self, index: NodeIndex) -> &T {
        &self.nodes[index]
    }

    /// Iterates on the nodes, in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeIndex, &str, &T)> {
        self.nodes.iter().enumerate().map(|(i, (id, data))| (i, id.as_str(), data))
    }

    /// Transforms the data of the nodes, keeping the ids and the edges.
    pub fn map<U>(self, mut f: impl FnMut(NodeIndex, &str, T) -> U) -> Dag<U> {
        let nodes = self
            .nodes
            .into_iter()
            .enumerate()
            .map(|(i, (id, data))| {
                let data = f(i, &id, data);
                (id, data)
            })
            .collect();
        Dag {
            nodes,
            dependencies: self.dependencies,
            dependents: self.dependents,
        }
    }

    /// Nodes that `index` depends on, in declaration order.
    pub fn dependencies(&self, index: NodeIndex) -> Vec<NodeIndex> {
        sorted(&self.dependencies[index])
    }

    /// Nodes that depend on `index`, in declaration order.
    pub fn dependents(&self, index: NodeIndex) -> Vec<NodeIndex> {
        sorted(&self.dependents[index])
    }

    /// Finds the cycles of the graph.
    ///
    /// Each cycle is a strongly connected component with more than one node,
    /// or a single node that depends on itself. The nodes of each cycle are sorted
    /// in declaration order, and the cycles are sorted by their first node.
    pub fn cycles(&self) -> Vec<Vec<NodeIndex>> {
        let mut tarjan = Tarjan::new(self.len());
        for v in 0..self.len() {
            if tarjan.index[v].is_none() {
                tarjan.visit(v, &self.dependencies);
            }
        }
        let mut cycles: Vec<Vec<NodeIndex>> = tarjan
            .components
            .into_iter()
            .filter(|scc| scc.len() > 1 || self.dependencies[scc[0]].contains(&scc[0]))
            .map(|mut scc| {
                scc.sort_unstable();
                scc
            })
            .collect();
        cycles.sort_unstable();
        cycles
    }

    /// Sorts the nodes so that every node comes after its dependencies.
    ///
    /// When several nodes are ready at the same time, the one declared first comes first.
    /// Returns `None` if the graph contains a cycle.
    pub fn topological_order(&self) -> Option<Vec<NodeIndex>> {
        let mut pending: Vec<usize> = self.dependencies.iter().map(|d| d.len()).collect();
        let mut ready: BinaryHeap<Reverse<NodeIndex>> = pending
            .iter()
            .enumerate()
            .filter(|(_, n)| **n == 0)
            .map(|(i, _)| Reverse(i))
            .collect();
        let mut order = Vec::with_capacity(self.len());
        while let Some(Reverse(v)) = ready.pop() {
            order.push(v);
            for &d in &self.dependents[v] {
                pending[d] -= 1;
                if pending[d] == 0 {
                    ready.push(Reverse(d));
                }
            }
        }
        (order.len() == self.len()).then_some(order)
    }

    /// Returns the seeds and every node that transitively depends on one of them.
    pub fn reachable_from(&self, seeds: impl IntoIterator<Item = NodeIndex>) -> FxHashSet<NodeIndex> {
        let mut visited = FxHashSet::default();
        let mut stack: Vec<NodeIndex> = seeds.into_iter().collect();
        while let Some(v) = stack.pop() {
            if visited.insert(v) {
                stack.extend(self.dependents[v].iter().copied());
            }
        }
        visited
    }

    /// Groups the nodes that are connected by an edge, regardless of its direction.
    ///
    /// Each group is sorted in declaration order, and the groups are sorted by their first node.
    pub fn weakly_connected_components(&self) -> Vec<Vec<NodeIndex>> {
        let mut component_of: Vec<Option<usize>> = vec![None; self.len()];
        let mut components = Vec::new();
        for start in 0..self.len() {
            if component_of[start].is_some() {
                continue;
            }
            let c = components.len();
            let mut members = Vec::new();
            let mut stack = vec![start];
            component_of[start] = Some(c);
            while let Some(v) = stack.pop() {
                members.push(v);
                for &w in self.dependencies[v].iter().chain(self.dependents[v].iter()) {
                    if component_of[w].is_none() {
                        component_of[w] = Some(c);
                        stack.push(w);
                    }
                }
            }
            members.sort_unstable();
            components.push(members);
        }
        components
    }

    /// Order in which the units must be stopped: dependents first.
    pub fn stop_order(&self) -> Option<Vec<NodeIndex>> {
        let mut order = self.topological_order()?;
        order.reverse();
        Some(order)
    }

    /// Splits the [stop order](Self::stop_order) by [weakly connected component](Self::weakly_connected_components).
    ///
    /// The groups do not depend on each other, so they can be stopped concurrently.
    pub fn stop_groups(&self) -> Option<Vec<Vec<NodeIndex>>> {
        let order = self.stop_order()?;
        let components = self.weakly_connected_components();
        let mut group_of = vec![0; self.len()];
        for (g, members) in components.iter().enumerate() {
            for &v in members {
                group_of[v] = g;
            }
        }
        let mut groups = vec![Vec::new(); components.len()];
        for v in order {
            groups[group_of[v]].push(v);
        }
        Some(groups)
    }
}

fn sorted(set: &FxHashSet<NodeIndex>) -> Vec<NodeIndex> {
    let mut v: Vec<NodeIndex> = set.iter().copied().collect();
    v.sort_unstable();
    v
}

/// Tarjan's strongly connected components algorithm.
struct Tarjan {
    next_index: usize,
    index: Vec<Option<usize>>,
    lowlink: Vec<usize>,
    on_stack: Vec<bool>,
    stack: Vec<NodeIndex>,
    components: Vec<Vec<NodeIndex>>,
}

impl Tarjan {
    fn new(n: usize) -> Self {
        Self {
            next_index: 0,
            index: vec![None; n],
            lowlink: vec![0; n],
            on_stack: vec![false; n],
            stack: Vec::new(),
            components: Vec::new(),
        }
    }

    fn visit(&mut self, v: NodeIndex, edges: &[FxHashSet<NodeIndex>]) {
        self.index[v] = Some(self.next_index);
        self.lowlink[v] = self.next_index;
        self.next_index += 1;
        self.stack.push(v);
        self.on_stack[v] = true;

        for &w in &edges[v] {
            match self.index[w] {
                None => {
                    self.visit(w, edges);
                    self.lowlink[v] = self.lowlink[v].min(self.lowlink[w]);
                }
                Some(w_index) if self.on_stack[w] => {
                    self.lowlink[v] = self.lowlink[v].min(w_index);
                }
                Some(_) => (),
            }
        }

        if Some(self.lowlink[v]) == self.index[v] {
            let mut scc = Vec::new();
            while let Some(w) = self.stack.pop() {
                self.on_stack[w] = false;
                scc.push(w);
                if w == v {
                    break;
                }
            }
            self.components.push(scc);
        }
    }
}
