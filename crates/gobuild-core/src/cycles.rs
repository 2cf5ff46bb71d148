//! Dependency cycle detection (Tarjan's strongly connected components).
//!
//! The traversal keeps its own call stack, so deep requirement chains cannot
//! overflow the thread stack.

use std::collections::{BTreeMap, HashMap, HashSet};

/// Returns every strongly connected component with at least two members.
///
/// Nodes are visited in sorted order and each component's members are
/// sorted, so the result is deterministic for a given graph. Requirements
/// naming a path with no adjacency entry are treated as leaves.
pub fn find_all_cycles(graph: &BTreeMap<String, Vec<String>>) -> Vec<Vec<String>> {
    Tarjan::new(graph).run()
}

struct Frame<'a> {
    node: &'a str,
    next_edge: usize,
}

struct Tarjan<'a> {
    graph: &'a BTreeMap<String, Vec<String>>,
    index: usize,
    indices: HashMap<&'a str, usize>,
    lowlinks: HashMap<&'a str, usize>,
    stack: Vec<&'a str>,
    on_stack: HashSet<&'a str>,
    components: Vec<Vec<String>>,
}

impl<'a> Tarjan<'a> {
    fn new(graph: &'a BTreeMap<String, Vec<String>>) -> Self {
        Self {
            graph,
            index: 0,
            indices: HashMap::new(),
            lowlinks: HashMap::new(),
            stack: Vec::new(),
            on_stack: HashSet::new(),
            components: Vec::new(),
        }
    }

    fn run(mut self) -> Vec<Vec<String>> {
        let graph = self.graph;
        for node in graph.keys() {
            if !self.indices.contains_key(node.as_str()) {
                self.connect(node);
            }
        }
        self.components
    }

    fn edges(&self, node: &str) -> &'a [String] {
        self.graph.get(node).map(Vec::as_slice).unwrap_or_default()
    }

    fn visit(&mut self, node: &'a str) {
        self.indices.insert(node, self.index);
        self.lowlinks.insert(node, self.index);
        self.index += 1;
        self.stack.push(node);
        self.on_stack.insert(node);
    }

    fn connect(&mut self, root: &'a str) {
        self.visit(root);
        let mut frames = vec![Frame {
            node: root,
            next_edge: 0,
        }];

        while let Some(frame) = frames.last_mut() {
            let node = frame.node;
            let edges = self.edges(node);

            if let Some(next) = edges.get(frame.next_edge) {
                frame.next_edge += 1;
                let next = next.as_str();
                if let Some(&next_index) = self.indices.get(next) {
                    if self.on_stack.contains(next) {
                        let low = self.lowlinks[node].min(next_index);
                        self.lowlinks.insert(node, low);
                    }
                } else {
                    self.visit(next);
                    frames.push(Frame {
                        node: next,
                        next_edge: 0,
                    });
                }
                continue;
            }

            frames.pop();
            let low = self.lowlinks[node];
            if let Some(parent) = frames.last() {
                let parent_low = self.lowlinks[parent.node].min(low);
                self.lowlinks.insert(parent.node, parent_low);
            }

            if low == self.indices[node] {
                let mut component = Vec::new();
                while let Some(member) = self.stack.pop() {
                    self.on_stack.remove(member);
                    component.push(member.to_string());
                    if member == node {
                        break;
                    }
                }
                if component.len() > 1 {
                    component.sort();
                    self.components.push(component);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
        edges
            .iter()
            .map(|(node, reqs)| {
                (
                    (*node).to_string(),
                    reqs.iter().map(|r| (*r).to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn finds_single_cycle() {
        let g = graph(&[("a", &["b"]), ("b", &["c"]), ("c", &["a"]), ("d", &[])]);
        assert_eq!(find_all_cycles(&g), vec![vec!["a", "b", "c"]]);
    }

    #[test]
    fn acyclic_graph_has_no_cycles() {
        let g = graph(&[("a", &["b", "c"]), ("b", &["c"]), ("c", &[])]);
        assert!(find_all_cycles(&g).is_empty());
    }

    #[test]
    fn self_loop_is_not_reported() {
        let g = graph(&[("a", &["a"])]);
        assert!(find_all_cycles(&g).is_empty());
    }

    #[test]
    fn missing_adjacency_is_a_leaf() {
        let g = graph(&[("a", &["ghost", "b"]), ("b", &["a"])]);
        assert_eq!(find_all_cycles(&g), vec![vec!["a", "b"]]);
    }

    #[test]
    fn separate_cycles_are_reported_separately() {
        let g = graph(&[
            ("a", &["b"]),
            ("b", &["a", "c"]),
            ("c", &["d"]),
            ("d", &["c"]),
        ]);
        let cycles = find_all_cycles(&g);
        assert_eq!(cycles, vec![vec!["c", "d"], vec!["a", "b"]]);
    }

    #[test]
    fn long_chain_does_not_recurse() {
        let names: Vec<String> = (0..50_000).map(|i| format!("m{i:05}")).collect();
        let mut g: BTreeMap<String, Vec<String>> = names
            .windows(2)
            .map(|w| (w[0].clone(), vec![w[1].clone()]))
            .collect();
        g.insert(names[names.len() - 1].clone(), vec![names[0].clone()]);
        let cycles = find_all_cycles(&g);
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].len(), 50_000);
    }
}
