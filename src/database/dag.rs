use std::collections::{BTreeSet, HashMap, VecDeque};

/// Directed dependency graph over work order ids. An edge `(a, b)` reads
/// "`a` depends on `b`".
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<String>,
    edges: Vec<(String, String)>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: impl Into<String>) {
        let node = node.into();
        if !self.nodes.contains(&node) {
            self.nodes.push(node);
        }
    }

    pub fn add_edge(&mut self, from: impl Into<String>, to: impl Into<String>) {
        let (from, to) = (from.into(), to.into());
        self.add_node(from.clone());
        self.add_node(to.clone());
        self.edges.push((from, to));
    }

    /// Kahn's algorithm. Returns the nodes in an order where every node
    /// comes after everything it depends on, or the cycle that prevents it.
    pub fn topological_order(&self) -> std::result::Result<Vec<String>, Vec<String>> {
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut in_degree: HashMap<&str, usize> = HashMap::new();

        for node in &self.nodes {
            dependents.entry(node.as_str()).or_default();
            in_degree.entry(node.as_str()).or_insert(0);
        }

        // Reverse the edges so dependencies come first
        for (from, to) in &self.edges {
            dependents
                .entry(to.as_str())
                .or_default()
                .push(from.as_str());
            *in_degree.entry(from.as_str()).or_insert(0) += 1;
        }

        let mut queue: VecDeque<&str> = self
            .nodes
            .iter()
            .map(String::as_str)
            .filter(|node| in_degree.get(node) == Some(&0))
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(current) = queue.pop_front() {
            order.push(current.to_string());
            if let Some(children) = dependents.get(current) {
                for child in children {
                    if let Some(degree) = in_degree.get_mut(child) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(*child);
                        }
                    }
                }
            }
        }

        if order.len() == self.nodes.len() {
            return Ok(order);
        }

        let remaining: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree > 0)
            .map(|(node, _)| *node)
            .collect();
        Err(self.extract_cycle(&remaining))
    }

    /// Every node left over by Kahn's algorithm has an outgoing edge to
    /// another left-over node, so following those edges must revisit a node.
    fn extract_cycle(&self, remaining: &BTreeSet<&str>) -> Vec<String> {
        let mut next: HashMap<&str, BTreeSet<&str>> = HashMap::new();
        for (from, to) in &self.edges {
            if remaining.contains(from.as_str()) && remaining.contains(to.as_str()) {
                next.entry(from.as_str()).or_default().insert(to.as_str());
            }
        }

        let Some(mut current) = remaining.iter().next().copied() else {
            return Vec::new();
        };
        let mut path: Vec<&str> = Vec::new();
        let mut position: HashMap<&str, usize> = HashMap::new();

        loop {
            if let Some(&start) = position.get(current) {
                let mut cycle: Vec<String> = path[start..].iter().map(|s| s.to_string()).collect();
                cycle.push(current.to_string());
                return cycle;
            }
            position.insert(current, path.len());
            path.push(current);

            match next.get(current).and_then(|targets| targets.iter().next()) {
                Some(target) => current = *target,
                None => return path.iter().map(|s| s.to_string()).collect(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topological_order_puts_dependencies_first() {
        let mut graph = DependencyGraph::new();
        graph.add_edge("c", "b");
        graph.add_edge("b", "a");
        graph.add_node("d");

        let order = graph.topological_order().unwrap();
        let pos = |id: &str| order.iter().position(|n| n == id).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("c"));
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn test_cycle_is_reported_with_path() {
        let mut graph = DependencyGraph::new();
        graph.add_edge("a", "b");
        graph.add_edge("b", "c");
        graph.add_edge("c", "a");
        graph.add_edge("d", "a");

        let cycle = graph.topological_order().unwrap_err();
        assert_eq!(cycle, vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let mut graph = DependencyGraph::new();
        graph.add_edge("a", "a");

        let cycle = graph.topological_order().unwrap_err();
        assert_eq!(cycle, vec!["a", "a"]);
    }
}
