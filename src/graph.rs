// Station connectivity graph
//
// Nodes are stations, edges are station pairs with at least one usable
// observation. A station's drift can only be resolved if its connected
// component contains a reference station.

use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct StationGraph {
    codes: Vec<String>,
    adjacency: Vec<Vec<usize>>,
}

impl StationGraph {
    pub fn new(codes: Vec<String>) -> Self {
        let n = codes.len();
        StationGraph {
            codes,
            adjacency: vec![vec![]; n],
        }
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn index_of(&self, code: &str) -> Option<usize> {
        self.codes.iter().position(|c| c == code)
    }

    /// Connect two stations. Unknown codes and self loops are ignored and
    /// reported as `false`.
    pub fn add_edge(&mut self, a: &str, b: &str) -> bool {
        match (self.index_of(a), self.index_of(b)) {
            (Some(u), Some(v)) if u != v => {
                if !self.adjacency[u].contains(&v) {
                    self.adjacency[u].push(v);
                    self.adjacency[v].push(u);
                }
                true
            }
            _ => false,
        }
    }

    pub fn degree(&self, code: &str) -> usize {
        self.index_of(code).map_or(0, |i| self.adjacency[i].len())
    }

    /// Component label per node, labels numbered in order of first node.
    /// Isolated nodes get their own label.
    pub fn components(&self) -> Vec<usize> {
        let n = self.codes.len();
        let mut labels = vec![usize::MAX; n];

        let mut label = 0;
        for start in 0..n {
            if labels[start] != usize::MAX {
                continue;
            }
            // BFS
            let mut queue = VecDeque::new();
            queue.push_back(start);
            labels[start] = label;
            while let Some(node) = queue.pop_front() {
                for &neighbor in &self.adjacency[node] {
                    if labels[neighbor] == usize::MAX {
                        labels[neighbor] = label;
                        queue.push_back(neighbor);
                    }
                }
            }
            label += 1;
        }

        labels
    }

    /// Per node, whether its component holds a node for which `is_reference`
    /// is true
    pub fn anchored<F>(&self, is_reference: F) -> Vec<bool>
    where
        F: Fn(&str) -> bool,
    {
        let labels = self.components();
        let n_labels = labels.iter().max().map_or(0, |m| m + 1);
        let mut has_reference = vec![false; n_labels];
        for (i, code) in self.codes.iter().enumerate() {
            if is_reference(code) {
                has_reference[labels[i]] = true;
            }
        }
        labels.iter().map(|&l| has_reference[l]).collect()
    }

    pub fn codes(&self) -> &[String] {
        &self.codes
    }
}
