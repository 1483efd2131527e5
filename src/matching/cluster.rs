use std::collections::{BTreeMap, HashMap};

use crate::models::ScoredCluster;

/// Union-find with path halving and union by size.
#[derive(Debug, Default)]
pub struct DisjointSet {
    parent: Vec<usize>,
    size: Vec<usize>,
}

impl DisjointSet {
    pub fn add(&mut self) -> usize {
        let id = self.parent.len();
        self.parent.push(id);
        self.size.push(1);
        id
    }

    pub fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    pub fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        let (big, small) = if self.size[ra] >= self.size[rb] {
            (ra, rb)
        } else {
            (rb, ra)
        };
        self.parent[small] = big;
        self.size[big] += self.size[small];
    }
}

/// Scored record pair above threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub left: String,
    pub right: String,
    pub score: f64,
}

/// Connected components of the edge graph.
///
/// Members are sorted by key so the smallest key leads each cluster; clusters
/// are ordered by that leading key. A member's score is the mean of its edges.
pub fn clusters_from_edges(edges: &[Edge]) -> Vec<ScoredCluster> {
    let mut ids: HashMap<&str, usize> = HashMap::new();
    let mut keys: Vec<&str> = Vec::new();
    let mut dsu = DisjointSet::default();
    let mut sums: Vec<(f64, usize)> = Vec::new();

    for e in edges {
        let a = *ids.entry(e.left.as_str()).or_insert_with(|| {
            keys.push(e.left.as_str());
            sums.push((0.0, 0));
            dsu.add()
        });
        let b = *ids.entry(e.right.as_str()).or_insert_with(|| {
            keys.push(e.right.as_str());
            sums.push((0.0, 0));
            dsu.add()
        });
        dsu.union(a, b);
        sums[a].0 += e.score;
        sums[a].1 += 1;
        sums[b].0 += e.score;
        sums[b].1 += 1;
    }

    let mut components: HashMap<usize, Vec<usize>> = HashMap::new();
    for i in 0..keys.len() {
        let root = dsu.find(i);
        components.entry(root).or_default().push(i);
    }

    let mut ordered: BTreeMap<&str, ScoredCluster> = BTreeMap::new();
    for (_, mut members) in components {
        if members.len() < 2 {
            continue;
        }
        members.sort_by(|x, y| keys[*x].cmp(keys[*y]));
        let cluster = ScoredCluster {
            members: members.iter().map(|&i| keys[i].to_string()).collect(),
            scores: members
                .iter()
                .map(|&i| {
                    let (sum, n) = sums[i];
                    if n == 0 { 0.0 } else { sum / n as f64 }
                })
                .collect(),
        };
        ordered.insert(keys[members[0]], cluster);
    }
    ordered.into_values().collect()
}
