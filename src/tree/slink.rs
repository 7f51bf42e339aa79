use super::{TreeAssembler, TreeNode};
use nalgebra::DMatrix;

/// Single-linkage clustering via a minimum spanning tree.
///
/// Prim's algorithm collects the `n - 1` MST edges in O(n²); merging them in
/// increasing order of length yields the single-linkage dendrogram.
pub fn single_linkage(distances: &DMatrix<f32>) -> Vec<TreeNode> {
    let n = distances.nrows();
    let mut tree = TreeAssembler::with_leaves(n);
    if n < 2 {
        return tree.into_nodes();
    }

    let mut in_tree = vec![false; n];
    let mut best = vec![f32::INFINITY; n];
    let mut link = vec![0usize; n];
    let mut edges: Vec<(f32, usize, usize)> = Vec::with_capacity(n - 1);

    in_tree[0] = true;
    for j in 1..n {
        best[j] = distances[(0, j)];
    }
    for _ in 1..n {
        let mut next: Option<usize> = None;
        for j in 0..n {
            if !in_tree[j] && next.map_or(true, |k| best[j] < best[k]) {
                next = Some(j);
            }
        }
        let Some(v) = next else { break };
        in_tree[v] = true;
        edges.push((best[v], link[v], v));
        for j in 0..n {
            if !in_tree[j] && distances[(v, j)] < best[j] {
                best[j] = distances[(v, j)];
                link[j] = v;
            }
        }
    }

    edges.sort_by(|a, b| a.0.total_cmp(&b.0));

    // Union-find over sequences; each root remembers its current tree node.
    let mut parent: Vec<usize> = (0..n).collect();
    let mut node_of: Vec<usize> = (0..n).collect();
    fn find(parent: &mut [usize], mut x: usize) -> usize {
        while parent[x] != x {
            parent[x] = parent[parent[x]];
            x = parent[x];
        }
        x
    }

    for (d, a, b) in edges {
        let ra = find(&mut parent, a);
        let rb = find(&mut parent, b);
        if ra == rb {
            continue;
        }
        let height = if d.is_finite() { d / 2.0 } else { 0.0 };
        let merged = tree.join(node_of[ra], node_of[rb], height);
        let (keep, gone) = if ra < rb { (ra, rb) } else { (rb, ra) };
        parent[gone] = keep;
        node_of[keep] = merged;
    }

    tree.into_nodes()
}
