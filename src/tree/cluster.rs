use super::{TreeAssembler, TreeNode};
use nalgebra::DMatrix;

/// Average-linkage (UPGMA) clustering. Ties go to the first pair in row-major order.
pub fn upgma(distances: &DMatrix<f32>) -> Vec<TreeNode> {
    let n = distances.nrows();
    let mut tree = TreeAssembler::with_leaves(n);
    if n < 2 {
        return tree.into_nodes();
    }

    let mut dist: Vec<Vec<f32>> = (0..n)
        .map(|i| (0..n).map(|j| distances[(i, j)]).collect())
        .collect();
    // Cluster slot -> (tree node, size); slots of merged clusters become None.
    let mut clusters: Vec<Option<(usize, usize)>> = (0..n).map(|i| Some((i, 1))).collect();

    for _ in 0..(n - 1) {
        let mut best = f32::INFINITY;
        let mut pair: Option<(usize, usize)> = None;
        for i in 0..n {
            if clusters[i].is_none() {
                continue;
            }
            for j in (i + 1)..n {
                if clusters[j].is_some() && (pair.is_none() || dist[i][j] < best) {
                    best = dist[i][j];
                    pair = Some((i, j));
                }
            }
        }
        let Some((bi, bj)) = pair else { break };
        let (node_i, size_i) = clusters[bi].take().unwrap_or((bi, 1));
        let (node_j, size_j) = clusters[bj].take().unwrap_or((bj, 1));

        let height = if best.is_finite() { best / 2.0 } else { 0.0 };
        let merged = tree.join(node_i, node_j, height);

        let (si, sj) = (size_i as f32, size_j as f32);
        for k in 0..n {
            if k == bi || k == bj || clusters[k].is_none() {
                continue;
            }
            let d = (dist[bi][k] * si + dist[bj][k] * sj) / (si + sj);
            dist[bi][k] = d;
            dist[k][bi] = d;
        }
        clusters[bi] = Some((merged, size_i + size_j));
    }

    tree.into_nodes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix(n: usize, values: &[(usize, usize, f32)]) -> DMatrix<f32> {
        let mut m = DMatrix::<f32>::zeros(n, n);
        for &(i, j, d) in values {
            m[(i, j)] = d;
            m[(j, i)] = d;
        }
        m
    }

    #[test]
    fn test_upgma_three_leaves() {
        let d = matrix(3, &[(0, 1, 0.2), (0, 2, 0.5), (1, 2, 0.3)]);
        let nodes = upgma(&d);
        assert_eq!(nodes.len(), 5);
        // first merge joins 0 and 1 at half their distance
        assert_eq!(nodes[3].children, vec![0, 1]);
        assert!((nodes[3].height - 0.1).abs() < 1e-6);
        // then {0,1} joins 2 at the average distance (0.5 + 0.3) / 2
        assert_eq!(nodes[4].children, vec![3, 2]);
        assert!((nodes[4].height - 0.2).abs() < 1e-6);
        assert!((nodes[2].branch_length - 0.2).abs() < 1e-6);
        assert!((nodes[3].branch_length - 0.1).abs() < 1e-6);
        assert_eq!(nodes[4].parent, None);
    }

    #[test]
    fn test_upgma_handles_infinite_distances() {
        let d = matrix(3, &[(0, 1, f32::INFINITY), (0, 2, f32::INFINITY), (1, 2, f32::INFINITY)]);
        let nodes = upgma(&d);
        assert_eq!(nodes.len(), 5);
        assert!(nodes.iter().all(|n| n.branch_length.is_finite()));
    }
}
