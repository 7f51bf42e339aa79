//! Guide trees over the pairwise distance matrix.
//!
//! A tree is described by a [`PendingTree`] and becomes usable only after
//! [`PendingTree::build`], which consumes the description so that a tree is
//! never built twice. Leaves occupy node indices `0..n`; internal nodes are
//! appended after their children, so index order is a valid post-order.

pub mod cluster;
pub mod newick;
pub mod slink;

use crate::config::TreeKind;
use crate::error::{MsaError, Result};
use crate::selectivity::degenerate_distances;
use crate::stats::Statistics;
use log::{debug, info};
use nalgebra::DMatrix;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct TreeNode {
    pub children: Vec<usize>,
    pub parent: Option<usize>,
    /// Length of the edge to the parent.
    pub branch_length: f32,
    pub height: f32,
    /// Sequence index for leaves.
    pub leaf: Option<usize>,
}

impl TreeNode {
    fn leaf(index: usize) -> Self {
        TreeNode {
            children: Vec::new(),
            parent: None,
            branch_length: 0.0,
            height: 0.0,
            leaf: Some(index),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.leaf.is_some()
    }
}

/// Incremental node arena shared by the tree builders.
pub(crate) struct TreeAssembler {
    nodes: Vec<TreeNode>,
}

impl TreeAssembler {
    pub(crate) fn with_leaves(num_leaves: usize) -> Self {
        TreeAssembler {
            nodes: (0..num_leaves).map(TreeNode::leaf).collect(),
        }
    }

    /// Join two subtrees under a new node placed at `height`.
    pub(crate) fn join(&mut self, a: usize, b: usize, height: f32) -> usize {
        let id = self.nodes.len();
        for child in [a, b] {
            let node = &mut self.nodes[child];
            node.parent = Some(id);
            node.branch_length = (height - node.height).max(0.0);
        }
        self.nodes.push(TreeNode {
            children: vec![a, b],
            parent: None,
            branch_length: 0.0,
            height,
            leaf: None,
        });
        id
    }

    /// Join two subtrees with explicit edge lengths.
    pub(crate) fn join_with_lengths(&mut self, a: (usize, f32), b: (usize, f32)) -> usize {
        let id = self.nodes.len();
        for (child, length) in [a, b] {
            let node = &mut self.nodes[child];
            node.parent = Some(id);
            node.branch_length = length.max(0.0);
        }
        let height = (self.nodes[a.0].height + a.1).max(self.nodes[b.0].height + b.1);
        self.nodes.push(TreeNode {
            children: vec![a.0, b.0],
            parent: None,
            branch_length: 0.0,
            height,
            leaf: None,
        });
        id
    }

    pub(crate) fn into_nodes(self) -> Vec<TreeNode> {
        self.nodes
    }
}

// ---------------------------------------------------------------------------
// Variant selection
// ---------------------------------------------------------------------------

/// Which builder produces the topology.
#[derive(Debug, Clone)]
pub enum TreeVariant {
    /// Average-linkage agglomerative clustering (UPGMA).
    Cluster,
    SingleLinkage,
    /// Newick text with leaf labels matching `names`.
    External { newick: String, names: Vec<String> },
}

/// A guide tree that has been selected but not built yet.
#[derive(Debug, Clone)]
pub struct PendingTree {
    variant: TreeVariant,
    distances: DMatrix<f32>,
}

impl PendingTree {
    pub fn new(variant: TreeVariant, distances: &DMatrix<f32>) -> Self {
        PendingTree {
            variant,
            distances: distances.clone(),
        }
    }

    /// Choose the tree for `kind`. The chained kind degenerates `distances` in place.
    pub fn select(
        kind: TreeKind,
        distances: &mut DMatrix<f32>,
        names: &[String],
        newick: Option<&str>,
        seed: u64,
    ) -> Result<Self> {
        let variant = match kind {
            TreeKind::Chained => {
                degenerate_distances(distances, seed);
                TreeVariant::Cluster
            }
            TreeKind::Upgma => TreeVariant::Cluster,
            TreeKind::External => {
                let newick = newick.ok_or_else(|| {
                    MsaError::InvalidConfig("external guide tree requested without a Newick file".into())
                })?;
                TreeVariant::External {
                    newick: newick.to_string(),
                    names: names.to_vec(),
                }
            }
            TreeKind::SingleLinkage => TreeVariant::SingleLinkage,
        };
        Ok(PendingTree::new(variant, distances))
    }

    pub fn variant(&self) -> &TreeVariant {
        &self.variant
    }

    pub fn build(self) -> Result<GuideTree> {
        let start = Instant::now();
        let num_leaves = self.distances.nrows();
        if num_leaves == 0 {
            return Err(MsaError::GuideTree("cannot build a tree without leaves".into()));
        }

        let (nodes, label) = match &self.variant {
            TreeVariant::Cluster => (cluster::upgma(&self.distances), "UPGMA"),
            TreeVariant::SingleLinkage => (slink::single_linkage(&self.distances), "single linkage"),
            TreeVariant::External { newick, names } => (newick::assemble(newick, names)?, "external"),
        };
        let root = nodes.len() - 1;
        info!("Built {} guide tree over {} sequences", label, num_leaves);

        let mut tree = GuideTree {
            nodes,
            root,
            num_leaves,
            leaf_counts: Vec::new(),
            stats: Statistics::new(),
        };
        tree.leaf_counts = tree.count_leaves();
        tree.stats.write("time.2-tree", start.elapsed().as_secs_f64());
        Ok(tree)
    }
}

// ---------------------------------------------------------------------------
// Built tree
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GuideTree {
    nodes: Vec<TreeNode>,
    root: usize,
    num_leaves: usize,
    leaf_counts: Vec<usize>,
    stats: Statistics,
}

impl GuideTree {
    fn count_leaves(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.nodes.len()];
        for (id, node) in self.nodes.iter().enumerate() {
            counts[id] = if node.is_leaf() {
                1
            } else {
                node.children.iter().map(|&c| counts[c]).sum()
            };
        }
        counts
    }

    pub fn nodes(&self) -> &[TreeNode] {
        &self.nodes
    }

    pub fn root(&self) -> usize {
        self.root
    }

    pub fn num_leaves(&self) -> usize {
        self.num_leaves
    }

    pub fn stats(&self) -> &Statistics {
        &self.stats
    }

    /// Per-sequence weights: the branch lengths on the path to the root, each
    /// shared among the leaves below it, rescaled to a mean of 1.
    pub fn weights(&self) -> Vec<f32> {
        let mut weights = vec![0.0f32; self.num_leaves];
        for (leaf, weight) in weights.iter_mut().enumerate() {
            let mut node = leaf;
            while let Some(parent) = self.nodes[node].parent {
                *weight += self.nodes[node].branch_length / self.leaf_counts[node] as f32;
                node = parent;
            }
        }

        let total: f32 = weights.iter().sum();
        if total > 0.0 && total.is_finite() {
            let scale = self.num_leaves as f32 / total;
            weights.iter_mut().for_each(|w| *w *= scale);
        } else {
            weights.iter_mut().for_each(|w| *w = 1.0);
        }
        weights
    }

    /// Leaf count of the smallest subtree holding both sequences; zero diagonal.
    pub fn subtree_distances(&self) -> DMatrix<f32> {
        let n = self.num_leaves;
        let mut distances = DMatrix::<f32>::zeros(n, n);
        for (id, node) in self.nodes.iter().enumerate() {
            if node.children.len() < 2 {
                continue;
            }
            let size = self.leaf_counts[id] as f32;
            let groups: Vec<Vec<usize>> = node.children.iter().map(|&c| self.leaves_under(c)).collect();
            for (gi, left) in groups.iter().enumerate() {
                for right in &groups[gi + 1..] {
                    for &a in left {
                        for &b in right {
                            distances[(a, b)] = size;
                            distances[(b, a)] = size;
                        }
                    }
                }
            }
        }
        debug!("Computed subtree distances for {} sequences", n);
        distances
    }

    /// Sequence indices below `node`, in increasing order.
    pub fn leaves_under(&self, node: usize) -> Vec<usize> {
        let mut leaves = Vec::with_capacity(self.leaf_counts[node]);
        let mut stack = vec![node];
        while let Some(id) = stack.pop() {
            let n = &self.nodes[id];
            match n.leaf {
                Some(seq) => leaves.push(seq),
                None => stack.extend(n.children.iter().copied()),
            }
        }
        leaves.sort_unstable();
        leaves
    }

    /// Internal nodes with their two children, children before parents.
    pub fn merge_order(&self) -> Vec<(usize, usize, usize)> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.children.len() == 2)
            .map(|(id, node)| (id, node.children[0], node.children[1]))
            .collect()
    }

    /// Every non-root node; each stands for the edge to its parent.
    pub fn edges(&self) -> Vec<usize> {
        (0..self.nodes.len()).filter(|&id| id != self.root).collect()
    }
}
