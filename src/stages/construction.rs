//! Progressive alignment along the guide tree.
//!
//! Two profiles are merged by a maximum expected accuracy dynamic program over
//! their columns. The score of a column pair is the weighted sum of the
//! posterior probabilities of every cross-profile residue pair it would align.

use super::ConstructionStage;
use crate::alignment::{Alignment, GAP};
use crate::error::{MsaError, Result};
use crate::model::ProbabilisticModel;
use crate::sequence::SequenceSet;
use crate::sparse::{PairStore, PosteriorMatrix};
use crate::stats::Statistics;
use crate::tree::GuideTree;
use log::{debug, info};
use nalgebra::DMatrix;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::time::Instant;

/// Pool for the final alignment stages, sized by the model's thread count.
pub(crate) fn model_pool(model: &ProbabilisticModel, stage: &'static str) -> Result<ThreadPool> {
    ThreadPoolBuilder::new()
        .num_threads(model.num_threads())
        .build()
        .map_err(|e| MsaError::stage(stage, e.to_string()))
}

/// Column-pair scores of `left` against `right`, as a dense
/// `(|left| + 1) x (|right| + 1)` matrix with an empty row and column 0.
fn profile_scores<M: PosteriorMatrix>(
    left: &Alignment,
    right: &Alignment,
    weights: &[f32],
    store: &PairStore<M>,
) -> Result<Vec<f32>> {
    let width = right.len() + 1;
    let right_columns: Vec<Vec<usize>> = (0..right.num_sequences())
        .map(|k| right.residue_columns(k))
        .collect();

    // matrices[a][b] has rows over residues of left row a
    let mut matrices: Vec<Vec<(&M, f32)>> = Vec::with_capacity(left.num_sequences());
    for &id_a in left.ids() {
        let mut row = Vec::with_capacity(right.num_sequences());
        for &id_b in right.ids() {
            let matrix = store.get(id_a, id_b).ok_or_else(|| {
                MsaError::stage("construction", format!("no matrix for pair ({}, {})", id_a, id_b))
            })?;
            row.push((matrix, weights[id_a] * weights[id_b]));
        }
        matrices.push(row);
    }

    // residue number (1-based) of each left row at each column, 0 for gaps
    let numbering: Vec<Vec<u32>> = left.rows().iter().map(|row| residue_numbers(row)).collect();

    let mut scores = vec![0.0f32; (left.len() + 1) * width];
    scores
        .par_chunks_mut(width)
        .enumerate()
        .skip(1)
        .for_each(|(i, out)| {
            for (a, numbers) in numbering.iter().enumerate() {
                let ra = numbers[i - 1] as usize;
                if ra == 0 {
                    continue;
                }
                for (&(matrix, w), cols_b) in matrices[a].iter().zip(&right_columns) {
                    for &(rb, p) in matrix.row(ra) {
                        out[cols_b[rb as usize - 1] + 1] += w * p;
                    }
                }
            }
        });
    Ok(scores)
}

/// Residue number (from 1) at every column of a gapped row, 0 at gaps.
pub(crate) fn residue_numbers(row: &[u8]) -> Vec<u32> {
    let mut next = 0u32;
    row.iter()
        .map(|&c| {
            if c == GAP {
                0
            } else {
                next += 1;
                next
            }
        })
        .collect()
}

/// Merge two profiles into one alignment; rows of `left` come first.
pub(crate) fn align_profiles<M: PosteriorMatrix>(
    left: &Alignment,
    right: &Alignment,
    weights: &[f32],
    store: &PairStore<M>,
) -> Result<Alignment> {
    let scores = profile_scores(left, right, weights, store)?;
    let (n, m) = (left.len(), right.len());
    let width = m + 1;

    // 0 = diagonal, 1 = column of left against gaps, 2 = column of right against gaps
    let mut dp = vec![0.0f32; (n + 1) * width];
    let mut trace = vec![0u8; (n + 1) * width];
    for i in 1..=n {
        trace[i * width] = 1;
    }
    for j in 1..=m {
        trace[j] = 2;
    }
    for i in 1..=n {
        for j in 1..=m {
            let cur = i * width + j;
            let diag = dp[cur - width - 1] + scores[cur];
            let up = dp[cur - width];
            let left_move = dp[cur - 1];
            let (best, step) = if diag >= up && diag >= left_move {
                (diag, 0)
            } else if up >= left_move {
                (up, 1)
            } else {
                (left_move, 2)
            };
            dp[cur] = best;
            trace[cur] = step;
        }
    }

    let mut path = Vec::with_capacity(n + m);
    let (mut i, mut j) = (n, m);
    while i > 0 || j > 0 {
        let step = trace[i * width + j];
        path.push(step);
        match step {
            0 => {
                i -= 1;
                j -= 1;
            }
            1 => i -= 1,
            _ => j -= 1,
        }
    }
    path.reverse();

    let mut rows: Vec<Vec<u8>> = vec![Vec::with_capacity(path.len()); left.num_sequences() + right.num_sequences()];
    let (mut ci, mut cj) = (0usize, 0usize);
    for step in path {
        let take_left = step != 2;
        let take_right = step != 1;
        for (k, row) in rows.iter_mut().enumerate() {
            let symbol = if k < left.num_sequences() {
                if take_left { left.row(k)[ci] } else { GAP }
            } else if take_right {
                right.row(k - left.num_sequences())[cj]
            } else {
                GAP
            };
            row.push(symbol);
        }
        ci += take_left as usize;
        cj += take_right as usize;
    }

    let names = left.names().iter().chain(right.names()).cloned().collect();
    let ids = left.ids().iter().chain(right.ids()).copied().collect();
    Ok(Alignment::new(names, ids, rows))
}

/// Single-row alignment of sequence `id`.
pub(crate) fn singleton(set: &SequenceSet, id: usize) -> Alignment {
    let seq = set.get(id);
    Alignment::new(vec![seq.name.clone()], vec![id], vec![seq.residues.clone()])
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct ProgressiveConstruction {
    stats: Statistics,
}

impl ProgressiveConstruction {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<M: PosteriorMatrix> ConstructionStage<M> for ProgressiveConstruction {
    fn run(
        &mut self,
        weights: &[f32],
        _distances: &DMatrix<f32>,
        tree: &GuideTree,
        set: &SequenceSet,
        store: &PairStore<M>,
        model: &ProbabilisticModel,
    ) -> Result<Alignment> {
        let start = Instant::now();
        let pool = model_pool(model, "construction")?;
        info!(
            "Progressive alignment of {} sequences on {} threads",
            set.len(),
            model.num_threads()
        );

        let mut profiles: Vec<Option<Alignment>> = vec![None; tree.nodes().len()];
        for (node, tree_node) in tree.nodes().iter().enumerate() {
            if let Some(leaf) = tree_node.leaf {
                profiles[node] = Some(singleton(set, leaf));
            }
        }

        let merges = tree.merge_order();
        for &(node, left, right) in &merges {
            let missing = || MsaError::stage("construction", format!("subtree {} aligned twice", node));
            let a = profiles[left].take().ok_or_else(missing)?;
            let b = profiles[right].take().ok_or_else(missing)?;
            let merged = pool.install(|| align_profiles(&a, &b, weights, store))?;
            debug!("Merged node {} ({} sequences, {} columns)", node, merged.num_sequences(), merged.len());
            profiles[node] = Some(merged);
        }

        let root = profiles[tree.root()]
            .take()
            .ok_or_else(|| MsaError::stage("construction", "guide tree root was not aligned"))?;

        self.stats.write("construction.merges", merges.len() as f64);
        self.stats.write("time.4.1-construction", start.elapsed().as_secs_f64());
        Ok(root.sorted_by_id())
    }

    fn stats(&self) -> &Statistics {
        &self.stats
    }
}
