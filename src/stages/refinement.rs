use super::construction::{align_profiles, model_pool, residue_numbers};
use super::{IterationObserver, RefinementStage};
use crate::alignment::{Alignment, GAP};
use crate::config::RefinementType;
use crate::error::Result;
use crate::model::ProbabilisticModel;
use crate::sparse::{PairStore, PosteriorMatrix};
use crate::stats::Statistics;
use crate::tree::GuideTree;
use log::{debug, info};
use nalgebra::DMatrix;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use std::time::Instant;

/// Weighted sum-of-pairs of the posterior probabilities of every aligned residue pair.
pub fn objective<M: PosteriorMatrix>(alignment: &Alignment, weights: &[f32], store: &PairStore<M>) -> f64 {
    let k = alignment.num_sequences();
    let numbering: Vec<Vec<u32>> = alignment.rows().iter().map(|row| residue_numbers(row)).collect();

    let per_row: Vec<f64> = (0..k)
        .into_par_iter()
        .map(|a| {
            let mut sum = 0.0f64;
            for b in (a + 1)..k {
                let (id_a, id_b) = (alignment.ids()[a], alignment.ids()[b]);
                let Some(matrix) = store.get(id_a, id_b) else { continue };
                let w = (weights[id_a] * weights[id_b]) as f64;
                let pair: f64 = numbering[a]
                    .iter()
                    .zip(&numbering[b])
                    .filter(|&(&ra, &rb)| ra > 0 && rb > 0)
                    .map(|(&ra, &rb)| matrix.get(ra as usize, rb as usize) as f64)
                    .sum();
                sum += w * pair;
            }
            sum
        })
        .collect();
    per_row.iter().sum()
}

/// Iterative realignment of two groups of rows.
///
/// Each iteration splits the rows, projects both groups, realigns the two
/// profiles and keeps the result unless the objective drops.
pub struct IterativeRefinement {
    kind: RefinementType,
    iterations: usize,
    rng: ChaCha8Rng,
    stats: Statistics,
}

impl IterativeRefinement {
    pub fn new(kind: RefinementType, iterations: usize, seed: u64) -> Self {
        IterativeRefinement {
            kind,
            iterations,
            rng: ChaCha8Rng::seed_from_u64(seed),
            stats: Statistics::new(),
        }
    }

    pub fn kind(&self) -> RefinementType {
        self.kind
    }

    /// Row positions of the first group, or `None` if the draw gives no proper split.
    fn split(&mut self, alignment: &Alignment, tree: &GuideTree) -> Option<Vec<usize>> {
        let k = alignment.num_sequences();
        let group: Vec<usize> = match self.kind {
            RefinementType::Column => {
                let col = self.rng.gen_range(0..alignment.len());
                (0..k).filter(|&r| alignment.row(r)[col] == GAP).collect()
            }
            RefinementType::Tree => {
                let edges = tree.edges();
                let edge = edges[self.rng.gen_range(0..edges.len())];
                let leaves = tree.leaves_under(edge);
                (0..k)
                    .filter(|&r| leaves.binary_search(&alignment.ids()[r]).is_ok())
                    .collect()
            }
            RefinementType::Random => {
                let mut group: Vec<usize> = (0..k).filter(|_| self.rng.gen_bool(0.5)).collect();
                if group.is_empty() || group.len() == k {
                    group = vec![self.rng.gen_range(0..k)];
                }
                group
            }
        };
        if group.is_empty() || group.len() == k {
            None
        } else {
            Some(group)
        }
    }
}

impl<M: PosteriorMatrix> RefinementStage<M> for IterativeRefinement {
    fn run(
        &mut self,
        tree: &GuideTree,
        weights: &[f32],
        _distances: &DMatrix<f32>,
        store: &PairStore<M>,
        model: &ProbabilisticModel,
        alignment: Alignment,
        observer: &mut IterationObserver<'_>,
    ) -> Result<Alignment> {
        let start = Instant::now();
        let mut current = alignment;
        if current.num_sequences() < 2 || current.is_empty() || self.iterations == 0 {
            self.stats.write("refinement.iterations", 0u32);
            return Ok(current);
        }

        let pool = model_pool(model, "refinement")?;
        info!(
            "Refinement ({:?}): {} iterations on {} threads",
            self.kind,
            self.iterations,
            model.num_threads()
        );

        let mut score = pool.install(|| objective(&current, weights, store));
        let mut accepted = 0usize;
        for iteration in 1..=self.iterations {
            if let Some(group) = self.split(&current, tree) {
                let rest: Vec<usize> = (0..current.num_sequences())
                    .filter(|r| !group.contains(r))
                    .collect();
                let left = current.project(&group);
                let right = current.project(&rest);
                let candidate = pool
                    .install(|| align_profiles(&left, &right, weights, store))?
                    .sorted_by_id();
                let candidate_score = pool.install(|| objective(&candidate, weights, store));
                if candidate_score >= score {
                    if candidate != current {
                        accepted += 1;
                    }
                    current = candidate;
                    score = candidate_score;
                }
            }
            debug!("Refinement iteration {}: objective {:.4}", iteration, score);
            observer(&current, iteration);
        }

        self.stats.write("refinement.iterations", self.iterations as f64);
        self.stats.write("refinement.accepted", accepted as f64);
        self.stats.write("refinement.objective", score);
        self.stats.write("time.4.2-refinement", start.elapsed().as_secs_f64());
        Ok(current)
    }

    fn stats(&self) -> &Statistics {
        &self.stats
    }
}
