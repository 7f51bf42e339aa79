use super::ConsistencyStage;
use crate::error::{MsaError, Result};
use crate::hardware::AcceleratorContext;
use crate::selectivity::DistanceScale;
use crate::sequence::SequenceSet;
use crate::sparse::{Cell, PairStore, PosteriorMatrix, POSTERIOR_CUTOFF};
use crate::stats::Statistics;
use log::{debug, info};
use nalgebra::DMatrix;
use rayon::prelude::*;
use std::time::Instant;

/// Contributions with a smaller factor are skipped.
const MIN_CONTRIBUTION: f32 = 1e-6;

/// New forward rows of the pair `x < y` after one consistency pass.
///
/// `P'xy = ((wx + wy) Pxy + Σz ωz Pxz Pzy) / ((wx + wy) + Σz ωz)` where
/// `ωz = wz · rel(d[x][z]) · rel(d[z][y])`, with `rel` read on `scale`.
fn transform_pair<M: PosteriorMatrix>(
    store: &PairStore<M>,
    weights: &[f32],
    distances: &DMatrix<f32>,
    scale: DistanceScale,
    x: usize,
    y: usize,
) -> Result<Vec<Vec<Cell>>> {
    let missing = |i: usize, j: usize| MsaError::stage("consistency", format!("no matrix for pair ({}, {})", i, j));
    let pxy = store.get(x, y).ok_or_else(|| missing(x, y))?;
    let (len_x, len_y) = (pxy.seq1_len(), pxy.seq2_len());
    let width = len_y + 1;

    let self_weight = weights[x] + weights[y];
    let mut total = self_weight;
    let mut acc = vec![0.0f32; (len_x + 1) * width];
    for i in 1..=len_x {
        for &(j, p) in pxy.row(i) {
            acc[i * width + j as usize] = self_weight * p;
        }
    }

    for z in 0..store.num_seqs() {
        if z == x || z == y {
            continue;
        }
        let omega = weights[z] * scale.relevance(distances[(x, z)]) * scale.relevance(distances[(z, y)]);
        if omega < MIN_CONTRIBUTION {
            continue;
        }
        let pxz = store.get(x, z).ok_or_else(|| missing(x, z))?;
        let pzy = store.get(z, y).ok_or_else(|| missing(z, y))?;
        total += omega;
        for i in 1..=len_x {
            let out = &mut acc[i * width..(i + 1) * width];
            for &(k, p1) in pxz.row(i) {
                let scaled = omega * p1;
                for &(j, p2) in pzy.row(k as usize) {
                    out[j as usize] += scaled * p2;
                }
            }
        }
    }

    let mut rows: Vec<Vec<Cell>> = vec![Vec::new(); len_x + 1];
    for (i, row) in rows.iter_mut().enumerate().skip(1) {
        for j in 1..=len_y {
            let p = acc[i * width + j] / total;
            if p >= POSTERIOR_CUTOFF {
                row.push((j as u32, p));
            }
        }
    }
    Ok(rows)
}

fn apply<M: PosteriorMatrix>(
    store: &mut PairStore<M>,
    updates: Vec<((usize, usize), Result<Vec<Vec<Cell>>>)>,
) -> Result<()> {
    for ((a, b), rows) in updates {
        store.update(a, b, rows?)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// CPU
// ---------------------------------------------------------------------------

/// Weighted selective consistency, repeated for a fixed number of passes.
pub struct CpuConsistencyStage {
    iterations: usize,
    scale: DistanceScale,
    stats: Statistics,
}

impl CpuConsistencyStage {
    pub fn new(iterations: usize) -> Self {
        CpuConsistencyStage {
            iterations,
            scale: DistanceScale::Distance,
            stats: Statistics::new(),
        }
    }

    pub fn with_scale(mut self, scale: DistanceScale) -> Self {
        self.scale = scale;
        self
    }
}

impl<M: PosteriorMatrix> ConsistencyStage<M> for CpuConsistencyStage {
    fn run(
        &mut self,
        weights: &[f32],
        set: &SequenceSet,
        distances: &DMatrix<f32>,
        store: &mut PairStore<M>,
    ) -> Result<()> {
        let start = Instant::now();
        let pairs = store.pairs();
        info!(
            "Consistency: {} passes over {} pairs of {} sequences",
            self.iterations,
            pairs.len(),
            set.len()
        );

        for pass in 0..self.iterations {
            let snapshot: &PairStore<M> = store;
            let updates: Vec<_> = pairs
                .par_iter()
                .map(|&(a, b)| ((a, b), transform_pair(snapshot, weights, distances, self.scale, a, b)))
                .collect();
            apply(store, updates)?;
            debug!("Consistency pass {} done", pass + 1);
        }

        self.stats.write("time.3-consistency", start.elapsed().as_secs_f64());
        Ok(())
    }

    fn stats(&self) -> &Statistics {
        &self.stats
    }
}

// ---------------------------------------------------------------------------
// Accelerator
// ---------------------------------------------------------------------------

pub struct AcceleratedConsistencyStage {
    context: AcceleratorContext,
    iterations: usize,
    scale: DistanceScale,
    stats: Statistics,
}

impl AcceleratedConsistencyStage {
    pub fn new(iterations: usize, context: AcceleratorContext) -> Self {
        AcceleratedConsistencyStage {
            context,
            iterations,
            scale: DistanceScale::Distance,
            stats: Statistics::new(),
        }
    }

    pub fn with_scale(mut self, scale: DistanceScale) -> Self {
        self.scale = scale;
        self
    }
}

impl<M: PosteriorMatrix> ConsistencyStage<M> for AcceleratedConsistencyStage {
    fn run(
        &mut self,
        weights: &[f32],
        set: &SequenceSet,
        distances: &DMatrix<f32>,
        store: &mut PairStore<M>,
    ) -> Result<()> {
        let start = Instant::now();
        let pairs = store.pairs();
        info!(
            "Consistency on {}: {} passes over {} pairs of {} sequences",
            self.context.name(),
            self.iterations,
            pairs.len(),
            set.len()
        );

        for _ in 0..self.iterations {
            let snapshot: &PairStore<M> = store;
            let mut updates = Vec::with_capacity(pairs.len());
            for batch in pairs.chunks(self.context.batch_size()) {
                let computed: Vec<_> = self.context.launch(|| {
                    batch
                        .par_iter()
                        .map(|&(a, b)| ((a, b), transform_pair(snapshot, weights, distances, self.scale, a, b)))
                        .collect()
                });
                updates.extend(computed);
            }
            apply(store, updates)?;
        }

        self.stats.write("time.3-consistency", start.elapsed().as_secs_f64());
        Ok(())
    }

    fn stats(&self) -> &Statistics {
        &self.stats
    }
}
