//! Consistency distances: which pairs contribute third-party evidence, and how
//! strongly.
//!
//! The consistency stage reads the matrix produced here through a
//! [`DistanceScale`]. Plain and stochastic matrices are distances, where
//! smaller values mean more relevant pairs and `+inf` marks pairs that must not
//! contribute. Ranked matrices give rank 1 to the largest distance, so their
//! values grow with closeness.

use crate::config::{SelectivityMode, SelectivityNormalization};
use crate::stats::Statistics;
use crate::tree::GuideTree;
use log::{debug, info};
use nalgebra::DMatrix;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Number of buckets of the verbose distance histogram.
const HISTOGRAM_BUCKETS: usize = 10;

/// How the consistency stage reads a normalized consistency matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistanceScale {
    /// Smaller is closer.
    #[default]
    Distance,
    /// Larger is closer, as produced by the ranked normalizations.
    Closeness,
}

impl DistanceScale {
    pub fn of(normalization: SelectivityNormalization) -> Self {
        match normalization {
            SelectivityNormalization::None | SelectivityNormalization::Stochastic => DistanceScale::Distance,
            SelectivityNormalization::RankedStochastic | SelectivityNormalization::RankedRowStochastic => {
                DistanceScale::Closeness
            }
        }
    }

    /// Relevance of a pair from its consistency value. Non-finite values never count.
    #[inline]
    pub fn relevance(self, value: f32) -> f32 {
        if !value.is_finite() {
            return 0.0;
        }
        match self {
            DistanceScale::Distance => 1.0 / (1.0 + value.max(0.0)),
            DistanceScale::Closeness => value.max(0.0),
        }
    }
}

/// Replace `distances` with an arbitrary total order of evenly spaced values.
///
/// Indices are shuffled; walking the shuffled order, every pair `(q, r)` with
/// `r < q` gets the next multiple of `step = 1 / (n² / 2)`. Everything starts
/// at 1.0 and the diagonal ends at 0.
pub fn degenerate_distances(distances: &mut DMatrix<f32>, seed: u64) {
    let n = distances.nrows();
    if n == 0 {
        return;
    }
    let step = 1.0f32 / ((n * n / 2).max(1) as f32);
    let mut d = step;

    let mut indices: Vec<usize> = (0..n).collect();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    indices.shuffle(&mut rng);

    distances.fill(1.0);
    for q in 0..n {
        let i = indices[q];
        for &j in &indices[..q] {
            distances[(i, j)] = d;
            distances[(j, i)] = d;
            d += step;
        }
    }
    distances.fill_diagonal(0.0);
    info!("Degenerated distances of {} sequences (step {})", n, step);
}

/// Consistency distances for `mode`, before normalization.
pub fn derive_consistency_distances(
    mode: SelectivityMode,
    distances: &DMatrix<f32>,
    tree: &GuideTree,
    selectivity: usize,
    seed: u64,
) -> DMatrix<f32> {
    match mode {
        SelectivityMode::Subtree => tree.subtree_distances(),
        SelectivityMode::Seed => seed_distances(distances.nrows(), selectivity, seed),
        SelectivityMode::Similarity | SelectivityMode::All => distances.clone(),
    }
}

/// All pairs at `+inf` except the rows and columns of `count` seeds drawn with
/// replacement, which are set to 0.
pub fn seed_distances(n: usize, count: usize, seed: u64) -> DMatrix<f32> {
    let mut out = DMatrix::<f32>::from_element(n, n, f32::INFINITY);
    if n == 0 {
        return out;
    }
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let seeds: Vec<usize> = (0..count).map(|_| rng.gen_range(0..n)).collect();
    debug!("Consistency seeds: {:?}", seeds);
    for &s in &seeds {
        out.row_mut(s).fill(0.0);
        out.column_mut(s).fill(0.0);
    }
    out
}

pub fn normalize(distances: &mut DMatrix<f32>, normalization: SelectivityNormalization) {
    let n = distances.nrows();
    match normalization {
        SelectivityNormalization::None => {}
        SelectivityNormalization::Stochastic => {
            // Non-finite sentinels do not take part and stay as they are.
            let max = distances
                .iter()
                .copied()
                .filter(|x| x.is_finite())
                .fold(f32::NEG_INFINITY, f32::max);
            if max > 1.0 {
                distances
                    .iter_mut()
                    .filter(|x| x.is_finite())
                    .for_each(|x| *x /= max);
                debug!("Scaled consistency distances by 1/{}", max);
            }
        }
        SelectivityNormalization::RankedStochastic => {
            distances.fill_diagonal(f32::MAX);
            let values: Vec<f32> = row_major(distances);
            let ranks = descending_ranks(&values);
            let scale = (n * (n - 1)).max(1) as f32;
            for i in 0..n {
                for j in 0..n {
                    distances[(i, j)] = ranks[i * n + j] as f32 / scale;
                }
            }
        }
        SelectivityNormalization::RankedRowStochastic => {
            distances.fill_diagonal(f32::MAX);
            for i in 0..n {
                let values: Vec<f32> = distances.row(i).iter().copied().collect();
                let ranks = descending_ranks(&values);
                for (j, rank) in ranks.into_iter().enumerate() {
                    distances[(i, j)] = rank as f32 / n as f32;
                }
            }
            // row ranks differ between mirrors; both take their mean
            for i in 0..n {
                for j in (i + 1)..n {
                    let mean = 0.5 * (distances[(i, j)] + distances[(j, i)]);
                    distances[(i, j)] = mean;
                    distances[(j, i)] = mean;
                }
            }
        }
    }
}

fn row_major(m: &DMatrix<f32>) -> Vec<f32> {
    let n = m.nrows();
    let mut out = Vec::with_capacity(n * m.ncols());
    for i in 0..n {
        out.extend(m.row(i).iter().copied());
    }
    out
}

/// Rank 1 for the largest value; equal values share the best rank of their group.
fn descending_ranks(values: &[f32]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[b].total_cmp(&values[a]));

    let mut ranks = vec![0usize; values.len()];
    let mut rank = 1;
    for (pos, &idx) in order.iter().enumerate() {
        if pos > 0 && values[idx] != values[order[pos - 1]] {
            rank = pos + 1;
        }
        ranks[idx] = rank;
    }
    ranks
}

/// Copy of `weights` with every element raised to at least `floor`.
pub fn saturate_weights(weights: &[f32], floor: f32) -> Vec<f32> {
    weights.iter().map(|&w| w.max(floor)).collect()
}

/// Upper-triangle histogram of `distances` over ten buckets of width 0.1.
///
/// A value goes into the first bucket whose upper border it does not exceed;
/// values above 1 are not counted.
pub fn distance_histogram(distances: &DMatrix<f32>) -> Statistics {
    let step = 1.0f32 / HISTOGRAM_BUCKETS as f32;
    let mut borders = vec![step; HISTOGRAM_BUCKETS];
    for i in 1..HISTOGRAM_BUCKETS {
        borders[i] = borders[i - 1] + step;
    }

    let mut histo = vec![0u32; HISTOGRAM_BUCKETS];
    let n = distances.nrows();
    for y in 0..n {
        for x in (y + 1)..n {
            let d = distances[(y, x)];
            if let Some(bucket) = borders.iter().position(|&b| d <= b) {
                histo[bucket] += 1;
            }
        }
    }

    let mut stats = Statistics::new();
    for (border, count) in borders.iter().zip(histo) {
        stats.write(format!("histo.distances_{:.6}", border), count);
    }
    stats
}
