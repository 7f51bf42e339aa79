use super::PosteriorStage;
use crate::config::ModelKind;
use crate::error::Result;
use crate::hardware::AcceleratorContext;
use crate::model::{expected_accuracy, ProbabilisticModel};
use crate::sequence::SequenceSet;
use crate::sparse::{FromPosterior, PairStore, POSTERIOR_CUTOFF};
use crate::stats::Statistics;
use log::{debug, info};
use nalgebra::DMatrix;
use rayon::prelude::*;
use std::time::Instant;

/// Result of aligning one pair: its distance and both orientations of the posterior.
struct PairPosterior<M> {
    a: usize,
    b: usize,
    distance: f32,
    forward: M,
    reverse: M,
}

fn compute_pair<M: FromPosterior>(
    model: &ProbabilisticModel,
    set: &SequenceSet,
    a: usize,
    b: usize,
    fast_math: bool,
) -> PairPosterior<M> {
    let x = &set.get(a).residues;
    let y = &set.get(b).residues;
    let dense = model.posterior(x, y, fast_math);
    let distance = (1.0 - expected_accuracy(&dense, x.len(), y.len())).clamp(0.0, 1.0);
    let forward = M::from_posterior(&dense, x.len(), y.len(), POSTERIOR_CUTOFF);
    let reverse = forward.transposed();
    PairPosterior {
        a,
        b,
        distance,
        forward,
        reverse,
    }
}

fn collect<M>(n: usize, results: Vec<PairPosterior<M>>) -> (DMatrix<f32>, PairStore<M>)
where
    M: FromPosterior,
{
    let mut distances = DMatrix::<f32>::zeros(n, n);
    let mut store = PairStore::new(n);
    for pair in results {
        distances[(pair.a, pair.b)] = pair.distance;
        distances[(pair.b, pair.a)] = pair.distance;
        store.insert(pair.a, pair.b, pair.forward, pair.reverse);
    }
    (distances, store)
}

// ---------------------------------------------------------------------------
// CPU
// ---------------------------------------------------------------------------

/// Forward-backward over every pair on the current rayon pool.
pub struct CpuPosteriorStage {
    model: ProbabilisticModel,
    stats: Statistics,
}

impl CpuPosteriorStage {
    pub fn new(kind: ModelKind) -> Self {
        CpuPosteriorStage {
            model: ProbabilisticModel::new(kind),
            stats: Statistics::new(),
        }
    }
}

impl<M: FromPosterior> PosteriorStage<M> for CpuPosteriorStage {
    fn run(&mut self, set: &SequenceSet) -> Result<(DMatrix<f32>, PairStore<M>)> {
        let start = Instant::now();
        set.validate()?;
        let n = set.len();
        let pairs: Vec<(usize, usize)> = PairStore::<M>::new(n).pairs();
        info!("Computing posteriors for {} pairs", pairs.len());

        let model = &self.model;
        let results: Vec<PairPosterior<M>> = pairs
            .par_iter()
            .map(|&(a, b)| compute_pair(model, set, a, b, false))
            .collect();

        let (distances, store) = collect(n, results);
        self.stats.write("time.1-posterior", start.elapsed().as_secs_f64());
        debug!("Posterior stage stored {} matrices", store.num_matrices());
        Ok((distances, store))
    }

    fn model(&self) -> &ProbabilisticModel {
        &self.model
    }

    fn stats(&self) -> &Statistics {
        &self.stats
    }
}

// ---------------------------------------------------------------------------
// Accelerator
// ---------------------------------------------------------------------------

/// Same kernels, launched on the accelerator context in batches of pairs.
pub struct AcceleratedPosteriorStage {
    context: AcceleratorContext,
    model: ProbabilisticModel,
    stats: Statistics,
}

impl AcceleratedPosteriorStage {
    pub fn new(kind: ModelKind, context: AcceleratorContext) -> Self {
        AcceleratedPosteriorStage {
            context,
            model: ProbabilisticModel::new(kind),
            stats: Statistics::new(),
        }
    }
}

impl<M: FromPosterior> PosteriorStage<M> for AcceleratedPosteriorStage {
    fn run(&mut self, set: &SequenceSet) -> Result<(DMatrix<f32>, PairStore<M>)> {
        let start = Instant::now();
        set.validate()?;
        let n = set.len();
        let pairs: Vec<(usize, usize)> = PairStore::<M>::new(n).pairs();
        let fast_math = self.context.fast_math();
        info!(
            "Computing posteriors for {} pairs on {} ({} workers, batch {}, fast math {})",
            pairs.len(),
            self.context.name(),
            self.context.num_workers(),
            self.context.batch_size(),
            fast_math
        );

        let model = &self.model;
        let mut results: Vec<PairPosterior<M>> = Vec::with_capacity(pairs.len());
        let mut batches = 0usize;
        for batch in pairs.chunks(self.context.batch_size()) {
            let computed: Vec<PairPosterior<M>> = self.context.launch(|| {
                batch
                    .par_iter()
                    .map(|&(a, b)| compute_pair(model, set, a, b, fast_math))
                    .collect()
            });
            results.extend(computed);
            batches += 1;
        }

        let (distances, store) = collect(n, results);
        self.stats.write("time.1-posterior", start.elapsed().as_secs_f64());
        self.stats.write("posterior.batches", batches as f64);
        Ok((distances, store))
    }

    fn model(&self) -> &ProbabilisticModel {
        &self.model
    }

    fn stats(&self) -> &Statistics {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MsaError;
    use crate::sequence::Sequence;
    use crate::sparse::{PosteriorMatrix, SparseMatrix};

    fn sample() -> SequenceSet {
        SequenceSet::new(vec![
            Sequence::new("a", b"MKVLAAGIVG"),
            Sequence::new("b", b"MKVLAAGIVG"),
            Sequence::new("c", b"WWPPHHCCQE"),
        ])
    }

    #[test]
    fn test_cpu_posterior_distances() {
        let mut stage = CpuPosteriorStage::new(ModelKind::Protein);
        let (d, store): (DMatrix<f32>, PairStore<SparseMatrix>) = stage.run(&sample()).unwrap();
        assert_eq!(d[(0, 0)], 0.0);
        assert_eq!(d[(0, 1)], d[(1, 0)]);
        assert!(d[(0, 1)] < d[(0, 2)]);
        assert_eq!(store.num_matrices(), 6);
        assert_eq!(store.get(2, 1).unwrap().seq1_len(), 10);
        assert!(PosteriorStage::<SparseMatrix>::stats(&stage).get("time.1-posterior").is_some());
    }

    #[test]
    fn test_accelerated_matches_cpu_with_precise_math() {
        let mut context = AcceleratorContext::new("test", 2).unwrap().with_batch_size(1);
        context.set_fast_math(false);
        let mut accel = AcceleratedPosteriorStage::new(ModelKind::Protein, context);
        let mut cpu = CpuPosteriorStage::new(ModelKind::Protein);
        let (d1, _): (DMatrix<f32>, PairStore<SparseMatrix>) = accel.run(&sample()).unwrap();
        let (d2, _): (DMatrix<f32>, PairStore<SparseMatrix>) = cpu.run(&sample()).unwrap();
        assert_eq!(d1, d2);
        assert_eq!(
            PosteriorStage::<SparseMatrix>::stats(&accel).get("posterior.batches"),
            Some(3.0)
        );
    }

    #[test]
    fn test_empty_set_is_rejected() {
        let mut stage = CpuPosteriorStage::new(ModelKind::Nucleotide);
        let result: Result<(DMatrix<f32>, PairStore<SparseMatrix>)> =
            stage.run(&SequenceSet::new(Vec::new()));
        assert!(matches!(result, Err(MsaError::EmptyInput)));
    }
}
