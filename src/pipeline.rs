//! Orchestration of a full alignment run.
//!
//! Stages run strictly in order: posterior, tree, consistency distances,
//! consistency, construction, refinement, then release of the pairwise
//! matrices. Every failure is fatal except checkpoint writes.

use crate::alignment::Alignment;
use crate::annotation::Annotation;
use crate::config::{Configuration, TreeKind};
use crate::error::{MsaError, Result};
use crate::hardware::{resolve_num_threads, resolve_reference_threads, AcceleratorContext};
use crate::selectivity::{
    derive_consistency_distances, distance_histogram, normalize, saturate_weights, DistanceScale,
};
use crate::sequence::SequenceSet;
use crate::sparse::{FromPosterior, SparseMatrix};
use crate::stages::{
    AcceleratedConsistencyStage, AcceleratedPosteriorStage, ConsistencyStage, ConstructionStage,
    CpuConsistencyStage, CpuPosteriorStage, IterativeRefinement, PosteriorStage, ProgressiveConstruction,
    RefinementStage,
};
use crate::stats::{peak_memory_bytes, Statistics};
use crate::tree::PendingTree;
use log::{debug, info, warn};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::Instant;

/// Everything a run produces.
#[derive(Debug)]
pub struct PipelineOutput {
    pub alignment: Alignment,
    pub annotation: Option<Annotation>,
    pub stats: Statistics,
}

/// Checkpoint file for refinement iteration `iteration`.
pub fn checkpoint_path(output: &str, iteration: usize) -> PathBuf {
    PathBuf::from(format!("{}_r{}", output, iteration))
}

/// Write a checkpoint when `iteration` is a multiple of the autosave interval.
/// Failures are logged and otherwise ignored.
pub fn autosave(config: &Configuration, alignment: &Alignment, iteration: usize) {
    if !config.autosave_enabled() || iteration % config.algorithm.refinement.autosave as usize != 0 {
        return;
    }
    let path = checkpoint_path(&config.io.output, iteration);
    let result = File::create(&path).and_then(|file| {
        let mut writer = BufWriter::new(file);
        alignment.write_mfa(&mut writer)?;
        writer.flush()
    });
    match result {
        Ok(()) => debug!("Saved checkpoint {:?}", path),
        Err(e) => warn!("Could not write checkpoint {:?}: {}", path, e),
    }
}

/// The aligner. Stage variants are chosen once, when the pipeline is created.
pub struct MsaPipeline<M = SparseMatrix> {
    config: Configuration,
    num_threads: usize,
    reference_threads: usize,
    pool: ThreadPool,
    posterior: Box<dyn PosteriorStage<M>>,
    consistency: Box<dyn ConsistencyStage<M>>,
    construction: Box<dyn ConstructionStage<M>>,
    refinement: Box<dyn RefinementStage<M>>,
    stats: Statistics,
}

impl<M: FromPosterior + 'static> MsaPipeline<M> {
    /// Pipeline with the built-in stages; accelerator-backed posterior and
    /// consistency stages when `accelerator` is given.
    pub fn new(config: Configuration, accelerator: Option<AcceleratorContext>) -> Result<Self> {
        let start = Instant::now();
        let consistency_iterations = config.algorithm.consistency.iterations;
        let scale = DistanceScale::of(config.algorithm.consistency.normalization);

        let (posterior, consistency): (Box<dyn PosteriorStage<M>>, Box<dyn ConsistencyStage<M>>) =
            match accelerator {
                Some(mut context) => {
                    context.set_fast_math(!config.optimisation.use_precise_math);
                    info!("Using accelerator context {:?}", context);
                    (
                        Box::new(AcceleratedPosteriorStage::new(config.algorithm.model, context.clone())),
                        Box::new(
                            AcceleratedConsistencyStage::new(consistency_iterations, context).with_scale(scale),
                        ),
                    )
                }
                None => {
                    info!("Using CPU stages");
                    (
                        Box::new(CpuPosteriorStage::new(config.algorithm.model)),
                        Box::new(CpuConsistencyStage::new(consistency_iterations).with_scale(scale)),
                    )
                }
            };
        let refinement = IterativeRefinement::new(
            config.algorithm.refinement.kind,
            config.algorithm.refinement.iterations,
            config.algorithm.random_seed,
        );

        let mut pipeline = Self::with_stages(
            config,
            posterior,
            consistency,
            Box::new(ProgressiveConstruction::new()),
            Box::new(refinement),
        )?;
        pipeline
            .stats
            .write("time.0.1-initialisation", start.elapsed().as_secs_f64());
        Ok(pipeline)
    }
}

impl<M: FromPosterior> MsaPipeline<M> {
    pub fn with_stages(
        config: Configuration,
        posterior: Box<dyn PosteriorStage<M>>,
        consistency: Box<dyn ConsistencyStage<M>>,
        construction: Box<dyn ConstructionStage<M>>,
        refinement: Box<dyn RefinementStage<M>>,
    ) -> Result<Self> {
        let num_threads = resolve_num_threads(config.hardware.num_threads);
        let reference_threads = resolve_reference_threads(config.hardware.ref_num_threads, num_threads);
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()
            .map_err(|e| MsaError::InvalidConfig(format!("cannot create thread pool: {}", e)))?;

        Ok(MsaPipeline {
            config,
            num_threads,
            reference_threads,
            pool,
            posterior,
            consistency,
            construction,
            refinement,
            stats: Statistics::new(),
        })
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    pub fn reference_threads(&self) -> usize {
        self.reference_threads
    }

    pub fn stats(&self) -> &Statistics {
        &self.stats
    }

    /// Align `set`. Rows of the result follow the input order.
    pub fn align(&mut self, set: &SequenceSet) -> Result<PipelineOutput> {
        set.validate()?;
        let num_seqs = set.len();

        if num_seqs == 1 {
            info!("Single sequence, nothing to align");
            let seq = set.get(0);
            let alignment = Alignment::new(vec![seq.name.clone()], vec![0], vec![seq.residues.clone()]);
            self.stats.write("zhash", alignment.calculate_hash() as f64);
            return Ok(PipelineOutput {
                alignment,
                annotation: None,
                stats: self.stats.clone(),
            });
        }

        let stages_start = Instant::now();
        let config = &self.config;

        // 1. posterior
        let (mut distances, mut store) = self.pool.install(|| self.posterior.run(set))?;
        info!("Posterior stage finished ({} matrices)", store.num_matrices());
        if config.io.enable_verbose {
            self.stats.join(&distance_histogram(&distances));
        }

        // 2. guide tree
        let newick = match (config.algorithm.tree_kind, config.algorithm.guide_tree.as_ref()) {
            (TreeKind::External, Some(path)) => Some(std::fs::read_to_string(path)?),
            _ => None,
        };
        let tree = PendingTree::select(
            config.algorithm.tree_kind,
            &mut distances,
            &set.names(),
            newick.as_deref(),
            config.algorithm.random_seed,
        )?
        .build()?;

        // 3. consistency distances
        let consistency = &config.algorithm.consistency;
        let mut consistency_distances = derive_consistency_distances(
            consistency.mode,
            &distances,
            &tree,
            consistency.selectivity,
            config.algorithm.random_seed,
        );
        normalize(&mut consistency_distances, consistency.normalization);
        debug!(
            "Consistency distances: mode {:?}, normalization {:?}",
            consistency.mode, consistency.normalization
        );

        // 4. consistency
        let weights = saturate_weights(&tree.weights(), consistency.saturation);
        let consistency_stage = &mut self.consistency;
        self.pool
            .install(|| consistency_stage.run(&weights, set, &consistency_distances, &mut store))?;

        // 5. construction and 6. refinement
        let final_start = Instant::now();
        let weights = saturate_weights(&tree.weights(), config.algorithm.final_saturation);
        let mut model = self.posterior.model().clone();
        model.set_num_threads(self.reference_threads);
        info!("Final alignment uses {} model threads", model.num_threads());

        let alignment = self
            .construction
            .run(&weights, &consistency_distances, &tree, set, &store, &model)?;
        let mut observer = |alignment: &Alignment, iteration: usize| autosave(config, alignment, iteration);
        let alignment = self.refinement.run(
            &tree,
            &weights,
            &consistency_distances,
            &store,
            &model,
            alignment,
            &mut observer,
        )?;
        self.stats
            .write("time.4-final alignment", final_start.elapsed().as_secs_f64());

        // 7. post-processing
        let annotation = config
            .io
            .enable_annotation
            .then(|| Annotation::compute(&alignment, &store));

        info!("Deleting matrices...");
        let delete_start = Instant::now();
        let freed = store.release();
        drop(store);
        self.stats.write("time.5-delete", delete_start.elapsed().as_secs_f64());
        info!("Released {} matrices", freed);

        self.stats
            .write("time.stages-1 to 5", stages_start.elapsed().as_secs_f64());
        self.stats.write(
            "memory.peak allocated MB",
            peak_memory_bytes() as f64 / (1u64 << 20) as f64,
        );

        let dataset = dataset_statistics(set, &tree.weights());
        self.stats.join(&dataset);
        self.stats.join(tree.stats());
        self.stats.join(self.posterior.stats());
        self.stats.join(self.consistency.stats());
        self.stats.join(self.construction.stats());
        self.stats.join(self.refinement.stats());

        let hash = alignment.calculate_hash();
        self.stats.write("zhash", hash as f64);
        debug!("Hash = {}", hash);

        Ok(PipelineOutput {
            alignment,
            annotation,
            stats: self.stats.clone(),
        })
    }
}

/// Sequence count, lengths and tree weights of the input.
pub fn dataset_statistics(set: &SequenceSet, weights: &[f32]) -> Statistics {
    let mut stats = Statistics::new();
    let lengths: Vec<usize> = set.iter().map(|s| s.len()).collect();
    stats.write("dataset.sequences", set.len() as f64);
    if !lengths.is_empty() {
        let total: usize = lengths.iter().sum();
        stats.write("dataset.length.mean", total as f64 / lengths.len() as f64);
        stats.write("dataset.length.max", lengths.iter().copied().max().unwrap_or(0) as f64);
    }
    if !weights.is_empty() {
        let sum: f32 = weights.iter().sum();
        stats.write("dataset.weight.mean", sum / weights.len() as f32);
        stats.write("dataset.weight.min", weights.iter().copied().fold(f32::INFINITY, f32::min));
        stats.write("dataset.weight.max", weights.iter().copied().fold(f32::NEG_INFINITY, f32::max));
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AUTOSAVE_DISABLED;
    use crate::sequence::Sequence;

    #[test]
    fn test_checkpoint_path() {
        assert_eq!(checkpoint_path("out.mfa", 20), PathBuf::from("out.mfa_r20"));
    }

    #[test]
    fn test_autosave_respects_interval() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = Configuration::default();
        config.io.output = dir.path().join("aln").to_string_lossy().into_owned();
        config.algorithm.refinement.autosave = 2;
        let alignment = Alignment::new(vec!["a".into()], vec![0], vec![b"ACGT".to_vec()]);

        autosave(&config, &alignment, 1);
        autosave(&config, &alignment, 2);
        assert!(!checkpoint_path(&config.io.output, 1).exists());
        let saved = std::fs::read_to_string(checkpoint_path(&config.io.output, 2)).unwrap();
        assert_eq!(saved, ">a\nACGT\n");

        config.algorithm.refinement.autosave = AUTOSAVE_DISABLED;
        autosave(&config, &alignment, 4);
        assert!(!checkpoint_path(&config.io.output, 4).exists());
    }

    #[test]
    fn test_autosave_failure_is_not_fatal() {
        let mut config = Configuration::default();
        config.io.output = "/nonexistent-dir/for/checkpoints/aln".to_string();
        config.algorithm.refinement.autosave = 1;
        let alignment = Alignment::new(vec!["a".into()], vec![0], vec![b"ACGT".to_vec()]);
        autosave(&config, &alignment, 1);
    }

    #[test]
    fn test_dataset_statistics() {
        let set = SequenceSet::new(vec![Sequence::new("a", b"ACGT"), Sequence::new("b", b"AC")]);
        let stats = dataset_statistics(&set, &[0.5, 1.5]);
        assert_eq!(stats.get("dataset.sequences"), Some(2.0));
        assert_eq!(stats.get("dataset.length.mean"), Some(3.0));
        assert_eq!(stats.get("dataset.length.max"), Some(4.0));
        assert_eq!(stats.get("dataset.weight.min"), Some(0.5));
        assert_eq!(stats.get("dataset.weight.mean"), Some(1.0));
    }

    #[test]
    fn test_reference_threads_are_derived() {
        let mut config = Configuration::default();
        config.hardware.num_threads = 6;
        let pipeline: MsaPipeline = MsaPipeline::new(config, None).unwrap();
        assert_eq!(pipeline.num_threads(), 6);
        assert_eq!(pipeline.reference_threads(), 3);
        assert!(pipeline.stats().get("time.0.1-initialisation").is_some());
    }
}
