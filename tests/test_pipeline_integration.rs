//! End-to-end runs of the alignment pipeline through the library API.

use nalgebra::DMatrix;
use probmsa::alignment::Alignment;
use probmsa::config::{
    Configuration, ModelKind, RefinementType, SelectivityMode, SelectivityNormalization, TreeKind,
};
use probmsa::error::MsaError;
use probmsa::model::ProbabilisticModel;
use probmsa::pipeline::checkpoint_path;
use probmsa::sequence::{Sequence, SequenceSet};
use probmsa::sparse::{PairStore, SparseMatrix};
use probmsa::stages::{
    ConsistencyStage, ConstructionStage, CpuConsistencyStage, CpuPosteriorStage, IterationObserver,
    IterativeRefinement, PosteriorStage, ProgressiveConstruction, RefinementStage,
};
use probmsa::stats::Statistics;
use probmsa::tree::GuideTree;
use probmsa::MsaPipeline;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

fn sequences() -> SequenceSet {
    SequenceSet::new(vec![
        Sequence::new("alpha", b"ACGTACGTTAGCATCGA"),
        Sequence::new("beta", b"ACGTACGTAGCATCGA"),
        Sequence::new("gamma", b"ACGAACGTTAGCTTCGA"),
        Sequence::new("delta", b"TTGTACGTTAGCATCG"),
        Sequence::new("epsilon", b"ACGTACCTTAGCATCGAA"),
    ])
}

fn nucleotide_config() -> Configuration {
    let mut config = Configuration::default();
    config.hardware.num_threads = 2;
    config.algorithm.model = ModelKind::Nucleotide;
    config.algorithm.refinement.iterations = 5;
    config
}

fn assert_preserves_input(set: &SequenceSet, output: &probmsa::PipelineOutput) {
    let alignment = &output.alignment;
    assert_eq!(alignment.num_sequences(), set.len());
    assert_eq!(alignment.ids(), (0..set.len()).collect::<Vec<_>>().as_slice());
    for k in 0..set.len() {
        assert_eq!(alignment.names()[k], set.get(k).name);
        assert_eq!(alignment.ungapped(k), set.get(k).residues);
    }
}

// ---------------------------------------------------------------------------
// Stage doubles
// ---------------------------------------------------------------------------

/// Real posterior matrices, but a fixed distance matrix.
struct FixedDistances {
    inner: CpuPosteriorStage,
    distances: DMatrix<f32>,
}

impl PosteriorStage<SparseMatrix> for FixedDistances {
    fn run(&mut self, set: &SequenceSet) -> probmsa::Result<(DMatrix<f32>, PairStore<SparseMatrix>)> {
        let (_, store) = self.inner.run(set)?;
        Ok((self.distances.clone(), store))
    }

    fn model(&self) -> &ProbabilisticModel {
        PosteriorStage::<SparseMatrix>::model(&self.inner)
    }

    fn stats(&self) -> &Statistics {
        PosteriorStage::<SparseMatrix>::stats(&self.inner)
    }
}

/// Consistency stage that remembers the distances and weights it was given.
struct Recording {
    inner: CpuConsistencyStage,
    seen: Arc<Mutex<Vec<(Vec<f32>, DMatrix<f32>)>>>,
}

impl ConsistencyStage<SparseMatrix> for Recording {
    fn run(
        &mut self,
        weights: &[f32],
        set: &SequenceSet,
        distances: &DMatrix<f32>,
        store: &mut PairStore<SparseMatrix>,
    ) -> probmsa::Result<()> {
        self.seen
            .lock()
            .unwrap()
            .push((weights.to_vec(), distances.clone()));
        self.inner.run(weights, set, distances, store)
    }

    fn stats(&self) -> &Statistics {
        ConsistencyStage::<SparseMatrix>::stats(&self.inner)
    }
}

/// Fails the test when any pairwise work is attempted.
struct Untouchable;

impl PosteriorStage<SparseMatrix> for Untouchable {
    fn run(&mut self, _set: &SequenceSet) -> probmsa::Result<(DMatrix<f32>, PairStore<SparseMatrix>)> {
        panic!("posterior stage must not run");
    }

    fn model(&self) -> &ProbabilisticModel {
        panic!("model must not be queried");
    }

    fn stats(&self) -> &Statistics {
        panic!("stats must not be queried");
    }
}

/// Weights and model threads handed to a final alignment stage.
type FinalInputs = Arc<Mutex<Vec<(Vec<f32>, usize)>>>;

struct RecordingConstruction {
    inner: ProgressiveConstruction,
    seen: FinalInputs,
}

impl ConstructionStage<SparseMatrix> for RecordingConstruction {
    fn run(
        &mut self,
        weights: &[f32],
        distances: &DMatrix<f32>,
        tree: &GuideTree,
        set: &SequenceSet,
        store: &PairStore<SparseMatrix>,
        model: &ProbabilisticModel,
    ) -> probmsa::Result<Alignment> {
        self.seen
            .lock()
            .unwrap()
            .push((weights.to_vec(), model.num_threads()));
        self.inner.run(weights, distances, tree, set, store, model)
    }

    fn stats(&self) -> &Statistics {
        ConstructionStage::<SparseMatrix>::stats(&self.inner)
    }
}

struct RecordingRefinement {
    inner: IterativeRefinement,
    seen: FinalInputs,
}

impl RefinementStage<SparseMatrix> for RecordingRefinement {
    fn run(
        &mut self,
        tree: &GuideTree,
        weights: &[f32],
        distances: &DMatrix<f32>,
        store: &PairStore<SparseMatrix>,
        model: &ProbabilisticModel,
        alignment: Alignment,
        observer: &mut IterationObserver<'_>,
    ) -> probmsa::Result<Alignment> {
        self.seen
            .lock()
            .unwrap()
            .push((weights.to_vec(), model.num_threads()));
        self.inner
            .run(tree, weights, distances, store, model, alignment, observer)
    }

    fn stats(&self) -> &Statistics {
        RefinementStage::<SparseMatrix>::stats(&self.inner)
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn test_three_sequences_upgma_similarity_stochastic() {
    let set = SequenceSet::new(vec![
        Sequence::new("s0", b"ACGTACGTAC"),
        Sequence::new("s1", b"ACGTACGAAC"),
        Sequence::new("s2", b"ACGTTCGAACG"),
    ]);
    let distances = DMatrix::from_row_slice(3, 3, &[0.0, 0.2, 0.5, 0.2, 0.0, 0.3, 0.5, 0.3, 0.0]);

    let mut config = nucleotide_config();
    config.algorithm.tree_kind = TreeKind::Upgma;
    config.algorithm.consistency.mode = SelectivityMode::Similarity;
    config.algorithm.consistency.normalization = SelectivityNormalization::Stochastic;
    config.algorithm.refinement.iterations = 0;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut pipeline = MsaPipeline::with_stages(
        config.clone(),
        Box::new(FixedDistances {
            inner: CpuPosteriorStage::new(ModelKind::Nucleotide),
            distances: distances.clone(),
        }),
        Box::new(Recording {
            inner: CpuConsistencyStage::new(2),
            seen: Arc::clone(&seen),
        }),
        Box::new(ProgressiveConstruction::new()),
        Box::new(IterativeRefinement::new(RefinementType::Column, 0, 0)),
    )
    .unwrap();

    let output = pipeline.align(&set).unwrap();
    assert_preserves_input(&set, &output);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    let (weights, consistency_distances) = &seen[0];
    assert_eq!(consistency_distances, &distances);
    assert!(weights.iter().all(|&w| w >= config.algorithm.consistency.saturation));
}

#[test]
fn test_consistency_weights_are_floored() {
    let mut config = nucleotide_config();
    config.algorithm.consistency.saturation = 5.0;
    config.algorithm.refinement.iterations = 0;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut pipeline = MsaPipeline::with_stages(
        config,
        Box::new(CpuPosteriorStage::new(ModelKind::Nucleotide)),
        Box::new(Recording {
            inner: CpuConsistencyStage::new(1),
            seen: Arc::clone(&seen),
        }),
        Box::new(ProgressiveConstruction::new()),
        Box::new(IterativeRefinement::new(RefinementType::Tree, 0, 0)),
    )
    .unwrap();
    pipeline.align(&sequences()).unwrap();

    let seen = seen.lock().unwrap();
    assert!(seen[0].0.iter().all(|&w| w == 5.0));
}

#[test]
fn test_final_weights_and_model_threads_reach_alignment_stages() {
    let mut config = nucleotide_config();
    config.hardware.num_threads = 6;
    config.hardware.ref_num_threads = 0;
    // tree weights average 1 over five sequences, so every one sits below this floor
    config.algorithm.final_saturation = 10.0;
    config.algorithm.refinement.iterations = 2;

    let construction_seen: FinalInputs = Arc::new(Mutex::new(Vec::new()));
    let refinement_seen: FinalInputs = Arc::new(Mutex::new(Vec::new()));
    let mut pipeline = MsaPipeline::with_stages(
        config,
        Box::new(CpuPosteriorStage::new(ModelKind::Nucleotide)),
        Box::new(CpuConsistencyStage::new(1)),
        Box::new(RecordingConstruction {
            inner: ProgressiveConstruction::new(),
            seen: Arc::clone(&construction_seen),
        }),
        Box::new(RecordingRefinement {
            inner: IterativeRefinement::new(RefinementType::Random, 2, 0),
            seen: Arc::clone(&refinement_seen),
        }),
    )
    .unwrap();
    let set = sequences();
    let output = pipeline.align(&set).unwrap();
    assert_preserves_input(&set, &output);

    // clamp(6 / 2, 1, 8)
    for seen in [&construction_seen, &refinement_seen] {
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let (weights, threads) = &seen[0];
        assert_eq!(weights.len(), 5);
        assert!(weights.iter().all(|&w| w == 10.0));
        assert_eq!(*threads, 3);
    }
}

#[test]
fn test_single_sequence_short_circuits() {
    let set = SequenceSet::new(vec![Sequence::new("only", b"MKVL")]);
    let config = nucleotide_config();
    let mut pipeline = MsaPipeline::with_stages(
        config,
        Box::new(Untouchable),
        Box::new(CpuConsistencyStage::new(2)),
        Box::new(ProgressiveConstruction::new()),
        Box::new(IterativeRefinement::new(RefinementType::Column, 10, 0)),
    )
    .unwrap();

    let output = pipeline.align(&set).unwrap();
    assert_eq!(output.alignment.num_sequences(), 1);
    assert_eq!(output.alignment.row(0), b"MKVL");
    assert!(output.stats.get("zhash").is_some());
}

#[test]
fn test_empty_input_is_fatal() {
    let mut pipeline: MsaPipeline = MsaPipeline::new(nucleotide_config(), None).unwrap();
    let result = pipeline.align(&SequenceSet::new(Vec::new()));
    assert!(matches!(result, Err(MsaError::EmptyInput)));

    let malformed = SequenceSet::new(vec![Sequence::new("a", b"ACGT"), Sequence::new("b", b"")]);
    let result = pipeline.align(&malformed);
    assert!(matches!(result, Err(MsaError::MalformedSequence { index: 1, .. })));
}

#[test]
fn test_every_policy_combination_aligns() {
    let set = sequences();
    let trees = [TreeKind::Chained, TreeKind::Upgma, TreeKind::SingleLinkage];
    let modes = [
        SelectivityMode::Subtree,
        SelectivityMode::Similarity,
        SelectivityMode::Seed,
        SelectivityMode::All,
    ];
    let normalizations = [
        SelectivityNormalization::None,
        SelectivityNormalization::Stochastic,
        SelectivityNormalization::RankedStochastic,
        SelectivityNormalization::RankedRowStochastic,
    ];
    for tree in trees {
        for mode in modes {
            for normalization in normalizations {
                let mut config = nucleotide_config();
                config.algorithm.tree_kind = tree;
                config.algorithm.consistency.mode = mode;
                config.algorithm.consistency.normalization = normalization;
                config.algorithm.consistency.selectivity = 2;
                config.algorithm.refinement.iterations = 2;
                let mut pipeline: MsaPipeline = MsaPipeline::new(config, None).unwrap();
                let output = pipeline.align(&set).unwrap();
                assert_preserves_input(&set, &output);
            }
        }
    }
}

#[test]
fn test_refinement_variants_and_stats() {
    let set = sequences();
    for kind in [RefinementType::Column, RefinementType::Tree, RefinementType::Random] {
        let mut config = nucleotide_config();
        config.algorithm.refinement.kind = kind;
        config.io.enable_verbose = true;
        let mut pipeline: MsaPipeline = MsaPipeline::new(config, None).unwrap();
        let output = pipeline.align(&set).unwrap();
        assert_preserves_input(&set, &output);

        for key in [
            "time.0.1-initialisation",
            "time.1-posterior",
            "time.2-tree",
            "time.3-consistency",
            "time.4-final alignment",
            "time.5-delete",
            "time.stages-1 to 5",
            "memory.peak allocated MB",
            "dataset.sequences",
            "histo.distances_0.100000",
            "refinement.iterations",
            "zhash",
        ] {
            assert!(output.stats.get(key).is_some(), "missing {}", key);
        }
        assert_eq!(output.stats.get("dataset.sequences"), Some(5.0));
    }
}

#[test]
fn test_histogram_only_when_verbose() {
    let mut pipeline: MsaPipeline = MsaPipeline::new(nucleotide_config(), None).unwrap();
    let output = pipeline.align(&sequences()).unwrap();
    assert!(output.stats.get("histo.distances_0.100000").is_none());
}

#[test]
fn test_runs_are_reproducible() {
    let set = sequences();
    let mut config = nucleotide_config();
    config.algorithm.refinement.kind = RefinementType::Random;
    config.algorithm.random_seed = 42;

    let mut first: MsaPipeline = MsaPipeline::new(config.clone(), None).unwrap();
    let mut second: MsaPipeline = MsaPipeline::new(config, None).unwrap();
    let a = first.align(&set).unwrap();
    let b = second.align(&set).unwrap();
    assert_eq!(a.alignment, b.alignment);
    assert_eq!(a.stats.get("zhash"), b.stats.get("zhash"));
}

#[test]
fn test_accelerated_pipeline() {
    let set = sequences();
    let context = probmsa::hardware::AcceleratorContext::new("test-device", 2)
        .unwrap()
        .with_batch_size(3);
    let mut config = nucleotide_config();
    config.optimisation.use_precise_math = true;
    let mut pipeline: MsaPipeline = MsaPipeline::new(config.clone(), Some(context)).unwrap();
    let accelerated = pipeline.align(&set).unwrap();
    assert_preserves_input(&set, &accelerated);
    assert!(accelerated.stats.get("posterior.batches").is_some());

    // precise math on the accelerator reproduces the CPU run
    let mut cpu: MsaPipeline = MsaPipeline::new(config, None).unwrap();
    assert_eq!(cpu.align(&set).unwrap().alignment, accelerated.alignment);
}

#[test]
fn test_external_guide_tree() {
    let dir = TempDir::new().unwrap();
    let newick = dir.path().join("guide.nwk");
    std::fs::write(&newick, "((alpha:0.1,beta:0.1):0.2,(gamma:0.2,(delta:0.1,epsilon:0.3)));\n").unwrap();

    let mut config = nucleotide_config();
    config.algorithm.tree_kind = TreeKind::External;
    config.algorithm.guide_tree = Some(newick);
    let mut pipeline: MsaPipeline = MsaPipeline::new(config, None).unwrap();
    let output = pipeline.align(&sequences()).unwrap();
    assert_preserves_input(&sequences(), &output);
}

#[test]
fn test_external_guide_tree_with_unknown_leaf_fails() {
    let dir = TempDir::new().unwrap();
    let newick = dir.path().join("guide.nwk");
    std::fs::write(&newick, "((alpha,beta),(gamma,(delta,zeta)));").unwrap();

    let mut config = nucleotide_config();
    config.algorithm.tree_kind = TreeKind::External;
    config.algorithm.guide_tree = Some(newick);
    let mut pipeline: MsaPipeline = MsaPipeline::new(config, None).unwrap();
    assert!(matches!(pipeline.align(&sequences()), Err(MsaError::GuideTree(_))));
}

#[test]
fn test_autosave_writes_checkpoints() {
    let dir = TempDir::new().unwrap();
    let mut config = nucleotide_config();
    config.io.output = dir.path().join("run.mfa").to_string_lossy().into_owned();
    config.algorithm.refinement.iterations = 6;
    config.algorithm.refinement.autosave = 3;

    let mut pipeline: MsaPipeline = MsaPipeline::new(config.clone(), None).unwrap();
    let output = pipeline.align(&sequences()).unwrap();

    for iteration in 1..=6 {
        let path = checkpoint_path(&config.io.output, iteration);
        assert_eq!(path.exists(), iteration % 3 == 0, "{:?}", path);
    }
    let last = std::fs::read_to_string(checkpoint_path(&config.io.output, 6)).unwrap();
    let mut expected = Vec::new();
    output.alignment.write_mfa(&mut expected).unwrap();
    assert_eq!(last.into_bytes(), expected);
}

#[test]
fn test_annotation_when_enabled() {
    let mut config = nucleotide_config();
    config.io.enable_annotation = true;
    let mut pipeline: MsaPipeline = MsaPipeline::new(config, None).unwrap();
    let output = pipeline.align(&sequences()).unwrap();
    let annotation = output.annotation.expect("annotation requested");
    assert_eq!(annotation.len(), output.alignment.len());
    assert!(annotation.scores().iter().all(|&s| (0.0..=1.0 + 1e-5).contains(&s)));

    let mut pipeline: MsaPipeline = MsaPipeline::new(nucleotide_config(), None).unwrap();
    assert!(pipeline.align(&sequences()).unwrap().annotation.is_none());
}
