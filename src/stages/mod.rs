//! The four pipeline stages and the interfaces the orchestrator drives them through.
//!
//! Every stage owns a [`Statistics`] block that the orchestrator merges after
//! the run. Stages are called strictly one after another; any parallelism
//! happens inside a single call.

pub mod consistency;
pub mod construction;
pub mod posterior;
pub mod refinement;

use crate::alignment::Alignment;
use crate::error::Result;
use crate::model::ProbabilisticModel;
use crate::sequence::SequenceSet;
use crate::sparse::PairStore;
use crate::stats::Statistics;
use crate::tree::GuideTree;
use nalgebra::DMatrix;

pub use consistency::{AcceleratedConsistencyStage, CpuConsistencyStage};
pub use construction::ProgressiveConstruction;
pub use posterior::{AcceleratedPosteriorStage, CpuPosteriorStage};
pub use refinement::IterativeRefinement;

/// Callback invoked after every refinement iteration, numbered from 1.
pub type IterationObserver<'a> = dyn FnMut(&Alignment, usize) + 'a;

/// Pairwise evidence: a distance matrix and one posterior matrix per pair.
pub trait PosteriorStage<M>: Send {
    fn run(&mut self, set: &SequenceSet) -> Result<(DMatrix<f32>, PairStore<M>)>;

    fn model(&self) -> &ProbabilisticModel;

    fn stats(&self) -> &Statistics;
}

/// Rewrites the matrices of `store` in place; never adds or removes any.
pub trait ConsistencyStage<M>: Send {
    fn run(
        &mut self,
        weights: &[f32],
        set: &SequenceSet,
        distances: &DMatrix<f32>,
        store: &mut PairStore<M>,
    ) -> Result<()>;

    fn stats(&self) -> &Statistics;
}

/// Builds the initial alignment.
pub trait ConstructionStage<M>: Send {
    #[allow(clippy::too_many_arguments)]
    fn run(
        &mut self,
        weights: &[f32],
        distances: &DMatrix<f32>,
        tree: &GuideTree,
        set: &SequenceSet,
        store: &PairStore<M>,
        model: &ProbabilisticModel,
    ) -> Result<Alignment>;

    fn stats(&self) -> &Statistics;
}

/// Improves an alignment, taking ownership of it and returning the result.
pub trait RefinementStage<M>: Send {
    #[allow(clippy::too_many_arguments)]
    fn run(
        &mut self,
        tree: &GuideTree,
        weights: &[f32],
        distances: &DMatrix<f32>,
        store: &PairStore<M>,
        model: &ProbabilisticModel,
        alignment: Alignment,
        observer: &mut IterationObserver<'_>,
    ) -> Result<Alignment>;

    fn stats(&self) -> &Statistics;
}
