use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Sentinel for `refinement.autosave` that turns checkpointing off.
pub const AUTOSAVE_DISABLED: i32 = i32::MAX;

// ---------------------------------------------------------------------------
// Policy enums
// ---------------------------------------------------------------------------

/// Guide tree construction strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TreeKind {
    /// UPGMA over a degenerated distance matrix (forces a linear topology).
    Chained,
    Upgma,
    SingleLinkage,
    /// Newick tree supplied by the user through `algorithm.guide_tree`.
    External,
}

impl TreeKind {
    /// Parse a tree kind; anything unrecognised selects single linkage.
    pub fn parse_lenient(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "chained" => TreeKind::Chained,
            "upgma" => TreeKind::Upgma,
            "external" | "newick" => TreeKind::External,
            _ => TreeKind::SingleLinkage,
        }
    }
}

/// Which sequence pairs contribute consistency evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectivityMode {
    Subtree,
    Similarity,
    Seed,
    All,
}

impl SelectivityMode {
    /// Parse a selectivity mode; anything unrecognised selects `All`.
    pub fn parse_lenient(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "subtree" => SelectivityMode::Subtree,
            "similarity" => SelectivityMode::Similarity,
            "seed" => SelectivityMode::Seed,
            _ => SelectivityMode::All,
        }
    }
}

/// Rescaling applied to the consistency distance matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectivityNormalization {
    None,
    Stochastic,
    RankedStochastic,
    RankedRowStochastic,
}

impl SelectivityNormalization {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().replace(['-', '_'], "").as_str() {
            "none" => Some(SelectivityNormalization::None),
            "stochastic" => Some(SelectivityNormalization::Stochastic),
            "rankedstochastic" => Some(SelectivityNormalization::RankedStochastic),
            "rankedrowstochastic" => Some(SelectivityNormalization::RankedRowStochastic),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefinementType {
    Column,
    Tree,
    Random,
}

impl RefinementType {
    /// Parse a refinement type; anything unrecognised selects `Random`.
    pub fn parse_lenient(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "column" => RefinementType::Column,
            "tree" => RefinementType::Tree,
            _ => RefinementType::Random,
        }
    }
}

/// Emission alphabet of the pair-HMM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelKind {
    Protein,
    Nucleotide,
}

impl ModelKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "protein" | "aa" => Some(ModelKind::Protein),
            "nucleotide" | "dna" | "rna" => Some(ModelKind::Nucleotide),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareConfig {
    /// Threads for the parallel stages. `<= 0` means all detected cores.
    pub num_threads: i32,
    /// Threads for the final model evaluation. `<= 0` derives it from `num_threads`.
    pub ref_num_threads: i32,
    /// Worker threads of the accelerator context. 0 runs everything on the CPU pool.
    pub accelerator_threads: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsistencyConfig {
    pub mode: SelectivityMode,
    pub normalization: SelectivityNormalization,
    /// Number of seed sequences drawn in `Seed` mode.
    pub selectivity: usize,
    /// Weight floor applied before the consistency transformation.
    pub saturation: f32,
    /// Number of consistency passes.
    pub iterations: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefinementConfig {
    pub kind: RefinementType,
    pub iterations: usize,
    /// Checkpoint every `autosave` iterations; [`AUTOSAVE_DISABLED`] turns it off.
    pub autosave: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlgorithmConfig {
    pub tree_kind: TreeKind,
    pub consistency: ConsistencyConfig,
    /// Weight floor applied before construction and refinement.
    pub final_saturation: f32,
    pub refinement: RefinementConfig,
    pub model: ModelKind,
    /// Seed shared by every random draw of the run.
    pub random_seed: u64,
    /// Newick file for [`TreeKind::External`].
    pub guide_tree: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoConfig {
    /// Output path; also the prefix of checkpoint files.
    pub output: String,
    pub enable_annotation: bool,
    pub enable_verbose: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimisationConfig {
    pub use_precise_math: bool,
}

/// Full set of options recognised by the aligner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    pub hardware: HardwareConfig,
    pub algorithm: AlgorithmConfig,
    pub io: IoConfig,
    pub optimisation: OptimisationConfig,
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            hardware: HardwareConfig {
                num_threads: 0,
                ref_num_threads: 0,
                accelerator_threads: 0,
            },
            algorithm: AlgorithmConfig {
                tree_kind: TreeKind::SingleLinkage,
                consistency: ConsistencyConfig {
                    mode: SelectivityMode::All,
                    normalization: SelectivityNormalization::None,
                    selectivity: 10,
                    saturation: 0.1,
                    iterations: 2,
                },
                final_saturation: 0.0,
                refinement: RefinementConfig {
                    kind: RefinementType::Column,
                    iterations: 100,
                    autosave: AUTOSAVE_DISABLED,
                },
                model: ModelKind::Protein,
                random_seed: 0,
                guide_tree: None,
            },
            io: IoConfig {
                output: String::from("probmsa.mfa"),
                enable_annotation: false,
                enable_verbose: false,
            },
            optimisation: OptimisationConfig {
                use_precise_math: false,
            },
        }
    }
}

impl Configuration {
    /// Whether refinement checkpoints are written at all.
    pub fn autosave_enabled(&self) -> bool {
        self.algorithm.refinement.autosave > 0
            && self.algorithm.refinement.autosave < AUTOSAVE_DISABLED
    }
}
