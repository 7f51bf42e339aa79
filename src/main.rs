use clap::Parser;
use log::info;
use probmsa::config::{
    Configuration, ModelKind, RefinementType, SelectivityMode, SelectivityNormalization, TreeKind,
    AUTOSAVE_DISABLED,
};
use probmsa::hardware::AcceleratorContext;
use probmsa::sequence::SequenceSet;
use probmsa::stats::RunReport;
use probmsa::MsaPipeline;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

fn parse_normalization(s: &str) -> Result<SelectivityNormalization, String> {
    SelectivityNormalization::parse(s).ok_or_else(|| {
        format!(
            "unknown normalization '{}' (none, stochastic, ranked-stochastic, ranked-row-stochastic)",
            s
        )
    })
}

fn parse_model(s: &str) -> Result<ModelKind, String> {
    ModelKind::parse(s).ok_or_else(|| format!("unknown model '{}' (protein, nucleotide)", s))
}

/// Probabilistic consistency-based multiple sequence alignment.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Input sequences in FASTA format (optionally bgzipped).
    #[clap(short = 'i', long, value_parser)]
    input: PathBuf,

    /// Output alignment in multi-FASTA format; also the prefix of checkpoint files.
    #[clap(short = 'o', long, value_parser, default_value = "probmsa.mfa")]
    output: String,

    /// Threads for the parallel stages (0 = all cores).
    #[clap(short = 't', long, value_parser, default_value_t = 0)]
    num_threads: i32,

    /// Threads for the final alignment stages (0 = half of --num-threads, at most 8).
    #[clap(long, value_parser, default_value_t = 0)]
    ref_num_threads: i32,

    /// Workers of the accelerator context (0 = run every stage on the CPU pool).
    #[clap(long, value_parser, default_value_t = 0)]
    accelerator_threads: usize,

    /// Guide tree: chained, upgma, single-linkage or external.
    #[clap(long, value_parser, default_value = "single-linkage")]
    tree: String,

    /// Newick guide tree used with `--tree external`.
    #[clap(long, value_parser)]
    guide_tree: Option<PathBuf>,

    /// Consistency selectivity: subtree, similarity, seed or all.
    #[clap(long, value_parser, default_value = "all")]
    selectivity_mode: String,

    /// Normalization of consistency distances.
    #[clap(long, value_parser = parse_normalization, default_value = "none")]
    normalization: SelectivityNormalization,

    /// Number of seed sequences in seed selectivity mode.
    #[clap(long, value_parser, default_value_t = 10)]
    selectivity: usize,

    /// Weight floor before the consistency transformation.
    #[clap(long, value_parser, default_value_t = 0.1)]
    saturation: f32,

    /// Weight floor before construction and refinement.
    #[clap(long, value_parser, default_value_t = 0.0)]
    final_saturation: f32,

    /// Number of consistency passes.
    #[clap(short = 'c', long, value_parser, default_value_t = 2)]
    consistency_iterations: usize,

    /// Refinement: column, tree or random.
    #[clap(long, value_parser, default_value = "column")]
    refinement: String,

    /// Number of refinement iterations.
    #[clap(short = 'r', long, value_parser, default_value_t = 100)]
    refinement_iterations: usize,

    /// Save the alignment every N refinement iterations.
    #[clap(long, value_parser)]
    autosave: Option<i32>,

    /// Emission model: protein or nucleotide.
    #[clap(short = 'm', long, value_parser = parse_model, default_value = "protein")]
    model: ModelKind,

    /// Seed of every random draw.
    #[clap(long, value_parser, default_value_t = 0)]
    seed: u64,

    /// Disable fast math on the accelerator.
    #[clap(long, action)]
    precise_math: bool,

    /// Write per-column reliability scores to `<output>.ann`.
    #[clap(short = 'a', long, action)]
    annotation: bool,

    /// Write configuration and statistics to a binary run report.
    #[clap(long, value_parser)]
    report: Option<PathBuf>,

    /// Print statistics to stdout.
    #[clap(long, action)]
    stats: bool,

    /// Verbosity level (0 = error, 1 = info, 2 = debug)
    #[clap(short, long, default_value = "0")]
    verbose: u8,
}

impl Args {
    fn to_config(&self) -> Configuration {
        let mut config = Configuration::default();
        config.hardware.num_threads = self.num_threads;
        config.hardware.ref_num_threads = self.ref_num_threads;
        config.hardware.accelerator_threads = self.accelerator_threads;

        let algorithm = &mut config.algorithm;
        algorithm.tree_kind = TreeKind::parse_lenient(&self.tree);
        algorithm.guide_tree = self.guide_tree.clone();
        algorithm.consistency.mode = SelectivityMode::parse_lenient(&self.selectivity_mode);
        algorithm.consistency.normalization = self.normalization;
        algorithm.consistency.selectivity = self.selectivity;
        algorithm.consistency.saturation = self.saturation;
        algorithm.consistency.iterations = self.consistency_iterations;
        algorithm.final_saturation = self.final_saturation;
        algorithm.refinement.kind = RefinementType::parse_lenient(&self.refinement);
        algorithm.refinement.iterations = self.refinement_iterations;
        algorithm.refinement.autosave = self.autosave.unwrap_or(AUTOSAVE_DISABLED);
        algorithm.model = self.model;
        algorithm.random_seed = self.seed;

        config.io.output = self.output.clone();
        config.io.enable_annotation = self.annotation;
        config.io.enable_verbose = self.verbose > 1;
        config.optimisation.use_precise_math = self.precise_math;
        config
    }
}

fn main() -> io::Result<()> {
    let args = Args::parse();

    // Initialize logger based on verbosity
    env_logger::Builder::new()
        .filter_level(match args.verbose {
            0 => log::LevelFilter::Error,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        })
        .init();

    let config = args.to_config();
    let sequences = SequenceSet::from_fasta(&args.input)?;
    info!("Loaded {} sequences from {:?}", sequences.len(), args.input);

    let accelerator = match config.hardware.accelerator_threads {
        0 => None,
        workers => Some(AcceleratorContext::new("cpu-offload", workers)?),
    };
    let mut pipeline: MsaPipeline = MsaPipeline::new(config.clone(), accelerator)?;
    let output = pipeline.align(&sequences)?;

    let mut writer = BufWriter::new(File::create(&config.io.output)?);
    output.alignment.write_mfa(&mut writer)?;
    writer.flush()?;
    info!(
        "Wrote {} sequences x {} columns to {}",
        output.alignment.num_sequences(),
        output.alignment.len(),
        config.io.output
    );

    if let Some(annotation) = &output.annotation {
        let path = format!("{}.ann", config.io.output);
        let mut writer = BufWriter::new(File::create(&path)?);
        annotation.write(&mut writer)?;
        writer.flush()?;
        info!("Wrote annotation to {}", path);
    }

    if let Some(report) = &args.report {
        RunReport {
            config,
            stats: output.stats.clone(),
        }
        .save(report)?;
    }

    if args.stats {
        print!("{}", output.stats.to_tsv());
    }

    Ok(())
}
