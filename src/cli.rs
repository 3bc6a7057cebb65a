use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::metrics::DEFAULT_K_VALUES;

#[derive(Parser, Debug)]
#[command(
    name = "reteval",
    version,
    about = "Retrieval scoring, sub-query fusion and trec-style evaluation"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    Retrieve(RetrieveArgs),
    Evaluate(EvaluateArgs),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum BackendKind {
    Bm25,
    HashDense,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bm25 => "bm25",
            Self::HashDense => "hash-dense",
        }
    }

    /// Short family label used for fusion output directories and hit-count files.
    pub fn family(self) -> &'static str {
        match self {
            Self::Bm25 => "bm25",
            Self::HashDense => "dense",
        }
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum EmbedMethod {
    Joint,
    #[default]
    Separate,
}

impl EmbedMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Joint => "joint",
            Self::Separate => "separate",
        }
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum FusionMethod {
    #[default]
    Sum,
    Max,
}

impl FusionMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Max => "max",
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct RetrieveArgs {
    #[arg(long)]
    pub task: String,

    #[arg(long, value_enum)]
    pub backend: BackendKind,

    /// Split composite queries into sub-query/description units and fuse them.
    #[arg(long, default_value_t = false)]
    pub fusion_desc: bool,

    #[arg(long)]
    pub examples_path: PathBuf,

    #[arg(long)]
    pub documents_path: PathBuf,

    #[arg(long, default_value = "outputs")]
    pub output_dir: PathBuf,

    #[arg(long, default_value = "cache")]
    pub cache_dir: PathBuf,

    #[arg(long, default_value = "configs")]
    pub config_dir: PathBuf,

    #[arg(long, default_value_t = false)]
    pub long_context: bool,

    #[arg(long, value_enum, default_value_t = EmbedMethod::Separate)]
    pub embed_method: EmbedMethod,

    #[arg(long, default_value_t = 0.5)]
    pub desc_weight: f64,

    #[arg(long, value_enum, default_value_t = FusionMethod::Sum)]
    pub fusion_method: FusionMethod,

    #[arg(long, value_delimiter = ',', default_values_t = DEFAULT_K_VALUES)]
    pub k_values: Vec<usize>,

    #[arg(long, default_value_t = 128)]
    pub batch_size: usize,

    #[arg(long, default_value_t = 1000)]
    pub flush_every: usize,

    #[arg(long, default_value_t = 384)]
    pub dimensions: usize,

    #[arg(long, default_value_t = false)]
    pub ignore_cache: bool,

    /// Restrict the corpus to its first 30 documents.
    #[arg(long, default_value_t = false)]
    pub debug: bool,
}

#[derive(Args, Debug, Clone)]
pub struct EvaluateArgs {
    #[arg(long)]
    pub score_path: PathBuf,

    #[arg(long)]
    pub examples_path: PathBuf,

    #[arg(long)]
    pub results_path: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    pub long_context: bool,

    #[arg(long, value_delimiter = ',', default_values_t = DEFAULT_K_VALUES)]
    pub k_values: Vec<usize>,
}
