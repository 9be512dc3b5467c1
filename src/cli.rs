use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::vector::DEFAULT_EMBEDDING_DIM;

#[derive(Parser, Debug)]
#[command(
    name = "leadvec",
    version,
    about = "Lead embedding composition and recompute sweeps"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    Recompute(RecomputeArgs),
    Status(StatusArgs),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum StoreBackend {
    Sqlite,
    Rest,
}

impl StoreBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Rest => "rest",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum PendingSelector {
    Dirty,
    NeverComposed,
}

impl PendingSelector {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dirty => "dirty",
            Self::NeverComposed => "never-composed",
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    #[arg(long, default_value = ".cache/leadvec")]
    pub cache_root: PathBuf,

    #[arg(long, value_enum, default_value_t = StoreBackend::Sqlite)]
    pub backend: StoreBackend,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long, env = "LEADVEC_REST_URL")]
    pub rest_url: Option<String>,

    #[arg(long, env = "LEADVEC_REST_KEY", hide_env_values = true)]
    pub rest_key: Option<String>,

    #[arg(long, default_value = "lead_embeddings")]
    pub rest_table: String,

    /// The REST table has a `components_version` column to guard flag clears.
    #[arg(long, default_value_t = false)]
    pub rest_version_column: bool,

    #[arg(long, default_value_t = 30_000)]
    pub timeout_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct RecomputeArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[arg(long)]
    pub lead_id: Option<String>,

    #[arg(long, value_enum, default_value_t = PendingSelector::Dirty)]
    pub selector: PendingSelector,

    #[arg(long)]
    pub max_count: Option<usize>,

    #[arg(long, default_value_t = 500)]
    pub page_size: usize,

    #[arg(long, default_value_t = 25)]
    pub write_chunk_size: usize,

    #[arg(long, default_value_t = DEFAULT_EMBEDDING_DIM)]
    pub dimensions: usize,

    #[arg(long, default_value_t = 3)]
    pub max_attempts: u32,

    #[arg(long, default_value_t = 500)]
    pub retry_base_delay_ms: u64,

    #[arg(long, default_value_t = 8_000)]
    pub retry_max_delay_ms: u64,

    #[arg(long, default_value_t = false)]
    pub resume: bool,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[arg(long, value_enum, default_value_t = PendingSelector::Dirty)]
    pub selector: PendingSelector,
}
