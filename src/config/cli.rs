use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the tagcache demo binary.
#[derive(Debug, Parser)]
#[command(
    name = "tagcache",
    version,
    about = "Tag-invalidated query cache demo"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "TAGCACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Fetch a counter, mutate it and watch invalidation refetch the query.
    Counter(CounterArgs),
    /// Show prefetch decisions for fresh and stale cached results.
    Prefetch(PrefetchArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct CounterArgs {
    #[command(flatten)]
    pub overrides: DemoOverrides,
}

#[derive(Debug, Args, Clone)]
pub struct PrefetchArgs {
    #[command(flatten)]
    pub overrides: DemoOverrides,

    /// Maximum age in seconds before a prefetch refetches.
    #[arg(long = "max-age-seconds", default_value_t = 10, value_name = "SECONDS")]
    pub max_age_seconds: u64,
}

#[derive(Debug, Args, Default, Clone)]
pub struct DemoOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the simulated transport latency in milliseconds.
    #[arg(long = "latency-ms", value_name = "MS")]
    pub latency_ms: Option<u64>,

    /// Override the number of increment mutations the counter demo runs.
    #[arg(long = "increments", value_name = "COUNT")]
    pub increments: Option<u32>,

    /// Override how long unused cache entries are kept.
    #[arg(long = "cache-keep-unused-for-seconds", value_name = "SECONDS")]
    pub cache_keep_unused_for_seconds: Option<u64>,
}
