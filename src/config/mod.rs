//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{num::NonZeroU32, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::CacheConfig;

mod cli;

pub use cli::{CliArgs, Command, CounterArgs, DemoOverrides, PrefetchArgs};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "tagcache";
const DEFAULT_DEMO_LATENCY_MS: u64 = 100;
const DEFAULT_DEMO_INCREMENTS: u32 = 3;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheConfig,
    pub demo: DemoSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct DemoSettings {
    /// Simulated round trip of the in-process transport.
    pub latency: Duration,
    pub increments: NonZeroU32,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("TAGCACHE").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Counter(args)) => raw.apply_demo_overrides(&args.overrides),
        Some(Command::Prefetch(args)) => raw.apply_demo_overrides(&args.overrides),
        None => {}
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    demo: RawDemoSettings,
}

impl RawSettings {
    fn apply_demo_overrides(&mut self, overrides: &DemoOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(latency) = overrides.latency_ms {
            self.demo.latency_ms = Some(latency);
        }
        if let Some(increments) = overrides.increments {
            self.demo.increments = Some(increments);
        }
        if let Some(seconds) = overrides.cache_keep_unused_for_seconds {
            self.cache.keep_unused_for_secs = Some(seconds);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            cache,
            demo,
        } = raw;

        let logging = build_logging_settings(logging)?;
        let cache = build_cache_settings(cache)?;
        let demo = build_demo_settings(demo)?;

        Ok(Self {
            logging,
            cache,
            demo,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheConfig, LoadError> {
    let defaults = CacheConfig::default();

    let mutation_history_limit = cache
        .mutation_history_limit
        .unwrap_or(defaults.mutation_history_limit);
    if mutation_history_limit == 0 {
        return Err(LoadError::invalid(
            "cache.mutation_history_limit",
            "must be greater than zero",
        ));
    }

    let event_buffer = cache.event_buffer.unwrap_or(defaults.event_buffer);
    if event_buffer == 0 {
        return Err(LoadError::invalid(
            "cache.event_buffer",
            "must be greater than zero",
        ));
    }

    let gc_interval_ms = cache.gc_interval_ms.unwrap_or(defaults.gc_interval_ms);
    if gc_interval_ms == 0 {
        return Err(LoadError::invalid(
            "cache.gc_interval_ms",
            "must be greater than zero",
        ));
    }

    Ok(CacheConfig {
        keep_unused_for_secs: cache
            .keep_unused_for_secs
            .unwrap_or(defaults.keep_unused_for_secs),
        mutation_history_limit,
        event_buffer,
        gc_interval_ms,
    })
}

fn build_demo_settings(demo: RawDemoSettings) -> Result<DemoSettings, LoadError> {
    let latency = Duration::from_millis(demo.latency_ms.unwrap_or(DEFAULT_DEMO_LATENCY_MS));
    let increments = NonZeroU32::new(demo.increments.unwrap_or(DEFAULT_DEMO_INCREMENTS))
        .ok_or_else(|| LoadError::invalid("demo.increments", "must be greater than zero"))?;

    Ok(DemoSettings {
        latency,
        increments,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    keep_unused_for_secs: Option<u64>,
    mutation_history_limit: Option<usize>,
    event_buffer: Option<usize>,
    gc_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDemoSettings {
    latency_ms: Option<u64>,
    increments: Option<u32>,
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
