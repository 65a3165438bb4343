//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{collections::BTreeMap, path::PathBuf, str::FromStr, time::Duration};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::cache::{Category, ResourcePolicies, ResourcePolicy};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "fotocache";
const ENV_PREFIX: &str = "FOTOCACHE";
const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:8000/api";
const DEFAULT_API_TIMEOUT_SECS: u64 = 30;
const DEFAULT_PROBE_INTERVAL_SECS: u64 = 15;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
const DEFAULT_COALESCE_WINDOW_MS: u64 = 1000;
const DEFAULT_CASCADE_DEPTH: usize = 2;
const DEFAULT_VISIBILITY_STALENESS_SECS: u64 = 5 * 60;
const DEFAULT_PRELOAD_TTL_SECS: u64 = 5 * 60;
const MAX_CASCADE_DEPTH: usize = 16;

/// Command-line arguments for the fotocache binary.
#[derive(Debug, Parser)]
#[command(name = "fotocache", version, about = "Photo storefront cache engine")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "FOTOCACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the cache engine against the storefront API until interrupted.
    Serve(Box<ServeArgs>),
    /// Preload the resources a navigation path needs, then exit.
    Preload(PreloadArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Clone)]
pub struct PreloadArgs {
    /// Navigation path to preload for, e.g. `/eventos/EventoX`.
    #[arg(long, value_name = "PATH", default_value = "/")]
    pub path: String,

    #[command(flatten)]
    pub overrides: ApiOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ApiOverrides {
    /// Override the storefront API base URL.
    #[arg(long = "api-base-url", value_name = "URL")]
    pub api_base_url: Option<String>,

    /// Override the API request timeout.
    #[arg(long = "api-timeout-seconds", value_name = "SECONDS")]
    pub api_timeout_seconds: Option<u64>,

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
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub api: ApiOverrides,

    /// Override the connectivity probe interval.
    #[arg(long = "api-probe-interval-seconds", value_name = "SECONDS")]
    pub api_probe_interval_seconds: Option<u64>,

    /// Override the expired-entry sweep interval.
    #[arg(long = "cache-sweep-interval-seconds", value_name = "SECONDS")]
    pub cache_sweep_interval_seconds: Option<u64>,

    /// Override how many dependency hops cascading rules follow.
    #[arg(long = "cache-cascade-depth", value_name = "HOPS")]
    pub cache_cascade_depth: Option<usize>,
}

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub api: ApiSettings,
    pub cache: CacheSettings,
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
pub struct ApiSettings {
    pub base_url: Url,
    pub timeout: Duration,
    pub probe_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub sweep_interval: Duration,
    pub coalesce_window: Duration,
    pub cascade_depth: usize,
    pub visibility_staleness: Duration,
    pub preload_ttl: Duration,
    /// Policy overrides, applied on top of the built-in table.
    pub policies: Vec<(Category, ResourcePolicy)>,
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

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Preload(args)) => raw.apply_api_overrides(&args.overrides),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    api: RawApiSettings,
    cache: RawCacheSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        self.apply_api_overrides(&overrides.api);

        if let Some(seconds) = overrides.api_probe_interval_seconds {
            self.api.probe_interval_seconds = Some(seconds);
        }
        if let Some(seconds) = overrides.cache_sweep_interval_seconds {
            self.cache.sweep_interval_seconds = Some(seconds);
        }
        if let Some(depth) = overrides.cache_cascade_depth {
            self.cache.cascade_depth = Some(depth);
        }
    }

    fn apply_api_overrides(&mut self, overrides: &ApiOverrides) {
        if let Some(url) = overrides.api_base_url.as_ref() {
            self.api.base_url = Some(url.clone());
        }
        if let Some(seconds) = overrides.api_timeout_seconds {
            self.api.timeout_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            api,
            cache,
        } = raw;

        let logging = build_logging_settings(logging)?;
        let api = build_api_settings(api)?;
        let cache = build_cache_settings(cache)?;

        Ok(Self {
            logging,
            api,
            cache,
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

fn build_api_settings(api: RawApiSettings) -> Result<ApiSettings, LoadError> {
    let raw_url = api
        .base_url
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());
    let base_url = Url::parse(&raw_url)
        .map_err(|err| LoadError::invalid("api.base_url", format!("`{raw_url}`: {err}")))?;
    if base_url.cannot_be_a_base() {
        return Err(LoadError::invalid(
            "api.base_url",
            format!("`{raw_url}` cannot be used as a base URL"),
        ));
    }

    let timeout = positive_seconds(
        api.timeout_seconds.unwrap_or(DEFAULT_API_TIMEOUT_SECS),
        "api.timeout_seconds",
    )?;
    let probe_interval = positive_seconds(
        api.probe_interval_seconds
            .unwrap_or(DEFAULT_PROBE_INTERVAL_SECS),
        "api.probe_interval_seconds",
    )?;

    Ok(ApiSettings {
        base_url,
        timeout,
        probe_interval,
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let sweep_interval = positive_seconds(
        cache
            .sweep_interval_seconds
            .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS),
        "cache.sweep_interval_seconds",
    )?;
    let coalesce_window = Duration::from_millis(
        cache
            .coalesce_window_ms
            .unwrap_or(DEFAULT_COALESCE_WINDOW_MS),
    );

    let cascade_depth = cache.cascade_depth.unwrap_or(DEFAULT_CASCADE_DEPTH);
    if cascade_depth > MAX_CASCADE_DEPTH {
        return Err(LoadError::invalid(
            "cache.cascade_depth",
            format!("must be at most {MAX_CASCADE_DEPTH}"),
        ));
    }

    let visibility_staleness = positive_seconds(
        cache
            .visibility_staleness_seconds
            .unwrap_or(DEFAULT_VISIBILITY_STALENESS_SECS),
        "cache.visibility_staleness_seconds",
    )?;
    let preload_ttl = positive_seconds(
        cache.preload_ttl_seconds.unwrap_or(DEFAULT_PRELOAD_TTL_SECS),
        "cache.preload_ttl_seconds",
    )?;

    let policies = build_policy_overrides(cache.policies)?;

    Ok(CacheSettings {
        sweep_interval,
        coalesce_window,
        cascade_depth,
        visibility_staleness,
        preload_ttl,
        policies,
    })
}

fn build_policy_overrides(
    raw: BTreeMap<String, RawPolicySettings>,
) -> Result<Vec<(Category, ResourcePolicy)>, LoadError> {
    let defaults = ResourcePolicies::default();
    let mut overrides = Vec::with_capacity(raw.len());

    for (token, policy) in raw {
        let category = Category::from_str(&token)
            .map_err(|err| LoadError::invalid("cache.policies", err.to_string()))?;
        let base = defaults.config_for(category).ok();

        let stale_after = policy
            .stale_after_minutes
            .map(minutes)
            .or(base.map(|base| base.stale_after));
        let retention = policy
            .retention_minutes
            .map(minutes)
            .or(base.map(|base| base.retention));

        let (Some(stale_after), Some(retention)) = (stale_after, retention) else {
            return Err(LoadError::invalid(
                "cache.policies",
                format!("`{token}` needs both stale_after_minutes and retention_minutes"),
            ));
        };
        if stale_after > retention {
            return Err(LoadError::invalid(
                "cache.policies",
                format!("`{token}` stale_after exceeds retention"),
            ));
        }

        overrides.push((category, ResourcePolicy::new(stale_after, retention)));
    }

    Ok(overrides)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawApiSettings {
    base_url: Option<String>,
    timeout_seconds: Option<u64>,
    probe_interval_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    sweep_interval_seconds: Option<u64>,
    coalesce_window_ms: Option<u64>,
    cascade_depth: Option<usize>,
    visibility_staleness_seconds: Option<u64>,
    preload_ttl_seconds: Option<u64>,
    policies: BTreeMap<String, RawPolicySettings>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPolicySettings {
    stale_after_minutes: Option<u64>,
    retention_minutes: Option<u64>,
}

fn minutes(value: u64) -> Duration {
    Duration::from_secs(value.saturating_mul(60))
}

fn positive_seconds(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_secs(value))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
