// ABOUTME: TOML configuration for a synchronizer - source, destination, schedule and output sections
// ABOUTME: validate() turns the raw file into typed, checked settings once at startup

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::destination::ClientOptions;
use crate::error::ConfigError;
use crate::source::{ParamValue, QueryBinder, QueryTemplate, SourceOptions};
use crate::sync::{CronSchedule, OverlapPolicy, Trigger};
use crate::utils::{sanitize_url, validate_source_url};
use crate::watermark::{Category, FieldName, HealthStatus, IndexName, WatermarkSpec};

/// Raw configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    pub source: SourceConfig,
    pub destination: DestinationConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub output: OutputConfig,

    /// Directory relative statement paths are resolved against.
    #[serde(skip)]
    base_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    /// PostgreSQL connection URL.
    pub url: String,

    /// Inline statement. Exclusive with `statement_filepath`.
    #[serde(default)]
    pub statement: Option<String>,

    /// File holding the statement, read once at startup.
    #[serde(default)]
    pub statement_filepath: Option<PathBuf>,

    /// Named parameters referenced as `:name` in the statement.
    #[serde(default)]
    pub parameters: BTreeMap<String, ParamValue>,

    #[serde(default = "default_fetch_size")]
    pub fetch_size: usize,

    #[serde(default = "default_true")]
    pub lowercase_column_names: bool,

    /// Bound as `:sql_last_value` when the destination holds no documents yet.
    #[serde(default)]
    pub initial_watermark: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DestinationConfig {
    pub endpoint: String,
    pub index: String,
    pub watermark_field: String,

    #[serde(default)]
    pub category: Option<String>,

    #[serde(default = "default_category_field")]
    pub category_field: String,

    #[serde(default = "default_min_health")]
    pub min_health: HealthStatus,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Log every destination request and response.
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleConfig {
    /// Cron expression with optional trailing timezone.
    #[serde(default)]
    pub cron: Option<String>,

    #[serde(default)]
    pub interval_secs: Option<u64>,

    #[serde(default)]
    pub overlap: OverlapPolicy,

    /// Unset means aborted cycles never stop the scheduler.
    #[serde(default)]
    pub max_consecutive_aborts: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    #[serde(default)]
    pub kind: OutputKind,

    /// Event field used as the document id. Without it every delivery
    /// creates a new document.
    #[serde(default)]
    pub document_id_field: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    #[default]
    Elasticsearch,
    Stdout,
}

fn default_fetch_size() -> usize {
    10_000
}

fn default_true() -> bool {
    true
}

fn default_category_field() -> String {
    "type".to_string()
}

fn default_min_health() -> HealthStatus {
    HealthStatus::Yellow
}

fn default_timeout_secs() -> u64 {
    30
}

/// Everything a synchronizer needs, checked and typed.
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    pub source_url: String,
    pub source_options: SourceOptions,
    pub binder: QueryBinder,
    pub watermark: WatermarkSpec,
    pub min_health: HealthStatus,
    pub client: ClientOptions,
    pub trigger: Trigger,
    pub overlap: OverlapPolicy,
    pub max_consecutive_aborts: Option<u32>,
    pub output: OutputKind,
    pub document_id_field: Option<FieldName>,
}

impl SyncConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml(&content, path)?;
        config.base_dir = path.parent().map(Path::to_path_buf);
        Ok(config)
    }

    /// Parse configuration from TOML text. `origin` only labels errors.
    pub fn from_toml(content: &str, origin: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: origin.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Check every setting and build the typed pieces.
    pub fn validate(&self) -> Result<ValidatedConfig, ConfigError> {
        let source = &self.source;
        let destination = &self.destination;

        validate_source_url(&source.url)?;
        if source.fetch_size == 0 {
            return Err(ConfigError::NotPositive("source.fetch_size"));
        }
        if destination.timeout_secs == 0 {
            return Err(ConfigError::NotPositive("destination.timeout_secs"));
        }

        let statement = self.read_statement()?;
        let template = QueryTemplate::compile(&statement)?;
        let binder = QueryBinder::new(
            template,
            source.parameters.clone(),
            source.initial_watermark,
        )?;

        let endpoint = parse_endpoint(&destination.endpoint)?;
        let category = match &destination.category {
            Some(value) if value.is_empty() => {
                return Err(ConfigError::InvalidIdentifier {
                    kind: "category",
                    value: value.clone(),
                    reason: "must not be empty",
                })
            }
            Some(value) => Some(Category {
                field: FieldName::parse(&destination.category_field)?,
                value: value.clone(),
            }),
            None => None,
        };
        let watermark = WatermarkSpec {
            field: FieldName::parse(&destination.watermark_field)?,
            index: IndexName::parse(&destination.index)?,
            category,
            endpoint: endpoint.clone(),
        };

        let document_id_field = self
            .output
            .document_id_field
            .as_deref()
            .map(FieldName::parse)
            .transpose()?;

        Ok(ValidatedConfig {
            source_url: source.url.clone(),
            source_options: SourceOptions {
                fetch_size: source.fetch_size,
                lowercase_column_names: source.lowercase_column_names,
            },
            binder,
            watermark,
            min_health: destination.min_health,
            client: ClientOptions {
                endpoint,
                timeout: Duration::from_secs(destination.timeout_secs),
                username: destination.username.clone(),
                password: destination.password.clone(),
                debug: destination.debug,
            },
            trigger: self.schedule.trigger()?,
            overlap: self.schedule.overlap,
            max_consecutive_aborts: self.schedule.max_consecutive_aborts()?,
            output: self.output.kind,
            document_id_field,
        })
    }

    fn read_statement(&self) -> Result<String, ConfigError> {
        let statement = match (&self.source.statement, &self.source.statement_filepath) {
            (Some(inline), None) => inline.clone(),
            (None, Some(path)) => {
                let path = match &self.base_dir {
                    Some(base) if path.is_relative() => base.join(path),
                    _ => path.clone(),
                };
                fs::read_to_string(&path)
                    .map_err(|source| ConfigError::StatementFile { path, source })?
            }
            _ => return Err(ConfigError::StatementSource),
        };

        if statement.trim().is_empty() {
            return Err(ConfigError::EmptyStatement);
        }
        Ok(statement)
    }
}

impl ScheduleConfig {
    /// No schedule means run exactly once.
    pub fn trigger(&self) -> Result<Trigger, ConfigError> {
        match (&self.cron, self.interval_secs) {
            (Some(cron), Some(_)) => Err(ConfigError::InvalidSchedule(
                cron.clone(),
                "`cron` and `interval_secs` are mutually exclusive".to_string(),
            )),
            (Some(cron), None) => Ok(Trigger::Cron(CronSchedule::parse(cron)?)),
            (None, Some(0)) => Err(ConfigError::NotPositive("schedule.interval_secs")),
            (None, Some(secs)) => Ok(Trigger::Interval(Duration::from_secs(secs))),
            (None, None) => Ok(Trigger::Once),
        }
    }

    fn max_consecutive_aborts(&self) -> Result<Option<u32>, ConfigError> {
        match self.max_consecutive_aborts {
            Some(0) => Err(ConfigError::NotPositive("schedule.max_consecutive_aborts")),
            other => Ok(other),
        }
    }
}

fn parse_endpoint(endpoint: &str) -> Result<Url, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidEndpoint(sanitize_url(endpoint), reason);

    let url = Url::parse(endpoint).map_err(|e| invalid(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid("scheme must be http or https".to_string()));
    }
    if url.cannot_be_a_base() {
        return Err(invalid("not a base URL".to_string()));
    }
    Ok(url)
}
