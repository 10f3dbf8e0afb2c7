//! Configuration for the CDC egress service
//!
//! Settings come from a YAML file selected on the command line, with the
//! source DSN falling back to the `DATABASE_URL` environment variable. The
//! configuration is validated once at boot and immutable afterwards.

use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};

use crate::errors::{CdcError, CdcResult};
use crate::model::DeltaStrategy;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub batch_control: BatchControlConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub tables: TableFilterConfig,
    #[serde(default)]
    pub reload_coordination: ReloadCoordinationConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ConnectionConfig {
    /// Source DSN in keyword=value or URL form. Falls back to `DATABASE_URL`.
    #[serde(default)]
    pub dsn: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplicationConfig {
    #[serde(default = "default_slot_name")]
    pub slot_name: String,
    #[serde(default = "default_publication_name")]
    pub publication_name: String,
    /// Standby status heartbeat; must stay below the server's
    /// wal_sender_timeout.
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_interval_seconds: u64,
    /// Table receiving event-trigger DDL captures, surfaced as DdlEvents.
    #[serde(default = "default_ddl_history")]
    pub ddl_history_table: String,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            slot_name: default_slot_name(),
            publication_name: default_publication_name(),
            keepalive_interval_seconds: default_keepalive_secs(),
            ddl_history_table: default_ddl_history(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchControlConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_seconds: u64,
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_size_bytes: u64,
    #[serde(default = "default_max_batch_rows")]
    pub max_batch_rows: u64,
}

impl Default for BatchControlConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval_secs(),
            max_batch_size_bytes: default_max_batch_bytes(),
            max_batch_rows: default_max_batch_rows(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    #[serde(default = "default_base_path")]
    pub base_path: PathBuf,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default = "default_timestamp_format")]
    pub timestamp_format: String,
    /// Emit an extra old-image row for updates when the replica identity
    /// makes the full old row available.
    #[serde(default)]
    pub emit_update_old: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            base_path: default_base_path(),
            compression: CompressionConfig::default(),
            timestamp_format: default_timestamp_format(),
            emit_update_old: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompressionConfig {
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    /// Balanced level for streaming batches.
    #[serde(default = "default_streaming_level")]
    pub level: u32,
    /// Maximum-compression level for full reloads.
    #[serde(default = "default_full_reload_level")]
    pub full_reload_level: u32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            level: default_streaming_level(),
            full_reload_level: default_full_reload_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableFilterConfig {
    #[serde(default = "default_include_schemas")]
    pub include_schemas: Vec<String>,
    #[serde(default)]
    pub exclude_schemas: Vec<String>,
    #[serde(default = "default_true")]
    pub require_primary_key: bool,
}

impl Default for TableFilterConfig {
    fn default() -> Self {
        Self {
            include_schemas: default_include_schemas(),
            exclude_schemas: Vec::new(),
            require_primary_key: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReloadCoordinationConfig {
    #[serde(default = "default_marker_prefix")]
    pub marker_prefix: String,
    #[serde(default)]
    pub delta_strategy: DeltaStrategy,
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_seconds: u64,
    /// Retries with a fresh export_id before an operation is abandoned.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for ReloadCoordinationConfig {
    fn default() -> Self {
        Self {
            marker_prefix: default_marker_prefix(),
            delta_strategy: DeltaStrategy::default(),
            operation_timeout_seconds: default_operation_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    #[serde(default = "default_export_workers")]
    pub max_export_workers: usize,
    /// Per-query bound for export and catalog statements.
    #[serde(default = "default_statement_timeout_secs")]
    pub statement_timeout_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_export_workers: default_export_workers(),
            statement_timeout_seconds: default_statement_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    /// Dedicated namespace for the bookkeeping tables; must be excluded from
    /// the replication publication.
    #[serde(default = "default_registry_schema")]
    pub schema: String,
    #[serde(default)]
    pub cleanup_after_days: Option<u32>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            schema: default_registry_schema(),
            cleanup_after_days: None,
        }
    }
}

fn default_slot_name() -> String {
    "wal2csv".to_string()
}
fn default_publication_name() -> String {
    "wal2csv_pub".to_string()
}
fn default_keepalive_secs() -> u64 {
    10
}
fn default_ddl_history() -> String {
    "public.ddl_history".to_string()
}
fn default_interval_secs() -> u64 {
    30
}
fn default_max_batch_bytes() -> u64 {
    64 * 1024 * 1024
}
fn default_max_batch_rows() -> u64 {
    100_000
}
fn default_base_path() -> PathBuf {
    PathBuf::from("/data")
}
fn default_timestamp_format() -> String {
    "%Y-%m-%dT%H-%M-%S".to_string()
}
fn default_algorithm() -> String {
    "gzip".to_string()
}
fn default_streaming_level() -> u32 {
    6
}
fn default_full_reload_level() -> u32 {
    9
}
fn default_include_schemas() -> Vec<String> {
    vec!["public".to_string()]
}
fn default_true() -> bool {
    true
}
fn default_marker_prefix() -> String {
    "CDC_RELOAD:".to_string()
}
fn default_operation_timeout_secs() -> u64 {
    3600
}
fn default_max_retries() -> u32 {
    3
}
fn default_export_workers() -> usize {
    4
}
fn default_statement_timeout_secs() -> u64 {
    600
}
fn default_registry_schema() -> String {
    "cdc_registry".to_string()
}

impl Config {
    /// Load from an optional YAML file, apply environment fallbacks, validate.
    pub fn load(path: Option<&Path>) -> CdcResult<Self> {
        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)?;
                serde_yaml::from_str(&raw)
                    .map_err(|e| CdcError::config(format!("cannot parse {}: {e}", p.display())))?
            }
            None => Config::default(),
        };

        if config.connection.dsn.trim().is_empty() {
            if let Ok(dsn) = env::var("DATABASE_URL") {
                config.connection.dsn = dsn;
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> CdcResult<()> {
        if self.connection.dsn.trim().is_empty() {
            return Err(CdcError::config(
                "connection.dsn is required (or set DATABASE_URL)",
            ));
        }

        let slot = &self.replication.slot_name;
        if slot.trim().is_empty() {
            return Err(CdcError::config("replication.slot_name cannot be empty"));
        }
        if !slot.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(CdcError::config(
                "replication.slot_name can only contain alphanumeric characters and underscores",
            ));
        }
        if slot.len() > 63 {
            // PostgreSQL identifier length limit
            return Err(CdcError::config(
                "replication.slot_name cannot be longer than 63 characters",
            ));
        }

        if self.replication.publication_name.trim().is_empty() {
            return Err(CdcError::config(
                "replication.publication_name cannot be empty",
            ));
        }

        if self.batch_control.interval_seconds == 0 {
            return Err(CdcError::config(
                "batch_control.interval_seconds must be at least 1",
            ));
        }
        if self.batch_control.max_batch_rows == 0 {
            return Err(CdcError::config("batch_control.max_batch_rows must be at least 1"));
        }

        if self.output.compression.algorithm != "gzip" {
            return Err(CdcError::config(format!(
                "unsupported compression algorithm '{}'; only 'gzip' is available",
                self.output.compression.algorithm
            )));
        }
        if self.output.compression.level > 9 || self.output.compression.full_reload_level > 9 {
            return Err(CdcError::config("gzip compression levels range from 0 to 9"));
        }

        if self.tables.include_schemas.is_empty() {
            return Err(CdcError::config("tables.include_schemas cannot be empty"));
        }

        if self.reload_coordination.marker_prefix.trim().is_empty() {
            return Err(CdcError::config(
                "reload_coordination.marker_prefix cannot be empty",
            ));
        }

        if self.workers.max_export_workers == 0 {
            return Err(CdcError::config("workers.max_export_workers must be at least 1"));
        }

        if self.registry.schema.trim().is_empty()
            || !self
                .registry
                .schema
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(CdcError::config(
                "registry.schema must be a plain identifier",
            ));
        }

        Ok(())
    }

    /// DSN for plain SQL connections.
    pub fn sql_dsn(&self) -> &str {
        &self.connection.dsn
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        let mut config = Config::default();
        config.connection.dsn = "host=localhost user=postgres dbname=app".to_string();
        config
    }

    #[test]
    fn test_defaults_validate() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_missing_dsn_rejected() {
        let config = Config::default();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("connection.dsn"));
    }

    #[test]
    fn test_slot_name_rules() {
        let mut config = valid();
        config.replication.slot_name = "bad-name".to_string();
        assert!(config.validate().is_err());

        config.replication.slot_name = "x".repeat(64);
        assert!(config.validate().is_err());

        config.replication.slot_name = "ok_slot_7".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_compression_bounds() {
        let mut config = valid();
        config.output.compression.level = 10;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.output.compression.algorithm = "zstd".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_round_trip() {
        let yaml = r#"
connection:
  dsn: "host=db user=cdc dbname=app"
replication:
  slot_name: egress
  publication_name: egress_pub
batch_control:
  interval_seconds: 5
  max_batch_rows: 1000
output:
  base_path: /var/lib/cdc
reload_coordination:
  marker_prefix: "RELOAD:"
  delta_strategy: apply
workers:
  max_export_workers: 2
registry:
  schema: cdc_meta
  cleanup_after_days: 30
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch_control.interval_seconds, 5);
        assert_eq!(config.reload_coordination.delta_strategy, DeltaStrategy::Apply);
        assert_eq!(config.registry.cleanup_after_days, Some(30));
        // untouched sections keep their defaults
        assert_eq!(config.batch_control.max_batch_size_bytes, 64 * 1024 * 1024);
        assert_eq!(config.tables.include_schemas, vec!["public"]);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let yaml = "connection:\n  dsn: x\n  verbose: true\n";
        assert!(serde_yaml::from_str::<Config>(yaml).is_err());
    }
}
