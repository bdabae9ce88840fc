//! Service configuration.
//!
//! Process-level knobs (bind address, config file location, database
//! connection) come from flags/env; everything else lives in the YAML
//! config file shipped with the deployment. Database parameters follow the
//! conventional `PG*` variables unless a full `DATABASE_URL` is given.

use anyhow::Context;
use clap::Parser;
use monitor_executor::ExecutorConfig;
use serde::Deserialize;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
pub struct ProcessConfig {
    /// Path to the service YAML config file.
    #[arg(
        long,
        env = "MONITOR_CONFIG",
        default_value = "/etc/alerting-monitor/config.yaml"
    )]
    pub config_file: String,

    /// Bind address for the HTTP server.
    #[arg(long, env = "MONITOR_BIND", default_value = "0.0.0.0:8080")]
    pub bind: String,

    /// Full database URL override; assembled from `PG*` variables when
    /// unset.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,
}

impl ProcessConfig {
    /// Parse config from environment only (no CLI parsing).
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self::parse_from(["alerting-monitor"]))
    }

    pub fn database_url(&self) -> String {
        if let Some(url) = &self.database_url {
            return url.clone();
        }
        let host = env_or("PGHOST", "localhost");
        let port = env_or("PGPORT", "5432");
        let user = env_or("PGUSER", "monitor");
        let password = env_or("PGPASSWORD", "monitor");
        let database = env_or("PGDATABASE", "monitor");
        format!("postgres://{user}:{password}@{host}:{port}/{database}")
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub alertmanager: AlertmanagerConfig,
    pub mimir: MimirConfig,
    #[serde(rename = "taskExecutor")]
    pub task_executor: TaskExecutorConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub vault: Option<VaultFileConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AlertmanagerConfig {
    /// Dispatcher base URL, used to trigger a config reload after writes.
    pub url: String,
    #[serde(rename = "requireTLS", default)]
    pub require_tls: bool,
    #[serde(rename = "insecureSkipVerify", default)]
    pub insecure_skip_verify: bool,
    /// Namespace holding the dispatcher config secret.
    pub namespace: String,
    #[serde(rename = "secretName", default = "default_secret_name")]
    pub secret_name: String,
    #[serde(rename = "secretKey", default = "default_secret_key")]
    pub secret_key: String,
}

fn default_secret_name() -> String {
    "alertmanager-config".to_string()
}

fn default_secret_key() -> String {
    "custom.yaml".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MimirConfig {
    /// Rule namespace the monitor owns in the ruler.
    pub namespace: String,
    #[serde(rename = "rulerURL")]
    pub ruler_url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskExecutorConfig {
    #[serde(rename = "uuidLimit")]
    pub uuid_limit: i64,
    #[serde(rename = "retryLimit")]
    pub retry_limit: i32,
    #[serde(rename = "taskTimeout")]
    pub task_timeout: String,
    #[serde(rename = "retentionTime")]
    pub retention_time: String,
    #[serde(rename = "dbPoolingRate")]
    pub db_pooling_rate: String,
}

#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    pub issuer: String,
    pub audience: String,
    pub kid: String,
    /// Inline signing secret; omit to resolve it from the vault block.
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(rename = "nextKid", default)]
    pub next_kid: Option<String>,
    #[serde(rename = "nextSecret", default)]
    pub next_secret: Option<String>,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let secret = self.secret.as_deref().map(|_| "<redacted>");
        let next_secret = self.next_secret.as_deref().map(|_| "<redacted>");
        f.debug_struct("AuthConfig")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("kid", &self.kid)
            .field("secret", &secret)
            .field("next_kid", &self.next_kid)
            .field("next_secret", &next_secret)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VaultFileConfig {
    pub url: String,
    #[serde(rename = "secretPath")]
    pub secret_path: String,
    pub field: String,
    /// File holding the vault token; `VAULT_TOKEN` is used when unset.
    #[serde(rename = "tokenPath", default)]
    pub token_path: Option<String>,
}

impl FileConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("read {path}"))?;
        serde_yaml::from_str(&raw).with_context(|| format!("parse {path}"))
    }

    pub fn executor_config(&self) -> anyhow::Result<ExecutorConfig> {
        Ok(ExecutorConfig {
            pooling_rate: parse_duration(&self.task_executor.db_pooling_rate)
                .context("taskExecutor.dbPoolingRate")?,
            task_timeout: parse_duration(&self.task_executor.task_timeout)
                .context("taskExecutor.taskTimeout")?,
            retry_limit: self.task_executor.retry_limit,
            retention_time: parse_duration(&self.task_executor.retention_time)
                .context("taskExecutor.retentionTime")?,
            uuid_limit: self.task_executor.uuid_limit,
        })
    }
}

/// Parse `"30s"`, `"5m"`, `"24h"` into a duration.
pub fn parse_duration(value: &str) -> anyhow::Result<Duration> {
    let value = value.trim();
    let (number, unit) = value.split_at(value.len().saturating_sub(1));
    let amount: u64 = number
        .parse()
        .with_context(|| format!("invalid duration `{value}`"))?;
    let secs = match unit {
        "s" => amount,
        "m" => amount * 60,
        "h" => amount * 3600,
        _ => anyhow::bail!("invalid duration unit in `{value}`"),
    };
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
alertmanager:
  url: http://alertmanager:9093
  requireTLS: true
  insecureSkipVerify: false
  namespace: observability
mimir:
  namespace: alerting-monitor
  rulerURL: http://mimir-ruler:8080
taskExecutor:
  uuidLimit: 10
  retryLimit: 3
  taskTimeout: 30s
  retentionTime: 24h
  dbPoolingRate: 5s
auth:
  issuer: idp.example
  audience: alerting-monitor
  kid: k1
  secret: local-dev-secret
"#;

    #[test]
    fn parses_full_config() {
        let cfg: FileConfig = serde_yaml::from_str(CONFIG).unwrap();
        assert_eq!(cfg.alertmanager.namespace, "observability");
        assert_eq!(cfg.alertmanager.secret_key, "custom.yaml");
        assert!(cfg.alertmanager.require_tls);
        assert_eq!(cfg.mimir.ruler_url, "http://mimir-ruler:8080");
        assert!(cfg.vault.is_none());

        let executor = cfg.executor_config().unwrap();
        assert_eq!(executor.pooling_rate, Duration::from_secs(5));
        assert_eq!(executor.task_timeout, Duration::from_secs(30));
        assert_eq!(executor.retention_time, Duration::from_secs(24 * 3600));
        assert_eq!(executor.retry_limit, 3);
        assert_eq!(executor.uuid_limit, 10);
    }

    #[test]
    fn rejects_unknown_keys() {
        let with_extra = format!("{CONFIG}extraBlock: {{}}\n");
        assert!(serde_yaml::from_str::<FileConfig>(&with_extra).is_err());
    }

    #[test]
    fn duration_parsing() {
        assert_eq!(parse_duration("45s").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert!(parse_duration("45").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("-5s").is_err());
    }
}
