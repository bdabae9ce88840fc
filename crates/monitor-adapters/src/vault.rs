//! Minimal key-vault client used at startup to resolve the auth signing
//! secret when the deployment keeps it out of the config file.

use anyhow::Context;
use monitor_core::{Error, Result};
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct VaultConfig {
    /// Vault base URL, e.g. `https://vault.internal:8200`.
    pub url: String,
    /// Path of the secret under `/v1/`, e.g. `secret/data/alerting-monitor`.
    pub secret_path: String,
    /// Field within the secret data holding the value.
    pub field: String,
    pub token: String,
}

pub struct VaultClient {
    base_url: String,
    token: String,
    http: reqwest::Client,
}

impl std::fmt::Debug for VaultClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultClient")
            .field("base_url", &self.base_url)
            .field("token", &"<redacted>")
            .finish()
    }
}

impl VaultClient {
    pub fn new(url: &str, token: String) -> Self {
        Self {
            base_url: url.trim_end_matches('/').to_string(),
            token,
            http: reqwest::Client::new(),
        }
    }

    /// Read one field from a KV secret. Handles both KV v2 (`data.data`)
    /// and KV v1 (`data`) response shapes.
    pub async fn read_secret_field(&self, secret_path: &str, field: &str) -> Result<String> {
        let url = format!("{}/v1/{}", self.base_url, secret_path.trim_start_matches('/'));
        let resp = self
            .http
            .get(&url)
            .header("X-Vault-Token", &self.token)
            .send()
            .await
            .context("GET vault secret")
            .map_err(Error::dependency)?;

        let resp = resp
            .error_for_status()
            .context("GET vault secret status")
            .map_err(Error::dependency)?;

        let body: Value = resp
            .json()
            .await
            .context("decode vault secret")
            .map_err(Error::dependency)?;

        let value = body
            .pointer(&format!("/data/data/{field}"))
            .or_else(|| body.pointer(&format!("/data/{field}")))
            .and_then(Value::as_str)
            .ok_or_else(|| Error::not_found(format!("vault secret has no field {field}")))?;

        Ok(value.to_string())
    }
}
