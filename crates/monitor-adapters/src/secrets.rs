//! Dispatcher config storage.
//!
//! The deployed dispatcher reads its configuration from a cluster secret;
//! the monitor owns one key of that secret (`custom.yaml` by default) and
//! rewrites it through the Kubernetes API using the pod's service account.

use anyhow::Context;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use monitor_core::{ConfigStore, Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Mutex;

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

#[derive(Debug, Clone)]
pub struct KubeSecretConfig {
    pub namespace: String,
    pub secret_name: String,
    /// Key within the secret holding the dispatcher config document.
    pub key: String,
}

pub struct KubeSecretStore {
    base_url: String,
    token: String,
    cfg: KubeSecretConfig,
    http: reqwest::Client,
}

impl std::fmt::Debug for KubeSecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeSecretStore")
            .field("base_url", &self.base_url)
            .field("token", &"<redacted>")
            .field("cfg", &self.cfg)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct SecretObject {
    #[serde(default)]
    data: BTreeMap<String, String>,
}

impl KubeSecretStore {
    /// Build a store from the in-cluster environment: API server address
    /// from `KUBERNETES_SERVICE_HOST`/`KUBERNETES_SERVICE_PORT`, bearer
    /// token and CA bundle from the mounted service account.
    pub fn from_cluster(cfg: KubeSecretConfig) -> anyhow::Result<Self> {
        let host =
            std::env::var("KUBERNETES_SERVICE_HOST").context("KUBERNETES_SERVICE_HOST not set")?;
        let port =
            std::env::var("KUBERNETES_SERVICE_PORT").context("KUBERNETES_SERVICE_PORT not set")?;

        let token = std::fs::read_to_string(format!("{SERVICE_ACCOUNT_DIR}/token"))
            .context("read service account token")?
            .trim()
            .to_string();
        let ca = std::fs::read(format!("{SERVICE_ACCOUNT_DIR}/ca.crt"))
            .context("read service account CA bundle")?;
        let ca = reqwest::Certificate::from_pem(&ca).context("parse service account CA")?;

        let http = reqwest::Client::builder()
            .add_root_certificate(ca)
            .build()
            .context("build kubernetes client")?;

        Ok(Self {
            base_url: format!("https://{host}:{port}"),
            token,
            cfg,
            http,
        })
    }

    fn secret_url(&self) -> String {
        format!(
            "{}/api/v1/namespaces/{}/secrets/{}",
            self.base_url, self.cfg.namespace, self.cfg.secret_name
        )
    }
}

#[async_trait]
impl ConfigStore for KubeSecretStore {
    async fn get(&self) -> Result<String> {
        let resp = self
            .http
            .get(self.secret_url())
            .bearer_auth(&self.token)
            .send()
            .await
            .context("GET dispatcher secret")
            .map_err(Error::dependency)?;

        let resp = resp
            .error_for_status()
            .context("GET dispatcher secret status")
            .map_err(Error::dependency)?;

        let secret: SecretObject = resp
            .json()
            .await
            .context("decode dispatcher secret")
            .map_err(Error::dependency)?;

        let encoded = secret.data.get(&self.cfg.key).ok_or_else(|| {
            Error::not_found(format!(
                "secret {} has no key {}",
                self.cfg.secret_name, self.cfg.key
            ))
        })?;

        let bytes = BASE64
            .decode(encoded.trim())
            .context("decode dispatcher config payload")
            .map_err(Error::internal)?;
        String::from_utf8(bytes)
            .context("dispatcher config is not utf-8")
            .map_err(Error::internal)
    }

    async fn put(&self, document: String) -> Result<()> {
        let patch = serde_json::json!({
            "data": {
                &self.cfg.key: BASE64.encode(document.as_bytes()),
            }
        });

        let resp = self
            .http
            .patch(self.secret_url())
            .bearer_auth(&self.token)
            .header(reqwest::header::CONTENT_TYPE, "application/merge-patch+json")
            .json(&patch)
            .send()
            .await
            .context("PATCH dispatcher secret")
            .map_err(Error::dependency)?;

        resp.error_for_status()
            .context("PATCH dispatcher secret status")
            .map_err(Error::dependency)?;
        Ok(())
    }
}

/// In-memory store for tests and local runs.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    document: Mutex<String>,
}

impl MemoryConfigStore {
    pub fn new(document: impl Into<String>) -> Self {
        Self {
            document: Mutex::new(document.into()),
        }
    }

    pub fn document(&self) -> String {
        self.document.lock().expect("config lock").clone()
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn get(&self) -> Result<String> {
        Ok(self.document())
    }

    async fn put(&self, document: String) -> Result<()> {
        *self.document.lock().expect("config lock") = document;
        Ok(())
    }
}
