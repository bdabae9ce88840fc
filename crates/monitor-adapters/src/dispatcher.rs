//! Dispatcher adapter: load config document, merge the receiver, store it
//! back, then ask the dispatcher to reload.

use anyhow::Context;
use async_trait::async_trait;
use monitor_core::{ConfigStore, DispatcherAdapter, Error, ReceiverDetails, Result};
use monitor_manifest::{RewriteOptions, SmtpCredentials};
use std::sync::Arc;

pub struct DispatcherConfigUpdater {
    store: Arc<dyn ConfigStore>,
    options: RewriteOptions,
    /// Dispatcher base URL; when set, `POST {url}/-/reload` is issued after
    /// a successful config write.
    reload_url: Option<String>,
    http: reqwest::Client,
}

impl DispatcherConfigUpdater {
    pub fn new(store: Arc<dyn ConfigStore>, options: RewriteOptions) -> Self {
        Self {
            store,
            options,
            reload_url: None,
            http: reqwest::Client::new(),
        }
    }

    pub fn with_reload_url(mut self, url: impl Into<String>) -> Self {
        self.reload_url = Some(url.into().trim_end_matches('/').to_string());
        self
    }

    async fn trigger_reload(&self) -> Result<()> {
        let Some(base) = &self.reload_url else {
            return Ok(());
        };

        let resp = self
            .http
            .post(format!("{base}/-/reload"))
            .send()
            .await
            .context("POST dispatcher reload")
            .map_err(Error::dependency)?;

        resp.error_for_status()
            .context("POST dispatcher reload status")
            .map_err(Error::dependency)?;
        Ok(())
    }
}

#[async_trait]
impl DispatcherAdapter for DispatcherConfigUpdater {
    async fn update_receiver_config(&self, receiver: &ReceiverDetails) -> Result<()> {
        let document = self.store.get().await?;
        let mut manifest = monitor_manifest::parse(&document).map_err(Error::internal)?;

        monitor_manifest::merge_receiver(
            &mut manifest,
            receiver,
            &self.options,
            &SmtpCredentials::from_env(),
        )
        .map_err(|err| Error::internal(anyhow::Error::from(err)))?;

        let rendered = monitor_manifest::serialize(&manifest).map_err(Error::internal)?;
        self.store.put(rendered).await?;
        self.trigger_reload().await?;

        tracing::info!(
            event = "monitor.dispatcher.receiver_pushed",
            tenant_id = %receiver.tenant_id,
            uuid = %receiver.uuid,
            version = receiver.version,
            "receiver merged into dispatcher config"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::MemoryConfigStore;
    use monitor_core::{EmailAddress, EntityState};

    const BASE_MANIFEST: &str = r#"
route:
  receiver: receiver-1
  routes:
    - receiver: receiver-1
receivers:
  - name: receiver-1
"#;

    fn receiver() -> ReceiverDetails {
        ReceiverDetails {
            uuid: uuid::Uuid::nil(),
            version: 3,
            name: "receiver".to_string(),
            state: EntityState::Pending,
            tenant_id: "tenant".to_string(),
            mail_server: "smtp.example.com:587".to_string(),
            from: EmailAddress::new("Alert", "Monitor", "alerts@example.com"),
            to: vec![EmailAddress::new("Jane", "Doe", "jane@example.com")],
        }
    }

    #[tokio::test]
    async fn updates_stored_document() {
        let store = Arc::new(MemoryConfigStore::new(BASE_MANIFEST));
        let updater = DispatcherConfigUpdater::new(
            store.clone(),
            RewriteOptions {
                require_tls: true,
                insecure_skip_verify: false,
            },
        );

        updater.update_receiver_config(&receiver()).await.unwrap();

        let document = store.document();
        assert!(document.contains("tenant-receiver-3"));
        assert!(document.contains("smtp_smarthost"));
        assert!(document.contains("smtp.example.com:587"));
        assert!(document.contains("Jane Doe <jane@example.com>"));
    }

    #[tokio::test]
    async fn empty_document_fails() {
        let store = Arc::new(MemoryConfigStore::new("receivers: []\n"));
        let updater = DispatcherConfigUpdater::new(store, RewriteOptions::default());

        let err = updater.update_receiver_config(&receiver()).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
