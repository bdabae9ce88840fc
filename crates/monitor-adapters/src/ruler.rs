//! HTTP client for the rules engine ("ruler") config API.

use anyhow::Context;
use async_trait::async_trait;
use monitor_core::{DefinitionDetails, Error, Result, RulerAdapter};
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct RulerConfig {
    /// Base URL of the ruler, e.g. `http://mimir-ruler:8080`.
    pub url: String,
    /// Rule namespace the monitor owns.
    pub namespace: String,
}

#[derive(Debug, Clone)]
pub struct RulerClient {
    base_url: String,
    namespace: String,
    http: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct RuleGroup {
    name: String,
    interval: String,
    rules: Vec<serde_yaml::Value>,
}

impl RulerClient {
    pub fn new(cfg: RulerConfig) -> Self {
        Self {
            base_url: cfg.url.trim_end_matches('/').to_string(),
            namespace: cfg.namespace,
            http: reqwest::Client::new(),
        }
    }

    fn rules_url(&self) -> String {
        format!("{}/config/v1/rules/{}", self.base_url, self.namespace)
    }

    fn group_name(definition: &DefinitionDetails) -> String {
        format!("{}-{}", definition.name, definition.severity)
    }
}

/// Render one definition as a single-rule group document.
fn rule_group_yaml(definition: &DefinitionDetails) -> anyhow::Result<String> {
    let rule: serde_yaml::Value =
        serde_yaml::from_str(&definition.template).context("parse definition template")?;
    let group = RuleGroup {
        name: RulerClient::group_name(definition),
        interval: format!("{}s", definition.alert_interval),
        rules: vec![rule],
    };
    serde_yaml::to_string(&group).context("serialize rule group")
}

#[async_trait]
impl RulerAdapter for RulerClient {
    async fn update_definition_config(&self, definition: &DefinitionDetails) -> Result<()> {
        // A disabled definition is withdrawn from the ruler rather than
        // pushed; deleting an already absent group is a no-op.
        if !definition.enabled {
            let url = format!("{}/{}", self.rules_url(), Self::group_name(definition));
            let resp = self
                .http
                .delete(&url)
                .header("X-Scope-OrgID", &definition.tenant_id)
                .send()
                .await
                .context("DELETE rule group")
                .map_err(Error::dependency)?;

            if resp.status() != reqwest::StatusCode::NOT_FOUND {
                resp.error_for_status()
                    .context("DELETE rule group status")
                    .map_err(Error::dependency)?;
            }

            tracing::info!(
                event = "monitor.ruler.rule_group_deleted",
                tenant_id = %definition.tenant_id,
                uuid = %definition.uuid,
                version = definition.version,
                "disabled definition withdrawn from ruler"
            );
            return Ok(());
        }

        let body = rule_group_yaml(definition).map_err(Error::internal)?;
        let resp = self
            .http
            .post(self.rules_url())
            .header("X-Scope-OrgID", &definition.tenant_id)
            .header(reqwest::header::CONTENT_TYPE, "application/yaml")
            .body(body)
            .send()
            .await
            .context("POST rule group")
            .map_err(Error::dependency)?;

        resp.error_for_status()
            .context("POST rule group status")
            .map_err(Error::dependency)?;

        tracing::info!(
            event = "monitor.ruler.rule_group_pushed",
            tenant_id = %definition.tenant_id,
            uuid = %definition.uuid,
            version = definition.version,
            "definition pushed to ruler"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use monitor_core::{Category, EntityState, ValueBounds};

    fn definition() -> DefinitionDetails {
        DefinitionDetails {
            uuid: uuid::Uuid::nil(),
            version: 2,
            name: "cpu_usage".to_string(),
            template: "alert: HighCpu\nexpr: avg(cpu_usage) > 10\nduration: 45s\nthreshold: 10\n"
                .to_string(),
            category: Category::Performance,
            context: "host".to_string(),
            severity: "critical".to_string(),
            alert_interval: 60,
            enabled: true,
            state: EntityState::Pending,
            tenant_id: "edgenode".to_string(),
            duration: ValueBounds {
                value: 45,
                min: 10,
                max: 60,
            },
            threshold: ValueBounds {
                value: 10,
                min: 5,
                max: 50,
            },
        }
    }

    #[test]
    fn renders_single_rule_group() {
        let rendered = rule_group_yaml(&definition()).unwrap();
        assert!(rendered.contains("name: cpu_usage-critical"));
        assert!(rendered.contains("interval: 60s"));
        assert!(rendered.contains("alert: HighCpu"));
    }

    #[test]
    fn rejects_non_yaml_template() {
        let mut definition = definition();
        definition.template = ": not yaml [".to_string();
        assert!(rule_group_yaml(&definition).is_err());
    }
}
