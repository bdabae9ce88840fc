//! Dispatcher configuration manifest rewriter.
//!
//! The notification dispatcher is configured by a YAML document with a
//! `global` SMTP block, a routing tree and a list of named receivers. This
//! crate merges one receiver version into such a document: the receiver
//! entry and its sub-route are replaced in place when a previous version
//! exists, appended otherwise, and everything else round-trips untouched.
//!
//! Receiver names are `"<tenant>-<name>"`; the deployed entry carries the
//! version suffix (`"<tenant>-<name>-<version>"`). Lookup is by substring
//! containment so documents written by the legacy single-tenant deployment
//! (entries named without the tenant prefix) keep matching. The containment
//! rule can alias across tenants with prefix-overlapping names; it is kept
//! for upgrade compatibility.

use monitor_core::ReceiverDetails;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

const MAIL_TEMPLATE: &str = "{{ template \"alert.monitor.mail\" . }}";
const CATEGORY_MATCHER: &str = "alert_category=~\"health|performance\"";

/// Tenant whose routes must keep matching alerts without a project label.
pub const LEGACY_TENANT: &str = monitor_core::DEFAULT_TENANT;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteError {
    /// The document has no receivers to merge into.
    NoReceivers,
    /// The document has no routing tree to merge into.
    NoRoutes,
}

impl fmt::Display for RewriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RewriteError::NoReceivers => write!(f, "dispatcher config has no receivers"),
            RewriteError::NoRoutes => write!(f, "dispatcher config has no routes"),
        }
    }
}

impl std::error::Error for RewriteError {}

/// TLS knobs copied into every generated email config.
#[derive(Debug, Clone, Copy, Default)]
pub struct RewriteOptions {
    pub require_tls: bool,
    pub insecure_skip_verify: bool,
}

/// SMTP auth material for the `global` block.
///
/// Env-var reads are lifted here so the rewrite itself stays deterministic.
#[derive(Debug, Clone, Default)]
pub struct SmtpCredentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl SmtpCredentials {
    pub fn from_env() -> Self {
        Self {
            username: std::env::var("SMTP_USERNAME").ok(),
            password: std::env::var("SMTP_PASSWORD").ok(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Manifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global: Option<Global>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<Route>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub receivers: Vec<ReceiverEntry>,

    /// Blocks the rewriter never touches (`inhibit_rules`, `templates`, ...).
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Global {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smtp_from: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smtp_smarthost: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smtp_auth_username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smtp_auth_password: Option<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Route {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matchers: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReceiverEntry {
    pub name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub email_configs: Vec<EmailConfig>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EmailConfig {
    #[serde(default)]
    pub send_resolved: bool,

    #[serde(default)]
    pub to: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,

    // Always emitted, even when false: the dispatcher distinguishes an
    // absent key from an explicit `false`.
    #[serde(default)]
    pub require_tls: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_config: Option<TlsConfig>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TlsConfig {
    #[serde(default)]
    pub insecure_skip_verify: bool,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

pub fn parse(document: &str) -> anyhow::Result<Manifest> {
    serde_yaml::from_str(document).map_err(|err| anyhow::anyhow!("parse dispatcher config: {err}"))
}

pub fn serialize(manifest: &Manifest) -> anyhow::Result<String> {
    serde_yaml::to_string(manifest)
        .map_err(|err| anyhow::anyhow!("serialize dispatcher config: {err}"))
}

/// Merge one receiver version into the manifest.
pub fn merge_receiver(
    manifest: &mut Manifest,
    receiver: &ReceiverDetails,
    options: &RewriteOptions,
    credentials: &SmtpCredentials,
) -> Result<(), RewriteError> {
    let global = manifest.global.get_or_insert_with(Global::default);
    global.smtp_from = Some(receiver.from.email.clone());
    global.smtp_smarthost = Some(receiver.mail_server.clone());
    if let Some(username) = &credentials.username {
        global.smtp_auth_username = Some(username.clone());
    }
    if let Some(password) = &credentials.password {
        global.smtp_auth_password = Some(password.clone());
    }

    if manifest.receivers.is_empty() {
        return Err(RewriteError::NoReceivers);
    }

    let receiver_name = format!("{}-{}", receiver.tenant_id, receiver.name);
    let receiver_name_with_version = format!("{receiver_name}-{}", receiver.version);

    let entry = ReceiverEntry {
        name: receiver_name_with_version.clone(),
        email_configs: receiver
            .to
            .iter()
            .map(|recipient| EmailConfig {
                send_resolved: true,
                to: recipient.to_string(),
                html: Some(MAIL_TEMPLATE.to_string()),
                require_tls: options.require_tls,
                tls_config: Some(TlsConfig {
                    insecure_skip_verify: options.insecure_skip_verify,
                    extra: BTreeMap::new(),
                }),
                extra: BTreeMap::new(),
            })
            .collect(),
        extra: BTreeMap::new(),
    };

    match manifest
        .receivers
        .iter()
        .position(|existing| name_matches(&existing.name, &receiver.tenant_id, &receiver_name))
    {
        Some(index) => manifest.receivers[index] = entry,
        None => manifest.receivers.push(entry),
    }

    let route = manifest.route.as_mut().ok_or(RewriteError::NoRoutes)?;
    if route.routes.is_empty() {
        return Err(RewriteError::NoRoutes);
    }

    let sub_route = Route {
        receiver: Some(receiver_name_with_version),
        matchers: vec![
            CATEGORY_MATCHER.to_string(),
            project_matcher(&receiver.tenant_id),
        ],
        routes: Vec::new(),
        extra: BTreeMap::new(),
    };

    match route.routes.iter().position(|existing| {
        existing
            .receiver
            .as_deref()
            .is_some_and(|name| name_matches(name, &receiver.tenant_id, &receiver_name))
    }) {
        Some(index) => route.routes[index] = sub_route,
        None => route.routes.push(sub_route),
    }

    Ok(())
}

/// Substring match covering both the multi-tenant entry form and the legacy
/// single-tenant form (entry written without the tenant prefix).
fn name_matches(existing: &str, tenant_id: &str, receiver_name: &str) -> bool {
    if existing.contains(receiver_name) {
        return true;
    }
    format!("{tenant_id}-{existing}").contains(receiver_name)
}

/// The legacy tenant's route must match alerts carrying no project label.
fn project_matcher(tenant_id: &str) -> String {
    if tenant_id == LEGACY_TENANT {
        "projectId=~\"\"".to_string()
    } else {
        format!("projectId=~\"{tenant_id}\"")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use monitor_core::EmailAddress;

    const BASE_MANIFEST: &str = r#"
global:
  resolve_timeout: 5m
route:
  receiver: receiver-1
  routes:
    - receiver: receiver-1
receivers:
  - name: receiver-1
    email_configs:
      - to: old@example.com
        require_tls: false
templates:
  - /etc/dispatcher/templates/*.tmpl
"#;

    fn receiver(tenant: &str, name: &str, version: i64, to: &[&str]) -> ReceiverDetails {
        ReceiverDetails {
            uuid: uuid::Uuid::nil(),
            version,
            name: name.to_string(),
            state: monitor_core::EntityState::Pending,
            tenant_id: tenant.to_string(),
            mail_server: "smtp.example.com:587".to_string(),
            from: EmailAddress::new("Alert", "Monitor", "alerts@example.com"),
            to: to
                .iter()
                .map(|entry| EmailAddress::parse(entry).unwrap())
                .collect(),
        }
    }

    #[test]
    fn merges_receiver_and_route_in_place() {
        let mut manifest = parse(BASE_MANIFEST).unwrap();
        let receiver = receiver("tenant", "receiver", 3, &["u1 <u1@x>", "u2 <u2@x>"]);
        merge_receiver(
            &mut manifest,
            &receiver,
            &RewriteOptions {
                require_tls: true,
                insecure_skip_verify: true,
            },
            &SmtpCredentials::default(),
        )
        .unwrap();

        assert_eq!(manifest.receivers.len(), 1);
        let entry = &manifest.receivers[0];
        assert_eq!(entry.name, "tenant-receiver-3");
        assert_eq!(entry.email_configs.len(), 2);
        for config in &entry.email_configs {
            assert!(config.send_resolved);
            assert!(config.require_tls);
            assert_eq!(config.html.as_deref(), Some(MAIL_TEMPLATE));
            assert!(config.tls_config.as_ref().unwrap().insecure_skip_verify);
        }
        assert_eq!(entry.email_configs[0].to, "u1 <u1@x>");
        assert_eq!(entry.email_configs[1].to, "u2 <u2@x>");

        let route = manifest.route.as_ref().unwrap();
        assert_eq!(route.routes.len(), 1);
        let sub = &route.routes[0];
        assert_eq!(sub.receiver.as_deref(), Some("tenant-receiver-3"));
        assert_eq!(
            sub.matchers,
            vec![
                "alert_category=~\"health|performance\"".to_string(),
                "projectId=~\"tenant\"".to_string(),
            ]
        );

        let global = manifest.global.as_ref().unwrap();
        assert_eq!(global.smtp_from.as_deref(), Some("alerts@example.com"));
        assert_eq!(
            global.smtp_smarthost.as_deref(),
            Some("smtp.example.com:587")
        );
    }

    #[test]
    fn rewrite_is_idempotent() {
        let mut manifest = parse(BASE_MANIFEST).unwrap();
        let receiver = receiver("tenant", "receiver", 3, &["u1 <u1@x>"]);
        let options = RewriteOptions {
            require_tls: true,
            insecure_skip_verify: false,
        };

        merge_receiver(&mut manifest, &receiver, &options, &SmtpCredentials::default()).unwrap();
        let first = serialize(&manifest).unwrap();

        merge_receiver(&mut manifest, &receiver, &options, &SmtpCredentials::default()).unwrap();
        let second = serialize(&manifest).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn replaces_previous_version_of_same_receiver() {
        let mut manifest = parse(BASE_MANIFEST).unwrap();
        let options = RewriteOptions::default();

        let v3 = receiver("tenant", "receiver", 3, &["u1 <u1@x>"]);
        merge_receiver(&mut manifest, &v3, &options, &SmtpCredentials::default()).unwrap();
        let v4 = receiver("tenant", "receiver", 4, &["u2 <u2@x>"]);
        merge_receiver(&mut manifest, &v4, &options, &SmtpCredentials::default()).unwrap();

        assert_eq!(manifest.receivers.len(), 1);
        assert_eq!(manifest.receivers[0].name, "tenant-receiver-4");
        let route = manifest.route.as_ref().unwrap();
        assert_eq!(route.routes.len(), 1);
        assert_eq!(route.routes[0].receiver.as_deref(), Some("tenant-receiver-4"));
    }

    #[test]
    fn legacy_tenant_route_matches_unlabelled_alerts() {
        let mut manifest = parse(BASE_MANIFEST).unwrap();
        let receiver = receiver(LEGACY_TENANT, "receiver", 1, &["u1 <u1@x>"]);
        merge_receiver(
            &mut manifest,
            &receiver,
            &RewriteOptions::default(),
            &SmtpCredentials::default(),
        )
        .unwrap();

        let route = manifest.route.as_ref().unwrap();
        assert!(route.routes[0]
            .matchers
            .contains(&"projectId=~\"\"".to_string()));
    }

    #[test]
    fn require_tls_is_always_emitted() {
        let mut manifest = parse(BASE_MANIFEST).unwrap();
        let receiver = receiver("tenant", "receiver", 1, &["u1 <u1@x>"]);
        merge_receiver(
            &mut manifest,
            &receiver,
            &RewriteOptions {
                require_tls: false,
                insecure_skip_verify: false,
            },
            &SmtpCredentials::default(),
        )
        .unwrap();

        let rendered = serialize(&manifest).unwrap();
        assert!(rendered.contains("require_tls: false"));
    }

    #[test]
    fn smtp_credentials_are_written_when_present() {
        let mut manifest = parse(BASE_MANIFEST).unwrap();
        let receiver = receiver("tenant", "receiver", 1, &["u1 <u1@x>"]);
        merge_receiver(
            &mut manifest,
            &receiver,
            &RewriteOptions::default(),
            &SmtpCredentials {
                username: Some("mailer".to_string()),
                password: Some("hunter2".to_string()),
            },
        )
        .unwrap();

        let global = manifest.global.as_ref().unwrap();
        assert_eq!(global.smtp_auth_username.as_deref(), Some("mailer"));
        assert_eq!(global.smtp_auth_password.as_deref(), Some("hunter2"));
    }

    #[test]
    fn untouched_blocks_round_trip() {
        let mut manifest = parse(BASE_MANIFEST).unwrap();
        let receiver = receiver("tenant", "receiver", 1, &["u1 <u1@x>"]);
        merge_receiver(
            &mut manifest,
            &receiver,
            &RewriteOptions::default(),
            &SmtpCredentials::default(),
        )
        .unwrap();

        let rendered = serialize(&manifest).unwrap();
        assert!(rendered.contains("resolve_timeout: 5m"));
        assert!(rendered.contains("/etc/dispatcher/templates/*.tmpl"));
    }

    #[test]
    fn empty_receivers_and_routes_are_rejected() {
        let receiver = receiver("tenant", "receiver", 1, &["u1 <u1@x>"]);

        let mut no_receivers = parse("route:\n  routes:\n    - receiver: r\n").unwrap();
        assert_eq!(
            merge_receiver(
                &mut no_receivers,
                &receiver,
                &RewriteOptions::default(),
                &SmtpCredentials::default(),
            ),
            Err(RewriteError::NoReceivers)
        );

        let mut no_routes = parse("receivers:\n  - name: r\nroute:\n  receiver: r\n").unwrap();
        assert_eq!(
            merge_receiver(
                &mut no_routes,
                &receiver,
                &RewriteOptions::default(),
                &SmtpCredentials::default(),
            ),
            Err(RewriteError::NoRoutes)
        );
    }

    #[test]
    fn appends_when_no_previous_version_matches() {
        let mut manifest = parse(BASE_MANIFEST).unwrap();
        let options = RewriteOptions::default();

        let other = receiver("other", "pager", 1, &["u1 <u1@x>"]);
        merge_receiver(&mut manifest, &other, &options, &SmtpCredentials::default()).unwrap();

        // `receiver-1` is the legacy entry for tenant-receiver, not for
        // other-pager, so the new entry is appended.
        assert_eq!(manifest.receivers.len(), 2);
        assert_eq!(manifest.receivers[0].name, "receiver-1");
        assert_eq!(manifest.receivers[1].name, "other-pager-1");

        let route = manifest.route.as_ref().unwrap();
        assert_eq!(route.routes.len(), 2);
    }
}
