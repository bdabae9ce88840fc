use anyhow::Context;
use clap::{Parser, Subcommand};
use monitor_adapters::{
    DispatcherConfigUpdater, KubeSecretConfig, KubeSecretStore, RewriteOptions, RulerClient,
    RulerConfig, VaultClient,
};
use monitor_api::config::{FileConfig, ProcessConfig};
use monitor_api::AppState;
use monitor_core::auth::{AccessTokenConfig, AccessTokenVerifier, ClaimsTenantDirectory};
use monitor_core::SystemClock;
use monitor_executor::Executor;
use monitor_store::Store;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio::{net::TcpListener, sync::watch};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "alerting-monitor")]
#[command(about = "Multi-tenant alerting monitor control plane", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run DB migrations.
    Migrate,
    /// Run the API server and the task executor (default).
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let process = ProcessConfig::from_env().context("load process config")?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Migrate => migrate(&process).await,
        Command::Serve => serve(process).await,
    }
}

async fn connect(process: &ProcessConfig) -> anyhow::Result<sqlx::PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(&process.database_url())
        .await
        .context("connect monitor db")
}

async fn migrate(process: &ProcessConfig) -> anyhow::Result<()> {
    let pool = connect(process).await?;
    Store::migrate(&pool).await.context("migrate monitor db")?;
    tracing::info!("migrations complete");
    Ok(())
}

async fn serve(process: ProcessConfig) -> anyhow::Result<()> {
    let file = FileConfig::load(&process.config_file).context("load service config")?;
    let pool = connect(&process).await?;
    let store = Store::new(pool, Arc::new(SystemClock));

    let secret = resolve_auth_secret(&file).await?;
    let verifier = AccessTokenVerifier::from_hs256_config(AccessTokenConfig {
        issuer: file.auth.issuer.clone(),
        audience: file.auth.audience.clone(),
        current_kid: file.auth.kid.clone(),
        current_secret: secret,
        next_kid: file.auth.next_kid.clone(),
        next_secret: file.auth.next_secret.clone(),
        ttl: std::time::Duration::from_secs(300),
    })
    .context("init access token verifier")?;

    let ruler = Arc::new(RulerClient::new(RulerConfig {
        url: file.mimir.ruler_url.clone(),
        namespace: file.mimir.namespace.clone(),
    }));

    let config_store = Arc::new(
        KubeSecretStore::from_cluster(KubeSecretConfig {
            namespace: file.alertmanager.namespace.clone(),
            secret_name: file.alertmanager.secret_name.clone(),
            key: file.alertmanager.secret_key.clone(),
        })
        .context("init dispatcher config store")?,
    );
    let dispatcher = Arc::new(
        DispatcherConfigUpdater::new(
            config_store,
            RewriteOptions {
                require_tls: file.alertmanager.require_tls,
                insecure_skip_verify: file.alertmanager.insecure_skip_verify,
            },
        )
        .with_reload_url(&file.alertmanager.url),
    );

    let executor = Executor::new(store.clone(), ruler, dispatcher, file.executor_config()?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let executor_handle = tokio::spawn({
        let executor = executor.clone();
        let shutdown_rx = shutdown_rx.clone();
        async move { executor.run(shutdown_rx).await }
    });

    let state = AppState {
        store,
        verifier,
        directory: Arc::new(ClaimsTenantDirectory),
    };
    let app = monitor_api::router(state);

    let listener = TcpListener::bind(&process.bind)
        .await
        .with_context(|| format!("bind api to {}", process.bind))?;
    tracing::info!(
        event = "monitor.api.started",
        bind = %process.bind,
        "api listening"
    );

    let ctrl_c_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!(event = "monitor.shutdown", "shutdown signal received");
            let _ = ctrl_c_tx.send(true);
        }
    });

    let mut server_shutdown = shutdown_rx.clone();
    let server =
        axum::serve(listener, app.into_make_service()).with_graceful_shutdown(async move {
            while !*server_shutdown.borrow() {
                if server_shutdown.changed().await.is_err() {
                    break;
                }
            }
        });

    // Whatever stops the server also stops the executor loop.
    let server_res = server.await;
    let _ = shutdown_tx.send(true);
    let _ = executor_handle.await;

    server_res.context("serve api")?;
    Ok(())
}

async fn resolve_auth_secret(file: &FileConfig) -> anyhow::Result<String> {
    if let Some(secret) = &file.auth.secret {
        return Ok(secret.clone());
    }

    let Some(vault) = &file.vault else {
        anyhow::bail!("auth.secret is not set and no vault block is configured");
    };

    let token = match &vault.token_path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("read vault token from {path}"))?
            .trim()
            .to_string(),
        None => std::env::var("VAULT_TOKEN").context("VAULT_TOKEN not set")?,
    };

    let client = VaultClient::new(&vault.url, token);
    client
        .read_secret_field(&vault.secret_path, &vault.field)
        .await
        .map_err(anyhow::Error::from)
        .context("read auth secret from vault")
}
