use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use poolgate_core::bootstrap::{build_runtime, prevalidate_credentials};
use poolgate_core::config_source::{ConfigSource, FileConfigSource};
use poolgate_core::{Gateway, HealthCheckScheduler, SchedulerConfig};
use poolgate_provider_impl::HttpClientConfig;
use poolgate_router::{gateway_router, AdminKeys, GatewayState};

mod cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();

    let source = FileConfigSource::new(&args.config);
    let mut config = source.load().await?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let filter = args
        .log
        .clone()
        .map(EnvFilter::new)
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(config.log.level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let bind = format!("{}:{}", config.server.host, config.server.port);
    let runtime = build_runtime(config, HttpClientConfig::default())
        .map_err(|errors| anyhow::anyhow!("invalid configuration:\n  - {}", errors.join("\n  - ")))?;

    // Bad key material should fail the deploy, not the first request.
    // Test environments run without live secrets.
    let environment = std::env::var("POOLGATE_ENV").unwrap_or_default();
    if environment != "test" {
        if let Err(errors) = prevalidate_credentials(&runtime.credentials).await {
            anyhow::bail!("credential validation failed:\n  - {}", errors.join("\n  - "));
        }
    }

    let gateway = Arc::new(Gateway::new(runtime));

    let _scheduler_handle = if args.no_health_checks {
        None
    } else {
        let runtime = gateway.runtime();
        let scheduler = Arc::new(HealthCheckScheduler::new(
            SchedulerConfig::default(),
            runtime.health.clone(),
        ));
        runtime.pool_manager.register_health_tasks(&scheduler);
        tracing::info!(tasks = scheduler.task_count(), "health scheduler started");
        Some(scheduler.spawn())
    };

    // SIGHUP swaps in a freshly validated snapshot; a bad file keeps the
    // current one running.
    #[cfg(unix)]
    {
        let gateway = gateway.clone();
        let config_path = args.config.clone();
        tokio::spawn(async move {
            let Ok(mut hangup) =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            else {
                return;
            };
            while hangup.recv().await.is_some() {
                let source = FileConfigSource::new(&config_path);
                if let Err(errors) = poolgate_core::bootstrap::reload(
                    &gateway,
                    &source,
                    HttpClientConfig::default(),
                )
                .await
                {
                    tracing::error!(
                        "config reload failed, keeping previous snapshot:\n  - {}",
                        errors.join("\n  - ")
                    );
                }
            }
        });
    }

    let admin_keys = AdminKeys::from_env();
    if admin_keys.is_empty() {
        tracing::warn!("ADMIN_API_KEY is not set; /v1 and /admin routes will reject all requests");
    }

    let app = gateway_router(GatewayState::new(gateway, admin_keys));
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    tracing::info!(%bind, "poolgate listening");
    axum::serve(listener, app).await?;
    Ok(())
}
