// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon bootstrap: settings, provider registry, supervisor, and the
//! mutually-authenticated gRPC server.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::info;

use crate::config::Config;
use crate::config::Settings;
use crate::dispatch::Dispatch;
use crate::provider::{build_provider, ProviderRegistry};
use crate::redact::default_redactor;
use crate::supervisor::Supervisor;
use crate::transport::grpc::proto::agent_broker_server::AgentBrokerServer;
use crate::transport::{BrokerService, ClaimsDecoder, StaticTokenVerifier, TokenVerifier};

/// Initialize tracing from the config's format and level.
pub fn init_tracing(config: &Config) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let result = match config.log_format.as_str() {
        "json" => fmt::fmt().with_env_filter(filter).json().try_init(),
        _ => fmt::fmt().with_env_filter(filter).try_init(),
    };
    // A second init (tests) is fine.
    let _ = result;
}

/// Run the daemon until a shutdown signal arrives.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let settings = Settings::load(&config.settings)?;
    settings.check_required_env()?;

    let registry = Arc::new(ProviderRegistry::new());
    for spec in settings.providers.clone() {
        let id = spec.id.clone();
        let provider = build_provider(spec)
            .map_err(|e| anyhow::anyhow!("provider {id}: {}", e.message))?;
        registry
            .register(provider)
            .await
            .map_err(|e| anyhow::anyhow!("provider {id}: {}", e.message))?;
    }
    info!(providers = ?registry.list().await, "provider registry ready");

    let supervisor =
        Arc::new(Supervisor::new(registry, settings.policy.clone(), default_redactor()));
    supervisor.spawn_cleanup();
    let dispatch = Arc::new(Dispatch::new(Arc::clone(&supervisor)));

    let verifier: Arc<dyn TokenVerifier> = match config.auth_token {
        Some(ref token) => Arc::new(StaticTokenVerifier::new(token.clone())),
        None => Arc::new(ClaimsDecoder::new(Some("aviary".to_owned()))),
    };
    let shutdown = CancellationToken::new();
    let service = BrokerService::new(dispatch, verifier, shutdown.clone());

    let addr: std::net::SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("bind address: {e}"))?;

    let mut builder = Server::builder();
    if !config.insecure {
        let (Some(cert), Some(key), Some(ca)) =
            (&config.tls_cert, &config.tls_key, &config.tls_client_ca)
        else {
            anyhow::bail!("TLS certificate material is required without --insecure");
        };
        builder = builder.tls_config(crate::transport::tls::server_tls_config(cert, key, ca)?)?;
        info!(%addr, "listening with mutual TLS");
    } else {
        info!(%addr, "listening (insecure)");
    }

    builder
        .add_service(AgentBrokerServer::new(service))
        .serve_with_shutdown(addr, shutdown_signal())
        .await?;

    info!("shutting down");
    shutdown.cancel();
    supervisor.close().await;
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let ctrl_c = tokio::signal::ctrl_c();
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = ctrl_c.await;
        }
    }
}
