//! fogbridged — CoAP gateway between 6LoWPAN devices and the fog platform.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};

use fogbridge_core::config::FogbridgeConfig;
use fogbridge_core::wire::{PATH_HELLO, PATH_REQ};

use fogbridge_services::{
    ClientConfig, CoapClient, FogClient, GatewayServer, HelloHandler, KeyPusher,
    LinkRequestHandler, NodeRegistry, PlatformTls, PushSettings, Router,
};

mod shell;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = FogbridgeConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = FogbridgeConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        FogbridgeConfig::default()
    });

    if let Some(addr) = std::env::args().nth(1) {
        config.coap.listen_addr = addr;
    }
    let listen_addr: SocketAddr = config
        .coap
        .listen_addr
        .parse()
        .with_context(|| format!("invalid CoAP listen address {:?}", config.coap.listen_addr))?;
    tracing::info!(
        coap = %listen_addr,
        platform = %config.platform.address,
        "fogbridged starting"
    );

    // Shared state
    let registry = NodeRegistry::new();
    let client = CoapClient::new(ClientConfig::from(&config.coap));
    let pusher = Arc::new(KeyPusher::new(
        registry.clone(),
        client.clone(),
        PushSettings::from_config(&config.coap, &config.platform),
    ));

    // Fog platform
    let tls = PlatformTls::from_config(&config.platform)
        .context("failed to load TLS material for the fog platform channel")?;
    if tls.is_none() {
        tracing::warn!("no platform CA configured; fog platform channel is not encrypted");
    }
    let fog = FogClient::connect(&config.platform, tls.as_ref(), pusher)
        .await
        .with_context(|| format!("failed to connect to fog platform at {}", config.platform.address))?;
    fog.register_platform()
        .await
        .context("fog platform registration failed")?;
    tracing::info!(advertised = config.platform.advertised(), "registered with fog platform");

    // Handlers
    let router = {
        let mut r = Router::new();
        r.register(PATH_HELLO, Arc::new(HelloHandler));
        r.register(
            PATH_REQ,
            Arc::new(LinkRequestHandler::new(
                registry.clone(),
                fog.clone(),
                config.platform.advertised().to_string(),
                config.coap.explicit_errors,
            )),
        );
        Arc::new(r)
    };

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let server = GatewayServer::bind(
        listen_addr,
        router,
        config.coap.recv_buffer,
        shutdown_tx.subscribe(),
    )?;
    let gateway_addr = server.local_addr()?;
    let server_task = tokio::spawn(server.run());

    tokio::spawn(shell::run_shell(shell::ShellContext {
        registry: registry.clone(),
        client,
        gateway: gateway_addr,
        shutdown: shutdown_tx.clone(),
    }));

    let mut shutdown_rx = shutdown_tx.subscribe();
    tokio::select! {
        _ = shutdown_rx.recv() => {
            tracing::info!("fogbridged shutting down");
        }
        result = server_task => match result {
            Ok(Ok(())) => tracing::info!("gateway server stopped"),
            Ok(Err(e)) => return Err(e.context("gateway server failed")),
            Err(e) => anyhow::bail!("gateway server task panicked: {e}"),
        },
        _ = fog.closed() => {
            let _ = shutdown_tx.send(());
            anyhow::bail!("fog platform connection lost");
        }
    }

    tracing::info!(devices = registry.len(), "fogbridged stopped");
    Ok(())
}
