use anyhow::Context;
use clap::Parser;
use fleet_core::load::SysinfoSampler;
use fleet_core::sensor::{SensorSource, SyntheticSensor};
use fleet_core::transport::HttpTransport;
use fleet_core::FleetNode;
use fleet_node::api::{self, ApiState};
use fleet_node::config::{NodeConfig, ProviderMode};
use std::sync::Arc;
use std::time::Duration;
use task_queue::{EchoProvider, HttpProvider, InferenceProvider, ModelTable, TaskExecutor};
use tracing::info;

#[derive(Parser)]
#[command(name = "fleetd")]
#[command(about = "Edge fleet node: supervisor or location agent, decided by config")]
struct Args {
    /// Path to the node's TOML configuration.
    #[arg(long, env = "FLEETD_CONFIG", default_value = "fleetd.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = NodeConfig::load(&args.config)?;
    info!(node = %config.node.id, location = %config.node.location, "starting fleetd");

    let provider: Arc<dyn InferenceProvider> = match config.provider.mode {
        ProviderMode::Echo => Arc::new(EchoProvider),
        ProviderMode::Http => {
            let base_url = config
                .provider
                .base_url
                .clone()
                .context("provider.base_url is required in http mode")?;
            let api_key = config
                .provider
                .api_key_env
                .as_deref()
                .and_then(|name| std::env::var(name).ok());
            if api_key.is_none() {
                info!("no provider API key in the environment, requests go unauthenticated");
            }
            Arc::new(HttpProvider::new(
                base_url,
                api_key,
                Duration::from_millis(config.provider.timeout_ms),
            ))
        }
    };
    let executor = TaskExecutor::new(
        provider,
        ModelTable::with_overrides(config.model_overrides()?),
        config.executor.concurrency,
        config.executor.max_retries,
    );

    let (transport, inbound) = HttpTransport::new(
        config.node.id.clone(),
        config.peer_urls(),
        config.request_timeout(),
    );

    let sensor: Option<Arc<dyn SensorSource>> = config
        .sensor
        .enabled
        .then(|| Arc::new(SyntheticSensor::new()) as Arc<dyn SensorSource>);

    let node = FleetNode::new(
        config.self_info(),
        config.fleet.supervisor.clone(),
        config.peer_infos(),
        config.fleet_config(),
        transport,
        Box::new(SysinfoSampler::new()),
        executor,
        sensor,
    );
    let handle = node.start().await;

    let state = ApiState {
        node: Arc::clone(&node),
        inbound,
    };
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&config.node.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.node.bind_addr))?;
    info!(addr = %config.node.bind_addr, "api listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    handle.shutdown();
    Ok(())
}
