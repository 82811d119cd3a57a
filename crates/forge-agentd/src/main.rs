use std::{sync::Arc, time::Duration};

use anyhow::Context;
use forge_api::{
    HttpApi, RegistryAdapter,
    axum::{
        Router,
        extract::State,
        http::{StatusCode, header::CONTENT_TYPE},
        response::{IntoResponse, Response},
        routing::get,
    },
};
use forge_auction::{
    AuctionBroker, ClaimWorker, Dispatcher, MemoryBus, MemoryClaimStore, PubSub,
    RegistryReporter,
};
use forge_auth::{AuthConfig, AuthSessionManager, GithubProvider};
use forge_core::{JobRegistry, MemoryJobStore, MetricsHandle, init_uptime, node_id};
use forge_model::{ResourceKind, RetryPolicy, WorkerProfile};
use forge_observe::logger_init;
use forge_prometheus::{PrometheusMetrics, TEXT_FORMAT};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod config;
mod fulfiller;
mod pump;

use config::AgentConfig;
use fulfiller::SimulatedFulfiller;
use pump::QueuePump;

const PUMP_INTERVAL: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1) Config + logger
    let cfg = AgentConfig::from_env()?;
    logger_init(&cfg.logger)?;
    init_uptime();
    info!(node = node_id(), addr = %cfg.http_addr, workers = cfg.workers, "forge agent starting");

    // 2) Registry, bus and broker
    let root = CancellationToken::new();
    let prometheus = PrometheusMetrics::new().context("register metrics")?;
    let metrics: MetricsHandle = Arc::new(prometheus.clone());

    let bus = Arc::new(MemoryBus::new());
    let broker = AuctionBroker::with_options(
        bus.clone(),
        RetryPolicy::default(),
        metrics.clone(),
        root.clone(),
    );
    let registry = Arc::new(
        JobRegistry::new(Arc::new(MemoryJobStore::new()))
            .with_auction_control(Arc::new(broker.clone()))
            .with_metrics(metrics.clone())
            .with_root(root.clone()),
    );

    // 3) Claim workers
    let claims = Arc::new(MemoryClaimStore::new());
    let mut tasks = JoinSet::new();
    for n in 0..cfg.workers {
        let worker = ClaimWorker::new(
            format!("{}-{n}", node_id()),
            WorkerProfile::default(),
            claims.clone(),
            Arc::new(SimulatedFulfiller::new(cfg.fulfill_delay)),
            Arc::new(RegistryReporter::new(registry.clone())),
        )
        .with_metrics(metrics.clone())
        .with_shutdown(root.child_token());

        let bus: Arc<dyn PubSub> = bus.clone();
        tasks.spawn(async move {
            if let Err(e) = Arc::new(worker).run(bus, &ResourceKind::ALL).await {
                error!(error = %e, "claim worker failed");
            }
        });
    }

    // 4) Queue pump
    let pump = QueuePump::new(
        registry.clone(),
        Dispatcher::new(registry.clone(), broker.clone()),
        PUMP_INTERVAL,
    );
    tasks.spawn(pump.run(root.child_token()));

    // 5) HTTP API + /metrics
    let auth = AuthConfig::default();
    let provider = match &cfg.github_api {
        Some(base) => GithubProvider::with_api_base(base),
        None => GithubProvider::new(),
    }
    .with_timeout(auth.exchange_timeout);
    let sessions = Arc::new(AuthSessionManager::new(Arc::new(provider), auth)?);
    let app = HttpApi::new(Arc::new(RegistryAdapter::new(registry.clone())), sessions)
        .router()
        .merge(
            Router::new()
                .route("/metrics", get(serve_metrics))
                .with_state(prometheus),
        );

    let listener = tokio::net::TcpListener::bind(cfg.http_addr)
        .await
        .with_context(|| format!("bind {}", cfg.http_addr))?;
    info!(addr = %cfg.http_addr, "http api listening");

    let server = {
        let shutdown = root.clone();
        tokio::spawn(async move {
            forge_api::axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
        })
    };

    // 6) Run until Ctrl+C
    info!("press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!(uptime_s = forge_core::uptime_seconds(), "shutting down...");
    root.cancel();

    server.await?.context("http server")?;
    while tasks.join_next().await.is_some() {}
    info!("forge agent stopped");

    Ok(())
}

async fn serve_metrics(State(metrics): State<PrometheusMetrics>) -> Response {
    match metrics.encode() {
        Ok(body) => ([(CONTENT_TYPE, TEXT_FORMAT)], body).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
