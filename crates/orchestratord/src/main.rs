//! Orchestration daemon entry point.
//!
//! Exit codes: 0 graceful, 1 unhandled error, 2 configuration error,
//! 3 dependency unreachable after boot retries.

use anyhow::Result;
use message_bus::{
    events_topic, results_topic, BusConfig, KeyValueStore, MessageBus, MirrorBus, RedisClient,
    RedisKvStore, RedisStreamBus, SubscriptionSpec,
};
use orchestratord::api;
use orchestratord::config::OrchestratorConfig;
use orchestratord::dispatch::{AgentEventsHandler, ResultsHandler, REGISTRY_GROUP, RESULTS_GROUP};
use orchestratord::events::EventPublisher;
use orchestratord::service::WorkflowService;
use orchestratord::shutdown::ShutdownCoordinator;
use orchestratord::state::AppState;
use orchestratord::surface::SurfaceRouter;
use orchestratord::watchdog::Watchdog;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::time::interval;
use tracing::{error, info, warn};
use uuid::Uuid;
use workflow_engine::{
    legacy_definition, AgentRecord, AgentRegistry, EventType, LifecycleEvent, WorkflowType,
};
use workflow_store::{AgentRepository, PgStore};

const EXIT_OK: i32 = 0;
const EXIT_UNHANDLED: i32 = 1;
const EXIT_CONFIG: i32 = 2;
const EXIT_DEPENDENCY: i32 = 3;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let config = match OrchestratorConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            std::process::exit(EXIT_CONFIG);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&config.log_level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("{}", config.summary());

    let code = match run(config).await {
        Ok(()) => EXIT_OK,
        Err(e) => {
            if e.downcast_ref::<DependencyUnreachable>().is_some() {
                error!(error = %e, "dependency unreachable at boot");
                EXIT_DEPENDENCY
            } else {
                error!(error = %e, "unhandled error");
                EXIT_UNHANDLED
            }
        }
    };
    std::process::exit(code);
}

#[derive(Debug, thiserror::Error)]
#[error("dependency unreachable: {0}")]
struct DependencyUnreachable(String);

async fn connect_store(config: &OrchestratorConfig) -> Result<PgStore> {
    let mut attempt = 0u32;
    loop {
        match PgStore::connect(&config.database_url, config.db_pool_size).await {
            Ok(store) => return Ok(store),
            Err(e) if attempt < config.boot_retries => {
                attempt += 1;
                warn!(attempt, error = %e, "database connect failed, retrying");
                tokio::time::sleep(RedisClient::backoff_delay(attempt)).await;
            }
            Err(e) => return Err(DependencyUnreachable(e.to_string()).into()),
        }
    }
}

async fn connect_bus_client(config: BusConfig, boot_retries: u32, what: &str) -> Result<Arc<RedisClient>> {
    let mut attempt = 0u32;
    loop {
        match RedisClient::connect(config.clone()).await {
            Ok(client) => return Ok(Arc::new(client)),
            Err(e) if attempt < boot_retries => {
                attempt += 1;
                warn!(attempt, error = %e, what, "connect failed, retrying");
                tokio::time::sleep(RedisClient::backoff_delay(attempt)).await;
            }
            Err(e) => return Err(DependencyUnreachable(e.to_string()).into()),
        }
    }
}

async fn run(config: OrchestratorConfig) -> Result<()> {
    let config = Arc::new(config);

    // Dependencies, leaves first.
    let store = connect_store(&config).await?;
    store.migrate().await?;

    let bus_config = BusConfig {
        url: config.bus_url.clone(),
        namespace: config.namespace.clone(),
        ..BusConfig::default()
    };
    let kv_config = BusConfig {
        url: config.kv_url.clone(),
        namespace: config.namespace.clone(),
        ..BusConfig::default()
    };

    let bus_client = connect_bus_client(bus_config.clone(), config.boot_retries, "bus").await?;
    let kv_client = connect_bus_client(kv_config, config.boot_retries, "kv").await?;

    let bus: Arc<dyn MessageBus> = Arc::new(RedisStreamBus::new(bus_client));
    let kv: Arc<dyn KeyValueStore> = Arc::new(RedisKvStore::new(kv_client));
    let mirror = Arc::new(MirrorBus::new(bus_config)?);

    let store = Arc::new(store);
    let registry = Arc::new(AgentRegistry::new());
    let (watchdog, mut timeout_rx) = Watchdog::new();
    let watchdog = Arc::new(watchdog);

    let events = Arc::new(EventPublisher::new(bus.clone()));
    let mirror_bridge = events.spawn_mirror_bridge(mirror.clone());

    let service = Arc::new(WorkflowService::new(
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        registry.clone(),
        bus.clone(),
        kv.clone(),
        events.clone(),
        watchdog.clone(),
        config.default_task_timeout_ms,
    ));

    seed_registry(&service, store.clone()).await?;

    let state = AppState {
        service: service.clone(),
        surface_router: Arc::new(SurfaceRouter::new(config.webhook_secret.clone())),
        events: events.clone(),
        workflows: store.clone(),
        tasks: store.clone(),
        definitions: store.clone(),
        platforms: store.clone(),
        agents: store.clone(),
        stats: store.clone(),
        spans: store.clone(),
        bus: bus.clone(),
        kv: kv.clone(),
        config: config.clone(),
        started_at: Instant::now(),
        accepting: Arc::new(AtomicBool::new(true)),
        ready: Arc::new(AtomicBool::new(false)),
    };

    // One long-lived results subscription per core process.
    let results_subscription = bus
        .subscribe(
            SubscriptionSpec {
                topic: results_topic(),
                group: RESULTS_GROUP.to_string(),
                consumer: service.instance_id().to_string(),
            },
            Arc::new(ResultsHandler::new(service.clone(), events.clone())),
        )
        .await?;

    // Agent heartbeat ingestion on the events topic.
    let agents_subscription = bus
        .subscribe(
            SubscriptionSpec {
                topic: events_topic(),
                group: REGISTRY_GROUP.to_string(),
                consumer: service.instance_id().to_string(),
            },
            Arc::new(AgentEventsHandler::new(service.clone(), store.clone())),
        )
        .await?;

    let mut background = Vec::new();

    // Timeout watchdog drain.
    {
        let service = service.clone();
        background.push(tokio::spawn(async move {
            while let Some(fire) = timeout_rx.recv().await {
                if let Err(e) = service.handle_timeout(&fire).await {
                    warn!(error = %e, task_id = %fire.task_id, "timeout handling failed");
                }
            }
        }));
    }

    // Restart-safe overdue scan. A short lock keeps replicas from scanning
    // at the same moment; timers stay idempotent through dedup regardless.
    {
        let service = service.clone();
        let kv = kv.clone();
        background.push(tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                let token = match kv.acquire_lock("overdue-scan", Duration::from_secs(30)).await {
                    Ok(Some(token)) => token,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(error = %e, "overdue-scan lock unavailable");
                        continue;
                    }
                };
                match service.scan_overdue_tasks().await {
                    Ok(0) => {}
                    Ok(count) => info!(count, "overdue tasks timed out by scan"),
                    Err(e) => warn!(error = %e, "overdue scan failed"),
                }
                let _ = kv.release_lock("overdue-scan", token).await;
            }
        }));
    }

    // Heartbeat sweep: mark stale agents offline and tell observers.
    {
        let service = service.clone();
        let events = events.clone();
        background.push(tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(30));
            loop {
                ticker.tick().await;
                for agent in service.registry().sweep_offline(chrono::Utc::now()) {
                    warn!(agent_type = %agent.agent_type, "agent went offline");
                    events
                        .publish(LifecycleEvent::new(
                            EventType::AgentOffline,
                            None,
                            Uuid::nil(),
                            serde_json::json!({
                                "agent_type": agent.agent_type,
                                "platform_id": agent.platform_id,
                            }),
                        ))
                        .await;
                }
            }
        }));
    }

    // Periodic registry reload from the store.
    {
        let service = service.clone();
        let agents_repo: Arc<dyn AgentRepository> = store.clone();
        background.push(tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                match agents_repo.list().await {
                    Ok(rows) => service.registry().rebuild(rows),
                    Err(e) => warn!(error = %e, "registry reload failed"),
                }
            }
        }));
    }
    background.push(mirror_bridge);

    let app = api::router(state.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;
    state.mark_ready();
    info!(addr = %addr, "orchestrator listening");

    let shutdown_state = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown_state.stop_accepting();
        })
        .await?;

    ShutdownCoordinator {
        state,
        aux_subscriptions: vec![agents_subscription],
        results_subscription: Some(results_subscription),
        publisher: Some(events.retry_queue()),
        background,
        phase_timeout: config.shutdown_phase_timeout,
    }
    .run()
    .await;

    Ok(())
}

/// Load registry rows and make sure the built-in legacy agent types resolve
/// from the first request on.
async fn seed_registry(
    service: &Arc<WorkflowService>,
    agents: Arc<dyn AgentRepository>,
) -> Result<()> {
    let mut rows = agents.list().await?;

    let mut known: std::collections::HashSet<String> = rows
        .iter()
        .filter(|a| a.platform_id.is_none())
        .map(|a| a.agent_type.clone())
        .collect();

    for workflow_type in [WorkflowType::App, WorkflowType::Feature, WorkflowType::Bugfix] {
        for stage in legacy_definition(workflow_type).stages {
            if known.insert(stage.agent_type.clone()) {
                let record = AgentRecord::global(&stage.agent_type);
                agents.upsert(&record).await?;
                rows.push(record);
            }
        }
    }

    service.registry().rebuild(rows);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
