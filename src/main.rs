//! Binary entry point: loads configuration, connects the durable backends,
//! spawns the ingress HTTP server and worker loop(s), and waits for a
//! shutdown signal. Exit codes: 0 clean shutdown, 1 fatal init failure,
//! 2 persistent storage unavailable at startup (§6).

use std::sync::Arc;
use std::time::Duration;

use taskforge_core::cli_driver::CliDriver;
use taskforge_core::config::Config;
use taskforge_core::flowlog::FlowLog;
use taskforge_core::gateway::ServiceGateway;
use taskforge_core::ingress::{IngressServer, IngressState};
use taskforge_core::queue::InProcessQueue;
use taskforge_core::repo::WorkspaceManager;
use taskforge_core::router::CompletionRouter;
use taskforge_core::store::{PostgresStore, TaskStore};
use taskforge_core::worker::{Worker, WorkerConfig};

fn init_tracing(format: taskforge_core::config::LogFormat) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(env_filter);
    match format {
        taskforge_core::config::LogFormat::Json => subscriber.json().init(),
        taskforge_core::config::LogFormat::Pretty => subscriber.init(),
    }
}

#[tokio::main]
async fn main() {
    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };
    init_tracing(config.log_format);

    let store: Arc<dyn TaskStore> = match PostgresStore::new(&config.database_url).await {
        Ok(store) => {
            if let Err(e) = store.run_migrations().await {
                tracing::error!(error = %e, "failed to run migrations");
                std::process::exit(2);
            }
            Arc::new(store)
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to connect to task store");
            std::process::exit(2);
        }
    };

    let redis_client = match redis::Client::open(config.redis_url.clone()) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "invalid redis url");
            std::process::exit(2);
        }
    };
    let redis_conn = match redis::aio::ConnectionManager::new(redis_client).await {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to connect to redis");
            std::process::exit(2);
        }
    };

    let queue = InProcessQueue::new(Duration::from_secs(config.lease_seconds), config.max_attempts);
    let flow_log = FlowLog::new(config.log_root.clone());

    let service_base_urls = config.service_base_urls().unwrap_or_else(|e| {
        tracing::error!(error = %e, "invalid service base urls");
        std::process::exit(1);
    });
    let webhook_secrets = config.webhook_secrets().unwrap_or_else(|e| {
        tracing::error!(error = %e, "invalid webhook secrets");
        std::process::exit(1);
    });

    let gateway = ServiceGateway::new(service_base_urls, 16);
    let router = Arc::new(CompletionRouter::new(gateway, redis_conn));
    let workspace = WorkspaceManager::new(
        config.workspace_root.clone(),
        Duration::from_secs(config.task_deadline_seconds),
    );
    workspace.spawn_reaper(Duration::from_secs(3600));

    let cli_driver = Arc::new(CliDriver::new(config.cli_provider));

    let worker = Arc::new(Worker {
        queue: queue.clone(),
        store: Arc::clone(&store),
        flow_log: Arc::clone(&flow_log),
        workspace: Arc::clone(&workspace),
        cli_driver,
        router,
        config: WorkerConfig {
            task_deadline: Duration::from_secs(config.task_deadline_seconds),
            lease_seconds: config.lease_seconds,
            max_attempts: config.max_attempts as i32,
            dequeue_block: Duration::from_secs(30),
            model: "default".to_string(),
            allowed_tools: Vec::new(),
        },
    });

    if let Err(e) = worker.reconcile().await {
        tracing::error!(error = %e, "startup reconciliation failed");
    }

    for _ in 0..config.max_concurrent_per_worker {
        let worker = Arc::clone(&worker);
        tokio::spawn(worker.run_forever());
    }

    let ingress_state = Arc::new(IngressState {
        store,
        queue,
        flow_log,
        webhook_secrets,
    });
    let mut ingress = IngressServer::new(config.bind_addr, ingress_state);
    if let Err(e) = ingress.start().await {
        tracing::error!(error = %e, "failed to start ingress controller");
        std::process::exit(1);
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
    tracing::info!("shutdown signal received");
    ingress.shutdown().await;
}
