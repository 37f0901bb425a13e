use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::lib::{
    api::types::ApiServer,
    broker::{memory::MemoryBroker, redis::RedisBroker, types::Broker},
    channel::registry::ChannelRegistry,
    config::types::{AppConfig, BrokerBackend},
    engine::types::DockerEngine,
    repository::memory::MemoryRepository,
    service::types::ContainerService,
    task::{processor::ContainerProcessor, producer::TaskProducer},
    worker::types::WorkerPool,
};

mod lib {
    pub mod api {
        pub mod api;
        pub mod types;
    }
    pub mod broker {
        pub mod memory;
        pub mod redis;
        pub mod types;
    }
    pub mod channel {
        pub mod registry;
        pub mod types;
    }
    pub mod config {
        pub mod config;
        pub mod types;
    }
    pub mod engine {
        pub mod config;
        pub mod docker;
        pub mod exec;
        #[cfg(test)]
        pub mod fake;
        pub mod types;
    }
    pub mod model {
        pub mod state;
        pub mod types;
    }
    pub mod repository {
        pub mod memory;
        pub mod types;
    }
    pub mod service {
        pub mod container;
        pub mod types;
    }
    pub mod task {
        pub mod processor;
        pub mod producer;
        pub mod types;
    }
    pub mod worker {
        pub mod types;
        pub mod worker;
    }
}

async fn connect_broker(config: &AppConfig) -> anyhow::Result<Arc<dyn Broker>> {
    match config.broker.backend {
        BrokerBackend::Redis => {
            let broker = RedisBroker::connect(&config.broker.url, &config.broker.prefix)
                .await
                .with_context(|| format!("connecting to redis at {}", config.broker.url))?;
            let recovered = broker.recover().await.context("recovering active tasks")?;
            if recovered > 0 {
                warn!("re-queued {} tasks from a previous run", recovered);
            }
            Ok(Arc::new(broker))
        }
        BrokerBackend::Memory => {
            warn!("using the in-memory broker, queued tasks are lost on exit");
            Ok(Arc::new(MemoryBroker::new()))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load().context("loading config")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log.level)),
        )
        .with_target(false)
        .init();

    let channels = Arc::new(ChannelRegistry::new(config.channel.capacity));
    let broker = connect_broker(&config).await?;
    let engine = Arc::new(DockerEngine::new(config.engine_config()).context("connecting to docker")?);
    let repo = Arc::new(MemoryRepository::new(
        config.catalog.templates.clone(),
        config.catalog.scripts.clone(),
    ));
    info!(
        "catalog has {} templates and {} scripts",
        config.catalog.templates.len(),
        config.catalog.scripts.len()
    );

    let producer = Arc::new(TaskProducer::new(
        broker.clone(),
        channels.clone(),
        config.timing_config(),
        config.create_options(),
        config.exec_options(),
    ));
    let processor = Arc::new(ContainerProcessor::new(
        engine,
        channels.clone(),
        repo.clone(),
        config.timing_config(),
    ));
    let service = Arc::new(ContainerService::new(
        producer,
        channels,
        repo.clone(),
        repo.clone(),
        repo,
        config.service_config(),
    ));

    let shutdown = CancellationToken::new();
    let workers = tokio::spawn(
        WorkerPool::new(broker, processor, config.worker_config()).run(shutdown.clone()),
    );

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
            }
            shutdown.cancel();
        });
    }

    let server = ApiServer::new(service, &config.server.listen);
    let served = server.start_server(shutdown.clone()).await;
    shutdown.cancel();
    workers.await.context("joining workers")?;

    served.with_context(|| format!("serving on {}", config.server.listen))
}
