use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

use crate::cli::config::PipelineConfig;
use crate::index::{HashEmbedder, MemoryVectorIndex};
use crate::pipeline::{HandlerFactory, HttpFetcher};
use crate::queue::manager::{QueueManager, STANDARD_QUEUES};
use crate::queue::QueueBackendFactory;
use crate::storage::DocumentStoreFactory;
use crate::supervisor::Supervisor;

fn load_config(profile: Option<String>) -> Result<PipelineConfig> {
    match profile {
        Some(name) => {
            PipelineConfig::load_profile(&name).context(format!("Failed to load profile: {name}"))
        }
        None => PipelineConfig::load_default(),
    }
}

async fn connect_queue(config: &PipelineConfig) -> Result<Arc<QueueManager>> {
    let backend = QueueBackendFactory::create(&config.backend)
        .await
        .context("Failed to connect to queue backend")?;
    Ok(Arc::new(QueueManager::new(backend)))
}

async fn build_supervisor(config: PipelineConfig) -> Result<Arc<Supervisor>> {
    let queue = connect_queue(&config).await?;
    let store = DocumentStoreFactory::create(&config.storage)
        .await
        .context("Failed to connect to document store")?;
    let fetcher = Arc::new(HttpFetcher::new(&config.fetch)?);
    let index = Arc::new(MemoryVectorIndex::new());
    let embedder = Arc::new(HashEmbedder::new(config.indexer.embedding_dim));

    let factory = HandlerFactory::new(
        config.clone(),
        queue.clone(),
        fetcher,
        store.clone(),
        index,
        embedder,
    );
    Ok(Supervisor::new(config, queue, factory, store))
}

/// Run the full pipeline until interrupted.
#[allow(clippy::too_many_arguments)]
pub async fn run(
    url: Option<String>,
    site_id: String,
    profile: Option<String>,
    fetchers: Option<usize>,
    cleaners: Option<usize>,
    persisters: Option<usize>,
    indexers: Option<usize>,
) -> Result<()> {
    let config = load_config(profile)?;
    let fetch_n = fetchers.unwrap_or(config.stages.fetch.workers);
    let clean_n = cleaners.unwrap_or(config.stages.clean.workers);
    let persist_n = persisters.unwrap_or(config.stages.persist.workers);
    let index_n = indexers.unwrap_or(config.stages.index.workers);

    let supervisor = build_supervisor(config.clone()).await?;
    supervisor
        .initialize_components(
            serde_json::to_value(&config.fetch)?,
            serde_json::Value::Null,
            serde_json::to_value(&config.storage)?,
            serde_json::to_value(&config.indexer)?,
        )
        .await?;
    supervisor
        .start_workers(fetch_n, clean_n, persist_n, index_n)
        .await?;
    supervisor.start_monitoring().await;

    supervisor
        .monitor()
        .add_alert_callback(|health| {
            warn!(queue = %health.queue_name, message = %health.message, "queue health alert");
        })
        .await;

    if let Some(url) = url {
        let task_id = supervisor.add_url_to_queue(&url, &site_id).await?;
        info!(task_id = %task_id, url = %url, "seed URL enqueued");
    }

    info!("pipeline running; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    supervisor.shutdown().await;
    Ok(())
}

/// Seed a URL onto the fetch queue.
pub async fn seed(url: String, site_id: String, profile: Option<String>) -> Result<()> {
    let config = load_config(profile)?;
    let queue = connect_queue(&config).await?;

    let envelope = crate::pipeline::PageEnvelope::seed(url.as_str(), site_id.as_str());
    let task_id = queue.enqueue("url", envelope, None).await?;

    println!("Enqueued {url} as task {task_id}");
    Ok(())
}

/// Seed a deletion directly at the persist stage.
pub async fn delete(url: String, site_id: String, profile: Option<String>) -> Result<()> {
    let config = load_config(profile)?;
    let queue = connect_queue(&config).await?;

    let envelope =
        crate::pipeline::PageEnvelope::delete_signal(url.as_str(), site_id.as_str());
    let task_id = queue.enqueue("clean", envelope, None).await?;

    println!("Enqueued deletion of {url} as task {task_id}");
    Ok(())
}

/// Show queue metrics and backend statistics.
pub async fn status(profile: Option<String>) -> Result<()> {
    let config = load_config(profile)?;
    let queue = connect_queue(&config).await?;

    println!("Queues:");
    for queue_name in STANDARD_QUEUES {
        let metrics = queue.get_queue_metrics(queue_name).await?;
        println!(
            "  {:<6} pending {:>5}  processing {:>4}  completed {:>6}  failed {:>4}  avg {:.2}s",
            queue_name,
            metrics.pending,
            metrics.processing,
            metrics.completed,
            metrics.failed,
            metrics.avg_processing_time,
        );
        if let Some(last_activity) = metrics.last_activity {
            println!("         last activity: {last_activity}");
        }
    }

    let stats = queue.backend().server_stats().await?;
    println!("Backend: {} {}", stats.backend, stats.version);
    println!("  uptime: {}s", stats.uptime_seconds);
    println!("  memory: {}", stats.used_memory);
    println!("  keys: {}", stats.total_keys);
    println!("  clients: {}", stats.connected_clients);

    Ok(())
}

/// Drain the pending list of a queue.
pub async fn clear(queue_name: String, profile: Option<String>) -> Result<()> {
    let config = load_config(profile)?;
    let queue = connect_queue(&config).await?;

    queue.clear_queue(&queue_name).await?;
    println!("Cleared pending tasks of queue {queue_name}");
    Ok(())
}

/// List all available configuration profiles
pub async fn list_profiles() -> Result<()> {
    let profiles = PipelineConfig::list_profiles()?;

    println!("Available configuration profiles:");
    for profile in profiles {
        println!("  - {}", profile);
    }

    Ok(())
}

/// Manage a specific configuration profile
pub async fn manage_profile(profile_name: String) -> Result<()> {
    match PipelineConfig::load_profile(&profile_name) {
        Ok(config) => {
            println!("Profile: {}", profile_name);
            println!("{:#?}", config);
        }
        Err(_) => {
            warn!("Profile '{}' does not exist. Creating a default profile.", profile_name);
            let config = PipelineConfig::default();
            config.save_as_profile(&profile_name)?;
            println!("Created default profile: {}", profile_name);
        }
    }

    Ok(())
}

/// Show the current configuration
pub async fn show_config() -> Result<()> {
    let config = PipelineConfig::load_default()?;
    println!("Current configuration:");
    println!("{:#?}", config);

    Ok(())
}
