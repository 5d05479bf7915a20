use anyhow::{Context, Result};
use clap::Parser;
use docvec::ui::cli::{Cli, Commands};
use docvec::{BgeEmbedder, Config, EmbeddingProvider, FileWatcher, SearchResponse, SearchService};
use std::path::Path;
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("docvec=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::new(cli.base_dir.clone()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Init => handle_init(&config),
        Commands::Index { path, force } => handle_index(&config, &path, force).await,
        Commands::Reindex { path } => handle_index(&config, &path, false).await,
        Commands::Search { query, limit, json } => handle_search(&config, &query, limit, json).await,
        Commands::Status => handle_status(&config).await,
        Commands::Watch { path } => handle_watch(&config, &path).await,
    }
}

/// Load the local model; a failure leaves the service degraded instead of aborting
fn load_provider(config: &Config) -> Option<Arc<dyn EmbeddingProvider>> {
    match BgeEmbedder::init(config) {
        Ok(model) => Some(Arc::new(model)),
        Err(e) => {
            warn!("Embedding model unavailable: {}", e);
            None
        }
    }
}

fn open_service(config: &Config) -> Result<SearchService> {
    if !config.is_initialized() {
        anyhow::bail!("docvec is not initialized. Run 'docvec init' first.");
    }
    Ok(SearchService::open(config, load_provider(config))?)
}

fn handle_init(config: &Config) -> Result<()> {
    if config.is_initialized() {
        println!("docvec is already initialized at: {}", config.base_dir.display());
    } else {
        config.init()?;
        println!("✓ Created configuration directory: {}", config.base_dir.display());
        println!("✓ Created index directory: {}", config.index_dir.display());
        println!("✓ Created models directory: {}", config.models_dir.display());
        println!("✓ Wrote settings: {}", config.config_path().display());
    }

    if !BgeEmbedder::is_cached(config) {
        println!("Downloading embedding model...");
    }
    BgeEmbedder::init(config).context("Failed to load the embedding model")?;
    println!("✓ Embedding model ready");

    println!("\nNext steps:");
    println!("  1. Index your documents: docvec index /path/to/docs");
    println!("  2. Or watch for changes: docvec watch /path/to/docs");
    Ok(())
}

async fn handle_index(config: &Config, path: &Path, force: bool) -> Result<()> {
    let service = open_service(config)?;
    println!("Indexing documents from: {}", path.display());

    let report = service
        .index_with(path, force)
        .await
        .with_context(|| format!("Failed to index {}", path.display()))?;

    println!("\nIndexing complete!");
    println!("  Documents: {}", report.documents);
    println!("  Fragments: {}", report.fragments);
    println!("  Embedded: {}", report.embedded);
    if report.reused > 0 {
        println!("  Reused (unchanged): {}", report.reused);
    }
    if report.removed > 0 {
        println!("  Removed: {}", report.removed);
    }
    Ok(())
}

async fn handle_search(config: &Config, query: &str, limit: usize, json: bool) -> Result<()> {
    let service = open_service(config)?;

    if json {
        let response = service.search_response(query, limit).await;
        println!("{}", serde_json::to_string_pretty(&response)?);
        if let SearchResponse::Error { error } = response {
            anyhow::bail!(error);
        }
        return Ok(());
    }

    let hits = service.search(query, limit).await?;
    if hits.is_empty() {
        println!("No results found.");
        return Ok(());
    }

    println!("Found {} results:", hits.len());
    for (i, hit) in hits.iter().enumerate() {
        println!("\n{}. {} (score: {:.3})", i + 1, hit.source, hit.score);
        // Show preview of text (first 150 chars)
        let preview: String = hit.content.chars().take(150).collect();
        println!("   {}", preview.replace('\n', " "));
    }
    Ok(())
}

async fn handle_status(config: &Config) -> Result<()> {
    println!("Base directory: {}", config.base_dir.display());
    let service = SearchService::open(config, None)?;
    match service.stats().await {
        Some(stats) => {
            println!("Index generation: {}", stats.generation);
            println!("  Sources: {}", stats.sources);
            println!("  Fragments: {}", stats.fragments);
            if let (Some(model), Some(dimensions)) = (stats.model, stats.dimensions) {
                println!("  Model: {} ({} dimensions)", model, dimensions);
            }
        }
        None => println!("No index yet. Run 'docvec index <path>' first."),
    }
    Ok(())
}

async fn handle_watch(config: &Config, path: &Path) -> Result<()> {
    let service = Arc::new(open_service(config)?);
    if service.is_degraded() {
        anyhow::bail!("Cannot watch without an embedding model. Run 'docvec init' first.");
    }

    match service.reindex(path).await {
        Ok(report) => println!("Indexed {} fragments from {} documents", report.fragments, report.documents),
        Err(e) => warn!("Initial index failed: {}", e),
    }

    let watcher = FileWatcher::new(path, service)?;
    println!("Watching {} (press Ctrl+C to stop)", watcher.root().display());
    watcher.watch().await?;
    Ok(())
}
