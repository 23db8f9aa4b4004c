use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use emitter::catalog::CatalogStore;
use emitter::config::Config;
use emitter::jobs::JobStore;
use emitter::llm::embeddings::HttpEmbedder;
use emitter::llm::oracle::DecisionOracle;
use emitter::llm::transport::HttpChatTransport;
use emitter::models::{InputRowCreate, JobMode};
use emitter::pipeline::pacing::RateGate;
use emitter::pipeline::row::PipelineContext;
use emitter::pipeline::scheduler::BatchScheduler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let rows_path = args.next().ok_or_else(|| {
        anyhow::anyhow!("usage: emitter <rows.json> [auto|review]")
    })?;
    let mode = match args.next().as_deref() {
        Some("review") => JobMode::Review,
        _ => JobMode::Auto,
    };

    let config = Config::from_env();
    tracing::info!("Data directory: {}", config.data_dir.display());
    tracing::info!("Catalogue: {}", config.catalogue_version);
    tracing::info!("LLM: {} ({})", config.llm.model, config.llm.base_url);

    let catalog = Arc::new(CatalogStore::load(
        &config.catalogue_path(),
        &config.index_dir(),
        &config.vector_dir(),
    )?);

    let jobs = Arc::new(JobStore::open(&config.db_path(), config.workers as u32 + 1).await?);

    let http_client = reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(10))
        .build()?;
    let gate = Arc::new(RateGate::from_secs_f64(config.llm.min_call_interval_secs));
    let transport = Arc::new(HttpChatTransport::new(http_client.clone(), config.llm.clone()));
    let oracle = Arc::new(DecisionOracle::new(transport, gate, config.llm.clone()));
    let embedder = Arc::new(HttpEmbedder::new(http_client, config.embedding.clone()));

    let ctx = Arc::new(PipelineContext {
        catalog,
        embedder,
        oracle,
        jobs: jobs.clone(),
        retrieval: config.retrieval,
        catalogue_version: config.catalogue_version.clone(),
        llm_model: config.llm.model.clone(),
    });
    let scheduler = BatchScheduler::new(ctx, config.workers);

    let rows: Vec<InputRowCreate> =
        serde_json::from_str(&std::fs::read_to_string(&rows_path)?)?;
    anyhow::ensure!(!rows.is_empty(), "no input rows in {rows_path}");

    let job = jobs.create_job(mode).await?;
    jobs.add_input_rows(&job.id, &rows).await?;
    tracing::info!(job_id = %job.id, rows = rows.len(), "Job created");

    let status = scheduler.run_job(&job.id).await?;
    let counters = jobs.counters(&job.id).await?;

    println!("job {} -> {}", job.id, status.as_str());
    println!(
        "total {} | calculated {} | ambiguous {} | errors {}",
        counters.total, counters.calculated, counters.ambiguous, counters.errors
    );

    for row in jobs.load_rows(&job.id).await? {
        match jobs.load_result(row.id).await? {
            Some(result) if result.biogenic_t.is_some() => {
                println!(
                    "  #{} {} -> biogen {} t, common {} t",
                    row.row_index,
                    row.bezeichnung,
                    result.biogenic_t.as_deref().unwrap_or("-"),
                    result.common_t.as_deref().unwrap_or("-"),
                );
            }
            _ => {
                println!(
                    "  #{} {} -> {}{}",
                    row.row_index,
                    row.bezeichnung,
                    row.status.as_str(),
                    row.error_message
                        .as_deref()
                        .map(|m| format!(" ({m})"))
                        .unwrap_or_default(),
                );
            }
        }
    }

    Ok(())
}
