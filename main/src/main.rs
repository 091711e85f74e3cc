mod args;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use common::{
    graph::{build_graph_store, GraphStore},
    storage::{db::SurrealDbClient, store::SurrealChunkStore},
    utils::{
        config::{get_config_from, AppConfig},
        embedding::EmbeddingProvider,
        llm::{openai_client, LanguageModel, OpenAiLanguageModel},
    },
};
use retrieval_pipeline::{
    reranking::{PairScorer, RerankerPool},
    retrieve_with_diagnostics, retrieved_results_to_json,
    tokenizer::Tokenizer,
    RetrievalServices, SearchConfig,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::args::Args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Set up tracing
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let args = Args::parse();
    let config = get_config_from(&args.config).context("loading configuration")?;
    let search = args.apply(SearchConfig::from_app_config(&config)?);

    let services = build_services(&config).await?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling query");
            on_interrupt.cancel();
        }
    });

    let run = retrieve_with_diagnostics(&services, &args.kb_id, &args.query, search, &cancel).await?;
    info!(results = run.results.len(), "Retrieval finished");

    let output = if args.diagnostics {
        let mut diagnostics = serde_json::to_value(&run)?;
        if let Some(object) = diagnostics.as_object_mut() {
            object.insert("results".into(), retrieved_results_to_json(&run.results));
        }
        diagnostics
    } else {
        retrieved_results_to_json(&run.results)
    };
    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}

/// Builds every long-lived collaborator once for the lifetime of the process.
async fn build_services(config: &AppConfig) -> anyhow::Result<RetrievalServices> {
    let db = Arc::new(
        SurrealDbClient::new(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await
        .context("connecting to surrealdb")?,
    );
    db.build_indexes().await?;
    let chunk_store = Arc::new(SurrealChunkStore::new(db));
    let vector_store = Arc::clone(&chunk_store);

    let openai = openai_client(&config.openai_api_key, &config.openai_base_url);
    let embedder = Arc::new(EmbeddingProvider::from_config(config, Arc::clone(&openai)).await?);
    let llm: Option<Arc<dyn LanguageModel>> = if config.openai_api_key.is_empty() {
        warn!("No OpenAI key configured; LLM entity extraction, generated graph queries and LLM reranking are off");
        None
    } else {
        Some(Arc::new(OpenAiLanguageModel::new(openai, config.query_model.clone())))
    };

    let graph_store = build_graph_store(config).await?;
    let reranker = RerankerPool::maybe_from_config(config)?.map(|pool| pool as Arc<dyn PairScorer>);

    info!(
        embedding_backend = embedder.backend_label(),
        graph_dialect = %graph_store.dialect(),
        llm = llm.is_some(),
        reranker = reranker.is_some(),
        "Retrieval services initialized"
    );

    Ok(RetrievalServices {
        embedder,
        vector_store,
        corpus: chunk_store,
        graph_store,
        llm,
        tokenizer: Arc::new(Tokenizer::new()),
        reranker,
    })
}
