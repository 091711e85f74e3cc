use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::graph::GraphStoreKind;

#[derive(Clone, Copy, Deserialize, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackendKind {
    OpenAI,
    #[default]
    FastEmbed,
    Hashed,
}

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    #[serde(default)]
    pub openai_api_key: String,
    #[serde(default = "default_base_url")]
    pub openai_base_url: String,
    /// Model used for entity extraction, graph-query generation and LLM reranking.
    #[serde(default = "default_query_model")]
    pub query_model: String,

    #[serde(default)]
    pub embedding_backend: EmbeddingBackendKind,
    #[serde(default)]
    pub embedding_model: Option<String>,
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: u32,

    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,

    #[serde(default = "default_graph_store")]
    pub graph_store: GraphStoreKind,
    /// SPARQL query endpoint, e.g. `http://localhost:3030/kg/sparql`.
    #[serde(default = "default_fuseki_endpoint")]
    pub fuseki_endpoint: String,
    #[serde(default)]
    pub fuseki_username: Option<String>,
    #[serde(default)]
    pub fuseki_password: Option<String>,
    /// Neo4j Bolt address, e.g. `127.0.0.1:7687`.
    #[serde(default = "default_neo4j_uri")]
    pub neo4j_uri: String,
    #[serde(default = "default_neo4j_database")]
    pub neo4j_database: String,
    #[serde(default)]
    pub neo4j_username: Option<String>,
    #[serde(default)]
    pub neo4j_password: Option<String>,
    #[serde(default = "default_graph_http_timeout_ms")]
    pub graph_http_timeout_ms: u64,

    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub reranking_enabled: bool,
    #[serde(default)]
    pub reranking_pool_size: Option<usize>,
    #[serde(default)]
    pub fastembed_cache_dir: Option<String>,
    #[serde(default)]
    pub fastembed_show_download_progress: Option<bool>,
    #[serde(default)]
    pub fastembed_max_length: Option<usize>,

    /// Raw per-request search defaults; deserialized by the retrieval pipeline.
    #[serde(default)]
    pub search: Option<serde_json::Value>,
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_query_model() -> String {
    "gpt-4o-mini".to_string()
}

const fn default_embedding_dimensions() -> u32 {
    1536
}

const fn default_graph_store() -> GraphStoreKind {
    GraphStoreKind::Fuseki
}

fn default_fuseki_endpoint() -> String {
    "http://localhost:3030/kg/sparql".to_string()
}

fn default_neo4j_uri() -> String {
    "127.0.0.1:7687".to_string()
}

fn default_neo4j_database() -> String {
    "neo4j".to_string()
}

const fn default_graph_http_timeout_ms() -> u64 {
    10_000
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    get_config_from("config")
}

/// Loads `<name>.{toml,yaml,json,...}` when present, then overlays environment variables.
pub fn get_config_from(name: &str) -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name(name).required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}
