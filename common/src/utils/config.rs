use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Clone, Copy, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    OpenAI,
    Hashed,
}

fn default_embedding_backend() -> EmbeddingBackend {
    EmbeddingBackend::OpenAI
}

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub openai_api_key: String,
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: u32,
    #[serde(default = "default_embedding_backend")]
    pub embedding_backend: EmbeddingBackend,
    #[serde(default = "default_rate_limit_max_messages")]
    pub rate_limit_max_messages: u32,
    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,
    #[serde(default = "default_retrieval_top_k")]
    pub retrieval_top_k: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub aggregation_secret: Option<String>,
    #[serde(default = "default_aggregation_lookback_hours")]
    pub aggregation_lookback_hours: u32,
    #[serde(default = "default_aggregation_scan_limit")]
    pub aggregation_scan_limit: u32,
    #[serde(default)]
    pub expose_error_details: bool,
}

fn default_http_port() -> u16 {
    3000
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_chat_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_embedding_dimensions() -> u32 {
    1536
}

fn default_rate_limit_max_messages() -> u32 {
    10
}

fn default_rate_limit_window_secs() -> u64 {
    60
}

fn default_retrieval_top_k() -> usize {
    5
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_aggregation_lookback_hours() -> u32 {
    24
}

fn default_aggregation_scan_limit() -> u32 {
    1000
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            openai_api_key: String::new(),
            surrealdb_address: "ws://localhost:8000".to_string(),
            surrealdb_username: "root".to_string(),
            surrealdb_password: "root".to_string(),
            surrealdb_namespace: "svara".to_string(),
            surrealdb_database: "svara".to_string(),
            http_port: default_http_port(),
            openai_base_url: default_base_url(),
            chat_model: default_chat_model(),
            embedding_model: default_embedding_model(),
            embedding_dimensions: default_embedding_dimensions(),
            embedding_backend: default_embedding_backend(),
            rate_limit_max_messages: default_rate_limit_max_messages(),
            rate_limit_window_secs: default_rate_limit_window_secs(),
            retrieval_top_k: default_retrieval_top_k(),
            request_timeout_secs: default_request_timeout_secs(),
            aggregation_secret: None,
            aggregation_lookback_hours: default_aggregation_lookback_hours(),
            aggregation_scan_limit: default_aggregation_scan_limit(),
            expose_error_details: false,
        }
    }
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}
