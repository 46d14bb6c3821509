//! TOML configuration parsing and validation.
//!
//! All settings live in one TOML file (default `./config/cpfbot.toml`).
//! Every section is optional; omitted values fall back to the defaults
//! below. Secrets never live in the TOML file by default: the OpenAI API
//! key, the admin password and the optional app password are read from the
//! environment, which may be seeded from `.env` files (see
//! [`load_env_files`]). [`load_config`] folds the two passwords into
//! [`AuthConfig`]; a `Config` built in code never consults the environment.
//!
//! ```toml
//! [corpus]
//! sample_docs = "./data/sample_docs"
//! uploads = "./data/uploads"
//!
//! [index]
//! path = "./vector_db/cpfbot.sqlite"
//! collection = "cpf_bot_docs"
//!
//! [chunking]
//! chunk_size = 800
//! chunk_overlap = 100
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//!
//! [generation]
//! provider = "openai"
//! model = "gpt-4o-mini"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable holding the admin password.
pub const ADMIN_PASSWORD_ENV: &str = "CPF_ADMIN_PASSWORD";
/// Environment variable holding the optional app-wide password.
pub const APP_PASSWORD_ENV: &str = "CPF_APP_PASSWORD";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub corpus: CorpusConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub screening: ScreeningConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorpusConfig {
    #[serde(default = "default_sample_docs")]
    pub sample_docs: PathBuf,
    #[serde(default = "default_uploads")]
    pub uploads: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            sample_docs: default_sample_docs(),
            uploads: default_uploads(),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
        }
    }
}

impl CorpusConfig {
    /// Corpus directories in load order, labelled with their folder name.
    pub fn directories(&self) -> [(&'static str, &Path); 2] {
        [
            ("sample_docs", self.sample_docs.as_path()),
            ("uploads", self.uploads.as_path()),
        ]
    }
}

fn default_sample_docs() -> PathBuf {
    PathBuf::from("./data/sample_docs")
}
fn default_uploads() -> PathBuf {
    PathBuf::from("./data/uploads")
}
fn default_include_globs() -> Vec<String> {
    vec![
        "**/*.md".to_string(),
        "**/*.markdown".to_string(),
        "**/*.txt".to_string(),
        "**/*.pdf".to_string(),
    ]
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_index_path")]
    pub path: PathBuf,
    #[serde(default = "default_collection")]
    pub collection: String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            path: default_index_path(),
            collection: default_collection(),
        }
    }
}

fn default_index_path() -> PathBuf {
    PathBuf::from("./vector_db/cpfbot.sqlite")
}
fn default_collection() -> String {
    "cpf_bot_docs".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    800
}
fn default_chunk_overlap() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_max_top_k")]
    pub max_top_k: usize,
    /// Results scoring below this are dropped. `0.0` keeps everything.
    #[serde(default)]
    pub min_score: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            max_top_k: default_max_top_k(),
            min_score: 0.0,
        }
    }
}

fn default_top_k() -> usize {
    4
}
fn default_max_top_k() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `openai` or `hash` (offline, deterministic).
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            base_url: default_openai_base_url(),
            api_key_env: default_api_key_env(),
        }
    }
}

fn default_embedding_provider() -> String {
    "openai".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// `openai` or `extractive` (offline, quotes the context).
    #[serde(default = "default_generation_provider")]
    pub provider: String,
    #[serde(default = "default_chat_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default = "default_generation_retries")]
    pub max_retries: u32,
    #[serde(default = "default_generation_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            model: default_chat_model(),
            temperature: default_temperature(),
            max_tokens: None,
            max_retries: default_generation_retries(),
            timeout_secs: default_generation_timeout(),
            base_url: default_openai_base_url(),
            api_key_env: default_api_key_env(),
        }
    }
}

fn default_generation_provider() -> String {
    "openai".to_string()
}
fn default_chat_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_temperature() -> f32 {
    0.1
}
fn default_generation_retries() -> u32 {
    2
}
fn default_generation_timeout() -> u64 {
    60
}

/// What to do when a claim matches the injection denylist.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScreeningPolicy {
    #[default]
    Block,
    Warn,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScreeningConfig {
    #[serde(default = "default_max_claim_chars")]
    pub max_claim_chars: usize,
    #[serde(default)]
    pub policy: ScreeningPolicy,
    /// Additional phrases appended to the built-in denylist.
    #[serde(default)]
    pub extra_phrases: Vec<String>,
}

impl Default for ScreeningConfig {
    fn default() -> Self {
        Self {
            max_claim_chars: default_max_claim_chars(),
            policy: ScreeningPolicy::default(),
            extra_phrases: Vec::new(),
        }
    }
}

fn default_max_claim_chars() -> usize {
    2000
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    /// Fallback when `CPF_ADMIN_PASSWORD` is not set.
    #[serde(default)]
    pub admin_password: Option<String>,
    /// Fallback when `CPF_APP_PASSWORD` is not set.
    #[serde(default)]
    pub app_password: Option<String>,
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            admin_password: None,
            app_password: None,
            session_ttl_secs: default_session_ttl(),
        }
    }
}

impl AuthConfig {
    /// The admin password, if one is configured.
    pub fn admin_password(&self) -> Option<String> {
        non_empty(self.admin_password.clone())
    }

    /// The app-wide password. `None` disables the gate.
    pub fn app_password(&self) -> Option<String> {
        non_empty(self.app_password.clone())
    }

    /// Let `CPF_ADMIN_PASSWORD` and `CPF_APP_PASSWORD` override the file
    /// values. Called once by [`load_config`].
    pub fn apply_env(&mut self) {
        self.apply_secrets(
            secret_from_env(ADMIN_PASSWORD_ENV),
            secret_from_env(APP_PASSWORD_ENV),
        );
    }

    fn apply_secrets(&mut self, admin: Option<String>, app: Option<String>) {
        if admin.is_some() {
            self.admin_password = admin;
        }
        if app.is_some() {
            self.app_password = app;
        }
    }
}

fn default_session_ttl() -> u64 {
    8 * 60 * 60
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8501".to_string()
}

fn secret_from_env(name: &str) -> Option<String> {
    non_empty(std::env::var(name).ok())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl Config {
    /// A fully offline configuration rooted at `root`: hash embeddings,
    /// extractive generation, corpus and index under `root`.
    pub fn minimal(root: &Path) -> Self {
        let mut config = Config::default();
        config.corpus.sample_docs = root.join("data").join("sample_docs");
        config.corpus.uploads = root.join("data").join("uploads");
        config.index.path = root.join("vector_db").join("cpfbot.sqlite");
        config.embedding.provider = "hash".to_string();
        config.generation.provider = "extractive".to_string();
        config
    }

    /// Create the corpus directories and the index's parent directory.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.corpus.sample_docs)?;
        std::fs::create_dir_all(&self.corpus.uploads)?;
        if let Some(parent) = self.index.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    /// Check cross-field constraints. Called by [`load_config`].
    pub fn validate(&self) -> Result<()> {
        if self.chunking.chunk_size == 0 {
            bail!("chunking.chunk_size must be > 0");
        }
        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            bail!(
                "chunking.chunk_overlap ({}) must be less than chunking.chunk_size ({})",
                self.chunking.chunk_overlap,
                self.chunking.chunk_size
            );
        }

        if self.retrieval.top_k == 0 {
            bail!("retrieval.top_k must be >= 1");
        }
        if self.retrieval.max_top_k < self.retrieval.top_k {
            bail!("retrieval.max_top_k must be >= retrieval.top_k");
        }

        if self.index.collection.trim().is_empty() {
            bail!("index.collection must not be empty");
        }

        if self.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be > 0");
        }
        match self.embedding.provider.as_str() {
            "openai" | "hash" => {}
            other => bail!(
                "Unknown embedding provider: '{}'. Must be openai or hash.",
                other
            ),
        }
        if self.embedding.dims == Some(0) {
            bail!("embedding.dims must be > 0");
        }

        match self.generation.provider.as_str() {
            "openai" | "extractive" => {}
            other => bail!(
                "Unknown generation provider: '{}'. Must be openai or extractive.",
                other
            ),
        }
        if !(0.0..=2.0).contains(&self.generation.temperature) {
            bail!("generation.temperature must be in [0.0, 2.0]");
        }

        if self.screening.max_claim_chars == 0 {
            bail!("screening.max_claim_chars must be > 0");
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.auth.apply_env();
    config.validate()?;

    Ok(config)
}

/// Seed the environment from `.env` files without overriding variables
/// that are already set: first `./.env`, then `.env` next to the config.
pub fn load_env_files(config_path: &Path) {
    if let Ok(path) = dotenvy::dotenv() {
        tracing::debug!(path = %path.display(), "loaded environment file");
    }
    let beside_config = config_path
        .parent()
        .map(|dir| dir.join(".env"))
        .filter(|p| p.exists());
    if let Some(path) = beside_config {
        if let Err(e) = dotenvy::from_path(&path) {
            tracing::warn!(path = %path.display(), error = %e, "could not read environment file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        config.validate().unwrap();
        assert_eq!(config.chunking.chunk_size, 800);
        assert_eq!(config.chunking.chunk_overlap, 100);
        assert_eq!(config.retrieval.top_k, 4);
        assert_eq!(config.index.collection, "cpf_bot_docs");
        assert_eq!(config.generation.model, "gpt-4o-mini");
        assert_eq!(config.screening.policy, ScreeningPolicy::Block);
    }

    #[test]
    fn overlap_must_be_smaller_than_size() {
        let config: Config = toml::from_str(
            r#"
            [chunking]
            chunk_size = 100
            chunk_overlap = 100
            "#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("chunk_overlap"));
    }

    #[test]
    fn unknown_embedding_provider_rejected() {
        let config: Config = toml::from_str(
            r#"
            [embedding]
            provider = "ollama"
            "#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Unknown embedding provider"));
    }

    #[test]
    fn screening_policy_parses_lowercase() {
        let config: Config = toml::from_str(
            r#"
            [screening]
            policy = "warn"
            extra_phrases = ["pretend you are"]
            "#,
        )
        .unwrap();
        assert_eq!(config.screening.policy, ScreeningPolicy::Warn);
        assert_eq!(config.screening.extra_phrases.len(), 1);
    }

    #[test]
    fn environment_secrets_override_file_values() {
        let mut auth: AuthConfig = toml::from_str(
            r#"
            admin_password = "from-file"
            app_password = "   "
            "#,
        )
        .unwrap();
        assert_eq!(auth.admin_password().as_deref(), Some("from-file"));
        assert_eq!(auth.app_password(), None);

        auth.apply_secrets(None, Some("from-env".to_string()));
        assert_eq!(auth.admin_password().as_deref(), Some("from-file"));
        assert_eq!(auth.app_password().as_deref(), Some("from-env"));

        auth.apply_secrets(Some("env-admin".to_string()), None);
        assert_eq!(auth.admin_password().as_deref(), Some("env-admin"));
    }

    #[test]
    fn minimal_is_offline_and_valid() {
        let config = Config::minimal(Path::new("/tmp/cpfbot"));
        config.validate().unwrap();
        assert_eq!(config.embedding.provider, "hash");
        assert_eq!(config.generation.provider, "extractive");
        assert!(config.index.path.starts_with("/tmp/cpfbot"));
    }
}
