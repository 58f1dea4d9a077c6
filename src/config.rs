use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration, loaded from environment variables.
/// Every knob has a default that works against a local TEI + Qdrant setup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Environment tag baked into collection names (`dev`, `prod`, ...).
    pub env: String,
    pub embed_base_url: String,
    pub embed_model: String,
    pub embed_api_key: String,
    pub vector_url: String,
    pub vector_api_key: String,
    /// Directory holding the indexable git repositories, one per child.
    pub repos_dir: PathBuf,
    /// JSON cache of {repo_id -> last indexed commit}.
    pub state_file: PathBuf,
    /// SQLite registry database.
    pub registry_db: PathBuf,
    pub branch: String,
    /// Vector dimension; None means probe the embedding service.
    pub dim: Option<usize>,
    pub stack_type: Option<String>,
    /// Token budget per chunk, before the chars-per-token estimate.
    pub chunk_tokens: usize,
    pub chars_per_token_est: f64,
    pub chunk_token_fraction: f64,
    /// Line window for the generic chunker.
    pub chunk_lines: usize,
    pub embed_batch: usize,
    pub upsert_batch: usize,
    pub vector_timeout: Duration,
    pub skip_collection_init: bool,
    pub allow_data_reset: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            env: "dev".into(),
            embed_base_url: "http://localhost:8080".into(),
            embed_model: "nomic-ai/CodeRankEmbed".into(),
            embed_api_key: String::new(),
            vector_url: "http://localhost:6333".into(),
            vector_api_key: String::new(),
            repos_dir: PathBuf::from("repos"),
            state_file: PathBuf::from("index_state.json"),
            registry_db: PathBuf::from("registry.db"),
            branch: "main".into(),
            dim: None,
            stack_type: None,
            chunk_tokens: 512,
            chars_per_token_est: 1.5,
            chunk_token_fraction: 0.6,
            chunk_lines: 120,
            embed_batch: 32,
            upsert_batch: 128,
            vector_timeout: Duration::from_secs(30),
            skip_collection_init: false,
            allow_data_reset: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let d = Self::default();
        let repos_dir = PathBuf::from(env_or("REPOS_DIR", "repos"));
        let registry_db = std::env::var("REGISTRY_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| repos_dir.join("registry.db"));
        Self {
            env: env_or("APP_ENV", &d.env),
            embed_base_url: env_or("EMB_BASE_URL", &d.embed_base_url),
            embed_model: env_or("EMB_MODEL", &d.embed_model),
            embed_api_key: env_or("EMB_API_KEY", ""),
            vector_url: env_or("QDRANT_URL", &d.vector_url),
            vector_api_key: env_or("QDRANT_API_KEY", ""),
            repos_dir,
            state_file: PathBuf::from(env_or("STATE_FILE", "index_state.json")),
            registry_db,
            branch: env_or("GIT_BRANCH", &d.branch),
            dim: env_parse::<usize>("DIM").filter(|dim| *dim > 0),
            stack_type: std::env::var("STACK_TYPE").ok().filter(|s| !s.is_empty()),
            chunk_tokens: env_parse("CHUNK_TOKENS").unwrap_or(d.chunk_tokens),
            chars_per_token_est: env_parse("CHARS_PER_TOKEN_EST").unwrap_or(d.chars_per_token_est),
            chunk_token_fraction: env_parse("CHUNK_TOKEN_FRACTION")
                .unwrap_or(d.chunk_token_fraction),
            chunk_lines: env_parse("CHUNK_LINES").unwrap_or(d.chunk_lines),
            embed_batch: env_parse("EMBED_BATCH").unwrap_or(d.embed_batch).max(1),
            upsert_batch: env_parse("UPSERT_BATCH").unwrap_or(d.upsert_batch).max(1),
            vector_timeout: Duration::from_secs_f64(
                env_parse("VECTOR_TIMEOUT").unwrap_or(30.0f64).max(1.0),
            ),
            skip_collection_init: env_flag("SKIP_COLLECTION_INIT"),
            allow_data_reset: env_flag("ALLOW_DATA_RESET"),
        }
    }

    /// Collection name is deterministic from environment + model so that
    /// different embedding models never land in the same collection.
    pub fn collection(&self) -> String {
        format!("burrow-{}-{}", self.env, model_slug(&self.embed_model))
    }

    /// Per-chunk character cap: conservative chars-per-token estimate applied
    /// to the fraction of the token budget a single chunk may fill, floored
    /// so that empty chunks are impossible.
    pub fn max_content_chars(&self) -> usize {
        let cap = self.chunk_tokens as f64 * self.chunk_token_fraction * self.chars_per_token_est;
        (cap as usize).max(256)
    }
}

/// Lower-case the model name and strip every non-alphanumeric character.
pub fn model_slug(model: &str) -> String {
    model
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_flag(key: &str) -> bool {
    matches!(
        std::env::var(key).unwrap_or_default().to_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_name_slugs_model() {
        let config = Config {
            env: "dev".into(),
            embed_model: "nomic-ai/CodeRankEmbed".into(),
            ..Config::default()
        };
        assert_eq!(config.collection(), "burrow-dev-nomicaicoderankembed");
    }

    #[test]
    fn max_content_chars_has_floor() {
        let config = Config { chunk_tokens: 10, ..Config::default() };
        assert_eq!(config.max_content_chars(), 256);
    }

    #[test]
    fn max_content_chars_default() {
        // 512 tokens * 0.6 fraction * 1.5 chars/token
        assert_eq!(Config::default().max_content_chars(), 460);
    }

    #[test]
    fn model_slug_strips_punctuation() {
        assert_eq!(model_slug("text-embedding-3-large"), "textembedding3large");
    }
}
