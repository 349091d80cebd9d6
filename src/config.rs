use std::path::PathBuf;

pub const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini-2024-07-18";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-ada-002";
pub const ASSISTANT_NAME: &str = "GPT Series Research Assistant v1.0";

/// Process-wide configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub openai_base_url: String,
    pub chat_model: String,
    pub embedding_model: String,
    pub temperature: f32,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub retrieval_k: usize,
    pub cache_dir: PathBuf,
    pub report_path: PathBuf,
    pub wikipedia_base_url: String,
    pub duckduckgo_url: String,
    pub max_page_bytes: usize,
    pub assistant_name: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            openai_base_url: "https://api.openai.com/v1".into(),
            chat_model: DEFAULT_CHAT_MODEL.into(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.into(),
            temperature: 0.1,
            chunk_size: 600,
            chunk_overlap: 100,
            retrieval_k: 4,
            cache_dir: PathBuf::from(".cache"),
            report_path: PathBuf::from("research_report.txt"),
            wikipedia_base_url: "https://en.wikipedia.org".into(),
            duckduckgo_url: "https://html.duckduckgo.com/html/".into(),
            max_page_bytes: 262_144,
            assistant_name: ASSISTANT_NAME.into(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            openai_base_url: std::env::var("OPENAI_BASE_URL").unwrap_or(d.openai_base_url),
            chat_model: std::env::var("GPT_SERIES_CHAT_MODEL").unwrap_or(d.chat_model),
            embedding_model: std::env::var("GPT_SERIES_EMBEDDING_MODEL").unwrap_or(d.embedding_model),
            cache_dir: std::env::var("GPT_SERIES_CACHE_DIR").map(PathBuf::from).unwrap_or(d.cache_dir),
            report_path: std::env::var("GPT_SERIES_REPORT_PATH").map(PathBuf::from).unwrap_or(d.report_path),
            wikipedia_base_url: std::env::var("WIKIPEDIA_BASE_URL").unwrap_or(d.wikipedia_base_url),
            duckduckgo_url: std::env::var("DUCKDUCKGO_URL").unwrap_or(d.duckduckgo_url),
            ..d
        }
    }

    pub fn files_dir(&self) -> PathBuf {
        self.cache_dir.join("files")
    }

    pub fn embeddings_db_url(&self) -> String {
        let path = self.cache_dir.join("embeddings").join("embeddings.db");
        format!("sqlite://{}", path.to_string_lossy())
    }
}
