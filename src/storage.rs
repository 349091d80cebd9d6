use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::{Pool, Sqlite, sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous}, Row};
use tracing::debug;

use crate::models::Embedder;

/// On-disk embedding cache, partitioned by namespace (the uploaded file name).
#[async_trait]
pub trait EmbeddingStore: Send + Sync {
    async fn get_many(&self, namespace: &str, keys: &[String]) -> anyhow::Result<HashMap<String, Vec<f32>>>;
    async fn put_many(&self, namespace: &str, entries: &[(String, Vec<f32>)]) -> anyhow::Result<()>;
}

/// Largest number of inputs sent in one embeddings request.
pub const EMBEDDING_BATCH_SIZE: usize = 1000;

#[derive(Clone)]
pub struct SqliteEmbeddingStore {
    pool: Pool<Sqlite>,
}

impl SqliteEmbeddingStore {
    pub async fn initialize(database_url: &str) -> anyhow::Result<Self> {
        if let Some(path) = database_url.strip_prefix("sqlite://") {
            if let Some(dir) = Path::new(path).parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)?;
            }
        }
        let options = database_url.parse::<SqliteConnectOptions>()?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(5000));
        let pool = Pool::<Sqlite>::connect_with(options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub fn pool(&self) -> &Pool<Sqlite> { &self.pool }

    #[cfg(test)]
    pub async fn count(&self, namespace: &str) -> anyhow::Result<i64> {
        let row = sqlx::query("SELECT count(*) AS c FROM embeddings WHERE namespace = ?1")
            .bind(namespace)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("c"))
    }
}

#[async_trait]
impl EmbeddingStore for SqliteEmbeddingStore {
    async fn get_many(&self, namespace: &str, keys: &[String]) -> anyhow::Result<HashMap<String, Vec<f32>>> {
        let mut out = HashMap::with_capacity(keys.len());
        for key in keys {
            if out.contains_key(key) { continue; }
            let row = sqlx::query("SELECT vector_json FROM embeddings WHERE namespace = ?1 AND text_hash = ?2")
                .bind(namespace)
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
            if let Some(r) = row {
                let json: String = r.get("vector_json");
                out.insert(key.clone(), serde_json::from_str(&json)?);
            }
        }
        Ok(out)
    }

    async fn put_many(&self, namespace: &str, entries: &[(String, Vec<f32>)]) -> anyhow::Result<()> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;
        for (key, vector) in entries {
            sqlx::query("INSERT OR REPLACE INTO embeddings (namespace, text_hash, vector_json, created_at) VALUES (?1, ?2, ?3, ?4)")
                .bind(namespace)
                .bind(key)
                .bind(serde_json::to_string(vector)?)
                .bind(&now)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

pub fn text_key(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Embeds `texts`, sending only cache misses to the provider in batches of
/// at most [`EMBEDDING_BATCH_SIZE`].
pub async fn embed_with_cache(
    store: &dyn EmbeddingStore,
    embedder: &dyn Embedder,
    namespace: &str,
    texts: &[String],
) -> anyhow::Result<Vec<Vec<f32>>> {
    let keys: Vec<String> = texts.iter().map(|t| text_key(t)).collect();
    let mut known = store.get_many(namespace, &keys).await?;

    let mut missing_keys: Vec<String> = Vec::new();
    let mut missing_texts: Vec<String> = Vec::new();
    for (key, text) in keys.iter().zip(texts) {
        if !known.contains_key(key) && !missing_keys.contains(key) {
            missing_keys.push(key.clone());
            missing_texts.push(text.clone());
        }
    }
    metrics::counter!("gpt_series_embedding_cache_hits_total").increment((texts.len() - missing_texts.len()) as u64);
    metrics::counter!("gpt_series_embedding_cache_misses_total").increment(missing_texts.len() as u64);
    debug!(namespace, total = texts.len(), misses = missing_texts.len(), "embedding cache lookup");

    for (batch_keys, batch_texts) in missing_keys.chunks(EMBEDDING_BATCH_SIZE).zip(missing_texts.chunks(EMBEDDING_BATCH_SIZE)) {
        let fresh = embedder.embed_documents(batch_texts).await?;
        if fresh.len() != batch_texts.len() {
            anyhow::bail!("expected {} embeddings, got {}", batch_texts.len(), fresh.len());
        }
        let entries: Vec<(String, Vec<f32>)> = batch_keys.iter().cloned().zip(fresh).collect();
        store.put_many(namespace, &entries).await?;
        known.extend(entries);
    }

    keys.iter()
        .map(|k| known.get(k).cloned().ok_or_else(|| anyhow::anyhow!("embedding missing for {}", k)))
        .collect()
}
