use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use super::loader::{load_text, DocumentKind};
use super::splitter::CharacterTextSplitter;
use super::{Chunk, DocumentIndex, FileIdentity, SplitDocument, Upload};
use crate::config::AppConfig;
use crate::models::Embedder;
use crate::storage::{embed_with_cache, EmbeddingStore};

/// Turns uploads into split documents and embedded indexes.
#[derive(Clone)]
pub struct RetrievalPreparer {
    files_dir: PathBuf,
    splitter: CharacterTextSplitter,
    store: Arc<dyn EmbeddingStore>,
}

pub fn sanitize_file_name(name: &str) -> anyhow::Result<String> {
    Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| anyhow::anyhow!("invalid file name: {:?}", name))
}

impl RetrievalPreparer {
    pub fn new(files_dir: PathBuf, splitter: CharacterTextSplitter, store: Arc<dyn EmbeddingStore>) -> Self {
        Self { files_dir, splitter, store }
    }

    pub fn from_config(cfg: &AppConfig, store: Arc<dyn EmbeddingStore>) -> anyhow::Result<Self> {
        let splitter = CharacterTextSplitter::new("\n", cfg.chunk_size, cfg.chunk_overlap)?;
        Ok(Self::new(cfg.files_dir(), splitter, store))
    }

    /// Persists the upload under the files dir, then loads and chunks it.
    pub async fn split(&self, upload: &Upload) -> anyhow::Result<SplitDocument> {
        let file_name = sanitize_file_name(&upload.file_name)?;
        let kind = DocumentKind::from_file_name(&file_name)?;

        tokio::fs::create_dir_all(&self.files_dir).await?;
        let path = self.files_dir.join(&file_name);
        tokio::fs::write(&path, &upload.bytes).await?;

        let bytes = upload.bytes.clone();
        let text = tokio::task::spawn_blocking(move || load_text(kind, &bytes)).await??;
        let chunks: Vec<Chunk> = self
            .splitter
            .split_text(&text)
            .into_iter()
            .enumerate()
            .map(|(index, text)| Chunk { index, text })
            .collect();
        info!(file = %file_name, path = %path.display(), chunks = chunks.len(), "document split");
        Ok(SplitDocument { identity: FileIdentity::of(&file_name, &upload.bytes), chunks })
    }

    pub async fn prepare(&self, upload: &Upload, embedder: &dyn Embedder) -> anyhow::Result<DocumentIndex> {
        let document = self.split(upload).await?;
        let texts: Vec<String> = document.chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = embed_with_cache(self.store.as_ref(), embedder, &document.identity.file_name, &texts).await?;
        info!(file = %document.identity.file_name, vectors = vectors.len(), "document indexed");
        DocumentIndex::new(document, vectors)
    }
}
