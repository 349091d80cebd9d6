pub mod index;
pub mod loader;
pub mod preparer;
pub mod splitter;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::models::Embedder;
use index::VectorIndex;

pub use preparer::RetrievalPreparer;

/// Raw uploaded file as received from the client.
#[derive(Debug, Clone)]
pub struct Upload {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileIdentity {
    pub file_name: String,
    pub fingerprint: String,
}

impl FileIdentity {
    pub fn of(file_name: &str, bytes: &[u8]) -> Self {
        Self { file_name: file_name.to_string(), fingerprint: hex::encode(Sha256::digest(bytes)) }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chunk {
    pub index: usize,
    pub text: String,
}

/// A loaded and chunked file, before embedding.
#[derive(Debug, Clone)]
pub struct SplitDocument {
    pub identity: FileIdentity,
    pub chunks: Vec<Chunk>,
}

/// Embedded chunks of one file with top-k lookup.
pub struct DocumentIndex {
    pub identity: FileIdentity,
    chunks: Vec<Chunk>,
    vectors: VectorIndex,
}

impl DocumentIndex {
    pub fn new(document: SplitDocument, vectors: Vec<Vec<f32>>) -> anyhow::Result<Self> {
        if document.chunks.len() != vectors.len() {
            anyhow::bail!("{} chunks but {} vectors", document.chunks.len(), vectors.len());
        }
        Ok(Self { identity: document.identity, chunks: document.chunks, vectors: VectorIndex::new(vectors) })
    }

    pub fn chunks(&self) -> &[Chunk] { &self.chunks }

    pub async fn retrieve(&self, embedder: &dyn Embedder, query: &str, k: usize) -> anyhow::Result<Vec<Chunk>> {
        if self.vectors.is_empty() {
            return Ok(Vec::new());
        }
        let q = embedder.embed_query(query).await?;
        Ok(self.vectors.top_k(&q, k).into_iter().map(|(i, _)| self.chunks[i].clone()).collect())
    }
}

pub fn format_docs(chunks: &[Chunk]) -> String {
    chunks.iter().map(|c| c.text.as_str()).collect::<Vec<_>>().join("\n\n")
}
