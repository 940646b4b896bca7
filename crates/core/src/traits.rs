use crate::{BatchCommit, DocumentChunk, RagError, RetrievalHit};
use async_trait::async_trait;
use std::collections::HashSet;

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Embeds and durably commits one batch. A failed batch writes nothing.
    async fn add(&self, chunks: &[DocumentChunk]) -> Result<BatchCommit, RagError>;

    /// The `k` nearest chunks by similarity, best first.
    async fn query(&self, text: &str, k: usize) -> Result<Vec<RetrievalHit>, RagError>;

    async fn len(&self) -> usize;

    async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// `(checksum, chunk_index)` of every stored chunk that carries a source
    /// checksum. Indices that cannot tell report nothing.
    async fn indexed_chunks(&self) -> Result<HashSet<(String, u64)>, RagError> {
        Ok(HashSet::new())
    }
}
