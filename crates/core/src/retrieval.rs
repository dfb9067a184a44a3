use crate::embeddings::Embedder;
use crate::error::{EngineError, Result, Stage};
use crate::models::{ChunkHit, HybridQuery};
use crate::orchestrator::{require, DocumentEngine};
use crate::traits::{MetadataStore, SearchIndex};
use std::collections::HashMap;
use tracing::{debug, warn};

impl<M, S, E> DocumentEngine<M, S, E>
where
    M: MetadataStore,
    S: SearchIndex,
    E: Embedder,
{
    pub async fn hybrid_search(
        &self,
        owner_id: &str,
        query_text: &str,
        top_n: usize,
    ) -> Result<Vec<ChunkHit>> {
        self.search(&HybridQuery::new(owner_id, query_text, top_n))
            .await
    }

    /// The owner filter is pushed into the index and checked again here.
    /// Hits are also checked against their version record, so chunks left
    /// behind by a failed delete never surface as part of a live version.
    pub async fn search(&self, query: &HybridQuery) -> Result<Vec<ChunkHit>> {
        require("owner_id", &query.owner_id)?;
        if query.text.trim().is_empty() {
            return Err(EngineError::Validation("query text is empty".to_string()));
        }
        if query.top_n == 0 {
            return Err(EngineError::Validation(
                "top_n must be at least 1".to_string(),
            ));
        }

        let query_vector = self
            .embed_bounded(&query.text)
            .await
            .map_err(EngineError::EmbeddingUnavailable)?;

        let hits = self
            .bounded(Stage::Query, self.index.hybrid_query(query, &query_vector))
            .await?;

        let filter = query.filter();
        let returned = hits.len();
        let mut hits = hits
            .into_iter()
            .filter(|hit| {
                hit.owner_id == filter.owner_id
                    && filter
                        .document_id
                        .as_ref()
                        .map_or(true, |document_id| &hit.document_id == document_id)
                    && filter
                        .version
                        .map_or(true, |version| hit.metadata.version == version)
            })
            .collect::<Vec<_>>();

        if hits.len() < returned {
            warn!(
                owner_id = %query.owner_id,
                dropped = returned - hits.len(),
                "index returned hits outside the query scope"
            );
        }

        let mut recorded = HashMap::<(String, u32), Option<usize>>::new();
        for hit in &hits {
            let key = (hit.document_id.clone(), hit.metadata.version);
            if recorded.contains_key(&key) {
                continue;
            }
            let record = self
                .bounded(
                    Stage::ReadMetadata,
                    self.metadata
                        .get_version(&hit.document_id, hit.metadata.version),
                )
                .await?;
            let chunk_count = record
                .filter(|record| record.owner_id == query.owner_id)
                .map(|record| record.chunk_count);
            recorded.insert(key, chunk_count);
        }

        let scoped = hits.len();
        hits.retain(|hit| {
            recorded
                .get(&(hit.document_id.clone(), hit.metadata.version))
                .copied()
                .flatten()
                .map_or(false, |chunk_count| hit.metadata.chunk_sequence < chunk_count)
        });
        if hits.len() < scoped {
            warn!(
                owner_id = %query.owner_id,
                dropped = scoped - hits.len(),
                "hits without a live version record dropped; run reconcile"
            );
        }

        hits.sort_by(|left, right| {
            right
                .score
                .total_cmp(&left.score)
                .then(left.chunk_key.cmp(&right.chunk_key))
        });
        hits.truncate(query.top_n);

        debug!(owner_id = %query.owner_id, hits = hits.len(), "hybrid search");
        Ok(hits)
    }
}
