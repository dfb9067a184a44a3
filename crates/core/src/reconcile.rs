use crate::embeddings::Embedder;
use crate::error::{Result, Stage};
use crate::models::{ChunkFilter, ReconcileReport, VersionGap};
use crate::orchestrator::{require, DocumentEngine};
use crate::traits::{MetadataStore, SearchIndex};
use std::collections::{BTreeMap, HashMap};
use tracing::{info, warn};

impl<M, S, E> DocumentEngine<M, S, E>
where
    M: MetadataStore,
    S: SearchIndex,
    E: Embedder,
{
    /// Missing chunks need the source text and are only reported; `repair`
    /// deletes orphaned chunks, including leftovers past a reused version's
    /// `chunk_count`.
    pub async fn reconcile(&self, owner_id: &str, repair: bool) -> Result<ReconcileReport> {
        require("owner_id", owner_id)?;

        let records = self
            .bounded(Stage::ReadMetadata, self.metadata.versions_by_owner(owner_id))
            .await?
            .into_iter()
            .filter(|record| record.owner_id == owner_id)
            .collect::<Vec<_>>();
        let chunks = self.collect_chunks(&ChunkFilter::owner(owner_id)).await?;

        let expected = records
            .iter()
            .map(|record| {
                (
                    (record.document_id.as_str(), record.version),
                    record.chunk_count,
                )
            })
            .collect::<HashMap<_, _>>();

        let mut indexed = BTreeMap::<(&str, u32), usize>::new();
        let mut orphaned_chunks = Vec::new();
        for chunk in &chunks {
            match expected.get(&(chunk.document_id.as_str(), chunk.version)) {
                Some(&chunk_count) if chunk.sequence_index < chunk_count => {
                    *indexed
                        .entry((chunk.document_id.as_str(), chunk.version))
                        .or_default() += 1;
                }
                _ => orphaned_chunks.push(chunk.chunk_key.clone()),
            }
        }

        let missing_chunks = records
            .iter()
            .filter_map(|record| {
                let indexed_chunks = indexed
                    .get(&(record.document_id.as_str(), record.version))
                    .copied()
                    .unwrap_or(0);
                (indexed_chunks < record.chunk_count).then(|| VersionGap {
                    document_id: record.document_id.clone(),
                    version: record.version,
                    expected_chunks: record.chunk_count,
                    indexed_chunks,
                })
            })
            .collect::<Vec<_>>();

        let mut report = ReconcileReport {
            versions_checked: records.len(),
            missing_chunks,
            orphaned_chunks,
            orphaned_chunks_removed: 0,
        };

        for gap in &report.missing_chunks {
            warn!(
                owner_id,
                document_id = %gap.document_id,
                version = gap.version,
                expected = gap.expected_chunks,
                indexed = gap.indexed_chunks,
                "version is missing indexed chunks"
            );
        }

        if repair && !report.orphaned_chunks.is_empty() {
            for batch in report.orphaned_chunks.chunks(self.config.page_size) {
                report.orphaned_chunks_removed += self
                    .bounded(Stage::DeleteChunks, self.index.delete_chunks(batch))
                    .await?;
            }
        }

        info!(
            owner_id,
            versions_checked = report.versions_checked,
            missing = report.missing_chunks.len(),
            orphaned = report.orphaned_chunks.len(),
            orphaned_removed = report.orphaned_chunks_removed,
            "reconcile finished"
        );
        Ok(report)
    }
}
