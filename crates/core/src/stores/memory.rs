use crate::models::{ChunkFilter, ChunkHit, ChunkRecord, DocumentVersion, HybridQuery};
use crate::traits::{InsertOutcome, MetadataStore, SearchIndex};
use crate::StoreError;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use tokio::sync::RwLock;

type VersionKey = (String, String, u32);

#[derive(Default)]
pub struct InMemoryMetadataStore {
    records: RwLock<BTreeMap<VersionKey, DocumentVersion>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

fn version_key(record: &DocumentVersion) -> VersionKey {
    (
        record.owner_id.clone(),
        record.file_name.clone(),
        record.version,
    )
}

fn sorted(mut records: Vec<DocumentVersion>) -> Vec<DocumentVersion> {
    records.sort_by(|left, right| {
        left.document_id
            .cmp(&right.document_id)
            .then(left.version.cmp(&right.version))
    });
    records
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn insert_version(&self, record: &DocumentVersion) -> Result<InsertOutcome, StoreError> {
        let mut records = self.records.write().await;
        let key = version_key(record);
        if records.contains_key(&key) {
            return Ok(InsertOutcome::Conflict);
        }
        records.insert(key, record.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn versions_by_file_name(
        &self,
        owner_id: &str,
        file_name: &str,
    ) -> Result<Vec<DocumentVersion>, StoreError> {
        let records = self.records.read().await;
        Ok(sorted(
            records
                .values()
                .filter(|record| record.owner_id == owner_id && record.file_name == file_name)
                .cloned()
                .collect(),
        ))
    }

    async fn versions_by_document(
        &self,
        document_id: &str,
    ) -> Result<Vec<DocumentVersion>, StoreError> {
        let records = self.records.read().await;
        Ok(sorted(
            records
                .values()
                .filter(|record| record.document_id == document_id)
                .cloned()
                .collect(),
        ))
    }

    async fn versions_by_owner(&self, owner_id: &str) -> Result<Vec<DocumentVersion>, StoreError> {
        let records = self.records.read().await;
        Ok(sorted(
            records
                .values()
                .filter(|record| record.owner_id == owner_id)
                .cloned()
                .collect(),
        ))
    }

    async fn get_version(
        &self,
        document_id: &str,
        version: u32,
    ) -> Result<Option<DocumentVersion>, StoreError> {
        let records = self.records.read().await;
        Ok(records
            .values()
            .find(|record| record.document_id == document_id && record.version == version)
            .cloned())
    }

    async fn delete_version(&self, record: &DocumentVersion) -> Result<bool, StoreError> {
        let mut records = self.records.write().await;
        Ok(records.remove(&version_key(record)).is_some())
    }
}

#[derive(Default)]
pub struct InMemorySearchIndex {
    chunks: RwLock<BTreeMap<String, ChunkRecord>>,
}

impl InMemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.chunks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.chunks.read().await.is_empty()
    }
}

#[async_trait]
impl SearchIndex for InMemorySearchIndex {
    async fn upsert_chunks(&self, chunks: &[ChunkRecord]) -> Result<(), StoreError> {
        let mut stored = self.chunks.write().await;
        for chunk in chunks {
            stored.insert(chunk.chunk_key.clone(), chunk.clone());
        }
        Ok(())
    }

    async fn delete_chunks(&self, chunk_keys: &[String]) -> Result<usize, StoreError> {
        let mut stored = self.chunks.write().await;
        Ok(chunk_keys
            .iter()
            .filter(|key| stored.remove(key.as_str()).is_some())
            .count())
    }

    async fn enumerate(
        &self,
        filter: &ChunkFilter,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ChunkRecord>, StoreError> {
        let stored = self.chunks.read().await;
        let lower = match after {
            Some(key) => Bound::Excluded(key.to_string()),
            None => Bound::Unbounded,
        };

        Ok(stored
            .range((lower, Bound::Unbounded))
            .map(|(_, chunk)| chunk)
            .filter(|chunk| filter.matches(chunk))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn hybrid_query(
        &self,
        query: &HybridQuery,
        query_vector: &[f32],
    ) -> Result<Vec<ChunkHit>, StoreError> {
        let stored = self.chunks.read().await;
        let filter = query.filter();
        let candidates = stored
            .values()
            .filter(|chunk| filter.matches(chunk))
            .collect::<Vec<_>>();

        let lexical = lexical_ranking(&candidates, &query.text, query.top_n);
        let vector = vector_ranking(&candidates, query_vector, query.top_n);

        let mut scored = HashMap::<&str, FusedHit>::new();
        apply_rrf(&mut scored, &lexical, LEXICAL_WEIGHT);
        apply_rrf(&mut scored, &vector, VECTOR_WEIGHT);

        let mut fused = scored.into_values().collect::<Vec<_>>();
        fused.sort_by(|left, right| {
            right
                .total_score
                .total_cmp(&left.total_score)
                .then_with(|| left.chunk.chunk_key.cmp(&right.chunk.chunk_key))
        });

        Ok(fused
            .into_iter()
            .take(query.top_n)
            .map(|hit| ChunkHit::from_record(hit.chunk, hit.total_score))
            .collect())
    }
}

const LEXICAL_WEIGHT: f64 = 0.5;
const VECTOR_WEIGHT: f64 = 0.5;

struct FusedHit<'a> {
    chunk: &'a ChunkRecord,
    total_score: f64,
}

fn apply_rrf<'a>(
    target: &mut HashMap<&'a str, FusedHit<'a>>,
    ranked: &[(&'a ChunkRecord, f64)],
    weight: f64,
) {
    const K: f64 = 60.0;
    for (position, &(chunk, raw_score)) in ranked.iter().enumerate() {
        let rank_component = 1.0 / (K + (position as f64 + 1.0));
        let entry = target
            .entry(chunk.chunk_key.as_str())
            .or_insert(FusedHit {
                chunk,
                total_score: 0.0,
            });
        entry.total_score += (weight * rank_component) + (raw_score * 0.01);
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|character: char| !character.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn lexical_ranking<'a>(
    candidates: &[&'a ChunkRecord],
    query: &str,
    limit: usize,
) -> Vec<(&'a ChunkRecord, f64)> {
    let terms = tokenize(query).into_iter().collect::<HashSet<_>>();
    if terms.is_empty() {
        return Vec::new();
    }

    let mut ranked = candidates
        .iter()
        .filter_map(|chunk| {
            let tokens = tokenize(&chunk.text).into_iter().collect::<HashSet<_>>();
            let matched = terms.iter().filter(|term| tokens.contains(*term)).count();
            (matched > 0).then(|| (*chunk, matched as f64 / terms.len() as f64))
        })
        .collect::<Vec<_>>();

    ranked.sort_by(|left, right| {
        right
            .1
            .total_cmp(&left.1)
            .then_with(|| left.0.chunk_key.cmp(&right.0.chunk_key))
    });
    ranked.truncate(limit);
    ranked
}

/// The `limit` nearest embedded chunks. Chunks without a vector are skipped.
fn vector_ranking<'a>(
    candidates: &[&'a ChunkRecord],
    query_vector: &[f32],
    limit: usize,
) -> Vec<(&'a ChunkRecord, f64)> {
    let mut ranked = candidates
        .iter()
        .filter_map(|chunk| {
            let embedding = chunk.embedding.as_ref()?;
            (embedding.len() == query_vector.len())
                .then(|| (*chunk, cosine_similarity(embedding, query_vector) as f64))
        })
        .collect::<Vec<_>>();

    ranked.sort_by(|left, right| {
        right
            .1
            .total_cmp(&left.1)
            .then_with(|| left.0.chunk_key.cmp(&right.0.chunk_key))
    });
    ranked.truncate(limit);
    ranked
}

fn cosine_similarity(left: &[f32], right: &[f32]) -> f32 {
    if left.len() != right.len() || left.is_empty() {
        return 0.0;
    }
    let dot: f32 = left.iter().zip(right).map(|(a, b)| a * b).sum();
    let left_norm: f32 = left.iter().map(|a| a * a).sum::<f32>().sqrt();
    let right_norm: f32 = right.iter().map(|b| b * b).sum::<f32>().sqrt();
    if left_norm < f32::EPSILON || right_norm < f32::EPSILON {
        0.0
    } else {
        dot / (left_norm * right_norm)
    }
}
