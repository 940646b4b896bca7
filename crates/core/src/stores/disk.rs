use crate::embeddings::{cosine_similarity, Embedder};
use crate::traits::VectorIndex;
use crate::{
    BatchCommit, CollectionManifest, DocumentChunk, EmbeddingRecord, RagError, RetrievalHit,
    Session,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const COLLECTION_NAME: &str = "study_documents";
const MANIFEST_FILE: &str = "manifest.json";
const SEGMENT_PREFIX: &str = "segment-";
const SEGMENT_SUFFIX: &str = ".json";
const DEFAULT_EMBED_CONCURRENCY: usize = 4;
const MAX_PUBLISH_ATTEMPTS: usize = 32;

/// One committed batch on disk.
#[derive(Debug, Serialize, Deserialize)]
struct Segment {
    generation: Uuid,
    segment: u64,
    committed_at: DateTime<Utc>,
    records: Vec<EmbeddingRecord>,
}

/// What this handle has loaded of the collection currently on disk.
#[derive(Debug, Default)]
struct Collection {
    generation: Option<Uuid>,
    segments: BTreeSet<u64>,
    records: Vec<EmbeddingRecord>,
    next_record_id: u64,
}

impl Collection {
    fn for_generation(generation: Uuid) -> Self {
        Self {
            generation: Some(generation),
            ..Self::default()
        }
    }

    fn next_segment(&self) -> u64 {
        self.segments.last().map_or(0, |last| last + 1)
    }

    fn absorb(&mut self, segment: Segment) {
        if self.generation != Some(segment.generation) {
            *self = Self::for_generation(segment.generation);
        }
        if !self.segments.insert(segment.segment) {
            return;
        }
        if let Some(last) = segment.records.iter().map(|record| record.record_id).max() {
            self.next_record_id = self.next_record_id.max(last + 1);
        }
        self.records.extend(segment.records);
    }
}

/// Name prefix of the hidden directories a first commit is staged in, next to
/// the session directory.
pub(crate) fn staging_dir_prefix(session_id: &str) -> String {
    format!(".{session_id}.staging-")
}

/// Per-session collection persisted as a manifest plus one JSON segment per
/// committed batch under the session directory.
///
/// Segments are published with a hard link, which never replaces an existing
/// file, so handles on the same session cannot overwrite each other's
/// batches. Every `add`, `query` and `len` re-reads the manifest and picks up
/// segments written by other handles; a new manifest generation (reset and
/// re-ingest) drops everything loaded before.
pub struct DiskVectorStore<E> {
    session: Session,
    embedder: E,
    embed_concurrency: usize,
    collection: RwLock<Collection>,
    writer: Mutex<()>,
}

impl<E: Embedder> DiskVectorStore<E> {
    pub fn exists(session: &Session) -> bool {
        session.index_path.is_dir()
    }

    /// Loads a persisted collection. Never creates one.
    pub async fn open(session: Session, embedder: E) -> Result<Self, RagError> {
        let manifest = read_manifest(&session)
            .await?
            .ok_or_else(|| RagError::IndexNotFound {
                session: session.id.clone(),
            })?;
        if manifest.dimensions != embedder.dimensions() {
            return Err(RagError::DimensionMismatch {
                expected: manifest.dimensions,
                actual: embedder.dimensions(),
            });
        }
        if manifest.embedder != embedder.model_id() {
            warn!(
                session = %session.id,
                stored = %manifest.embedder,
                current = %embedder.model_id(),
                "collection was built with a different embedder"
            );
        }

        let store = Self::empty(session, embedder);
        store.refresh(&manifest).await?;
        {
            let collection = store.collection.read().await;
            info!(
                session = %store.session.id,
                records = collection.records.len(),
                segments = collection.segments.len(),
                "collection loaded"
            );
        }
        Ok(store)
    }

    /// Opens the collection if one was persisted, otherwise returns an empty
    /// store whose directory appears with its first committed batch.
    pub async fn open_or_create(session: Session, embedder: E) -> Result<Self, RagError> {
        if read_manifest(&session).await?.is_some() {
            return Self::open(session, embedder).await;
        }
        Ok(Self::empty(session, embedder))
    }

    fn empty(session: Session, embedder: E) -> Self {
        Self {
            session,
            embedder,
            embed_concurrency: DEFAULT_EMBED_CONCURRENCY,
            collection: RwLock::new(Collection::default()),
            writer: Mutex::new(()),
        }
    }

    pub fn with_embed_concurrency(mut self, embed_concurrency: usize) -> Self {
        self.embed_concurrency = embed_concurrency.max(1);
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn embedder(&self) -> &E {
        &self.embedder
    }

    fn manifest(&self, generation: Uuid) -> CollectionManifest {
        CollectionManifest {
            collection: COLLECTION_NAME.to_string(),
            generation,
            dimensions: self.embedder.dimensions(),
            embedder: self.embedder.model_id(),
            created_at: Utc::now(),
        }
    }

    /// Brings the loaded state in line with the disk. `None` means no
    /// collection is persisted for the session.
    async fn sync(&self) -> Result<Option<CollectionManifest>, RagError> {
        let Some(manifest) = read_manifest(&self.session).await? else {
            let mut collection = self.collection.write().await;
            if collection.generation.is_some() {
                debug!(session = %self.session.id, "collection removed from disk");
                *collection = Collection::default();
            }
            return Ok(None);
        };

        if manifest.dimensions != self.embedder.dimensions() {
            return Err(RagError::DimensionMismatch {
                expected: manifest.dimensions,
                actual: self.embedder.dimensions(),
            });
        }
        self.refresh(&manifest).await?;
        Ok(Some(manifest))
    }

    async fn refresh(&self, manifest: &CollectionManifest) -> Result<(), RagError> {
        let mut collection = self.collection.write().await;
        if collection.generation != Some(manifest.generation) {
            if collection.generation.is_some() {
                info!(session = %self.session.id, "collection was replaced on disk, reloading");
            }
            *collection = Collection::for_generation(manifest.generation);
        }

        for (number, path) in list_segments(&self.session.index_path).await? {
            if collection.segments.contains(&number) {
                continue;
            }
            let bytes = match fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(error) if error.kind() == ErrorKind::NotFound => continue,
                Err(error) => return Err(error.into()),
            };
            let segment: Segment = serde_json::from_slice(&bytes)?;
            if segment.generation != manifest.generation {
                warn!(
                    session = %self.session.id,
                    segment = number,
                    "ignoring segment from an earlier collection"
                );
                continue;
            }
            collection.absorb(segment);
        }
        Ok(())
    }

    /// Publishes a segment into an existing collection. `false` means another
    /// writer already published a segment with that number.
    async fn publish_next(&self, segment: &Segment) -> Result<bool, RagError> {
        let file_name = segment_file_name(segment.segment);
        let target = self.session.index_path.join(&file_name);
        let staging = self
            .session
            .index_path
            .join(format!("{file_name}.{}.tmp", Uuid::new_v4()));

        let written = write_durably(&staging, &serde_json::to_vec(segment)?).await;
        let linked = match written {
            Ok(()) => fs::hard_link(&staging, &target).await,
            Err(error) => {
                let _ = fs::remove_file(&staging).await;
                return Err(error);
            }
        };
        let _ = fs::remove_file(&staging).await;

        match linked {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    /// Stages the manifest and first segment next to the session directory
    /// and renames the staging directory into place, so the session directory
    /// only ever exists with a complete batch. `false` means another writer
    /// created the collection first.
    async fn publish_first(&self, segment: &Segment) -> Result<bool, RagError> {
        let parent = self
            .session
            .index_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(&parent).await?;
        }
        let staging_dir = parent.join(format!(
            "{}{}",
            staging_dir_prefix(&self.session.id),
            Uuid::new_v4()
        ));
        fs::create_dir(&staging_dir).await?;

        let staged = async {
            let manifest = serde_json::to_vec_pretty(&self.manifest(segment.generation))?;
            write_durably(&staging_dir.join(MANIFEST_FILE), &manifest).await?;
            write_durably(
                &staging_dir.join(segment_file_name(segment.segment)),
                &serde_json::to_vec(segment)?,
            )
            .await?;
            Ok::<_, RagError>(())
        }
        .await;
        if let Err(error) = staged {
            let _ = fs::remove_dir_all(&staging_dir).await;
            return Err(error);
        }

        match fs::rename(&staging_dir, &self.session.index_path).await {
            Ok(()) => Ok(true),
            Err(error) => {
                let _ = fs::remove_dir_all(&staging_dir).await;
                if read_manifest(&self.session).await?.is_some() {
                    Ok(false)
                } else {
                    Err(error.into())
                }
            }
        }
    }
}

#[async_trait]
impl<E: Embedder> VectorIndex for DiskVectorStore<E> {
    async fn add(&self, chunks: &[DocumentChunk]) -> Result<BatchCommit, RagError> {
        let _writer = self.writer.lock().await;

        let (accepted, skipped): (Vec<&DocumentChunk>, Vec<&DocumentChunk>) =
            chunks.iter().partition(|chunk| !chunk.text.trim().is_empty());
        for chunk in &skipped {
            warn!(
                source = %chunk.source,
                chunk_index = chunk.chunk_index,
                "skipping chunk with no embeddable text"
            );
        }

        if accepted.is_empty() {
            return Ok(BatchCommit {
                segment: None,
                records: 0,
                skipped_chunks: skipped.len(),
            });
        }

        let vectors: Vec<Vec<f32>> = stream::iter(
            accepted
                .iter()
                .map(|chunk| self.embedder.embed(&chunk.text))
                .collect::<Vec<_>>(),
        )
        .buffered(self.embed_concurrency)
        .try_collect()
        .await?;

        let dimensions = self.embedder.dimensions();
        if let Some(bad) = vectors.iter().find(|vector| vector.len() != dimensions) {
            return Err(RagError::DimensionMismatch {
                expected: dimensions,
                actual: bad.len(),
            });
        }

        for attempt in 1..=MAX_PUBLISH_ATTEMPTS {
            let manifest = self.sync().await?;
            let (generation, number, first_record_id) = match &manifest {
                Some(manifest) => {
                    let collection = self.collection.read().await;
                    (
                        manifest.generation,
                        collection.next_segment(),
                        collection.next_record_id,
                    )
                }
                None => (Uuid::new_v4(), 0, 0),
            };

            let segment = Segment {
                generation,
                segment: number,
                committed_at: Utc::now(),
                records: accepted
                    .iter()
                    .zip(&vectors)
                    .enumerate()
                    .map(|(offset, (chunk, vector))| EmbeddingRecord {
                        record_id: first_record_id + offset as u64,
                        vector: vector.clone(),
                        chunk: (*chunk).clone(),
                    })
                    .collect(),
            };

            let published = match manifest {
                Some(_) => self.publish_next(&segment).await?,
                None => self.publish_first(&segment).await?,
            };
            if !published {
                debug!(
                    session = %self.session.id,
                    segment = number,
                    attempt,
                    "segment taken by another writer, retrying"
                );
                continue;
            }

            let committed = segment.records.len();
            self.collection.write().await.absorb(segment);

            info!(
                session = %self.session.id,
                segment = number,
                records = committed,
                skipped = skipped.len(),
                "batch committed"
            );

            return Ok(BatchCommit {
                segment: Some(number),
                records: committed,
                skipped_chunks: skipped.len(),
            });
        }

        Err(RagError::CommitConflict {
            session: self.session.id.clone(),
            attempts: MAX_PUBLISH_ATTEMPTS,
        })
    }

    async fn query(&self, text: &str, k: usize) -> Result<Vec<RetrievalHit>, RagError> {
        if self.sync().await?.is_none() {
            return Err(RagError::IndexNotFound {
                session: self.session.id.clone(),
            });
        }
        if text.trim().is_empty() {
            return Err(RagError::InvalidArgument("query is empty".to_string()));
        }

        let query_vector = self.embedder.embed(text).await?;
        let collection = self.collection.read().await;
        let records = &collection.records;

        let mut scored: Vec<(usize, f32)> = records
            .iter()
            .enumerate()
            .map(|(position, record)| (position, cosine_similarity(&query_vector, &record.vector)))
            .collect();
        // Stable sort: equal scores keep insertion order.
        scored.sort_by(|left, right| right.1.total_cmp(&left.1));
        scored.truncate(k);

        let hits: Vec<RetrievalHit> = scored
            .into_iter()
            .map(|(position, score)| {
                let record = &records[position];
                RetrievalHit {
                    record_id: record.record_id,
                    score,
                    chunk: record.chunk.clone(),
                }
            })
            .collect();

        debug!(
            session = %self.session.id,
            k,
            returned = hits.len(),
            top_score = hits.first().map(|hit| hit.score).unwrap_or_default(),
            "similarity search"
        );

        Ok(hits)
    }

    async fn len(&self) -> usize {
        if let Err(error) = self.sync().await {
            warn!(session = %self.session.id, %error, "could not refresh collection");
        }
        self.collection.read().await.records.len()
    }

    async fn indexed_chunks(&self) -> Result<HashSet<(String, u64)>, RagError> {
        if self.sync().await?.is_none() {
            return Ok(HashSet::new());
        }
        Ok(self
            .collection
            .read()
            .await
            .records
            .iter()
            .filter_map(|record| {
                record
                    .chunk
                    .checksum
                    .clone()
                    .map(|checksum| (checksum, record.chunk.chunk_index))
            })
            .collect())
    }
}

async fn read_manifest(session: &Session) -> Result<Option<CollectionManifest>, RagError> {
    match fs::read(session.index_path.join(MANIFEST_FILE)).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(error) if error.kind() == ErrorKind::NotFound => {
            if session.index_path.is_dir() {
                warn!(session = %session.id, "session directory has no manifest, treating it as empty");
            }
            Ok(None)
        }
        Err(error) => Err(error.into()),
    }
}

fn segment_file_name(segment: u64) -> String {
    format!("{SEGMENT_PREFIX}{segment:06}{SEGMENT_SUFFIX}")
}

fn parse_segment_number(file_name: &str) -> Option<u64> {
    file_name
        .strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?
        .parse()
        .ok()
}

async fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>, RagError> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(error) => return Err(error.into()),
    };

    let mut segments = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if let Some(number) = name.to_str().and_then(parse_segment_number) {
            segments.push((number, entry.path()));
        }
    }
    segments.sort_by_key(|(number, _)| *number);
    Ok(segments)
}

async fn write_durably(path: &Path, bytes: &[u8]) -> Result<(), RagError> {
    let mut file = fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CharacterNgramEmbedder, SessionRegistry};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::tempdir;

    fn chunk(source: &str, index: u64, text: &str) -> DocumentChunk {
        DocumentChunk {
            text: text.to_string(),
            source: source.to_string(),
            chunk_index: index,
            checksum: None,
        }
    }

    /// Fails on any text containing "FAIL" while `armed` is set.
    #[derive(Default)]
    struct FlakyEmbedder {
        inner: CharacterNgramEmbedder,
        armed: AtomicBool,
    }

    #[async_trait]
    impl Embedder for FlakyEmbedder {
        fn model_id(&self) -> String {
            self.inner.model_id()
        }

        fn dimensions(&self) -> usize {
            self.inner.dimensions()
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>, RagError> {
            if self.armed.load(Ordering::SeqCst) && text.contains("FAIL") {
                return Err(RagError::provider("fake", "service unavailable"));
            }
            self.inner.embed(text).await
        }
    }

    #[tokio::test]
    async fn open_missing_session_reports_index_not_found() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let session = SessionRegistry::new(dir.path()).resolve("never")?;

        let result = DiskVectorStore::open(session.clone(), CharacterNgramEmbedder::default()).await;
        assert!(matches!(result, Err(RagError::IndexNotFound { .. })));
        assert!(!session.index_path.exists());
        Ok(())
    }

    #[tokio::test]
    async fn query_returns_best_match_first_and_at_most_k() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let session = SessionRegistry::new(dir.path()).resolve("s1")?;
        let store =
            DiskVectorStore::open_or_create(session, CharacterNgramEmbedder::default()).await?;

        store
            .add(&[
                chunk("gi.pdf", 0, "Crohn's disease causes abdominal pain and diarrhea."),
                chunk("cardio.pdf", 0, "The mitral valve separates the left atrium and ventricle."),
                chunk("neuro.pdf", 0, "Dopamine is a neurotransmitter in the basal ganglia."),
            ])
            .await?;

        let hits = store.query("What does Crohn's disease cause?", 2).await?;
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk.source, "gi.pdf");
        assert!(hits[0].score >= hits[1].score);

        let all = store.query("anything", 10).await?;
        assert_eq!(all.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn equal_scores_keep_insertion_order() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let session = SessionRegistry::new(dir.path()).resolve("ties")?;
        let store =
            DiskVectorStore::open_or_create(session, CharacterNgramEmbedder::default()).await?;

        store
            .add(&[chunk("a.pdf", 0, "same text"), chunk("b.pdf", 0, "same text")])
            .await?;
        store.add(&[chunk("c.pdf", 0, "same text")]).await?;

        let hits = store.query("same text", 5).await?;
        let ids: Vec<u64> = hits.iter().map(|hit| hit.record_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        Ok(())
    }

    #[tokio::test]
    async fn committed_batches_survive_reload() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let registry = SessionRegistry::new(dir.path());
        let session = registry.resolve("s1")?;

        {
            let store =
                DiskVectorStore::open_or_create(session.clone(), CharacterNgramEmbedder::default())
                    .await?;
            store.add(&[chunk("a.pdf", 0, "Insulin lowers blood glucose.")]).await?;
            store.add(&[chunk("a.pdf", 1, "Glucagon raises blood glucose.")]).await?;
        }

        let reloaded = DiskVectorStore::open(session, CharacterNgramEmbedder::default()).await?;
        assert_eq!(reloaded.len().await, 2);
        let hits = reloaded.query("What does insulin do?", 1).await?;
        assert_eq!(hits[0].chunk.text, "Insulin lowers blood glucose.");

        let commit = reloaded.add(&[chunk("b.pdf", 0, "Cortisol is a stress hormone.")]).await?;
        assert_eq!(commit.segment, Some(2));
        assert_eq!(reloaded.query("cortisol", 3).await?.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn sessions_never_share_records() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let registry = SessionRegistry::new(dir.path());
        let first = DiskVectorStore::open_or_create(
            registry.resolve("first")?,
            CharacterNgramEmbedder::default(),
        )
        .await?;
        let second = DiskVectorStore::open_or_create(
            registry.resolve("second")?,
            CharacterNgramEmbedder::default(),
        )
        .await?;

        first.add(&[chunk("first.pdf", 0, "Renal physiology notes.")]).await?;
        second.add(&[chunk("second.pdf", 0, "Renal pathology notes.")]).await?;

        let hits = first.query("renal", 10).await?;
        assert_eq!(hits.len(), 1);
        assert!(hits.iter().all(|hit| hit.chunk.source == "first.pdf"));
        Ok(())
    }

    #[tokio::test]
    async fn blank_chunks_are_skipped() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let session = SessionRegistry::new(dir.path()).resolve("blank")?;
        let store =
            DiskVectorStore::open_or_create(session.clone(), CharacterNgramEmbedder::default())
                .await?;

        let only_blank = store.add(&[chunk("a.pdf", 0, "   ")]).await?;
        assert_eq!(only_blank.segment, None);
        assert_eq!(only_blank.skipped_chunks, 1);
        assert!(!session.index_path.exists());

        let mixed = store
            .add(&[chunk("a.pdf", 1, ""), chunk("a.pdf", 2, "Real content.")])
            .await?;
        assert_eq!(mixed.records, 1);
        assert_eq!(mixed.skipped_chunks, 1);
        Ok(())
    }

    #[tokio::test]
    async fn failed_batch_leaves_prior_batches_intact() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let session = SessionRegistry::new(dir.path()).resolve("flaky")?;
        let embedder = FlakyEmbedder::default();
        embedder.armed.store(true, Ordering::SeqCst);
        let store = DiskVectorStore::open_or_create(session.clone(), embedder).await?;

        store.add(&[chunk("a.pdf", 0, "Committed fact.")]).await?;
        let failed = store
            .add(&[chunk("a.pdf", 1, "Fine."), chunk("a.pdf", 2, "FAIL here.")])
            .await;
        assert!(matches!(failed, Err(RagError::Provider { .. })));
        assert_eq!(store.len().await, 1);

        let reloaded = DiskVectorStore::open(session, CharacterNgramEmbedder::default()).await?;
        assert_eq!(reloaded.len().await, 1);
        Ok(())
    }

    #[tokio::test]
    async fn failed_first_batch_creates_no_directory() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let session = SessionRegistry::new(dir.path()).resolve("first-fail")?;
        let embedder = FlakyEmbedder::default();
        embedder.armed.store(true, Ordering::SeqCst);
        let store = DiskVectorStore::open_or_create(session.clone(), embedder).await?;

        assert!(store.add(&[chunk("a.pdf", 0, "FAIL")]).await.is_err());
        assert!(!DiskVectorStore::<CharacterNgramEmbedder>::exists(&session));
        Ok(())
    }

    #[tokio::test]
    async fn reopening_with_other_dimensions_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let session = SessionRegistry::new(dir.path()).resolve("dims")?;
        let store =
            DiskVectorStore::open_or_create(session.clone(), CharacterNgramEmbedder::default())
                .await?;
        store.add(&[chunk("a.pdf", 0, "Some text.")]).await?;

        let result = DiskVectorStore::open(session, CharacterNgramEmbedder { dimensions: 16 }).await;
        assert!(matches!(result, Err(RagError::DimensionMismatch { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn reset_makes_queries_report_index_not_found() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let registry = SessionRegistry::new(dir.path());
        let session = registry.resolve("reset-me")?;
        let store =
            DiskVectorStore::open_or_create(session.clone(), CharacterNgramEmbedder::default())
                .await?;
        store.add(&[chunk("a.pdf", 0, "Something to forget.")]).await?;
        assert!(registry.exists(&session));

        registry.reset(&session.id)?;

        assert!(!registry.exists(&session));
        assert!(matches!(
            store.query("forget", 5).await,
            Err(RagError::IndexNotFound { .. })
        ));
        assert!(matches!(
            DiskVectorStore::open(session, CharacterNgramEmbedder::default()).await,
            Err(RagError::IndexNotFound { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn handles_on_one_session_never_overwrite_each_other() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let session = SessionRegistry::new(dir.path()).resolve("shared")?;
        let seed =
            DiskVectorStore::open_or_create(session.clone(), CharacterNgramEmbedder::default())
                .await?;
        seed.add(&[chunk("seed.pdf", 0, "Seed batch.")]).await?;

        let first = DiskVectorStore::open(session.clone(), CharacterNgramEmbedder::default()).await?;
        let second = DiskVectorStore::open(session.clone(), CharacterNgramEmbedder::default()).await?;
        let first_batch = [chunk("a.pdf", 0, "Batch from the first handle.")];
        let second_batch = [chunk("b.pdf", 0, "Batch from the second handle.")];
        let (a, b) = tokio::join!(first.add(&first_batch), second.add(&second_batch));
        let segments: BTreeSet<Option<u64>> = [a?.segment, b?.segment].into_iter().collect();
        assert_eq!(segments, BTreeSet::from([Some(1), Some(2)]));

        let reloaded = DiskVectorStore::open(session, CharacterNgramEmbedder::default()).await?;
        let hits = reloaded.query("batch", 10).await?;
        let mut sources: Vec<&str> = hits.iter().map(|hit| hit.chunk.source.as_str()).collect();
        sources.sort_unstable();
        assert_eq!(sources, vec!["a.pdf", "b.pdf", "seed.pdf"]);
        let ids: HashSet<u64> = hits.iter().map(|hit| hit.record_id).collect();
        assert_eq!(ids.len(), 3);

        // The first handle picks up the other handle's batch on its next read.
        assert_eq!(first.len().await, 3);
        Ok(())
    }

    #[tokio::test]
    async fn long_lived_store_follows_reset_and_reingest() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let registry = SessionRegistry::new(dir.path());
        let session = registry.resolve("renal")?;
        let reader =
            DiskVectorStore::open_or_create(session.clone(), CharacterNgramEmbedder::default())
                .await?;
        reader.add(&[chunk("old.pdf", 0, "Old notes about the kidneys.")]).await?;

        registry.reset(&session.id)?;
        let writer =
            DiskVectorStore::open_or_create(session, CharacterNgramEmbedder::default()).await?;
        writer.add(&[chunk("new.pdf", 0, "New notes about the kidneys.")]).await?;

        let hits = reader.query("kidneys", 5).await?;
        let sources: Vec<&str> = hits.iter().map(|hit| hit.chunk.source.as_str()).collect();
        assert_eq!(sources, vec!["new.pdf"]);
        assert_eq!(hits[0].record_id, 0);
        Ok(())
    }

    #[tokio::test]
    async fn directory_without_manifest_is_not_an_index() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let session = SessionRegistry::new(dir.path()).resolve("hollow")?;
        std::fs::create_dir_all(&session.index_path)?;

        assert!(matches!(
            DiskVectorStore::open(session.clone(), CharacterNgramEmbedder::default()).await,
            Err(RagError::IndexNotFound { .. })
        ));
        let store =
            DiskVectorStore::open_or_create(session, CharacterNgramEmbedder::default()).await?;
        assert!(matches!(
            store.query("anything", 3).await,
            Err(RagError::IndexNotFound { .. })
        ));
        Ok(())
    }

    /// Finishes later the shorter its text, so completion order is the
    /// reverse of submission order.
    struct StaggeredEmbedder(CharacterNgramEmbedder);

    #[async_trait]
    impl Embedder for StaggeredEmbedder {
        fn model_id(&self) -> String {
            self.0.model_id()
        }

        fn dimensions(&self) -> usize {
            self.0.dimensions()
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>, RagError> {
            for _ in 0..(64usize.saturating_sub(text.len())) {
                tokio::task::yield_now().await;
            }
            self.0.embed(text).await
        }
    }

    #[tokio::test]
    async fn concurrent_embedding_keeps_batch_order() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let session = SessionRegistry::new(dir.path()).resolve("ordered")?;
        let store = DiskVectorStore::open_or_create(
            session.clone(),
            StaggeredEmbedder(CharacterNgramEmbedder::default()),
        )
        .await?
        .with_embed_concurrency(8);

        let texts = ["a", "bb bb", "ccc ccc ccc", "dddd dddd dddd dddd"];
        let chunks: Vec<DocumentChunk> = texts
            .iter()
            .enumerate()
            .map(|(index, text)| chunk("order.pdf", index as u64, text))
            .collect();
        store.add(&chunks).await?;

        let reloaded = DiskVectorStore::open(session, CharacterNgramEmbedder::default()).await?;
        let collection = reloaded.collection.read().await;
        for (record, text) in collection.records.iter().zip(texts) {
            assert_eq!(record.chunk.text, text);
            assert_eq!(record.record_id, record.chunk.chunk_index);
            assert_eq!(record.vector, CharacterNgramEmbedder::default().embed_sync(text));
        }
        assert_eq!(collection.records.len(), texts.len());
        Ok(())
    }

    #[tokio::test]
    async fn indexed_chunks_reports_checksummed_records() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let session = SessionRegistry::new(dir.path()).resolve("sums")?;
        let store =
            DiskVectorStore::open_or_create(session, CharacterNgramEmbedder::default()).await?;
        assert!(store.indexed_chunks().await?.is_empty());

        let mut tagged = chunk("a.pdf", 3, "Tagged chunk.");
        tagged.checksum = Some("abc".to_string());
        store.add(&[tagged, chunk("b.pdf", 0, "Untagged chunk.")]).await?;

        let indexed = store.indexed_chunks().await?;
        assert_eq!(indexed, HashSet::from([("abc".to_string(), 3)]));
        Ok(())
    }

    #[test]
    fn segment_names_round_trip() {
        assert_eq!(segment_file_name(7), "segment-000007.json");
        assert_eq!(parse_segment_number("segment-000007.json"), Some(7));
        assert_eq!(parse_segment_number("segment-000007.json.tmp"), None);
        assert_eq!(
            parse_segment_number("segment-000007.json.0b9f2c1e-tmp-name.tmp"),
            None
        );
        assert_eq!(parse_segment_number("manifest.json"), None);
    }
}
