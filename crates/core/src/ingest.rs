use crate::chunking::{chunk_document, ChunkingConfig};
use crate::extractor::extract_text;
use crate::traits::VectorIndex;
use crate::{DocumentChunk, IngestError, IngestionOptions, RagError};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

pub fn discover_pdf_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let is_pdf = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));

        if is_pdf {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

pub fn digest_file(path: &Path) -> Result<String, IngestError> {
    let bytes = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

#[derive(Debug, Clone)]
pub struct SkippedPdf {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct PreparedDocument {
    pub path: PathBuf,
    pub source: String,
    pub checksum: String,
    pub characters: usize,
    pub chunks: Vec<DocumentChunk>,
}

#[derive(Debug, Clone, Default)]
pub struct PreparedDocuments {
    pub documents: Vec<PreparedDocument>,
    pub skipped_files: Vec<SkippedPdf>,
}

#[derive(Debug, Default)]
pub struct IngestionReport {
    pub documents: usize,
    pub chunks: usize,
    pub batches: usize,
    pub skipped_chunks: usize,
    /// Chunks left out because the index already holds them from an earlier run.
    pub already_indexed_chunks: usize,
    pub skipped_files: Vec<SkippedPdf>,
}

/// Extracts and chunks every file. Files that yield no text are recorded as
/// skipped; only an invalid chunking config fails the whole call.
pub fn prepare_documents(
    paths: &[PathBuf],
    options: &IngestionOptions,
) -> Result<PreparedDocuments, IngestError> {
    let config = ChunkingConfig::from(options);
    config.validate()?;

    let mut prepared = PreparedDocuments::default();
    let mut sources = HashSet::new();

    for path in paths {
        let build_result = (|| {
            let name = path
                .file_name()
                .and_then(|name| name.to_str())
                .ok_or_else(|| IngestError::MissingFileName(path.display().to_string()))?;
            // Two files with the same name in different folders must not share
            // a source, or their chunk indices would collide.
            let source = if sources.contains(name) {
                path.display().to_string()
            } else {
                name.to_string()
            };

            let checksum = digest_file(path)?;
            let text = extract_text(path, options.max_pages);
            if text.trim().is_empty() {
                return Ok(None);
            }

            let mut chunks = chunk_document(&source, &text, config)?;
            for chunk in &mut chunks {
                chunk.checksum = Some(checksum.clone());
            }
            Ok::<_, IngestError>(Some(PreparedDocument {
                path: path.clone(),
                source,
                checksum,
                characters: text.chars().count(),
                chunks,
            }))
        })();

        match build_result {
            Ok(Some(document)) => {
                info!(
                    source = %document.source,
                    characters = document.characters,
                    chunks = document.chunks.len(),
                    checksum = %document.checksum,
                    "document prepared"
                );
                sources.insert(document.source.clone());
                prepared.documents.push(document);
            }
            Ok(None) => {
                warn!(path = %path.display(), "no text extracted");
                prepared.skipped_files.push(SkippedPdf {
                    path: path.clone(),
                    reason: "no text extracted".to_string(),
                });
            }
            Err(error) => {
                warn!(path = %path.display(), %error, "skipping pdf");
                prepared.skipped_files.push(SkippedPdf {
                    path: path.clone(),
                    reason: error.to_string(),
                });
            }
        }
    }

    Ok(prepared)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchTotals {
    pub batches: usize,
    pub committed: usize,
    pub skipped: usize,
}

/// Commits chunks batch by batch. A failed batch stops ingestion; batches
/// committed before it stay in the index.
pub async fn commit_in_batches<V>(
    chunks: &[DocumentChunk],
    index: &V,
    batch_size: usize,
) -> Result<BatchTotals, RagError>
where
    V: VectorIndex + ?Sized,
{
    let mut totals = BatchTotals::default();
    let batch_count = chunks.len().div_ceil(batch_size.max(1));

    for (position, batch) in chunks.chunks(batch_size.max(1)).enumerate() {
        info!(batch = position + 1, of = batch_count, size = batch.len(), "adding batch");
        match index.add(batch).await {
            Ok(commit) => {
                totals.batches += 1;
                totals.committed += commit.records;
                totals.skipped += commit.skipped_chunks;
            }
            Err(error) if error.is_fatal() => return Err(error),
            Err(error) => {
                return Err(RagError::BatchAborted {
                    batch: position + 1,
                    committed_chunks: totals.committed,
                    source: Box::new(error),
                })
            }
        }
    }

    Ok(totals)
}

pub async fn ingest_files<V>(
    paths: &[PathBuf],
    index: &V,
    options: &IngestionOptions,
) -> Result<IngestionReport, RagError>
where
    V: VectorIndex + ?Sized,
{
    let prepared = prepare_documents(paths, options)?;
    index_documents(prepared, index, options).await
}

/// Commits the prepared chunks the index does not hold yet. Re-running an
/// ingestion only adds what an earlier, possibly aborted, run left out.
pub async fn index_documents<V>(
    prepared: PreparedDocuments,
    index: &V,
    options: &IngestionOptions,
) -> Result<IngestionReport, RagError>
where
    V: VectorIndex + ?Sized,
{
    let indexed = index.indexed_chunks().await?;
    let (pending, present): (Vec<DocumentChunk>, Vec<DocumentChunk>) = prepared
        .documents
        .iter()
        .flat_map(|document| document.chunks.iter().cloned())
        .partition(|chunk| match &chunk.checksum {
            Some(checksum) => !indexed.contains(&(checksum.clone(), chunk.chunk_index)),
            None => true,
        });

    info!(
        documents = prepared.documents.len(),
        chunks = pending.len(),
        already_indexed = present.len(),
        skipped_files = prepared.skipped_files.len(),
        "ingesting chunks"
    );

    let totals = commit_in_batches(&pending, index, options.batch_size).await?;

    Ok(IngestionReport {
        documents: prepared.documents.len(),
        chunks: totals.committed,
        batches: totals.batches,
        skipped_chunks: totals.skipped,
        already_indexed_chunks: present.len(),
        skipped_files: prepared.skipped_files,
    })
}

pub async fn ingest_folder<V>(
    folder: &Path,
    index: &V,
    options: &IngestionOptions,
) -> Result<IngestionReport, RagError>
where
    V: VectorIndex + ?Sized,
{
    let files = discover_pdf_files(folder);

    if files.is_empty() {
        return Err(IngestError::InvalidArgument(format!(
            "no pdf files found in {}",
            folder.display()
        ))
        .into());
    }

    info!(folder = %folder.display(), files = files.len(), "found pdf files");
    ingest_files(&files, index, options).await
}
