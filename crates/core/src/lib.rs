pub mod chunking;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod ingest;
pub mod llm;
pub mod models;
pub mod qa;
pub mod session;
pub mod stores;
pub mod traits;

pub use chunking::{chunk_document, split_text, ChunkingConfig};
pub use config::ProviderConfig;
pub use embeddings::{
    cosine_similarity, CharacterNgramEmbedder, Embedder, OpenAiEmbedder, DEFAULT_NGRAM_DIMENSIONS,
};
pub use error::{IngestError, RagError};
pub use extractor::{
    extract_text, extract_text_from_bytes, try_extract_text, LopdfExtractor, PageText,
    PdfExtractor,
};
pub use ingest::{
    discover_pdf_files, index_documents, ingest_files, ingest_folder, prepare_documents,
    IngestionReport, PreparedDocument, PreparedDocuments, SkippedPdf,
};
pub use llm::{ChatMessage, CompletionRequest, LanguageModel, MessageRole, OpenAiChatModel};
pub use models::{
    BatchCommit, CollectionManifest, ConversationTurn, DocumentChunk, EmbeddingRecord,
    IngestionOptions, RetrievalHit, Role, Session, DEFAULT_TOP_K,
};
pub use qa::{Answer, ConversationEngine, EngineState, PromptTemplate, QaOptions};
pub use session::{read_marker, write_marker, SessionRegistry, DEFAULT_MARKER_FILE};
pub use stores::{DiskVectorStore, COLLECTION_NAME};
pub use traits::VectorIndex;
