use anyhow::Context;
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use medstudy_core::{
    ingest_folder, read_marker, write_marker, Answer, CharacterNgramEmbedder, ConversationEngine,
    DiskVectorStore, Embedder, IngestionOptions, LanguageModel, OpenAiChatModel, OpenAiEmbedder,
    PromptTemplate, ProviderConfig, QaOptions, SessionRegistry, DEFAULT_MARKER_FILE,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const BATCH_SESSION_ID: &str = "medstudyasst_001";

type SharedEmbedder = Arc<dyn Embedder>;
type Engine = ConversationEngine<DiskVectorStore<SharedEmbedder>, Arc<dyn LanguageModel>>;

#[derive(Parser)]
#[command(name = "medstudy", version, about = "Ask questions about your study PDFs")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory holding one index directory per session.
    #[arg(long, env = "MEDSTUDY_DATA_DIR", default_value = "chroma_db", global = true)]
    data_dir: PathBuf,

    /// File remembering the session id of the last ingestion.
    #[arg(long, env = "MEDSTUDY_MARKER", default_value = DEFAULT_MARKER_FILE, global = true)]
    marker: PathBuf,

    #[command(flatten)]
    provider: ProviderArgs,
}

#[derive(Args)]
struct ProviderArgs {
    /// API key for the OpenAI-compatible provider.
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true, global = true)]
    api_key: Option<String>,

    #[arg(long, env = "OPENAI_BASE_URL", global = true)]
    base_url: Option<String>,

    #[arg(long, env = "MEDSTUDY_EMBEDDING_MODEL", global = true)]
    embedding_model: Option<String>,

    /// Dimensions returned by the embedding model.
    #[arg(long, global = true)]
    embedding_dimensions: Option<usize>,

    #[arg(long, env = "MEDSTUDY_CHAT_MODEL", global = true)]
    chat_model: Option<String>,

    /// Request timeout for provider calls, in seconds.
    #[arg(long, default_value = "120", global = true)]
    timeout_secs: u64,

    /// Embed locally with hashed character trigrams instead of the provider.
    #[arg(long, default_value_t = false, global = true)]
    offline: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Extract, chunk and index every PDF under a folder.
    Ingest {
        /// Folder that contains PDFs recursively.
        #[arg(long)]
        folder: PathBuf,
        #[arg(long, default_value = BATCH_SESSION_ID)]
        session: String,
        /// Only read the first N pages of each PDF.
        #[arg(long)]
        max_pages: Option<usize>,
        #[arg(long, default_value = "100")]
        batch_size: usize,
        #[arg(long, default_value = "1000")]
        chunk_size: usize,
        #[arg(long, default_value = "100")]
        chunk_overlap: usize,
        /// Concurrent embedding requests within a batch.
        #[arg(long, default_value = "4")]
        embed_concurrency: usize,
    },
    /// Answer a single question.
    Ask {
        #[arg(long)]
        question: String,
        #[arg(long)]
        session: Option<String>,
        /// Number of chunks retrieved as context.
        #[arg(long, default_value = "5")]
        top_k: usize,
    },
    /// Multi-turn conversation on stdin. `/clear` forgets the history, `/quit` exits.
    Chat {
        #[arg(long)]
        session: Option<String>,
        #[arg(long, default_value = "5")]
        top_k: usize,
        /// Only condense follow-ups against the last N turns.
        #[arg(long)]
        history_window: Option<usize>,
    },
    /// Delete a session's index.
    Reset {
        #[arg(long)]
        session: Option<String>,
    },
    /// List sessions with a persisted index.
    Status,
}

impl ProviderArgs {
    fn config(&self) -> ProviderConfig {
        let mut config = ProviderConfig::from_env();
        if self.api_key.is_some() {
            config.api_key = self.api_key.clone();
        }
        if let Some(base_url) = &self.base_url {
            config.base_url = base_url.clone();
        }
        if let Some(model) = &self.embedding_model {
            config.embedding_model = model.clone();
        }
        if let Some(dimensions) = self.embedding_dimensions {
            config.embedding_dimensions = dimensions;
        }
        if let Some(model) = &self.chat_model {
            config.chat_model = model.clone();
        }
        config.request_timeout = std::time::Duration::from_secs(self.timeout_secs);
        config
    }

    fn embedder(&self) -> anyhow::Result<SharedEmbedder> {
        if self.offline {
            return Ok(Arc::new(CharacterNgramEmbedder::default()));
        }
        Ok(Arc::new(OpenAiEmbedder::new(&self.config())?))
    }

    fn language_model(&self) -> anyhow::Result<Arc<dyn LanguageModel>> {
        Ok(Arc::new(OpenAiChatModel::new(&self.config())?))
    }
}

fn resolve_session_id(explicit: Option<String>, marker: &Path) -> anyhow::Result<String> {
    if let Some(id) = explicit {
        return Ok(id);
    }
    read_marker(marker)?.with_context(|| {
        format!(
            "no session given and no marker file at {}; run `medstudy ingest` first or pass --session",
            marker.display()
        )
    })
}

async fn load_engine(cli: &Cli, session_id: &str, options: QaOptions) -> anyhow::Result<Engine> {
    let registry = SessionRegistry::new(&cli.data_dir);
    let session = registry.resolve(session_id)?;
    let mut engine = ConversationEngine::new(
        cli.provider.language_model()?,
        PromptTemplate::default(),
        options,
    )?;
    engine
        .load_session(session, cli.provider.embedder()?)
        .await?;
    Ok(engine)
}

fn print_answer(answer: &Answer) {
    println!("{}", answer.content);
    if answer.sources.is_empty() {
        return;
    }
    println!();
    for hit in &answer.sources {
        println!(
            "  [{} #{}] score={:.4}",
            hit.chunk.source, hit.chunk.chunk_index, hit.score
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        "medstudy boot"
    );

    match &cli.command {
        Command::Ingest {
            folder,
            session,
            max_pages,
            batch_size,
            chunk_size,
            chunk_overlap,
            embed_concurrency,
        } => {
            let registry = SessionRegistry::new(&cli.data_dir);
            let session = registry.resolve(session)?;
            let options = IngestionOptions {
                chunk_size: *chunk_size,
                chunk_overlap: *chunk_overlap,
                batch_size: *batch_size,
                max_pages: *max_pages,
            };

            let store = DiskVectorStore::open_or_create(session.clone(), cli.provider.embedder()?)
                .await?
                .with_embed_concurrency(*embed_concurrency);
            let report = ingest_folder(folder, &store, &options).await?;

            for skipped in &report.skipped_files {
                warn!(path = %skipped.path.display(), reason = %skipped.reason, "skipped pdf");
            }

            if report.chunks == 0 && report.already_indexed_chunks > 0 {
                write_marker(&cli.marker, &session)?;
                println!(
                    "session {} already holds all {} chunks; nothing new to ingest",
                    session.id, report.already_indexed_chunks
                );
                return Ok(());
            }
            if report.chunks == 0 {
                println!("0 chunks ingested (all files were skipped)");
                return Ok(());
            }

            write_marker(&cli.marker, &session)?;
            println!(
                "{} chunks from {} documents ingested into session {} at {}",
                report.chunks,
                report.documents,
                session.id,
                Utc::now().to_rfc3339()
            );
            if report.already_indexed_chunks > 0 {
                println!("{} chunks were already indexed and left as they were", report.already_indexed_chunks);
            }
            if report.skipped_chunks > 0 {
                println!("{} chunks could not be embedded and were skipped", report.skipped_chunks);
            }
        }
        Command::Ask {
            question,
            session,
            top_k,
        } => {
            let session_id = resolve_session_id(session.clone(), &cli.marker)?;
            let options = QaOptions {
                top_k: *top_k,
                ..QaOptions::default()
            };
            let mut engine = load_engine(&cli, &session_id, options).await?;

            let answer = engine.ask(question).await?;
            print_answer(&answer);
            if let Some(error) = answer.error {
                anyhow::bail!(error);
            }
        }
        Command::Chat {
            session,
            top_k,
            history_window,
        } => {
            let session_id = resolve_session_id(session.clone(), &cli.marker)?;
            let options = QaOptions {
                top_k: *top_k,
                history_window: *history_window,
                ..QaOptions::default()
            };
            let mut engine = load_engine(&cli, &session_id, options).await?;
            println!("session {session_id}: ask a question, /clear to start over, /quit to exit");

            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                print!("> ");
                std::io::stdout().flush()?;

                let Some(line) = lines.next_line().await? else {
                    break;
                };
                match line.trim() {
                    "" => continue,
                    "/quit" | "/exit" => break,
                    "/clear" => {
                        engine.clear_history();
                        println!("conversation cleared");
                    }
                    question => {
                        let answer = engine.ask(question).await?;
                        print_answer(&answer);
                        println!();
                    }
                }
            }
        }
        Command::Reset { session } => {
            let session_id = resolve_session_id(session.clone(), &cli.marker)?;
            SessionRegistry::new(&cli.data_dir).reset(&session_id)?;
            println!("session {session_id} reset");
        }
        Command::Status => {
            let registry = SessionRegistry::new(&cli.data_dir);
            let marked = read_marker(&cli.marker)?;
            let sessions = registry.list()?;

            if sessions.is_empty() {
                println!("no sessions in {}", registry.base_dir().display());
            }
            for id in sessions {
                let current = if marked.as_deref() == Some(id.as_str()) {
                    " (current)"
                } else {
                    ""
                };
                println!("{id}{current}");
            }
            if let Some(id) = marked {
                if !registry.exists(&registry.resolve(&id)?) {
                    println!("marker {} names {id}, which has no index", cli.marker.display());
                }
            }
        }
    }

    Ok(())
}
