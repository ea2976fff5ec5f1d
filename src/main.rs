//! CLI entry point for the snippet indexing service.
//!
//! Provides the MCP/HTTP server plus one-shot ingest and query commands
//! used for smoke-testing an index without a running server.

use clap::{
    Parser, Subcommand,
    builder::styling::{AnsiColor, Effects, Styles},
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use snipdex::ingest::{IngestOutcome, SnippetEvent};
use snipdex::{
    EmbeddingProvider, FastEmbedProvider, HashEmbedProvider, IngestError, IngestPipeline,
    MemoryVectorStore, MetadataFilter, QueryEngine, SequenceSource, Settings, SnippetId,
    VectorStore,
};

fn clap_cargo_style() -> Styles {
    Styles::styled()
        .header(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

#[derive(Parser)]
#[command(name = "snipdex", version, about = "Semantic code-snippet manager", styles = clap_cargo_style())]
struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true, default_value = "snipdex.toml")]
    config: PathBuf,

    /// Use the deterministic offline embedder instead of a downloaded model
    #[arg(long, global = true, env = "SNIPDEX_OFFLINE")]
    offline: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter configuration file
    Init {
        /// Overwrite an existing configuration file
        #[arg(long)]
        force: bool,
    },
    /// Start the server (stdio MCP transport by default)
    Serve {
        /// Run as HTTP server instead of stdio transport
        #[arg(long)]
        http: bool,
        /// HTTP bind address, overriding configuration
        #[arg(long)]
        bind: Option<String>,
    },
    /// Ingest snippet files and report the outcome of each
    Ingest {
        /// Files to ingest
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Language tag applied to every file (default: from extension)
        #[arg(long)]
        language: Option<String>,
    },
    /// One-shot semantic search over a directory of snippet files
    Query {
        /// Search text
        text: String,
        /// Directory of snippet files to index before searching
        #[arg(long)]
        from: PathBuf,
        /// Maximum number of results
        #[arg(long, default_value_t = 5)]
        limit: usize,
        /// Restrict results to this language tag
        #[arg(long)]
        language: Option<String>,
    },
    /// Display active settings
    Config,
}

fn language_from_path(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?;
    let lang = match ext {
        "py" => "python",
        "rs" => "rust",
        "go" => "go",
        "js" => "javascript",
        "ts" => "typescript",
        "java" => "java",
        "rb" => "ruby",
        "sh" => "shell",
        "sql" => "sql",
        _ => return None,
    };
    Some(lang.to_string())
}

fn build_provider(
    settings: &Settings,
    offline: bool,
) -> anyhow::Result<Arc<dyn EmbeddingProvider>> {
    if offline {
        info!("using deterministic offline embedder");
        return Ok(Arc::new(HashEmbedProvider::new()));
    }
    let cache_dir = settings.model_cache_dir();
    let provider = FastEmbedProvider::new(&settings.embedding.model, &cache_dir)?;
    info!(model = %provider.model_id(), "embedding model ready");
    Ok(Arc::new(provider))
}

struct Service {
    store: Arc<dyn VectorStore>,
    pipeline: IngestPipeline,
    query: QueryEngine,
    seq: SequenceSource,
}

fn build_service(
    settings: &Settings,
    provider: Arc<dyn EmbeddingProvider>,
    shutdown: CancellationToken,
) -> Service {
    let store: Arc<dyn VectorStore> = Arc::new(MemoryVectorStore::new());
    let (pipeline, _handle) =
        IngestPipeline::spawn(Arc::clone(&store), Arc::clone(&provider), settings, shutdown);
    let query = QueryEngine::new(Arc::clone(&store), provider, settings.query.clone());
    Service {
        store,
        pipeline,
        query,
        seq: SequenceSource::new(),
    }
}

async fn ingest_file(
    service: &Service,
    path: &Path,
    language: Option<&str>,
) -> anyhow::Result<IngestOutcome> {
    let id = path
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(SnippetId::new)
        .ok_or_else(|| anyhow::anyhow!("cannot derive a snippet id from {}", path.display()))?;
    let content = std::fs::read_to_string(path)?;

    let event = SnippetEvent::Upsert {
        id,
        content,
        language: language
            .map(str::to_string)
            .or_else(|| language_from_path(path)),
        seq: service.seq.next(),
        timestamp: chrono::Utc::now(),
    };
    Ok(service.pipeline.handle().submit_and_wait(event).await?)
}

fn print_outcome(path: &Path, outcome: &IngestOutcome) {
    match outcome {
        IngestOutcome::Indexed {
            version, chunks, ..
        } => println!("{}: indexed as {version} ({chunks} chunks)", path.display()),
        IngestOutcome::NoOp { reason, .. } => {
            println!("{}: no-op ({reason:?})", path.display());
        }
        IngestOutcome::Deleted { .. } => println!("{}: deleted", path.display()),
        IngestOutcome::Failed { error, .. } => {
            eprintln!("{}: failed: {error}", path.display());
        }
    }
}

async fn serve_stdio(service: Service) -> anyhow::Result<()> {
    use rmcp::{ServiceExt, transport::stdio};
    use snipdex::mcp::SnippetToolServer;

    info!("starting MCP server on stdio transport");
    let server = SnippetToolServer::new(
        service.query,
        service.pipeline,
        service.store,
        service.seq,
    );
    let running = server
        .serve(stdio())
        .await
        .map_err(|e| anyhow::anyhow!("failed to start MCP server: {e}"))?;
    running
        .waiting()
        .await
        .map_err(|e| anyhow::anyhow!("MCP server error: {e}"))?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            // stdio transport owns stdout, so default logs to warn and stderr
            EnvFilter::new("warn,snipdex=info")
        }))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::Init { force } = &cli.command {
        if cli.config.exists() && !force {
            anyhow::bail!(
                "{} already exists (use --force to overwrite)",
                cli.config.display()
            );
        }
        Settings::default().save(&cli.config)?;
        println!("Wrote {}", cli.config.display());
        return Ok(());
    }

    let settings = Settings::load_from(&cli.config)
        .map_err(|e| anyhow::anyhow!("configuration error: {e}"))?;

    match cli.command {
        Commands::Init { .. } => unreachable!("handled above"),

        Commands::Config => {
            println!("{}", toml::to_string_pretty(&settings)?);
            Ok(())
        }

        Commands::Serve { http, bind } => {
            let shutdown = CancellationToken::new();
            let provider = build_provider(&settings, cli.offline)?;
            let service = build_service(&settings, provider, shutdown.clone());

            let signal_token = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("shutdown signal received");
                    signal_token.cancel();
                }
            });

            let use_http = http || settings.server.mode == "http";
            if use_http {
                #[cfg(feature = "http-server")]
                {
                    let bind = bind.unwrap_or_else(|| settings.server.bind.clone());
                    let state = snipdex::server::AppState::new(
                        service.query,
                        service.pipeline,
                        service.store,
                        service.seq,
                    );
                    snipdex::server::serve_http(state, &bind, shutdown).await?;
                    return Ok(());
                }
                #[cfg(not(feature = "http-server"))]
                {
                    let _ = bind;
                    anyhow::bail!(
                        "HTTP server support not compiled in. Rebuild with --features http-server"
                    );
                }
            }
            serve_stdio(service).await
        }

        Commands::Ingest { paths, language } => {
            let provider = build_provider(&settings, cli.offline)?;
            let service = build_service(&settings, provider, CancellationToken::new());

            let mut failures = 0usize;
            for path in &paths {
                let size = std::fs::metadata(path).map(|m| m.len() as usize).unwrap_or(0);
                if size > settings.ingest.max_content_bytes {
                    let err = IngestError::ContentTooLarge {
                        snippet_id: SnippetId::new(path.display().to_string())
                            .unwrap_or_else(|| SnippetId::new("?").unwrap()),
                        size,
                        limit: settings.ingest.max_content_bytes,
                    };
                    eprintln!("{}: {err}", path.display());
                    failures += 1;
                    continue;
                }
                match ingest_file(&service, path, language.as_deref()).await {
                    Ok(outcome) => {
                        if matches!(outcome, IngestOutcome::Failed { .. }) {
                            failures += 1;
                        }
                        print_outcome(path, &outcome);
                    }
                    Err(e) => {
                        eprintln!("{}: {e}", path.display());
                        failures += 1;
                    }
                }
            }
            if failures > 0 {
                anyhow::bail!("{failures} file(s) failed to ingest");
            }
            Ok(())
        }

        Commands::Query {
            text,
            from,
            limit,
            language,
        } => {
            let provider = build_provider(&settings, cli.offline)?;
            let service = build_service(&settings, provider, CancellationToken::new());

            let mut entries: Vec<PathBuf> = std::fs::read_dir(&from)?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_file())
                .collect();
            entries.sort();
            for path in &entries {
                if let Err(e) = ingest_file(&service, path, None).await {
                    eprintln!("skipping {}: {e}", path.display());
                }
            }

            let filter = MetadataFilter { language };
            let hits = service.query.search(&text, Some(limit), &filter).await?;
            if hits.is_empty() {
                println!("No matching snippets");
                return Ok(());
            }
            for hit in hits {
                println!(
                    "{}  score {:.3}{}",
                    hit.snippet_id,
                    hit.score.get(),
                    hit.language
                        .as_deref()
                        .map(|l| format!("  [{l}]"))
                        .unwrap_or_default()
                );
                if let Some(best) = hit.matches.first() {
                    for line in best.text.lines().take(4) {
                        println!("    {line}");
                    }
                }
            }
            Ok(())
        }
    }
}
