//! MCP (Model Context Protocol) tool surface.
//!
//! Exposes the snippet library to AI assistants over stdio. The tools map
//! onto the same query engine and ingestion queue the HTTP routes use, so
//! an agent saving a snippet and a service client searching for it observe
//! identical semantics.

use rmcp::{
    ServerHandler,
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{ErrorData as McpError, *},
    schemars,
    service::{Peer, RequestContext, RoleServer},
    tool, tool_handler, tool_router,
};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::ingest::{IngestHandle, IngestOutcome, IngestPipeline, SequenceSource, SnippetEvent};
use crate::query::QueryEngine;
use crate::store::{MetadataFilter, VectorStore};
use crate::types::SnippetId;

#[derive(Debug, Deserialize, Serialize, schemars::JsonSchema)]
pub struct SaveSnippetRequest {
    /// Snippet identifier, e.g. a file name like "retry_helper.py"
    pub id: String,
    /// Full snippet content to index
    pub content: String,
    /// Programming language tag (e.g., "python", "rust")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, schemars::JsonSchema)]
pub struct SemanticSearchRequest {
    /// Natural language or code search query
    pub query: String,
    /// Maximum number of results (default: 5)
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Restrict results to snippets with this language tag
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, schemars::JsonSchema)]
pub struct DeleteSnippetRequest {
    /// Identifier of the snippet to remove from the index
    pub id: String,
}

fn default_limit() -> u32 {
    5
}

#[derive(Clone)]
pub struct SnippetToolServer {
    query: QueryEngine,
    ingest: IngestHandle,
    pipeline: IngestPipeline,
    store: Arc<dyn VectorStore>,
    seq: SequenceSource,
    tool_router: ToolRouter<Self>,
    peer: Arc<Mutex<Option<Peer<RoleServer>>>>,
}

#[tool_router]
impl SnippetToolServer {
    pub fn new(
        query: QueryEngine,
        pipeline: IngestPipeline,
        store: Arc<dyn VectorStore>,
        seq: SequenceSource,
    ) -> Self {
        Self {
            query,
            ingest: pipeline.handle(),
            pipeline,
            store,
            seq,
            tool_router: Self::tool_router(),
            peer: Arc::new(Mutex::new(None)),
        }
    }

    async fn notify_snippet_indexed(&self, snippet_id: &SnippetId, chunks: usize) {
        let peer_guard = self.peer.lock().await;
        if let Some(peer) = peer_guard.as_ref() {
            let _ = peer
                .notify_logging_message(LoggingMessageNotificationParam {
                    level: LoggingLevel::Info,
                    logger: Some("snipdex".to_string()),
                    data: serde_json::json!({
                        "action": "indexed",
                        "snippet": snippet_id.as_str(),
                        "chunks": chunks,
                    }),
                })
                .await;
        }
    }

    #[tool(description = "Save a code snippet and index it for semantic search")]
    pub async fn save_snippet(
        &self,
        Parameters(SaveSnippetRequest {
            id,
            content,
            language,
        }): Parameters<SaveSnippetRequest>,
    ) -> Result<CallToolResult, McpError> {
        let Some(snippet_id) = SnippetId::new(&id) else {
            return Ok(CallToolResult::error(vec![Content::text(
                "Snippet id must not be empty".to_string(),
            )]));
        };

        let event = SnippetEvent::Upsert {
            id: snippet_id,
            content,
            language,
            seq: self.seq.next(),
            timestamp: chrono::Utc::now(),
        };

        match self.ingest.submit_and_wait(event).await {
            Ok(IngestOutcome::Indexed {
                snippet_id,
                version,
                chunks,
            }) => {
                self.notify_snippet_indexed(&snippet_id, chunks).await;
                Ok(CallToolResult::success(vec![Content::text(format!(
                    "Saved '{snippet_id}' as version {version} ({chunks} chunk{})",
                    if chunks == 1 { "" } else { "s" }
                ))]))
            }
            Ok(IngestOutcome::NoOp { snippet_id, reason }) => {
                Ok(CallToolResult::success(vec![Content::text(format!(
                    "No change for '{snippet_id}' ({reason:?}); the indexed version is current"
                ))]))
            }
            Ok(IngestOutcome::Failed {
                snippet_id, error, ..
            }) => Ok(CallToolResult::error(vec![Content::text(format!(
                "Failed to index '{snippet_id}': {error}"
            ))])),
            Ok(IngestOutcome::Deleted { .. }) => unreachable!("upsert cannot delete"),
            Err(e) => Ok(CallToolResult::error(vec![Content::text(format!(
                "Could not queue snippet: {e}"
            ))])),
        }
    }

    #[tool(description = "Search saved code snippets using natural language semantic search")]
    pub async fn semantic_search(
        &self,
        Parameters(SemanticSearchRequest {
            query,
            limit,
            language,
        }): Parameters<SemanticSearchRequest>,
    ) -> Result<CallToolResult, McpError> {
        let filter = MetadataFilter { language };
        match self
            .query
            .search(&query, Some(limit.max(1) as usize), &filter)
            .await
        {
            Ok(hits) if hits.is_empty() => Ok(CallToolResult::success(vec![Content::text(
                format!("No snippets found matching '{query}'"),
            )])),
            Ok(hits) => {
                let mut result = format!("Found {} snippet(s) matching '{query}':\n\n", hits.len());
                for hit in hits {
                    let _ = writeln!(
                        result,
                        "{} (score: {:.3}{})",
                        hit.snippet_id,
                        hit.score.get(),
                        hit.language
                            .as_deref()
                            .map(|l| format!(", language: {l}"))
                            .unwrap_or_default()
                    );
                    if let Some(best) = hit.matches.first() {
                        let _ = writeln!(
                            result,
                            "  chunk {} [{}..{}]:",
                            best.chunk_index.get(),
                            best.span.start,
                            best.span.end
                        );
                        for line in best.text.lines().take(8) {
                            let _ = writeln!(result, "    {line}");
                        }
                    }
                    result.push('\n');
                }
                Ok(CallToolResult::success(vec![Content::text(result)]))
            }
            Err(e) => Ok(CallToolResult::error(vec![Content::text(format!(
                "Search failed: {e}"
            ))])),
        }
    }

    #[tool(description = "Delete a saved snippet and all of its index entries")]
    pub async fn delete_snippet(
        &self,
        Parameters(DeleteSnippetRequest { id }): Parameters<DeleteSnippetRequest>,
    ) -> Result<CallToolResult, McpError> {
        let Some(snippet_id) = SnippetId::new(&id) else {
            return Ok(CallToolResult::error(vec![Content::text(
                "Snippet id must not be empty".to_string(),
            )]));
        };

        let event = SnippetEvent::Delete {
            id: snippet_id,
            seq: self.seq.next(),
            timestamp: chrono::Utc::now(),
        };

        match self.ingest.submit_and_wait(event).await {
            Ok(IngestOutcome::Deleted {
                snippet_id,
                entries_removed,
            }) => Ok(CallToolResult::success(vec![Content::text(format!(
                "Deleted '{snippet_id}' ({entries_removed} index entr{})",
                if entries_removed == 1 { "y" } else { "ies" }
            ))])),
            Ok(IngestOutcome::NoOp { snippet_id, reason }) => {
                Ok(CallToolResult::success(vec![Content::text(format!(
                    "Nothing deleted for '{snippet_id}' ({reason:?})"
                ))]))
            }
            Ok(other) => Ok(CallToolResult::error(vec![Content::text(format!(
                "Unexpected deletion outcome: {other:?}"
            ))])),
            Err(e) => Ok(CallToolResult::error(vec![Content::text(format!(
                "Could not queue deletion: {e}"
            ))])),
        }
    }

    #[tool(description = "Get information about the snippet index and ingestion pipeline")]
    pub async fn index_status(&self) -> Result<CallToolResult, McpError> {
        let store_state = match self.store.ping() {
            Ok(()) => "reachable".to_string(),
            Err(e) => format!("unreachable ({e})"),
        };
        let entries = self.store.entry_count().unwrap_or(0);
        let status = self.pipeline.status();

        let result = format!(
            "Snippet Index Status:\n\
             - Store: {store_state}\n\
             - Live index entries: {entries}\n\
             - Indexed events: {}\n\
             - No-op events: {}\n\
             - Deletions: {}\n\
             - Failed events: {}\n\
             - Dead letters: {}\n\
             - Queue slots free: {}",
            status.indexed,
            status.noops,
            status.deleted,
            status.failed,
            status.dead_letters,
            status.queue_free_slots,
        );
        Ok(CallToolResult::success(vec![Content::text(result)]))
    }
}

#[tool_handler]
impl ServerHandler for SnippetToolServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "snipdex".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "This server manages a searchable library of code snippets. \
                Use 'save_snippet' to store and index a snippet, 'semantic_search' to find \
                snippets by meaning rather than keywords, 'delete_snippet' to remove one, \
                and 'index_status' to inspect the index and ingestion pipeline."
                    .to_string(),
            ),
        }
    }

    async fn initialize(
        &self,
        _request: InitializeRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<InitializeResult, McpError> {
        // Keep the peer for indexing notifications.
        let mut peer_guard = self.peer.lock().await;
        *peer_guard = Some(context.peer.clone());

        Ok(self.get_info())
    }
}
