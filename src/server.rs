//! HTTP surface for the snippet service.
//!
//! Same contracts as the MCP tools: both map onto the one query engine and
//! the one ingestion queue. Query failures come back as explicit error
//! responses, never disguised as zero results, and ingestion failures are
//! reported on the ingestion path only.

use axum::{
    Json, Router,
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::{IngestError, QueryError};
use crate::ingest::{IngestHandle, IngestOutcome, IngestPipeline, SequenceSource, SnippetEvent};
use crate::query::{QueryEngine, SearchHit};
use crate::store::{MetadataFilter, VectorStore};
use crate::types::SnippetId;

#[derive(Clone)]
pub struct AppState {
    query: QueryEngine,
    ingest: IngestHandle,
    pipeline: IngestPipeline,
    store: Arc<dyn VectorStore>,
    seq: SequenceSource,
}

impl AppState {
    #[must_use]
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
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SaveSnippetBody {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SaveSnippetResponse {
    pub id: String,
    pub result: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunks: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct QueryBody {
    pub query: String,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub query: String,
    pub results: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteParams {
    /// Sequence override for replay-aware callers; normally omitted.
    #[serde(default)]
    pub seq: Option<u64>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    code: String,
}

fn error_response(status: StatusCode, code: &str, message: String) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message,
            code: code.to_string(),
        }),
    )
        .into_response()
}

fn ingest_error_response(err: &IngestError) -> Response {
    let status = match err {
        IngestError::InvalidEvent(_) | IngestError::ContentTooLarge { .. } => {
            StatusCode::BAD_REQUEST
        }
        IngestError::QueueFull => StatusCode::TOO_MANY_REQUESTS,
        IngestError::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
        IngestError::Embedding(_) | IngestError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, err.status_code(), err.to_string())
}

fn query_error_response(err: &QueryError) -> Response {
    let status = match err {
        QueryError::InvalidQuery => StatusCode::BAD_REQUEST,
        QueryError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        QueryError::Embedding(_) | QueryError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, err.status_code(), err.to_string())
}

async fn save_snippet(
    State(state): State<AppState>,
    Json(body): Json<SaveSnippetBody>,
) -> Response {
    let Some(snippet_id) = SnippetId::new(&body.id) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "INVALID_EVENT",
            "snippet id must not be empty".to_string(),
        );
    };

    let event = SnippetEvent::Upsert {
        id: snippet_id,
        content: body.content,
        language: body.language,
        seq: state.seq.next(),
        timestamp: chrono::Utc::now(),
    };

    match state.ingest.submit_and_wait(event).await {
        Ok(IngestOutcome::Indexed {
            snippet_id,
            version,
            chunks,
        }) => (
            StatusCode::OK,
            Json(SaveSnippetResponse {
                id: snippet_id.to_string(),
                result: "indexed".to_string(),
                version: Some(version.get()),
                chunks: Some(chunks),
            }),
        )
            .into_response(),
        Ok(IngestOutcome::NoOp { snippet_id, reason }) => (
            StatusCode::OK,
            Json(SaveSnippetResponse {
                id: snippet_id.to_string(),
                result: format!("no_op:{reason:?}").to_lowercase(),
                version: None,
                chunks: None,
            }),
        )
            .into_response(),
        Ok(IngestOutcome::Failed { error, .. }) => ingest_error_response(&error),
        Ok(IngestOutcome::Deleted { .. }) => unreachable!("upsert cannot delete"),
        Err(err) => ingest_error_response(&err),
    }
}

async fn query_snippets(State(state): State<AppState>, Json(body): Json<QueryBody>) -> Response {
    let filter = MetadataFilter {
        language: body.language,
    };
    match state.query.search(&body.query, body.top_k, &filter).await {
        Ok(results) => (
            StatusCode::OK,
            Json(QueryResponse {
                query: body.query,
                results,
            }),
        )
            .into_response(),
        Err(err) => query_error_response(&err),
    }
}

async fn delete_snippet(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    Query(params): Query<DeleteParams>,
) -> Response {
    let Some(snippet_id) = SnippetId::new(&id) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "INVALID_EVENT",
            "snippet id must not be empty".to_string(),
        );
    };

    let event = SnippetEvent::Delete {
        id: snippet_id,
        seq: params.seq.unwrap_or_else(|| state.seq.next()),
        timestamp: chrono::Utc::now(),
    };

    match state.ingest.submit_and_wait(event).await {
        Ok(IngestOutcome::Deleted {
            snippet_id,
            entries_removed,
        }) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "id": snippet_id.to_string(),
                "result": "deleted",
                "entries_removed": entries_removed,
            })),
        )
            .into_response(),
        Ok(IngestOutcome::NoOp { snippet_id, reason }) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "id": snippet_id.to_string(),
                "result": format!("no_op:{reason:?}").to_lowercase(),
            })),
        )
            .into_response(),
        Ok(other) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INGEST_ERROR",
            format!("unexpected deletion outcome: {other:?}"),
        ),
        Err(err) => ingest_error_response(&err),
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn health_extended(State(state): State<AppState>) -> Response {
    let store_ok = state.store.ping().is_ok();
    let entries = state.store.entry_count().unwrap_or(0);
    let status = state.pipeline.status();

    let body = serde_json::json!({
        "status": if store_ok { "ok" } else { "degraded" },
        "store": { "reachable": store_ok, "entries": entries },
        "pipeline": status,
    });
    let code = if store_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body)).into_response()
}

#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/snippets", post(save_snippet))
        .route("/snippets/{id}", delete(delete_snippet))
        .route("/query", post(query_snippets))
        .route("/health", get(health))
        .route("/health/extended", get(health_extended))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Binds the HTTP server and runs it until the token is cancelled.
pub async fn serve_http(
    state: AppState,
    bind: &str,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "HTTP server listening");

    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::embedding::HashEmbedProvider;
    use crate::store::MemoryVectorStore;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn test_app() -> Router {
        let store = Arc::new(MemoryVectorStore::new());
        let provider = Arc::new(HashEmbedProvider::with_dimension(64));
        let settings = Settings::default();
        let (pipeline, _handle) = IngestPipeline::spawn(
            store.clone() as Arc<dyn VectorStore>,
            provider.clone(),
            &settings,
            CancellationToken::new(),
        );
        let query = QueryEngine::new(
            store.clone() as Arc<dyn VectorStore>,
            provider,
            settings.query,
        );
        router(AppState::new(
            query,
            pipeline,
            store,
            SequenceSource::new(),
        ))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = test_app().await;
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn save_then_query_round_trip() {
        let app = test_app().await;

        let response = app
            .clone()
            .oneshot(post_json(
                "/snippets",
                serde_json::json!({
                    "id": "add.py",
                    "content": "def add(a, b):\n    return a + b",
                    "language": "python",
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let saved = body_json(response).await;
        assert_eq!(saved["result"], "indexed");
        assert_eq!(saved["chunks"], 1);

        let response = app
            .oneshot(post_json(
                "/query",
                serde_json::json!({ "query": "function that adds numbers", "top_k": 3 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["results"][0]["snippet_id"], "add.py");
    }

    #[tokio::test]
    async fn blank_query_is_rejected_with_error_body() {
        let app = test_app().await;
        let response = app
            .oneshot(post_json("/query", serde_json::json!({ "query": "   " })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], "INVALID_QUERY");
    }

    #[tokio::test]
    async fn delete_removes_snippet() {
        let app = test_app().await;
        app.clone()
            .oneshot(post_json(
                "/snippets",
                serde_json::json!({ "id": "gone.py", "content": "def gone(): pass" }),
            ))
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(
                Request::delete("/snippets/gone.py")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["result"], "deleted");
        assert_eq!(body["entries_removed"], 1);
    }

    #[tokio::test]
    async fn extended_health_exposes_pipeline_counters() {
        let app = test_app().await;
        app.clone()
            .oneshot(post_json(
                "/snippets",
                serde_json::json!({ "id": "h.py", "content": "def h(): pass" }),
            ))
            .await
            .unwrap();

        let response = app
            .oneshot(
                Request::get("/health/extended")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["store"]["reachable"], true);
        assert_eq!(body["pipeline"]["indexed"], 1);
    }
}
