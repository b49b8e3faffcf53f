use async_stream::stream;
use axum::{
    extract::{Query, State},
    response::{
        sse::{Event, KeepAlive, Sse},
        Html, IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::Stream;
use http::{header, StatusCode};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::assistant::{
    configuration::{Configuration, ResearchMode, SearchAPI},
    error::{ErrorKind, PipelineError},
    graph::ResearchService,
    state::StatusUpdate,
};
use crate::history::{ExportFormat, ResearchHistory, ResearchRecord};

/// Read-only facts about how the server was configured, for `GET /status`.
#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    pub search_api: SearchAPI,
    pub search_configured: bool,
    pub research_mode: ResearchMode,
    pub model: String,
    #[serde(skip)]
    pub pdf_font_dir: Option<PathBuf>,
}

impl ServerInfo {
    pub fn from_config(config: &Configuration) -> Self {
        Self {
            search_api: config.search_api,
            search_configured: config.has_search_credential(),
            research_mode: config.research_mode,
            model: config.model_name().to_string(),
            pdf_font_dir: config.pdf_font_dir.as_ref().map(PathBuf::from),
        }
    }
}

pub struct AppState {
    research: Arc<dyn ResearchService>,
    history: ResearchHistory,
    info: ServerInfo,
}

impl AppState {
    pub fn new(research: Arc<dyn ResearchService>, info: ServerInfo) -> Self {
        Self {
            research,
            history: ResearchHistory::with_font_dir(info.pdf_font_dir.clone()),
            info,
        }
    }
}

#[derive(Deserialize)]
pub struct ResearchRequest {
    topic: String,
}

#[derive(Serialize, Deserialize)]
pub struct ResearchResponse {
    pub summary: String,
    pub status: String,
}

#[derive(Deserialize)]
pub struct StreamParams {
    #[serde(default)]
    topic: String,
}

#[derive(Deserialize)]
pub struct ExportParams {
    format: Option<ExportFormat>,
}

struct ApiError(PipelineError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind() {
            ErrorKind::InvalidTopic => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(ResearchResponse {
                summary: format!("Error: {}", self.0.user_message()),
                status: "Error occurred".to_string(),
            }),
        )
            .into_response()
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        ApiError(err)
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(serve_index))
        .route("/status", get(server_status))
        .route("/research", post(handle_research))
        .route("/research/stream", get(research_stream))
        .route("/history", get(list_history).delete(clear_history))
        .route("/history/export", get(export_history))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run_server(
    addr: SocketAddr,
    research: Arc<dyn ResearchService>,
    info: ServerInfo,
) -> anyhow::Result<()> {
    if !info.search_configured {
        warn!(
            var = info.search_api.key_var(),
            "Search credential missing, every research request will fail until it is set"
        );
    }
    let app = router(Arc::new(AppState::new(research, info)));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %listener.local_addr()?, "Starting server");
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

async fn server_status(State(state): State<Arc<AppState>>) -> Json<ServerInfo> {
    Json(state.info.clone())
}

async fn handle_research(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ResearchRequest>,
) -> Result<Json<ResearchResponse>, ApiError> {
    let report = state.research.research(&request.topic, None).await?;
    let summary = report.render();
    state
        .history
        .record(ResearchRecord::now(report.topic.as_str(), summary.clone()))
        .await;

    Ok(Json(ResearchResponse {
        summary,
        status: "Research completed".to_string(),
    }))
}

/// Runs the pipeline in a background task and streams its progress as
/// server-sent events: one `status` event per phase, then a single `result`
/// or `error` event. Closing the connection cancels the run.
async fn research_stream(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StreamParams>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let (status_tx, status_rx) = broadcast::channel::<StatusUpdate>(32);
    let (done_tx, done_rx) = oneshot::channel();
    let token = CancellationToken::new();
    let guard = token.clone().drop_guard();

    let task_state = state.clone();
    tokio::spawn(async move {
        let outcome = tokio::select! {
            _ = token.cancelled() => Err(PipelineError::cancelled()),
            result = task_state.research.research(&params.topic, Some(&status_tx)) => result,
        };
        if let Ok(report) = &outcome {
            task_state
                .history
                .record(ResearchRecord::now(report.topic.as_str(), report.render()))
                .await;
        }
        if done_tx.send(outcome).is_err() {
            debug!("Stream closed before the research finished");
        }
    });

    let events = stream! {
        let _guard = guard;
        let mut updates = BroadcastStream::new(status_rx);
        while let Some(update) = updates.next().await {
            match update {
                Ok(update) => {
                    let terminal = update.phase.is_terminal();
                    yield Event::default().event("status").json_data(&update);
                    if terminal {
                        break;
                    }
                }
                Err(e) => debug!(error = %e, "Status stream lagged"),
            }
        }

        match done_rx.await {
            Ok(Ok(report)) => {
                yield Event::default()
                    .event("result")
                    .json_data(serde_json::json!({ "summary": report.render() }));
            }
            Ok(Err(e)) => {
                let summary = format!("Error: {}", e.user_message());
                yield Event::default()
                    .event("error")
                    .json_data(serde_json::json!({ "summary": summary }));
            }
            Err(_) => {
                let summary = "Error: research task stopped unexpectedly";
                yield Event::default()
                    .event("error")
                    .json_data(serde_json::json!({ "summary": summary }));
            }
        }
    };

    Sse::new(events).keep_alive(KeepAlive::default())
}

async fn list_history(State(state): State<Arc<AppState>>) -> Json<Vec<ResearchRecord>> {
    Json(state.history.list().await)
}

async fn clear_history(State(state): State<Arc<AppState>>) -> StatusCode {
    state.history.clear().await;
    StatusCode::NO_CONTENT
}

async fn export_history(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ExportParams>,
) -> Response {
    let format = params.format.unwrap_or(ExportFormat::Json);
    match state.history.export(format).await {
        Ok(Some(body)) => (
            [
                (header::CONTENT_TYPE, format.content_type().to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}\"", format.file_name()),
                ),
            ],
            body,
        )
            .into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "No research to export!").into_response(),
        Err(e) => {
            warn!(error = %e, "History export failed");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Export failed: {e}")).into_response()
        }
    }
}

async fn serve_index() -> Html<&'static str> {
    Html(r#"
    <!DOCTYPE html>
    <html>
    <head>
        <title>Deep Researcher</title>
        <style>
            body {
                font-family: Arial, sans-serif;
                max-width: 800px;
                margin: 0 auto;
                padding: 20px;
            }
            .container {
                display: flex;
                flex-direction: column;
                gap: 20px;
            }
            textarea {
                width: 100%;
                height: 100px;
                padding: 10px;
            }
            button {
                padding: 10px 20px;
                background-color: #007bff;
                color: white;
                border: none;
                border-radius: 4px;
                cursor: pointer;
            }
            button.secondary {
                background-color: #6c757d;
            }
            #status {
                padding: 10px;
                margin-top: 10px;
                background-color: #f8f9fa;
                border-radius: 4px;
            }
            #result, #history {
                white-space: pre-wrap;
                padding: 20px;
                border: 1px solid #ddd;
                border-radius: 4px;
                display: none;
                margin-top: 20px;
            }
            .step {
                padding: 8px;
                margin: 4px 0;
                background-color: #e9ecef;
                border-radius: 4px;
            }
            .step.active {
                background-color: #cce5ff;
            }
            .step.completed {
                background-color: #d4edda;
            }
            .step.failed {
                background-color: #f8d7da;
            }
        </style>
    </head>
    <body>
        <div class="container">
            <h1>Deep Researcher</h1>
            <div>
                <label for="topic">Research Topic:</label>
                <textarea id="topic" placeholder="e.g., Latest trends in AI 2025"></textarea>
            </div>
            <div>
                <button onclick="submitResearch()">Start Research</button>
                <button class="secondary" onclick="showHistory()">History</button>
                <button class="secondary" onclick="location.href='/history/export?format=markdown'">Export Markdown</button>
                <button class="secondary" onclick="location.href='/history/export?format=json'">Export JSON</button>
                <button class="secondary" onclick="location.href='/history/export?format=pdf'">Export PDF</button>
                <button class="secondary" onclick="clearHistory()">Clear History</button>
            </div>
            <div id="steps">
                <div class="step" id="step-planning">1. Planning Search Queries</div>
                <div class="step" id="step-searching">2. Web Research</div>
                <div class="step" id="step-aggregating">3. Aggregating Evidence</div>
                <div class="step" id="step-writing">4. Writing Report</div>
                <div class="step" id="step-done">5. Done</div>
            </div>
            <div id="status"></div>
            <div id="result"></div>
            <div id="history"></div>
        </div>

        <script>
        const steps = ['planning', 'searching', 'aggregating', 'writing', 'done'];
        let source = null;

        function updateStep(phase, message) {
            const current = steps.indexOf(phase);
            steps.forEach((step, index) => {
                const el = document.getElementById(`step-${step}`);
                el.className = 'step';
                if (phase === 'failed') {
                    if (el.dataset.reached) el.className = 'step failed';
                } else if (index === current) {
                    el.className = phase === 'done' ? 'step completed' : 'step active';
                    el.dataset.reached = '1';
                } else if (index < current) {
                    el.className = 'step completed';
                    el.dataset.reached = '1';
                }
            });
            document.getElementById('status').textContent = message;
        }

        function submitResearch() {
            const topic = document.getElementById('topic').value;
            const result = document.getElementById('result');
            if (source) source.close();
            steps.forEach(step => delete document.getElementById(`step-${step}`).dataset.reached);

            result.style.display = 'block';
            result.textContent = 'Starting research...';

            source = new EventSource(`/research/stream?topic=${encodeURIComponent(topic)}`);
            source.addEventListener('status', e => {
                const update = JSON.parse(e.data);
                updateStep(update.phase, update.message);
            });
            source.addEventListener('result', e => {
                result.textContent = JSON.parse(e.data).summary;
                source.close();
            });
            source.addEventListener('error', e => {
                result.textContent = e.data ? JSON.parse(e.data).summary : 'Error: connection lost';
                source.close();
            });
        }

        async function showHistory() {
            const el = document.getElementById('history');
            const records = await (await fetch('/history')).json();
            el.style.display = 'block';
            el.textContent = records.length === 0
                ? 'No research history yet.'
                : records.map((r, i) => `#${i + 1} ${r.timestamp}  ${r.topic}`).join('\n');
        }

        async function clearHistory() {
            await fetch('/history', { method: 'DELETE' });
            showHistory();
        }
        </script>
    </body>
    </html>
    "#)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assistant::error::AgentError;
    use crate::assistant::state::{Phase, ResearchReport, Topic};
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use http::Request;
    use tower::ServiceExt;

    struct FakeService;

    #[async_trait]
    impl ResearchService for FakeService {
        fn check_credentials(&self) -> Result<(), PipelineError> {
            Ok(())
        }

        async fn research(
            &self,
            topic: &str,
            status_tx: Option<&broadcast::Sender<StatusUpdate>>,
        ) -> Result<ResearchReport, PipelineError> {
            let send = |phase: Phase| {
                if let Some(tx) = status_tx {
                    let _ = tx.send(StatusUpdate {
                        phase,
                        message: phase.to_string(),
                        elapsed_ms: 0,
                        timestamp: 0,
                        detail: None,
                    });
                }
            };
            send(Phase::Planning);
            let topic = match Topic::parse(topic) {
                Ok(topic) => topic,
                Err(e) => {
                    send(Phase::Failed);
                    return Err(e);
                }
            };
            if topic.as_str() == "explode" {
                send(Phase::Failed);
                return Err(PipelineError::writing(AgentError::Unreachable("secret host".into())));
            }
            send(Phase::Done);
            Ok(ResearchReport {
                topic,
                body: "Body text.".into(),
                sources: Vec::new(),
                queries: Vec::new(),
                low_confidence: false,
            })
        }
    }

    fn app() -> Router {
        let info = ServerInfo::from_config(&Configuration::default());
        router(Arc::new(AppState::new(Arc::new(FakeService), info)))
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn post_research(topic: &str) -> Request<Body> {
        Request::post("/research")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::json!({ "topic": topic }).to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_index_and_status() {
        let app = app();
        let index = app
            .clone()
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(index.status(), StatusCode::OK);
        assert!(body_text(index).await.contains("Deep Researcher"));

        let status = app
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let info: serde_json::Value = serde_json::from_str(&body_text(status).await).unwrap();
        assert_eq!(info["search_configured"], false);
    }

    #[tokio::test]
    async fn test_research_success_is_recorded() {
        let app = app();
        let response = app.clone().oneshot(post_research("Rust")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: ResearchResponse = serde_json::from_str(&body_text(response).await).unwrap();
        assert!(body.summary.starts_with("## Rust"));
        assert_eq!(body.status, "Research completed");

        let history = app
            .oneshot(Request::get("/history").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let records: Vec<ResearchRecord> = serde_json::from_str(&body_text(history).await).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].topic, "Rust");
    }

    #[tokio::test]
    async fn test_research_errors() {
        let app = app();
        let empty = app.clone().oneshot(post_research("   ")).await.unwrap();
        assert_eq!(empty.status(), StatusCode::BAD_REQUEST);
        let body: ResearchResponse = serde_json::from_str(&body_text(empty).await).unwrap();
        assert!(body.summary.starts_with("Error: "));

        let failed = app.oneshot(post_research("explode")).await.unwrap();
        assert_eq!(failed.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let text = body_text(failed).await;
        assert!(!text.contains("secret host"));
    }

    #[tokio::test]
    async fn test_export_empty_and_filled() {
        let app = app();
        let empty = app
            .clone()
            .oneshot(Request::get("/history/export?format=json").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(empty.status(), StatusCode::NOT_FOUND);
        let empty_pdf = app
            .clone()
            .oneshot(Request::get("/history/export?format=pdf").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(empty_pdf.status(), StatusCode::NOT_FOUND);

        app.clone().oneshot(post_research("Rust")).await.unwrap();
        let export = app
            .clone()
            .oneshot(Request::get("/history/export?format=markdown").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(export.status(), StatusCode::OK);
        assert_eq!(
            export.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"research_history.md\""
        );
        assert!(body_text(export).await.starts_with("# Research History"));

        let cleared = app
            .clone()
            .oneshot(Request::delete("/history").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(cleared.status(), StatusCode::NO_CONTENT);
        let after = app
            .oneshot(Request::get("/history").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_text(after).await, "[]");
    }

    #[tokio::test]
    async fn test_stream_emits_status_then_result() {
        let response = app()
            .oneshot(Request::get("/research/stream?topic=Rust").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let text = body_text(response).await;
        let planning = text.find("event: status").unwrap();
        let result = text.find("event: result").unwrap();
        assert!(planning < result);
        assert!(text.contains("\"phase\":\"done\""));
        assert!(!text.contains("event: error"));
    }

    #[tokio::test]
    async fn test_stream_reports_error_event() {
        let response = app()
            .oneshot(Request::get("/research/stream?topic=").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let text = body_text(response).await;
        assert!(text.contains("\"phase\":\"failed\""));
        assert!(text.contains("event: error"));
        assert!(text.contains("Error: "));
    }
}
