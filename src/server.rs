use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::{routing::{get, post}, Json, Router};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::agent::engine::{self, RenderUpdate};
use crate::agent::tools::{ToolContext, ToolDispatcher, ToolEvent};
use crate::config::AppConfig;
use crate::credentials;
use crate::error::{AppError, AppResult};
use crate::models::OpenAICompatible;
use crate::quiz::generator::{self, QuizSource};
use crate::quiz::{Difficulty, PublicQuestion, QuizAttempt, Scorecard, SubmitOutcome};
use crate::retrieval::preparer::sanitize_file_name;
use crate::retrieval::{FileIdentity, RetrievalPreparer, Upload};
use crate::session::{Message, Session};
use crate::settings::{resolve_effective_settings, EffectiveSettings, GlobalConfigDefaults, RequestOverrides, SessionSettings, SessionSettingsPatch};
use crate::storage::SqliteEmbeddingStore;

const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

type SharedSession = Arc<Mutex<Session>>;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub http: reqwest::Client,
    pub sessions: Arc<RwLock<HashMap<Uuid, SharedSession>>>,
    pub preparer: RetrievalPreparer,
    pub dispatcher: Arc<ToolDispatcher>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub async fn initialize(config: AppConfig, metrics: Option<PrometheusHandle>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().connect_timeout(std::time::Duration::from_secs(10)).build()?;
        let store = Arc::new(SqliteEmbeddingStore::initialize(&config.embeddings_db_url()).await?);
        let preparer = RetrievalPreparer::from_config(&config, store)?;
        let dispatcher = Arc::new(ToolDispatcher::new(ToolContext::from_config(http.clone(), &config)));
        Ok(Self {
            config: Arc::new(config),
            http,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            preparer,
            dispatcher,
            metrics,
        })
    }

    fn provider(&self, api_key: &str) -> OpenAICompatible {
        OpenAICompatible::new(self.http.clone(), &self.config.openai_base_url, api_key)
            .with_embedding_model(&self.config.embedding_model)
    }

    fn effective(&self, session: &Session, overrides: &RequestOverrides) -> EffectiveSettings {
        resolve_effective_settings(&GlobalConfigDefaults::from(self.config.as_ref()), &session.settings, overrides)
    }

    async fn session(&self, id: Uuid) -> AppResult<SharedSession> {
        self.sessions.read().await.get(&id).cloned().ok_or_else(|| AppError::NotFound(format!("session {}", id)))
    }
}

async fn read_upload(mut multipart: Multipart) -> AppResult<Upload> {
    while let Some(field) = multipart.next_field().await.map_err(|e| AppError::BadRequest(e.to_string()))? {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| AppError::BadRequest("file field has no file name".into()))?;
        let bytes = field.bytes().await.map_err(|e| AppError::BadRequest(e.to_string()))?;
        return Ok(Upload { file_name, bytes: bytes.to_vec() });
    }
    Err(AppError::BadRequest("multipart field `file` is missing".into()))
}

fn sse_response(rx: mpsc::UnboundedReceiver<RenderUpdate>) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    Sse::new(UnboundedReceiverStream::new(rx).map(|u| Event::default().event(u.event_name()).json_data(&u)))
}

fn finish_stream(tx: &engine::RenderTx, result: anyhow::Result<()>) {
    if let Err(e) = result {
        warn!(error = %format!("{:#}", e), "streamed turn failed");
        engine::emit(tx, RenderUpdate::Error { message: format!("{:#}", e) });
    }
    engine::emit(tx, RenderUpdate::Done);
}

#[derive(Debug, Deserialize)]
struct ValidateBody {
    api_key: String,
}

#[derive(Debug, Serialize)]
struct ValidateResponse {
    valid: bool,
}

async fn validate_credentials(State(state): State<AppState>, Json(body): Json<ValidateBody>) -> Json<ValidateResponse> {
    let valid = credentials::is_valid(&state.http, &state.config.openai_base_url, &body.api_key).await;
    Json(ValidateResponse { valid })
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionBody {
    pub api_key: String,
    pub settings: Option<SessionSettings>,
}

#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
}

async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionBody>,
) -> AppResult<Json<CreateSessionResponse>> {
    if !credentials::is_valid(&state.http, &state.config.openai_base_url, &body.api_key).await {
        return Err(AppError::Unauthorized("please enter a valid OpenAI API key".into()));
    }
    let session = Session::new(body.api_key, body.settings.unwrap_or_default());
    let (id, created_at) = (session.id, session.created_at);
    state.sessions.write().await.insert(id, Arc::new(Mutex::new(session)));
    info!(session = %id, "session created");
    Ok(Json(CreateSessionResponse { id, created_at }))
}

#[derive(Debug, Serialize)]
pub struct ListSessionsResponse {
    pub sessions: Vec<Uuid>,
}

async fn list_sessions(State(state): State<AppState>) -> Json<ListSessionsResponse> {
    let sessions = state.sessions.read().await;
    let mut ids: Vec<Uuid> = sessions.keys().copied().collect();
    ids.sort();
    Json(ListSessionsResponse { sessions: ids })
}

async fn delete_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> AppResult<StatusCode> {
    match state.sessions.write().await.remove(&id) {
        Some(_) => {
            info!(session = %id, "session deleted");
            Ok(StatusCode::NO_CONTENT)
        }
        None => Err(AppError::NotFound(format!("session {}", id))),
    }
}

#[derive(Debug, Serialize)]
struct SessionSettingsResponse {
    settings: SessionSettings,
}

async fn get_session_settings(State(state): State<AppState>, Path(id): Path<Uuid>) -> AppResult<Json<SessionSettingsResponse>> {
    let session = state.session(id).await?;
    let s = session.lock().await;
    Ok(Json(SessionSettingsResponse { settings: s.settings.clone() }))
}

async fn patch_session_settings(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(patch): Json<SessionSettingsPatch>,
) -> AppResult<Json<SessionSettingsResponse>> {
    let session = state.session(id).await?;
    let mut s = session.lock().await;
    s.settings.apply_patch(patch);
    Ok(Json(SessionSettingsResponse { settings: s.settings.clone() }))
}

#[derive(Debug, Serialize)]
struct DocumentSummary {
    file_name: String,
    fingerprint: String,
    chunks: usize,
    reused: bool,
}

async fn upload_document(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    multipart: Multipart,
) -> AppResult<Json<DocumentSummary>> {
    let session = state.session(id).await?;
    let upload = read_upload(multipart).await?;
    let name = sanitize_file_name(&upload.file_name).map_err(|e| AppError::BadRequest(e.to_string()))?;
    let identity = FileIdentity::of(&name, &upload.bytes);

    let mut s = session.lock().await;
    if let Some(index) = s.document.index.as_ref().filter(|i| i.identity == identity) {
        return Ok(Json(DocumentSummary {
            file_name: identity.file_name,
            fingerprint: identity.fingerprint,
            chunks: index.chunks().len(),
            reused: true,
        }));
    }
    let provider = state.provider(&s.api_key);
    // a failed preparation leaves the previous index in place
    let index = state
        .preparer
        .prepare(&upload, &provider)
        .await
        .map_err(|e| AppError::Unprocessable(format!("could not prepare {}: {:#}", name, e)))?;
    let summary = DocumentSummary {
        file_name: index.identity.file_name.clone(),
        fingerprint: index.identity.fingerprint.clone(),
        chunks: index.chunks().len(),
        reused: false,
    };
    s.document.index = Some(index);
    info!(session = %id, file = %summary.file_name, chunks = summary.chunks, "document ready");
    Ok(Json(summary))
}

#[derive(Debug, Serialize)]
struct MessagesResponse {
    messages: Vec<Message>,
}

async fn list_document_messages(State(state): State<AppState>, Path(id): Path<Uuid>) -> AppResult<Json<MessagesResponse>> {
    let session = state.session(id).await?;
    let s = session.lock().await;
    Ok(Json(MessagesResponse { messages: s.document.transcript.messages().to_vec() }))
}

#[derive(Debug, Deserialize)]
struct MessageBody {
    content: String,
    #[serde(default)]
    overrides: RequestOverrides,
}

impl MessageBody {
    fn content(&self) -> AppResult<String> {
        let content = self.content.trim();
        if content.is_empty() {
            return Err(AppError::BadRequest("message is empty".into()));
        }
        Ok(content.to_string())
    }
}

async fn post_document_message(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<MessageBody>,
) -> AppResult<impl IntoResponse> {
    let session = state.session(id).await?;
    let question = body.content()?;
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut guard = session.lock_owned().await;
        let s: &mut Session = &mut guard;
        let settings = state.effective(s, &body.overrides);
        let provider = state.provider(&s.api_key);
        let result = engine::answer_document_question(&provider, &provider, &mut s.document, &settings, &question, &tx).await;
        finish_stream(&tx, result);
    });
    Ok(sse_response(rx))
}

#[derive(Debug, Serialize)]
struct ResearchMessagesResponse {
    messages: Vec<Message>,
    tool_history: Vec<ToolEvent>,
    report_available: bool,
}

async fn list_research_messages(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ResearchMessagesResponse>> {
    let session = state.session(id).await?;
    let s = session.lock().await;
    Ok(Json(ResearchMessagesResponse {
        messages: s.research.transcript.messages().to_vec(),
        tool_history: s.research.tool_history.clone(),
        report_available: s.research.report.is_some(),
    }))
}

async fn post_research_message(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<MessageBody>,
) -> AppResult<impl IntoResponse> {
    let session = state.session(id).await?;
    let message = body.content()?;
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut guard = session.lock_owned().await;
        let s: &mut Session = &mut guard;
        let mut spec = engine::research_assistant_spec(&state.config);
        spec.model = state.effective(s, &body.overrides).model;
        let provider = state.provider(&s.api_key);
        let result = engine::research_turn(&provider, &state.dispatcher, &spec, &mut s.research, &message, &tx).await;
        finish_stream(&tx, result);
    });
    Ok(sse_response(rx))
}

async fn download_report(State(state): State<AppState>, Path(id): Path<Uuid>) -> AppResult<impl IntoResponse> {
    let session = state.session(id).await?;
    let s = session.lock().await;
    let report = s.research.report.clone().ok_or_else(|| AppError::NotFound("no research report saved yet".into()))?;
    let disposition = format!("attachment; filename=\"{}\"", report.file_name);
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()), (header::CONTENT_DISPOSITION, disposition)],
        report.content,
    ))
}

#[derive(Debug, Serialize)]
struct QuizDocumentSummary {
    file_name: String,
    chunks: usize,
}

async fn upload_quiz_document(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    multipart: Multipart,
) -> AppResult<Json<QuizDocumentSummary>> {
    let session = state.session(id).await?;
    let upload = read_upload(multipart).await?;
    sanitize_file_name(&upload.file_name).map_err(|e| AppError::BadRequest(e.to_string()))?;
    let mut s = session.lock().await;
    let doc = state.preparer.split(&upload).await.map_err(|e| AppError::Unprocessable(format!("{:#}", e)))?;
    let changed = s.quiz.document.as_ref().map(|d| d.identity != doc.identity).unwrap_or(true);
    if changed {
        // quizzes keyed by file name would otherwise outlive the old content
        s.quiz.generated.clear();
        s.quiz.active = None;
    }
    let summary = QuizDocumentSummary { file_name: doc.identity.file_name.clone(), chunks: doc.chunks.len() };
    s.quiz.document = Some(doc);
    Ok(Json(summary))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum QuizSourceKind {
    File,
    Wikipedia,
}

#[derive(Debug, Deserialize)]
struct GenerateQuizBody {
    source: QuizSourceKind,
    topic: Option<String>,
    count: u8,
    #[serde(default)]
    difficulty: Difficulty,
    #[serde(default)]
    overrides: RequestOverrides,
}

#[derive(Debug, Serialize)]
struct QuizResponse {
    topic: String,
    questions: Vec<PublicQuestion>,
    total: usize,
    submit_enabled: bool,
    reused: bool,
}

async fn generate_quiz(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<GenerateQuizBody>,
) -> AppResult<Json<QuizResponse>> {
    let count = generator::validate_count(body.count).map_err(|e| AppError::BadRequest(e.to_string()))?;
    let session = state.session(id).await?;
    let mut guard = session.lock().await;
    let s: &mut Session = &mut guard;

    let source = match body.source {
        QuizSourceKind::File => QuizSource::Document(
            s.quiz.document.as_ref().ok_or_else(|| AppError::Conflict("upload a document for the quiz first".into()))?,
        ),
        QuizSourceKind::Wikipedia => {
            let term = body.topic.as_deref().map(str::trim).unwrap_or_default();
            if term.is_empty() {
                return Err(AppError::BadRequest("a Wikipedia search term is required".into()));
            }
            QuizSource::Wikipedia(term)
        }
    };
    let key = source.key(count, body.difficulty);

    let reused = s.quiz.generated.contains_key(&key);
    if !reused {
        let settings = state.effective(s, &body.overrides);
        let material = generator::gather(&state.http, &state.config.wikipedia_base_url, source)
            .await
            .map_err(|e| AppError::Upstream(format!("{:#}", e)))?;
        let provider = state.provider(&s.api_key);
        let quiz = generator::generate(&provider, &settings, &material, count, body.difficulty)
            .await
            .map_err(|e| AppError::Upstream(format!("{:#}", e)))?;
        s.quiz.generated.insert(key.clone(), quiz);
    }
    let quiz = s.quiz.generated.get(&key).cloned().ok_or_else(|| anyhow::anyhow!("quiz cache lost {:?}", key))?;
    let keep_attempt = s.quiz.active.as_ref().map(|(k, _)| *k == key).unwrap_or(false);
    if !keep_attempt {
        s.quiz.active = Some((key.clone(), QuizAttempt::new(quiz.clone())));
    }
    let submit_enabled = s.quiz.active.as_ref().map(|(_, a)| a.submit_enabled()).unwrap_or(true);
    Ok(Json(QuizResponse { topic: key.topic, questions: quiz.public_view(), total: quiz.total(), submit_enabled, reused }))
}

#[derive(Debug, Deserialize)]
struct SelectionsBody {
    selections: Vec<Option<String>>,
}

#[derive(Debug, Serialize)]
struct GradeResponse {
    #[serde(flatten)]
    scorecard: Scorecard,
    submit_enabled: bool,
}

async fn grade_quiz(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<SelectionsBody>,
) -> AppResult<Json<GradeResponse>> {
    let session = state.session(id).await?;
    let s = session.lock().await;
    let (_, attempt) = s.quiz.active.as_ref().ok_or_else(|| AppError::Conflict("no quiz has been generated".into()))?;
    Ok(Json(GradeResponse { scorecard: attempt.grade(&body.selections), submit_enabled: attempt.submit_enabled() }))
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    #[serde(flatten)]
    outcome: SubmitOutcome,
    message: String,
    submit_enabled: bool,
}

async fn submit_quiz(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<SelectionsBody>,
) -> AppResult<Json<SubmitResponse>> {
    let session = state.session(id).await?;
    let mut s = session.lock().await;
    let (_, attempt) = s.quiz.active.as_mut().ok_or_else(|| AppError::Conflict("no quiz has been generated".into()))?;
    let outcome = attempt.submit(&body.selections).map_err(|e| AppError::Conflict(e.to_string()))?;
    Ok(Json(SubmitResponse { message: outcome.message(), outcome, submit_enabled: attempt.submit_enabled() }))
}

async fn render_metrics(State(state): State<AppState>) -> AppResult<String> {
    state.metrics.as_ref().map(|h| h.render()).ok_or_else(|| AppError::NotFound("metrics recorder not installed".into()))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/credentials/validate", post(validate_credentials))
        .route("/v1/sessions", post(create_session).get(list_sessions))
        .route("/v1/sessions/:id", axum::routing::delete(delete_session))
        .route("/v1/sessions/:id/settings", get(get_session_settings).patch(patch_session_settings))
        .route("/v1/sessions/:id/document", post(upload_document))
        .route("/v1/sessions/:id/document/messages", get(list_document_messages).post(post_document_message))
        .route("/v1/sessions/:id/quiz/document", post(upload_quiz_document))
        .route("/v1/sessions/:id/quiz", post(generate_quiz))
        .route("/v1/sessions/:id/quiz/grade", post(grade_quiz))
        .route("/v1/sessions/:id/quiz/submit", post(submit_quiz))
        .route("/v1/sessions/:id/research/messages", get(list_research_messages).post(post_research_message))
        .route("/v1/sessions/:id/research/report", get(download_report))
        .route("/metrics", get(render_metrics))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
