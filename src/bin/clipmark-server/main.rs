use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::middleware::from_fn;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnFailure, DefaultOnResponse, TraceLayer};
use tracing::{Level, error, info, warn};

mod auth;
mod metrics;
mod store;

use auth::{Accounts, AuthError};
use clipmark::api::{Credentials, ErrorBody};
use clipmark::clip::{
    AI_CLASSES_HEADER, AI_INTERFACE_HEADER, AI_REGIONS_HEADER, CLIP_ANNOTATED_HEADER,
    CLIP_ID_HEADER, CLIP_PATH_HEADER,
};
use clipmark::submission::AnnotationSubmission;
use store::{AnnotatedIndex, AnnotationStore, ClipEntry, ClipLibrary};

#[derive(Parser, Debug)]
#[command(name = "clipmark-server")]
#[command(about = "Reference backend serving WAV clips and collecting annotations")]
struct Params {
    /// Directory of `.wav` clips. Subdirectories are named pools.
    #[arg(short = 'c', long = "clips")]
    clips_dir: PathBuf,

    /// Append-only JSON-lines file receiving submissions.
    #[arg(short = 'a', long = "annotations", default_value = "annotations.jsonl")]
    annotations_path: PathBuf,

    /// Host interface to bind to.
    #[arg(long = "host", default_value = "127.0.0.1")]
    host: String,

    /// TCP port to listen on.
    #[arg(long = "port", default_value_t = 3000)]
    port: u16,

    /// Maximum request body size (bytes).
    #[arg(long = "max-bytes", default_value_t = 10 * 1024 * 1024)]
    max_bytes: usize,

    /// Per-request timeout in seconds.
    #[arg(long = "request-timeout", default_value_t = 30)]
    request_timeout_secs: u64,
}

#[derive(Clone)]
struct AppState {
    clips: Arc<ClipLibrary>,
    annotations: Arc<AnnotationStore>,
    accounts: Arc<Accounts>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClipQuery {
    #[serde(default)]
    annotated: Option<bool>,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    username: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MessageBody {
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<String>,
}

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "Unauthorized")
    }

    fn internal(err: impl std::fmt::Display) -> Self {
        error!(error = %err, "request failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        let status = match err {
            AuthError::MissingFields | AuthError::WeakPassword => StatusCode::BAD_REQUEST,
            AuthError::UsernameTaken => StatusCode::CONFLICT,
            AuthError::InvalidCredentials => StatusCode::UNAUTHORIZED,
            AuthError::Hash(_) => return AppError::internal(err),
        };
        AppError::new(status, err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

#[tokio::main]
async fn main() {
    clipmark::logging::init();

    if let Err(err) = run().await {
        error!(error = ?err, "clipmark-server failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let params = Params::parse();

    if let Err(err) = metrics::init() {
        warn!(error = ?err, "metrics disabled (init failed)");
    }

    let addr: SocketAddr = format!("{}:{}", params.host, params.port)
        .parse()
        .context("invalid host/port bind address")?;

    let clips = ClipLibrary::new(&params.clips_dir);
    let found = clips
        .list(None)
        .await
        .with_context(|| format!("failed to read clip directory {}", params.clips_dir.display()))?
        .len();
    info!(clips = found, dir = %clips.root().display(), "clip library ready");

    let state = AppState {
        clips: Arc::new(clips),
        annotations: Arc::new(AnnotationStore::open(&params.annotations_path).await?),
        accounts: Arc::new(Accounts::default()),
    };

    let app = router(state)
        .layer(DefaultBodyLimit::max(params.max_bytes))
        .layer(TimeoutLayer::new(Duration::from_secs(
            params.request_timeout_secs,
        )))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(
                    DefaultMakeSpan::new()
                        .level(Level::INFO)
                        .include_headers(false),
                )
                .on_response(DefaultOnResponse::new().level(Level::INFO))
                .on_failure(DefaultOnFailure::new().level(Level::ERROR)),
        );

    let listener = TcpListener::bind(addr).await.context("bind failed")?;
    info!(%addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics::prometheus_metrics))
        .route("/clip/random/file", get(random_clip))
        .route("/clip/{pool}", get(pool_clip))
        .route("/annotation", post(submit_annotation))
        .route("/protected", get(protected))
        .route("/login", post(login))
        .route("/register", post(register))
        .route_layer(from_fn(metrics::track_http_metrics))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

async fn root() -> &'static str {
    "clipmark-server: GET /clip/random/file, POST /annotation, POST /login"
}

async fn healthz() -> &'static str {
    "ok"
}

async fn random_clip(
    State(state): State<AppState>,
    Query(query): Query<ClipQuery>,
) -> Result<Response, AppError> {
    // A username narrows the draw to that user's own pool when one exists.
    let pool = match query.username.as_deref() {
        Some(name) if state.clips.has_pool(name).await => Some(name.to_owned()),
        _ => None,
    };
    serve_clip(&state, pool.as_deref(), &query).await
}

async fn pool_clip(
    State(state): State<AppState>,
    Path(pool): Path<String>,
    Query(query): Query<ClipQuery>,
) -> Result<Response, AppError> {
    if !state.clips.has_pool(&pool).await {
        return Err(AppError::new(
            StatusCode::NOT_FOUND,
            format!("Unknown clip pool '{pool}'"),
        ));
    }
    serve_clip(&state, Some(&pool), &query).await
}

async fn serve_clip(
    state: &AppState,
    pool: Option<&str>,
    query: &ClipQuery,
) -> Result<Response, AppError> {
    let clips = state.clips.list(pool).await.map_err(AppError::internal)?;
    let index = state.annotations.index().await;

    let candidates = eligible_clips(clips, &index, query);
    let Some(clip) = pick_random(candidates) else {
        metrics::record_clip_request("exhausted");
        return Ok(StatusCode::NO_CONTENT.into_response());
    };

    let audio = tokio::fs::read(&clip.path)
        .await
        .map_err(AppError::internal)?;
    let annotated = index.get(&clip.id).is_some_and(|users| !users.is_empty());
    let sidecar = state.clips.load_sidecar(&clip).await;

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("audio/wav"));
    insert_header(&mut headers, CLIP_ID_HEADER, &clip.id)?;
    insert_header(&mut headers, CLIP_PATH_HEADER, &clip.rel_path)?;
    insert_header(&mut headers, CLIP_ANNOTATED_HEADER, &annotated.to_string())?;
    if let Some(ai) = sidecar {
        let classes = serde_json::to_string(&ai.classes).map_err(AppError::internal)?;
        let regions = serde_json::to_string(&ai.regions).map_err(AppError::internal)?;
        // Assistance is optional; a value that cannot travel as a header is dropped.
        for (name, value) in [(AI_CLASSES_HEADER, classes), (AI_REGIONS_HEADER, regions)] {
            if insert_header(&mut headers, name, &value).is_err() {
                warn!(clip_id = %clip.id, header = name, "AI header not representable; omitted");
            }
        }
        if let Some(version) = ai.interface_version {
            insert_header(&mut headers, AI_INTERFACE_HEADER, &version.to_string())?;
        }
    }

    metrics::record_clip_request("served");
    info!(clip_id = %clip.id, bytes = audio.len(), "clip served");
    Ok((headers, audio).into_response())
}

/// Clips matching the `annotated` filter that the requesting user hasn't annotated yet.
fn eligible_clips(clips: Vec<ClipEntry>, index: &AnnotatedIndex, query: &ClipQuery) -> Vec<ClipEntry> {
    clips
        .into_iter()
        .filter(|clip| {
            let users = index.get(&clip.id);
            let annotated = users.is_some_and(|u| !u.is_empty());
            if query.annotated.is_some_and(|want| want != annotated) {
                return false;
            }
            match &query.user_id {
                Some(user) => !users.is_some_and(|u| u.contains(user)),
                None => true,
            }
        })
        .collect()
}

fn pick_random(mut candidates: Vec<ClipEntry>) -> Option<ClipEntry> {
    if candidates.is_empty() {
        return None;
    }
    let idx = rand::thread_rng().gen_range(0..candidates.len());
    Some(candidates.swap_remove(idx))
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) -> Result<(), AppError> {
    let value = HeaderValue::from_str(value).map_err(AppError::internal)?;
    headers.insert(HeaderName::from_static(name), value);
    Ok(())
}

async fn submit_annotation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(submission): Json<AnnotationSubmission>,
) -> Result<Response, AppError> {
    let Some(principal) = state.accounts.authenticate(&headers).await else {
        return Err(AppError::unauthorized());
    };
    if submission.annotated_by != principal.user_id {
        return Err(AppError::new(
            StatusCode::FORBIDDEN,
            "annotatedBy does not match the signed-in user",
        ));
    }
    if submission.annotations.is_empty() {
        return Err(AppError::bad_request("No annotations provided"));
    }
    if let Some(bad) = submission
        .annotations
        .iter()
        .find(|a| !(a.start.is_finite() && a.end.is_finite() && 0.0 <= a.start && a.start < a.end))
    {
        return Err(AppError::bad_request(format!(
            "Invalid region bounds [{}, {}]",
            bad.start, bad.end
        )));
    }

    let clip_id = submission.audio_file_id.clone();
    let regions = submission.annotations.len();
    state
        .annotations
        .append(submission)
        .await
        .map_err(AppError::internal)?;
    metrics::record_annotation();
    info!(%clip_id, user_id = %principal.user_id, username = %principal.username, regions, "annotation stored");

    let body = MessageBody {
        message: "Annotation saved".to_owned(),
        user_id: None,
    };
    Ok((StatusCode::CREATED, Json(body)).into_response())
}

async fn protected(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<MessageBody>, AppError> {
    let principal = state
        .accounts
        .authenticate(&headers)
        .await
        .ok_or_else(AppError::unauthorized)?;
    Ok(Json(MessageBody {
        message: "Access granted".to_owned(),
        user_id: Some(principal.user_id),
    }))
}

async fn login(
    State(state): State<AppState>,
    Json(credentials): Json<Credentials>,
) -> Result<Response, AppError> {
    let resp = state
        .accounts
        .login(&credentials.username, &credentials.password)
        .await?;
    info!(user_id = %resp.user_id, "login");
    Ok(Json(resp).into_response())
}

async fn register(
    State(state): State<AppState>,
    Json(credentials): Json<Credentials>,
) -> Result<Response, AppError> {
    let resp = state
        .accounts
        .register(&credentials.username, &credentials.password)
        .await?;
    info!(user_id = %resp.user_id, "user registered");
    Ok((StatusCode::CREATED, Json(resp)).into_response())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn clip(id: &str) -> ClipEntry {
        ClipEntry {
            id: id.to_owned(),
            rel_path: format!("{id}.wav"),
            path: PathBuf::from(format!("{id}.wav")),
        }
    }

    fn ids(clips: &[ClipEntry]) -> Vec<&str> {
        clips.iter().map(|c| c.id.as_str()).collect()
    }

    fn index() -> AnnotatedIndex {
        let mut index = AnnotatedIndex::new();
        index.insert("a".into(), HashSet::from(["1".to_owned()]));
        index.insert("b".into(), HashSet::from(["2".to_owned()]));
        index
    }

    #[test]
    fn eligible_clips_filter_by_annotation_state() {
        let all = vec![clip("a"), clip("b"), clip("c")];

        let unannotated = eligible_clips(
            all.clone(),
            &index(),
            &ClipQuery {
                annotated: Some(false),
                ..Default::default()
            },
        );
        assert_eq!(ids(&unannotated), ["c"]);

        let for_user = eligible_clips(
            all.clone(),
            &index(),
            &ClipQuery {
                user_id: Some("1".into()),
                ..Default::default()
            },
        );
        assert_eq!(ids(&for_user), ["b", "c"]);

        let everything = eligible_clips(all, &index(), &ClipQuery::default());
        assert_eq!(everything.len(), 3);
    }

    #[test]
    fn pick_random_handles_empty_and_single() {
        assert!(pick_random(Vec::new()).is_none());
        assert_eq!(pick_random(vec![clip("only")]).map(|c| c.id), Some("only".into()));
    }

    async fn state_over(dir: &std::path::Path) -> anyhow::Result<AppState> {
        Ok(AppState {
            clips: Arc::new(ClipLibrary::new(dir)),
            annotations: Arc::new(AnnotationStore::open(dir.join("annotations.jsonl")).await?),
            accounts: Arc::new(Accounts::default()),
        })
    }

    #[tokio::test]
    async fn empty_pool_answers_no_content_and_unknown_pool_is_not_found() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::create_dir(dir.path().join("birds"))?;
        let state = state_over(dir.path()).await?;

        let resp = random_clip(State(state.clone()), Query(ClipQuery::default()))
            .await
            .map_err(|err| anyhow::anyhow!(err.message))?;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let resp = pool_clip(
            State(state.clone()),
            Path("birds".to_owned()),
            Query(ClipQuery::default()),
        )
        .await
        .map_err(|err| anyhow::anyhow!(err.message))?;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let Err(err) = pool_clip(
            State(state),
            Path("mrako".to_owned()),
            Query(ClipQuery::default()),
        )
        .await
        else {
            anyhow::bail!("an unknown pool must not look like an empty one");
        };
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.message, "Unknown clip pool 'mrako'");
        Ok(())
    }

    #[test]
    fn auth_errors_map_to_statuses() {
        assert_eq!(
            AppError::from(AuthError::InvalidCredentials).status,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::from(AuthError::UsernameTaken).status,
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::from(AuthError::WeakPassword).status,
            StatusCode::BAD_REQUEST
        );
    }
}
