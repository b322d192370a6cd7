//! HTTP server implementation using Axum.

use crate::error::{Error, Result};
use crate::lifecycle::LifecycleManager;
use crate::pipeline::SubmittedJob;
use crate::runtime::RuntimeRef;
use crate::state::AppState;
use crate::templates::{IndexPage, LanguagePage};
use askama::Template;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::time::Duration;
use tower_http::services::ServeFile;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Build the router over `state`.
pub fn router(state: AppState) -> Router {
    let style = ServeFile::new(state.app_dir.join("style.css"));
    let script = ServeFile::new(state.app_dir.join("lang.js"));

    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route_service("/style.css", style)
        .route_service("/lang.js", script)
        // Opening a language page provisions the session's sandbox
        .route(
            "/lang/:language/:version",
            get(language_get).post(language_post),
        )
        .route("/lang/:language", get(language_latest))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP server on the given port with the provided state.
pub async fn run_server(port: u16, state: AppState, timeout: Duration) -> std::io::Result<()> {
    let app = router(state).layer(TimeoutLayer::new(timeout));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

async fn health() -> &'static str {
    "OK"
}

async fn index() -> Result<Html<String>> {
    Ok(Html(IndexPage.render()?))
}

fn runtime_from_path(language: &str, version: &str) -> Result<RuntimeRef> {
    RuntimeRef::parse(language, version)
        .ok_or_else(|| Error::BadRequest(format!("invalid runtime {language:?}:{version:?}")))
}

async fn language_get(
    State(state): State<AppState>,
    Path((language, version)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response> {
    let runtime = runtime_from_path(&language, &version)?;
    let (presented, is_new) = state.sessions.load(&headers);

    let mut guard = state.locks.lock(&presented.id).await;
    let mut session = guard.resolve(presented);
    if LifecycleManager::needs_provisioning(&session, is_new, &runtime) {
        state.lifecycle.provision(&mut session, &runtime).await?;
    } else {
        debug!(session = %session.id, sandbox = %session.sandbox, "Reusing bound sandbox");
    }
    guard.record(&session);

    let cookie = state.sessions.save(&session)?;
    let page = LanguagePage {
        language: &language,
        version: &version,
    }
    .render()?;
    Ok(([(header::SET_COOKIE, cookie)], Html(page)).into_response())
}

async fn language_post(
    State(state): State<AppState>,
    Path((language, version)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let (presented, is_new) = state.sessions.load(&headers);
    if is_new {
        warn!("New session in POST, rejecting");
        return Ok((
            StatusCode::FORBIDDEN,
            [(header::SET_COOKIE, state.sessions.expire())],
            "no sandbox is bound to this session; open the language page first",
        )
            .into_response());
    }

    let runtime = runtime_from_path(&language, &version)?;
    let guard = state.locks.lock(&presented.id).await;
    let session = guard.resolve(presented);
    if !session.bound_to(&runtime) {
        return Err(Error::Forbidden(format!(
            "session is not bound to a {runtime} sandbox; reload the language page"
        )));
    }

    let job: SubmittedJob = serde_json::from_slice(&body)
        .map_err(|e| Error::BadRequest(format!("invalid job: {e}")))?;
    job.validate()?;

    let output = state.pipeline.execute(&session.sandbox, &job).await?;

    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        output,
    )
        .into_response())
}

async fn language_latest(Path(language): Path<String>) -> Response {
    (
        StatusCode::FOUND,
        [(header::LOCATION, format!("/lang/{language}/latest"))],
    )
        .into_response()
}
