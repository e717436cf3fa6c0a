use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use gallery_core::model::{QuoteId, SubmissionId, TeacherId};
use gallery_core::tokenizer::{word_matches, words};
use gallery_core::{
    Error, Gallery, Quote, QuoteDraft, QuoteOrder, Submission, SubmissionDraft, Teacher, TeacherDraft, User,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

const MAX_PAGE: usize = 100;

#[derive(Deserialize)]
pub struct ListParams {
    #[serde(default = "default_count")]
    pub count: usize,
    #[serde(default)]
    pub offset: usize,
    pub order: Option<String>,
}
fn default_count() -> usize { 20 }

#[derive(Deserialize)]
pub struct SearchParams {
    pub q: String,
}

#[derive(Serialize)]
pub struct SearchHit {
    #[serde(flatten)]
    pub quote: Quote,
    /// Quote text with matched words wrapped in `<em>`.
    pub highlighted: String,
}

#[derive(Serialize)]
pub struct TeacherRemoval {
    pub teacher_id: TeacherId,
    pub removed_quotes: Vec<QuoteId>,
}

#[derive(Serialize)]
pub struct ReloadReport {
    pub quotes: usize,
    pub teachers: usize,
}

#[derive(Clone)]
pub struct AppState {
    pub gallery: Arc<Gallery>,
}

pub fn build_app(gallery: Arc<Gallery>) -> Router {
    // CORS: read CORS_ALLOW_ORIGIN (comma-separated) or allow Any by default
    let cors = match std::env::var("CORS_ALLOW_ORIGIN") {
        Ok(val) => {
            let origins: Vec<_> = val.split(',').filter_map(|s| s.trim().parse().ok()).collect();
            if origins.is_empty() {
                CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
            } else {
                CorsLayer::new().allow_origin(AllowOrigin::list(origins)).allow_methods(Any).allow_headers(Any)
            }
        }
        Err(_) => CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any),
    };

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/quotes", get(list_quotes).post(create_quote))
        .route("/api/quotes/search", get(search_quotes))
        .route("/api/quotes/submit", post(submit_quote))
        .route("/api/quotes/:id", get(get_quote).put(update_quote).delete(delete_quote))
        .route("/api/quotes/:id/vote/:rating", put(vote))
        .route("/api/unverifiedquotes", get(list_submissions))
        .route("/api/unverifiedquotes/:id", put(update_submission).delete(delete_submission))
        .route("/api/unverifiedquotes/:id/assignteacher/:teacher_id", put(assign_submission_teacher))
        .route("/api/unverifiedquotes/:id/confirm", put(confirm_submission))
        .route("/api/teachers", get(list_teachers).post(create_teacher))
        .route("/api/teachers/:id", get(get_teacher).put(update_teacher).delete(delete_teacher))
        .route("/api/admin/regenerate", post(regenerate))
        .route("/api/admin/reload", post(reload))
        .with_state(AppState { gallery })
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::Backend(_) | Error::Desync { .. } | Error::SlotOverflow(_) => {
                error!(error = %err, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.message }));
        if self.status == StatusCode::UNAUTHORIZED {
            return (self.status, [(WWW_AUTHENTICATE, "Basic realm=\"gallery\"")], body).into_response();
        }
        (self.status, body).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Resolves HTTP Basic credentials against the cached users.
fn authorize(state: &AppState, headers: &HeaderMap) -> ApiResult<User> {
    let unauthorized = || ApiError::new(StatusCode::UNAUTHORIZED, "missing or invalid credentials");
    let provided = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()).ok_or_else(unauthorized)?;
    let encoded = provided.strip_prefix("Basic ").ok_or_else(unauthorized)?;
    let decoded = STANDARD.decode(encoded.trim()).map_err(|_| unauthorized())?;
    let decoded = String::from_utf8(decoded).map_err(|_| unauthorized())?;
    let (name, password) = decoded.split_once(':').ok_or_else(unauthorized)?;
    match state.gallery.authenticate(name, password) {
        Some(user) => Ok(user),
        None => {
            warn!(user = name, "rejected credentials");
            Err(unauthorized())
        }
    }
}

fn authorize_admin(state: &AppState, headers: &HeaderMap) -> ApiResult<User> {
    let user = authorize(state, headers)?;
    if !user.admin {
        warn!(user = %user.name, "admin route refused");
        return Err(ApiError::new(StatusCode::FORBIDDEN, "admin rights required"));
    }
    Ok(user)
}

pub async fn list_quotes(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Vec<Quote>>> {
    let user = authorize(&state, &headers)?;
    let count = params.count.min(MAX_PAGE);
    let quotes = match params.order.as_deref() {
        None | Some("") => state.gallery.quotes_page(count, params.offset, Some(user.id))?,
        Some(order) => {
            let order: QuoteOrder = order.parse().map_err(|e: String| ApiError::new(StatusCode::BAD_REQUEST, e))?;
            state.gallery.sorted_quotes(order, count, params.offset, Some(user.id))?
        }
    };
    Ok(Json(quotes))
}

pub async fn search_quotes(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<SearchParams>,
) -> ApiResult<Json<Vec<SearchHit>>> {
    let user = authorize(&state, &headers)?;
    let terms: HashSet<String> = words(&params.q).collect();
    let hits = state
        .gallery
        .search(&params.q, Some(user.id))?
        .into_iter()
        .map(|quote| {
            let highlighted = highlight_terms(&quote.text, &terms);
            SearchHit { quote, highlighted }
        })
        .collect();
    Ok(Json(hits))
}

fn highlight_terms(text: &str, terms: &HashSet<String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut copied = 0;
    for word in word_matches(text) {
        if terms.contains(&word.as_str().to_lowercase()) {
            out.push_str(&text[copied..word.start()]);
            out.push_str("<em>");
            out.push_str(word.as_str());
            out.push_str("</em>");
            copied = word.end();
        }
    }
    out.push_str(&text[copied..]);
    out
}

pub async fn get_quote(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<QuoteId>,
) -> ApiResult<Json<Quote>> {
    let user = authorize(&state, &headers)?;
    Ok(Json(state.gallery.quote(id, Some(user.id))?))
}

pub async fn create_quote(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(draft): Json<QuoteDraft>,
) -> ApiResult<(StatusCode, Json<Quote>)> {
    authorize_admin(&state, &headers)?;
    Ok((StatusCode::CREATED, Json(state.gallery.add_quote(&draft)?)))
}

pub async fn update_quote(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<QuoteId>,
    Json(draft): Json<QuoteDraft>,
) -> ApiResult<Json<Quote>> {
    authorize_admin(&state, &headers)?;
    Ok(Json(state.gallery.edit_quote(id, &draft)?))
}

pub async fn delete_quote(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<QuoteId>,
) -> ApiResult<Json<Quote>> {
    authorize_admin(&state, &headers)?;
    Ok(Json(state.gallery.remove_quote(id)?))
}

pub async fn vote(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((id, rating)): Path<(QuoteId, u8)>,
) -> ApiResult<Json<Quote>> {
    let user = authorize(&state, &headers)?;
    Ok(Json(state.gallery.vote(user.id, id, rating)?))
}

pub async fn submit_quote(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(draft): Json<SubmissionDraft>,
) -> ApiResult<(StatusCode, Json<Submission>)> {
    let user = authorize(&state, &headers)?;
    Ok((StatusCode::CREATED, Json(state.gallery.submit_quote(user.id, &draft)?)))
}

pub async fn list_submissions(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<Vec<Submission>>> {
    authorize_admin(&state, &headers)?;
    Ok(Json(state.gallery.submissions()?))
}

pub async fn update_submission(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<SubmissionId>,
    Json(draft): Json<SubmissionDraft>,
) -> ApiResult<Json<Submission>> {
    authorize_admin(&state, &headers)?;
    Ok(Json(state.gallery.edit_submission(id, &draft)?))
}

pub async fn delete_submission(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<SubmissionId>,
) -> ApiResult<Json<Submission>> {
    authorize_admin(&state, &headers)?;
    Ok(Json(state.gallery.remove_submission(id)?))
}

pub async fn assign_submission_teacher(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((id, teacher_id)): Path<(SubmissionId, TeacherId)>,
) -> ApiResult<Json<Submission>> {
    authorize_admin(&state, &headers)?;
    Ok(Json(state.gallery.assign_submission_teacher(id, teacher_id)?))
}

pub async fn confirm_submission(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<SubmissionId>,
) -> ApiResult<(StatusCode, Json<Quote>)> {
    authorize_admin(&state, &headers)?;
    Ok((StatusCode::CREATED, Json(state.gallery.confirm_submission(id)?)))
}

pub async fn list_teachers(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<Vec<Teacher>>> {
    authorize(&state, &headers)?;
    Ok(Json(state.gallery.teachers()))
}

pub async fn get_teacher(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<TeacherId>,
) -> ApiResult<Json<Teacher>> {
    authorize(&state, &headers)?;
    Ok(Json(state.gallery.teacher(id)?))
}

pub async fn create_teacher(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(draft): Json<TeacherDraft>,
) -> ApiResult<(StatusCode, Json<Teacher>)> {
    authorize_admin(&state, &headers)?;
    Ok((StatusCode::CREATED, Json(state.gallery.add_teacher(&draft)?)))
}

pub async fn update_teacher(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<TeacherId>,
    Json(draft): Json<TeacherDraft>,
) -> ApiResult<Json<Teacher>> {
    authorize_admin(&state, &headers)?;
    Ok(Json(state.gallery.edit_teacher(id, &draft)?))
}

pub async fn delete_teacher(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<TeacherId>,
) -> ApiResult<Json<TeacherRemoval>> {
    authorize_admin(&state, &headers)?;
    let removed_quotes = state.gallery.remove_teacher(id)?;
    Ok(Json(TeacherRemoval { teacher_id: id, removed_quotes }))
}

async fn regenerate(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<StatusCode> {
    authorize_admin(&state, &headers)?;
    state.gallery.force_regenerate();
    Ok(StatusCode::NO_CONTENT)
}

async fn reload(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<ReloadReport>> {
    authorize_admin(&state, &headers)?;
    state.gallery.reload()?;
    Ok(Json(ReloadReport {
        quotes: state.gallery.cache().quote_count(),
        teachers: state.gallery.teachers().len(),
    }))
}
