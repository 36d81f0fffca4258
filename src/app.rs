use axum::{
    Json, Router,
    extract::{Query, Request, State},
    http::{HeaderName, StatusCode, header},
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

use crate::cache::{RefreshCache, TabDescriptor, TabSource};
use crate::config::Settings;
use crate::downloader;
use crate::error::{CacheError, ConfigError, UpstreamError};
use crate::projector::{SosRecord, project_rows};
use crate::upstream::sheets::RowMatrix;
use crate::upstream::{PublishedSource, SheetsSource};

const X_CACHE: HeaderName = HeaderName::from_static("x-cache");
const X_CACHE_AGE: HeaderName = HeaderName::from_static("x-cache-age");

/// Caches behind the HTTP surface. A slot holds the configuration error
/// instead of a cache when its settings are missing.
pub struct AppState<H: TabSource, R: TabSource> {
    pub sheet: Result<RefreshCache<H>, ConfigError>,
    pub sos: Result<RefreshCache<R>, ConfigError>,
}

/// State wired to the real Google sources.
pub type LiveState = AppState<PublishedSource, SheetsSource>;

impl<H: TabSource, R: TabSource> AppState<H, R> {
    pub fn new(
        sheet: Result<RefreshCache<H>, ConfigError>,
        sos: Result<RefreshCache<R>, ConfigError>,
    ) -> Self {
        AppState { sheet, sos }
    }
}

impl LiveState {
    pub fn from_settings(settings: &Settings) -> Result<Self, UpstreamError> {
        let sheet = match settings.published_spreadsheet_id() {
            Ok(id) => {
                log::info!("published view reads document {}", id);
                Ok(RefreshCache::new(PublishedSource::new(id)?, settings.cache.clone()))
            }
            Err(e) => {
                log::warn!("published view disabled: {}", e);
                Err(e)
            }
        };

        let sos_source = settings
            .spreadsheet_id()
            .and_then(|id| Ok((id, settings.service_account()?)));
        let sos = match sos_source {
            Ok((id, account)) => {
                log::info!("help list reads spreadsheet {} as {}", id, account.client_email);
                Ok(RefreshCache::new(SheetsSource::new(id, account)?, settings.cache.clone()))
            }
            Err(e) => {
                log::warn!("help list disabled: {}", e);
                Err(e)
            }
        };

        Ok(AppState::new(sheet, sos))
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("{0}")]
    BadRequest(String),

    #[error("export failed: {0}")]
    Export(String),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Cache(CacheError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Config(_) | ApiError::Cache(_) | ApiError::Export(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            log::error!("request failed: {}", self);
        }
        let body = Json(ErrorResponse {
            error: self.to_string(),
        });
        (status, body).into_response()
    }
}

#[derive(Deserialize)]
struct SheetQuery {
    gid: Option<String>,
}

#[derive(Deserialize)]
struct SosQuery {
    id: Option<String>,
}

#[derive(Deserialize)]
struct ExportQuery {
    id: String,
    format: Option<String>,
}

#[derive(Serialize)]
struct TabsResponse<Id> {
    tabs: Vec<TabDescriptor<Id>>,
    age: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SosResponse {
    name: String,
    id: i64,
    records: Vec<SosRecord>,
    total: usize,
    cache_age: u64,
    fetched_at: String,
}

#[derive(Serialize)]
struct CacheHealth {
    configured: bool,
    populated: bool,
    age: Option<u64>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    sheet: CacheHealth,
    sos: CacheHealth,
}

fn cache_of<S: TabSource>(
    slot: &Result<RefreshCache<S>, ConfigError>,
) -> Result<&RefreshCache<S>, ApiError> {
    slot.as_ref().map_err(|e| ApiError::Config(e.clone()))
}

/// A sheet id that is not a number names no tab, so it reads as not found.
fn parse_sheet_id(raw: &str) -> Result<i64, ApiError> {
    raw.trim()
        .parse()
        .map_err(|_| ApiError::Cache(CacheError::NotFound(raw.to_string())))
}

pub fn router<H, R>(state: Arc<AppState<H, R>>) -> Router
where
    H: TabSource<Id = String, Payload = String>,
    R: TabSource<Id = i64, Payload = RowMatrix>,
{
    Router::new()
        .route("/", get(serve_index))
        .route("/api/sheet", get(get_sheet::<H, R>))
        .route("/api/sos", get(get_sos::<H, R>))
        .route("/api/sos/export", get(export_sos::<H, R>))
        .route("/api/health", get(health::<H, R>))
        .layer(middleware::from_fn(log_request))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    // Setup app state
    let app_state = Arc::new(LiveState::from_settings(&settings)?);

    // Build router
    let app = router(app_state);

    // Start server
    let listener = TcpListener::bind(&settings.bind_addr).await?;
    log::info!("Listening on http://{}", settings.bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let started = Instant::now();

    let response = next.run(request).await;

    log::info!(
        "{} {} -> {} ({} ms)",
        method,
        uri,
        response.status().as_u16(),
        started.elapsed().as_millis()
    );
    response
}

async fn serve_index() -> Html<&'static str> {
    Html(include_str!("./static/index.html"))
}

/// `GET /api/sheet[?gid=]`: tab list, or one tab's published HTML.
async fn get_sheet<H, R>(
    Query(params): Query<SheetQuery>,
    State(state): State<Arc<AppState<H, R>>>,
) -> Result<Response, ApiError>
where
    H: TabSource<Id = String, Payload = String>,
    R: TabSource,
{
    let cache = cache_of(&state.sheet)?;

    let Some(gid) = params.gid else {
        let listing = cache.list().await?;
        return Ok(Json(TabsResponse {
            tabs: listing.tabs,
            age: listing.age.as_secs(),
        })
        .into_response());
    };

    let content = cache.get(&gid).await?;
    let headers = [
        (header::CONTENT_TYPE, "text/html; charset=utf-8".to_string()),
        (header::CACHE_CONTROL, "no-store".to_string()),
        (X_CACHE, if content.hit { "HIT" } else { "MISS" }.to_string()),
        (X_CACHE_AGE, content.age.as_secs().to_string()),
    ];
    Ok((headers, content.payload).into_response())
}

/// `GET /api/sos[?id=]`: tab list, or one tab projected into the help list.
async fn get_sos<H, R>(
    Query(params): Query<SosQuery>,
    State(state): State<Arc<AppState<H, R>>>,
) -> Result<Response, ApiError>
where
    H: TabSource,
    R: TabSource<Id = i64, Payload = RowMatrix>,
{
    let cache = cache_of(&state.sos)?;

    let Some(raw_id) = params.id else {
        let listing = cache.list().await?;
        return Ok(Json(TabsResponse {
            tabs: listing.tabs,
            age: listing.age.as_secs(),
        })
        .into_response());
    };

    let id = parse_sheet_id(&raw_id)?;
    let content = cache.get(&id).await?;
    let records = project_rows(&content.payload);

    Ok(Json(SosResponse {
        name: content.tab.name,
        id: content.tab.id,
        total: records.len(),
        records,
        cache_age: content.age.as_secs(),
        fetched_at: content.fetched_at.to_rfc3339(),
    })
    .into_response())
}

/// `GET /api/sos/export?id=&format=csv|xlsx`: the help list as a download.
async fn export_sos<H, R>(
    Query(params): Query<ExportQuery>,
    State(state): State<Arc<AppState<H, R>>>,
) -> Result<Response, ApiError>
where
    H: TabSource,
    R: TabSource<Id = i64, Payload = RowMatrix>,
{
    let cache = cache_of(&state.sos)?;
    let format = params.format.as_deref().unwrap_or("csv");
    if format != "csv" && format != "xlsx" {
        return Err(ApiError::BadRequest(format!(
            "unsupported export format {:?}",
            format
        )));
    }

    let id = parse_sheet_id(&params.id)?;
    let content = cache.get(&id).await?;
    let records = project_rows(&content.payload);

    let disposition = format!("attachment; filename=\"sos-{}.{}\"", id, format);
    let response = if format == "xlsx" {
        let bytes = downloader::to_xlsx(&records).map_err(|e| ApiError::Export(e.to_string()))?;
        (
            [
                (
                    header::CONTENT_TYPE,
                    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet".to_string(),
                ),
                (header::CONTENT_DISPOSITION, disposition),
            ],
            bytes,
        )
            .into_response()
    } else {
        let csv = downloader::to_csv(&records).map_err(|e| ApiError::Export(e.to_string()))?;
        (
            [
                (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
                (header::CONTENT_DISPOSITION, disposition),
            ],
            csv,
        )
            .into_response()
    };
    Ok(response)
}

fn cache_health<S: TabSource>(slot: &Result<RefreshCache<S>, ConfigError>) -> CacheHealth {
    let age = slot.as_ref().ok().and_then(|cache| cache.cached_age());
    CacheHealth {
        configured: slot.is_ok(),
        populated: age.is_some(),
        age: age.map(|a| a.as_secs()),
    }
}

/// `GET /api/health`: cache status, never triggers a refresh.
async fn health<H: TabSource, R: TabSource>(
    State(state): State<Arc<AppState<H, R>>>,
) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        sheet: cache_health(&state.sheet),
        sos: cache_health(&state.sos),
    })
}
