use crate::config::ConfigContext;
use crate::error::DubError;
use crate::service::VideoService;
use crate::store::{BlobStore, StoredBlob};
use crate::{Progress, Status, VideoRecord};
use anyhow::Error;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::*;
use uuid::Uuid;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Dub(#[from] DubError),

    #[error("{0}")]
    BadRequest(String),

    #[error("Video not found: {0}")]
    UnknownId(String),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Dub(DubError::NotFound(_)) | ApiError::UnknownId(_) => StatusCode::NOT_FOUND,
            ApiError::Dub(DubError::PayloadTooLarge { .. }) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Dub(
                DubError::InvalidFormat(_)
                | DubError::InvalidState { .. }
                | DubError::AlreadyInProgress(_),
            )
            | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Dub(DubError::Io(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(message = "Request failed", error = ?self);
        }

        let body = ErrorResponse {
            success: false,
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub success: bool,
    pub video: UploadedVideo,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadedVideo {
    pub id: Uuid,
    pub title: String,
    pub status: Status,
}

impl From<&VideoRecord> for UploadedVideo {
    fn from(video: &VideoRecord) -> Self {
        UploadedVideo {
            id: video.id,
            title: video.title.clone(),
            status: video.status,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DubResponse {
    pub success: bool,
    pub video_id: Uuid,
    /// Seconds until the dub is expected to be available.
    pub estimated_time: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub success: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Clone)]
pub struct AppState {
    pub service: VideoService,
}

pub fn router(service: VideoService) -> Router {
    let uploads = ServeDir::new(service.store().root());

    Router::new()
        .route(
            "/api/upload",
            post(upload).layer(DefaultBodyLimit::disable()),
        )
        .route("/api/videos", get(list_videos))
        .route("/api/video/{id}", get(get_video).delete(delete_video))
        .route("/api/dub/{id}", post(start_dub))
        .route("/api/progress/{id}", get(get_progress))
        .route("/health", get(health_check))
        .nest_service(crate::store::PUBLIC_PREFIX, uploads)
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { service })
}

pub async fn serve(cancel_token: CancellationToken, config: ConfigContext) -> Result<(), Error> {
    let store = BlobStore::open(&config.upload_dir, config.max_upload_bytes).await?;
    let service = VideoService::new(store, config.tick(), &cancel_token);

    let listener = TcpListener::bind(config.bind).await?;
    let address = listener.local_addr()?;
    info!(
        message = "Listening",
        address = %address,
        upload_dir = ?service.store().root(),
        max_upload_bytes = service.store().max_bytes()
    );

    let shutdown = cancel_token.clone();
    axum::serve(listener, router(service.clone()))
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            debug!("Server Cancelled");
        })
        .await?;

    service.shutdown().await;
    info!("Server stopped.");

    Ok(())
}

fn parse_id(raw: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| ApiError::UnknownId(raw.to_string()))
}

fn bad_multipart(err: axum::extract::multipart::MultipartError) -> ApiError {
    ApiError::BadRequest(format!("Failed to parse multipart data: {}", err.body_text()))
}

#[derive(Default)]
struct ReceivedUpload {
    title: Option<String>,
    blob: Option<StoredBlob>,
}

async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Json<UploadResponse>> {
    let mut received = ReceivedUpload::default();
    if let Err(err) = receive_fields(&state.service, &mut multipart, &mut received).await {
        if let Some(blob) = received.blob.take() {
            state.service.discard_blob(&blob).await;
        }
        return Err(err);
    }

    let blob = received
        .blob
        .ok_or_else(|| ApiError::BadRequest("No video file uploaded".into()))?;
    let video = state.service.register(blob, received.title);

    Ok(Json(UploadResponse {
        success: true,
        video: UploadedVideo::from(&video),
    }))
}

async fn receive_fields(
    service: &VideoService,
    multipart: &mut Multipart,
    received: &mut ReceivedUpload,
) -> ApiResult<()> {
    while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("video") => {
                if received.blob.is_some() {
                    return Err(ApiError::BadRequest("Only one video file per upload".into()));
                }
                let Some(filename) = field
                    .file_name()
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                else {
                    continue;
                };
                let mime_type = field.content_type().map(str::to_string);
                let declared_size = field
                    .headers()
                    .get(header::CONTENT_LENGTH)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.parse::<u64>().ok());

                debug!(message = "Receiving upload", filename = %filename, mime_type = ?mime_type);
                let blob = service
                    .store_blob(field, &filename, declared_size, mime_type.as_deref())
                    .await?;
                received.blob = Some(blob);
            }
            Some("title") => {
                received.title = Some(field.text().await.map_err(bad_multipart)?);
            }
            other => {
                trace!(message = "Ignoring multipart field", field = ?other);
            }
        }
    }
    Ok(())
}

async fn list_videos(State(state): State<AppState>) -> Json<Vec<VideoRecord>> {
    Json(state.service.list())
}

async fn get_video(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<VideoRecord>> {
    let id = parse_id(&id)?;
    Ok(Json(state.service.get(id)?))
}

async fn start_dub(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<DubResponse>> {
    let id = parse_id(&id)?;
    let ticket = state.service.dub(id)?;

    Ok(Json(DubResponse {
        success: true,
        video_id: ticket.video_id,
        estimated_time: ticket.estimated.as_secs_f64().ceil() as u64,
    }))
}

async fn get_progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Progress>> {
    let id = parse_id(&id)?;
    Ok(Json(state.service.progress(id)?))
}

async fn delete_video(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<DeleteResponse>> {
    let id = parse_id(&id)?;
    state.service.delete(id).await?;
    Ok(Json(DeleteResponse { success: true }))
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        version: env!("CARGO_PKG_VERSION").into(),
    })
}
