mod api;
mod browser;
mod candidate;
mod collector;
mod config;
mod error;
mod extractor;
mod remux;
mod scheduler;
mod selector;
mod storage;
mod target;

use axum::{routing::post, Router};
use dotenv::dotenv;
use std::sync::Arc;
use tower_http::services::ServeDir;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::browser::SharedBrowser;
use crate::config::AppConfig;
use crate::remux::{FfmpegRemuxer, HttpFetcher, RemuxOrchestrator};
use crate::storage::TempStorage;

#[derive(OpenApi)]
#[openapi(
    paths(api::fetch_video_data, api::download_video),
    components(schemas(
        api::FetchVideoRequest,
        api::FetchVideoResponse,
        api::DownloadRequest,
        api::DownloadResponse,
        api::DownloadData,
        api::DownloadKind,
        api::ErrorBody,
        extractor::VideoData,
        extractor::QualityOption
    )),
    tags((name = "media", description = "Video stream discovery and download API"))
)]
struct ApiDoc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::from_env();
    info!("Browser executable: {}", config.chrome_path.display());

    let storage = TempStorage::new(&config.temp_dir);
    storage.ensure().await?;

    let _janitor = scheduler::start_janitor(storage.clone(), &config.temp_sweep_cron, config.temp_max_age).await?;

    let browser = Arc::new(SharedBrowser::new(&config));
    let remux = RemuxOrchestrator::new(
        storage.clone(),
        Arc::new(HttpFetcher::new()?),
        Arc::new(FfmpegRemuxer::new(config.ffmpeg_path.as_deref())),
    );

    let state = Arc::new(api::AppState {
        config: config.clone(),
        sessions: browser.clone(),
        storage: storage.clone(),
        remux,
    });

    let app = Router::new()
        .merge(SwaggerUi::new("/media-scout-swagger").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/fetch-video-data", post(api::fetch_video_data))
        .route("/download-video", post(api::download_video))
        .nest_service("/temp", ServeDir::new(storage.dir()))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    browser.shutdown();
    info!("Shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
