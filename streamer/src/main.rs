mod capture;
mod catalog;
mod compositor;
mod landmarks;
mod pipeline;
mod placement;

use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use facefilter_common::config::{CaptureConfig, Config};
use facefilter_common::mjpeg::STREAM_CONTENT_TYPE;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use capture::Capture;
use catalog::{run_refresh_loop, AssetCache, CatalogService};
use pipeline::{FilterSelection, FrameProcessor, StreamContext};

/// Parts buffered between a stream's pipeline and its HTTP body. One part
/// keeps capture at most a frame ahead of a slow viewer.
const STREAM_BUFFER: usize = 1;

const CATALOG_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

struct AppState {
    capture: CaptureConfig,
    ctx: StreamContext,
    shutdown: watch::Receiver<bool>,
}

#[derive(Debug, Deserialize)]
struct FeedQuery {
    filter: Option<i64>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /: viewer page with one link per catalog filter
async fn index(State(state): State<Arc<AppState>>, Query(q): Query<FeedQuery>) -> Html<String> {
    let filters = state.ctx.catalog.fresh_snapshot().await;
    let feed = match q.filter {
        Some(id) => format!("/video_feed?filter={id}"),
        None => "/video_feed".to_string(),
    };

    let mut links = String::new();
    for f in filters.iter() {
        links.push_str(&format!(
            "<li><a href=\"/?filter={}\">{}</a></li>",
            f.id,
            escape_html(&f.name)
        ));
    }

    Html(format!(
        "<!doctype html>\n<html><head><title>Face filter stream</title></head><body>\
         <h1>Face filter stream</h1><img src=\"{feed}\" alt=\"live stream\">\
         <h2>Filters</h2><ul>{links}</ul></body></html>"
    ))
}

/// GET /video_feed?filter=: one MJPEG stream per request
async fn video_feed(State(state): State<Arc<AppState>>, Query(q): Query<FeedQuery>) -> Response {
    let capture = match Capture::open(&state.capture).await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to open capture source");
            return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response();
        }
    };

    // Pick up catalog edits made since the last periodic refresh
    state.ctx.catalog.fresh_snapshot().await;

    let selection = q.filter.map_or(FilterSelection::First, FilterSelection::ById);
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    tokio::spawn(pipeline::run_stream(
        capture,
        state.ctx.clone(),
        selection,
        tx,
        state.shutdown.clone(),
    ));

    let parts = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|part| (Ok::<_, Infallible>(part), rx))
    });
    (
        [
            (header::CONTENT_TYPE, STREAM_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(parts),
    )
        .into_response()
}

/// GET /healthz
async fn healthz() -> impl IntoResponse {
    "ok"
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/video_feed", get(video_feed))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        capture_mode = config.capture.mode,
        capture_url = config.capture.url,
        detector = config.detector.kind,
        catalog_url = config.stream.catalog_url,
        composite_mode = config.stream.composite_mode,
        mirror = config.stream.mirror,
        "starting face filter streamer"
    );

    let detector = match landmarks::from_config(&config.detector) {
        Ok(d) => Arc::from(d),
        Err(e) => {
            error!(error = %e, "invalid detector configuration");
            std::process::exit(1);
        }
    };
    let processor = match FrameProcessor::new(detector, &config.stream, &config.placement) {
        Ok(p) => Arc::new(p),
        Err(e) => {
            error!(error = %e, "invalid stream configuration");
            std::process::exit(1);
        }
    };
    let catalog = match CatalogService::http(&config.stream.catalog_url, CATALOG_TIMEOUT) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!(error = %e, "failed to build catalog client");
            std::process::exit(1);
        }
    };
    catalog.init().await;
    let assets = Arc::new(AssetCache::new(&config.stream.asset_root));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if config.stream.catalog_refresh_secs > 0 {
        tokio::spawn(run_refresh_loop(
            Arc::clone(&catalog),
            Arc::clone(&assets),
            Duration::from_secs(config.stream.catalog_refresh_secs),
            shutdown_rx.clone(),
        ));
    }

    let state = Arc::new(AppState {
        capture: config.capture.clone(),
        ctx: StreamContext {
            processor,
            catalog,
            assets,
        },
        shutdown: shutdown_rx,
    });

    let addr = format!("0.0.0.0:{}", config.stream.port);
    info!(addr, "face filter streamer listening");

    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap_or_else(|e| {
        eprintln!("Failed to bind to {addr}: {e}");
        std::process::exit(1);
    });

    let shutdown = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        info!("shutdown requested, stopping streams");
        let _ = shutdown_tx.send(true);
    };

    if let Err(e) = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(error = %e, "server error");
        std::process::exit(1);
    }
    info!("face filter streamer stopped");
}
