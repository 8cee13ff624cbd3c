mod store;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::{Json, Router};
use facefilter_common::catalog::{CatalogError, FilterCatalog, FilterList, FilterRecord};
use facefilter_common::config::Config;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use store::FilterStore;

const MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

struct AppState {
    store: Arc<FilterStore>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /: catalog page with upload form
async fn index(State(state): State<Arc<AppState>>) -> Response {
    let store = Arc::clone(&state.store);
    let result = tokio::task::spawn_blocking(move || store.list()).await;

    match result {
        Ok(Ok(filters)) => Html(render_index(&filters)).into_response(),
        Ok(Err(e)) => {
            error!(error = %e, "failed to list filters");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
        Err(e) => {
            error!(error = %e, "spawn_blocking failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// POST /upload: multipart form with `name` and `file`
async fn upload(State(state): State<Arc<AppState>>, mut multipart: Multipart) -> Response {
    let mut name = None;
    let mut file = None;
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "malformed upload");
                return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
            }
        };
        let field_name = field.name().unwrap_or_default().to_string();
        match field_name.as_str() {
            "name" => match field.text().await {
                Ok(text) => name = Some(text),
                Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
            },
            "file" => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                match field.bytes().await {
                    Ok(bytes) => file = Some((file_name, bytes)),
                    Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
                }
            }
            _ => {}
        }
    }

    let (Some(name), Some((file_name, bytes))) = (name, file) else {
        return (StatusCode::BAD_REQUEST, "upload needs a name and a file").into_response();
    };

    let store = Arc::clone(&state.store);
    let result = tokio::task::spawn_blocking(move || store.add(&name, &file_name, &bytes)).await;

    match result {
        Ok(Ok(record)) => {
            info!(id = record.id, name = record.name, "filter uploaded");
            Redirect::to("/").into_response()
        }
        Ok(Err(e)) => catalog_error_response(e),
        Err(e) => {
            error!(error = %e, "spawn_blocking failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// GET /delete/:id: form-friendly delete, always back to the index
async fn delete_and_redirect(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> Response {
    let store = Arc::clone(&state.store);
    let result = tokio::task::spawn_blocking(move || store.remove(id)).await;

    match result {
        Ok(Ok(found)) => {
            if !found {
                info!(id, "delete requested for unknown filter");
            }
            Redirect::to("/").into_response()
        }
        Ok(Err(e)) => catalog_error_response(e),
        Err(e) => {
            error!(error = %e, "spawn_blocking failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// GET /api/filters
async fn api_list(State(state): State<Arc<AppState>>) -> Response {
    let store = Arc::clone(&state.store);
    let result = tokio::task::spawn_blocking(move || store.list()).await;

    match result {
        Ok(Ok(filters)) => Json(FilterList { filters }).into_response(),
        Ok(Err(e)) => catalog_error_response(e),
        Err(e) => {
            error!(error = %e, "spawn_blocking failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// DELETE /api/filters/:id
async fn api_delete(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<i64>) -> Response {
    let store = Arc::clone(&state.store);
    let result = tokio::task::spawn_blocking(move || store.remove(id)).await;

    match result {
        Ok(Ok(true)) => StatusCode::NO_CONTENT.into_response(),
        Ok(Ok(false)) => StatusCode::NOT_FOUND.into_response(),
        Ok(Err(e)) => catalog_error_response(e),
        Err(e) => {
            error!(error = %e, "spawn_blocking failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn catalog_error_response(e: CatalogError) -> Response {
    match e {
        CatalogError::EmptyName | CatalogError::InvalidImage(_) => {
            warn!(error = %e, "rejected filter upload");
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        }
        e => {
            error!(error = %e, "filter catalog operation failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Page
// ---------------------------------------------------------------------------

fn render_index(filters: &[FilterRecord]) -> String {
    let mut rows = String::new();
    for f in filters {
        let file_name = Path::new(&f.image_path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        rows.push_str(&format!(
            "<tr><td>{id}</td><td>{name}</td>\
             <td><img src=\"/uploads/{file}\" alt=\"{name}\" height=\"64\"></td>\
             <td><a href=\"/delete/{id}\">delete</a></td></tr>",
            id = f.id,
            name = escape_html(&f.name),
            file = escape_html(file_name),
        ));
    }
    if filters.is_empty() {
        rows.push_str("<tr><td colspan=\"4\">No filters uploaded yet.</td></tr>");
    }

    format!(
        "<!doctype html>\n<html><head><title>Filter admin</title></head><body>\
         <h1>Filters</h1>\
         <table><tr><th>id</th><th>name</th><th>image</th><th></th></tr>{rows}</table>\
         <h2>Upload</h2>\
         <form action=\"/upload\" method=\"post\" enctype=\"multipart/form-data\">\
         <input type=\"text\" name=\"name\" placeholder=\"name\" required> \
         <input type=\"file\" name=\"file\" accept=\"image/*\" required> \
         <button type=\"submit\">Upload</button></form></body></html>"
    )
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

fn router(state: Arc<AppState>) -> Router {
    let uploads = ServeDir::new(state.store.uploads_dir());
    Router::new()
        .route("/", get(index))
        .route("/upload", axum::routing::post(upload))
        .route("/delete/:id", get(delete_and_redirect))
        .route("/api/filters", get(api_list))
        .route("/api/filters/:id", axum::routing::delete(api_delete))
        .nest_service("/uploads", uploads)
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(CorsLayer::permissive())
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

    let store = match FilterStore::open(
        Path::new(&config.admin.database_path),
        Path::new(&config.admin.uploads_dir),
    ) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "failed to open filter catalog");
            std::process::exit(1);
        }
    };

    let app = router(Arc::new(AppState { store }));

    let addr = format!("0.0.0.0:{}", config.admin.port);
    info!(addr, "filter admin server starting");

    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap_or_else(|e| {
        eprintln!("Failed to bind to {addr}: {e}");
        std::process::exit(1);
    });
    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }
}
