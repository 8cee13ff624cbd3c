use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

#[cfg(test)]
use facefilter_common::catalog::FilterCatalog;
use facefilter_common::catalog::{CatalogError, FilterList, FilterRecord};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::compositor::{AssetError, OverlayAsset};

/// Where the catalog snapshot is fetched from.
pub enum CatalogSource {
    /// The admin service's `GET /api/filters`.
    Http { client: reqwest::Client, url: String },
    /// Any in-process catalog implementation.
    #[cfg(test)]
    Local(Arc<dyn FilterCatalog>),
}

/// Process-wide view of the filter catalog.
///
/// Readers get an immutable `Arc` snapshot; a refresh builds a new list and
/// swaps it in whole, so nobody observes a partially updated catalog.
pub struct CatalogService {
    source: CatalogSource,
    snapshot: RwLock<Arc<Vec<FilterRecord>>>,
}

impl CatalogService {
    pub fn http(base_url: &str, timeout: Duration) -> Result<Self, CatalogError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CatalogError::Fetch(e.to_string()))?;
        let url = format!("{}/api/filters", base_url.trim_end_matches('/'));
        Ok(Self::with_source(CatalogSource::Http { client, url }))
    }

    #[cfg(test)]
    pub fn local(catalog: Arc<dyn FilterCatalog>) -> Self {
        Self::with_source(CatalogSource::Local(catalog))
    }

    fn with_source(source: CatalogSource) -> Self {
        Self {
            source,
            snapshot: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Initial fetch at startup. On failure the catalog stays empty and
    /// streams run unfiltered until a later refresh succeeds.
    pub async fn init(&self) {
        match self.refresh().await {
            Ok(filters) => info!(filters = filters.len(), "filter catalog loaded"),
            Err(e) => warn!(error = %e, "initial catalog fetch failed, starting with no filters"),
        }
    }

    /// Fetch the current list and swap it in.
    pub async fn refresh(&self) -> Result<Arc<Vec<FilterRecord>>, CatalogError> {
        let filters = Arc::new(self.fetch().await?);
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&filters);
        debug!(filters = filters.len(), "catalog snapshot replaced");
        Ok(filters)
    }

    /// The most recently fetched list.
    pub fn snapshot(&self) -> Arc<Vec<FilterRecord>> {
        Arc::clone(&self.snapshot.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Refresh, falling back to the last good snapshot if the source is down.
    pub async fn fresh_snapshot(&self) -> Arc<Vec<FilterRecord>> {
        match self.refresh().await {
            Ok(filters) => filters,
            Err(e) => {
                warn!(error = %e, "catalog refresh failed, using previous snapshot");
                self.snapshot()
            }
        }
    }

    async fn fetch(&self) -> Result<Vec<FilterRecord>, CatalogError> {
        match &self.source {
            CatalogSource::Http { client, url } => {
                let resp = client
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| CatalogError::Fetch(e.to_string()))?;
                if !resp.status().is_success() {
                    return Err(CatalogError::Fetch(format!("HTTP status {}", resp.status())));
                }
                let list: FilterList = resp
                    .json()
                    .await
                    .map_err(|e| CatalogError::Fetch(e.to_string()))?;
                Ok(list.filters)
            }
            #[cfg(test)]
            CatalogSource::Local(catalog) => {
                let catalog = Arc::clone(catalog);
                tokio::task::spawn_blocking(move || catalog.list())
                    .await
                    .map_err(|e| CatalogError::Fetch(e.to_string()))?
            }
        }
    }
}

/// Periodically refresh the catalog until shutdown.
pub async fn run_refresh_loop(
    catalog: Arc<CatalogService>,
    assets: Arc<AssetCache>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                debug!("catalog refresh loop stopping");
                return;
            }
        }
        match catalog.refresh().await {
            Ok(filters) => {
                assets.retain(&filters);
                debug!(filters = filters.len(), cached_assets = assets.len(), "catalog refreshed");
            }
            Err(e) => warn!(error = %e, "periodic catalog refresh failed"),
        }
    }
}

enum CachedAsset {
    Ready {
        image_path: String,
        asset: Arc<OverlayAsset>,
    },
    Failed {
        image_path: String,
    },
}

/// Decoded overlays keyed by filter id, shared by every stream.
///
/// A filter whose image fails to decode is remembered as failed so the
/// error is logged once rather than every frame; [`retain`](Self::retain)
/// clears failures so a fixed file is retried after the next refresh.
pub struct AssetCache {
    root: PathBuf,
    entries: Mutex<HashMap<i64, CachedAsset>>,
}

impl AssetCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn resolve(&self, image_path: &str) -> PathBuf {
        let path = Path::new(image_path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// Overlay for `record`, decoding it on the blocking pool on first use.
    /// `None` means the filter is unusable.
    pub async fn get(&self, record: &FilterRecord) -> Option<Arc<OverlayAsset>> {
        {
            let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            match entries.get(&record.id) {
                Some(CachedAsset::Ready { image_path, asset }) if *image_path == record.image_path => {
                    return Some(Arc::clone(asset));
                }
                Some(CachedAsset::Failed { image_path }) if *image_path == record.image_path => {
                    return None;
                }
                _ => {}
            }
        }

        let path = self.resolve(&record.image_path);
        let loaded = tokio::task::spawn_blocking(move || OverlayAsset::load(&path))
            .await
            .unwrap_or_else(|e| Err(AssetError::Read(record.image_path.clone(), e.to_string())));

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match loaded {
            Ok(asset) => {
                let asset = Arc::new(asset);
                info!(
                    id = record.id,
                    name = record.name,
                    width = asset.width(),
                    height = asset.height(),
                    "overlay loaded"
                );
                entries.insert(
                    record.id,
                    CachedAsset::Ready {
                        image_path: record.image_path.clone(),
                        asset: Arc::clone(&asset),
                    },
                );
                Some(asset)
            }
            Err(e) => {
                warn!(error = %e, id = record.id, name = record.name, "overlay unusable, streaming without it");
                entries.insert(
                    record.id,
                    CachedAsset::Failed {
                        image_path: record.image_path.clone(),
                    },
                );
                None
            }
        }
    }

    /// Drop entries for filters no longer in `filters`, and all failures.
    pub fn retain(&self, filters: &[FilterRecord]) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|id, entry| match entry {
            CachedAsset::Ready { image_path, .. } => filters
                .iter()
                .any(|f| f.id == *id && f.image_path == *image_path),
            CachedAsset::Failed { .. } => false,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
