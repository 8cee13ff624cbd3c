use serde::{Deserialize, Serialize};

/// One uploaded overlay image known to the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRecord {
    pub id: i64,
    pub name: String,
    /// Where the overlay image is stored, relative to the admin's working
    /// directory unless absolute.
    pub image_path: String,
}

/// Body of `GET /api/filters`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterList {
    pub filters: Vec<FilterRecord>,
}

/// Ordered store of overlay filters.
///
/// `list` order is insertion order; the streamer treats the first entry as
/// the default active filter.
pub trait FilterCatalog: Send + Sync {
    fn list(&self) -> Result<Vec<FilterRecord>, CatalogError>;

    /// Persist `image_bytes` under a name derived from `file_name` and record it.
    fn add(
        &self,
        name: &str,
        file_name: &str,
        image_bytes: &[u8],
    ) -> Result<FilterRecord, CatalogError>;

    /// Returns `false` if no filter with `id` exists.
    fn remove(&self, id: i64) -> Result<bool, CatalogError>;
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog storage error: {0}")]
    Storage(String),
    #[error("failed to write filter image {path}: {source}")]
    WriteImage {
        path: String,
        source: std::io::Error,
    },
    #[error("filter image is not a decodable image: {0}")]
    InvalidImage(String),
    #[error("filter name must not be empty")]
    EmptyName,
    #[error("catalog request failed: {0}")]
    Fetch(String),
}
