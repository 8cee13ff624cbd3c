use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use facefilter_common::catalog::{CatalogError, FilterCatalog, FilterRecord};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};
use tracing::{debug, info, warn};

/// File name used when an upload's name has nothing usable left after
/// sanitizing.
const FALLBACK_FILE_NAME: &str = "filter";

/// SQLite-backed filter catalog with the image files kept in an upload
/// directory.
///
/// `image_path` is stored as `{uploads_dir}/{millis}_{file_name}`, so a
/// relative upload directory yields paths relative to the admin's working
/// directory.
pub struct FilterStore {
    conn: Mutex<Connection>,
    uploads_dir: PathBuf,
}

impl FilterStore {
    /// Open (or create) the catalog database and the upload directory.
    pub fn open(db_path: &Path, uploads_dir: &Path) -> SqlResult<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|_e| rusqlite::Error::InvalidPath(parent.into()))?;
        }
        std::fs::create_dir_all(uploads_dir)
            .map_err(|_e| rusqlite::Error::InvalidPath(uploads_dir.into()))?;

        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS filters (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                name        TEXT    NOT NULL,
                image_path  TEXT    NOT NULL,
                created_at  INTEGER NOT NULL
            );",
        )?;

        info!(
            path = db_path.display().to_string(),
            uploads = uploads_dir.display().to_string(),
            "filter catalog opened"
        );

        Ok(Self {
            conn: Mutex::new(conn),
            uploads_dir: uploads_dir.to_path_buf(),
        })
    }

    pub fn uploads_dir(&self) -> &Path {
        &self.uploads_dir
    }

    /// Write `bytes` to a new file in the upload directory. Never overwrites
    /// an existing upload.
    fn write_upload(&self, file_name: &str, bytes: &[u8]) -> Result<PathBuf, CatalogError> {
        let stamp = chrono::Utc::now().timestamp_millis();
        let base = sanitize_file_name(file_name);
        let mut attempt = 0u32;
        loop {
            let stored = match attempt {
                0 => format!("{stamp}_{base}"),
                n => format!("{stamp}_{n}_{base}"),
            };
            let path = self.uploads_dir.join(stored);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(bytes)
                        .and_then(|()| file.sync_all())
                        .map_err(|source| CatalogError::WriteImage {
                            path: path.display().to_string(),
                            source,
                        })?;
                    return Ok(path);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && attempt < 100 => {
                    attempt += 1;
                }
                Err(source) => {
                    return Err(CatalogError::WriteImage {
                        path: path.display().to_string(),
                        source,
                    })
                }
            }
        }
    }
}

impl FilterCatalog for FilterStore {
    fn list(&self) -> Result<Vec<FilterRecord>, CatalogError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = conn
            .prepare("SELECT id, name, image_path FROM filters ORDER BY id ASC")
            .map_err(storage)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(FilterRecord {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    image_path: row.get(2)?,
                })
            })
            .map_err(storage)?;
        rows.collect::<SqlResult<Vec<_>>>().map_err(storage)
    }

    fn add(
        &self,
        name: &str,
        file_name: &str,
        image_bytes: &[u8],
    ) -> Result<FilterRecord, CatalogError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CatalogError::EmptyName);
        }
        // Reject anything the streamer could never draw
        image::load_from_memory(image_bytes)
            .map_err(|e| CatalogError::InvalidImage(e.to_string()))?;

        let path = self.write_upload(file_name, image_bytes)?;
        let image_path = path.display().to_string();
        let now = chrono::Utc::now().timestamp_millis();

        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let inserted = conn.execute(
            "INSERT INTO filters (name, image_path, created_at) VALUES (?1, ?2, ?3)",
            params![name, image_path, now],
        );
        if let Err(e) = inserted {
            if let Err(rm) = std::fs::remove_file(&path) {
                warn!(error = %rm, path = image_path, "failed to clean up orphaned upload");
            }
            return Err(storage(e));
        }
        let id = conn.last_insert_rowid();
        info!(id, name, image_path, bytes = image_bytes.len(), "filter added");

        Ok(FilterRecord {
            id,
            name: name.to_string(),
            image_path,
        })
    }

    fn remove(&self, id: i64) -> Result<bool, CatalogError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let image_path: Option<String> = conn
            .query_row(
                "SELECT image_path FROM filters WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage)?;
        let Some(image_path) = image_path else {
            debug!(id, "delete requested for unknown filter");
            return Ok(false);
        };

        conn.execute("DELETE FROM filters WHERE id = ?1", params![id])
            .map_err(storage)?;
        drop(conn);

        match std::fs::remove_file(&image_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, path = image_path, "failed to delete filter image"),
        }
        info!(id, image_path, "filter removed");
        Ok(true)
    }
}

fn storage(e: rusqlite::Error) -> CatalogError {
    CatalogError::Storage(e.to_string())
}

/// Last path component of `file_name`, restricted to `[A-Za-z0-9._-]`.
fn sanitize_file_name(file_name: &str) -> String {
    let last = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();
    let cleaned: String = last
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        FALLBACK_FILE_NAME.to_string()
    } else {
        cleaned.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        RgbaImage::from_pixel(width, height, Rgba([255, 0, 0, 128]))
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    fn open_store(dir: &Path) -> FilterStore {
        FilterStore::open(&dir.join("filters.db"), &dir.join("uploads")).unwrap()
    }

    #[test]
    fn add_list_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        assert!(store.list().unwrap().is_empty());

        let hat = store.add("hat", "hat.png", &png(4, 2)).unwrap();
        let mask = store.add("  mask ", "mask.png", &png(2, 2)).unwrap();
        assert_eq!(mask.name, "mask");
        assert!(Path::new(&hat.image_path).starts_with(dir.path().join("uploads")));
        assert!(hat.image_path.ends_with("_hat.png"));
        assert_eq!(std::fs::read(&hat.image_path).unwrap(), png(4, 2));

        let listed = store.list().unwrap();
        assert_eq!(listed, vec![hat.clone(), mask.clone()]);

        assert!(store.remove(hat.id).unwrap());
        assert!(!Path::new(&hat.image_path).exists());
        assert!(!store.remove(hat.id).unwrap());
        assert_eq!(store.list().unwrap(), vec![mask]);
    }

    #[test]
    fn ids_are_not_reused() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let first = store.add("a", "a.png", &png(1, 1)).unwrap();
        store.remove(first.id).unwrap();
        let second = store.add("b", "b.png", &png(1, 1)).unwrap();
        assert!(second.id > first.id);
    }

    #[test]
    fn catalog_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let added = open_store(dir.path()).add("hat", "hat.png", &png(3, 3)).unwrap();
        assert_eq!(open_store(dir.path()).list().unwrap(), vec![added]);
    }

    #[test]
    fn rejects_empty_name_and_non_images() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        assert!(matches!(
            store.add("   ", "x.png", &png(1, 1)),
            Err(CatalogError::EmptyName)
        ));
        assert!(matches!(
            store.add("text", "notes.png", b"not an image"),
            Err(CatalogError::InvalidImage(_))
        ));
        assert!(store.list().unwrap().is_empty());
        assert_eq!(std::fs::read_dir(store.uploads_dir()).unwrap().count(), 0);
    }

    #[test]
    fn same_file_name_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let a = store.add("a", "same.png", &png(1, 1)).unwrap();
        let b = store.add("b", "same.png", &png(2, 2)).unwrap();
        assert_ne!(a.image_path, b.image_path);
        assert_eq!(std::fs::read(&a.image_path).unwrap(), png(1, 1));
    }

    #[test]
    fn removing_row_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let added = store.add("hat", "hat.png", &png(1, 1)).unwrap();
        std::fs::remove_file(&added.image_path).unwrap();
        assert!(store.remove(added.id).unwrap());
    }

    #[test]
    fn file_names_are_sanitized() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\pics\\my hat.png"), "my_hat.png");
        assert_eq!(sanitize_file_name(".hidden.png"), "hidden.png");
        assert_eq!(sanitize_file_name(""), FALLBACK_FILE_NAME);
        assert_eq!(sanitize_file_name(".."), FALLBACK_FILE_NAME);
    }
}
