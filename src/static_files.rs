//! Default Static File Handler — a memoised, memory-mapped file server
//! rooted at `<application root>/public`. Treated by the pipeline as a
//! black box: only existence-check-and-serve is implemented, no range
//! requests or conditional GETs.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ahash::AHashMap;
use memmap2::Mmap;
use parking_lot::RwLock;

/// A memory-mapped file ready to be served, plus the metadata needed for
/// the response headers.
pub struct CachedFile {
    pub data: Arc<Mmap>,
    pub content_type: &'static str,
    pub size: usize,
}

impl CachedFile {
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaticFileError {
    NotFound,
    InvalidPath,
    IoError,
}

/// Rooted at `root/public`; only serves GET/HEAD for paths that resolve to
/// an existing regular file under that root.
pub struct StaticFileHandler {
    root: PathBuf,
    cache: RwLock<AHashMap<String, Arc<CachedFile>>>,
    max_cache_entries: usize,
}

impl StaticFileHandler {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            cache: RwLock::new(AHashMap::new()),
            max_cache_entries: 1000,
        }
    }

    /// Serve a request path (leading `/` expected), or `None`/`Err` when it
    /// doesn't map to a file — the caller falls through to the rack branch
    /// on `NotFound`/`InvalidPath` — serving nothing is not a terminal
    /// error, it's a pass to the next handler.
    pub fn serve(&self, request_path: &str) -> Result<Arc<CachedFile>, StaticFileError> {
        let clean = normalize_path(request_path)?;

        if let Some(cached) = self.cache.read().get(&clean) {
            return Ok(cached.clone());
        }

        let cached = self.load(&clean)?;
        if self.cache.read().len() < self.max_cache_entries {
            self.cache.write().insert(clean, cached.clone());
        }
        Ok(cached)
    }

    fn load(&self, clean_path: &str) -> Result<Arc<CachedFile>, StaticFileError> {
        let full_path = self.root.join(clean_path);
        if !full_path.is_file() {
            return Err(StaticFileError::NotFound);
        }

        let file = File::open(&full_path).map_err(|_| StaticFileError::IoError)?;
        let size = file
            .metadata()
            .map_err(|_| StaticFileError::IoError)?
            .len() as usize;

        // `Mmap::map` requires the file stay valid and unmodified for the
        // mapping's lifetime; fine for a local dev proxy serving assets
        // that aren't being rewritten out from under an in-flight request.
        let mmap = unsafe { Mmap::map(&file).map_err(|_| StaticFileError::IoError)? };

        Ok(Arc::new(CachedFile {
            data: Arc::new(mmap),
            content_type: guess_content_type(&full_path),
            size,
        }))
    }

    pub fn clear_cache(&self) {
        self.cache.write().clear();
    }
}

/// Strip the leading slash and reject any path component that could escape
/// `root` — files live rooted at `root/public`.
fn normalize_path(path: &str) -> Result<String, StaticFileError> {
    let path = path.trim_start_matches('/');
    if path.contains("..") || path.contains('\0') {
        return Err(StaticFileError::InvalidPath);
    }
    Ok(path.to_string())
}

fn guess_content_type(path: &Path) -> &'static str {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    match ext.to_lowercase().as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "application/javascript; charset=utf-8",
        "json" => "application/json; charset=utf-8",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "txt" => "text/plain; charset=utf-8",
        "xml" => "application/xml; charset=utf-8",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_path_traversal() {
        assert_eq!(normalize_path("../../etc/passwd"), Err(StaticFileError::InvalidPath));
    }

    #[test]
    fn serves_an_existing_file_and_caches_it() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("favicon.ico"), b"icon-bytes").unwrap();
        let handler = StaticFileHandler::new(dir.path().to_path_buf());

        let first = handler.serve("/favicon.ico").unwrap();
        assert_eq!(first.as_bytes(), b"icon-bytes");
        assert_eq!(first.content_type, "image/x-icon");

        let second = handler.serve("/favicon.ico").unwrap();
        assert!(Arc::ptr_eq(&first, &second), "second lookup should hit the cache");
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let handler = StaticFileHandler::new(dir.path().to_path_buf());
        assert_eq!(handler.serve("/nope.png"), Err(StaticFileError::NotFound));
    }
}
