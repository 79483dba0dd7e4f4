//! Serving files out of the local web root.
//!
//! Grounded in `getLocalContent`/`readLocalContent` in
//! `original_source/lib/exaproxy/reactor/content/manager.py`: resolve the
//! requested path under the configured root, refuse anything that
//! escapes it, stat the file, and cache its header against the file's
//! mtime. spec.md §9 flags the original's cache key (`(cache_time,
//! header)` compared against `st_mtime`, which silently serves a stale
//! header whenever a file is rewritten within the same wall-clock second
//! twice) as a bug not to reproduce; here the cache is keyed directly on
//! the observed `SystemTime` mtime, so any mtime change invalidates it.
//!
//! The key itself is the path alone, matching spec.md §3's definition of
//! `_header` as "mapping absolute file path -> (cached size, precomputed
//! header bytes)" — there is no status code in that mapping. One
//! consequence follows directly from that: requesting the same path under
//! two different status codes within the same mtime returns whichever
//! header was cached first, status line included, until the file's mtime
//! changes. Nothing in this crate observes a path being served under more
//! than one status code, so this is a literal reading of §3 rather than a
//! scenario this cache needs to additionally key around.

use crate::error::{ContentError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

pub struct LocalHeaderCache {
    entries: HashMap<PathBuf, (SystemTime, Vec<u8>)>,
}

impl LocalHeaderCache {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Resolve `requested` under `root`, returning the cached or freshly
    /// built HTTP header (for status `code`) and the canonical file path.
    /// Fails with `ContentError::PathEscape` if the resolved path is not
    /// under `root`, and `FileMissing`/`FileInaccessible` if the file
    /// can't be statted. Per spec.md §4.3.6 and §7 item 4, both cases
    /// degrade to the same 501 outcome at the caller; the distinct error
    /// variants exist only so callers can log the specific cause.
    pub fn get(&mut self, root: &Path, code: u16, requested: &str) -> Result<(Vec<u8>, PathBuf)> {
        let normalized = resolve(root, requested)?;

        let metadata = std::fs::metadata(&normalized).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ContentError::FileMissing(requested.to_string())
            } else {
                ContentError::FileInaccessible(requested.to_string())
            }
        })?;
        let mtime = metadata
            .modified()
            .map_err(|_| ContentError::FileInaccessible(requested.to_string()))?;

        if let Some((cached_mtime, header)) = self.entries.get(&normalized) {
            if *cached_mtime == mtime {
                return Ok((header.clone(), normalized));
            }
        }

        let header = file_header(code, metadata.len());
        self.entries.insert(normalized.clone(), (mtime, header.clone()));
        Ok((header, normalized))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Default for LocalHeaderCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Read `reason` under `root` in full, percent-format it against `data`
/// (Python `%(name)s`-style placeholders), and wrap the result in an HTTP
/// response of `code`. Mirrors `readLocalContent`.
pub fn read_local_content(root: &Path, code: u16, reason: &str, data: &[(&str, &str)]) -> Result<Vec<u8>> {
    let normalized = resolve(root, reason)?;
    let contents = std::fs::read(&normalized).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ContentError::FileMissing(reason.to_string())
        } else {
            ContentError::FileInaccessible(reason.to_string())
        }
    })?;

    let mut text = String::from_utf8_lossy(&contents).into_owned();
    for (key, value) in data {
        text = text.replace(&format!("%({key})s"), value);
    }

    Ok(http(code, text.as_bytes()))
}

/// The 501 response body served when local-file serving fails for any
/// reason (missing, inaccessible, or traversal), per spec.md §4.3.6/§7.
pub fn not_implemented(requested: &str) -> Vec<u8> {
    http(501, format!("cannot serve {requested}").as_bytes())
}

/// A minimal stand-in for the canned-HTML-page renderer that spec.md §1
/// lists as an out-of-scope external collaborator; the `monitor` verb
/// needs some body, and this is the simplest one grounded in `http()`.
pub fn page_html(path: &str) -> Vec<u8> {
    format!("<html><body>monitoring {path}</body></html>").into_bytes()
}

/// Resolve `requested` under `root`, rejecting anything that escapes it.
fn resolve(root: &Path, requested: &str) -> Result<PathBuf> {
    let joined = root.join(requested.trim_start_matches('/'));
    let normalized = normalize(&joined);
    if !normalized.starts_with(root) {
        return Err(ContentError::PathEscape(requested.to_string()));
    }
    Ok(normalized)
}

/// Collapse `.`/`..` components without touching the filesystem, the
/// same normalization `os.path.normpath` performs in the original before
/// the `startswith(prefix)` traversal check.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Build a full HTTP response (header + body) of `code` wrapping `body`.
pub fn http(code: u16, body: &[u8]) -> Vec<u8> {
    let mut out = file_header(code, body.len() as u64);
    out.extend_from_slice(body);
    out
}

/// Build just the HTTP status line and headers for a body of
/// `content_length` bytes, without the body itself.
pub fn file_header(code: u16, content_length: u64) -> Vec<u8> {
    let reason = reason_phrase(code);
    format!(
        "HTTP/1.1 {code} {reason}\r\nContent-Length: {content_length}\r\nConnection: close\r\n\r\n"
    )
    .into_bytes()
}

fn reason_phrase(code: u16) -> &'static str {
    match code {
        200 => "OK",
        302 => "Found",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        501 => "Not Implemented",
        _ => "Error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn serves_file_inside_root() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("index.html");
        std::fs::File::create(&file_path)
            .unwrap()
            .write_all(b"hello")
            .unwrap();

        let mut cache = LocalHeaderCache::new();
        let (header, resolved) = cache.get(dir.path(), 200, "index.html").unwrap();
        assert!(String::from_utf8_lossy(&header).contains("200 OK"));
        assert_eq!(resolved, file_path);
    }

    #[test]
    fn rejects_path_traversal_outside_root() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = LocalHeaderCache::new();
        let err = cache.get(dir.path(), 200, "../../etc/passwd").unwrap_err();
        assert!(matches!(err, ContentError::PathEscape(_)));
    }

    #[test]
    fn missing_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = LocalHeaderCache::new();
        let err = cache.get(dir.path(), 200, "missing.html").unwrap_err();
        assert!(matches!(err, ContentError::FileMissing(_)));
    }

    #[test]
    fn header_cache_invalidates_on_mtime_change() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("a.html");
        std::fs::write(&file_path, b"v1").unwrap();

        let mut cache = LocalHeaderCache::new();
        let (header1, _) = cache.get(dir.path(), 200, "a.html").unwrap();
        assert!(String::from_utf8_lossy(&header1).contains("Content-Length: 2"));
        assert_eq!(cache.len(), 1);

        // Simulate a rewrite with different content and a later mtime.
        let new_mtime = SystemTime::now() + std::time::Duration::from_secs(2);
        std::fs::write(&file_path, b"a longer body").unwrap();
        filetime_touch(&file_path, new_mtime);

        let (header2, _) = cache.get(dir.path(), 200, "a.html").unwrap();
        assert!(String::from_utf8_lossy(&header2).contains("Content-Length: 13"));
    }

    #[test]
    fn cache_key_is_path_only_so_a_second_status_code_reuses_the_first_header() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("a.html");
        std::fs::write(&file_path, b"v1").unwrap();

        let mut cache = LocalHeaderCache::new();
        let (header1, _) = cache.get(dir.path(), 200, "a.html").unwrap();
        assert!(String::from_utf8_lossy(&header1).contains("200 OK"));

        // Same path, same mtime, different status code: the cache has no
        // status-code component in its key, so the first header wins.
        let (header2, _) = cache.get(dir.path(), 404, "a.html").unwrap();
        assert_eq!(header1, header2);
        assert!(String::from_utf8_lossy(&header2).contains("200 OK"));
    }

    #[test]
    fn read_local_content_percent_formats_against_data() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("blocked.html"), b"blocked: %(url)s for %(host)s").unwrap();

        let body = read_local_content(
            dir.path(),
            403,
            "blocked.html",
            &[("url", "http://bad.example/"), ("host", "bad.example")],
        )
        .unwrap();

        let text = String::from_utf8_lossy(&body);
        assert!(text.starts_with("HTTP/1.1 403"));
        assert!(text.contains("blocked: http://bad.example/ for bad.example"));
    }

    #[test]
    fn read_local_content_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_local_content(dir.path(), 200, "../../etc/passwd", &[]).unwrap_err();
        assert!(matches!(err, ContentError::PathEscape(_)));
    }

    fn filetime_touch(path: &Path, when: SystemTime) {
        let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(when).unwrap();
    }
}
