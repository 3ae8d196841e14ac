//! Entry classification and path mapping for the flat keyspace.
//!
//! The backend stores a flat set of slash-named objects; everything
//! hierarchical about the mount is decided here: which listing entries are
//! directories (real markers vs. synthesized prefixes), which are symlinks,
//! which need a HEAD before they can be exposed, and how segment objects are
//! named so manifest expansion sees them in write order.

use std::sync::LazyLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use regex::Regex;

use crate::store::{
    DIR_CONTENT_TYPE, Entry, Headers, LINK_CONTENT_TYPE, MTIME_HEADER, OBJECT_META_PREFIX,
};

/// Any name ending in a slash.
static FOLDER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new("^.+/$").unwrap());
/// `<container>/<prefix>` shape of a manifest pointer.
pub static SEGMENT_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^([^/]+)/(.*)$").unwrap());

/// An explicit directory marker under `parent_path`.
pub fn is_directory(entry: &Entry, parent_path: &str) -> bool {
    entry.name.starts_with(parent_path)
        && !entry.pseudo_directory
        && entry.content_type == DIR_CONTENT_TYPE
}

/// A common-prefix entry with no backing marker.
pub fn is_pseudo_directory(entry: &Entry, parent_path: &str) -> bool {
    entry.pseudo_directory && entry.name.starts_with(parent_path) && FOLDER_RE.is_match(&entry.name)
}

pub fn is_symlink(entry: &Entry, parent_path: &str) -> bool {
    entry.name.starts_with(parent_path) && entry.content_type == LINK_CONTENT_TYPE
}

/// A candidate large object: listings report manifests as zero-byte plain
/// objects, so anything zero-sized that is not a directory or link needs its
/// headers fetched before it can be classified for sure. The enrichment pass
/// settles it.
pub fn is_large_object(entry: &Entry) -> bool {
    entry.bytes == 0
        && !entry.pseudo_directory
        && !entry.name.ends_with('/')
        && entry.content_type != DIR_CONTENT_TYPE
        && entry.content_type != LINK_CONTENT_TYPE
}

/// Backend path of segment `id` under `prefix`. Zero-padded so lexicographic
/// order equals numeric order; manifest expansion depends on it.
pub fn segment_path(prefix: &str, id: u32) -> String {
    format!("{prefix}/{id:08}")
}

/// Split a manifest pointer into `(container, prefix)`, or `None` when it
/// does not match the required shape.
pub fn split_manifest(manifest: &str) -> Option<(&str, &str)> {
    let caps = SEGMENT_PATH_RE.captures(manifest)?;
    Some((caps.get(1)?.as_str(), caps.get(2)?.as_str()))
}

/// Modification time of an object: the float-seconds meta header when
/// present (written by `Setattr(mtime)`), otherwise the transport time.
pub fn mtime_of(entry: &Entry, headers: &Headers) -> SystemTime {
    if let Some(raw) = headers.get(MTIME_HEADER) {
        if let Ok(secs) = raw.parse::<f64>() {
            if secs >= 0.0 {
                return UNIX_EPOCH + Duration::from_secs_f64(secs);
            }
        }
    }
    entry.last_modified
}

/// Render a time as float seconds since the epoch, the wire form of the
/// mtime override header.
pub fn time_to_float_string(time: SystemTime) -> String {
    let secs = time
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs_f64();
    format!("{secs}")
}

/// The `X-Object-Meta-*` subset of a header map; header-only updates must
/// resend the whole set because the backend replaces it wholesale.
pub fn meta_headers(headers: &Headers) -> Headers {
    headers
        .iter()
        .filter(|(k, _)| k.starts_with(OBJECT_META_PREFIX))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LINK_CONTENT_TYPE, MANIFEST_HEADER};

    fn entry(name: &str, bytes: u64, content_type: &str, pseudo: bool) -> Entry {
        Entry {
            name: name.to_string(),
            bytes,
            content_type: content_type.to_string(),
            last_modified: UNIX_EPOCH,
            pseudo_directory: pseudo,
        }
    }

    #[test]
    fn classifies_markers_and_pseudo_dirs() {
        let marker = entry("photos", 0, DIR_CONTENT_TYPE, false);
        assert!(is_directory(&marker, ""));
        assert!(!is_pseudo_directory(&marker, ""));

        let pseudo = entry("photos/", 0, "", true);
        assert!(is_pseudo_directory(&pseudo, ""));
        assert!(!is_directory(&pseudo, ""));
    }

    #[test]
    fn classifies_links_and_manifest_candidates() {
        let link = entry("ln", 0, LINK_CONTENT_TYPE, false);
        assert!(is_symlink(&link, ""));
        assert!(!is_large_object(&link));

        let manifest = entry("big", 0, "", false);
        assert!(is_large_object(&manifest));

        let plain = entry("f.txt", 12, "text/plain", false);
        assert!(!is_large_object(&plain));
    }

    #[test]
    fn segment_names_sort_numerically() {
        let a = segment_path("big/170", 9);
        let b = segment_path("big/170", 10);
        assert_eq!(a, "big/170/00000009");
        assert!(a < b);
    }

    #[test]
    fn manifest_split_requires_container_part() {
        assert_eq!(split_manifest("segments/big/170"), Some(("segments", "big/170")));
        assert!(split_manifest("noslash").is_none());
    }

    #[test]
    fn mtime_header_overrides_transport_time() {
        let e = entry("f", 1, "", false);
        let mut h = Headers::new();
        h.insert(MTIME_HEADER.to_string(), "1500000000.25".to_string());
        let t = mtime_of(&e, &h);
        assert_eq!(
            t.duration_since(UNIX_EPOCH).unwrap(),
            Duration::from_secs_f64(1500000000.25)
        );

        h.insert(MTIME_HEADER.to_string(), "garbage".to_string());
        assert_eq!(mtime_of(&e, &h), UNIX_EPOCH);
    }

    #[test]
    fn float_string_round_trips() {
        let t = UNIX_EPOCH + Duration::from_secs_f64(1234.5);
        let s = time_to_float_string(t);
        assert_eq!(s.parse::<f64>().unwrap(), 1234.5);
    }

    #[test]
    fn meta_headers_filters_prefix() {
        let mut h = Headers::new();
        h.insert(MANIFEST_HEADER.to_string(), "segments/x".to_string());
        h.insert(MTIME_HEADER.to_string(), "1.0".to_string());
        let meta = meta_headers(&h);
        assert_eq!(meta.len(), 1);
        assert!(meta.contains_key(MTIME_HEADER));
    }
}
