//! File helpers used by background jobs.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::http;

/// Longest key a background job will turn into a filesystem path.
pub const MAX_URI_LEN: usize = 1024;

/// Returns true if `name` may be mapped onto the filesystem.
///
/// Names containing `..` or longer than [`MAX_URI_LEN`] are rejected.
pub fn is_safe_path(name: &[u8]) -> bool {
    name.len() <= MAX_URI_LEN && !name.windows(2).any(|w| w == b"..")
}

/// Joins the relative name `rel` onto `base`.
///
/// Only plain file name components are accepted. `None` is returned for a
/// name that is empty, absolute, carries a drive prefix or a `..`
/// component, or (off unix) is not valid UTF-8. The bytes are never
/// re-encoded, so the file looked up is the file that was named.
pub fn resolve_in(base: &Path, rel: &[u8]) -> Option<PathBuf> {
    let rel = path_from_bytes(rel)?;
    let mut path = base.to_path_buf();
    let mut parts = 0;
    for component in rel.components() {
        match component {
            Component::Normal(part) => {
                path.push(part);
                parts += 1;
            }
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) | Component::ParentDir => return None,
        }
    }
    (parts > 0).then_some(path)
}

#[cfg(unix)]
fn path_from_bytes(bytes: &[u8]) -> Option<&Path> {
    use std::os::unix::ffi::OsStrExt;
    Some(Path::new(std::ffi::OsStr::from_bytes(bytes)))
}

#[cfg(not(unix))]
fn path_from_bytes(bytes: &[u8]) -> Option<&Path> {
    std::str::from_utf8(bytes).ok().map(Path::new)
}

/// Reads `path` and wraps its content in a `200 OK` reply.
///
/// Any I/O failure yields `None`; the caller turns that into the canned
/// not-found reply.
pub fn reply_from_file(path: &Path) -> Option<Bytes> {
    match fs::read(path) {
        Ok(body) => Some(http::ok_reply(&body)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "file not found");
            None
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read file");
            None
        }
    }
}

/// A file found by [`scan_folder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Full path of the file.
    pub path: PathBuf,
    /// Size in bytes.
    pub size: u64,
}

/// Lists regular files under `dir`, descending at most `depth` levels into
/// subdirectories. Hidden directories and symlinks are skipped.
pub fn scan_folder(dir: &Path, depth: usize) -> io::Result<Vec<FileInfo>> {
    let mut files = Vec::new();
    scan_into(dir, depth, &mut files)?;
    Ok(files)
}

fn scan_into(dir: &Path, depth: usize, files: &mut Vec<FileInfo>) -> io::Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let file_type = entry.file_type()?;
        let path = entry.path();
        if file_type.is_file() {
            let size = entry.metadata()?.len();
            files.push(FileInfo { path, size });
        } else if file_type.is_dir() && depth > 0 {
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            if let Err(e) = scan_into(&path, depth - 1, files) {
                warn!(path = %path.display(), error = %e, "cannot scan directory");
            }
        }
    }
    Ok(())
}

/// Percent-encodes everything except unreserved URI characters, so the
/// result is a single safe path component.
pub fn url_encode(input: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = String::with_capacity(input.len());
    for &b in input {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            out.push(char::from(b));
        } else {
            out.push('%');
            out.push(char::from(HEX[usize::from(b >> 4)]));
            out.push(char::from(HEX[usize::from(b & 0xf)]));
        }
    }
    out
}

/// Bernstein-xor hash of `buf` rendered as a three-level directory path,
/// e.g. `a/bc/def01`.
///
/// Only used to bound directory fan-out; collisions are harmless because
/// the full encoded name sits below it.
pub fn param_hash(buf: &[u8]) -> String {
    let hash = buf
        .iter()
        .fold(5381u32, |h, &c| ((h << 5) ^ h) ^ u32::from(c));
    let [b0, b1, b2, b3] = hash.to_le_bytes();
    format!(
        "{:x}/{:x}{:x}/{:x}{:02x}{:02x}",
        b0 >> 4,
        b0 & 0xf,
        b1 >> 4,
        b1 & 0xf,
        b2,
        b3
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_safe_path() {
        assert!(is_safe_path(b"/static/a.png"));
        assert!(is_safe_path(b"/static/a.b.png"));
        assert!(!is_safe_path(b"/static/../etc/passwd"));
        assert!(!is_safe_path(b".."));
        assert!(is_safe_path(&[b'a'; MAX_URI_LEN]));
        assert!(!is_safe_path(&[b'a'; MAX_URI_LEN + 1]));
    }

    #[test]
    fn test_resolve_in_stays_below_base() {
        let base = Path::new("/srv/src");
        assert_eq!(resolve_in(base, b"a.png"), Some(base.join("a.png")));
        assert_eq!(resolve_in(base, b"x/./y.png"), Some(base.join("x/y.png")));
        assert_eq!(resolve_in(base, b"/etc/passwd"), None);
        assert_eq!(resolve_in(base, b"//etc/passwd"), None);
        assert_eq!(resolve_in(base, b"x/../../etc"), None);
        assert_eq!(resolve_in(base, b""), None);
        assert_eq!(resolve_in(base, b"./"), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_in_keeps_raw_bytes() {
        use std::os::unix::ffi::OsStrExt;
        let path = resolve_in(Path::new("/srv"), b"caf\xe9.jpg").unwrap();
        assert_eq!(path.file_name().unwrap().as_bytes(), b"caf\xe9.jpg");
    }

    #[test]
    fn test_url_encode() {
        assert_eq!(url_encode(b"cat.jpg"), "cat.jpg");
        assert_eq!(url_encode(b"a b/c?w=1&h=2"), "a%20b%2Fc%3Fw%3D1%26h%3D2");
    }

    #[test]
    fn test_param_hash_layout() {
        let h = param_hash(b"w=100&h=100");
        let parts: Vec<_> = h.split('/').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 1);
        assert_eq!(parts[1].len(), 2);
        assert_eq!(parts[2].len(), 5);
        assert!(h.chars().all(|c| c == '/' || c.is_ascii_hexdigit()));
        assert_eq!(h, param_hash(b"w=100&h=100"));
        assert_ne!(h, param_hash(b"w=100&h=101"));
    }

    #[test]
    fn test_param_hash_empty_input() {
        // 5381 = 0x0000_1505, little-endian bytes 05 15 00 00.
        assert_eq!(param_hash(b""), "0/51/50000");
    }

    #[test]
    fn test_scan_folder_depth() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::write(root.join("top.jpg"), b"1234").unwrap();
        fs::create_dir_all(root.join("a/b/c/d")).unwrap();
        fs::write(root.join("a/one.jpg"), b"1").unwrap();
        fs::write(root.join("a/b/c/three.jpg"), b"333").unwrap();
        fs::write(root.join("a/b/c/d/four.jpg"), b"4444").unwrap();
        fs::create_dir(root.join(".hidden")).unwrap();
        fs::write(root.join(".hidden/x.jpg"), b"x").unwrap();

        let found = scan_folder(root, 3).unwrap();
        let total: u64 = found.iter().map(|f| f.size).sum();
        assert_eq!(found.len(), 3);
        assert_eq!(total, 8);

        assert_eq!(scan_folder(root, 0).unwrap().len(), 1);
        assert!(scan_folder(&root.join("missing"), 3).is_err());
    }

    #[test]
    fn test_reply_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        fs::write(&path, b"hello").unwrap();
        let reply = reply_from_file(&path).unwrap();
        assert_eq!(
            &reply[..],
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello"
        );
        assert!(reply_from_file(&dir.path().join("nope")).is_none());
    }
}
