//! On-the-fly image resizing with an on-disk variant cache.
//!
//! A zoom key looks like `/zoom/<file>?w=<n>&h=<n>&c=<0|1>&q=<n>`. The
//! source image `<file>` is read from the source directory, cropped and
//! scaled, encoded as JPEG and written under the zoom directory so later
//! requests (after the in-memory object is gone) are served from disk.
//!
//! ```text
//!   <tmp>/zoom/<param hash>/<url-encoded file and query>
//! ```
//!
//! Written variants are tracked in a FIFO against a disk quota. When the
//! quota is exceeded the oldest variants are handed back to the caller as
//! removal victims.

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::ZoomConfig;
use crate::error::Result;
use crate::ufile::{self, FileInfo};

/// Quality used when the request does not carry a usable `q`.
pub const DEFAULT_QUALITY: u8 = 100;

/// Subdirectory of the tmp dir holding generated variants.
pub const ZOOM_DIR: &str = "zoom";

/// How deep the startup scan descends into the zoom directory.
const SCAN_DEPTH: usize = 3;

/// A parsed zoom request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoomRequest {
    /// Source file name, relative to the source directory.
    pub file: String,
    /// Requested width; 0 means "keep".
    pub width: u32,
    /// Requested height; 0 means "keep".
    pub height: u32,
    /// Crop to the requested aspect ratio before scaling.
    pub crop: bool,
    /// JPEG quality in `1..=100`.
    pub quality: u8,
    /// The raw query string, hashed into the variant path.
    pub params: String,
}

/// Why a zoom key was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ZoomParseError {
    /// The query contained a character outside `whcq0-9&=`.
    #[error("unexpected character {0:?} in zoom parameters")]
    UnexpectedChar(char),
    /// Width or height above the configured maximum.
    #[error("requested size {width}x{height} exceeds the limit")]
    TooLarge {
        /// Requested width.
        width: u32,
        /// Requested height.
        height: u32,
    },
    /// No file name before the query.
    #[error("missing file name")]
    MissingFile,
    /// The key is not valid UTF-8.
    #[error("zoom key is not valid UTF-8")]
    InvalidUtf8,
}

#[derive(Clone, Copy)]
enum Param {
    None,
    Width,
    Height,
    Crop,
    Quality,
}

impl ZoomRequest {
    /// Parses the part of a zoom key that follows `/zoom/`.
    pub fn parse(
        uri: &[u8],
        max_width: u32,
        max_height: u32,
    ) -> std::result::Result<ZoomRequest, ZoomParseError> {
        let uri = std::str::from_utf8(uri).map_err(|_| ZoomParseError::InvalidUtf8)?;
        let (file, query) = match uri.split_once('?') {
            Some((file, query)) => (file, Some(query)),
            None => (uri, None),
        };
        if file.is_empty() {
            return Err(ZoomParseError::MissingFile);
        }

        let mut request = ZoomRequest {
            file: file.to_string(),
            width: 0,
            height: 0,
            crop: true,
            quality: DEFAULT_QUALITY,
            params: query.unwrap_or_default().to_string(),
        };
        let Some(query) = query else {
            return Ok(request);
        };

        let mut param = Param::None;
        let mut quality = 0u32;
        for c in query.chars() {
            match c {
                'w' => param = Param::Width,
                'h' => param = Param::Height,
                'c' => param = Param::Crop,
                'q' => param = Param::Quality,
                '&' | '=' => {}
                '0'..='9' => {
                    let digit = c as u32 - '0' as u32;
                    let push = |v: u32| v.saturating_mul(10).saturating_add(digit);
                    match param {
                        Param::Width => request.width = push(request.width),
                        Param::Height => request.height = push(request.height),
                        Param::Crop => request.crop = digit != 0,
                        Param::Quality => quality = push(quality),
                        Param::None => {}
                    }
                }
                other => return Err(ZoomParseError::UnexpectedChar(other)),
            }
        }

        if request.width > max_width || request.height > max_height {
            return Err(ZoomParseError::TooLarge {
                width: request.width,
                height: request.height,
            });
        }
        if (1..100).contains(&quality) {
            request.quality = u8::try_from(quality).unwrap_or(DEFAULT_QUALITY);
        }
        Ok(request)
    }
}

/// Turns a source image into encoded bytes for a [`ZoomRequest`].
pub trait ImageResizer: Send + Sync {
    /// Loads `source` and produces the encoded variant.
    fn resize(&self, source: &Path, request: &ZoomRequest) -> Result<Vec<u8>>;
}

/// [`ImageResizer`] backed by the `image` crate. Output is always JPEG.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultResizer;

/// Target size and source crop rectangle for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Output width.
    pub width: u32,
    /// Output height.
    pub height: u32,
    /// Crop origin and size inside the source: `(x, y, w, h)`.
    pub roi: (u32, u32, u32, u32),
}

/// Computes the output geometry, or `None` if the source should be
/// re-encoded as it is.
///
/// With both dimensions set, the crop region keeps the requested aspect
/// ratio and is centered in the source. With one dimension set, the other
/// one is taken from the source.
pub fn geometry(src_w: u32, src_h: u32, request: &ZoomRequest) -> Option<Geometry> {
    let (mut width, mut height) = (request.width, request.height);
    let (mut roi_w, mut roi_h) = (src_w, src_h);

    match (width, height) {
        (0, 0) => return None,
        (0, _) => width = src_w,
        (_, 0) => height = src_h,
        (w, h) => {
            let scaled_w = u64::from(src_h) * u64::from(w) / u64::from(h);
            let scaled_h = u64::from(src_w) * u64::from(h) / u64::from(w);
            roi_w = u32::try_from(scaled_w).unwrap_or(u32::MAX).min(src_w);
            roi_h = u32::try_from(scaled_h).unwrap_or(u32::MAX).min(src_h);
        }
    }

    let roi = if request.crop {
        ((src_w - roi_w) / 2, (src_h - roi_h) / 2, roi_w, roi_h)
    } else {
        (0, 0, src_w, src_h)
    };
    Some(Geometry { width, height, roi })
}

impl ImageResizer for DefaultResizer {
    fn resize(&self, source: &Path, request: &ZoomRequest) -> Result<Vec<u8>> {
        let src = image::open(source)?;
        let out = match geometry(src.width(), src.height(), request) {
            Some(g) if g.width > 0 && g.height > 0 && g.roi.2 > 0 && g.roi.3 > 0 => {
                let (x, y, w, h) = g.roi;
                src.crop_imm(x, y, w, h)
                    .resize_exact(g.width, g.height, FilterType::CatmullRom)
            }
            Some(g) => {
                return Err(crate::Error::Zoom(format!(
                    "degenerate zoom geometry {g:?} for {}",
                    source.display()
                )))
            }
            None => src,
        };

        let mut buf = Vec::new();
        {
            let mut encoder = JpegEncoder::new_with_quality(&mut buf, request.quality);
            encoder.encode_image(&out.to_rgb8())?;
        }
        Ok(buf)
    }
}

/// FIFO of generated variants charged against a byte limit.
#[derive(Debug)]
pub struct DiskQuota {
    files: VecDeque<FileInfo>,
    used: u64,
    limit: u64,
}

impl DiskQuota {
    /// Creates an empty quota.
    pub fn new(limit: u64) -> Self {
        DiskQuota {
            files: VecDeque::new(),
            used: 0,
            limit,
        }
    }

    /// Records a written file and returns the files to delete, oldest
    /// first, so that usage is back under the limit (or nothing is left).
    ///
    /// A file that is already tracked keeps its place and is charged at
    /// its new size. Victims are no longer charged once returned, whether
    /// or not their removal later succeeds.
    pub fn track(&mut self, path: PathBuf, size: u64) -> Vec<PathBuf> {
        if let Some(known) = self.files.iter_mut().find(|f| f.path == path) {
            self.used = self.used - known.size + size;
            known.size = size;
        } else {
            self.files.push_back(FileInfo { path, size });
            self.used += size;
        }

        let mut victims = Vec::new();
        while self.used > self.limit {
            let Some(victim) = self.files.pop_front() else {
                break;
            };
            self.used -= victim.size;
            victims.push(victim.path);
        }
        victims
    }

    /// Returns true if `path` is charged.
    pub fn contains(&self, path: &Path) -> bool {
        self.files.iter().any(|f| f.path == path)
    }

    /// Bytes currently charged.
    pub fn used(&self) -> u64 {
        self.used
    }

    /// The configured limit.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Number of tracked files.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Returns true when nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// The zoom service shared by all background threads.
pub struct ZoomService {
    zoom_dir: PathBuf,
    source_dir: PathBuf,
    max_width: u32,
    max_height: u32,
    resizer: Box<dyn ImageResizer>,
    quota: Mutex<DiskQuota>,
}

impl ZoomService {
    /// Creates the zoom directory if needed and charges every file already
    /// in it against the quota, in discovery order.
    pub fn new(
        config: &ZoomConfig,
        source_dir: impl Into<PathBuf>,
        tmp_dir: &Path,
        resizer: Box<dyn ImageResizer>,
    ) -> Result<Self> {
        let zoom_dir = tmp_dir.join(ZOOM_DIR);
        fs::create_dir_all(&zoom_dir)?;

        let mut quota = DiskQuota::new(config.disk_limit);
        for file in ufile::scan_folder(&zoom_dir, SCAN_DEPTH)? {
            if let Ok(rel) = file.path.strip_prefix(&zoom_dir) {
                quota.files.push_back(FileInfo {
                    path: rel.to_path_buf(),
                    size: file.size,
                });
                quota.used += file.size;
            }
        }
        info!(
            dir = %zoom_dir.display(),
            files = quota.len(),
            used = quota.used(),
            limit = quota.limit(),
            "zoom cache scanned"
        );

        Ok(ZoomService {
            zoom_dir,
            source_dir: source_dir.into(),
            max_width: config.max_width,
            max_height: config.max_height,
            resizer,
            quota: Mutex::new(quota),
        })
    }

    /// Directory holding generated variants.
    pub fn zoom_dir(&self) -> &Path {
        &self.zoom_dir
    }

    /// Parses the part of a key after `/zoom/`, logging rejects.
    pub fn parse(&self, uri: &[u8]) -> Option<ZoomRequest> {
        match ZoomRequest::parse(uri, self.max_width, self.max_height) {
            Ok(request) => Some(request),
            Err(e) => {
                debug!(uri = %String::from_utf8_lossy(uri), error = %e, "bad zoom request");
                None
            }
        }
    }

    /// Path of a variant, relative to the zoom directory.
    pub fn variant_path(&self, request: &ZoomRequest) -> PathBuf {
        let mut name = request.file.clone();
        if !request.params.is_empty() {
            name.push('?');
            name.push_str(&request.params);
        }
        PathBuf::from(ufile::param_hash(request.params.as_bytes()))
            .join(ufile::url_encode(name.as_bytes()))
    }

    /// Resolves a relative variant path inside the zoom directory.
    pub fn absolute(&self, rel: &Path) -> PathBuf {
        self.zoom_dir.join(rel)
    }

    /// Runs the resizer on the request's source image.
    pub fn generate(&self, request: &ZoomRequest) -> Result<Vec<u8>> {
        let source = ufile::resolve_in(&self.source_dir, request.file.as_bytes()).ok_or_else(|| {
            crate::Error::Zoom(format!("{:?} leaves the source directory", request.file))
        })?;
        self.resizer.resize(&source, request)
    }

    /// Writes a variant and charges it against the quota. Returns the
    /// relative paths of variants to remove.
    ///
    /// The quota lock is held across the write so a concurrent
    /// [`remove_variant`](Self::remove_variant) never sees a written but
    /// untracked file.
    pub fn store(&self, rel: &Path, data: &[u8]) -> io::Result<Vec<PathBuf>> {
        let path = self.absolute(rel);
        let mut quota = self.quota.lock();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, data)?;

        let victims = quota.track(rel.to_path_buf(), data.len() as u64);
        drop(quota);
        if !victims.is_empty() {
            warn!(count = victims.len(), "zoom disk quota exceeded, evicting variants");
        }
        Ok(victims)
    }

    /// Deletes an evicted variant.
    ///
    /// Returns `Ok(false)` without touching the file when the variant was
    /// written and charged again after its eviction.
    pub fn remove_variant(&self, rel: &Path) -> io::Result<bool> {
        let quota = self.quota.lock();
        if quota.contains(rel) {
            return Ok(false);
        }
        fs::remove_file(self.absolute(rel))?;
        Ok(true)
    }

    /// `(used, limit)` of the disk quota in bytes.
    pub fn disk_usage(&self) -> (u64, u64) {
        let quota = self.quota.lock();
        (quota.used(), quota.limit())
    }
}

impl std::fmt::Debug for ZoomService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZoomService")
            .field("zoom_dir", &self.zoom_dir)
            .field("source_dir", &self.source_dir)
            .field("quota", &*self.quota.lock())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(uri: &str) -> std::result::Result<ZoomRequest, ZoomParseError> {
        ZoomRequest::parse(uri.as_bytes(), 1000, 1000)
    }

    #[test]
    fn test_parse_full_query() {
        let req = parse("cat.jpg?w=100&h=50&c=0&q=80").unwrap();
        assert_eq!(req.file, "cat.jpg");
        assert_eq!((req.width, req.height), (100, 50));
        assert!(!req.crop);
        assert_eq!(req.quality, 80);
        assert_eq!(req.params, "w=100&h=50&c=0&q=80");
    }

    #[test]
    fn test_parse_defaults() {
        let req = parse("dir/cat.jpg").unwrap();
        assert_eq!((req.width, req.height), (0, 0));
        assert!(req.crop);
        assert_eq!(req.quality, DEFAULT_QUALITY);
        assert!(req.params.is_empty());

        // Out-of-range quality falls back to the default.
        assert_eq!(parse("a.jpg?q=0").unwrap().quality, 100);
        assert_eq!(parse("a.jpg?q=150").unwrap().quality, 100);
    }

    #[test]
    fn test_parse_rejects() {
        assert_eq!(
            parse("a.jpg?w=10;h=2"),
            Err(ZoomParseError::UnexpectedChar(';'))
        );
        assert_eq!(
            parse("a.jpg?w=1001"),
            Err(ZoomParseError::TooLarge {
                width: 1001,
                height: 0
            })
        );
        assert_eq!(parse("?w=1"), Err(ZoomParseError::MissingFile));
        assert_eq!(
            ZoomRequest::parse(b"caf\xe9.jpg?w=1", 1000, 1000),
            Err(ZoomParseError::InvalidUtf8)
        );
    }

    #[test]
    fn test_geometry_crop_centered() {
        let req = parse("a.jpg?w=100&h=100").unwrap();
        let g = geometry(400, 200, &req).unwrap();
        assert_eq!((g.width, g.height), (100, 100));
        assert_eq!(g.roi, (100, 0, 200, 200));
    }

    #[test]
    fn test_geometry_single_dimension() {
        let only_h = parse("a.jpg?h=50").unwrap();
        let g = geometry(400, 200, &only_h).unwrap();
        assert_eq!((g.width, g.height), (400, 50));
        assert_eq!(g.roi, (0, 0, 400, 200));

        let only_w = parse("a.jpg?w=40").unwrap();
        let g = geometry(400, 200, &only_w).unwrap();
        assert_eq!((g.width, g.height), (40, 200));

        assert!(geometry(400, 200, &parse("a.jpg").unwrap()).is_none());
    }

    #[test]
    fn test_geometry_no_crop() {
        let req = parse("a.jpg?w=100&h=100&c=0").unwrap();
        let g = geometry(400, 200, &req).unwrap();
        assert_eq!(g.roi, (0, 0, 400, 200));
    }

    #[test]
    fn test_quota_fifo_eviction() {
        let mut quota = DiskQuota::new(100);
        assert!(quota.track("a".into(), 40).is_empty());
        assert!(quota.track("b".into(), 40).is_empty());
        let victims = quota.track("c".into(), 40);
        assert_eq!(victims, vec![PathBuf::from("a")]);
        assert_eq!(quota.used(), 80);

        let victims = quota.track("d".into(), 100);
        assert_eq!(victims, vec![PathBuf::from("b"), PathBuf::from("c")]);
        assert_eq!(quota.used(), 100);
        assert_eq!(quota.len(), 1);
    }

    #[test]
    fn test_quota_single_oversized_file() {
        let mut quota = DiskQuota::new(10);
        let victims = quota.track("big".into(), 50);
        assert_eq!(victims, vec![PathBuf::from("big")]);
        assert_eq!(quota.used(), 0);
        assert!(quota.is_empty());
    }

    #[test]
    fn test_quota_retrack_charges_once() {
        let mut quota = DiskQuota::new(100);
        assert!(quota.track("a".into(), 40).is_empty());
        assert!(quota.track("b".into(), 10).is_empty());
        assert!(quota.track("a".into(), 30).is_empty());
        assert_eq!(quota.used(), 40);
        assert_eq!(quota.len(), 2);

        // "a" kept its place at the front of the FIFO.
        let victims = quota.track("c".into(), 70);
        assert_eq!(victims, vec![PathBuf::from("a")]);
        assert_eq!(quota.used(), 80);
    }

    fn service(dir: &Path, disk_limit: u64) -> ZoomService {
        let config = ZoomConfig {
            disk_limit,
            ..ZoomConfig::default()
        };
        let src = dir.join("src");
        fs::create_dir_all(&src).unwrap();
        ZoomService::new(&config, src, dir, Box::new(DefaultResizer)).unwrap()
    }

    #[test]
    fn test_remove_variant_keeps_recharged_file() {
        let dir = tempfile::tempdir().unwrap();
        let zoom = service(dir.path(), 15);
        let x = Path::new("a/bc/x.jpg");
        let y = Path::new("a/bc/y.jpg");

        assert!(zoom.store(x, &[1; 10]).unwrap().is_empty());
        assert_eq!(zoom.store(y, &[2; 10]).unwrap(), vec![x.to_path_buf()]);
        // x is written again before its removal job runs.
        assert_eq!(zoom.store(x, &[3; 10]).unwrap(), vec![y.to_path_buf()]);

        assert!(!zoom.remove_variant(x).unwrap());
        assert_eq!(fs::read(zoom.absolute(x)).unwrap(), vec![3; 10]);
        assert!(zoom.remove_variant(y).unwrap());
        assert!(!zoom.absolute(y).exists());
        assert_eq!(zoom.disk_usage(), (10, 15));
    }

    #[test]
    fn test_generate_source_stays_in_source_dir() {
        let dir = tempfile::tempdir().unwrap();
        let zoom = service(dir.path(), 1 << 20);
        let secret = dir.path().join("secret.png");
        fs::write(&secret, b"outside").unwrap();

        let request = parse(&format!("{}?w=1", secret.display())).unwrap();
        assert!(matches!(zoom.generate(&request), Err(crate::Error::Zoom(_))));
    }
}
