//! Zoom Tests
//!
//! Exercises the real `image`-backed resizer and the on-disk variant store
//! through the background pool.
//!
//! ## Test Strategy
//! - Tiny generated PNG sources so decoding is fast and sizes are exact
//! - Output dimensions checked by decoding the produced JPEG
//! - Disk quota checked by watching the zoom directory converge

use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use ccache::bio::{BackgroundJob, BackgroundJobPool, JobKind, JobOutcome, JobServices};
use ccache::config::{BioConfig, ZoomConfig};
use ccache::http;
use ccache::safe_queue::Consumer;
use ccache::ufile;
use ccache::zoom::{DefaultResizer, ImageResizer, ZoomRequest, ZoomService};
use ccache::Key;
use image::{GenericImageView, Rgb, RgbImage};

// ============================================================================
// HELPERS
// ============================================================================

/// Writes a `w`x`h` PNG with a left/right colour split.
fn write_png(path: &Path, w: u32, h: u32) {
    let img = RgbImage::from_fn(w, h, |x, _| {
        if x < w / 2 {
            Rgb([255, 0, 0])
        } else {
            Rgb([0, 0, 255])
        }
    });
    img.save(path).unwrap();
}

fn decoded_size(jpeg: &[u8]) -> (u32, u32) {
    assert_eq!(&jpeg[..2], &[0xFF, 0xD8], "not a JPEG");
    image::load_from_memory(jpeg).unwrap().dimensions()
}

fn request(uri: &str) -> ZoomRequest {
    ZoomRequest::parse(uri.as_bytes(), 1000, 1000).unwrap()
}

struct Pool {
    dir: tempfile::TempDir,
    pool: BackgroundJobPool,
    results: Vec<Consumer<BackgroundJob>>,
}

fn start_pool(disk_limit: u64) -> Pool {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src");
    fs::create_dir_all(&src).unwrap();
    write_png(&src.join("pic.png"), 40, 20);

    let config = ZoomConfig {
        disk_limit,
        ..ZoomConfig::default()
    };
    let zoom = ZoomService::new(&config, &src, dir.path(), Box::new(DefaultResizer)).unwrap();
    let (pool, results) =
        BackgroundJobPool::start(&BioConfig { threads: 2 }, JobServices::new(&src, zoom)).unwrap();
    Pool { dir, pool, results }
}

fn next_result(results: &mut [Consumer<BackgroundJob>]) -> BackgroundJob {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        for consumer in results.iter_mut() {
            if let Some(job) = consumer.pop() {
                return job;
            }
        }
        assert!(Instant::now() < deadline, "no job result");
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn wait_until(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "condition never held");
        std::thread::sleep(Duration::from_millis(5));
    }
}

// ============================================================================
// RESIZER
// ============================================================================

#[test]
fn test_resizer_crops_and_scales() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("pic.png");
    write_png(&src, 40, 20);

    let out = DefaultResizer
        .resize(&src, &request("pic.png?w=10&h=10"))
        .unwrap();
    assert_eq!(decoded_size(&out), (10, 10));

    let out = DefaultResizer
        .resize(&src, &request("pic.png?w=30&h=5&c=0"))
        .unwrap();
    assert_eq!(decoded_size(&out), (30, 5));
}

#[test]
fn test_resizer_single_dimension_keeps_the_other() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("pic.png");
    write_png(&src, 40, 20);

    let out = DefaultResizer.resize(&src, &request("pic.png?w=8")).unwrap();
    assert_eq!(decoded_size(&out), (8, 20));

    let out = DefaultResizer.resize(&src, &request("pic.png?h=4")).unwrap();
    assert_eq!(decoded_size(&out), (40, 4));
}

#[test]
fn test_resizer_without_parameters_reencodes() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("pic.png");
    write_png(&src, 40, 20);

    let out = DefaultResizer.resize(&src, &request("pic.png")).unwrap();
    assert_eq!(decoded_size(&out), (40, 20));
}

#[test]
fn test_resizer_errors_on_missing_or_bad_source() {
    let dir = tempfile::tempdir().unwrap();
    assert!(DefaultResizer
        .resize(&dir.path().join("none.png"), &request("none.png?w=1"))
        .is_err());

    let junk = dir.path().join("junk.png");
    fs::write(&junk, b"not an image").unwrap();
    assert!(DefaultResizer.resize(&junk, &request("junk.png?w=1")).is_err());
}

// ============================================================================
// POOL + VARIANT STORE
// ============================================================================

#[test]
fn test_zoom_job_writes_variant_and_serves_it() {
    let mut p = start_pool(1 << 30);
    let key = Key::from("/zoom/pic.png?w=10&h=10&q=80");

    p.pool.submitter().submit(JobKind::GeneralRead, key.clone());
    let job = next_result(&mut p.results);
    assert!(job
        .outcome()
        .contains(JobOutcome::ZOOM_IMAGE | JobOutcome::WRITE_FILE | JobOutcome::FINISHED));
    let body = http::reply_body(job.result().unwrap()).unwrap().to_vec();
    assert_eq!(decoded_size(&body), (10, 10));

    let files = ufile::scan_folder(&p.dir.path().join("zoom"), 3).unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(fs::read(&files[0].path).unwrap(), body);
    assert_eq!(p.pool.submitter().disk_usage().0, body.len() as u64);

    p.pool.submitter().submit(JobKind::GeneralRead, key);
    let again = next_result(&mut p.results);
    assert!(again.outcome().contains(JobOutcome::READ_FILE));
    assert_eq!(http::reply_body(again.result().unwrap()).unwrap(), &body[..]);
}

#[test]
fn test_bad_zoom_requests_yield_no_payload() {
    let mut p = start_pool(1 << 30);
    let keys = [
        "/zoom/pic.png?w=2000",
        "/zoom/pic.png?x=1",
        "/zoom/missing.png?w=5",
        "/zoom/../src/pic.png?w=5",
    ];
    for key in keys {
        p.pool.submitter().submit(JobKind::GeneralRead, Key::from(key));
    }
    for _ in keys {
        let job = next_result(&mut p.results);
        assert!(job.result().is_none(), "{:?}", job.name());
    }
    assert_eq!(p.pool.metrics().unsafe_paths, 1);
    assert_eq!(p.pool.metrics().files_written, 0);
}

#[test]
fn test_disk_quota_converges() {
    // Every variant is bigger than the quota, so each one is removed again
    // right after it is served.
    let mut p = start_pool(1);
    let submitter = p.pool.submitter();
    for w in 1..=5 {
        submitter.submit(JobKind::GeneralRead, Key::from(format!("/zoom/pic.png?w={w}")));
    }
    for _ in 0..5 {
        let job = next_result(&mut p.results);
        assert!(job.result().is_some());
    }

    let zoom_dir = p.dir.path().join("zoom");
    wait_until(|| ufile::scan_folder(&zoom_dir, 3).unwrap().is_empty());
    wait_until(|| submitter.metrics().files_removed == 5);
    assert_eq!(submitter.disk_usage().0, 0);
}

#[test]
fn test_startup_scan_charges_existing_variants() {
    let dir = tempfile::tempdir().unwrap();
    let nested = dir.path().join("zoom").join("a").join("bc");
    fs::create_dir_all(&nested).unwrap();
    fs::write(nested.join("one.jpg"), vec![0u8; 100]).unwrap();
    fs::write(nested.join("two.jpg"), vec![0u8; 50]).unwrap();

    let config = ZoomConfig {
        disk_limit: 120,
        ..ZoomConfig::default()
    };
    let zoom = ZoomService::new(&config, dir.path(), dir.path(), Box::new(DefaultResizer)).unwrap();
    assert_eq!(zoom.disk_usage(), (150, 120));

    // The next write pushes out the oldest files first.
    let victims = zoom.store(Path::new("f/ff/new.jpg"), &[1u8; 10]).unwrap();
    assert_eq!(victims, vec![Path::new("a/bc/one.jpg").to_path_buf()]);
    assert_eq!(zoom.disk_usage(), (60, 120));
}
