//! Background I/O job pool.
//!
//! File reads, image resizing and file removal never run on the
//! coordinator or on network workers. The coordinator submits a
//! [`BackgroundJob`] through a [`JobSubmitter`]; jobs are spread
//! round-robin over a fixed set of pool threads by sequence number. Each
//! pool thread has its own job queue (a `parking_lot` mutex and condvar)
//! and its own result [`safe_queue`](crate::safe_queue), which the
//! coordinator drains.
//!
//! ```text
//!                      +--> [jobs 0] --> ccache-bio-0 --> [results 0] --+
//!   Coordinator --seq--+--> [jobs 1] --> ccache-bio-1 --> [results 1] --+--> Coordinator
//!                      +--> [jobs n] --> ccache-bio-n --> [results n] --+
//! ```
//!
//! # Job processing
//!
//! A read job walks a small state machine:
//!
//! - `Lookup`: static keys are read from the source directory; zoom keys
//!   are looked up in the variant cache on disk.
//! - `MaybeGenerate`: a zoom variant missing on disk is generated, written
//!   and charged to the disk quota. Victims of the quota become removal
//!   jobs of their own.
//! - `Done`: the job is pushed to the thread's result queue.
//!
//! Every read job produces exactly one result. Removal jobs produce none.

use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use bitflags::bitflags;
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::config::BioConfig;
use crate::error::{Error, Result};
use crate::http;
use crate::key::Key;
use crate::metrics::{PoolCounters, PoolMetrics};
use crate::safe_queue::{self, Consumer, Producer};
use crate::ufile;
use crate::zoom::{ZoomRequest, ZoomService};

/// Key prefix served from the source directory.
pub const STATIC_PREFIX: &[u8] = b"/static/";

/// Key prefix served by the zoom service.
pub const ZOOM_PREFIX: &[u8] = b"/zoom/";

/// What the coordinator asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Produce the payload for a key.
    GeneralRead,
    /// Delete a zoom variant, named relative to the zoom directory.
    RemoveFile,
}

bitflags! {
    /// What a pool thread actually did for a job.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct JobOutcome: u8 {
        /// A file was read from disk.
        const READ_FILE = 0x01;
        /// A file was removed.
        const REMOVE_FILE = 0x02;
        /// A new zoom variant was written to disk.
        const WRITE_FILE = 0x04;
        /// An image was resized.
        const ZOOM_IMAGE = 0x08;
        /// The name was rejected as unsafe.
        const PATH_UNSAFE = 0x10;
        /// Processing is complete.
        const FINISHED = 0x80;
    }
}

/// A unit of background work and, once processed, its result.
#[derive(Debug)]
pub struct BackgroundJob {
    seq: u64,
    created_at: Instant,
    requested: JobKind,
    name: Key,
    outcome: JobOutcome,
    result: Option<Bytes>,
}

impl BackgroundJob {
    fn new(seq: u64, requested: JobKind, name: Key) -> Self {
        BackgroundJob {
            seq,
            created_at: Instant::now(),
            requested,
            name,
            outcome: JobOutcome::empty(),
            result: None,
        }
    }

    /// Submission sequence number.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// When the job was submitted.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// The requested kind of work.
    pub fn requested(&self) -> JobKind {
        self.requested
    }

    /// The key (or relative path, for removals) the job is about.
    pub fn name(&self) -> &Key {
        &self.name
    }

    /// What was done.
    pub fn outcome(&self) -> JobOutcome {
        self.outcome
    }

    /// The full HTTP reply, if the job produced one.
    pub fn result(&self) -> Option<&Bytes> {
        self.result.as_ref()
    }

    /// Consumes the job, returning its key and reply.
    pub fn into_parts(self) -> (Key, Option<Bytes>, JobOutcome) {
        (self.name, self.result, self.outcome)
    }
}

/// Filesystem services available to pool threads.
#[derive(Debug)]
pub struct JobServices {
    source_dir: PathBuf,
    zoom: ZoomService,
}

impl JobServices {
    /// Bundles the source directory and the zoom service.
    pub fn new(source_dir: impl Into<PathBuf>, zoom: ZoomService) -> Self {
        JobServices {
            source_dir: source_dir.into(),
            zoom,
        }
    }

    /// The zoom service.
    pub fn zoom(&self) -> &ZoomService {
        &self.zoom
    }

    fn static_path(&self, rest: &[u8]) -> Option<PathBuf> {
        ufile::resolve_in(&self.source_dir, rest)
    }
}

struct JobSlot {
    jobs: Mutex<VecDeque<BackgroundJob>>,
    ready: Condvar,
    pending: AtomicUsize,
}

struct PoolShared {
    slots: Vec<JobSlot>,
    seq: AtomicU64,
    shutdown: AtomicBool,
    services: JobServices,
    counters: PoolCounters,
}

/// Cloneable handle for submitting jobs to the pool.
#[derive(Clone)]
pub struct JobSubmitter {
    shared: Arc<PoolShared>,
}

impl JobSubmitter {
    /// Queues a job and returns its sequence number.
    ///
    /// The job goes to pool thread `seq % threads`.
    pub fn submit(&self, kind: JobKind, name: Key) -> u64 {
        let seq = self.shared.seq.fetch_add(1, Ordering::Relaxed);
        let slot_idx = (seq % self.shared.slots.len() as u64) as usize;
        let slot = &self.shared.slots[slot_idx];

        slot.pending.fetch_add(1, Ordering::Relaxed);
        slot.jobs.lock().push_back(BackgroundJob::new(seq, kind, name));
        slot.ready.notify_one();
        PoolCounters::bump(&self.shared.counters.jobs_submitted);
        seq
    }

    /// Jobs queued or running on pool thread `tid`.
    pub fn pending_jobs_of_thread(&self, tid: usize) -> usize {
        self.shared
            .slots
            .get(tid)
            .map_or(0, |slot| slot.pending.load(Ordering::Relaxed))
    }

    /// Jobs queued or running on all pool threads.
    pub fn pending_jobs(&self) -> usize {
        (0..self.shared.slots.len())
            .map(|tid| self.pending_jobs_of_thread(tid))
            .sum()
    }

    /// Number of pool threads.
    pub fn threads(&self) -> usize {
        self.shared.slots.len()
    }

    /// `(used, limit)` of the zoom disk quota.
    pub fn disk_usage(&self) -> (u64, u64) {
        self.shared.services.zoom.disk_usage()
    }

    /// Snapshot of the pool counters.
    pub fn metrics(&self) -> PoolMetrics {
        self.shared.counters.snapshot()
    }
}

impl fmt::Debug for JobSubmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobSubmitter")
            .field("threads", &self.shared.slots.len())
            .field("pending", &self.pending_jobs())
            .finish()
    }
}

/// The running pool. Dropping it shuts the threads down.
pub struct BackgroundJobPool {
    submitter: JobSubmitter,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundJobPool {
    /// Starts `config.threads` pool threads.
    ///
    /// Returns the pool and one result consumer per thread, in thread
    /// order, for the coordinator.
    pub fn start(
        config: &BioConfig,
        services: JobServices,
    ) -> Result<(BackgroundJobPool, Vec<Consumer<BackgroundJob>>)> {
        if config.threads == 0 {
            return Err(Error::Config("bio.threads must be at least 1".into()));
        }

        let shared = Arc::new(PoolShared {
            slots: (0..config.threads)
                .map(|_| JobSlot {
                    jobs: Mutex::new(VecDeque::new()),
                    ready: Condvar::new(),
                    pending: AtomicUsize::new(0),
                })
                .collect(),
            seq: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            services,
            counters: PoolCounters::default(),
        });

        let mut pool = BackgroundJobPool {
            submitter: JobSubmitter {
                shared: Arc::clone(&shared),
            },
            handles: Vec::with_capacity(config.threads),
        };
        let mut consumers = Vec::with_capacity(config.threads);

        for tid in 0..config.threads {
            let (results, consumer) = safe_queue::channel();
            let worker = PoolThread {
                tid,
                shared: Arc::clone(&shared),
                results,
            };
            let name = format!("ccache-bio-{tid}");
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker.run())
                .map_err(|source| Error::ThreadSpawn { name, source })?;
            pool.handles.push(handle);
            consumers.push(consumer);
        }

        info!(threads = config.threads, "background job pool started");
        Ok((pool, consumers))
    }

    /// A handle for submitting jobs.
    pub fn submitter(&self) -> JobSubmitter {
        self.submitter.clone()
    }

    /// Snapshot of the pool counters.
    pub fn metrics(&self) -> PoolMetrics {
        self.submitter.metrics()
    }

    /// Stops and joins every pool thread. Queued jobs are dropped.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let shared = &self.submitter.shared;
        shared.shutdown.store(true, Ordering::SeqCst);
        for slot in &shared.slots {
            // Taking the lock orders the flag before a thread's next wait.
            let _guard = slot.jobs.lock();
            slot.ready.notify_all();
        }
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("background thread panicked");
            }
        }
    }
}

impl Drop for BackgroundJobPool {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for BackgroundJobPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundJobPool")
            .field("submitter", &self.submitter)
            .field("threads", &self.handles.len())
            .finish()
    }
}

enum Step {
    Lookup,
    MaybeGenerate(ZoomRequest, PathBuf),
    Done,
}

struct PoolThread {
    tid: usize,
    shared: Arc<PoolShared>,
    results: Producer<BackgroundJob>,
}

impl PoolThread {
    fn run(mut self) {
        debug!(tid = self.tid, "background thread started");
        while let Some(job) = self.next_job() {
            self.process(job);
            self.shared.slots[self.tid]
                .pending
                .fetch_sub(1, Ordering::Relaxed);
            PoolCounters::bump(&self.shared.counters.jobs_completed);
        }
        debug!(tid = self.tid, "background thread stopped");
    }

    fn next_job(&self) -> Option<BackgroundJob> {
        let slot = &self.shared.slots[self.tid];
        let mut jobs = slot.jobs.lock();
        loop {
            if self.shared.shutdown.load(Ordering::SeqCst) {
                return None;
            }
            if let Some(job) = jobs.pop_front() {
                return Some(job);
            }
            slot.ready.wait(&mut jobs);
        }
    }

    fn process(&mut self, mut job: BackgroundJob) {
        let counters = &self.shared.counters;

        if !ufile::is_safe_path(job.name.as_bytes()) {
            debug!(key = %job.name, "rejected unsafe path");
            PoolCounters::bump(&counters.unsafe_paths);
            job.outcome |= JobOutcome::PATH_UNSAFE | JobOutcome::FINISHED;
            if job.requested == JobKind::GeneralRead {
                self.results.push(job);
            }
            return;
        }

        if job.requested == JobKind::RemoveFile {
            self.remove_file(&job);
            return;
        }

        let mut step = Step::Lookup;
        loop {
            step = match step {
                Step::Lookup => self.lookup(&mut job),
                Step::MaybeGenerate(request, variant) => {
                    self.generate(&mut job, &request, &variant)
                }
                Step::Done => break,
            };
        }

        if job.result.is_none() {
            PoolCounters::bump(&counters.not_found);
        }
        job.outcome |= JobOutcome::FINISHED;
        debug!(
            key = %job.name,
            found = job.result.is_some(),
            elapsed_us = job.created_at.elapsed().as_micros() as u64,
            "job finished"
        );
        self.results.push(job);
    }

    fn lookup(&self, job: &mut BackgroundJob) -> Step {
        let services = &self.shared.services;

        if let Some(rest) = job.name.strip_prefix(STATIC_PREFIX) {
            let Some(path) = services.static_path(rest) else {
                debug!(key = %job.name, "static name leaves the source directory");
                PoolCounters::bump(&self.shared.counters.unsafe_paths);
                job.outcome |= JobOutcome::PATH_UNSAFE;
                return Step::Done;
            };
            job.result = ufile::reply_from_file(&path);
            if job.result.is_some() {
                job.outcome |= JobOutcome::READ_FILE;
                PoolCounters::bump(&self.shared.counters.files_read);
            }
            return Step::Done;
        }

        if let Some(rest) = job.name.strip_prefix(ZOOM_PREFIX) {
            let Some(request) = services.zoom.parse(rest) else {
                return Step::Done;
            };
            let variant = services.zoom.variant_path(&request);
            job.result = ufile::reply_from_file(&services.zoom.absolute(&variant));
            if job.result.is_some() {
                job.outcome |= JobOutcome::READ_FILE;
                PoolCounters::bump(&self.shared.counters.files_read);
                return Step::Done;
            }
            return Step::MaybeGenerate(request, variant);
        }

        Step::Done
    }

    fn generate(&self, job: &mut BackgroundJob, request: &ZoomRequest, variant: &Path) -> Step {
        let zoom = &self.shared.services.zoom;
        let counters = &self.shared.counters;

        let data = match zoom.generate(request) {
            Ok(data) => data,
            Err(e) => {
                debug!(key = %job.name, error = %e, "zoom failed");
                return Step::Done;
            }
        };
        job.outcome |= JobOutcome::ZOOM_IMAGE;
        PoolCounters::bump(&counters.images_zoomed);

        match zoom.store(variant, &data) {
            Ok(victims) => {
                job.outcome |= JobOutcome::WRITE_FILE;
                PoolCounters::bump(&counters.files_written);
                let submitter = JobSubmitter {
                    shared: Arc::clone(&self.shared),
                };
                for victim in victims {
                    let name = Key::from(victim.as_os_str().as_encoded_bytes());
                    submitter.submit(JobKind::RemoveFile, name);
                }
            }
            Err(e) => warn!(path = %variant.display(), error = %e, "failed to store zoom variant"),
        }

        job.result = Some(http::ok_reply(&data));
        Step::Done
    }

    fn remove_file(&self, job: &BackgroundJob) {
        let Some(rel) = ufile::resolve_in(Path::new(""), job.name.as_bytes()) else {
            warn!(key = %job.name, "refusing to remove path outside the zoom directory");
            return;
        };
        match self.shared.services.zoom.remove_variant(&rel) {
            Ok(true) => {
                debug!(path = %rel.display(), "variant removed");
                PoolCounters::bump(&self.shared.counters.files_removed);
            }
            Ok(false) => debug!(path = %rel.display(), "variant charged again, kept"),
            Err(e) => warn!(path = %rel.display(), error = %e, "failed to remove variant"),
        }
    }
}
