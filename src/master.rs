//! The master coordinator.
//!
//! A single coordinator thread owns the authoritative object table. It is
//! the only place where payloads are created, shared and destroyed, so the
//! table needs no locks: every other thread talks to it through
//! single-producer single-consumer queues.
//!
//! # Loop
//!
//! Each pass visits the slaves in order. For every slave it:
//!
//! 1. drains the slave's NEW queue ([`Request`]s),
//! 2. drains the result queues of all background threads,
//! 3. drains the slave's OLD queue ([`Release`]s),
//! 4. runs periodic maintenance (status report, memory gauge).
//!
//! A pass that found no work is followed by a short sleep.
//!
//! # Refcounting
//!
//! An object's refcount is `1` (the table's own reference) plus one per
//! request a slave has made for it and not yet released. When a release
//! brings it back to `1` the object is removed and its bytes are no longer
//! charged against the memory limit. Two requests for a key that is still
//! being produced share one background job.
//!
//! # Pinned objects
//!
//! `/status` holds a plain-text report refreshed periodically, and
//! `/favicon.ico` is an alias for `/static/favicon.ico`, fetched at
//! startup. Pinned objects are never destroyed.

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use bytes::Bytes;
use hashbrown::HashMap;
use tracing::{debug, error, info, trace, warn};

use crate::bio::{BackgroundJob, JobKind, JobOutcome, JobSubmitter};
use crate::config::MasterConfig;
use crate::error::{Error, Result};
use crate::http;
use crate::key::Key;
use crate::message::{Fulfilled, Release, Request};
use crate::metrics::{CacheMetrics, CoordinatorMetrics, CoordinatorReport};
use crate::object::{ObjectState, SharedObject, Waiter};
use crate::safe_queue::Consumer;
use crate::slave::{self, MasterLink, SlaveCache, SlaveWaker};

/// Key of the pinned status report.
pub const STATUS_KEY: Key = Key::from_static("/status");

/// Key clients use for the favicon.
pub const FAVICON_ALIAS: Key = Key::from_static("/favicon.ico");

/// Key the favicon is actually stored under.
pub const FAVICON_KEY: Key = Key::from_static("/static/favicon.ico");

const MEGABYTE: f64 = 1024.0 * 1024.0;

struct HandleShared {
    memory_used: AtomicU64,
    memory_limit: u64,
    objects: AtomicUsize,
}

/// Read-only view of the coordinator's gauges, for network workers.
#[derive(Clone)]
pub struct CoordinatorHandle {
    shared: Arc<HandleShared>,
}

impl CoordinatorHandle {
    /// True while charged payload bytes exceed the memory limit.
    pub fn should_free_some_data(&self) -> bool {
        self.memory_used() > self.shared.memory_limit
    }

    /// Payload bytes currently charged.
    pub fn memory_used(&self) -> u64 {
        self.shared.memory_used.load(Ordering::Relaxed)
    }

    /// The configured limit.
    pub fn memory_limit(&self) -> u64 {
        self.shared.memory_limit
    }

    /// Number of objects in the table, pinned ones included.
    pub fn objects(&self) -> usize {
        self.shared.objects.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for CoordinatorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinatorHandle")
            .field("memory_used", &self.memory_used())
            .field("memory_limit", &self.memory_limit())
            .field("objects", &self.objects())
            .finish()
    }
}

/// The single owner of every shared object.
pub struct Coordinator {
    config: MasterConfig,
    table: HashMap<Key, SharedObject>,
    aliases: HashMap<Key, Key>,
    slaves: Vec<MasterLink>,
    results: Vec<Consumer<BackgroundJob>>,
    submitter: JobSubmitter,
    handle: CoordinatorHandle,
    memory_used: usize,
    next_status_refresh: Instant,
    not_found: Bytes,
    metrics: CoordinatorMetrics,
}

impl Coordinator {
    /// Creates a coordinator fed by the given pool result queues.
    ///
    /// Installs the pinned status object and submits the favicon fetch.
    pub fn new(
        config: &MasterConfig,
        submitter: JobSubmitter,
        results: Vec<Consumer<BackgroundJob>>,
    ) -> Self {
        let handle = CoordinatorHandle {
            shared: Arc::new(HandleShared {
                memory_used: AtomicU64::new(0),
                memory_limit: config.memory_limit,
                objects: AtomicUsize::new(0),
            }),
        };

        let mut coordinator = Coordinator {
            config: config.clone(),
            table: HashMap::new(),
            aliases: HashMap::new(),
            slaves: Vec::new(),
            results,
            submitter,
            handle,
            memory_used: 0,
            next_status_refresh: Instant::now() + config.status_refresh(),
            not_found: http::not_found(),
            metrics: CoordinatorMetrics::default(),
        };

        let status = coordinator.status_report();
        coordinator
            .table
            .insert(STATUS_KEY, SharedObject::pinned_ok(status));

        coordinator.aliases.insert(FAVICON_ALIAS, FAVICON_KEY);
        coordinator
            .table
            .insert(FAVICON_KEY, SharedObject::pinned_waiting());
        coordinator.submit(FAVICON_KEY);

        coordinator.publish_gauges();
        coordinator
    }

    /// Connects a new slave cache. `waker` is invoked after replies have
    /// been pushed into the slave's inbox.
    pub fn register_slave(&mut self, waker: Option<Arc<dyn SlaveWaker>>) -> SlaveCache {
        let id = self.slaves.len();
        let (cache, link) = slave::link(id, waker);
        self.slaves.push(link);
        debug!(slave = id, "slave registered");
        cache
    }

    /// A handle to the coordinator's gauges.
    pub fn handle(&self) -> CoordinatorHandle {
        self.handle.clone()
    }

    /// Number of registered slaves.
    pub fn slaves(&self) -> usize {
        self.slaves.len()
    }

    /// The object stored under `key`, after alias resolution.
    pub fn object(&self, key: &[u8]) -> Option<&SharedObject> {
        let key = self.aliases.get(key).map_or(key, Key::as_bytes);
        self.table.get(key)
    }

    /// Number of objects, pinned ones included.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Returns true if the table is empty. Never the case after `new`.
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Charged payload bytes.
    pub fn memory_used(&self) -> usize {
        self.memory_used
    }

    /// Counters.
    pub fn metrics(&self) -> &CoordinatorMetrics {
        &self.metrics
    }

    /// A point-in-time report for logging.
    pub fn report(&self) -> CoordinatorReport {
        CoordinatorReport {
            counters: self.metrics.clone(),
            objects: self.table.len(),
            memory_used: self.memory_used,
        }
    }

    /// Runs one full pass over all slaves. Returns true if any work was
    /// found.
    pub fn run_once(&mut self) -> bool {
        let mut busy = false;

        for idx in 0..self.slaves.len() {
            busy |= self.process_new(idx);
            busy |= self.process_finished_io();
            busy |= self.process_old(idx);
            self.maintenance();
        }
        if self.slaves.is_empty() {
            busy |= self.process_finished_io();
            self.maintenance();
        }

        for link in &mut self.slaves {
            link.flush();
        }
        busy
    }

    /// Runs passes until `shutdown` is raised.
    pub fn run(&mut self, shutdown: &AtomicBool) {
        info!(slaves = self.slaves.len(), "master coordinator running");
        while !shutdown.load(Ordering::Relaxed) {
            if !self.run_once() {
                thread::sleep(self.config.idle_sleep());
            }
        }
        info!(metrics = ?self.report().metrics(), "master coordinator stopped");
    }

    /// Moves the coordinator onto its own thread named `ccache-master`.
    pub fn spawn(mut self, shutdown: Arc<AtomicBool>) -> Result<CoordinatorThread> {
        let name = "ccache-master".to_string();
        let flag = Arc::clone(&shutdown);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                self.run(&flag);
                self
            })
            .map_err(|source| Error::ThreadSpawn { name, source })?;
        Ok(CoordinatorThread { handle, shutdown })
    }

    fn resolve(&self, key: Key) -> Key {
        match self.aliases.get(&key) {
            Some(target) => target.clone(),
            None => key,
        }
    }

    fn submit(&mut self, key: Key) {
        let seq = self.submitter.submit(JobKind::GeneralRead, key.clone());
        self.metrics.jobs_submitted += 1;
        trace!(key = %key, seq, "job submitted");
    }

    fn process_new(&mut self, idx: usize) -> bool {
        let mut busy = false;
        while let Some(request) = self.slaves[idx].requests.pop() {
            self.on_request(idx, request);
            busy = true;
        }
        busy
    }

    fn on_request(&mut self, slave: usize, request: Request) {
        self.metrics.requests += 1;
        let Request { key, entry } = request;
        let target = self.resolve(key.clone());

        let Some(object) = self.table.get_mut(&target) else {
            let mut object = SharedObject::waiting();
            object.acquire();
            object.add_waiter(Waiter { slave, key, entry });
            self.table.insert(target.clone(), object);
            self.submit(target);
            self.publish_gauges();
            return;
        };

        object.acquire();
        match object.state() {
            ObjectState::Waiting => {
                object.add_waiter(Waiter { slave, key, entry });
                self.metrics.coalesced_requests += 1;
            }
            ObjectState::Ok => {
                let payload = object.payload().cloned().unwrap_or_else(|| self.not_found.clone());
                self.metrics.instant_hits += 1;
                self.slaves[slave].deliver(Fulfilled {
                    key,
                    entry,
                    payload,
                });
            }
        }
    }

    fn process_finished_io(&mut self) -> bool {
        let mut busy = false;
        for tid in 0..self.results.len() {
            while let Some(job) = self.results[tid].pop() {
                self.on_result(job);
                busy = true;
            }
        }
        busy
    }

    fn on_result(&mut self, job: BackgroundJob) {
        self.metrics.results_processed += 1;
        let (key, result, outcome) = job.into_parts();
        if outcome.contains(JobOutcome::WRITE_FILE) {
            self.metrics.files_written += 1;
        }

        let Some(object) = self.table.get_mut(&key) else {
            warn!(key = %key, "result for unknown object dropped");
            return;
        };
        if object.state() != ObjectState::Waiting {
            warn!(key = %key, "duplicate result dropped");
            return;
        }

        let (payload, charged) = match result {
            Some(payload) => {
                let len = payload.len();
                (payload, len)
            }
            None => {
                self.metrics.not_found_results += 1;
                (self.not_found.clone(), 0)
            }
        };
        self.memory_used += charged;

        let waiters = object.fulfil(payload.clone(), charged);
        debug!(key = %key, bytes = payload.len(), waiters = waiters.len(), "object ready");
        for Waiter { slave, key, entry } in waiters {
            self.slaves[slave].deliver(Fulfilled {
                key,
                entry,
                payload: payload.clone(),
            });
        }
        self.publish_gauges();
    }

    fn process_old(&mut self, idx: usize) -> bool {
        let mut busy = false;
        while let Some(release) = self.slaves[idx].releases.pop() {
            self.on_release(release);
            busy = true;
        }
        busy
    }

    /// # Panics
    ///
    /// Panics on a release for a key the table does not hold, or one that
    /// would underflow the refcount. Both mean a slave broke the protocol.
    fn on_release(&mut self, release: Release) {
        self.metrics.releases += 1;
        let target = self.resolve(release.key);
        let Some(object) = self.table.get_mut(&target) else {
            panic!("release for unknown key {target:?}");
        };

        if object.release() && !object.is_pinned() {
            let charged = object.charged();
            self.table.remove(&target);
            self.memory_used -= charged;
            self.metrics.objects_destroyed += 1;
            trace!(key = %target, bytes = charged, "object destroyed");
            self.publish_gauges();
        }
    }

    fn maintenance(&mut self) {
        let now = Instant::now();
        if now < self.next_status_refresh {
            return;
        }
        self.next_status_refresh = now + self.config.status_refresh();
        self.refresh_status();
    }

    /// Rebuilds the `/status` payload immediately.
    pub fn refresh_status(&mut self) {
        let report = self.status_report();
        match self.table.get_mut(&STATUS_KEY) {
            Some(object) => object.replace_pinned_payload(report),
            None => error!("status object missing"),
        }
    }

    fn publish_gauges(&self) {
        let shared = &self.handle.shared;
        shared
            .memory_used
            .store(self.memory_used as u64, Ordering::Relaxed);
        shared.objects.store(self.table.len(), Ordering::Relaxed);
    }

    fn status_report(&self) -> Bytes {
        let (disk_used, disk_limit) = self.submitter.disk_usage();
        let mut body = String::new();
        let _ = writeln!(
            body,
            "TOL RAM: {:<6.2}MB\tUSED RAM: {:<6.2}",
            self.config.memory_limit as f64 / MEGABYTE,
            self.memory_used as f64 / MEGABYTE
        );
        let _ = writeln!(
            body,
            "TOL DISK: {:<6.2}MB\tUSED DISK: {:<6.2}",
            disk_limit as f64 / MEGABYTE,
            disk_used as f64 / MEGABYTE
        );
        let _ = writeln!(
            body,
            "OBJECTS: {}\tPENDING JOBS: {}",
            self.table.len(),
            self.submitter.pending_jobs()
        );

        if self.config.status_detail {
            let _ = writeln!(body, "Detail:");
            let _ = writeln!(body, "{:<3} {:<32}: {:<6}", "", "KEY", "MEM");
            let sorted: BTreeMap<&Key, &SharedObject> = self.table.iter().collect();
            for (idx, (key, object)) in sorted.into_iter().enumerate() {
                match object.state() {
                    ObjectState::Ok => {
                        let size = object.payload().map_or(0, Bytes::len);
                        let _ = writeln!(body, "{:<3} {:<32}: {:<6}", idx + 1, key, size);
                    }
                    ObjectState::Waiting => {
                        let _ = writeln!(body, "{:<3} {:<32}: {:<6}", idx + 1, key, "WAITING");
                    }
                }
            }
        }

        http::ok_reply(body.as_bytes())
    }
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("objects", &self.table.len())
            .field("slaves", &self.slaves.len())
            .field("memory_used", &self.memory_used)
            .finish_non_exhaustive()
    }
}

/// A coordinator running on its own thread.
#[derive(Debug)]
pub struct CoordinatorThread {
    handle: JoinHandle<Coordinator>,
    shutdown: Arc<AtomicBool>,
}

impl CoordinatorThread {
    /// True once the loop has exited, normally or by panicking.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Raises the shutdown flag and joins the thread. Returns the
    /// coordinator, or `None` if the loop panicked.
    pub fn shutdown(self) -> Option<Coordinator> {
        self.shutdown.store(true, Ordering::SeqCst);
        match self.handle.join() {
            Ok(coordinator) => Some(coordinator),
            Err(_) => {
                error!("master coordinator panicked");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bio::{BackgroundJobPool, JobServices};
    use crate::config::{BioConfig, ZoomConfig};
    use crate::zoom::{DefaultResizer, ZoomService};
    use std::time::Duration;

    struct Fixture {
        _dir: tempfile::TempDir,
        _pool: BackgroundJobPool,
        coordinator: Coordinator,
    }

    fn fixture(config: MasterConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"alpha").unwrap();
        let zoom = ZoomService::new(
            &ZoomConfig::default(),
            dir.path(),
            dir.path(),
            Box::new(DefaultResizer),
        )
        .unwrap();
        let (pool, results) =
            BackgroundJobPool::start(&BioConfig { threads: 2 }, JobServices::new(dir.path(), zoom))
                .unwrap();
        let coordinator = Coordinator::new(&config, pool.submitter(), results);
        Fixture {
            _dir: dir,
            _pool: pool,
            coordinator,
        }
    }

    fn pump_until(coordinator: &mut Coordinator, mut done: impl FnMut(&mut Coordinator) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !done(&mut *coordinator) {
            assert!(Instant::now() < deadline, "coordinator did not converge");
            if !coordinator.run_once() {
                thread::sleep(Duration::from_millis(1));
            }
        }
    }

    #[test]
    fn test_pinned_objects_installed() {
        let f = fixture(MasterConfig::default());
        let status = f.coordinator.object(STATUS_KEY.as_bytes()).unwrap();
        assert!(status.is_pinned());
        assert_eq!(status.state(), ObjectState::Ok);
        assert!(f.coordinator.object(FAVICON_ALIAS.as_bytes()).unwrap().is_pinned());
        assert_eq!(f.coordinator.metrics().jobs_submitted, 1);
    }

    #[test]
    fn test_request_fulfil_release_cycle() {
        let mut f = fixture(MasterConfig::default());
        let mut slave = f.coordinator.register_slave(None);
        let key = Key::from("/static/a.txt");

        slave.find(&key);
        pump_until(&mut f.coordinator, |c| {
            c.object(key.as_bytes())
                .is_some_and(|o| o.state() == ObjectState::Ok)
        });
        assert!(slave.process_inbox().is_empty());
        let reply = slave.fetch(key.as_bytes()).unwrap();
        assert_eq!(http::reply_body(&reply), Some(&b"alpha"[..]));
        assert_eq!(f.coordinator.object(key.as_bytes()).unwrap().refcount(), 2);
        assert_eq!(f.coordinator.memory_used(), reply.len());

        assert!(slave.delete(key.as_bytes()));
        pump_until(&mut f.coordinator, |c| c.object(key.as_bytes()).is_none());
        assert_eq!(f.coordinator.memory_used(), 0);
        assert_eq!(f.coordinator.metrics().objects_destroyed, 1);
    }

    #[test]
    fn test_missing_file_cached_as_not_found() {
        let mut f = fixture(MasterConfig::default());
        let mut slave = f.coordinator.register_slave(None);
        let key = Key::from("/static/missing.txt");

        slave.find(&key);
        pump_until(&mut f.coordinator, |c| {
            c.object(key.as_bytes())
                .is_some_and(|o| o.state() == ObjectState::Ok)
        });
        slave.process_inbox();
        assert_eq!(
            slave.fetch(key.as_bytes()).as_deref(),
            Some(http::NOT_FOUND_REPLY)
        );
        assert_eq!(f.coordinator.memory_used(), 0);
        assert_eq!(f.coordinator.metrics().not_found_results, 1);
    }

    #[test]
    fn test_status_report_contents() {
        let config = MasterConfig {
            status_detail: true,
            ..MasterConfig::default()
        };
        let mut f = fixture(config);
        f.coordinator.refresh_status();
        let status = f.coordinator.object(STATUS_KEY.as_bytes()).unwrap();
        let body = http::reply_body(status.payload().unwrap()).unwrap();
        let text = String::from_utf8_lossy(body);
        assert!(text.starts_with("TOL RAM: 50.00 MB\tUSED RAM: 0.00"), "{text}");
        assert!(text.contains("Detail:"));
        assert!(text.contains("/status"));
    }

    #[test]
    #[should_panic(expected = "release for unknown key")]
    fn test_release_unknown_key_panics() {
        let mut f = fixture(MasterConfig::default());
        f.coordinator.on_release(Release {
            key: Key::from("/never-requested"),
        });
    }

    #[test]
    fn test_handle_reports_memory_pressure() {
        let config = MasterConfig {
            memory_limit: 4,
            ..MasterConfig::default()
        };
        let mut f = fixture(config);
        let handle = f.coordinator.handle();
        assert!(!handle.should_free_some_data());

        let mut slave = f.coordinator.register_slave(None);
        let key = Key::from("/static/a.txt");
        slave.find(&key);
        pump_until(&mut f.coordinator, |c| c.memory_used() > 0);
        assert!(handle.should_free_some_data());
        assert_eq!(handle.memory_limit(), 4);

        slave.process_inbox();
        assert_eq!(slave.delete_stale_entries(16), 1);
        pump_until(&mut f.coordinator, |c| c.memory_used() == 0);
        assert!(!handle.should_free_some_data());
    }

    #[test]
    fn test_spawned_coordinator_shuts_down() {
        let f = fixture(MasterConfig::default());
        let shutdown = Arc::new(AtomicBool::new(false));
        let running = f.coordinator.spawn(Arc::clone(&shutdown)).unwrap();
        assert!(!running.is_finished());
        let coordinator = running.shutdown().unwrap();
        assert!(shutdown.load(Ordering::SeqCst));
        assert!(coordinator.len() >= 2);
    }
}
