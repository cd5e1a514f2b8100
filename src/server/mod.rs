//! TCP front end.
//!
//! ```text
//!   acceptor ──crossbeam──▶ worker 0 (mio Poll + SlaveCache) ──┐
//!            ──crossbeam──▶ worker 1 (mio Poll + SlaveCache) ──┤ SafeQueues
//!                           ...                                ├──▶ coordinator ──▶ bio pool
//!            ──crossbeam──▶ worker N (mio Poll + SlaveCache) ──┘
//! ```
//!
//! The acceptor hands sockets to workers round-robin and wakes the worker
//! through its `mio::Waker`. The coordinator wakes a worker through the same
//! waker after pushing replies into its inbox.

mod worker;

use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Sender;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, error, info, warn};

use crate::bio::{BackgroundJobPool, JobServices};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::master::{Coordinator, CoordinatorThread};
use crate::metrics::CacheMetrics;
use crate::slave::SlaveWaker;
use crate::zoom::{DefaultResizer, ZoomService};

use self::worker::{Worker, WorkerSettings, WAKE_TOKEN};

const LISTENER_TOKEN: Token = Token(0);

/// How often the acceptor checks the shutdown flag and thread health.
const ACCEPT_TICK: Duration = Duration::from_millis(100);

/// A bound, not yet running server.
#[derive(Debug)]
pub struct Server {
    config: Config,
    listener: StdTcpListener,
}

impl Server {
    /// Validates `config` and binds the listen address.
    pub fn bind(config: &Config) -> Result<Self> {
        config.validate()?;
        let listener = StdTcpListener::bind(config.server.listen)?;
        listener.set_nonblocking(true)?;
        Ok(Server {
            config: config.clone(),
            listener,
        })
    }

    /// The address actually bound, useful when the port was 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Starts the pool, the coordinator and the workers, then accepts
    /// connections until `shutdown` is raised.
    ///
    /// Returns an error if any thread fails to start, or if the coordinator
    /// or a worker stops while the server is still meant to run.
    pub fn run(self, shutdown: Arc<AtomicBool>) -> Result<()> {
        let Server { config, listener } = self;
        let addr = listener.local_addr()?;

        let zoom = ZoomService::new(
            &config.zoom,
            config.storage.source_dir.clone(),
            &config.storage.tmp_dir,
            Box::new(DefaultResizer),
        )?;
        let services = JobServices::new(config.storage.source_dir.clone(), zoom);
        let (pool, results) = BackgroundJobPool::start(&config.bio, services)?;
        let mut coordinator = Coordinator::new(&config.master, pool.submitter(), results);

        let settings = WorkerSettings {
            client_timeout: config.server.client_timeout(),
            stale_batch: config.server.stale_batch,
        };
        let mut workers = Vec::with_capacity(config.server.workers);
        let mut links = Vec::with_capacity(config.server.workers);
        for id in 0..config.server.workers {
            let poll = Poll::new()?;
            let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
            let slave_waker: Arc<dyn SlaveWaker> = waker.clone();
            let slave = coordinator.register_slave(Some(slave_waker));
            let (tx, rx) = crossbeam_channel::unbounded();
            workers.push(Worker::new(
                id,
                poll,
                rx,
                slave,
                coordinator.handle(),
                settings.clone(),
                Arc::clone(&shutdown),
            )?);
            links.push(WorkerLink { tx, waker });
        }

        let master = coordinator.spawn(Arc::clone(&shutdown))?;

        let mut handles = Vec::with_capacity(workers.len());
        for (id, worker) in workers.into_iter().enumerate() {
            let name = format!("ccache-worker-{id}");
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker.run())
                .map_err(|source| Error::ThreadSpawn { name, source });
            match handle {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    shutdown.store(true, Ordering::SeqCst);
                    stop(&links, handles, master, pool);
                    return Err(e);
                }
            }
        }

        info!(
            listen = %addr,
            workers = config.server.workers,
            bio_threads = config.bio.threads,
            memory_limit = config.master.memory_limit,
            "ccache listening"
        );

        let result = accept_loop(listener, &links, &handles, &master, &shutdown);
        if let Err(e) = &result {
            error!(error = %e, "server stopping after failure");
        }
        shutdown.store(true, Ordering::SeqCst);
        stop(&links, handles, master, pool);
        info!("server shutdown complete");
        result
    }
}

struct WorkerLink {
    tx: Sender<TcpStream>,
    waker: Arc<Waker>,
}

fn accept_loop(
    listener: StdTcpListener,
    links: &[WorkerLink],
    handles: &[JoinHandle<Result<()>>],
    master: &CoordinatorThread,
    shutdown: &AtomicBool,
) -> Result<()> {
    let mut listener = TcpListener::from_std(listener);
    let mut poll = Poll::new()?;
    poll.registry()
        .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
    let mut events = Events::with_capacity(128);
    let mut next = 0usize;

    while !shutdown.load(Ordering::Relaxed) {
        match poll.poll(&mut events, Some(ACCEPT_TICK)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }

        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        if master.is_finished() {
            return Err(Error::ThreadExited("ccache-master".to_string()));
        }
        if let Some(id) = handles.iter().position(JoinHandle::is_finished) {
            return Err(Error::ThreadExited(format!("ccache-worker-{id}")));
        }

        if events.is_empty() {
            continue;
        }
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(%peer, error = %e, "failed to set TCP_NODELAY");
                    }
                    let link = &links[next % links.len()];
                    next = next.wrapping_add(1);
                    if link.tx.send(stream).is_err() {
                        warn!(%peer, "worker gone, dropping connection");
                        continue;
                    }
                    SlaveWaker::wake(&*link.waker);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }
    Ok(())
}

/// Wakes and joins every thread. The shutdown flag must already be set.
fn stop(
    links: &[WorkerLink],
    handles: Vec<JoinHandle<Result<()>>>,
    master: CoordinatorThread,
    pool: BackgroundJobPool,
) {
    for link in links {
        SlaveWaker::wake(&*link.waker);
    }
    for (id, handle) in handles.into_iter().enumerate() {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(worker = id, error = %e, "worker returned error"),
            Err(_) => error!(worker = id, "worker panicked"),
        }
    }
    if let Some(coordinator) = master.shutdown() {
        info!(metrics = ?coordinator.report().metrics(), "master final counters");
    }
    info!(metrics = ?pool.metrics().metrics(), "bio final counters");
    pool.shutdown();
}
