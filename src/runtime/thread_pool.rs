//! Thread-per-connection engine with reusable workers.
//!
//! Each worker is a persistent thread that serves one connection at a time
//! with blocking I/O, then goes back to waiting. Assignment is a channel
//! send, so the connection handoff itself publishes the connection to the
//! worker; the `busy` flag only arbitrates which worker gets it.
//!
//! When every worker is busy the pool grows by one thread, up to
//! `max_workers`. Past the cap the overflow policy either parks the
//! connection in the backlog queue (idle workers drain it) or closes it.
//!
//! # Invariants
//! - `busy` is true iff the worker owns a live connection (or is about to
//!   receive one through its channel).
//! - Only the driver thread scans or appends to the registry.

use crate::runtime::{
    BoundedQueue, Connection, EngineError, EngineSettings, GrowableArray, OverflowPolicy, Progress,
};
use crate::shutdown::ShutdownToken;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Registry entry for one worker thread.
struct Worker {
    id: usize,
    busy: Arc<AtomicBool>,
    assign: Sender<Connection>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Claim this worker if it is idle.
    fn try_claim(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }
}

/// State moved into each worker thread.
struct WorkerContext {
    id: usize,
    busy: Arc<AtomicBool>,
    inbox: Receiver<Connection>,
    backlog: Arc<BoundedQueue<Connection>>,
    token: ShutdownToken,
    poll_interval: Duration,
}

pub struct ThreadPoolEngine {
    settings: EngineSettings,
    token: ShutdownToken,
    workers: GrowableArray<Worker>,
    backlog: Arc<BoundedQueue<Connection>>,
    next_id: usize,
}

impl ThreadPoolEngine {
    pub fn new(settings: &EngineSettings, token: ShutdownToken) -> Self {
        Self {
            settings: settings.clone(),
            token,
            workers: GrowableArray::with_capacity(settings.workers),
            backlog: Arc::new(BoundedQueue::new(settings.backlog_capacity.max(1))),
            next_id: 0,
        }
    }

    /// Pre-spawn the configured number of idle workers.
    pub fn init(&mut self) -> Result<(), EngineError> {
        for _ in 0..self.settings.workers {
            self.spawn_worker(None)?;
        }

        info!(
            workers = self.workers.len(),
            max_workers = ?self.settings.max_workers,
            overflow = ?self.settings.overflow,
            "Thread pool started"
        );
        Ok(())
    }

    /// Hand `conn` to an idle worker, growing the pool if none is idle.
    pub fn add_client(&mut self, conn: Connection) -> Result<(), EngineError> {
        self.reap_finished();

        let mut conn = conn;
        for worker in self.workers.iter() {
            if !worker.try_claim() {
                continue;
            }
            match worker.assign.try_send(conn) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(c)) | Err(TrySendError::Disconnected(c)) => {
                    worker.busy.store(false, Ordering::Release);
                    conn = c;
                }
            }
        }

        if self.at_capacity() {
            return self.overflow(conn);
        }

        self.spawn_worker(Some(conn))
    }

    /// Registered workers.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Workers not currently serving a connection.
    pub fn idle_workers(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| !w.busy.load(Ordering::Acquire))
            .count()
    }

    /// Connections parked in the backlog queue.
    pub fn queued(&self) -> usize {
        self.backlog.len()
    }

    /// Set the token, close queued connections and join every worker.
    pub fn cleanup(&mut self) {
        self.token.request_shutdown();

        let mut dropped = 0;
        while let Some(conn) = self.backlog.try_get() {
            conn.log_close(usize::MAX, &"shutdown before service");
            dropped += 1;
        }

        let mut joined = 0;
        for mut worker in self.workers.drain() {
            drop(worker.assign);
            if let Some(handle) = worker.handle.take() {
                if handle.join().is_err() {
                    warn!(worker = worker.id, "Worker panicked");
                }
                joined += 1;
            }
        }

        info!(joined, dropped, "Thread pool stopped");
    }

    fn at_capacity(&self) -> bool {
        match self.settings.max_workers {
            Some(max) => self.workers.len() >= max,
            None => false,
        }
    }

    fn overflow(&mut self, conn: Connection) -> Result<(), EngineError> {
        match self.settings.overflow {
            OverflowPolicy::Reject => {
                warn!(peer = %conn.peer(), workers = self.workers.len(), "Worker limit reached, rejecting connection");
                Ok(())
            }
            OverflowPolicy::Queue => {
                let mut conn = conn;
                loop {
                    if self.token.is_shutdown() {
                        conn.log_close(usize::MAX, &"shutdown before service");
                        return Ok(());
                    }
                    match self.backlog.put_timeout(conn, self.settings.poll_interval) {
                        Ok(()) => return Ok(()),
                        Err(c) => conn = c,
                    }
                }
            }
        }
    }

    fn spawn_worker(&mut self, conn: Option<Connection>) -> Result<(), EngineError> {
        let id = self.next_id;
        self.next_id += 1;

        let (assign, inbox) = crossbeam_channel::bounded(1);
        let busy = Arc::new(AtomicBool::new(conn.is_some()));
        if let Some(conn) = conn {
            // Fresh bounded(1) channel with a live receiver: cannot fail.
            let _ = assign.try_send(conn);
        }

        let ctx = WorkerContext {
            id,
            busy: Arc::clone(&busy),
            inbox,
            backlog: Arc::clone(&self.backlog),
            token: self.token.clone(),
            poll_interval: self.settings.poll_interval,
        };

        let handle = thread::Builder::new()
            .name(format!("worker-{id}"))
            .spawn(move || worker_loop(ctx))
            .map_err(EngineError::Spawn)?;

        self.workers.push(Worker {
            id,
            busy,
            assign,
            handle: Some(handle),
        });
        Ok(())
    }

    /// Drop workers whose thread has exited (panicked) so they are never
    /// picked for assignment.
    fn reap_finished(&mut self) {
        let mut i = 0;
        while i < self.workers.len() {
            let finished = self.workers.get(i).map_or(false, Worker::is_finished);
            if finished {
                if let Some(worker) = self.workers.remove_at(i) {
                    warn!(worker = worker.id, "Worker exited unexpectedly");
                }
            } else {
                i += 1;
            }
        }
    }
}

fn worker_loop(ctx: WorkerContext) {
    debug!(worker = ctx.id, "Worker started");

    loop {
        if ctx.token.is_shutdown() {
            break;
        }

        let conn = match ctx.inbox.recv_timeout(ctx.poll_interval) {
            Ok(conn) => conn,
            Err(RecvTimeoutError::Timeout) => match claim_queued(&ctx) {
                Some(conn) => conn,
                None => continue,
            },
            Err(RecvTimeoutError::Disconnected) => break,
        };

        serve(&ctx, conn);
        while let Some(conn) = ctx.backlog.try_get() {
            serve(&ctx, conn);
        }
        ctx.busy.store(false, Ordering::Release);
    }

    debug!(worker = ctx.id, "Worker exiting");
}

/// Pick up a parked connection while idle.
fn claim_queued(ctx: &WorkerContext) -> Option<Connection> {
    if ctx.backlog.is_empty() {
        return None;
    }
    if ctx
        .busy
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        // Assigned concurrently; the inbox delivers it next.
        return None;
    }
    let conn = ctx.backlog.try_get();
    if conn.is_none() {
        ctx.busy.store(false, Ordering::Release);
    }
    conn
}

/// Run one connection to completion with blocking I/O.
fn serve(ctx: &WorkerContext, mut conn: Connection) {
    if let Err(e) = prepare_blocking(&conn, ctx.poll_interval) {
        conn.log_close(ctx.id, &e);
        return;
    }

    loop {
        if ctx.token.is_shutdown() {
            conn.log_close(ctx.id, &"shutdown");
            return;
        }

        // Returns at every message boundary and whenever a read or write
        // times out, so the token is seen within one echo or one interval.
        match conn.drive_message() {
            Ok(Progress::Pending | Progress::Echoed) => {}
            Ok(Progress::Closed) => {
                conn.log_close(ctx.id, &"session ended");
                return;
            }
            Err(e) => {
                conn.log_close(ctx.id, &e);
                return;
            }
        }
    }
}

/// Timeouts bound how long a worker can go without checking the token.
fn prepare_blocking(conn: &Connection, interval: Duration) -> io::Result<()> {
    let stream = conn.stream();
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(interval))?;
    stream.set_write_timeout(Some(interval))?;
    Ok(())
}
