use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use super::client::Clamd;
use super::session::Session;
use super::types::{ScanResult, SessionOpts};
use crate::error::{Error, Result};

/// Payload of a successful command.
#[derive(Debug)]
pub enum Reply {
    Text(String),
    Scan(ScanResult),
}

/// What a job hands back on its reply channel. Exactly one variant is
/// meaningful: a reply or the error that produced it.
pub type Outcome = Result<Reply>;

/// The command surface the HTTP layer consumes. Implemented by
/// [`Coordinator`]; object-safe so handlers can be tested against a
/// mock.
#[async_trait]
pub trait ClamdBroker: Send + Sync {
    async fn ping(&self) -> Result<String>;
    async fn version(&self) -> Result<String>;
    async fn stats(&self) -> Result<String>;
    async fn scan(&self, path: &str) -> Result<ScanResult>;
    async fn instream(&self, reader: Box<dyn AsyncRead + Send + Unpin>) -> Result<ScanResult>;
}

enum Command {
    Ping,
    Version,
    Stats,
    Scan(String),
    Instream(Box<dyn AsyncRead + Send + Unpin>),
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Ping => "PING",
            Command::Version => "VERSION",
            Command::Stats => "STATS",
            Command::Scan(_) => "SCAN",
            Command::Instream(_) => "INSTREAM",
        }
    }

    async fn run(self, session: &mut Session) -> Outcome {
        match self {
            Command::Ping => session.ping().await.map(|(_, text)| Reply::Text(text)),
            Command::Version => session.version().await.map(|(_, text)| Reply::Text(text)),
            Command::Stats => session.stats().await.map(|(_, text)| Reply::Text(text)),
            Command::Scan(path) => session.scan(&path).await.map(|(_, scan)| Reply::Scan(scan)),
            Command::Instream(mut reader) => session
                .instream(&mut reader)
                .await
                .map(|(_, scan)| Reply::Scan(scan)),
        }
    }
}

struct Job {
    id: u64,
    command: Command,
    reply: oneshot::Sender<Outcome>,
}

/// Workers pull jobs off one shared queue; the queue is the only
/// synchronisation point between them.
type SharedJobs = Arc<Mutex<mpsc::Receiver<Job>>>;

/// Submit side of the queue, shared with the supervisor so it can
/// close the queue when the last worker is gone.
type JobQueueTx = Arc<StdMutex<Option<mpsc::Sender<Job>>>>;

enum ExitReason {
    /// Queue closed, worker drained and stopped.
    Graceful,
    /// Session could not be opened, connect retries exhausted.
    OpenFailed(Error),
    /// Heartbeat or command failure killed a live session.
    SessionLost(Error),
}

struct WorkerExit {
    worker_id: u64,
    slot: usize,
    reason: ExitReason,
}

#[derive(Debug, Clone)]
pub struct CoordinatorOpts {
    pub min_workers: usize,
    pub max_workers: usize,
    /// Reserved; the pool is fixed-size in this design.
    pub autoscale: bool,
    pub shutdown_timeout: Duration,
}

impl Default for CoordinatorOpts {
    fn default() -> Self {
        Self {
            min_workers: 5,
            max_workers: 5,
            autoscale: false,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// Owns a fixed pool of session workers and multiplexes caller
/// commands onto them over a bounded job queue.
///
/// Jobs are dispatched in FIFO order; each worker runs its commands
/// strictly sequentially on its own session. Submitting blocks while
/// the queue is full.
pub struct Coordinator {
    jobs: JobQueueTx,
    pool_failed: Arc<AtomicBool>,
    job_seq: AtomicU64,
    shutdown_timeout: Duration,
    supervisor: StdMutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    /// Spawns the worker pool. Workers are assigned round-robin across
    /// `backends`; each opens its own session before accepting jobs.
    pub fn init(
        backends: Vec<Clamd>,
        opts: CoordinatorOpts,
        session_opts: SessionOpts,
    ) -> Result<Self> {
        if backends.is_empty() {
            return Err(Error::Config(
                "at least one clamd backend is required".to_string(),
            ));
        }
        if opts.min_workers == 0 {
            return Err(Error::Config("worker pool must not be empty".to_string()));
        }

        let (jobs_tx, jobs_rx) = mpsc::channel(opts.max_workers.max(opts.min_workers));
        let jobs_tx: JobQueueTx = Arc::new(StdMutex::new(Some(jobs_tx)));
        let jobs_rx: SharedJobs = Arc::new(Mutex::new(jobs_rx));
        let pool_failed = Arc::new(AtomicBool::new(false));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let worker_seq = Arc::new(AtomicU64::new(1));

        for slot in 0..opts.min_workers {
            let worker_id = worker_seq.fetch_add(1, Ordering::Relaxed);
            let backend = backends[slot % backends.len()].clone();
            spawn_worker(
                worker_id,
                slot,
                backend,
                session_opts.clone(),
                jobs_rx.clone(),
                events_tx.clone(),
            );
        }

        let supervisor = tokio::spawn(supervise(
            opts.min_workers,
            backends,
            session_opts,
            jobs_rx,
            jobs_tx.clone(),
            pool_failed.clone(),
            events_rx,
            events_tx,
            worker_seq,
        ));

        info!(workers = opts.min_workers, "coordinator started");

        Ok(Self {
            jobs: jobs_tx,
            pool_failed,
            job_seq: AtomicU64::new(1),
            shutdown_timeout: opts.shutdown_timeout,
            supervisor: StdMutex::new(Some(supervisor)),
        })
    }

    /// Closes the job queue and waits for the workers to drain it and
    /// close their sessions, up to the shutdown timeout. On timeout the
    /// remaining workers are abandoned; their sockets are reclaimed on
    /// process exit. Returns regardless.
    pub async fn shutdown(&self) {
        info!("coordinator shutting down");

        let jobs_tx = self
            .jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        drop(jobs_tx);

        let supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        if let Some(supervisor) = supervisor {
            match timeout(self.shutdown_timeout, supervisor).await {
                Ok(_) => info!("all workers closed gracefully"),
                Err(_) => warn!("timed out waiting for workers, abandoning remaining sessions"),
            }
        }
    }

    async fn submit(&self, command: Command) -> Outcome {
        let jobs_tx = self
            .jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        let Some(jobs_tx) = jobs_tx else {
            return Err(self.unavailable_error());
        };

        let job_id = self.job_seq.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();

        trace!(job = job_id, command = command.name(), "submitting job");

        jobs_tx
            .send(Job {
                id: job_id,
                command,
                reply: reply_tx,
            })
            .await
            .map_err(|_| self.unavailable_error())?;

        match reply_rx.await {
            Ok(outcome) => outcome,
            // the job was dropped unexecuted with the queue
            Err(_) => Err(self.unavailable_error()),
        }
    }

    fn unavailable_error(&self) -> Error {
        if self.pool_failed.load(Ordering::SeqCst) {
            Error::Session("no workers left in the pool: all sessions failed".to_string())
        } else {
            Error::Shutdown
        }
    }

    async fn submit_text(&self, command: Command) -> Result<String> {
        match self.submit(command).await? {
            Reply::Text(text) => Ok(text),
            Reply::Scan(_) => Err(Error::Protocol(
                "scan reply to a text command".to_string(),
            )),
        }
    }

    async fn submit_scan(&self, command: Command) -> Result<ScanResult> {
        match self.submit(command).await? {
            Reply::Scan(scan) => Ok(scan),
            Reply::Text(_) => Err(Error::Protocol(
                "text reply to a scan command".to_string(),
            )),
        }
    }
}

#[async_trait]
impl ClamdBroker for Coordinator {
    async fn ping(&self) -> Result<String> {
        self.submit_text(Command::Ping).await
    }

    async fn version(&self) -> Result<String> {
        self.submit_text(Command::Version).await
    }

    async fn stats(&self) -> Result<String> {
        self.submit_text(Command::Stats).await
    }

    async fn scan(&self, path: &str) -> Result<ScanResult> {
        self.submit_scan(Command::Scan(path.to_string())).await
    }

    /// The reader is consumed on the worker task; it is moved into the
    /// job and dropped with it.
    async fn instream(&self, reader: Box<dyn AsyncRead + Send + Unpin>) -> Result<ScanResult> {
        self.submit_scan(Command::Instream(reader)).await
    }
}

fn spawn_worker(
    worker_id: u64,
    slot: usize,
    backend: Clamd,
    opts: SessionOpts,
    jobs: SharedJobs,
    events: mpsc::UnboundedSender<WorkerExit>,
) {
    tokio::spawn(async move {
        let reason = run_worker(worker_id, backend, opts, jobs).await;
        // the supervisor outlives every worker it tracks
        let _ = events.send(WorkerExit {
            worker_id,
            slot,
            reason,
        });
    });
}

async fn run_worker(
    worker_id: u64,
    backend: Clamd,
    opts: SessionOpts,
    jobs: SharedJobs,
) -> ExitReason {
    let mut session = match Session::open(worker_id, backend, opts.clone()).await {
        Ok(session) => session,
        Err(err) => return ExitReason::OpenFailed(err),
    };

    info!(worker = worker_id, "session worker ready");

    let mut heartbeat = interval_at(
        Instant::now() + opts.heartbeat_interval,
        opts.heartbeat_interval,
    );
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let reason = loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if let Err(err) = session.heartbeat().await {
                    break ExitReason::SessionLost(err);
                }
                trace!(worker = worker_id, "heartbeat");
            }
            job = recv_job(&jobs) => {
                let Some(job) = job else {
                    // queue closed: drain is complete, stop cleanly
                    break ExitReason::Graceful;
                };

                debug!(worker = worker_id, job = job.id, command = job.command.name(), "processing job");
                let outcome = job.command.run(&mut session).await;

                // a command failure leaves client and clamd possibly
                // desynchronised, so any error is session-fatal
                let fatal = outcome.as_ref().err().map(|err| err.to_string());

                if job.reply.send(outcome).is_err() {
                    debug!(worker = worker_id, job = job.id, "job reply dropped by caller");
                }

                if let Some(message) = fatal {
                    break ExitReason::SessionLost(Error::Session(format!(
                        "command failed: {}",
                        message
                    )));
                }
                debug!(worker = worker_id, job = job.id, "job processed");
            }
        }
    };

    if let Err(err) = session.close().await {
        debug!(worker = worker_id, error = %err, "error closing session");
    }

    reason
}

async fn recv_job(jobs: &SharedJobs) -> Option<Job> {
    jobs.lock().await.recv().await
}

/// Replaces workers that lose their session so the steady-state pool
/// size stays at `min_workers`. A worker whose replacement cannot open
/// a session (connect retries exhausted) leaves its slot empty: the
/// pool degrades but keeps serving. When the last slot empties, the
/// job queue is closed so submits fail fast instead of waiting on
/// workers that will never come.
#[allow(clippy::too_many_arguments)]
async fn supervise(
    initial_workers: usize,
    backends: Vec<Clamd>,
    session_opts: SessionOpts,
    jobs: SharedJobs,
    jobs_tx: JobQueueTx,
    pool_failed: Arc<AtomicBool>,
    mut events_rx: mpsc::UnboundedReceiver<WorkerExit>,
    events_tx: mpsc::UnboundedSender<WorkerExit>,
    worker_seq: Arc<AtomicU64>,
) {
    let mut alive = initial_workers;

    while alive > 0 {
        let Some(exit) = events_rx.recv().await else {
            break;
        };

        match exit.reason {
            ExitReason::Graceful => {
                info!(worker = exit.worker_id, "worker closed gracefully");
                alive -= 1;
            }
            ExitReason::OpenFailed(err) => {
                error!(
                    worker = exit.worker_id,
                    slot = exit.slot,
                    error = %err,
                    "worker could not open a session, slot left empty"
                );
                alive -= 1;
            }
            ExitReason::SessionLost(err) => {
                warn!(
                    worker = exit.worker_id,
                    slot = exit.slot,
                    error = %err,
                    "worker lost its session, spawning replacement"
                );
                let worker_id = worker_seq.fetch_add(1, Ordering::Relaxed);
                let backend = backends[exit.slot % backends.len()].clone();
                spawn_worker(
                    worker_id,
                    exit.slot,
                    backend,
                    session_opts.clone(),
                    jobs.clone(),
                    events_tx.clone(),
                );
            }
        }
    }

    // A queue that is still open here was not closed by a shutdown:
    // every worker died on its own. Mark the pool failed and close the
    // queue so queued and future submits get an error instead of
    // waiting on workers that no longer exist. The flag is flipped
    // while the queue lock is held so a submit that sees the closed
    // queue also sees the flag.
    {
        let mut queue = jobs_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if queue.take().is_some() {
            pool_failed.store(true, Ordering::SeqCst);
            error!("no workers left in the pool, closing the job queue");
        }
    }

    info!("all workers stopped");
}
