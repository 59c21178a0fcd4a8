//! Background-thread engine service.
//!
//! Runs a [`WorldState`] on a dedicated worker thread and hands the caller a
//! handle that executes closures against it. Front-end transports (IPC, RPC)
//! live outside this crate; what belongs here is the startup rendezvous:
//! [`EngineService::start`] does not return until the worker finished
//! initializing - and if initialization fails, the failure travels through
//! the rendezvous to the caller instead of surfacing as a false success.

use crate::core::consensus::Consensus;
use crate::core::errors::StateError;
use crate::core::world_state::{BlockRoots, WorldState};
use crate::storage::mvcc::TxId;
use crate::storage::storage_trait::Storage;
use crate::utils::log::Logger;
use chainstate_derive::Error;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Errors surfaced by the engine service.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ServiceError {
    /// The worker did not finish initializing within the start timeout.
    #[error("engine worker initialization timed out")]
    StartTimeout,
    /// The worker failed to initialize; the cause is carried verbatim.
    #[error("engine worker initialization failed: {0}")]
    Init(StateError),
    /// The worker thread could not be spawned.
    #[error("failed to spawn engine worker: {0}")]
    Spawn(String),
    /// The worker is no longer accepting work.
    #[error("engine worker is stopped")]
    Stopped,
}

/// Configuration for [`EngineService::start`].
pub struct EngineConfig<I: TxId> {
    /// Consensus plug-in for the world state.
    pub consensus: Arc<dyn Consensus<I>>,
    /// Backing storage for the world state.
    pub storage: Arc<dyn Storage>,
    /// Persisted roots to resume from; `None` starts from an empty state.
    pub roots: Option<BlockRoots>,
    /// Upper bound on how long `start` blocks on worker initialization.
    pub start_timeout: Duration,
}

impl<I: TxId> EngineConfig<I> {
    /// Creates a configuration starting from an empty state with the
    /// default ten-second start timeout.
    pub fn new(consensus: Arc<dyn Consensus<I>>, storage: Arc<dyn Storage>) -> Self {
        Self {
            consensus,
            storage,
            roots: None,
            start_timeout: Duration::from_secs(10),
        }
    }
}

/// Startup rendezvous outcome, protected by the gate's mutex.
enum GateStatus {
    Pending,
    Ready,
    Failed(StateError),
}

/// Bounded condition-variable barrier between `start` and the worker.
struct StartupGate {
    status: Mutex<GateStatus>,
    ready: Condvar,
}

impl StartupGate {
    fn new() -> Self {
        Self {
            status: Mutex::new(GateStatus::Pending),
            ready: Condvar::new(),
        }
    }

    fn mark_ready(&self) {
        let mut status = self.status.lock().unwrap();
        *status = GateStatus::Ready;
        self.ready.notify_all();
    }

    /// The status is stored under the lock before notifying, so a waiter can
    /// never observe the wake-up without the failure.
    fn mark_failed(&self, err: StateError) {
        let mut status = self.status.lock().unwrap();
        *status = GateStatus::Failed(err);
        self.ready.notify_all();
    }

    fn wait(&self, timeout: Duration) -> Result<(), ServiceError> {
        let deadline = Instant::now() + timeout;
        let mut status = self.status.lock().unwrap();
        loop {
            match &*status {
                GateStatus::Ready => return Ok(()),
                GateStatus::Failed(err) => return Err(ServiceError::Init(err.clone())),
                GateStatus::Pending => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ServiceError::StartTimeout);
            }
            let (guard, _) = self.ready.wait_timeout(status, deadline - now).unwrap();
            status = guard;
        }
    }
}

type Job<I> = Box<dyn FnOnce(&mut WorldState<I>) + Send>;

/// Handle to a world state served from a background worker thread.
///
/// Work is submitted as closures and executed in submission order, so the
/// worker thread is the single driver of the parent world state.
pub struct EngineService<I: TxId> {
    jobs: Option<mpsc::Sender<Job<I>>>,
    worker: Option<thread::JoinHandle<()>>,
    logger: Logger,
}

impl<I: TxId> EngineService<I> {
    /// Spawns the worker and blocks until it is serving (or failed).
    pub fn start(config: EngineConfig<I>) -> Result<Self, ServiceError> {
        let (job_tx, job_rx) = mpsc::channel::<Job<I>>();
        let gate = Arc::new(StartupGate::new());
        let logger = Logger::new("engine");

        let start_timeout = config.start_timeout;
        let worker_gate = Arc::clone(&gate);
        let worker_logger = logger.clone();

        let worker = thread::Builder::new()
            .name("chainstate-engine".to_string())
            .spawn(move || {
                let mut world = match init_world(config) {
                    Ok(world) => world,
                    Err(e) => {
                        worker_gate.mark_failed(e);
                        return;
                    }
                };
                worker_gate.mark_ready();
                worker_logger.info("engine worker ready");

                while let Ok(job) = job_rx.recv() {
                    job(&mut world);
                }
                worker_logger.info("engine worker stopped");
            })
            .map_err(|e| ServiceError::Spawn(e.to_string()))?;

        gate.wait(start_timeout)?;
        Ok(Self {
            jobs: Some(job_tx),
            worker: Some(worker),
            logger,
        })
    }

    /// Runs `f` against the world state on the worker thread and returns its
    /// result.
    pub fn execute<R, F>(&self, f: F) -> Result<R, ServiceError>
    where
        R: Send + 'static,
        F: FnOnce(&mut WorldState<I>) -> R + Send + 'static,
    {
        let jobs = self.jobs.as_ref().ok_or(ServiceError::Stopped)?;
        let (result_tx, result_rx) = mpsc::channel();

        jobs.send(Box::new(move |world: &mut WorldState<I>| {
            let _ = result_tx.send(f(world));
        }))
        .map_err(|_| ServiceError::Stopped)?;

        result_rx.recv().map_err(|_| ServiceError::Stopped)
    }

    /// Stops accepting work, drains pending jobs and joins the worker.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if self.jobs.take().is_some() {
            self.logger.info("shutting down engine service");
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl<I: TxId> Drop for EngineService<I> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn init_world<I: TxId>(config: EngineConfig<I>) -> Result<WorldState<I>, StateError> {
    let mut world = WorldState::new(config.consensus, config.storage)?;
    if let Some(roots) = config.roots {
        world.load_accounts_root(roots.accounts)?;
        world.load_txs_root(roots.txs)?;
        world.load_events_root(roots.events)?;
        world.load_consensus_root(&roots.consensus)?;
    }
    Ok(world)
}
