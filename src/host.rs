//! Host facade: the RT-side [`Server`] and the control-side [`Client`].
//!
//! [`launch`] builds both ends and starts the NRT worker. The audio thread
//! owns the `Server` and calls [`Server::run_commands`] between blocks; any
//! other thread drives the `Client`.

use crate::compiler::DspCompiler;
use crate::config::EngineConfig;
use crate::invariant_rt::{
    drain_invariant_signals, log_signals, new_invariant_queue, signal_invariant,
    INV_DELETE_DEFERRED, INV_ENTRY_DELETED,
};
use crate::pipeline::{CompileJob, CompileRequest, JobOutcome};
use crate::pool::{PoolError, RtPool};
use crate::registry::{ProgramKey, Registry, Release};
use crate::scheduler::{async_commands, RtStages, WorkerMessage, WorkerParts};
use crate::unit::{process_safe, ProcessingUnit, UnitContext};
use crossbeam_channel::{Sender, TrySendError};
use rtrb::{Consumer, Producer, RingBuffer};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tracing::{debug, info};

/// A client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Compile and publish a program under a key.
    Compile(CompileRequest),
    /// Delete every program published under `key`, deferred while in use.
    Free { key: ProgramKey },
    /// Delete every program, deferred while in use.
    FreeAll,
    /// Library path searched before the configured include paths.
    SetLibraryPath(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RtCommand {
    Free { key: ProgramKey },
    FreeAll,
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("compile request does not fit the rt pool: {0}")]
    OutOfMemory(#[from] PoolError),
    #[error("command queue is full")]
    QueueFull,
    #[error("nrt worker has stopped")]
    WorkerGone,
    #[error("failed to start nrt worker: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("nrt worker panicked")]
    WorkerPanicked,
}

/// RT side of the engine.
pub struct Server {
    registry: Registry,
    stages: RtStages,
    commands: Consumer<RtCommand>,
    pool: Arc<RtPool>,
    sample_rate: u32,
    signals: Producer<u8>,
    budget: usize,
}

// IMPORTANT: Do not call assert_invariant or any PPT logging in RT paths to avoid locks/allocs.

impl Server {
    /// Apply queued free commands, then advance queued jobs.
    ///
    /// Call between blocks, never during one.
    pub fn run_commands(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(command) = self.commands.pop() {
            let before = self.registry.len();
            let marked = match command {
                RtCommand::Free { key } => self.registry.request_delete(key),
                RtCommand::FreeAll => self.registry.request_delete_all(),
            };
            let deleted = before - self.registry.len();
            if deleted > 0 {
                signal_invariant(&mut self.signals, INV_ENTRY_DELETED);
            }
            if marked > deleted {
                signal_invariant(&mut self.signals, INV_DELETE_DEFERRED);
            }
            handled += 1;
        }
        handled + self
            .stages
            .run_pending(&mut self.registry, &mut self.signals, self.budget)
    }

    pub fn create_unit(&mut self, inputs: &[&[f32]], num_outputs: usize) -> ProcessingUnit {
        let mut ctx = UnitContext {
            registry: &mut self.registry,
            sample_rate: self.sample_rate,
            signals: &mut self.signals,
        };
        ProcessingUnit::new(&mut ctx, inputs, num_outputs)
    }

    pub fn process(
        &mut self,
        unit: &mut ProcessingUnit,
        frames: usize,
        inputs: &[&[f32]],
        outputs: &mut [&mut [f32]],
    ) {
        process_safe(unit, frames, inputs, outputs, &mut self.signals);
    }

    pub fn destroy_unit(&mut self, unit: ProcessingUnit) -> Option<Release> {
        unit.teardown(&mut self.registry, &mut self.signals)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<RtPool> {
        &self.pool
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Control side of the engine.
pub struct Client {
    worker_tx: Sender<WorkerMessage>,
    commands: Producer<RtCommand>,
    outcomes: Consumer<JobOutcome>,
    signals: Consumer<u8>,
    pool: Arc<RtPool>,
    sample_rate: u32,
    worker: Option<JoinHandle<()>>,
}

impl Client {
    pub fn submit(&mut self, command: Command) -> Result<(), SubmitError> {
        match command {
            Command::Compile(request) => self.compile(request),
            Command::Free { key } => self.push_rt(RtCommand::Free { key }),
            Command::FreeAll => self.push_rt(RtCommand::FreeAll),
            Command::SetLibraryPath(path) => self.send(WorkerMessage::SetLibraryPath(path)),
        }
    }

    /// Queue a compile. The job's buffers are charged to the RT pool right
    /// away and returned when its outcome is produced.
    pub fn compile(&mut self, request: CompileRequest) -> Result<(), SubmitError> {
        let key = request.key;
        let job = CompileJob::new(request, self.sample_rate, &self.pool)?;
        debug!(key, bytes = job.leased_bytes(), "queued compile");
        self.send(WorkerMessage::Job(Box::new(job)))
    }

    /// Outcomes produced since the last call.
    pub fn poll_outcomes(&mut self) -> Vec<JobOutcome> {
        let mut outcomes = Vec::with_capacity(self.outcomes.slots());
        while let Ok(outcome) = self.outcomes.pop() {
            info!(key = outcome.key, published = outcome.is_published(), "job finished");
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Drain the RT signal queue and log it.
    pub fn drain_signals(&mut self) -> Vec<u8> {
        let signals = drain_invariant_signals(&mut self.signals);
        log_signals(&signals);
        signals
    }

    /// Stop the worker and wait for it.
    pub fn shutdown(mut self) -> Result<(), SubmitError> {
        self.stop()
    }

    fn stop(&mut self) -> Result<(), SubmitError> {
        let Some(handle) = self.worker.take() else {
            return Ok(());
        };
        let _ = self.worker_tx.send(WorkerMessage::Shutdown);
        handle.join().map_err(|_| SubmitError::WorkerPanicked)
    }

    fn send(&self, message: WorkerMessage) -> Result<(), SubmitError> {
        self.worker_tx.try_send(message).map_err(|err| match err {
            TrySendError::Full(_) => SubmitError::QueueFull,
            TrySendError::Disconnected(_) => SubmitError::WorkerGone,
        })
    }

    fn push_rt(&mut self, command: RtCommand) -> Result<(), SubmitError> {
        self.commands.push(command).map_err(|_| SubmitError::QueueFull)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Build the engine and start its NRT worker.
pub fn launch(
    config: &EngineConfig,
    compiler: Arc<dyn DspCompiler>,
) -> Result<(Server, Client), SubmitError> {
    let pool = RtPool::new(config.rt_pool_bytes);
    let (registry, reclaimer) = Registry::new(config.registry_capacity);
    let commands = async_commands(
        WorkerParts {
            compiler,
            settings: config.compiler_settings(),
            pool: Arc::clone(&pool),
            reclaimer,
            reclaim_interval: config.reclaim_interval(),
        },
        config.queue_capacity,
    );
    let (rt_tx, rt_rx) = RingBuffer::new(config.queue_capacity);
    let (signal_tx, signal_rx) = new_invariant_queue();
    let worker = commands.worker.spawn()?;
    info!(
        sample_rate = config.sample_rate,
        pool_bytes = config.rt_pool_bytes,
        registry_capacity = config.registry_capacity,
        "engine launched"
    );

    let server = Server {
        registry,
        stages: commands.stages,
        commands: rt_rx,
        pool: Arc::clone(&pool),
        sample_rate: config.sample_rate,
        signals: signal_tx,
        budget: config.queue_capacity,
    };
    let client = Client {
        worker_tx: commands.submit,
        commands: rt_tx,
        outcomes: commands.outcomes,
        signals: signal_rx,
        pool,
        sample_rate: config.sample_rate,
        worker: Some(worker),
    };
    Ok((server, client))
}
