//! In-process async command facility.
//!
//! Moves [`CompileJob`]s through the four stages across two threads:
//!
//! ```text
//! client --crossbeam--> NrtWorker --rtrb--> RtStages --rtrb--> NrtWorker --rtrb--> RtStages --rtrb--> client
//!                       stage 1            stage 2             stage 3            stage 4
//! ```
//!
//! The NRT worker may block, allocate and log. The RT side only pops and
//! pushes on wait-free rings, and leaves a job in its ring when the next
//! ring is full, so nothing is ever dropped or allocated on the RT thread.

use crate::compiler::DspCompiler;
use crate::invariant_rt::{signal_invariant, INV_STAGE_QUEUE_FULL};
use crate::pipeline::{CompileJob, CompilerSettings, JobOutcome, NrtContext, Stage};
use crate::pool::RtPool;
use crate::registry::{Reclaimer, Registry};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use rtrb::{Consumer, Producer, RingBuffer};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long the worker waits for a message before checking the RT ring.
pub const WORKER_POLL: Duration = Duration::from_millis(2);

/// Messages for the NRT worker.
#[derive(Debug)]
pub enum WorkerMessage {
    Job(Box<CompileJob>),
    SetLibraryPath(PathBuf),
    Shutdown,
}

/// NRT end of the command facility.
pub struct NrtWorker {
    compiler: Arc<dyn DspCompiler>,
    settings: CompilerSettings,
    pool: Arc<RtPool>,
    inbox: Receiver<WorkerMessage>,
    to_rt: Producer<CompileJob>,
    from_rt: Consumer<CompileJob>,
    backlog: VecDeque<CompileJob>,
    reclaimer: Reclaimer,
    reclaim_interval: Duration,
    last_reclaim: Instant,
}

/// RT end of the command facility. Runs stages 2 and 4 between blocks.
pub struct RtStages {
    from_nrt: Consumer<CompileJob>,
    to_nrt: Producer<CompileJob>,
    outcomes: Producer<JobOutcome>,
}

/// Both ends of the facility plus the client's halves.
pub struct AsyncCommands {
    pub worker: NrtWorker,
    pub stages: RtStages,
    pub submit: Sender<WorkerMessage>,
    pub outcomes: Consumer<JobOutcome>,
}

/// Parts the NRT worker is built from.
pub struct WorkerParts {
    pub compiler: Arc<dyn DspCompiler>,
    pub settings: CompilerSettings,
    pub pool: Arc<RtPool>,
    pub reclaimer: Reclaimer,
    pub reclaim_interval: Duration,
}

/// Wire up the queues. Every queue holds `capacity` items.
pub fn async_commands(parts: WorkerParts, capacity: usize) -> AsyncCommands {
    let (submit, inbox) = bounded(capacity);
    let (to_rt, from_nrt) = RingBuffer::new(capacity);
    let (to_nrt, from_rt) = RingBuffer::new(capacity);
    let (outcome_tx, outcome_rx) = RingBuffer::new(capacity);
    AsyncCommands {
        worker: NrtWorker {
            compiler: parts.compiler,
            settings: parts.settings,
            pool: parts.pool,
            inbox,
            to_rt,
            from_rt,
            backlog: VecDeque::with_capacity(capacity),
            reclaimer: parts.reclaimer,
            reclaim_interval: parts.reclaim_interval,
            last_reclaim: Instant::now(),
        },
        stages: RtStages {
            from_nrt,
            to_nrt,
            outcomes: outcome_tx,
        },
        submit,
        outcomes: outcome_rx,
    }
}

impl NrtWorker {
    /// Run on a dedicated thread until shutdown or until every sender is gone.
    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("dspswap-nrt".into())
            .spawn(move || self.run())
    }

    pub fn run(mut self) {
        info!("nrt worker started");
        while self.poll(WORKER_POLL) {}
        let dropped = self.backlog.len();
        self.backlog.clear();
        self.reclaimer.collect();
        info!(dropped, "nrt worker stopped");
    }

    /// One worker step. Returns false once the worker should stop.
    pub fn poll(&mut self, timeout: Duration) -> bool {
        let running = match self.inbox.recv_timeout(timeout) {
            Ok(message) => self.handle(message),
            Err(RecvTimeoutError::Timeout) => true,
            Err(RecvTimeoutError::Disconnected) => false,
        };

        while let Ok(job) = self.from_rt.pop() {
            self.advance(job);
        }
        self.flush_backlog();

        if self.last_reclaim.elapsed() >= self.reclaim_interval {
            let dropped = self.reclaimer.collect();
            if dropped > 0 {
                debug!(dropped, "reclaimed retired programs");
            }
            self.last_reclaim = Instant::now();
        }
        running
    }

    pub fn settings(&self) -> &CompilerSettings {
        &self.settings
    }

    /// Jobs waiting for room in the RT ring.
    pub fn backlog(&self) -> usize {
        self.backlog.len()
    }

    fn handle(&mut self, message: WorkerMessage) -> bool {
        match message {
            WorkerMessage::Job(job) => {
                self.advance(*job);
                true
            }
            WorkerMessage::SetLibraryPath(path) => {
                info!(path = %path.display(), "library path set");
                self.settings.library_path = Some(path);
                true
            }
            WorkerMessage::Shutdown => false,
        }
    }

    /// Run whichever NRT stage is due and queue the job for the RT side.
    fn advance(&mut self, mut job: CompileJob) {
        match job.stage() {
            Stage::Compile => {
                let ctx = NrtContext {
                    compiler: self.compiler.as_ref(),
                    settings: &self.settings,
                    pool: &self.pool,
                };
                job.compile(&ctx);
            }
            Stage::CleanupNrt => {
                job.cleanup_nrt();
            }
            Stage::Swap | Stage::CleanupRt => {
                warn!(key = job.key(), stage = ?job.stage(), "rt stage job reached the worker");
            }
        }
        self.backlog.push_back(job);
    }

    fn flush_backlog(&mut self) {
        while let Some(job) = self.backlog.pop_front() {
            if let Err(rtrb::PushError::Full(job)) = self.to_rt.push(job) {
                self.backlog.push_front(job);
                break;
            }
        }
    }
}

// IMPORTANT: Do not call assert_invariant or any PPT logging in RT paths to avoid locks/allocs.

impl RtStages {
    /// Advance up to `budget` queued jobs by one stage each.
    ///
    /// A job whose next ring is full stays where it is.
    pub fn run_pending(
        &mut self,
        registry: &mut Registry,
        signals: &mut Producer<u8>,
        budget: usize,
    ) -> usize {
        let mut advanced = 0;
        while advanced < budget {
            let Ok(next) = self.from_nrt.peek() else {
                break;
            };
            let blocked = match next.stage() {
                Stage::CleanupRt => self.outcomes.is_full(),
                _ => self.to_nrt.is_full(),
            };
            if blocked {
                signal_invariant(signals, INV_STAGE_QUEUE_FULL);
                break;
            }
            let Ok(mut job) = self.from_nrt.pop() else {
                break;
            };
            match job.stage() {
                Stage::Swap => {
                    job.swap(registry, signals);
                    let _ = self.to_nrt.push(job);
                }
                // Room in the next ring was checked above.
                Stage::CleanupRt => {
                    let _ = self.outcomes.push(job.finish(signals));
                }
                // An NRT stage is still due; hand the job back.
                Stage::Compile | Stage::CleanupNrt => {
                    let _ = self.to_nrt.push(job);
                }
            }
            advanced += 1;
        }
        advanced
    }
}
