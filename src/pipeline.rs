//! Compile/swap/cleanup pipeline.
//!
//! One [`CompileJob`] per request, moved through four stages that alternate
//! between the NRT worker and the RT thread:
//!
//! | Stage | Thread | Work |
//! |---|---|---|
//! | [`Stage::Compile`] | NRT | compile, introspect, export names |
//! | [`Stage::Swap`] | RT | publish into the registry |
//! | [`Stage::CleanupNrt`] | NRT | drop anything that did not get published |
//! | [`Stage::CleanupRt`] | RT | release the job's pool leases, build the reply |
//!
//! Every stage runs even when an earlier one failed; failures only turn later
//! stages into no-ops. [`CompileJob::finish`] consumes the job, so its buffers
//! are given back exactly once.

use crate::compiler::{CompileError, CompiledProgram, DspCompiler, ProgramName};
use crate::exchange::write_param_names;
use crate::invariant_ppt::{
    assert_invariant, COMPILE_FAILURE_CONTAINED, EXCHANGE_WRITTEN, FACTORY_ON_RT_ALLOCATOR,
    INTROSPECTION_DISPOSED, PROGRAM_NAME_FRESH, SURFACE_DISCOVERED, UNPUBLISHED_PROGRAM_DROPPED,
};
use crate::invariant_rt::{
    signal_invariant, INV_JOB_FINISHED, INV_PROGRAM_PUBLISHED, INV_PUBLISH_FAILED,
    INV_SWAP_SKIPPED,
};
use crate::pool::{PoolError, RtLease, RtPool};
use crate::registry::{EntryId, ProgramKey, ProgramShape, Registry};
use crate::surface::DiscoverySurface;
use rtrb::Producer;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// A client's request to compile and publish a program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileRequest {
    pub key: ProgramKey,
    /// Where the parameter names get written. Empty to skip the export.
    pub exchange_path: PathBuf,
    pub source: String,
}

impl CompileRequest {
    pub fn new(
        key: ProgramKey,
        exchange_path: impl Into<PathBuf>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            key,
            exchange_path: exchange_path.into(),
            source: source.into(),
        }
    }
}

/// Thread class a stage must run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadClass {
    Nrt,
    Rt,
}

/// Pipeline position of a job: the stage that runs next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Compile,
    Swap,
    CleanupNrt,
    CleanupRt,
}

impl Stage {
    pub fn thread(self) -> ThreadClass {
        match self {
            Stage::Compile | Stage::CleanupNrt => ThreadClass::Nrt,
            Stage::Swap | Stage::CleanupRt => ThreadClass::Rt,
        }
    }
}

/// Unit slots prepared per compiled program unless configured otherwise.
pub const DEFAULT_UNITS_PER_PROGRAM: usize = 16;

/// Compiler flags and target used by stage 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerSettings {
    /// DSP standard library location, searched first.
    pub library_path: Option<PathBuf>,
    pub include_paths: Vec<PathBuf>,
    pub target: String,
    /// Units of one program that can run at the same time.
    pub units_per_program: usize,
}

impl Default for CompilerSettings {
    fn default() -> Self {
        Self {
            library_path: None,
            include_paths: Vec::new(),
            target: String::new(),
            units_per_program: DEFAULT_UNITS_PER_PROGRAM,
        }
    }
}

impl CompilerSettings {
    /// `-I <path>` for the library path and every include path.
    pub fn args(&self) -> Vec<String> {
        self.library_path
            .iter()
            .chain(self.include_paths.iter())
            .flat_map(|path| ["-I".to_owned(), path.display().to_string()])
            .collect()
    }
}

/// What stage 1 needs from the NRT side.
pub struct NrtContext<'a> {
    pub compiler: &'a dyn DspCompiler,
    pub settings: &'a CompilerSettings,
    pub pool: &'a Arc<RtPool>,
}

/// How a job ended.
#[derive(Debug)]
pub enum JobStatus {
    Published { entry: EntryId, shape: ProgramShape },
    CompileFailed(CompileError),
    /// Compiled, but the registry had no free slot.
    RegistryFull,
    /// Finished before reaching `stage`.
    Incomplete { stage: Stage },
}

/// Reply sent to the client once stage 4 has run.
///
/// Carries the job's text buffers so that they are dropped wherever the
/// reply is consumed rather than on the RT thread.
#[derive(Debug)]
pub struct JobOutcome {
    pub key: ProgramKey,
    pub name: Option<ProgramName>,
    pub status: JobStatus,
    leftovers: Leftovers,
}

#[derive(Debug)]
struct Leftovers {
    _source: String,
    _exchange_path: PathBuf,
    _program: Option<CompiledProgram>,
}

impl JobOutcome {
    pub fn is_published(&self) -> bool {
        matches!(self.status, JobStatus::Published { .. })
    }

    pub fn entry(&self) -> Option<EntryId> {
        match self.status {
            JobStatus::Published { entry, .. } => Some(entry),
            _ => None,
        }
    }

    pub fn shape(&self) -> Option<ProgramShape> {
        match self.status {
            JobStatus::Published { shape, .. } => Some(shape),
            _ => None,
        }
    }

    /// True if the job still held an unpublished program at stage 4.
    pub fn has_leftover_program(&self) -> bool {
        self.leftovers._program.is_some()
    }
}

#[derive(Debug)]
enum JobFailure {
    Compile(CompileError),
    RegistryFull,
}

/// One compile request on its way through the four stages.
#[derive(Debug)]
pub struct CompileJob {
    key: ProgramKey,
    source: String,
    exchange_path: PathBuf,
    sample_rate: u32,
    stage: Stage,
    name: Option<ProgramName>,
    compiled: Option<(CompiledProgram, ProgramShape)>,
    shape: Option<ProgramShape>,
    published: Option<EntryId>,
    failure: Option<JobFailure>,
    lease: RtLease,
}

impl CompileJob {
    /// Take ownership of the request, charging its buffers to `pool`.
    pub fn new(
        request: CompileRequest,
        sample_rate: u32,
        pool: &Arc<RtPool>,
    ) -> Result<Self, PoolError> {
        let bytes = std::mem::size_of::<Self>()
            + request.source.len()
            + request.exchange_path.as_os_str().len();
        let lease = pool.lease(bytes)?;
        Ok(Self {
            key: request.key,
            source: request.source,
            exchange_path: request.exchange_path,
            sample_rate,
            stage: Stage::Compile,
            name: None,
            compiled: None,
            shape: None,
            published: None,
            failure: None,
            lease,
        })
    }

    pub fn key(&self) -> ProgramKey {
        self.key
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn name(&self) -> Option<ProgramName> {
        self.name
    }

    pub fn shape(&self) -> Option<ProgramShape> {
        self.shape
    }

    pub fn published(&self) -> Option<EntryId> {
        self.published
    }

    /// Bytes this job holds in the RT pool.
    pub fn leased_bytes(&self) -> usize {
        self.lease.bytes()
    }

    /// Stage 1 (NRT). Returns false if the job is not at this stage.
    pub fn compile(&mut self, ctx: &NrtContext<'_>) -> bool {
        if self.stage != Stage::Compile {
            return false;
        }
        self.stage = Stage::Swap;
        assert_invariant(
            PROGRAM_NAME_FRESH,
            self.name.is_none(),
            "a job draws exactly one program name",
            Some("stage 1"),
        );
        let name = ProgramName::next();
        self.name = Some(name);

        match introspect(ctx, name, &self.source, &self.exchange_path) {
            Ok((program, shape)) => {
                info!(
                    key = self.key,
                    program = %name,
                    params = shape.param_count,
                    outputs = shape.output_count,
                    "compiled program"
                );
                self.shape = Some(shape);
                self.compiled = Some((program, shape));
            }
            Err(err) => {
                error!(key = self.key, error = %err, "compile failed");
                assert_invariant(
                    COMPILE_FAILURE_CONTAINED,
                    self.compiled.is_none(),
                    "failed compile leaves no program",
                    Some("stage 1"),
                );
                self.failure = Some(JobFailure::Compile(err));
            }
        }
        true
    }

    /// Stage 2 (RT). Publishes the program if stage 1 produced one.
    pub fn swap(&mut self, registry: &mut Registry, signals: &mut Producer<u8>) -> bool {
        if self.stage != Stage::Swap {
            return false;
        }
        self.stage = Stage::CleanupNrt;
        let Some((program, shape)) = self.compiled.take() else {
            signal_invariant(signals, INV_SWAP_SKIPPED);
            return true;
        };
        match registry.publish(self.key, program, shape) {
            Ok(entry) => {
                self.published = Some(entry);
                signal_invariant(signals, INV_PROGRAM_PUBLISHED);
            }
            Err(full) => {
                self.compiled = Some((full.program, shape));
                self.failure = Some(JobFailure::RegistryFull);
                signal_invariant(signals, INV_PUBLISH_FAILED);
            }
        }
        true
    }

    /// Stage 3 (NRT). Drops a program that never made it into the registry.
    pub fn cleanup_nrt(&mut self) -> bool {
        if self.stage != Stage::CleanupNrt {
            return false;
        }
        self.stage = Stage::CleanupRt;
        if let Some((program, _)) = self.compiled.take() {
            warn!(key = self.key, program = %program.name(), "dropping unpublished program");
            drop(program);
            assert_invariant(
                UNPUBLISHED_PROGRAM_DROPPED,
                self.compiled.is_none(),
                "unpublished program dropped off the rt thread",
                Some("stage 3"),
            );
        }
        true
    }

    /// Stage 4 (RT). Consumes the job: the pool lease is released here and
    /// the reply takes the text buffers with it.
    pub fn finish(self, signals: &mut Producer<u8>) -> JobOutcome {
        let status = match (self.published, self.failure) {
            (Some(entry), _) => JobStatus::Published {
                entry,
                shape: self.shape.unwrap_or(ProgramShape {
                    param_count: 0,
                    input_count: 0,
                    output_count: 0,
                }),
            },
            (None, Some(JobFailure::Compile(err))) => JobStatus::CompileFailed(err),
            (None, Some(JobFailure::RegistryFull)) => JobStatus::RegistryFull,
            (None, None) => JobStatus::Incomplete { stage: self.stage },
        };
        drop(self.lease);
        signal_invariant(signals, INV_JOB_FINISHED);
        JobOutcome {
            key: self.key,
            name: self.name,
            status,
            leftovers: Leftovers {
                _source: self.source,
                _exchange_path: self.exchange_path,
                _program: self.compiled.map(|(program, _)| program),
            },
        }
    }
}

/// Run all four stages on the calling thread, in order.
///
/// For offline rendering and tests; a live host goes through
/// [`crate::scheduler`].
pub fn run_inline(
    mut job: CompileJob,
    ctx: &NrtContext<'_>,
    registry: &mut Registry,
    signals: &mut Producer<u8>,
) -> JobOutcome {
    job.compile(ctx);
    job.swap(registry, signals);
    job.cleanup_nrt();
    job.finish(signals)
}

fn introspect(
    ctx: &NrtContext<'_>,
    name: ProgramName,
    source: &str,
    exchange_path: &Path,
) -> Result<(CompiledProgram, ProgramShape), CompileError> {
    let args = ctx.settings.args();
    let mut factory = ctx
        .compiler
        .compile(&name.to_string(), source, &args, &ctx.settings.target)
        .map_err(|message| CompileError::Rejected { name, message })?;

    // The instance exists only to learn the control surface and channel counts.
    let instance = factory
        .create_instance()
        .ok_or(CompileError::NoInstance { name })?;
    let mut surface = DiscoverySurface::new();
    instance.build_user_interface(&mut surface);
    assert_invariant(
        SURFACE_DISCOVERED,
        true,
        "control surface walked",
        Some("stage 1"),
    );

    if !exchange_path.as_os_str().is_empty() {
        match write_param_names(exchange_path, surface.names()) {
            Ok(()) => {
                debug!(
                    path = %exchange_path.display(),
                    params = surface.len(),
                    "wrote exchange file"
                );
                assert_invariant(EXCHANGE_WRITTEN, true, "exchange file written", Some("stage 1"));
            }
            Err(err) => warn!(error = %err, "parameter export failed"),
        }
    }

    let shape = ProgramShape {
        param_count: surface.len(),
        input_count: instance.num_inputs(),
        output_count: instance.num_outputs(),
    };
    drop(instance);
    drop(surface);
    assert_invariant(
        INTROSPECTION_DISPOSED,
        true,
        "introspection instance dropped",
        Some("stage 1"),
    );

    factory.set_memory_manager(Arc::clone(ctx.pool));
    assert_invariant(
        FACTORY_ON_RT_ALLOCATOR,
        true,
        "factory switched to the rt pool",
        Some("stage 1"),
    );

    let mut program = CompiledProgram::new(name, factory);
    let wanted = ctx.settings.units_per_program;
    let prepared = program.prepare_slots(wanted, shape.param_count, ctx.pool);
    if prepared < wanted {
        warn!(program = %name, prepared, wanted, "not every unit slot could be prepared");
    }
    Ok((program, shape))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::ScriptCompiler;
    use crate::invariant_rt::new_invariant_queue;

    #[test]
    fn stages_refuse_to_run_out_of_order() {
        let compiler = ScriptCompiler::new();
        let settings = CompilerSettings::default();
        let pool = RtPool::new(1 << 16);
        let ctx = NrtContext {
            compiler: &compiler,
            settings: &settings,
            pool: &pool,
        };
        let (mut registry, _reclaimer) = Registry::new(4);
        let (mut tx, _rx) = new_invariant_queue();

        let request = CompileRequest::new(1, "", "outputs 1\n");
        let mut job = CompileJob::new(request, 48_000, &pool).unwrap();
        assert!(!job.swap(&mut registry, &mut tx));
        assert!(!job.cleanup_nrt());
        assert!(job.compile(&ctx));
        assert!(!job.compile(&ctx));
        assert_eq!(job.stage(), Stage::Swap);
        assert_eq!(job.stage().thread(), ThreadClass::Rt);
    }

    #[test]
    fn settings_put_library_path_first() {
        let settings = CompilerSettings {
            library_path: Some(PathBuf::from("/usr/share/dsp")),
            include_paths: vec![PathBuf::from("/home/me/lib")],
            ..CompilerSettings::default()
        };
        assert_eq!(
            settings.args(),
            vec!["-I", "/usr/share/dsp", "-I", "/home/me/lib"]
        );
    }

    #[test]
    fn early_finish_reports_incomplete() {
        let pool = RtPool::new(1 << 16);
        let (mut tx, _rx) = new_invariant_queue();
        let request = CompileRequest::new(2, "", "outputs 1\n");
        let job = CompileJob::new(request, 48_000, &pool).unwrap();
        let outcome = job.finish(&mut tx);
        assert!(matches!(
            outcome.status,
            JobStatus::Incomplete {
                stage: Stage::Compile
            }
        ));
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn request_larger_than_pool_is_refused() {
        let pool = RtPool::new(16);
        let request = CompileRequest::new(3, "", "x".repeat(64));
        let err = CompileJob::new(request, 48_000, &pool).unwrap_err();
        assert!(matches!(err, PoolError::Exhausted { .. }));
    }
}
