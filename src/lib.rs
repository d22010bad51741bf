//! Real-time-safe compile and hot-swap pipeline for JIT-compiled DSP programs.
//!
//! A program is compiled on a non-real-time worker, published into a
//! [`Registry`] between audio blocks, and run by any number of
//! [`ProcessingUnit`]s that share it. Deleting a program that is still in
//! use is deferred until its last unit lets go.

pub mod compiler;
pub mod config;
pub mod exchange;
#[doc(hidden)]
pub mod harness;
pub mod host;
#[doc(hidden)]
pub mod invariant_ppt;
pub mod invariant_rt;
pub mod pipeline;
pub mod pool;
pub mod registry;
pub mod scheduler;
pub mod surface;
pub mod unit;

pub use compiler::{
    CompileError, CompiledProgram, DspCompiler, DspFactory, DspInstance, ProgramName,
};
pub use config::{ConfigError, EngineConfig};
pub use host::{launch, Client, Command, Server, SubmitError};
pub use pipeline::{CompileJob, CompileRequest, JobOutcome, JobStatus, Stage};
pub use pool::{PoolError, RtPool};
pub use registry::{EntryId, ProgramKey, Reclaimer, Registry, Release};
pub use surface::{Control, ParamZone, UiVisitor};
pub use unit::{process_safe, InertReason, ProcessingUnit, UnitLayout, UnitSlot};
