//! Interface to the external just-in-time DSP compiler.
//!
//! The compiler turns source text into a factory; a factory creates any
//! number of independent instances. Nothing in this crate knows how
//! compilation works, it only reacts to success or failure.

use crate::pool::RtPool;
use crate::surface::UiVisitor;
use crate::unit::UnitSlot;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Compiler front-end. Called only on the NRT worker.
pub trait DspCompiler: Send + Sync {
    /// Compile `source` under `name`.
    ///
    /// `args` are compiler flags such as `-I <path>`. On failure the
    /// compiler's own message is returned.
    fn compile(
        &self,
        name: &str,
        source: &str,
        args: &[String],
        target: &str,
    ) -> Result<Box<dyn DspFactory>, String>;
}

/// A compiled program, able to create instances.
pub trait DspFactory: Send {
    fn name(&self) -> &str;

    /// Create a fresh instance with its own value cells. NRT only.
    ///
    /// Returns `None` when the factory's memory manager cannot satisfy the
    /// instance.
    fn create_instance(&self) -> Option<Box<dyn DspInstance>>;

    /// Route all future instance memory through the RT pool.
    fn set_memory_manager(&mut self, pool: Arc<RtPool>);
}

/// One running copy of a compiled program.
pub trait DspInstance: Send {
    fn num_inputs(&self) -> usize;
    fn num_outputs(&self) -> usize;

    /// Reset all state, control values included. Runs on the RT thread
    /// whenever a unit takes the instance, so it must not allocate.
    fn init(&mut self, sample_rate: u32);

    /// Declare every control, in a stable order, to `ui`.
    fn build_user_interface(&self, ui: &mut dyn UiVisitor);

    /// Render `frames` samples. `inputs` has `num_inputs()` channels and
    /// `outputs` has `num_outputs()` channels, each at least `frames` long.
    fn compute(&mut self, frames: usize, inputs: &[&[f32]], outputs: &mut [&mut [f32]]);
}

static NEXT_PROGRAM_ID: AtomicU64 = AtomicU64::new(1);

/// Unique program name handed to the compiler.
///
/// The compiler caches factories by name, so every compile needs a name it
/// has never seen. Ids come from a process-wide counter and never repeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgramName(u64);

impl ProgramName {
    pub const PREFIX: &'static str = "dspswap";

    /// Draw the next name.
    pub fn next() -> Self {
        Self(NEXT_PROGRAM_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ProgramName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", Self::PREFIX, self.0)
    }
}

/// A factory together with the name it was compiled under, and the unit
/// slots prepared for it on the NRT side.
pub struct CompiledProgram {
    name: ProgramName,
    // Declared before `factory`: instances go before the factory that made them.
    slots: Vec<UnitSlot>,
    instance_refused: bool,
    factory: Box<dyn DspFactory>,
}

impl CompiledProgram {
    pub fn new(name: ProgramName, factory: Box<dyn DspFactory>) -> Self {
        Self {
            name,
            slots: Vec::new(),
            instance_refused: false,
            factory,
        }
    }

    pub fn name(&self) -> ProgramName {
        self.name
    }

    pub fn factory(&self) -> &dyn DspFactory {
        self.factory.as_ref()
    }

    pub fn factory_mut(&mut self) -> &mut dyn DspFactory {
        self.factory.as_mut()
    }

    pub fn create_instance(&self) -> Option<Box<dyn DspInstance>> {
        self.factory.create_instance()
    }

    /// Build up to `count` unit slots for `param_count` parameters, charged
    /// to `pool`. NRT only. Returns how many were built.
    ///
    /// Stops early when the pool runs dry or the factory refuses an instance.
    pub fn prepare_slots(&mut self, count: usize, param_count: usize, pool: &Arc<RtPool>) -> usize {
        self.slots = Vec::with_capacity(count);
        while self.slots.len() < count {
            let Some(instance) = self.factory.create_instance() else {
                self.instance_refused = true;
                break;
            };
            match UnitSlot::new(instance, param_count, pool) {
                Ok(slot) => self.slots.push(slot),
                Err(_) => break,
            }
        }
        self.slots.len()
    }

    /// Slots not held by a unit.
    pub fn spare_slots(&self) -> usize {
        self.slots.len()
    }

    /// Slots this program can ever hand out at once.
    pub fn slot_capacity(&self) -> usize {
        self.slots.capacity()
    }

    /// True if the factory refused an instance while slots were prepared.
    pub fn instance_refused(&self) -> bool {
        self.instance_refused
    }

    /// Hand a prepared slot to a unit. Does not allocate.
    pub fn take_slot(&mut self) -> Option<UnitSlot> {
        self.slots.pop()
    }

    /// Give a slot back. Slots only come from [`CompiledProgram::take_slot`],
    /// so there is always room and this does not allocate.
    pub fn return_slot(&mut self, slot: UnitSlot) -> Result<(), UnitSlot> {
        if self.slots.len() == self.slots.capacity() {
            return Err(slot);
        }
        self.slots.push(slot);
        Ok(())
    }
}

impl fmt::Debug for CompiledProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledProgram")
            .field("name", &self.name)
            .field("spare_slots", &self.slots.len())
            .field("factory", &self.factory.name())
            .finish()
    }
}

/// Errors produced by stage 1.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    /// The compiler rejected the source.
    #[error("compiler rejected {name}: {message}")]
    Rejected { name: ProgramName, message: String },
    /// The factory compiled but could not create its introspection instance.
    #[error("{name} compiled but no instance could be created")]
    NoInstance { name: ProgramName },
}
