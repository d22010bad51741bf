//! Processing unit: one running instance of a published program.
//!
//! The host hands the unit a flat list of input channels laid out as
//!
//! ```text
//! [key, audio input count, parameter count,
//!  audio inputs...,
//!  (parameter position, parameter value) per parameter]
//! ```
//!
//! Everything that can be resolved from that header is resolved once, at
//! construction. The block path only copies control values into cells and
//! calls the program.
//!
//! Units never allocate. Each published program carries a stack of
//! [`UnitSlot`]s built on the NRT worker during compilation: an instance plus
//! its parameter tables. Construction pops a slot, teardown pushes it back,
//! and the slots leave the RT thread together with the program when it is
//! retired.

// IMPORTANT: Do not call assert_invariant or any PPT logging in RT paths to avoid locks/allocs.

use crate::compiler::DspInstance;
use crate::invariant_rt::{
    signal_invariant, INV_BLOCK_COMPUTED, INV_BLOCK_PANICKED, INV_BLOCK_SILENCED,
    INV_ENTRY_ACQUIRED, INV_ENTRY_DELETED, INV_ENTRY_RELEASED, INV_UNIT_BOUND,
    INV_UNIT_CHANNEL_MISMATCH, INV_UNIT_INPUT_MISMATCH, INV_UNIT_NO_INSTANCE,
    INV_UNIT_OUT_OF_MEMORY, INV_UNIT_UNKNOWN_PROGRAM,
};
use crate::pool::{PoolError, RtLease, RtPool};
use crate::registry::{EntryId, ProgramKey, Registry, Release};
use crate::surface::RtSurface;
use rtrb::Producer;
use std::ops::Range;
use std::sync::Arc;

pub const KEY_INPUT: usize = 0;
pub const AUDIO_COUNT_INPUT: usize = 1;
pub const PARAM_COUNT_INPUT: usize = 2;
pub const FIRST_AUDIO_INPUT: usize = 3;

/// Host input header of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitLayout {
    pub key: ProgramKey,
    pub audio_inputs: usize,
    pub params: usize,
}

impl UnitLayout {
    /// Read the header from the first sample of the first three inputs.
    pub fn read(inputs: &[&[f32]]) -> Option<Self> {
        let key = first_sample(inputs, KEY_INPUT)?;
        let audio_inputs = as_index(first_sample(inputs, AUDIO_COUNT_INPUT)?)?;
        let params = as_index(first_sample(inputs, PARAM_COUNT_INPUT)?)?;
        Some(Self {
            key: key as ProgramKey,
            audio_inputs,
            params,
        })
    }

    pub fn audio_range(&self) -> Range<usize> {
        FIRST_AUDIO_INPUT..FIRST_AUDIO_INPUT.saturating_add(self.audio_inputs)
    }

    /// Input carrying the position of parameter pair `pair`.
    pub fn position_input(&self, pair: usize) -> usize {
        FIRST_AUDIO_INPUT
            .saturating_add(self.audio_inputs)
            .saturating_add(pair.saturating_mul(2))
    }

    /// Input carrying the value of parameter pair `pair`.
    pub fn value_input(&self, pair: usize) -> usize {
        self.position_input(pair).saturating_add(1)
    }

    /// Number of inputs the header promises. Saturates for absurd headers.
    pub fn total_inputs(&self) -> usize {
        self.position_input(self.params)
    }
}

#[inline]
fn first_sample(inputs: &[&[f32]], index: usize) -> Option<f32> {
    inputs.get(index).and_then(|channel| channel.first()).copied()
}

fn as_index(value: f32) -> Option<usize> {
    (value.is_finite() && value >= 0.0).then_some(value as usize)
}

/// Why a unit emits silence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InertReason {
    /// The input header is missing or shorter than it claims.
    MalformedInputs,
    UnknownProgram { key: ProgramKey },
    ChannelMismatch { requested: usize, compiled: usize },
    InputMismatch { provided: usize, required: usize },
    /// Every prepared slot of the program is held by another unit.
    OutOfMemory,
    /// The factory refused an instance while the program's slots were prepared.
    NoInstance,
}

/// Everything a unit needs from the RT side to bind or unbind.
pub struct UnitContext<'a> {
    pub registry: &'a mut Registry,
    pub sample_rate: u32,
    pub signals: &'a mut Producer<u8>,
}

#[derive(Debug, Clone, Copy)]
struct ParamBinding {
    position: usize,
    value_input: usize,
}

/// An instance and the tables a unit runs it with, sized for the program's
/// parameter count.
pub struct UnitSlot {
    instance: Box<dyn DspInstance>,
    surface: RtSurface,
    bindings: Vec<ParamBinding>,
    _bindings_lease: RtLease,
}

impl UnitSlot {
    /// Wrap `instance`, reserving tables for `param_count` parameters. NRT only.
    pub fn new(
        instance: Box<dyn DspInstance>,
        param_count: usize,
        pool: &Arc<RtPool>,
    ) -> Result<Self, PoolError> {
        let surface = RtSurface::with_capacity(pool, param_count)?;
        let bindings_lease = pool.lease_array::<ParamBinding>(param_count)?;
        Ok(Self {
            instance,
            surface,
            bindings: Vec::with_capacity(param_count),
            _bindings_lease: bindings_lease,
        })
    }
}

impl std::fmt::Debug for UnitSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitSlot")
            .field("params", &self.surface.capacity())
            .finish()
    }
}

struct Bound {
    entry: EntryId,
    slot: UnitSlot,
    audio: Range<usize>,
}

enum UnitState {
    Ready(Bound),
    Inert(InertReason),
    TornDown,
}

/// A running instance bound to one registry entry, or an inert stand-in.
///
/// Tear it down with [`ProcessingUnit::teardown`]. Dropping a ready unit
/// without it leaves the registry entry referenced and trips a debug
/// assertion.
pub struct ProcessingUnit {
    state: UnitState,
    num_outputs: usize,
}

impl ProcessingUnit {
    /// Bind a new unit. Never fails: every problem yields an inert unit and
    /// one signal.
    pub fn new(ctx: &mut UnitContext<'_>, inputs: &[&[f32]], num_outputs: usize) -> Self {
        let state = match bind(ctx, inputs, num_outputs) {
            Ok(bound) => {
                signal_invariant(ctx.signals, INV_ENTRY_ACQUIRED);
                signal_invariant(ctx.signals, INV_UNIT_BOUND);
                UnitState::Ready(bound)
            }
            Err(reason) => {
                signal_invariant(ctx.signals, inert_signal(reason));
                UnitState::Inert(reason)
            }
        };
        Self { state, num_outputs }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, UnitState::Ready(_))
    }

    pub fn inert_reason(&self) -> Option<InertReason> {
        match self.state {
            UnitState::Inert(reason) => Some(reason),
            UnitState::Ready(_) | UnitState::TornDown => None,
        }
    }

    pub fn entry(&self) -> Option<EntryId> {
        match &self.state {
            UnitState::Ready(bound) => Some(bound.entry),
            UnitState::Inert(_) | UnitState::TornDown => None,
        }
    }

    pub fn num_outputs(&self) -> usize {
        self.num_outputs
    }

    /// Parameters with a driving input.
    pub fn bound_params(&self) -> usize {
        match &self.state {
            UnitState::Ready(bound) => bound.slot.bindings.len(),
            UnitState::Inert(_) | UnitState::TornDown => 0,
        }
    }

    /// Current value of the parameter at `position`.
    pub fn param(&self, position: usize) -> Option<f32> {
        match &self.state {
            UnitState::Ready(bound) => bound.slot.surface.zone(position).map(|zone| zone.get()),
            UnitState::Inert(_) | UnitState::TornDown => None,
        }
    }

    /// Render one block. Returns true if the program ran, false if silence
    /// was written.
    ///
    /// Does not allocate or lock.
    pub fn process(
        &mut self,
        frames: usize,
        inputs: &[&[f32]],
        outputs: &mut [&mut [f32]],
    ) -> bool {
        let frames = outputs
            .iter()
            .map(|channel| channel.len())
            .min()
            .map_or(0, |shortest| shortest.min(frames));

        let UnitState::Ready(bound) = &mut self.state else {
            silence(outputs, frames);
            return false;
        };
        if outputs.len() != self.num_outputs {
            silence(outputs, frames);
            return false;
        }
        let Some(audio) = inputs.get(bound.audio.clone()) else {
            silence(outputs, frames);
            return false;
        };
        if audio.iter().any(|channel| channel.len() < frames) {
            silence(outputs, frames);
            return false;
        }

        let slot = &mut bound.slot;
        for binding in &slot.bindings {
            if let (Some(zone), Some(value)) = (
                slot.surface.zone(binding.position),
                first_sample(inputs, binding.value_input),
            ) {
                zone.set(value);
            }
        }
        slot.instance.compute(frames, audio, outputs);
        true
    }

    /// Hand the slot back to the program and release the registry entry.
    ///
    /// Does not allocate or free: the slot stays with the program until the
    /// program itself is retired.
    pub fn teardown(
        mut self,
        registry: &mut Registry,
        signals: &mut Producer<u8>,
    ) -> Option<Release> {
        let UnitState::Ready(bound) = std::mem::replace(&mut self.state, UnitState::TornDown)
        else {
            return None;
        };
        let Bound { entry, slot, .. } = bound;
        if let Some(program) = registry.program_mut(entry) {
            // Cannot fail for a slot taken from this program.
            let _ = program.return_slot(slot);
        }
        match registry.release(entry) {
            Ok(Release::Deleted) => {
                signal_invariant(signals, INV_ENTRY_DELETED);
                Some(Release::Deleted)
            }
            Ok(retained) => {
                signal_invariant(signals, INV_ENTRY_RELEASED);
                Some(retained)
            }
            Err(_) => None,
        }
    }
}

/// Run [`ProcessingUnit::process`] with panic containment.
///
/// A panicking program leaves the block silent instead of taking the audio
/// thread down.
pub fn process_safe(
    unit: &mut ProcessingUnit,
    frames: usize,
    inputs: &[&[f32]],
    outputs: &mut [&mut [f32]],
    signals: &mut Producer<u8>,
) {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        unit.process(frames, inputs, outputs)
    }));
    match result {
        Ok(true) => signal_invariant(signals, INV_BLOCK_COMPUTED),
        Ok(false) => signal_invariant(signals, INV_BLOCK_SILENCED),
        Err(_) => {
            for channel in outputs.iter_mut() {
                channel.fill(0.0);
            }
            signal_invariant(signals, INV_BLOCK_PANICKED);
        }
    }
}

impl Drop for ProcessingUnit {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            debug_assert!(
                !matches!(self.state, UnitState::Ready(_)),
                "ready ProcessingUnit dropped without teardown"
            );
        }
    }
}

fn silence(outputs: &mut [&mut [f32]], frames: usize) {
    for channel in outputs.iter_mut() {
        channel[..frames].fill(0.0);
    }
}

fn inert_signal(reason: InertReason) -> u8 {
    match reason {
        InertReason::MalformedInputs | InertReason::InputMismatch { .. } => {
            INV_UNIT_INPUT_MISMATCH
        }
        InertReason::UnknownProgram { .. } => INV_UNIT_UNKNOWN_PROGRAM,
        InertReason::ChannelMismatch { .. } => INV_UNIT_CHANNEL_MISMATCH,
        InertReason::OutOfMemory => INV_UNIT_OUT_OF_MEMORY,
        InertReason::NoInstance => INV_UNIT_NO_INSTANCE,
    }
}

fn bind(
    ctx: &mut UnitContext<'_>,
    inputs: &[&[f32]],
    num_outputs: usize,
) -> Result<Bound, InertReason> {
    let layout = UnitLayout::read(inputs).ok_or(InertReason::MalformedInputs)?;
    if inputs.len() < layout.total_inputs() {
        return Err(InertReason::MalformedInputs);
    }
    let entry = ctx
        .registry
        .find(layout.key)
        .ok_or(InertReason::UnknownProgram { key: layout.key })?;
    let (input_count, output_count) = ctx
        .registry
        .entry(entry)
        .map(|e| (e.input_count(), e.output_count()))
        .ok_or(InertReason::UnknownProgram { key: layout.key })?;

    // An instance writes exactly `output_count` channels; any other count
    // would run past the host's buffers.
    if num_outputs != output_count {
        return Err(InertReason::ChannelMismatch {
            requested: num_outputs,
            compiled: output_count,
        });
    }
    if layout.audio_inputs < input_count {
        return Err(InertReason::InputMismatch {
            provided: layout.audio_inputs,
            required: input_count,
        });
    }

    let program = ctx
        .registry
        .program_mut(entry)
        .ok_or(InertReason::UnknownProgram { key: layout.key })?;
    let Some(mut slot) = program.take_slot() else {
        return Err(if program.instance_refused() {
            InertReason::NoInstance
        } else {
            InertReason::OutOfMemory
        });
    };
    if ctx.registry.acquire(entry).is_err() {
        if let Some(program) = ctx.registry.program_mut(entry) {
            let _ = program.return_slot(slot);
        }
        return Err(InertReason::UnknownProgram { key: layout.key });
    }

    slot.instance.init(ctx.sample_rate);
    slot.surface.clear();
    slot.instance.build_user_interface(&mut slot.surface);

    // One binding per position; a later pair for the same position wins.
    slot.bindings.clear();
    for pair in 0..layout.params {
        let Some(position) = first_sample(inputs, layout.position_input(pair))
            .and_then(as_index)
            .filter(|&p| p < slot.surface.len())
        else {
            continue;
        };
        let value_input = layout.value_input(pair);
        if let Some(existing) = slot.bindings.iter_mut().find(|b| b.position == position) {
            existing.value_input = value_input;
        } else if slot.bindings.len() < slot.bindings.capacity() {
            slot.bindings.push(ParamBinding {
                position,
                value_input,
            });
        }
    }

    let audio_start = layout.audio_range().start;
    Ok(Bound {
        entry,
        slot,
        audio: audio_start..audio_start + input_count,
    })
}
