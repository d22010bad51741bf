//! Compiled-program registry.
//!
//! A fixed-capacity slot arena of published programs, written only by the RT
//! thread. Entries are reference counted by the units that run them; a
//! delete request on a referenced entry is deferred until the last unit lets
//! go. Deleted programs are never dropped here: they go into a wait-free
//! retire queue and a [`Reclaimer`] drops them off the RT thread.

// IMPORTANT: Do not call assert_invariant or any PPT logging in RT paths to avoid locks/allocs.

use crate::compiler::CompiledProgram;
use rtrb::{Consumer, Producer, PushError, RingBuffer};
use thiserror::Error;
use tracing::debug;

/// Host-supplied lookup key. Not required to be unique.
pub type ProgramKey = i32;

/// Stable handle to one registry slot.
///
/// The generation changes whenever the slot is freed, so a handle to a
/// deleted entry never aliases a newer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId {
    index: u32,
    generation: u32,
}

impl EntryId {
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

/// A published program and its metadata.
#[derive(Debug)]
pub struct RegistryEntry {
    key: ProgramKey,
    program: CompiledProgram,
    param_count: usize,
    input_count: usize,
    output_count: usize,
    ref_count: u32,
    pending_deletion: bool,
    sequence: u64,
}

impl RegistryEntry {
    pub fn key(&self) -> ProgramKey {
        self.key
    }

    pub fn program(&self) -> &CompiledProgram {
        &self.program
    }

    pub fn param_count(&self) -> usize {
        self.param_count
    }

    pub fn input_count(&self) -> usize {
        self.input_count
    }

    pub fn output_count(&self) -> usize {
        self.output_count
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    pub fn pending_deletion(&self) -> bool {
        self.pending_deletion
    }
}

/// Shape of a program being published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramShape {
    pub param_count: usize,
    pub input_count: usize,
    pub output_count: usize,
}

/// Result of a successful [`Registry::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// The entry is still alive.
    Retained { remaining: u32 },
    /// The count hit zero on a pending entry, which is now gone.
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("registry entry {0:?} no longer exists")]
    StaleEntry(EntryId),
    #[error("reference count of {0:?} is already zero")]
    Underflow(EntryId),
}

/// Publishing failed because every slot is taken.
///
/// The program is handed back so it can be dropped off the RT thread.
#[derive(Debug, Error)]
#[error("registry is full ({capacity} slots)")]
pub struct RegistryFull {
    pub program: CompiledProgram,
    pub capacity: usize,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    entry: Option<RegistryEntry>,
}

/// The program registry. Single writer: the RT thread.
#[derive(Debug)]
pub struct Registry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
    next_sequence: u64,
    retired: Producer<CompiledProgram>,
    dropped_inline: usize,
}

impl Registry {
    /// Build a registry with `capacity` slots.
    ///
    /// All storage is reserved here, on the NRT side; nothing the RT thread
    /// calls afterwards allocates.
    pub fn new(capacity: usize) -> (Self, Reclaimer) {
        let slots = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                entry: None,
            })
            .collect();
        let free = (0..capacity as u32).rev().collect();
        let (retired, rx) = RingBuffer::new(capacity.max(1));
        (
            Self {
                slots,
                free,
                live: 0,
                next_sequence: 0,
                retired,
                dropped_inline: 0,
            },
            Reclaimer {
                retired: rx,
                reclaimed: 0,
            },
        )
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of live entries, pending ones included.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Programs that had to be dropped on the RT thread because the retire
    /// queue was full.
    pub fn dropped_inline(&self) -> usize {
        self.dropped_inline
    }

    /// Insert `program` as the newest entry for `key`.
    ///
    /// Older entries with the same key stay where they are; [`Registry::find`]
    /// simply prefers the newest.
    pub fn publish(
        &mut self,
        key: ProgramKey,
        program: CompiledProgram,
        shape: ProgramShape,
    ) -> Result<EntryId, RegistryFull> {
        let Some(index) = self.free.pop() else {
            return Err(RegistryFull {
                program,
                capacity: self.slots.len(),
            });
        };
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let slot = &mut self.slots[index as usize];
        slot.entry = Some(RegistryEntry {
            key,
            program,
            param_count: shape.param_count,
            input_count: shape.input_count,
            output_count: shape.output_count,
            ref_count: 0,
            pending_deletion: false,
            sequence,
        });
        self.live += 1;
        Ok(EntryId {
            index,
            generation: slot.generation,
        })
    }

    /// Newest entry published under `key`, if any.
    pub fn find(&self, key: ProgramKey) -> Option<EntryId> {
        let mut best: Option<(u64, EntryId)> = None;
        for (index, slot) in self.slots.iter().enumerate() {
            if let Some(entry) = &slot.entry {
                if entry.key == key && best.map_or(true, |(seq, _)| entry.sequence > seq) {
                    best = Some((
                        entry.sequence,
                        EntryId {
                            index: index as u32,
                            generation: slot.generation,
                        },
                    ));
                }
            }
        }
        best.map(|(_, id)| id)
    }

    pub fn entry(&self, id: EntryId) -> Option<&RegistryEntry> {
        self.slots
            .get(id.index())
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_ref())
    }

    fn entry_mut(&mut self, id: EntryId) -> Result<&mut RegistryEntry, RegistryError> {
        self.slots
            .get_mut(id.index())
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_mut())
            .ok_or(RegistryError::StaleEntry(id))
    }

    /// Mutable access to an entry's program, for handing unit slots in and
    /// out.
    pub fn program_mut(&mut self, id: EntryId) -> Option<&mut CompiledProgram> {
        self.entry_mut(id).ok().map(|entry| &mut entry.program)
    }

    /// A unit starts using the entry.
    pub fn acquire(&mut self, id: EntryId) -> Result<u32, RegistryError> {
        let entry = self.entry_mut(id)?;
        entry.ref_count += 1;
        Ok(entry.ref_count)
    }

    /// A unit stops using the entry. Finishes a deferred delete when the
    /// count reaches zero.
    pub fn release(&mut self, id: EntryId) -> Result<Release, RegistryError> {
        let entry = self.entry_mut(id)?;
        if entry.ref_count == 0 {
            return Err(RegistryError::Underflow(id));
        }
        entry.ref_count -= 1;
        if entry.ref_count == 0 && entry.pending_deletion {
            self.delete_slot(id.index());
            return Ok(Release::Deleted);
        }
        Ok(Release::Retained {
            remaining: entry.ref_count,
        })
    }

    /// Mark every entry published under `key` for deletion.
    ///
    /// Unreferenced entries go immediately. Returns how many were marked.
    pub fn request_delete(&mut self, key: ProgramKey) -> usize {
        self.mark_where(|entry| entry.key == key)
    }

    /// Mark every entry for deletion.
    pub fn request_delete_all(&mut self) -> usize {
        self.mark_where(|_| true)
    }

    fn mark_where(&mut self, matches: impl Fn(&RegistryEntry) -> bool) -> usize {
        let mut marked = 0;
        for index in 0..self.slots.len() {
            let delete_now = match self.slots[index].entry.as_mut() {
                Some(entry) if matches(&*entry) => {
                    entry.pending_deletion = true;
                    marked += 1;
                    entry.ref_count == 0
                }
                _ => false,
            };
            if delete_now {
                self.delete_slot(index);
            }
        }
        marked
    }

    fn delete_slot(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        let Some(entry) = slot.entry.take() else {
            return;
        };
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index as u32);
        self.live -= 1;
        if let Err(PushError::Full(program)) = self.retired.push(entry.program) {
            self.dropped_inline += 1;
            drop(program);
        }
    }

    /// Live entries, oldest slot first.
    pub fn iter(&self) -> impl Iterator<Item = (EntryId, &RegistryEntry)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.entry.as_ref().map(|entry| {
                (
                    EntryId {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    entry,
                )
            })
        })
    }
}

/// NRT-side end of the retire queue.
#[derive(Debug)]
pub struct Reclaimer {
    retired: Consumer<CompiledProgram>,
    reclaimed: usize,
}

impl Reclaimer {
    /// Drop every retired program. Returns how many were dropped.
    pub fn collect(&mut self) -> usize {
        let mut count = 0;
        while let Ok(program) = self.retired.pop() {
            debug!(program = %program.name(), "reclaimed compiled program");
            drop(program);
            count += 1;
        }
        self.reclaimed += count;
        count
    }

    /// Programs waiting to be dropped.
    pub fn pending(&self) -> usize {
        self.retired.slots()
    }

    /// Total programs dropped by this reclaimer.
    pub fn reclaimed(&self) -> usize {
        self.reclaimed
    }
}
