//! Parameter surface builders.
//!
//! A compiled program declares its controls by walking a [`UiVisitor`].
//! Two visitors live here:
//!
//! - [`DiscoverySurface`] runs once per compile on the NRT worker and keeps
//!   the label of every addressable control, so clients can learn
//!   "name -> position".
//! - [`RtSurface`] runs at unit construction and keeps only the value cells,
//!   in the same order, inside a table sized once on the NRT side.
//!
//! Both see the same declaration order for instances of the same program,
//! which is what lets the RT side address parameters purely by position.

use crate::pool::{PoolError, RtLease, RtPool};
use atomic_float::AtomicF32;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// A live value cell inside a program instance.
///
/// The instance creates and owns the cell; surfaces only clone the handle.
#[derive(Debug, Clone)]
pub struct ParamZone(Arc<AtomicF32>);

impl ParamZone {
    /// Create a cell holding `init`.
    pub fn new(init: f32) -> Self {
        Self(Arc::new(AtomicF32::new(init)))
    }

    /// Current value.
    #[inline]
    pub fn get(&self) -> f32 {
        self.0.load(Ordering::Relaxed)
    }

    /// Overwrite the value.
    #[inline]
    pub fn set(&self, value: f32) {
        self.0.store(value, Ordering::Relaxed);
    }

    /// True if both handles point at the same cell.
    pub fn same_cell(&self, other: &ParamZone) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Slider/entry range as declared by the program.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlRange {
    pub init: f32,
    pub min: f32,
    pub max: f32,
    pub step: f32,
}

/// Layout boxes. They carry no value; visitors ignore them by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoxKind {
    Tab,
    Horizontal,
    Vertical,
}

/// Every control kind a program can declare.
#[derive(Debug)]
pub enum Control<'a> {
    Button {
        label: &'a str,
        zone: &'a ParamZone,
    },
    CheckButton {
        label: &'a str,
        zone: &'a ParamZone,
    },
    VerticalSlider {
        label: &'a str,
        zone: &'a ParamZone,
        range: ControlRange,
    },
    HorizontalSlider {
        label: &'a str,
        zone: &'a ParamZone,
        range: ControlRange,
    },
    NumEntry {
        label: &'a str,
        zone: &'a ParamZone,
        range: ControlRange,
    },
    HorizontalBargraph {
        label: &'a str,
        zone: &'a ParamZone,
        min: f32,
        max: f32,
    },
    VerticalBargraph {
        label: &'a str,
        zone: &'a ParamZone,
        min: f32,
        max: f32,
    },
    Soundfile {
        label: &'a str,
        filename: &'a str,
    },
}

impl<'a> Control<'a> {
    /// Label and cell of a control the host may drive, `None` for the rest.
    ///
    /// Only buttons and sliders are addressable.
    pub fn addressable(&self) -> Option<(&'a str, &'a ParamZone)> {
        match *self {
            Control::Button { label, zone }
            | Control::VerticalSlider { label, zone, .. }
            | Control::HorizontalSlider { label, zone, .. } => Some((label, zone)),
            Control::CheckButton { .. }
            | Control::NumEntry { .. }
            | Control::HorizontalBargraph { .. }
            | Control::VerticalBargraph { .. }
            | Control::Soundfile { .. } => None,
        }
    }
}

/// Walker a program instance drives to declare its controls.
pub trait UiVisitor {
    fn open_box(&mut self, _kind: BoxKind, _label: &str) {}
    fn close_box(&mut self) {}
    fn control(&mut self, control: Control<'_>);
}

/// NRT-side surface: labels and cells in declaration order.
#[derive(Debug, Default)]
pub struct DiscoverySurface {
    params: Vec<(String, ParamZone)>,
}

impl DiscoverySurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Labels in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|(name, _)| name.as_str())
    }

    pub fn zone(&self, position: usize) -> Option<&ParamZone> {
        self.params.get(position).map(|(_, zone)| zone)
    }

    /// Position of the first parameter labelled `name`.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.params.iter().position(|(label, _)| label == name)
    }
}

impl UiVisitor for DiscoverySurface {
    fn control(&mut self, control: Control<'_>) {
        if let Some((label, zone)) = control.addressable() {
            self.params.push((label.to_owned(), zone.clone()));
        }
    }
}

/// RT-side surface: a table of cells with a capacity fixed at construction.
///
/// The table never grows. Controls beyond the capacity are counted in
/// [`RtSurface::overflow`] and otherwise dropped.
#[derive(Debug)]
pub struct RtSurface {
    zones: Vec<ParamZone>,
    overflow: usize,
    _lease: RtLease,
}

impl RtSurface {
    /// Reserve room for `param_count` cells, charged to the RT pool.
    pub fn with_capacity(pool: &Arc<RtPool>, param_count: usize) -> Result<Self, PoolError> {
        let lease = pool.lease_array::<ParamZone>(param_count)?;
        Ok(Self {
            zones: Vec::with_capacity(param_count),
            overflow: 0,
            _lease: lease,
        })
    }

    #[inline]
    pub fn zone(&self, position: usize) -> Option<&ParamZone> {
        self.zones.get(position)
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.zones.capacity()
    }

    /// Addressable controls that did not fit.
    pub fn overflow(&self) -> usize {
        self.overflow
    }

    pub fn zones(&self) -> &[ParamZone] {
        &self.zones
    }

    /// Forget the collected cells, keeping the table. Does not allocate.
    pub fn clear(&mut self) {
        self.zones.clear();
        self.overflow = 0;
    }
}

impl UiVisitor for RtSurface {
    fn control(&mut self, control: Control<'_>) {
        if let Some((_, zone)) = control.addressable() {
            if self.zones.len() < self.zones.capacity() {
                self.zones.push(zone.clone());
            } else {
                self.overflow += 1;
            }
        }
    }
}
