//! The six I/O sides of a computer.

use std::any::Any;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A face of the computer block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComputerSide {
    Bottom,
    Top,
    Back,
    Front,
    Right,
    Left,
}

impl ComputerSide {
    pub const ALL: [ComputerSide; 6] = [
        ComputerSide::Bottom,
        ComputerSide::Top,
        ComputerSide::Back,
        ComputerSide::Front,
        ComputerSide::Right,
        ComputerSide::Left,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ComputerSide::Bottom => "bottom",
            ComputerSide::Top => "top",
            ComputerSide::Back => "back",
            ComputerSide::Front => "front",
            ComputerSide::Right => "right",
            ComputerSide::Left => "left",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ComputerSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ComputerSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ComputerSide::ALL
            .into_iter()
            .find(|side| side.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Invalid side '{s}'"))
    }
}

/// A peripheral attached to a side. Its methods are opaque to the core.
pub type Peripheral = Arc<dyn Any + Send + Sync>;

#[derive(Default)]
struct Side {
    input: u8,
    output: u8,
    peripheral: Option<Peripheral>,
}

#[derive(Default)]
struct Sides {
    sides: [Side; 6],
    output_changed: bool,
}

/// A change the host should turn into an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum EnvironmentChange {
    Redstone,
    PeripheralAttached(ComputerSide),
    PeripheralDetached(ComputerSide),
}

/// Redstone levels and peripherals on each side.
///
/// Levels are clamped to `0..=15`.
#[derive(Default)]
pub struct Environment {
    inner: Mutex<Sides>,
    changes: Mutex<Vec<EnvironmentChange>>,
}

impl Environment {
    fn sides(&self) -> MutexGuard<'_, Sides> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, change: EnvironmentChange) {
        self.changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(change);
    }

    /// Redstone level the world applies to `side`.
    pub fn redstone_input(&self, side: ComputerSide) -> u8 {
        self.sides().sides[side.index()].input
    }

    /// Set by the host when the world's signal changes.
    pub fn set_redstone_input(&self, side: ComputerSide, level: u8) {
        let level = level.min(15);
        let changed = {
            let mut sides = self.sides();
            let slot = &mut sides.sides[side.index()];
            std::mem::replace(&mut slot.input, level) != level
        };
        if changed {
            self.record(EnvironmentChange::Redstone);
        }
    }

    /// Redstone level the computer emits on `side`.
    pub fn redstone_output(&self, side: ComputerSide) -> u8 {
        self.sides().sides[side.index()].output
    }

    /// Set by the machine through an API.
    pub fn set_redstone_output(&self, side: ComputerSide, level: u8) {
        let level = level.min(15);
        let mut sides = self.sides();
        let slot = &mut sides.sides[side.index()];
        if slot.output != level {
            slot.output = level;
            sides.output_changed = true;
        }
    }

    /// Whether outputs changed since the last call. The host uses this to
    /// propagate signals into the world.
    pub fn take_output_changed(&self) -> bool {
        std::mem::take(&mut self.sides().output_changed)
    }

    /// The peripheral attached to `side`.
    pub fn peripheral(&self, side: ComputerSide) -> Option<Peripheral> {
        self.sides().sides[side.index()].peripheral.clone()
    }

    /// Attach or detach a peripheral.
    pub fn set_peripheral(&self, side: ComputerSide, peripheral: Option<Peripheral>) {
        let change = {
            let mut sides = self.sides();
            let slot = &mut sides.sides[side.index()];
            let previous = std::mem::replace(&mut slot.peripheral, peripheral);
            match (previous.is_some(), slot.peripheral.is_some()) {
                (_, true) => Some(EnvironmentChange::PeripheralAttached(side)),
                (true, false) => Some(EnvironmentChange::PeripheralDetached(side)),
                (false, false) => None,
            }
        };
        if let Some(change) = change {
            self.record(change);
        }
    }

    /// Clear all outputs, on shutdown.
    pub(crate) fn reset_output(&self) {
        let mut sides = self.sides();
        let mut changed = false;
        for side in sides.sides.iter_mut() {
            changed |= side.output != 0;
            side.output = 0;
        }
        sides.output_changed |= changed;
    }

    pub(crate) fn take_changes(&self) -> Vec<EnvironmentChange> {
        std::mem::take(&mut *self.changes.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sides = self.sides();
        f.debug_map()
            .entries(ComputerSide::ALL.iter().map(|side| {
                let slot = &sides.sides[side.index()];
                (side.name(), (slot.input, slot.output, slot.peripheral.is_some()))
            }))
            .finish()
    }
}
