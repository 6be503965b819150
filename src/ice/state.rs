// src/ice/state.rs
//! ICE connection states and per-component aggregation
//!
//! Each component reports its own progress; the connection-level state is a
//! fold over all components:
//! - `Failed` if any component failed
//! - `Ready` once every component is `Ready` or later
//! - otherwise the least advanced component state
//!
//! `Finished` is never produced by the fold; it only comes from an explicit
//! teardown of the connection.

use std::fmt;
use serde::{Serialize, Deserialize};

use crate::error::{IceError, IceResult};
use super::ComponentId;

/// ICE state, ordered by lifecycle progress
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum IceState {
    /// Nothing gathered yet
    #[default]
    Initial = 0,
    /// Local candidates gathered
    CandidatesGathered = 1,
    /// Remote candidates received, checks running
    CandidatesReceived = 2,
    /// Connectivity established
    Ready = 3,
    /// Connection torn down normally
    Finished = 4,
    /// Connectivity could not be established
    Failed = 5,
}

impl IceState {
    /// `Finished` and `Failed` absorb every later transition
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}

impl fmt::Display for IceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::Initial => "Initial",
            Self::CandidatesGathered => "CandidatesGathered",
            Self::CandidatesReceived => "CandidatesReceived",
            Self::Ready => "Ready",
            Self::Finished => "Finished",
            Self::Failed => "Failed",
        };
        write!(f, "{s}")
    }
}

impl From<u8> for IceState {
    fn from(v: u8) -> Self {
        match v {
            1 => Self::CandidatesGathered,
            2 => Self::CandidatesReceived,
            3 => Self::Ready,
            4 => Self::Finished,
            5 => Self::Failed,
            _ => Self::Initial,
        }
    }
}

/// Fixed-size table of component states with a cached aggregate
#[derive(Debug, Clone)]
pub struct ComponentStateTracker {
    /// Slot `i` holds component `i + 1`
    states: Vec<IceState>,
    aggregate: IceState,
}

impl ComponentStateTracker {
    /// Create tracker with `components` slots, all `Initial`
    pub fn new(components: u32) -> Self {
        Self {
            states: vec![IceState::Initial; components as usize],
            aggregate: IceState::Initial,
        }
    }

    /// Number of tracked components
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Current aggregate state
    pub fn aggregate(&self) -> IceState {
        self.aggregate
    }

    /// State of one component
    pub fn get(&self, component_id: ComponentId) -> Option<IceState> {
        self.slot(component_id).map(|i| self.states[i])
    }

    /// All component states, ordered by component id
    pub fn states(&self) -> &[IceState] {
        &self.states
    }

    /// Record a component state and recompute the aggregate.
    ///
    /// Returns whether the aggregate changed and its new value. A component
    /// that already failed keeps `Failed`.
    pub fn update(&mut self, component_id: ComponentId, state: IceState) -> IceResult<(bool, IceState)> {
        let index = self.slot(component_id).ok_or(IceError::InvalidComponent {
            component_id,
            components: self.states.len() as u32,
        })?;

        if self.states[index] != IceState::Failed {
            self.states[index] = state;
        }

        Ok(self.recompute())
    }

    /// Lift every component below `floor` up to it
    pub fn raise_all(&mut self, floor: IceState) -> (bool, IceState) {
        for state in self.states.iter_mut() {
            if *state < floor {
                *state = floor;
            }
        }
        self.recompute()
    }

    fn recompute(&mut self) -> (bool, IceState) {
        let aggregate = fold_states(&self.states);
        let changed = aggregate != self.aggregate;
        self.aggregate = aggregate;
        (changed, aggregate)
    }

    fn slot(&self, component_id: ComponentId) -> Option<usize> {
        let index = (component_id as usize).checked_sub(1)?;
        (index < self.states.len()).then_some(index)
    }
}

/// Aggregate a set of component states
pub fn fold_states(states: &[IceState]) -> IceState {
    if states.iter().any(|s| *s == IceState::Failed) {
        return IceState::Failed;
    }

    if !states.is_empty() && states.iter().all(|s| *s >= IceState::Ready) {
        return IceState::Ready;
    }

    states.iter().copied().min().unwrap_or(IceState::Initial)
}
