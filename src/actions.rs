use std::fmt;

use anyhow::Result;

use crate::env::{Environment, Obs, Step};

/// Native NES joypad buttons, in press-vector order.
pub const NES_BUTTONS: [&str; 8] = [
    "B", "A", "SELECT", "START", "UP", "DOWN", "LEFT", "RIGHT",
];

// =============================================================================
// Action Maps
// =============================================================================

/// Maps a curated action list onto native button press vectors.
///
/// Each action is a button combination ("RIGHT"+"A", say). The policy emits
/// one Bernoulli gate per action; executing a gate vector presses the union
/// of every fired action's buttons. An all-false gate vector is a no-op.
#[derive(Debug)]
pub struct ActionMap {
    buttons: Vec<String>,
    presses: Vec<Vec<bool>>,
}

impl ActionMap {
    pub fn new(buttons: &[&str], actions: &[&[&str]]) -> Result<Self, InvalidActionError> {
        let mut presses = Vec::with_capacity(actions.len());
        for (action_index, combo) in actions.iter().enumerate() {
            let mut row = vec![false; buttons.len()];
            for name in *combo {
                let slot = buttons
                    .iter()
                    .position(|b| b.eq_ignore_ascii_case(name))
                    .ok_or_else(|| InvalidActionError {
                        action_index,
                        button: (*name).to_string(),
                    })?;
                row[slot] = true;
            }
            presses.push(row);
        }
        Ok(Self {
            buttons: buttons.iter().map(|b| (*b).to_string()).collect(),
            presses,
        })
    }

    pub fn num_actions(&self) -> usize {
        self.presses.len()
    }

    pub fn num_buttons(&self) -> usize {
        self.buttons.len()
    }

    /// Press vector for a single action. Returns a fresh copy each call, so
    /// callers may mutate the result without touching the table.
    pub fn action(&self, index: usize) -> Vec<bool> {
        self.presses[index].clone()
    }

    /// Union of the press vectors of every fired gate.
    pub fn buttons_for(&self, gates: &[bool]) -> Vec<bool> {
        debug_assert_eq!(gates.len(), self.presses.len());
        let mut out = vec![false; self.buttons.len()];
        for (row, &fired) in self.presses.iter().zip(gates) {
            if fired {
                for (slot, &pressed) in out.iter_mut().zip(row) {
                    *slot |= pressed;
                }
            }
        }
        out
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvalidActionError {
    pub action_index: usize,
    pub button: String,
}

impl fmt::Display for InvalidActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "action {} presses unknown button {:?}",
            self.action_index, self.button
        )
    }
}

impl std::error::Error for InvalidActionError {}

// =============================================================================
// Adapter Stage
// =============================================================================

/// Environment stage that translates curated-action gate vectors into native
/// button presses before stepping the wrapped environment.
pub struct ActionAdapter<E> {
    env: E,
    map: ActionMap,
}

impl<E: Environment> ActionAdapter<E> {
    pub fn new(env: E, map: ActionMap) -> Self {
        Self { env, map }
    }

    pub fn into_inner(self) -> E {
        self.env
    }
}

impl<E: Environment> Environment for ActionAdapter<E> {
    fn reset(&mut self) -> Result<Obs> {
        self.env.reset()
    }

    fn step(&mut self, action: &[bool]) -> Result<Step> {
        let buttons = self.map.buttons_for(action);
        self.env.step(&buttons)
    }

    fn obs_shape(&self) -> (usize, usize, usize) {
        self.env.obs_shape()
    }

    fn num_actions(&self) -> usize {
        self.map.num_actions()
    }
}
