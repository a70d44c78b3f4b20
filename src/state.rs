//! Departure detection.
//!
//! | Phase     | band          | misses vs K | Next      | Action |
//! |-----------|---------------|-------------|-----------|--------|
//! | any       | Near / Far    |             | Home      |        |
//! | Home      | VeryFar / Unk | < K         | Departing |        |
//! | Home      | VeryFar / Unk | >= K        | Departed  | Lock   |
//! | Departing | VeryFar / Unk | < K         | Departing |        |
//! | Departing | VeryFar / Unk | >= K        | Departed  | Lock   |
//! | Departed  | VeryFar / Unk |             | Departed  |        |
//!
//! A "miss" is a VeryFar or Unknown band. Unknown means the sampler could not
//! read the device at all, which counts exactly like VeryFar so that an
//! unreachable device still ends in a lock.

use std::fmt;

use serde_derive::Serialize;

use crate::classifier::ProximityBand;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Device confirmed Near or Far.
    Home,
    /// Misses observed, fewer than the trigger count.
    Departing,
    /// Trigger reached; lock already requested for this episode.
    Departed,
}

impl Phase {
    /// Presence confidence reported alongside the phase.
    pub fn confidence(&self) -> u8 {
        match self {
            Phase::Home => 100,
            Phase::Departing => 50,
            Phase::Departed => 0,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Home => "home",
            Phase::Departing => "departing",
            Phase::Departed => "departed",
        };
        f.write_str(name)
    }
}

/// What the scheduler should do after a tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Nothing,
    Lock,
}

/// Everything carried from one tick to the next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MonitorState {
    pub phase: Phase,
    pub band: ProximityBand,
    /// Consecutive ticks spent in `band`, including the latest.
    pub consecutive_band: u32,
    /// Consecutive VeryFar/Unknown ticks in the current episode.
    pub consecutive_misses: u32,
    /// Consecutive ticks without any reading (Unknown only).
    pub consecutive_failures: u32,
    /// Band of the most recent actual reading. Survives dropouts so the
    /// classifier keeps its hysteresis across an absent sample.
    pub last_signal_band: ProximityBand,
    pub locked_for_this_departure: bool,
}

impl Default for MonitorState {
    fn default() -> Self {
        MonitorState {
            phase: Phase::Home,
            band: ProximityBand::Unknown,
            consecutive_band: 0,
            consecutive_misses: 0,
            consecutive_failures: 0,
            last_signal_band: ProximityBand::Unknown,
            locked_for_this_departure: false,
        }
    }
}

/// Folds one classified band into `state`.
///
/// `trigger` is the number of consecutive misses needed to lock (K). A
/// `Lock` action is returned at most once per departure episode; a Near or
/// Far band ends the episode.
pub fn advance(state: MonitorState, band: ProximityBand, trigger: u32) -> (MonitorState, Action) {
    let consecutive_band = if band == state.band {
        state.consecutive_band.saturating_add(1)
    } else {
        1
    };
    let (consecutive_failures, last_signal_band) = match band {
        ProximityBand::Unknown => (state.consecutive_failures.saturating_add(1), state.last_signal_band),
        _ => (0, band),
    };

    if band.is_present() {
        let next = MonitorState {
            phase: Phase::Home,
            band,
            consecutive_band,
            consecutive_misses: 0,
            consecutive_failures,
            last_signal_band,
            locked_for_this_departure: false,
        };
        return (next, Action::Nothing);
    }

    let misses = state.consecutive_misses.saturating_add(1);
    let mut next = MonitorState {
        band,
        consecutive_band,
        consecutive_misses: misses,
        consecutive_failures,
        last_signal_band,
        ..state
    };

    let action = match state.phase {
        Phase::Home | Phase::Departing if misses >= trigger => {
            next.phase = Phase::Departed;
            if state.locked_for_this_departure {
                Action::Nothing
            } else {
                next.locked_for_this_departure = true;
                Action::Lock
            }
        }
        Phase::Home | Phase::Departing => {
            next.phase = Phase::Departing;
            Action::Nothing
        }
        Phase::Departed => Action::Nothing,
    };

    (next, action)
}
