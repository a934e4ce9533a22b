use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

use crate::error::{PopdynResult, TaskError};

/// Reserved sentinel id for the external (open world) state.
///
/// A source or sink whose population is not tracked: it never gets a column
/// in the grid and is never read or written.
pub const EXTERNAL_ID: i32 = -1;

/// A named compartment holding a (possibly fractional) population count.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub id: i32,
    pub name: String,
    /// Initial population at step 0. Non-negative, fractional allowed.
    pub count: f64,
}

impl State {
    pub fn new(id: i32, name: impl Into<String>, count: f64) -> Self {
        Self {
            id,
            name: name.into(),
            count,
        }
    }
}

/// The form of the flow-rate function.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString, EnumIter, Serialize, Deserialize,
)]
pub enum TransitionKind {
    /// Flow proportional to the smaller of the participating counts.
    Linear,
    /// Mass-action flow normalized by the total population.
    Solute,
    /// Mass-action flow normalized by the participating counts only.
    Blend,
}

/// The commit policy: how the flow is debited and how probability composes
/// with the operand density.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString, EnumIter, Serialize, Deserialize,
)]
pub enum TransitionMode {
    /// Debit the operand, leave the source untouched.
    Simple,
    /// Touch neither source nor operand.
    Retaining,
    /// Debit both source and operand.
    Removing,
    /// Invert against the operand density before probability scaling.
    Inhibitor,
    /// Invert against the operand density after probability scaling.
    Residual,
}

/// An immutable rule describing population flow from a source (and/or
/// operand) to a result state, applied once per step.
///
/// Any of the three state references may be [`EXTERNAL_ID`]. Delays are
/// per-read lookbacks in steps; reads beyond history resolve to step 0.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub source: i32,
    pub source_coefficient: f64,
    pub source_delay: u32,
    pub operand: i32,
    pub operand_coefficient: f64,
    pub operand_delay: u32,
    pub result: i32,
    pub result_coefficient: f64,
    pub probability: f64,
    pub kind: TransitionKind,
    pub mode: TransitionMode,
}

impl Transition {
    /// A `Linear`/`Simple` transition with unit coefficients, no delays and
    /// probability 1. Shape it with the `with_*` builders.
    pub fn new(source: i32, operand: i32, result: i32) -> Self {
        Self {
            source,
            source_coefficient: 1.0,
            source_delay: 0,
            operand,
            operand_coefficient: 1.0,
            operand_delay: 0,
            result,
            result_coefficient: 1.0,
            probability: 1.0,
            kind: TransitionKind::Linear,
            mode: TransitionMode::Simple,
        }
    }

    pub fn with_kind(self, kind: TransitionKind) -> Self {
        Self { kind, ..self }
    }

    pub fn with_mode(self, mode: TransitionMode) -> Self {
        Self { mode, ..self }
    }

    pub fn with_probability(self, probability: f64) -> Self {
        Self {
            probability,
            ..self
        }
    }

    pub fn with_coefficients(self, source: f64, operand: f64, result: f64) -> Self {
        Self {
            source_coefficient: source,
            operand_coefficient: operand,
            result_coefficient: result,
            ..self
        }
    }

    pub fn with_delays(self, source_delay: u32, operand_delay: u32) -> Self {
        Self {
            source_delay,
            operand_delay,
            ..self
        }
    }
}

/// A complete simulation request: the ordered state list, the ordered rule
/// book and the run settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub states: Vec<State>,
    pub transitions: Vec<Transition>,
    /// X-axis coordinate of step 0 in the packaged result.
    pub start_point: i64,
    /// Number of rows produced, including row 0. The driver runs
    /// `steps_count - 1` transition batches.
    pub steps_count: u32,
    pub parallel: bool,
    pub higher_accuracy: bool,
    pub allow_negative: bool,
}

impl Task {
    pub fn new(states: Vec<State>, transitions: Vec<Transition>) -> Self {
        Self {
            states,
            transitions,
            start_point: 0,
            steps_count: 1,
            parallel: false,
            higher_accuracy: false,
            allow_negative: false,
        }
    }

    pub fn with_start_point(self, start_point: i64) -> Self {
        Self {
            start_point,
            ..self
        }
    }

    pub fn with_steps_count(self, steps_count: u32) -> Self {
        Self {
            steps_count,
            ..self
        }
    }

    pub fn with_parallel(self, parallel: bool) -> Self {
        Self { parallel, ..self }
    }

    pub fn with_higher_accuracy(self, higher_accuracy: bool) -> Self {
        Self {
            higher_accuracy,
            ..self
        }
    }

    pub fn with_allow_negative(self, allow_negative: bool) -> Self {
        Self {
            allow_negative,
            ..self
        }
    }

    /// Largest lookback any transition performs. Sizes the high-accuracy
    /// history window (`max_delay + 2` rows).
    pub fn max_delay(&self) -> u32 {
        self.transitions
            .iter()
            .map(|t| t.source_delay.max(t.operand_delay))
            .max()
            .unwrap_or(0)
    }

    /// Validates the task and resolves every transition's state ids into
    /// grid columns. All InvalidTask conditions surface here, before any
    /// stepping happens.
    pub(crate) fn resolve(&self) -> PopdynResult<Vec<ResolvedTransition>> {
        let mut columns = HashMap::with_capacity(self.states.len());
        for (index, state) in self.states.iter().enumerate() {
            if state.id == EXTERNAL_ID {
                return Err(TaskError::ReservedStateId(state.id).into());
            }
            if !state.count.is_finite() || state.count < 0.0 {
                return Err(TaskError::MalformedInitialCount {
                    id: state.id,
                    value: state.count,
                }
                .into());
            }
            if columns.insert(state.id, index).is_some() {
                return Err(TaskError::DuplicateStateId(state.id).into());
            }
        }

        self.transitions
            .iter()
            .enumerate()
            .map(|(index, transition)| ResolvedTransition::new(index, transition, &columns))
            .collect()
    }
}

/// A state reference with the external sentinel made structural: resolving
/// the external id always yields `External`, so no grid access can ever
/// target the open-world state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StateRef {
    External,
    Column(usize),
}

impl StateRef {
    pub(crate) fn column(self) -> Option<usize> {
        match self {
            StateRef::External => None,
            StateRef::Column(column) => Some(column),
        }
    }

    pub(crate) fn is_external(self) -> bool {
        matches!(self, StateRef::External)
    }
}

/// A transition with state ids resolved to grid columns and coefficients
/// validated. The evaluator works exclusively on this form.
#[derive(Clone, Debug)]
pub(crate) struct ResolvedTransition {
    pub source: StateRef,
    pub source_coefficient: f64,
    pub source_delay: u32,
    pub operand: StateRef,
    pub operand_coefficient: f64,
    pub operand_delay: u32,
    pub result: StateRef,
    pub result_coefficient: f64,
    pub probability: f64,
    pub kind: TransitionKind,
    pub mode: TransitionMode,
}

impl ResolvedTransition {
    fn new(
        index: usize,
        transition: &Transition,
        columns: &HashMap<i32, usize>,
    ) -> PopdynResult<Self> {
        let resolve_ref = |id: i32| -> PopdynResult<StateRef> {
            if id == EXTERNAL_ID {
                return Ok(StateRef::External);
            }
            columns
                .get(&id)
                .map(|&column| StateRef::Column(column))
                .ok_or_else(|| {
                    TaskError::UnknownState {
                        transition: index,
                        id,
                    }
                    .into()
                })
        };
        let coefficient = |name: &'static str, value: f64| -> PopdynResult<f64> {
            if !value.is_finite() || value < 0.0 {
                return Err(TaskError::MalformedCoefficient {
                    transition: index,
                    name,
                    value,
                }
                .into());
            }
            Ok(value)
        };

        // The probability is deliberately not range-checked, only kept finite.
        if !transition.probability.is_finite() {
            return Err(TaskError::MalformedCoefficient {
                transition: index,
                name: "probability",
                value: transition.probability,
            }
            .into());
        }

        Ok(Self {
            source: resolve_ref(transition.source)?,
            source_coefficient: coefficient("source coefficient", transition.source_coefficient)?,
            source_delay: transition.source_delay,
            operand: resolve_ref(transition.operand)?,
            operand_coefficient: coefficient(
                "operand coefficient",
                transition.operand_coefficient,
            )?,
            operand_delay: transition.operand_delay,
            result: resolve_ref(transition.result)?,
            result_coefficient: coefficient("result coefficient", transition.result_coefficient)?,
            probability: transition.probability,
            kind: transition.kind,
            mode: transition.mode,
        })
    }
}
