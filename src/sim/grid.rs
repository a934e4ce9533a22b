use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::math::decimal::BigDec;

/// The shared per-step, per-state population store.
///
/// The finite-precision grid keeps every row of the run; the optional
/// high-accuracy window keeps only the last `max_delay + 2` rows in
/// arbitrary precision, slot 0 being the row currently under computation.
///
/// One mutex guards both representations. Every read, credit and debit is
/// a single critical section, and every arbitrary-precision mutation
/// writes the `f64` projection of the touched cell before the lock is
/// released, so the two representations agree at every observable point.
pub(crate) struct StateGrid {
    columns: usize,
    steps: usize,
    cells: Mutex<Cells>,
}

struct Cells {
    /// Step-major `steps × columns` finite-precision rows.
    rows: Vec<f64>,
    window: Option<HistoryWindow>,
}

struct HistoryWindow {
    /// `slots[k]` holds the row written `k` steps before the current one.
    slots: Vec<Vec<BigDec>>,
}

impl StateGrid {
    /// Row 0 is the initial counts; later rows are zero until their step's
    /// copy-forward.
    pub fn new(initial: &[f64], steps: usize) -> Self {
        debug_assert!(steps >= 1);
        let columns = initial.len();
        let mut rows = vec![0.0; steps * columns];
        rows[..columns].copy_from_slice(initial);
        Self {
            columns,
            steps,
            cells: Mutex::new(Cells { rows, window: None }),
        }
    }

    /// Attaches the high-accuracy window, `max_delay + 2` rows deep, every
    /// slot primed with the promoted initial counts so delayed reads before
    /// step 0 resolve to row 0.
    pub fn with_window(self, max_delay: usize, scale: u32) -> Self {
        {
            let mut cells = self.cells();
            let initial: Vec<BigDec> = cells.rows[..self.columns]
                .iter()
                .map(|&count| BigDec::from_f64(count, scale))
                .collect();
            cells.window = Some(HistoryWindow {
                slots: vec![initial; max_delay + 2],
            });
        }
        self
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    fn cells(&self) -> MutexGuard<'_, Cells> {
        self.cells.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Finite-precision step prelude: row `step` starts as a copy of row
    /// `step - 1`.
    pub fn copy_forward(&self, step: usize) {
        debug_assert!(step >= 1 && step < self.steps);
        let mut cells = self.cells();
        let offset = step * self.columns;
        let (previous, current) = cells.rows.split_at_mut(offset);
        current[..self.columns].copy_from_slice(&previous[offset - self.columns..]);
    }

    /// High-accuracy step prelude: shifts the window by one step, carries
    /// the prior row into slot 0 and projects it into the finite row.
    pub fn begin_step_big(&self, step: usize) {
        debug_assert!(step >= 1 && step < self.steps);
        let mut cells = self.cells();
        let cells = &mut *cells;
        let offset = step * self.columns;
        let window = cells.window.as_mut().expect("history window attached");
        window.slots.rotate_right(1);
        window.slots[0] = window.slots[1].clone();
        for column in 0..self.columns {
            cells.rows[offset + column] = window.slots[0][column].to_f64();
        }
    }

    pub fn value(&self, step: usize, column: usize) -> f64 {
        self.cells().rows[step * self.columns + column]
    }

    /// Reads the row written at `read_step` while `current_step` is under
    /// computation: slot `current_step - read_step`.
    pub fn value_big(&self, current_step: usize, read_step: usize, column: usize) -> BigDec {
        let cells = self.cells();
        let window = cells.window.as_ref().expect("history window attached");
        window.slots[current_step - read_step][column].clone()
    }

    pub fn row_total(&self, step: usize) -> f64 {
        let cells = self.cells();
        let offset = step * self.columns;
        cells.rows[offset..offset + self.columns].iter().sum()
    }

    /// Total population of the row under computation, in arbitrary
    /// precision.
    pub fn slot_total(&self, scale: u32) -> BigDec {
        let cells = self.cells();
        let window = cells.window.as_ref().expect("history window attached");
        window.slots[0]
            .iter()
            .fold(BigDec::with_scale(scale), |total, count| &total + count)
    }

    pub fn credit(&self, step: usize, column: usize, amount: f64) {
        self.cells().rows[step * self.columns + column] += amount;
    }

    pub fn debit(&self, step: usize, column: usize, amount: f64) {
        self.cells().rows[step * self.columns + column] -= amount;
    }

    pub fn credit_big(&self, step: usize, column: usize, amount: &BigDec) {
        let mut cells = self.cells();
        let cells = &mut *cells;
        let window = cells.window.as_mut().expect("history window attached");
        window.slots[0][column] = &window.slots[0][column] + amount;
        cells.rows[step * self.columns + column] = window.slots[0][column].to_f64();
    }

    pub fn debit_big(&self, step: usize, column: usize, amount: &BigDec) {
        let mut cells = self.cells();
        let cells = &mut *cells;
        let window = cells.window.as_mut().expect("history window attached");
        window.slots[0][column] = &window.slots[0][column] - amount;
        cells.rows[step * self.columns + column] = window.slots[0][column].to_f64();
    }

    /// Drops the high-accuracy buffer once a run is over.
    pub fn release_window(&self) {
        self.cells().window = None;
    }

    /// Consumes the grid into per-step rows for packaging.
    pub fn into_rows(self) -> Vec<Vec<f64>> {
        if self.columns == 0 {
            return vec![Vec::new(); self.steps];
        }
        let cells = self
            .cells
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        cells
            .rows
            .chunks(self.columns)
            .map(<[f64]>::to_vec)
            .collect()
    }
}
