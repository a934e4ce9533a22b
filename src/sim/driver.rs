use std::sync::{Mutex, PoisonError};

use rayon::ThreadPool;

use crate::engine::CancelHandle;
use crate::error::PopdynResult;
use crate::model::ResolvedTransition;
use crate::sim::flow::{self, BigCtx, F64Ctx, StepCtx};
use crate::sim::grid::StateGrid;
use crate::sim::progress::ProgressReporter;

/// The outer loop: one transition batch per step, strictly sequential
/// across steps, optionally fanned out across the pool within a step.
pub(crate) struct StepDriver<'a> {
    pub grid: &'a StateGrid,
    pub transitions: &'a [ResolvedTransition],
    pub higher_accuracy: bool,
    pub scale: u32,
    pub pool: Option<&'a ThreadPool>,
    pub cancel: &'a CancelHandle,
}

impl StepDriver<'_> {
    pub fn run(&self, progress: &mut ProgressReporter<'_>) -> PopdynResult<()> {
        progress.begin()?;
        for step in 1..self.grid.steps() {
            // The total population is captured once per step, right after
            // the copy-forward, so every transition sees the same value.
            if self.higher_accuracy {
                self.grid.begin_step_big(step);
                let total = self.grid.slot_total(self.scale);
                let ctx = BigCtx {
                    grid: self.grid,
                    step,
                    scale: self.scale,
                };
                self.evaluate(&ctx, step, &total)?;
            } else {
                self.grid.copy_forward(step);
                let total = self.grid.row_total(step);
                let ctx = F64Ctx {
                    grid: self.grid,
                    step,
                };
                self.evaluate(&ctx, step, &total)?;
            }
            tracing::trace!(step, "step complete");
            progress.on_step(step)?;
        }
        progress.finish()
    }

    /// One batch. The pool scope is the per-step barrier; a task observing
    /// the cancel flag is absorbed silently, the first error wins and is
    /// re-raised after the barrier.
    fn evaluate<C: StepCtx>(&self, ctx: &C, step: usize, total: &C::Num) -> PopdynResult<()> {
        let Some(pool) = self.pool else {
            for transition in self.transitions {
                if self.cancel.is_cancelled() {
                    tracing::debug!(step, "transition task cancelled; absorbing");
                    continue;
                }
                flow::apply_transition(ctx, transition, step, total)?;
            }
            return Ok(());
        };

        let failure = Mutex::new(None);
        pool.scope(|scope| {
            for transition in self.transitions {
                let failure = &failure;
                scope.spawn(move |_| {
                    if self.cancel.is_cancelled() {
                        tracing::debug!(step, "transition task cancelled; absorbing");
                        return;
                    }
                    if let Err(err) = flow::apply_transition(ctx, transition, step, total) {
                        failure
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .get_or_insert(err);
                    }
                });
            }
        });
        match failure.into_inner().unwrap_or_else(PoisonError::into_inner) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
