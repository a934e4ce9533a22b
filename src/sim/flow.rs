//! Per-transition flow evaluation.
//!
//! The algebra is written once against a numeric capability ([`StepCtx`])
//! and instantiated over native floats and over the scaled-decimal kernel,
//! so the two pipelines cannot drift apart. Reads target finalized rows
//! selected by the delay rule; commits accumulate into the row under
//! computation through single-critical-section grid operations.

use crate::error::PopdynResult;
use crate::math::decimal::BigDec;
use crate::math::factorial;
use crate::model::{ResolvedTransition, StateRef, TransitionKind, TransitionMode};
use crate::sim::grid::StateGrid;

/// Numeric capability of one step: arithmetic plus guarded grid access.
pub(crate) trait StepCtx: Sync {
    type Num: Clone + PartialOrd + Send + Sync;

    fn constant(&self, value: f64) -> Self::Num;
    fn read(&self, step: usize, column: usize) -> Self::Num;
    fn credit(&self, column: usize, amount: &Self::Num);
    fn debit(&self, column: usize, amount: &Self::Num);
    fn add(&self, u: &Self::Num, v: &Self::Num) -> Self::Num;
    fn sub(&self, u: &Self::Num, v: &Self::Num) -> Self::Num;
    fn mul(&self, u: &Self::Num, v: &Self::Num) -> Self::Num;
    fn div(&self, u: &Self::Num, v: &Self::Num) -> PopdynResult<Self::Num>;
    fn pow(&self, base: &Self::Num, exponent: f64) -> PopdynResult<Self::Num>;
    fn prob_factorial(&self, value: f64) -> PopdynResult<Self::Num>;
    fn is_positive(&self, u: &Self::Num) -> bool;
}

/// Finite-precision step context: plain `f64` arithmetic.
pub(crate) struct F64Ctx<'a> {
    pub grid: &'a StateGrid,
    pub step: usize,
}

impl StepCtx for F64Ctx<'_> {
    type Num = f64;

    fn constant(&self, value: f64) -> f64 {
        value
    }

    fn read(&self, step: usize, column: usize) -> f64 {
        self.grid.value(step, column)
    }

    fn credit(&self, column: usize, amount: &f64) {
        self.grid.credit(self.step, column, *amount);
    }

    fn debit(&self, column: usize, amount: &f64) {
        self.grid.debit(self.step, column, *amount);
    }

    fn add(&self, u: &f64, v: &f64) -> f64 {
        u + v
    }

    fn sub(&self, u: &f64, v: &f64) -> f64 {
        u - v
    }

    fn mul(&self, u: &f64, v: &f64) -> f64 {
        u * v
    }

    fn div(&self, u: &f64, v: &f64) -> PopdynResult<f64> {
        Ok(u / v)
    }

    fn pow(&self, base: &f64, exponent: f64) -> PopdynResult<f64> {
        Ok(base.powf(exponent))
    }

    fn prob_factorial(&self, value: f64) -> PopdynResult<f64> {
        Ok(factorial::prob_factorial(value))
    }

    fn is_positive(&self, u: &f64) -> bool {
        *u > 0.0
    }
}

/// High-accuracy step context over the scaled-decimal kernel.
pub(crate) struct BigCtx<'a> {
    pub grid: &'a StateGrid,
    pub step: usize,
    pub scale: u32,
}

impl StepCtx for BigCtx<'_> {
    type Num = BigDec;

    fn constant(&self, value: f64) -> BigDec {
        BigDec::from_f64(value, self.scale)
    }

    fn read(&self, step: usize, column: usize) -> BigDec {
        self.grid.value_big(self.step, step, column)
    }

    fn credit(&self, column: usize, amount: &BigDec) {
        self.grid.credit_big(self.step, column, amount);
    }

    fn debit(&self, column: usize, amount: &BigDec) {
        self.grid.debit_big(self.step, column, amount);
    }

    fn add(&self, u: &BigDec, v: &BigDec) -> BigDec {
        u + v
    }

    fn sub(&self, u: &BigDec, v: &BigDec) -> BigDec {
        u - v
    }

    fn mul(&self, u: &BigDec, v: &BigDec) -> BigDec {
        u.mul(v)
    }

    fn div(&self, u: &BigDec, v: &BigDec) -> PopdynResult<BigDec> {
        Ok(u.div(v)?)
    }

    fn pow(&self, base: &BigDec, exponent: f64) -> PopdynResult<BigDec> {
        Ok(base.pow_real(exponent)?)
    }

    fn prob_factorial(&self, value: f64) -> PopdynResult<BigDec> {
        Ok(BigDec::from_f64(value, self.scale).prob_factorial()?)
    }

    fn is_positive(&self, u: &BigDec) -> bool {
        u.is_positive()
    }
}

/// Row a delayed read resolves to while computing `step`: requests beyond
/// history return step 0.
fn delayed_row(step: usize, delay: u32) -> usize {
    (step - 1).saturating_sub(delay as usize)
}

/// `x` for coefficients up to 1, `x / c` above.
fn linear_coef<C: StepCtx>(ctx: &C, x: &C::Num, c: f64) -> PopdynResult<C::Num> {
    if c <= 1.0 {
        Ok(x.clone())
    } else {
        ctx.div(x, &ctx.constant(c))
    }
}

/// `x` for coefficients up to 1, `x^c / probFactorial(c)` above.
fn power_coef<C: StepCtx>(ctx: &C, x: &C::Num, c: f64) -> PopdynResult<C::Num> {
    if c <= 1.0 {
        Ok(x.clone())
    } else {
        ctx.div(&ctx.pow(x, c)?, &ctx.prob_factorial(c)?)
    }
}

/// Mode transform around the probability scaling: INHIBITOR inverts against
/// the operand density before it, RESIDUAL after it.
fn modulate<C: StepCtx>(
    ctx: &C,
    transition: &ResolvedTransition,
    raw: C::Num,
    operand_density: &C::Num,
) -> C::Num {
    let oc = ctx.constant(transition.operand_coefficient);
    let mut flow = raw;
    if transition.mode == TransitionMode::Inhibitor {
        flow = ctx.sub(operand_density, &ctx.mul(&flow, &oc));
    }
    flow = ctx.mul(&flow, &ctx.constant(transition.probability));
    if transition.mode == TransitionMode::Residual {
        flow = ctx.sub(operand_density, &ctx.mul(&flow, &oc));
    }
    flow
}

/// Evaluates one transition against the step and commits its flow.
pub(crate) fn apply_transition<C: StepCtx>(
    ctx: &C,
    transition: &ResolvedTransition,
    step: usize,
    total: &C::Num,
) -> PopdynResult<()> {
    if transition.source.is_external() && transition.operand.is_external() {
        return Ok(());
    }
    let flow = match transition.kind {
        TransitionKind::Linear => linear_flow(ctx, transition, step)?,
        TransitionKind::Solute => solute_flow(ctx, transition, step, total)?,
        TransitionKind::Blend => blend_flow(ctx, transition, step)?,
    };
    if let Some(flow) = flow {
        commit(ctx, transition, &flow);
    }
    Ok(())
}

fn linear_flow<C: StepCtx>(
    ctx: &C,
    t: &ResolvedTransition,
    step: usize,
) -> PopdynResult<Option<C::Num>> {
    match (t.source, t.operand) {
        (StateRef::External, StateRef::Column(operand)) => {
            let ov = ctx.read(delayed_row(step, t.operand_delay), operand);
            let density = linear_coef(ctx, &ov, t.operand_coefficient)?;
            let mut flow = ctx.mul(&density, &ctx.constant(t.probability));
            if t.mode == TransitionMode::Residual {
                let oc = ctx.constant(t.operand_coefficient);
                flow = ctx.sub(&density, &ctx.mul(&flow, &oc));
            }
            Ok(Some(flow))
        }
        (StateRef::Column(source), StateRef::External) => {
            let sv = ctx.read(delayed_row(step, t.source_delay), source);
            let density = linear_coef(ctx, &sv, t.source_coefficient)?;
            Ok(Some(ctx.mul(&density, &ctx.constant(t.probability))))
        }
        (StateRef::Column(source), StateRef::Column(operand)) if source == operand => {
            let sv = ctx.read(delayed_row(step, t.source_delay), source);
            let density =
                linear_coef(ctx, &sv, t.source_coefficient + t.operand_coefficient - 1.0)?;
            Ok(Some(modulate(ctx, t, density.clone(), &density)))
        }
        (StateRef::Column(source), StateRef::Column(operand)) => {
            let sv = ctx.read(delayed_row(step, t.source_delay), source);
            let ov = ctx.read(delayed_row(step, t.operand_delay), operand);
            let source_density = linear_coef(ctx, &sv, t.source_coefficient)?;
            let operand_density = linear_coef(ctx, &ov, t.operand_coefficient)?;
            let smaller = if source_density <= operand_density {
                source_density
            } else {
                operand_density.clone()
            };
            Ok(Some(modulate(ctx, t, smaller, &operand_density)))
        }
        (StateRef::External, StateRef::External) => Ok(None),
    }
}

fn solute_flow<C: StepCtx>(
    ctx: &C,
    t: &ResolvedTransition,
    step: usize,
    total: &C::Num,
) -> PopdynResult<Option<C::Num>> {
    // Mass-action flow over the whole population; inert while it is empty.
    if !ctx.is_positive(total) {
        return Ok(None);
    }
    let sc = t.source_coefficient;
    let oc = t.operand_coefficient;
    match (t.source, t.operand) {
        (StateRef::External, StateRef::Column(operand)) => {
            let ov = ctx.read(delayed_row(step, t.operand_delay), operand);
            let density = power_coef(ctx, &ov, oc)?;
            let mut x = density.clone();
            if oc > 1.0 {
                x = ctx.div(&x, &ctx.pow(total, oc - 1.0)?)?;
            }
            Ok(Some(modulate(ctx, t, x, &density)))
        }
        (StateRef::Column(source), StateRef::External) => {
            let sv = ctx.read(delayed_row(step, t.source_delay), source);
            let mut x = power_coef(ctx, &sv, sc)?;
            if sc > 1.0 {
                x = ctx.div(&x, &ctx.pow(total, sc - 1.0)?)?;
            }
            Ok(Some(ctx.mul(&x, &ctx.constant(t.probability))))
        }
        (StateRef::Column(source), StateRef::Column(operand)) if source == operand => {
            let sv = ctx.read(delayed_row(step, t.source_delay), source);
            let density = power_coef(ctx, &sv, sc + oc)?;
            let x = ctx.div(&density, &ctx.pow(total, sc + oc - 1.0)?)?;
            Ok(Some(modulate(ctx, t, x, &density)))
        }
        (StateRef::Column(source), StateRef::Column(operand)) => {
            let sv = ctx.read(delayed_row(step, t.source_delay), source);
            let ov = ctx.read(delayed_row(step, t.operand_delay), operand);
            let source_density = power_coef(ctx, &sv, sc)?;
            let operand_density = power_coef(ctx, &ov, oc)?;
            let product = ctx.mul(&source_density, &operand_density);
            let x = ctx.div(&product, &ctx.pow(total, sc + oc - 1.0)?)?;
            Ok(Some(modulate(ctx, t, x, &operand_density)))
        }
        (StateRef::External, StateRef::External) => Ok(None),
    }
}

fn blend_flow<C: StepCtx>(
    ctx: &C,
    t: &ResolvedTransition,
    step: usize,
) -> PopdynResult<Option<C::Num>> {
    // Like SOLUTE, but each subcase gates on and normalizes by its own
    // participating counts instead of the total population.
    let sc = t.source_coefficient;
    let oc = t.operand_coefficient;
    match (t.source, t.operand) {
        (StateRef::External, StateRef::Column(operand)) => {
            let ov = ctx.read(delayed_row(step, t.operand_delay), operand);
            if !ctx.is_positive(&ov) {
                return Ok(None);
            }
            let density = power_coef(ctx, &ov, oc)?;
            let mut x = density.clone();
            if oc > 1.0 {
                x = ctx.div(&x, &ctx.pow(&ov, oc - 1.0)?)?;
            }
            Ok(Some(modulate(ctx, t, x, &density)))
        }
        (StateRef::Column(source), StateRef::External) => {
            let sv = ctx.read(delayed_row(step, t.source_delay), source);
            if !ctx.is_positive(&sv) {
                return Ok(None);
            }
            let mut x = power_coef(ctx, &sv, sc)?;
            if sc > 1.0 {
                x = ctx.div(&x, &ctx.pow(&sv, sc - 1.0)?)?;
            }
            Ok(Some(ctx.mul(&x, &ctx.constant(t.probability))))
        }
        (StateRef::Column(source), StateRef::Column(operand)) if source == operand => {
            let sv = ctx.read(delayed_row(step, t.source_delay), source);
            if !ctx.is_positive(&sv) {
                return Ok(None);
            }
            let density = power_coef(ctx, &sv, sc + oc)?;
            let x = ctx.div(&density, &ctx.pow(&sv, sc + oc - 1.0)?)?;
            Ok(Some(modulate(ctx, t, x, &density)))
        }
        (StateRef::Column(source), StateRef::Column(operand)) => {
            let sv = ctx.read(delayed_row(step, t.source_delay), source);
            let ov = ctx.read(delayed_row(step, t.operand_delay), operand);
            let combined = ctx.add(&sv, &ov);
            if !ctx.is_positive(&combined) {
                return Ok(None);
            }
            let source_density = power_coef(ctx, &sv, sc)?;
            let operand_density = power_coef(ctx, &ov, oc)?;
            let product = ctx.mul(&source_density, &operand_density);
            let x = ctx.div(&product, &ctx.pow(&combined, sc + oc - 1.0)?)?;
            Ok(Some(modulate(ctx, t, x, &operand_density)))
        }
        (StateRef::External, StateRef::External) => Ok(None),
    }
}

fn commit<C: StepCtx>(ctx: &C, t: &ResolvedTransition, flow: &C::Num) {
    if let Some(source) = t.source.column() {
        if t.mode == TransitionMode::Removing {
            ctx.debit(source, &ctx.mul(flow, &ctx.constant(t.source_coefficient)));
        }
    }
    if let Some(operand) = t.operand.column() {
        match t.mode {
            TransitionMode::Inhibitor | TransitionMode::Residual => ctx.debit(operand, flow),
            TransitionMode::Retaining => {}
            // A REMOVING self-loop is drained once, through the source debit.
            TransitionMode::Removing if t.source.column() == Some(operand) => {}
            TransitionMode::Simple | TransitionMode::Removing => {
                ctx.debit(operand, &ctx.mul(flow, &ctx.constant(t.operand_coefficient)));
            }
        }
    }
    if let Some(result) = t.result.column() {
        ctx.credit(result, &ctx.mul(flow, &ctx.constant(t.result_coefficient)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EXTERNAL_ID, State, Task, Transition};

    fn resolved(task: &Task) -> Vec<ResolvedTransition> {
        task.resolve().unwrap()
    }

    fn apply_f64(grid: &StateGrid, transition: &ResolvedTransition, step: usize) {
        grid.copy_forward(step);
        let total = grid.row_total(step);
        let ctx = F64Ctx { grid, step };
        apply_transition(&ctx, transition, step, &total).unwrap();
    }

    #[test]
    fn linear_pump_from_source_to_result() {
        let task = Task::new(
            vec![State::new(0, "A", 100.0), State::new(1, "B", 0.0)],
            vec![Transition::new(0, EXTERNAL_ID, 1).with_probability(0.1)],
        );
        let grid = StateGrid::new(&[100.0, 0.0], 2);
        apply_f64(&grid, &resolved(&task)[0], 1);
        assert_eq!(grid.value(1, 0), 100.0);
        assert_eq!(grid.value(1, 1), 10.0);
    }

    #[test]
    fn linear_removing_debits_the_source() {
        let task = Task::new(
            vec![State::new(0, "A", 100.0), State::new(1, "B", 0.0)],
            vec![
                Transition::new(0, EXTERNAL_ID, 1)
                    .with_mode(TransitionMode::Removing)
                    .with_probability(0.1),
            ],
        );
        let grid = StateGrid::new(&[100.0, 0.0], 2);
        apply_f64(&grid, &resolved(&task)[0], 1);
        assert_eq!(grid.value(1, 0), 90.0);
        assert_eq!(grid.value(1, 1), 10.0);
    }

    #[test]
    fn removing_self_loop_drains_once() {
        let task = Task::new(
            vec![State::new(0, "A", 100.0)],
            vec![
                Transition::new(0, 0, EXTERNAL_ID)
                    .with_mode(TransitionMode::Removing)
                    .with_probability(0.5),
            ],
        );
        let grid = StateGrid::new(&[100.0], 2);
        apply_f64(&grid, &resolved(&task)[0], 1);
        assert_eq!(grid.value(1, 0), 50.0);
    }

    #[test]
    fn blend_merger_normalizes_by_participants() {
        let task = Task::new(
            vec![
                State::new(0, "A", 4.0),
                State::new(1, "B", 6.0),
                State::new(2, "C", 0.0),
            ],
            vec![
                Transition::new(0, 1, 2)
                    .with_kind(TransitionKind::Blend)
                    .with_mode(TransitionMode::Removing),
            ],
        );
        let grid = StateGrid::new(&[4.0, 6.0, 0.0], 2);
        apply_f64(&grid, &resolved(&task)[0], 1);
        assert!((grid.value(1, 0) - 1.6).abs() < 1e-12);
        assert!((grid.value(1, 1) - 3.6).abs() < 1e-12);
        assert!((grid.value(1, 2) - 2.4).abs() < 1e-12);
    }

    #[test]
    fn solute_is_inert_while_population_is_empty() {
        let task = Task::new(
            vec![State::new(0, "A", 0.0), State::new(1, "B", 0.0)],
            vec![Transition::new(0, 1, EXTERNAL_ID).with_kind(TransitionKind::Solute)],
        );
        let grid = StateGrid::new(&[0.0, 0.0], 2);
        apply_f64(&grid, &resolved(&task)[0], 1);
        assert_eq!(grid.value(1, 0), 0.0);
        assert_eq!(grid.value(1, 1), 0.0);
    }

    #[test]
    fn inhibitor_inverts_before_probability() {
        let task = Task::new(
            vec![
                State::new(0, "A", 3.0),
                State::new(1, "B", 10.0),
                State::new(2, "C", 0.0),
            ],
            vec![
                Transition::new(0, 1, 2)
                    .with_mode(TransitionMode::Inhibitor)
                    .with_probability(0.5),
            ],
        );
        let grid = StateGrid::new(&[3.0, 10.0, 0.0], 2);
        apply_f64(&grid, &resolved(&task)[0], 1);
        // flow = (10 - 3) · 0.5; the operand is debited by the flow itself.
        assert_eq!(grid.value(1, 1), 6.5);
        assert_eq!(grid.value(1, 2), 3.5);
        assert_eq!(grid.value(1, 0), 3.0);
    }

    #[test]
    fn residual_inverts_after_probability() {
        let task = Task::new(
            vec![
                State::new(0, "A", 3.0),
                State::new(1, "B", 10.0),
                State::new(2, "C", 0.0),
            ],
            vec![
                Transition::new(0, 1, 2)
                    .with_mode(TransitionMode::Residual)
                    .with_probability(0.5),
            ],
        );
        let grid = StateGrid::new(&[3.0, 10.0, 0.0], 2);
        apply_f64(&grid, &resolved(&task)[0], 1);
        // flow = 10 - (3 · 0.5) = 8.5.
        assert_eq!(grid.value(1, 1), 1.5);
        assert_eq!(grid.value(1, 2), 8.5);
    }

    #[test]
    fn retaining_with_zero_probability_changes_nothing() {
        let task = Task::new(
            vec![State::new(0, "A", 42.0)],
            vec![
                Transition::new(0, 0, EXTERNAL_ID)
                    .with_mode(TransitionMode::Retaining)
                    .with_probability(0.0),
            ],
        );
        let grid = StateGrid::new(&[42.0], 2);
        apply_f64(&grid, &resolved(&task)[0], 1);
        assert_eq!(grid.value(1, 0), 42.0);
    }

    #[test]
    fn delayed_reads_clamp_to_row_zero() {
        assert_eq!(delayed_row(1, 3), 0);
        assert_eq!(delayed_row(5, 3), 1);
        assert_eq!(delayed_row(4, 3), 0);

        let task = Task::new(
            vec![State::new(0, "A", 100.0), State::new(1, "B", 0.0)],
            vec![
                Transition::new(0, EXTERNAL_ID, 1)
                    .with_probability(0.1)
                    .with_delays(3, 0),
            ],
        );
        let grid = StateGrid::new(&[100.0, 0.0], 2);
        apply_f64(&grid, &resolved(&task)[0], 1);
        assert_eq!(grid.value(1, 1), 10.0);
    }

    #[test]
    fn big_pipeline_matches_blend_merger() {
        let task = Task::new(
            vec![
                State::new(0, "A", 4.0),
                State::new(1, "B", 6.0),
                State::new(2, "C", 0.0),
            ],
            vec![
                Transition::new(0, 1, 2)
                    .with_kind(TransitionKind::Blend)
                    .with_mode(TransitionMode::Removing),
            ],
        );
        let grid = StateGrid::new(&[4.0, 6.0, 0.0], 2).with_window(0, 64);
        grid.begin_step_big(1);
        let total = grid.slot_total(64);
        let ctx = BigCtx {
            grid: &grid,
            step: 1,
            scale: 64,
        };
        apply_transition(&ctx, &resolved(&task)[0], 1, &total).unwrap();
        assert!((grid.value(1, 0) - 1.6).abs() < 1e-12);
        assert!((grid.value(1, 1) - 3.6).abs() < 1e-12);
        assert!((grid.value(1, 2) - 2.4).abs() < 1e-12);
    }
}
