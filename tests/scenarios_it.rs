mod common;

use common::run;
use popdyn::error::PopdynResult;
use popdyn::model::{EXTERNAL_ID, State, Task, Transition, TransitionKind, TransitionMode};
use popdyn::{Engine, FnProgressSink, ResultShape};

fn assert_rows_close(actual: &[Vec<f64>], expected: &[Vec<f64>], tolerance: f64) {
    assert_eq!(actual.len(), expected.len());
    for (step, (row, want)) in actual.iter().zip(expected).enumerate() {
        for (column, (a, w)) in row.iter().zip(want).enumerate() {
            assert!(
                (a - w).abs() <= tolerance,
                "step {step}, column {column}: {a} vs {w}"
            );
        }
    }
}

#[test]
fn empty_rule_book_reproduces_row_zero() {
    let task = Task::new(
        vec![State::new(0, "A", 12.5), State::new(1, "B", 0.25)],
        vec![],
    )
    .with_steps_count(5);
    for row in run(task) {
        assert_eq!(row, vec![12.5, 0.25]);
    }
}

#[test]
fn retaining_self_loop_leaves_states_unchanged() {
    let task = Task::new(
        vec![State::new(0, "A", 50.0)],
        vec![
            Transition::new(0, 0, EXTERNAL_ID)
                .with_mode(TransitionMode::Retaining)
                .with_probability(0.0),
        ],
    )
    .with_steps_count(10);
    for row in run(task) {
        assert_eq!(row, vec![50.0]);
    }
}

#[test]
fn linear_pump_fills_the_result_linearly() {
    let task = Task::new(
        vec![State::new(0, "A", 100.0), State::new(1, "B", 0.0)],
        vec![Transition::new(0, EXTERNAL_ID, 1).with_probability(0.1)],
    )
    .with_steps_count(11);
    let rows = run(task);
    assert_eq!(rows[1], vec![100.0, 10.0]);
    // The source is never debited in SIMPLE mode, so after ten steps the
    // result has received the source's full level.
    assert_eq!(rows[10], vec![100.0, 100.0]);
}

#[test]
fn linear_removing_pump_drains_geometrically_and_conserves() {
    let task = Task::new(
        vec![State::new(0, "A", 100.0), State::new(1, "B", 0.0)],
        vec![
            Transition::new(0, EXTERNAL_ID, 1)
                .with_mode(TransitionMode::Removing)
                .with_probability(0.1),
        ],
    )
    .with_steps_count(3)
    .with_allow_negative(true);
    let rows = run(task);
    // Each step drains a tenth of the previous-step level.
    assert_rows_close(
        &rows,
        &[vec![100.0, 0.0], vec![90.0, 10.0], vec![81.0, 19.0]],
        1e-12,
    );
    for row in &rows {
        assert!((row.iter().sum::<f64>() - 100.0).abs() < 1e-12);
    }
}

#[test]
fn sink_flow_composes_both_transitions() {
    let task = Task::new(
        vec![
            State::new(0, "A", 10.0),
            State::new(1, "B", 0.0),
            State::new(2, "C", 0.0),
        ],
        vec![
            Transition::new(0, EXTERNAL_ID, 1).with_probability(0.5),
            Transition::new(1, EXTERNAL_ID, 2).with_mode(TransitionMode::Removing),
        ],
    )
    .with_steps_count(3);
    let rows = run(task);
    assert_rows_close(
        &rows,
        &[
            vec![10.0, 0.0, 0.0],
            vec![10.0, 5.0, 0.0],
            vec![10.0, 5.0, 5.0],
        ],
        1e-12,
    );
}

#[test]
fn blend_merger_mixes_by_participating_mass() {
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
    )
    .with_steps_count(2);
    let rows = run(task);
    assert_rows_close(&rows[1..], &[vec![1.6, 3.6, 2.4]], 1e-12);
}

#[test]
fn same_state_loop_halves_once_per_step() {
    let task = Task::new(
        vec![State::new(0, "A", 100.0)],
        vec![
            Transition::new(0, 0, EXTERNAL_ID)
                .with_mode(TransitionMode::Removing)
                .with_probability(0.5),
        ],
    )
    .with_steps_count(2);
    assert_eq!(run(task)[1], vec![50.0]);
}

#[test]
fn solute_transitions_are_inert_in_an_empty_population() {
    let task = Task::new(
        vec![State::new(0, "A", 0.0), State::new(1, "B", 0.0)],
        vec![
            Transition::new(0, 1, EXTERNAL_ID).with_kind(TransitionKind::Solute),
            Transition::new(0, EXTERNAL_ID, 1).with_kind(TransitionKind::Solute),
        ],
    )
    .with_steps_count(4);
    for row in run(task) {
        assert_eq!(row, vec![0.0, 0.0]);
    }
}

#[test]
fn solute_power_coefficients_normalize_by_the_total() {
    let task = Task::new(
        vec![State::new(0, "B", 4.0), State::new(1, "C", 0.0)],
        vec![
            Transition::new(EXTERNAL_ID, 0, 1)
                .with_kind(TransitionKind::Solute)
                .with_coefficients(1.0, 2.5, 1.0),
        ],
    )
    .with_steps_count(2);
    let rows = run(task);
    // density = 4^2.5 / probFactorial(2.5) = 32 / 4 = 8, then 8 / T^1.5 = 1;
    // the operand is debited by flow · 2.5.
    assert_rows_close(&rows[1..], &[vec![1.5, 1.0]], 1e-12);
}

#[test]
fn overdrawn_cells_are_clipped_unless_negatives_are_allowed() {
    let states = vec![State::new(0, "A", 1.0), State::new(1, "B", 0.0)];
    let transitions = vec![
        Transition::new(0, EXTERNAL_ID, 1).with_mode(TransitionMode::Removing),
        Transition::new(0, EXTERNAL_ID, 1).with_mode(TransitionMode::Removing),
    ];

    let clipped = run(Task::new(states.clone(), transitions.clone()).with_steps_count(2));
    assert_eq!(clipped[1], vec![0.0, 2.0]);

    let raw = run(Task::new(states, transitions)
        .with_steps_count(2)
        .with_allow_negative(true));
    assert_eq!(raw[1], vec![-1.0, 2.0]);
}

#[test]
fn delayed_source_reads_clamp_to_row_zero_then_slide() {
    let task = Task::new(
        vec![State::new(0, "A", 100.0), State::new(1, "B", 0.0)],
        vec![
            Transition::new(0, EXTERNAL_ID, 1)
                .with_mode(TransitionMode::Removing)
                .with_probability(0.1)
                .with_delays(3, 0),
        ],
    )
    .with_steps_count(6);
    let rows = run(task);
    let a_column: Vec<f64> = rows.iter().map(|row| row[0]).collect();
    // Steps 1-4 all read row 0 (the delay window has no history yet); from
    // step 5 the lookback starts sliding.
    assert_rows_close(
        &[a_column],
        &[vec![100.0, 90.0, 80.0, 70.0, 60.0, 51.0]],
        1e-12,
    );
}

#[test]
fn sequential_runs_are_bitwise_reproducible() {
    let task = Task::new(
        vec![
            State::new(0, "A", 30.0),
            State::new(1, "B", 20.0),
            State::new(2, "C", 5.0),
        ],
        vec![
            Transition::new(0, 1, 2)
                .with_kind(TransitionKind::Blend)
                .with_mode(TransitionMode::Removing)
                .with_probability(0.4),
            Transition::new(2, EXTERNAL_ID, 0)
                .with_kind(TransitionKind::Solute)
                .with_probability(0.2),
            Transition::new(0, 1, EXTERNAL_ID)
                .with_mode(TransitionMode::Residual)
                .with_probability(0.3)
                .with_delays(2, 0),
        ],
    )
    .with_steps_count(50)
    .with_allow_negative(true);

    assert_eq!(run(task.clone()), run(task));
}

#[test]
fn parallel_evaluation_matches_sequential_composition() {
    // Every credit is exact in binary, so the in-step composition is
    // order-independent down to the last bit.
    let states = vec![
        State::new(0, "A", 64.0),
        State::new(1, "B", 32.0),
        State::new(2, "C", 0.0),
    ];
    let transitions = vec![
        Transition::new(0, EXTERNAL_ID, 2).with_probability(0.25),
        Transition::new(1, EXTERNAL_ID, 2).with_probability(0.25),
    ];

    let sequential = run(Task::new(states.clone(), transitions.clone()).with_steps_count(20));
    let parallel = run(Task::new(states, transitions)
        .with_steps_count(20)
        .with_parallel(true));
    assert_eq!(sequential, parallel);
    assert_eq!(sequential[19][2], 19.0 * 24.0);
}

#[test]
fn progress_emissions_honor_the_reporting_contract() {
    common::init_tracing();
    let task = Task::new(
        vec![State::new(0, "A", 1.0)],
        vec![Transition::new(0, 0, EXTERNAL_ID).with_mode(TransitionMode::Retaining)],
    )
    .with_steps_count(1000);

    let emitted = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let collector = emitted.clone();
    let engine = Engine::new(task).unwrap().with_progress_sink(Box::new(FnProgressSink(
        move |progress: f64| -> PopdynResult<()> {
            collector.lock().unwrap().push(progress);
            Ok(())
        },
    )));
    engine.run_sync(ResultShape::none()).unwrap();

    let emitted = emitted.lock().unwrap();
    assert_eq!(*emitted.first().unwrap(), 0.0);
    assert_eq!(*emitted.last().unwrap(), 1.0);
    for pair in emitted.windows(2) {
        assert!(pair[1] > pair[0], "progress must be strictly increasing");
    }
    for pair in emitted[..emitted.len() - 1].windows(2) {
        assert!(pair[1] - pair[0] > 0.005, "non-final increments clear 0.005");
    }
}

#[test]
fn unknown_state_reference_fails_at_construction() {
    let task = Task::new(
        vec![State::new(0, "A", 1.0)],
        vec![Transition::new(0, EXTERNAL_ID, 9)],
    );
    assert!(Engine::new(task).is_err());
}

#[test]
fn result_shapes_carry_the_start_point() {
    let task = Task::new(
        vec![State::new(0, "A", 100.0), State::new(1, "B", 0.0)],
        vec![Transition::new(0, EXTERNAL_ID, 1).with_probability(0.1)],
    )
    .with_steps_count(3)
    .with_start_point(1990);

    let result = Engine::new(task)
        .unwrap()
        .run_sync(ResultShape::all())
        .unwrap();
    let chart = result.chart().unwrap();
    assert_eq!(chart[1].points, vec![(1990, 0.0), (1991, 10.0), (1992, 20.0)]);
    let table = result.table().unwrap();
    assert_eq!(table.headers, vec!["step", "A", "B"]);
    assert_eq!(table.rows[2].step, 1992);
}
