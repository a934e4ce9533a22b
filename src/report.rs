use std::iter;

use serde::Serialize;

use crate::model::Task;

/// Which derived shapes to build alongside the raw per-state series.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ResultShape {
    pub table: bool,
    pub chart: bool,
}

impl ResultShape {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self {
            table: true,
            chart: true,
        }
    }

    pub fn with_table(self) -> Self {
        Self {
            table: true,
            ..self
        }
    }

    pub fn with_chart(self) -> Self {
        Self {
            chart: true,
            ..self
        }
    }
}

/// One state's labelled series, x-coordinates starting at the task's
/// start point.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StateSeries {
    pub state_id: i32,
    pub label: String,
    pub points: Vec<(i64, f64)>,
}

/// Tabular form suitable for display or export: a step column followed by
/// one column per state, in task order.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TableView {
    pub headers: Vec<String>,
    pub rows: Vec<TableRow>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TableRow {
    pub step: i64,
    pub populations: Vec<f64>,
}

/// The packaged outcome of a run: the finished grid with negatives
/// optionally clipped, plus whichever derived shapes were requested.
#[derive(Clone, Debug, Serialize)]
pub struct SimulationResult {
    start_point: i64,
    labels: Vec<String>,
    values: Vec<Vec<f64>>,
    table: Option<TableView>,
    chart: Option<Vec<StateSeries>>,
}

impl SimulationResult {
    pub(crate) fn package(mut rows: Vec<Vec<f64>>, task: &Task, shape: ResultShape) -> Self {
        if !task.allow_negative {
            for row in &mut rows {
                for value in row {
                    if *value < 0.0 {
                        *value = 0.0;
                    }
                }
            }
        }

        let labels: Vec<String> = task.states.iter().map(|s| s.name.clone()).collect();
        let start_point = task.start_point;

        let table = shape.table.then(|| TableView {
            headers: iter::once("step".to_string())
                .chain(labels.iter().cloned())
                .collect(),
            rows: rows
                .iter()
                .enumerate()
                .map(|(step, row)| TableRow {
                    step: start_point + step as i64,
                    populations: row.clone(),
                })
                .collect(),
        });

        let chart = shape.chart.then(|| {
            task.states
                .iter()
                .enumerate()
                .map(|(column, state)| StateSeries {
                    state_id: state.id,
                    label: state.name.clone(),
                    points: rows
                        .iter()
                        .enumerate()
                        .map(|(step, row)| (start_point + step as i64, row[column]))
                        .collect(),
                })
                .collect()
        });

        Self {
            start_point,
            labels,
            values: rows,
            table,
            chart,
        }
    }

    pub fn start_point(&self) -> i64 {
        self.start_point
    }

    /// Number of rows, including row 0.
    pub fn steps(&self) -> usize {
        self.values.len()
    }

    pub fn state_labels(&self) -> &[String] {
        &self.labels
    }

    pub fn rows(&self) -> &[Vec<f64>] {
        &self.values
    }

    pub fn population(&self, step: usize, column: usize) -> f64 {
        self.values[step][column]
    }

    /// One state's populations across all steps.
    pub fn column(&self, column: usize) -> impl Iterator<Item = f64> + '_ {
        self.values.iter().map(move |row| row[column])
    }

    pub fn table(&self) -> Option<&TableView> {
        self.table.as_ref()
    }

    pub fn chart(&self) -> Option<&[StateSeries]> {
        self.chart.as_deref()
    }
}
