use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::{PopdynResult, WorkerError};
use crate::math::decimal::DEFAULT_SCALE;
use crate::model::{ResolvedTransition, Task};
use crate::report::{ResultShape, SimulationResult};
use crate::sim::driver::StepDriver;
use crate::sim::grid::StateGrid;
use crate::sim::progress::{ProgressReporter, ProgressSink};

/// Per-run receiver of the completed result. A failing sink surfaces as a
/// worker failure.
pub trait ResultSink: Send {
    fn on_result(&mut self, result: &SimulationResult) -> PopdynResult<()>;
}

/// Adapter turning a closure into a [`ResultSink`].
pub struct FnResultSink<F>(pub F);

impl<F> ResultSink for FnResultSink<F>
where
    F: FnMut(&SimulationResult) -> PopdynResult<()> + Send,
{
    fn on_result(&mut self, result: &SimulationResult) -> PopdynResult<()> {
        (self.0)(result)
    }
}

/// Cooperative cancellation flag for in-flight transition tasks.
///
/// A transition task that starts while the flag is set is absorbed
/// silently: its step completes as the partial composition of the tasks
/// that did run, and the driver carries on. Clearing the flag lets
/// subsequent steps proceed normally.
#[derive(Clone, Debug, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn clear(&self) {
        self.flag.store(false, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// The engine facade: validates a [`Task`], owns the worker pool and the
/// run callbacks, and executes the simulation synchronously or on a
/// background worker. An engine runs once.
pub struct Engine {
    task: Task,
    transitions: Vec<ResolvedTransition>,
    scale: u32,
    pool: Option<ThreadPool>,
    cancel: CancelHandle,
    result_sink: Option<Box<dyn ResultSink>>,
    progress_sink: Option<Box<dyn ProgressSink>>,
}

impl Engine {
    /// Validates the task, resolves its transitions and, when `parallel`
    /// is requested, builds the worker pool. Every InvalidTask condition
    /// is detected here.
    pub fn new(task: Task) -> PopdynResult<Self> {
        let transitions = task.resolve()?;
        let pool = if task.parallel {
            Some(build_pool(None)?)
        } else {
            None
        };
        Ok(Self {
            task,
            transitions,
            scale: DEFAULT_SCALE,
            pool,
            cancel: CancelHandle::new(),
            result_sink: None,
            progress_sink: None,
        })
    }

    /// Overrides the fractional scale of the high-accuracy pipeline.
    pub fn with_scale(self, scale: u32) -> Self {
        Self { scale, ..self }
    }

    /// Pins the worker pool to a fixed thread count. A no-op for
    /// sequential tasks.
    pub fn with_worker_threads(mut self, threads: usize) -> PopdynResult<Self> {
        if self.task.parallel {
            self.pool = Some(build_pool(Some(threads))?);
        }
        Ok(self)
    }

    pub fn with_result_sink(self, sink: Box<dyn ResultSink>) -> Self {
        Self {
            result_sink: Some(sink),
            ..self
        }
    }

    pub fn with_progress_sink(self, sink: Box<dyn ProgressSink>) -> Self {
        Self {
            progress_sink: Some(sink),
            ..self
        }
    }

    /// A clonable handle observed by transition tasks; see [`CancelHandle`].
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    /// Runs the simulation in the calling thread, invokes the result sink
    /// when one is registered and returns the packaged result.
    #[tracing::instrument(
        skip(self, shape),
        fields(
            states = self.task.states.len(),
            transitions = self.task.transitions.len(),
            steps = self.task.steps_count,
            parallel = self.task.parallel,
            higher_accuracy = self.task.higher_accuracy,
        )
    )]
    pub fn run_sync(mut self, shape: ResultShape) -> PopdynResult<SimulationResult> {
        let result = self.execute(shape)?;
        if let Some(sink) = self.result_sink.as_mut() {
            sink.on_result(&result)
                .map_err(|err| WorkerError::ResultSink(err.to_string()))?;
        }
        tracing::debug!("run complete");
        Ok(result)
    }

    /// Spawns one named worker that performs the same sequence as
    /// [`run_sync`](Self::run_sync). A failed run terminates the worker
    /// without invoking the result sink.
    pub fn run_async(
        self,
        shape: ResultShape,
    ) -> PopdynResult<JoinHandle<PopdynResult<SimulationResult>>> {
        std::thread::Builder::new()
            .name("popdyn-engine".into())
            .spawn(move || self.run_sync(shape))
            .map_err(|err| WorkerError::Spawn(err.to_string()).into())
    }

    fn execute(&mut self, shape: ResultShape) -> PopdynResult<SimulationResult> {
        let initial: Vec<f64> = self.task.states.iter().map(|s| s.count).collect();
        let steps = (self.task.steps_count as usize).max(1);

        let mut grid = StateGrid::new(&initial, steps);
        if self.task.higher_accuracy {
            grid = grid.with_window(self.task.max_delay() as usize, self.scale);
        }

        let progress_sink_ref: Option<&mut dyn ProgressSink> = match &mut self.progress_sink {
            Some(sink) => Some(&mut **sink),
            None => None,
        };
        let mut progress = ProgressReporter::new(progress_sink_ref, steps);
        let driver = StepDriver {
            grid: &grid,
            transitions: &self.transitions,
            higher_accuracy: self.task.higher_accuracy,
            scale: self.scale,
            pool: self.pool.as_ref(),
            cancel: &self.cancel,
        };
        driver.run(&mut progress)?;

        // The high-accuracy buffer and the pool are torn down before the
        // run hands anything back.
        if self.task.higher_accuracy {
            grid.release_window();
        }
        self.pool = None;

        Ok(SimulationResult::package(grid.into_rows(), &self.task, shape))
    }
}

fn build_pool(threads: Option<usize>) -> PopdynResult<ThreadPool> {
    let mut builder =
        ThreadPoolBuilder::new().thread_name(|index| format!("popdyn-worker-{index}"));
    if let Some(threads) = threads {
        builder = builder.num_threads(threads);
    }
    builder
        .build()
        .map_err(|err| WorkerError::Pool(err.to_string()).into())
}
