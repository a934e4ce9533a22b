use indicatif::{ProgressBar, ProgressStyle};

use crate::error::{PopdynResult, WorkerError};

/// Per-run observer of engine progress, fed values in `[0, 1]` inline on
/// the driver thread. A failing sink aborts the run.
pub trait ProgressSink: Send {
    fn on_progress(&mut self, progress: f64) -> PopdynResult<()>;
}

/// Adapter turning a closure into a [`ProgressSink`].
pub struct FnProgressSink<F>(pub F);

impl<F> ProgressSink for FnProgressSink<F>
where
    F: FnMut(f64) -> PopdynResult<()> + Send,
{
    fn on_progress(&mut self, progress: f64) -> PopdynResult<()> {
        (self.0)(progress)
    }
}

/// Emission contract: 0 first, 1 last, intermediate `step / (steps - 1)`
/// only when it exceeds the previous emission by more than 0.005.
pub(crate) struct ProgressReporter<'a> {
    sink: Option<&'a mut dyn ProgressSink>,
    steps_count: usize,
    last: Option<f64>,
}

impl<'a> ProgressReporter<'a> {
    pub fn new(sink: Option<&'a mut dyn ProgressSink>, steps_count: usize) -> Self {
        Self {
            sink,
            steps_count,
            last: None,
        }
    }

    pub fn begin(&mut self) -> PopdynResult<()> {
        self.emit(0.0)
    }

    pub fn on_step(&mut self, step: usize) -> PopdynResult<()> {
        let progress = if step == 0 || self.steps_count == 0 {
            0.0
        } else if self.steps_count == 1 || step == self.steps_count - 1 {
            1.0
        } else {
            step as f64 / (self.steps_count - 1) as f64
        };
        if progress >= 1.0 {
            return self.emit(1.0);
        }
        match self.last {
            Some(last) if progress <= last + 0.005 => Ok(()),
            _ => self.emit(progress),
        }
    }

    /// Guarantees the closing 1 for runs that never reach a last step
    /// (`steps_count` of 0 or 1).
    pub fn finish(&mut self) -> PopdynResult<()> {
        if self.last == Some(1.0) {
            return Ok(());
        }
        self.emit(1.0)
    }

    fn emit(&mut self, progress: f64) -> PopdynResult<()> {
        self.last = Some(progress);
        if let Some(sink) = self.sink.as_mut() {
            sink.on_progress(progress)
                .map_err(|err| WorkerError::ProgressSink(err.to_string()))?;
        }
        Ok(())
    }
}

/// Terminal progress bar adapter over [`ProgressSink`].
pub struct ProgressBarSink {
    bar: ProgressBar,
}

impl ProgressBarSink {
    pub fn new() -> PopdynResult<Self> {
        let bar = ProgressBar::new(1000);
        bar.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {percent}% ({eta_precise}) {msg}",
                )
                .map_err(WorkerError::ProgressBar)?
                .progress_chars("#>-"),
        );
        Ok(Self { bar })
    }
}

impl ProgressSink for ProgressBarSink {
    fn on_progress(&mut self, progress: f64) -> PopdynResult<()> {
        self.bar.set_position((progress * 1000.0).round() as u64);
        if progress >= 1.0 {
            self.bar.finish_with_message("Simulation complete.");
        }
        Ok(())
    }
}
