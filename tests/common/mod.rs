use std::sync::Once;

use popdyn::model::Task;
use popdyn::{Engine, ResultShape};
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Installs a test subscriber once; `RUST_LOG` filters as usual.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
            .with_test_writer()
            .try_init();
    });
}

/// Runs a task to completion and returns the raw per-step rows.
pub fn run(task: Task) -> Vec<Vec<f64>> {
    init_tracing();
    Engine::new(task)
        .expect("valid task")
        .run_sync(ResultShape::none())
        .expect("successful run")
        .rows()
        .to_vec()
}
