use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Engines that report progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EngineKind {
    Ridge,
    Gibbs,
}

impl EngineKind {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Ridge => "empirical-Bayes ridge",
            Self::Gibbs => "continuous-shrinkage Gibbs sampler",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// State after one completed outer iteration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IterationReport {
    pub engine: EngineKind,
    pub iteration: usize,
    pub total: usize,
    /// Ridge only: `Σ|beta - beta_old|`.
    pub delta: Option<f64>,
    pub h2: Option<f64>,
    /// Gibbs only: current residual variance draw.
    pub sigma: Option<f64>,
    pub score: Option<f64>,
}

/// Observer for reporting progress while a fit runs. Cancellation is polled once before
/// every outer iteration.
pub trait FitObserver {
    fn on_start(&mut self, engine: EngineKind, total_iterations: usize, regions: usize) {
        let _ = (engine, total_iterations, regions);
    }
    fn on_iteration(&mut self, report: &IterationReport) {
        let _ = report;
    }
    fn on_finish(&mut self, engine: EngineKind, iterations: usize) {
        let _ = (engine, iterations);
    }
    fn should_cancel(&self) -> bool {
        false
    }
}

#[derive(Default)]
pub struct NoopObserver;

impl FitObserver for NoopObserver {}

/// Shared flag that cancels a running fit from another thread.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

impl FitObserver for CancelFlag {
    fn should_cancel(&self) -> bool {
        self.is_cancelled()
    }
}
