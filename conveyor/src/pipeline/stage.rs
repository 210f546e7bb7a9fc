//! Stage definition for pipeline execution.

use super::graph::StageLayout;
use super::task::SharedStageFn;

/// How an engine task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskExit {
    /// Upstream drained and downstream closed normally.
    Completed,
    /// Stopped early because the cancel signal fired.
    Cancelled,
    /// The stage function run by a worker panicked.
    Panicked,
}

/// A registered stage: a named function run by `parallelism` workers.
///
/// Stages are executed in registration order. Everything here is fixed once
/// the stage is registered, including its channel layout.
pub struct Stage<T> {
    name: String,
    func: SharedStageFn<T>,
    layout: StageLayout,
}

impl<T> Stage<T> {
    pub(crate) fn new(name: String, func: SharedStageFn<T>, layout: StageLayout) -> Self {
        Self { name, func, layout }
    }

    /// Human-readable stage name for logging. May be empty.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parallelism(&self) -> usize {
        self.layout.parallelism()
    }

    pub fn layout(&self) -> &StageLayout {
        &self.layout
    }

    pub(crate) fn func(&self) -> &SharedStageFn<T> {
        &self.func
    }
}

impl<T> std::fmt::Debug for Stage<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}
