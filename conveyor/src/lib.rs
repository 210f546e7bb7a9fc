//! conveyor: a multi-stage concurrent pipeline engine.
//!
//! Register stages with [`Pipeline::add_stage`], each run by a configurable
//! number of workers, then [`Pipeline::execute`] a batch of items and drain
//! the returned [`PipelineOutput`].

pub mod error;
pub mod options;
pub mod pipeline;

pub use error::{PipelineError, PipelineResult, StageFailure};
pub use options::PipelineOptions;
pub use pipeline::{
    CancelSignal, LaneClosed, LanePermit, LaneReceiver, LaneSender, Pipeline, PipelineMetrics,
    PipelineOutput, SharedStageFn, Stage, StageFn, StageInput, StageLayout, StageMetrics,
    StageOutput, WorkerMetrics, send_unless_cancelled,
};
