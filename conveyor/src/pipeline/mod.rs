//! Multi-stage concurrent pipeline engine.
//!
//! This module provides:
//! - Ordered stage registration with per-stage parallelism
//! - Automatic fan-out to worker lanes and fan-in back to one stream
//! - Cooperative, one-shot cancellation reaching every engine task
//! - Rendezvous lanes: an item moves only to a receiver that asks for it
//!
//! ## Architecture
//!
//! ```text
//!                   ┌─ worker ─┐
//! input ─ fan-out ──┼─ worker ─┼── fan-in ─ ... next stage ... ─ output
//!                   └─ worker ─┘
//!
//! - Pipeline: registers stages and launches one run per `execute`
//! - Stage: a function run by `parallelism` workers
//! - Channel graph: flat indexed lanes, one layout record per stage
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use conveyor::Pipeline;
//!
//! let mut pipeline = Pipeline::<u64>::new(2).unwrap();
//! pipeline.add_stage("square", 4, |mut input, output, _cancel| async move {
//!     while let Some(n) = input.recv().await {
//!         let _ = output.send(n * n).await;
//!     }
//! })?;
//! pipeline.add_stage("sum", 1, |mut input, output, _cancel| async move {
//!     let mut total = 0;
//!     while let Some(n) = input.recv().await {
//!         total += n;
//!     }
//!     let _ = output.send(total).await;
//! })?;
//!
//! let output = pipeline.execute(1..=10).await?;
//! assert_eq!(output.collect().await?, vec![385]);
//! ```

mod cancel;
mod fan_in;
mod fan_out;
mod graph;
pub mod lane;
mod metrics;
#[allow(clippy::module_inception)]
mod pipeline;
mod stage;
mod task;
mod worker;

pub use cancel::CancelSignal;
pub use graph::StageLayout;
pub use lane::{LaneClosed, LanePermit, LaneReceiver, LaneSender};
pub use metrics::{PipelineMetrics, StageMetrics, WorkerMetrics};
pub use pipeline::{Pipeline, PipelineOutput};
pub use stage::Stage;
pub use task::{SharedStageFn, StageFn, StageInput, StageOutput, send_unless_cancelled};
