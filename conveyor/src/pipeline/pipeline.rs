//! Pipeline orchestration.
//!
//! Owns stage registration and, per `execute` call, builds the channel graph,
//! launches every fan-out, worker and fan-in task, and feeds the input.

use super::cancel::CancelSignal;
use super::fan_in::fan_in;
use super::fan_out::fan_out;
use super::graph::{ChannelGraph, StageLayout, StageWiring};
use super::lane::{LaneReceiver, LaneSender};
use super::metrics::{PipelineMetrics, StageRecorder};
use super::stage::{Stage, TaskExit};
use super::task::{SharedStageFn, StageInput, StageOutput};
use super::worker::Worker;
use crate::error::{PipelineError, PipelineResult, StageFailure};
use crate::options::PipelineOptions;
use futures::Stream;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::Instrument;
use ulid::Ulid;

/// A fixed-length chain of stages.
pub struct Pipeline<T> {
    stage_count: usize,
    stages: Vec<Stage<T>>,
    /// Total channel-graph slots; slot 0 is the external input.
    num_channels: usize,
    cancel: CancelSignal,
    options: PipelineOptions,
}

impl<T: Send + 'static> Pipeline<T> {
    /// Create a pipeline with `stage_count` stage slots.
    ///
    /// Returns `None` when `stage_count` is zero.
    pub fn new(stage_count: usize) -> Option<Self> {
        Self::with_options(stage_count, PipelineOptions::default()).ok()
    }

    pub fn with_options(stage_count: usize, options: PipelineOptions) -> PipelineResult<Self> {
        if stage_count < 1 {
            return Err(PipelineError::InvalidStageCount(stage_count));
        }
        options.sanitize()?;

        Ok(Self {
            stage_count,
            stages: Vec::with_capacity(stage_count),
            num_channels: 1,
            cancel: CancelSignal::new(),
            options,
        })
    }

    /// Register the next stage, run by `parallelism` copies of `func`.
    ///
    /// `func` receives the worker's input lane, its output lane and the
    /// pipeline's cancel signal. `name` is only used for logs and metrics.
    pub fn add_stage<F, Fut>(
        &mut self,
        name: impl Into<String>,
        parallelism: usize,
        func: F,
    ) -> PipelineResult<()>
    where
        F: Fn(StageInput<T>, StageOutput<T>, CancelSignal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let func: SharedStageFn<T> = Arc::new(func);
        self.add_shared_stage(name, parallelism, Some(func))
    }

    /// Register the next stage from a shared [`StageFn`](super::StageFn).
    ///
    /// Checks, in order: a free slot remains, `func` is present, and
    /// `parallelism` is at least 1.
    pub fn add_shared_stage(
        &mut self,
        name: impl Into<String>,
        parallelism: usize,
        func: Option<SharedStageFn<T>>,
    ) -> PipelineResult<()> {
        let name = name.into();

        if self.stages.len() >= self.stage_count {
            return Err(PipelineError::NoSlotsLeft {
                declared: self.stage_count,
            });
        }
        let Some(func) = func else {
            return Err(PipelineError::MissingFunction { stage: name });
        };
        if parallelism < 1 {
            return Err(PipelineError::InvalidParallelism {
                stage: name,
                parallelism,
            });
        }

        let layout = StageLayout::new(self.num_channels, parallelism);
        self.num_channels += layout.slots();

        tracing::debug!(
            stage = %name,
            index = self.stages.len(),
            parallelism,
            begin = layout.begin(),
            "Registered stage"
        );
        self.stages.push(Stage::new(name, func, layout));
        Ok(())
    }

    pub fn stage_count(&self) -> usize {
        self.stage_count
    }

    pub fn free_slots(&self) -> usize {
        self.stage_count - self.stages.len()
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    pub fn stages(&self) -> &[Stage<T>] {
        &self.stages
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// The signal handed to every stage function.
    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    /// Request cancellation of every run of this pipeline. Idempotent.
    pub fn cleanup(&self) {
        if self.cancel.cancel() {
            tracing::info!(pipeline = %self.options.name, "Pipeline cancellation requested");
        }
    }

    /// Feed `items` through every stage and return the final output stream.
    ///
    /// Returns once all items are delivered to the first stage. If the cancel
    /// signal fires first, no output is returned: the error is
    /// [`PipelineError::StageFailed`] when a stage function panicked, and
    /// [`PipelineError::Cancelled`] otherwise.
    ///
    /// Nothing reads the output before this returns, so the whole batch has
    /// to fit into the graph. Each fan-out task, worker and fan-in relay
    /// holds one item, and each lane holds up to
    /// [`channel_buffer`](PipelineOptions::channel_buffer) more. For stages
    /// that forward every item as they receive it that is
    /// `num_channels() - 1` items with the default buffer. A larger batch
    /// waits for a stage to absorb items, or for [`cleanup`](Self::cleanup),
    /// which makes it fail with `Cancelled`.
    pub async fn execute<I>(&self, items: I) -> PipelineResult<PipelineOutput<T>>
    where
        I: IntoIterator<Item = T>,
    {
        if self.stages.len() < self.stage_count {
            return Err(PipelineError::IncompleteStages {
                registered: self.stages.len(),
                declared: self.stage_count,
            });
        }
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let run_id = Ulid::new().to_string();
        let span = tracing::info_span!(
            "pipeline_run",
            run_id = %run_id,
            pipeline = %self.options.name
        );
        self.run(run_id, items).instrument(span).await
    }

    async fn run<I>(&self, run_id: String, items: I) -> PipelineResult<PipelineOutput<T>>
    where
        I: IntoIterator<Item = T>,
    {
        let started = Instant::now();
        let mut graph = ChannelGraph::new(self.num_channels, self.options.channel_buffer);
        let input = graph.take_input()?;
        let output = graph.take_output()?;
        let wirings = self
            .stages
            .iter()
            .map(|stage| graph.wire(stage.layout()))
            .collect::<PipelineResult<Vec<_>>>()?;

        let (failures, mut failure_rx) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();
        let mut recorders = Vec::with_capacity(self.stages.len());

        for (index, (stage, wiring)) in self.stages.iter().zip(wirings).enumerate() {
            let recorder = Arc::new(StageRecorder::new(index, stage.name(), stage.parallelism()));
            self.launch_stage(stage, wiring, &recorder, &failures, &mut tasks);
            recorders.push(recorder);
        }
        drop(failures);

        tracing::info!(
            stages = self.stages.len(),
            channels = self.num_channels,
            tasks = tasks.len(),
            "Pipeline launched"
        );

        let Some(items_fed) = feed(input, items, &self.cancel).await else {
            tasks.abort_all();
            return Err(match failure_rx.try_recv() {
                Ok(failure) => {
                    tracing::warn!(%failure, "Input feed aborted by stage failure");
                    PipelineError::StageFailed(failure)
                }
                Err(_) => {
                    tracing::warn!("Input feed aborted by cancellation");
                    PipelineError::Cancelled
                }
            });
        };

        tracing::debug!(items_fed, "Input delivered, closing input boundary");

        Ok(PipelineOutput {
            run_id,
            output,
            closed: None,
            failures: failure_rx,
            tasks,
            recorders,
            cancel: self.cancel.clone(),
            started,
            items_fed,
        })
    }

    fn launch_stage(
        &self,
        stage: &Stage<T>,
        wiring: StageWiring<T>,
        recorder: &Arc<StageRecorder>,
        failures: &mpsc::UnboundedSender<StageFailure>,
        tasks: &mut JoinSet<TaskExit>,
    ) {
        let StageWiring {
            input,
            worker_inputs,
            workers,
            worker_outputs,
            output,
        } = wiring;

        tasks.spawn(
            fan_out(input, worker_inputs, self.cancel.clone(), Arc::clone(recorder))
                .in_current_span(),
        );

        for (index, lanes) in workers.into_iter().enumerate() {
            let worker = Worker {
                index,
                func: Arc::clone(stage.func()),
                cancel: self.cancel.clone(),
                failures: failures.clone(),
                recorder: Arc::clone(recorder),
            };
            tasks.spawn(worker.run(lanes).in_current_span());
        }

        tasks.spawn(
            fan_in(worker_outputs, output, self.cancel.clone(), Arc::clone(recorder))
                .in_current_span(),
        );
    }
}

/// Send every item into the input boundary; `None` if cancelled first.
///
/// Dropping `input` on return closes the boundary.
async fn feed<T, I>(input: LaneSender<T>, items: I, cancel: &CancelSignal) -> Option<u64>
where
    I: IntoIterator<Item = T>,
{
    let mut fed = 0u64;
    for item in items {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            sent = input.send(item) => {
                if sent.is_err() {
                    // First stage's fan-out is gone, which only happens on cancellation.
                    return None;
                }
            }
        }
        fed += 1;
    }
    Some(fed)
}

/// Lazily drained output of one `execute` call.
///
/// Dropping it aborts the run's engine tasks.
pub struct PipelineOutput<T> {
    run_id: String,
    output: LaneReceiver<T>,
    /// Set when the stream closed: whether cancellation had fired by then.
    closed: Option<bool>,
    failures: mpsc::UnboundedReceiver<StageFailure>,
    tasks: JoinSet<TaskExit>,
    recorders: Vec<Arc<StageRecorder>>,
    cancel: CancelSignal,
    started: Instant,
    items_fed: u64,
}

impl<T: Send + 'static> PipelineOutput<T> {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn items_fed(&self) -> u64 {
        self.items_fed
    }

    /// Next merged item, or `None` once the final stage has completed.
    pub async fn recv(&mut self) -> Option<T> {
        let item = self.output.recv().await;
        if item.is_none() && self.closed.is_none() {
            self.closed = Some(self.cancel.is_cancelled());
        }
        item
    }

    /// Fire the pipeline's cancel signal.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Drain every remaining item, then [`finish`](Self::finish).
    pub async fn collect(mut self) -> PipelineResult<Vec<T>> {
        let mut items = Vec::new();
        while let Some(item) = self.recv().await {
            items.push(item);
        }
        self.finish().await?;
        Ok(items)
    }

    /// Discard remaining output, wait for every engine task and report.
    ///
    /// Fails with the first contained stage panic, or with `Cancelled` if
    /// the run was cut short by the cancel signal.
    pub async fn finish(mut self) -> PipelineResult<PipelineMetrics> {
        let mut discarded = 0u64;
        while self.recv().await.is_some() {
            discarded += 1;
        }
        if discarded > 0 {
            tracing::debug!(run_id = %self.run_id, discarded, "Discarded unread output");
        }

        let mut cancelled = self.closed == Some(true);
        let mut internal = None;
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(TaskExit::Cancelled) => cancelled = true,
                Ok(TaskExit::Completed | TaskExit::Panicked) => {}
                Err(e) => internal = Some(e.to_string()),
            }
        }

        if let Ok(failure) = self.failures.try_recv() {
            return Err(PipelineError::StageFailed(failure));
        }
        if let Some(message) = internal {
            return Err(PipelineError::Internal(format!("pipeline task failed: {}", message)));
        }
        if cancelled {
            tracing::warn!(run_id = %self.run_id, "Pipeline run cancelled before completion");
            return Err(PipelineError::Cancelled);
        }

        let metrics = PipelineMetrics {
            run_id: self.run_id,
            items_fed: self.items_fed,
            total_duration_ms: self.started.elapsed().as_millis(),
            stages: self.recorders.iter().map(|r| r.snapshot()).collect(),
        };
        tracing::info!(
            run_id = %metrics.run_id,
            items_fed = metrics.items_fed,
            items_emitted = metrics.items_emitted(),
            total_duration_ms = metrics.total_duration_ms as u64,
            "Pipeline run finished"
        );
        Ok(metrics)
    }

    /// Remaining output as a [`Stream`].
    ///
    /// Engine tasks keep running detached; failures are no longer reported.
    pub fn into_stream(self) -> impl Stream<Item = T> + Send {
        let PipelineOutput {
            output, mut tasks, ..
        } = self;
        tasks.detach_all();
        futures::stream::unfold(output, |mut output| async move {
            let item = output.recv().await?;
            Some((item, output))
        })
    }
}
