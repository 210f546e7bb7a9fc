//! Worker wrapper: one stage-function instance between two lanes.

use super::cancel::CancelSignal;
use super::graph::WorkerLanes;
use super::metrics::StageRecorder;
use super::stage::TaskExit;
use super::task::SharedStageFn;
use crate::error::StageFailure;
use std::any::Any;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::Instrument;

pub(crate) struct Worker<T> {
    pub index: usize,
    pub func: SharedStageFn<T>,
    pub cancel: CancelSignal,
    pub failures: mpsc::UnboundedSender<StageFailure>,
    pub recorder: Arc<StageRecorder>,
}

impl<T: Send + 'static> Worker<T> {
    /// Run the stage function once.
    ///
    /// The function runs in its own task and owns both lanes, so the output
    /// lane is closed when it returns or unwinds. A panic is reported on the
    /// failure channel and cancels the whole pipeline.
    pub async fn run(self, lanes: WorkerLanes<T>) -> TaskExit {
        let Worker {
            index,
            func,
            cancel,
            failures,
            recorder,
        } = self;
        let started = Instant::now();
        let WorkerLanes { input, output } = lanes;

        let stage_cancel = cancel.clone();
        let joined = tokio::spawn(
            async move { func.run(input, output, stage_cancel).await }.in_current_span(),
        )
        .await;

        let panicked = matches!(&joined, Err(e) if e.is_panic());
        if let Some(worker) = recorder.worker(index) {
            worker.finish(started, panicked);
        }

        match joined {
            Ok(()) => {
                tracing::debug!(
                    stage = %recorder.name(),
                    worker = index,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Worker finished"
                );
                TaskExit::Completed
            }
            Err(e) if e.is_panic() => {
                let failure = StageFailure {
                    stage: recorder.name().to_string(),
                    stage_index: recorder.index(),
                    worker: index,
                    message: panic_message(e.into_panic()),
                };
                tracing::warn!(
                    stage = %failure.stage,
                    worker = index,
                    message = %failure.message,
                    "Stage function panicked, cancelling pipeline"
                );
                // Report before cancelling so whoever observes the signal finds the cause.
                let _ = failures.send(failure);
                cancel.cancel();
                TaskExit::Panicked
            }
            Err(e) => {
                tracing::warn!(stage = %recorder.name(), worker = index, error = %e, "Worker task aborted");
                TaskExit::Cancelled
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::lane;
    use crate::pipeline::task::{StageInput, StageOutput};

    fn worker(func: SharedStageFn<u32>) -> (Worker<u32>, mpsc::UnboundedReceiver<StageFailure>) {
        let (failures, failure_rx) = mpsc::unbounded_channel();
        let worker = Worker {
            index: 0,
            func,
            cancel: CancelSignal::new(),
            failures,
            recorder: Arc::new(StageRecorder::new(1, "parse", 1)),
        };
        (worker, failure_rx)
    }

    #[tokio::test]
    async fn test_output_closed_even_if_function_never_drains() {
        let func: SharedStageFn<u32> = Arc::new(
            |_input: StageInput<u32>, output: StageOutput<u32>, _cancel: CancelSignal| async move {
                let _ = output.send(5).await;
            },
        );
        let (worker, _failures) = worker(func);
        let (in_tx, in_rx) = lane::channel(0);
        // Room for the one item, since nothing reads until the worker is done.
        let (out_tx, mut out_rx) = lane::channel(1);

        let exit = worker
            .run(WorkerLanes {
                input: in_rx,
                output: out_tx,
            })
            .await;

        assert_eq!(exit, TaskExit::Completed);
        assert_eq!(out_rx.recv().await, Some(5));
        assert_eq!(out_rx.recv().await, None);
        assert!(in_tx.send(1).await.is_err());
    }

    #[tokio::test]
    async fn test_panic_is_reported_and_cancels() {
        let func: SharedStageFn<u32> = Arc::new(
            |mut input: StageInput<u32>, _output: StageOutput<u32>, _cancel: CancelSignal| async move {
                if let Some(n) = input.recv().await {
                    panic!("bad item {}", n);
                }
            },
        );
        let (worker, mut failures) = worker(func);
        let cancel = worker.cancel.clone();
        let recorder = worker.recorder.clone();
        let (in_tx, in_rx) = lane::channel(1);
        let (out_tx, mut out_rx) = lane::channel(0);
        in_tx.send(7).await.unwrap();

        let exit = worker
            .run(WorkerLanes {
                input: in_rx,
                output: out_tx,
            })
            .await;

        assert_eq!(exit, TaskExit::Panicked);
        assert!(cancel.is_cancelled());
        assert_eq!(out_rx.recv().await, None);

        let failure = failures.try_recv().unwrap();
        assert_eq!(failure.stage, "parse");
        assert_eq!(failure.stage_index, 1);
        assert_eq!(failure.message, "bad item 7");
        assert!(recorder.snapshot().workers[0].panicked);
    }

    #[test]
    fn test_panic_message_payloads() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(42u8)), "non-string panic payload");
    }
}
