//! Fan-in: merge a stage's worker-output lanes onto its output boundary.

use super::cancel::CancelSignal;
use super::lane::{LaneReceiver, LaneSender};
use super::metrics::StageRecorder;
use super::stage::TaskExit;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::Instrument;

/// Relay every worker lane onto `output`.
///
/// One forwarder runs per lane. `output` is dropped only after every
/// forwarder has finished, so the merged stream closes exactly once and
/// never while a worker may still produce.
pub(crate) async fn fan_in<T: Send + 'static>(
    lanes: Vec<LaneReceiver<T>>,
    output: LaneSender<T>,
    cancel: CancelSignal,
    recorder: Arc<StageRecorder>,
) -> TaskExit {
    let mut forwarders = JoinSet::new();
    for (worker, lane) in lanes.into_iter().enumerate() {
        forwarders.spawn(
            forward(
                worker,
                lane,
                output.clone(),
                cancel.clone(),
                Arc::clone(&recorder),
            )
            .in_current_span(),
        );
    }

    let mut exit = TaskExit::Completed;
    while let Some(joined) = forwarders.join_next().await {
        match joined {
            Ok(TaskExit::Completed) => {}
            Ok(other) => exit = other,
            Err(e) => {
                tracing::warn!(stage = %recorder.name(), error = %e, "Fan-in forwarder failed");
                exit = TaskExit::Cancelled;
            }
        }
    }

    recorder.mark_drained();
    drop(output);

    tracing::debug!(
        stage = %recorder.name(),
        index = recorder.index(),
        ?exit,
        "Stage output closed"
    );
    exit
}

async fn forward<T>(
    worker: usize,
    mut lane: LaneReceiver<T>,
    output: LaneSender<T>,
    cancel: CancelSignal,
    recorder: Arc<StageRecorder>,
) -> TaskExit {
    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => return TaskExit::Cancelled,
            item = lane.recv() => item,
        };
        let Some(item) = item else {
            return TaskExit::Completed;
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return TaskExit::Cancelled,
            sent = output.send(item) => {
                if sent.is_err() {
                    tracing::debug!(
                        stage = %recorder.name(),
                        worker,
                        "Downstream dropped, stopping forwarder"
                    );
                    return TaskExit::Completed;
                }
            }
        }
        recorder.add_merged();
    }
}
