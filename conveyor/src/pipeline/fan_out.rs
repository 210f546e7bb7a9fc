//! Fan-out: distribute one upstream stream across a stage's worker lanes.

use super::cancel::CancelSignal;
use super::lane::{LaneReceiver, LaneSender};
use super::metrics::StageRecorder;
use super::stage::TaskExit;
use futures::future::select_all;
use std::sync::Arc;

enum Delivery {
    Sent,
    NoLanes,
    Cancelled,
}

/// Deliver every upstream item to exactly one worker lane.
///
/// When upstream closes, the lanes are dropped, which closes them and lets
/// the workers drain and return. On cancellation the task returns at once;
/// the lanes still close because they are owned here.
pub(crate) async fn fan_out<T: Send + 'static>(
    mut upstream: LaneReceiver<T>,
    mut lanes: Vec<LaneSender<T>>,
    cancel: CancelSignal,
    recorder: Arc<StageRecorder>,
) -> TaskExit {
    let mut rotation = 0usize;
    let mut discarded = 0u64;

    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => return cancelled(&recorder),
            item = upstream.recv() => item,
        };
        let Some(item) = item else { break };

        match deliver(&mut lanes, rotation, item, &cancel).await {
            Delivery::Sent => {
                recorder.add_distributed();
                rotation = rotation.wrapping_add(1);
            }
            Delivery::NoLanes => {
                if discarded == 0 {
                    tracing::warn!(
                        stage = %recorder.name(),
                        "All worker lanes closed, discarding remaining input"
                    );
                }
                discarded += 1;
                recorder.add_discarded();
            }
            Delivery::Cancelled => return cancelled(&recorder),
        }
    }

    tracing::debug!(
        stage = %recorder.name(),
        open_lanes = lanes.len(),
        discarded,
        "Upstream exhausted, closing worker lanes"
    );
    TaskExit::Completed
}

/// Wait on every open lane at once and hand `item` to the first worker
/// asking for one.
///
/// Lanes are polled starting at `rotation % len` so ties do not always go to
/// the same worker. Lanes whose worker is gone are removed.
async fn deliver<T>(
    lanes: &mut Vec<LaneSender<T>>,
    rotation: usize,
    item: T,
    cancel: &CancelSignal,
) -> Delivery {
    loop {
        if lanes.is_empty() {
            return Delivery::NoLanes;
        }

        let len = lanes.len();
        let order: Vec<usize> = (0..len).map(|k| (rotation + k) % len).collect();

        let closed = {
            let reservations =
                select_all(order.iter().map(|&lane| Box::pin(lanes[lane].reserve())));

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Delivery::Cancelled,
                (reserved, position, _) = reservations => match reserved {
                    Ok(permit) => {
                        permit.send(item);
                        return Delivery::Sent;
                    }
                    Err(_) => order[position],
                },
            }
        };

        tracing::debug!(lane = closed, "Worker lane closed early");
        lanes.remove(closed);
    }
}

fn cancelled(recorder: &StageRecorder) -> TaskExit {
    tracing::debug!(stage = %recorder.name(), "Fan-out cancelled");
    TaskExit::Cancelled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::lane;
    use std::time::Duration;

    fn lanes(n: usize) -> (Vec<LaneSender<u32>>, Vec<LaneReceiver<u32>>) {
        (0..n).map(|_| lane::channel(0)).unzip()
    }

    async fn drain(rx: &mut LaneReceiver<u32>) -> Vec<u32> {
        let mut items = Vec::new();
        while let Some(item) = rx.recv().await {
            items.push(item);
        }
        items
    }

    #[tokio::test]
    async fn test_every_item_reaches_exactly_one_lane() {
        let (up_tx, up_rx) = lane::channel(0);
        let (senders, receivers) = lanes(3);
        let recorder = Arc::new(StageRecorder::new(0, "split", 3));
        let task = tokio::spawn(fan_out(up_rx, senders, CancelSignal::new(), recorder.clone()));

        let collectors: Vec<_> = receivers
            .into_iter()
            .map(|mut rx| tokio::spawn(async move { drain(&mut rx).await }))
            .collect();

        for n in 0..30 {
            up_tx.send(n).await.unwrap();
        }
        drop(up_tx);

        assert_eq!(task.await.unwrap(), TaskExit::Completed);

        let mut seen = Vec::new();
        for collector in collectors {
            seen.extend(collector.await.unwrap());
        }
        seen.sort();
        assert_eq!(seen, (0..30).collect::<Vec<_>>());
        assert_eq!(recorder.snapshot().items_distributed, 30);
    }

    #[tokio::test]
    async fn test_lane_not_asking_gets_nothing() {
        let (up_tx, up_rx) = lane::channel(0);
        let (senders, mut receivers) = lanes(2);
        let recorder = Arc::new(StageRecorder::new(0, "s", 2));
        let task = tokio::spawn(fan_out(up_rx, senders, CancelSignal::new(), recorder));

        // Lane 0 is held open but never read.
        let mut lane1 = receivers.pop().unwrap();
        let mut lane0 = receivers.pop().unwrap();
        let collector = tokio::spawn(async move { drain(&mut lane1).await });

        for n in 0..5 {
            up_tx.send(n).await.unwrap();
        }
        drop(up_tx);

        assert_eq!(task.await.unwrap(), TaskExit::Completed);
        assert_eq!(collector.await.unwrap(), vec![0, 1, 2, 3, 4]);
        assert!(drain(&mut lane0).await.is_empty());
    }

    #[tokio::test]
    async fn test_closed_lanes_discard_instead_of_blocking() {
        let (up_tx, up_rx) = lane::channel(0);
        let (senders, receivers) = lanes(2);
        drop(receivers);
        let recorder = Arc::new(StageRecorder::new(0, "s", 2));
        let task = tokio::spawn(fan_out(up_rx, senders, CancelSignal::new(), recorder.clone()));

        for n in 0..4 {
            up_tx.send(n).await.unwrap();
        }
        drop(up_tx);

        assert_eq!(task.await.unwrap(), TaskExit::Completed);
        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.items_discarded, 4);
        assert_eq!(snapshot.items_distributed, 0);
    }

    #[tokio::test]
    async fn test_cancel_unblocks_and_closes_lanes() {
        let (up_tx, up_rx) = lane::channel(0);
        let (senders, mut receivers) = lanes(1);
        let cancel = CancelSignal::new();
        let recorder = Arc::new(StageRecorder::new(0, "s", 1));
        let task = tokio::spawn(fan_out(up_rx, senders, cancel.clone(), recorder));

        // Nobody reads the only lane, so the delivery has to wait.
        up_tx.send(1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        cancel.cancel();
        let exit = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("fan-out did not observe cancellation")
            .unwrap();
        assert_eq!(exit, TaskExit::Cancelled);

        let mut lane = receivers.pop().unwrap();
        assert_eq!(lane.recv().await, None);
        assert!(up_tx.send(2).await.is_err());
    }
}
