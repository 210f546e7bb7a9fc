//! Stage function trait for pipeline workers.

use super::cancel::CancelSignal;
use super::lane::{LaneReceiver, LaneSender};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

/// Worker-input lane handed to a stage function.
pub type StageInput<T> = LaneReceiver<T>;

/// Worker-output lane handed to a stage function.
pub type StageOutput<T> = LaneSender<T>;

/// Trait for the user-supplied transformation run by every worker of a stage.
///
/// The function owns both lanes for the duration of the call. It should
/// drain `input` until it returns `None`, and it should race its own
/// blocking sends against `cancel` (see [`send_unless_cancelled`]); the
/// engine never force-terminates a function that ignores cancellation.
/// The output lane is closed when the function returns.
#[async_trait]
pub trait StageFn<T>: Send + Sync {
    async fn run(&self, input: StageInput<T>, output: StageOutput<T>, cancel: CancelSignal);
}

pub type SharedStageFn<T> = Arc<dyn StageFn<T>>;

#[async_trait]
impl<T, F, Fut> StageFn<T> for F
where
    T: Send + 'static,
    F: Fn(StageInput<T>, StageOutput<T>, CancelSignal) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn run(&self, input: StageInput<T>, output: StageOutput<T>, cancel: CancelSignal) {
        (self)(input, output, cancel).await
    }
}

/// Send `item` on `output` unless cancellation fires first.
///
/// Returns `false` when the item was not delivered, either because the
/// pipeline was cancelled or because the downstream lane is gone.
pub async fn send_unless_cancelled<T>(
    output: &StageOutput<T>,
    item: T,
    cancel: &CancelSignal,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = output.send(item) => sent.is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::lane;

    struct Doubler;

    #[async_trait]
    impl StageFn<u32> for Doubler {
        async fn run(&self, mut input: StageInput<u32>, output: StageOutput<u32>, cancel: CancelSignal) {
            while let Some(n) = input.recv().await {
                if !send_unless_cancelled(&output, n * 2, &cancel).await {
                    return;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_trait_impl_runs() {
        let (in_tx, in_rx) = lane::channel(4);
        let (out_tx, mut out_rx) = lane::channel(4);
        in_tx.send(3).await.unwrap();
        drop(in_tx);

        let stage: SharedStageFn<u32> = Arc::new(Doubler);
        stage.run(in_rx, out_tx, CancelSignal::new()).await;

        assert_eq!(out_rx.recv().await, Some(6));
        assert_eq!(out_rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_closure_is_a_stage_fn() {
        let stage: SharedStageFn<u32> = Arc::new(
            |mut input: StageInput<u32>, output: StageOutput<u32>, _cancel: CancelSignal| async move {
                while let Some(n) = input.recv().await {
                    let _ = output.send(n + 1).await;
                }
            },
        );

        let (in_tx, in_rx) = lane::channel(0);
        let (out_tx, mut out_rx) = lane::channel(0);
        let run = tokio::spawn(async move { stage.run(in_rx, out_tx, CancelSignal::new()).await });
        in_tx.send(41).await.unwrap();
        assert_eq!(out_rx.recv().await, Some(42));
        drop(in_tx);
        run.await.unwrap();
        assert_eq!(out_rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_send_unless_cancelled() {
        let (tx, mut rx) = lane::channel(1);
        let cancel = CancelSignal::new();

        assert!(send_unless_cancelled(&tx, 1, &cancel).await);
        assert_eq!(rx.recv().await, Some(1));

        cancel.cancel();
        assert!(!send_unless_cancelled(&tx, 2, &cancel).await);

        let (closed_tx, closed_rx) = lane::channel::<u32>(1);
        drop(closed_rx);
        assert!(!send_unless_cancelled(&closed_tx, 3, &CancelSignal::new()).await);
    }
}
